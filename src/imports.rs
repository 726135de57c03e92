//! The Host Import Surface (spec section 4.D): the three functions the
//! guest may call into the host, registered into the `env` namespace via
//! `linker.func_new(NAMESPACE, NAME, FuncType::new(linker.engine(), ...),
//! move |caller, params, results| ...)`, reading the guest's `(net_iov,
//! addr_iov)` dial arguments back out of linear memory.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use wasmtime::{Caller, FuncType, Linker, Val, ValType};

use crate::config::DialerFn;
use crate::connection::{shared, AnyConnection, NativeStream, SharedConn};
use crate::error::{water_error_code, Error};
use crate::registry::FdRegistry;
use crate::runtime::{block_on, GuestRuntime, StoreData};
use crate::validator::AddressValidator;

/// What `water_accept` draws its next connection from. A Listener TM has a
/// live [`TcpListener`] it accepts new peers from on every call; a Relay
/// or a per-connection Dialer/Listener-accepted TM instead has exactly one
/// socket the host already accepted before Linking the module, which
/// `water_accept` hands back once and then exhausts (spec section 4.E/4.G:
/// "accept returns the single pre-accepted peer connection for this TM
/// instance, `NoSuchDevice` thereafter").
pub enum Acceptor {
    Listener(TcpListener),
    PreAccepted(AsyncMutex<Option<TcpStream>>),
}

impl Acceptor {
    pub fn pre_accepted(stream: TcpStream) -> Self {
        Acceptor::PreAccepted(AsyncMutex::new(Some(stream)))
    }

    async fn accept(&self) -> std::io::Result<TcpStream> {
        match self {
            Acceptor::Listener(l) => l.accept().await.map(|(s, _)| s),
            Acceptor::PreAccepted(slot) => {
                let mut slot = slot.lock().await;
                slot.take().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotConnected, "connection already accepted")
                })
            }
        }
    }
}

pub const ENV_NAMESPACE: &str = "env";
pub const WATER_DIAL: &str = "water_dial";
pub const WATER_DIAL_FIXED: &str = "water_dial_fixed";
pub const WATER_ACCEPT: &str = "water_accept";

/// Bound longer than any plausible guest `(network, address)` string.
/// Inputs past this are rejected with `InvalidArgument` before the
/// validator or dialer ever see them (spec section 4.D).
const MAX_IOVEC_LEN: i32 = 256;

/// What a `TransportModule`'s Link step wires up per connection (spec
/// section 4.E, step 1): a dialer policy, a listener, or neither.
#[derive(Clone)]
pub struct DialerPolicy {
    pub dial_fn: Arc<DialerFn>,
    pub validator: AddressValidator,
    pub pinned_target: Option<(String, String)>,
}

/// Everything the three `water_*` import closures need, captured directly
/// by each closure rather than threaded through `Store` data — the
/// closures own an `Arc` clone each, so no interior access to the guest's
/// `StoreData` is required beyond the guest memory export itself.
pub struct NetworkInterface {
    pub dialer: Option<DialerPolicy>,
    pub listener: Option<Acceptor>,
    pub registry: Arc<FdRegistry>,
    pub handle: Handle,
    /// The most recent connection `water_dial`/`water_dial_fixed` handed
    /// back to the guest on this interface. Read by
    /// [`crate::tm::TransportModule::associate`] after `watm_associate_v1`
    /// returns, since Associate has no caller-supplied FD for the host to
    /// key a lookup on — the guest obtains both of its network FDs
    /// entirely through these three imports during that single call.
    pub last_dialed: AsyncMutex<Option<SharedConn>>,
    /// Same role as `last_dialed`, populated by `water_accept`.
    pub last_accepted: AsyncMutex<Option<SharedConn>>,
}

impl NetworkInterface {
    pub fn new(
        dialer: Option<DialerPolicy>,
        listener: Option<Acceptor>,
        registry: Arc<FdRegistry>,
        handle: Handle,
    ) -> Self {
        NetworkInterface {
            dialer,
            listener,
            registry,
            handle,
            last_dialed: AsyncMutex::new(None),
            last_accepted: AsyncMutex::new(None),
        }
    }
}

/// Installs `water_dial`, `water_dial_fixed`, `water_accept` into `env`,
/// stubbing whichever capability `iface` doesn't provide to return
/// `NoSuchDevice` (spec section 4.E, step 1: "stubbing the unavailable
/// ones to return ENODEV").
pub fn link_network_interface(linker: &mut Linker<StoreData>, iface: Arc<NetworkInterface>) -> crate::error::Result<()> {
    install_water_dial(linker, iface.clone())?;
    install_water_dial_fixed(linker, iface.clone())?;
    install_water_accept(linker, iface)?;
    Ok(())
}

fn install_water_dial(linker: &mut Linker<StoreData>, iface: Arc<NetworkInterface>) -> crate::error::Result<()> {
    let ty = FuncType::new(
        linker.engine(),
        [ValType::I32, ValType::I32, ValType::I32, ValType::I32],
        [ValType::I32],
    );
    GuestRuntime::register_host_func(linker, ENV_NAMESPACE, WATER_DIAL, ty, move |mut caller, params, results| {
        let net_ptr = params[0].unwrap_i32();
        let net_len = params[1].unwrap_i32();
        let addr_ptr = params[2].unwrap_i32();
        let addr_len = params[3].unwrap_i32();

        let code = (|| -> i32 {
            let Some(policy) = iface.dialer.as_ref() else {
                return water_error_code(&Error::NoSuchDevice("no dialer linked for this module"));
            };
            if net_len > MAX_IOVEC_LEN || addr_len > MAX_IOVEC_LEN {
                return water_error_code(&Error::InvalidArgument("network/address string too long".into()));
            }
            let network = match GuestRuntime::read_iovec(&mut caller, net_ptr, net_len)
                .and_then(|b| String::from_utf8(b).map_err(|e| Error::InvalidArgument(e.to_string())))
            {
                Ok(s) => s,
                Err(e) => return water_error_code(&e),
            };
            let address = match GuestRuntime::read_iovec(&mut caller, addr_ptr, addr_len)
                .and_then(|b| String::from_utf8(b).map_err(|e| Error::InvalidArgument(e.to_string())))
            {
                Ok(s) => s,
                Err(e) => return water_error_code(&e),
            };
            if !policy.validator.check(&network, &address) {
                return water_error_code(&Error::AddressDenied(format!("{network}:{address}")));
            }
            dial_and_register(&mut caller, &iface, &policy.dial_fn, &network, &address)
        })();
        results[0] = Val::I32(code);
        Ok(())
    })
}

fn install_water_dial_fixed(linker: &mut Linker<StoreData>, iface: Arc<NetworkInterface>) -> crate::error::Result<()> {
    let ty = FuncType::new(linker.engine(), [], [ValType::I32]);
    GuestRuntime::register_host_func(linker, ENV_NAMESPACE, WATER_DIAL_FIXED, ty, move |mut caller, _params, results| {
        let code = (|| -> i32 {
            let Some(policy) = iface.dialer.as_ref() else {
                return water_error_code(&Error::NoSuchDevice("no dialer linked for this module"));
            };
            let Some((network, address)) = policy.pinned_target.clone() else {
                return water_error_code(&Error::NoSuchDevice("no pinned target configured"));
            };
            // Bypasses the validator: the host already chose the
            // destination at configuration time (spec section 4.D).
            dial_and_register(&mut caller, &iface, &policy.dial_fn, &network, &address)
        })();
        results[0] = Val::I32(code);
        Ok(())
    })
}

fn install_water_accept(linker: &mut Linker<StoreData>, iface: Arc<NetworkInterface>) -> crate::error::Result<()> {
    let ty = FuncType::new(linker.engine(), [], [ValType::I32]);
    GuestRuntime::register_host_func(linker, ENV_NAMESPACE, WATER_ACCEPT, ty, move |mut caller, _params, results| {
        let code = (|| -> i32 {
            let Some(acceptor) = iface.listener.as_ref() else {
                return water_error_code(&Error::NoSuchDevice("no listener linked for this module"));
            };
            match block_on(&iface.handle, acceptor.accept()) {
                Ok(stream) => {
                    let conn = shared(AnyConnection::Native(NativeStream::new(stream)));
                    let fd = insert_and_record(&mut caller, &iface, conn.clone());
                    if fd > 0 {
                        block_on(&iface.handle, async { *iface.last_accepted.lock().await = Some(conn); });
                    }
                    fd
                }
                Err(e) => water_error_code(&Error::FailedIo(e)),
            }
        })();
        results[0] = Val::I32(code);
        Ok(())
    })
}

/// Shared tail of `water_dial`/`water_dial_fixed`: dial, disable Nagle on
/// TCP success, register, return the FD (spec section 4.D).
fn dial_and_register(
    caller: &mut Caller<'_, StoreData>,
    iface: &NetworkInterface,
    dial_fn: &DialerFn,
    network: &str,
    address: &str,
) -> i32 {
    let fut = dial_fn(network, address);
    match block_on(&iface.handle, fut) {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            let conn = shared(AnyConnection::Native(NativeStream::new(stream)));
            let fd = insert_and_record(caller, iface, conn.clone());
            if fd > 0 {
                block_on(&iface.handle, async { *iface.last_dialed.lock().await = Some(conn); });
            }
            fd
        }
        Err(e) => water_error_code(&Error::FailedIo(e)),
    }
}

/// Pushes `conn` into the guest's WASI file table directly off `caller`
/// (the closure is already running inside a call on this exact `Store`,
/// so a `&mut GuestRuntime` over the same store cannot be borrowed here),
/// then records the resulting FD in the registry under the same number so
/// a later [`FdRegistry::get`] resolves to the identical connection the
/// guest is reading and writing.
fn insert_and_record(caller: &mut Caller<'_, StoreData>, iface: &NetworkInterface, conn: SharedConn) -> i32 {
    let handle = caller.data().handle.clone();
    let file = crate::runtime::ConnectionFile::new(conn.clone(), handle);
    let fd = match caller
        .data_mut()
        .wasi
        .push_file(Box::new(file), wasi_common::file::FileAccessMode::all())
    {
        Ok(fd) => fd as i32,
        Err(e) => return water_error_code(&Error::Wasm(wasmtime::Error::msg(e.to_string()))),
    };
    block_on(&iface.handle, iface.registry.record(fd, conn));
    fd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::AddressValidator;

    #[test]
    fn max_iovec_len_matches_spec_bound() {
        assert_eq!(MAX_IOVEC_LEN, 256);
    }

    #[test]
    fn dialer_policy_constructs_with_default_validator() {
        let policy = DialerPolicy {
            dial_fn: Arc::new(crate::config::default_dialer()),
            validator: AddressValidator::default(),
            pinned_target: None,
        };
        assert!(!policy.validator.check("tcp", "1.2.3.4:80"));
    }
}
