//! # water
//!
//! `water` is a Transport Module Host: it loads a user-supplied WebAssembly
//! Transport Module (a WATM — an untrusted, sandboxed guest binary) and
//! exposes it to a host application as an ordinary stream-oriented
//! connection. The WATM observes plaintext on one side and transformed
//! bytes on the other, implementing arbitrary on-wire encodings
//! (obfuscation, tunneling, custom protocols) without the host program ever
//! needing to be rebuilt.
//!
//! Three shapes are supported:
//! - a **Dialer**, which hands the WATM a caller-facing pipe and lets it
//!   reach out to the network on the caller's behalf ([`dial`]/[`dial_fixed`]);
//! - a **Listener**, which spins up a fresh WATM instance per accepted
//!   connection ([`Listener`]);
//! - a **Relay**, which couples an accept loop to a dialer through a single
//!   WATM instance per connection, with no caller-facing surface at all
//!   ([`Relay`]).
//!
//! ```no_run
//! use water::prelude::*;
//! use tokio::runtime::Handle;
//!
//! # async fn run(watm_bytes: Vec<u8>, handle: Handle) -> Result<()> {
//! let config = Config::new(watm_bytes)
//!     .with_address_validator(water::validator::AddressValidator::catch_all(vec![]));
//! let conn = water::dial(config, handle).await?;
//! conn.write(b"hello").await.map_err(water::Error::FailedIo)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Notes
//!
//! A WATM's mainloop runs on a dedicated worker thread once `start` is
//! invoked and blocks inside the guest until it observes either EOF on its
//! sockets or the exit byte on its control pipe. Host import calls
//! (`water_dial`, `water_dial_fixed`, `water_accept`) execute on that same
//! guest thread; they must not call back into a guest export. Closing a
//! connection always attempts cooperative cancellation first (writing the
//! control-pipe exit byte) and only forces the guest runtime down — tripping
//! any in-flight syscall via the engine's epoch — after the default timeout
//! elapses, since a guest's `poll_oneoff` does not otherwise observe
//! cancellation.

#[macro_use]
extern crate log;

pub mod config;
pub mod connection;
pub mod error;
pub mod facade;
pub mod imports;
pub mod listener;
pub mod loopback;
pub mod registry;
pub mod relay;
pub mod runtime;
pub mod tm;
pub mod validator;

#[cfg(test)]
mod test_watm;

use std::sync::Arc;

use tokio::runtime::Handle;

pub use config::Config;
pub use error::{Error, Result};
pub use facade::ConnectionFacade as Connection;
pub use listener::Listener;
pub use relay::Relay;

use imports::{DialerPolicy, NetworkInterface};
use registry::FdRegistry;
use tm::TransportModule;

/// The handful of types a caller needs to embed `water` in a host
/// application.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::facade::ConnectionFacade as Connection;
    pub use crate::listener::Listener;
    pub use crate::relay::Relay;
    pub use crate::{dial, dial_fixed};
}

/// Builds a Dialer-role [`Connection`] from `config`: Links and Initializes
/// a fresh [`TransportModule`], Engages it via `watm_dial_v1` with the
/// guest-requested `(network, address)` validated against
/// `config.dialed_address_validator`, and starts its worker (spec section
/// 4.E/4.F).
pub async fn dial(config: Config, handle: Handle) -> Result<Arc<Connection>> {
    let tm = dialer_tm(config, handle).await?;
    facade::ConnectionFacade::new_dialer(tm).await
}

/// Like [`dial`], but Engages via `watm_dial_fixed_v1`: the guest's own
/// requested address is ignored in favor of `config.pinned_target`, and the
/// address validator is bypassed entirely (spec section 4.D).
pub async fn dial_fixed(config: Config, handle: Handle) -> Result<Arc<Connection>> {
    let tm = dialer_tm(config, handle).await?;
    facade::ConnectionFacade::new_fixed_dialer(tm).await
}

/// Shared setup for [`dial`]/[`dial_fixed`]: Link + Initialize a TM with a
/// dialer-only [`NetworkInterface`] (no listener — a pure Dialer never
/// fields `water_accept`).
async fn dialer_tm(mut config: Config, handle: Handle) -> Result<Arc<TransportModule>> {
    let wasm = config.transport_module_bytes.clone();
    let dialer = config.network_dialer.take().map(|dial_fn| DialerPolicy {
        dial_fn: Arc::new(dial_fn),
        validator: config.dialed_address_validator.clone(),
        pinned_target: config.pinned_target.clone(),
    });
    let guest_config = config.guest_module_config()?;
    let settings = config.runtime_settings();
    let iface = Arc::new(NetworkInterface::new(
        dialer,
        None,
        Arc::new(FdRegistry::new()),
        handle.clone(),
    ));
    let tm = TransportModule::link_with_settings(&wasm, iface, guest_config, handle, settings)?;
    tm.initialize().await?;
    Ok(Arc::new(tm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::AddressValidator;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn dial_denies_before_ever_invoking_the_dial_fn() {
        let wasm = crate::test_watm::dialing_module();
        let config = Config::new(wasm).with_address_validator(AddressValidator::default());
        // The guest's own water_dial("tcp", "127.0.0.1:1") inside
        // watm_dial_v1 is denied by the default deny-all validator; Engage
        // itself fails before the worker is ever started.
        let err = dial(config, Handle::current()).await.unwrap_err();
        assert!(matches!(err, Error::AddressDenied(_)));
    }

    // Testable properties 1-2 (bridging transparency / reverse transform):
    // bytes the caller writes to the façade must arrive, untouched by this
    // crate, at the destination the guest itself dialed. Drives the
    // registry/ConnectionFile read/write path end to end, not just FD
    // accounting, via `relaying_dial_module`'s real fd_read/fd_write.
    #[tokio::test]
    async fn dial_round_trips_bytes_from_the_caller_to_the_dialed_peer() {
        let _ = env_logger::try_init();
        let peer = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let accepted = tokio::spawn(async move {
            let (mut stream, _) = peer.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let wasm = crate::test_watm::relaying_dial_module(&peer_addr.to_string());
        let config = Config::new(wasm).with_address_validator(AddressValidator::catch_all(vec![]));
        let conn = dial(config, Handle::current()).await.unwrap();
        conn.write(b"hello").await.unwrap();

        let buf = tokio::time::timeout(std::time::Duration::from_secs(2), accepted)
            .await
            .expect("guest should relay the bytes to the dialed peer promptly")
            .unwrap();
        assert_eq!(&buf, b"hello");

        conn.close().await.unwrap();
    }
}
