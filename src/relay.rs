//! The Relay (spec section 4.G, second half): couples a host-native
//! listener to a dialer policy through one TM per accepted source,
//! Engaged via Associate. The TM's worker drives the bidirectional pump
//! itself; the host never reads or writes the relayed bytes.
//!
//! Grounded on spec section 4.G verbatim ("for each accepted source,
//! build a TM, Engage via Associate, start the worker, and do not wait").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::facade::ConnectionFacade;
use crate::imports::{Acceptor, DialerPolicy, NetworkInterface};
use crate::registry::FdRegistry;
use crate::tm::TransportModule;

pub struct Relay {
    native: TcpListener,
    wasm: Vec<u8>,
    dialer: DialerPolicy,
    config: Config,
    handle: Handle,
    closed: AtomicBool,
    /// Wakes an in-flight `accept` blocked on the native listener as soon
    /// as [`Relay::close`] runs (spec section 4.G).
    close_notify: Notify,
}

impl Relay {
    /// Consumes `config`: its `network_listener` is the source-accepting
    /// listener, its `network_dialer`/`dialed_address_validator`/
    /// `pinned_target` make up the destination-side dialer policy.
    pub fn new(mut config: Config, handle: Handle) -> Result<Self> {
        let native = config
            .network_listener
            .take()
            .ok_or_else(|| Error::InvalidConfig("Relay requires Config::network_listener".into()))?;
        let dial_fn = config
            .network_dialer
            .take()
            .ok_or_else(|| Error::InvalidConfig("Relay requires Config::network_dialer".into()))?;
        let dialer = DialerPolicy {
            dial_fn: Arc::new(dial_fn),
            validator: config.dialed_address_validator.clone(),
            pinned_target: config.pinned_target.clone(),
        };
        let wasm = config.transport_module_bytes.clone();
        Ok(Relay {
            native,
            wasm,
            dialer,
            config,
            handle,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    /// Runs the accept loop against this relay's own listener, dialing
    /// each source's destination according to the policy configured at
    /// construction time (validator + optional pinned target).
    pub async fn listen_and_relay_to(self: &Arc<Self>) -> Result<()> {
        self.run(None).await
    }

    /// Like [`Relay::listen_and_relay_to`], but pins every destination
    /// dial for the lifetime of this call to `(network, address)`,
    /// bypassing the configured validator — the same "host already chose
    /// the destination" exemption `watm_dial_fixed_v1` gets (spec section
    /// 4.D).
    pub async fn relay_to(self: &Arc<Self>, network: impl Into<String>, address: impl Into<String>) -> Result<()> {
        self.run(Some((network.into(), address.into()))).await
    }

    /// For each accepted source, builds a TM, Engages via Associate, and
    /// starts the worker without waiting for it. An unexpected error
    /// inside the loop (not caused by `close`) is logged and the loop
    /// restarts; `close` ends the loop cleanly.
    async fn run(&self, pin_override: Option<(String, String)>) -> Result<()> {
        let dialer = match pin_override {
            Some(target) => DialerPolicy {
                pinned_target: Some(target),
                ..self.dialer.clone()
            },
            None => self.dialer.clone(),
        };
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            let accepted = tokio::select! {
                res = self.native.accept() => res,
                _ = self.close_notify.notified() => return Ok(()),
            };
            match accepted {
                Ok((stream, _peer)) => {
                    let _ = stream.set_nodelay(true);
                    if let Err(e) = self.spawn_relayed(stream, dialer.clone()).await {
                        if self.closed.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        log::warn!("relay: engage failed for accepted source, continuing: {e}");
                    }
                }
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    log::warn!("relay: accept failed, retrying: {e}");
                }
            }
        }
    }

    /// Builds a fresh TM for one already-accepted source connection,
    /// Engages it via `associate`, and starts its worker. Returns once the
    /// worker has been dispatched — it does not wait for the relay to
    /// finish (spec section 4.G: "start the worker, and do not wait").
    async fn spawn_relayed(&self, source: tokio::net::TcpStream, dialer: DialerPolicy) -> Result<()> {
        let iface = Arc::new(NetworkInterface::new(
            Some(dialer),
            Some(Acceptor::pre_accepted(source)),
            Arc::new(FdRegistry::new()),
            self.handle.clone(),
        ));
        let guest_config = self.config.guest_module_config()?;
        let settings = self.config.runtime_settings();
        let tm = TransportModule::link_with_settings(&self.wasm, iface, guest_config, self.handle.clone(), settings)?;
        tm.initialize().await?;
        let tm = Arc::new(tm);
        let _facade: Arc<ConnectionFacade> = ConnectionFacade::new_relay(tm).await?;
        // The façade is headless (no caller endpoint) and its own
        // background watcher keeps it alive until the worker exits; it is
        // intentionally dropped here rather than tracked by the loop.
        Ok(())
    }

    /// Idempotent. Ends the accept loop, waking it immediately if it is
    /// currently blocked in `accept`; connections already relayed keep
    /// running until their own workers exit (spec section 4.G).
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_requires_a_dialer() {
        let native = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::new(vec![0, 1, 2, 3]).with_listener(native);
        config.network_dialer = None;
        assert!(matches!(
            Relay::new(config, Handle::current()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn close_ends_the_accept_loop_promptly() {
        let native = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config::new(vec![0, 1, 2, 3]).with_listener(native);
        let relay = Arc::new(Relay::new(config, Handle::current()).unwrap());
        relay.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), relay.listen_and_relay_to())
            .await
            .expect("loop should exit immediately once closed")
            .unwrap();
    }

    #[tokio::test]
    async fn close_wakes_a_loop_already_blocked_in_accept() {
        let native = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config::new(vec![0, 1, 2, 3]).with_listener(native);
        let relay = Arc::new(Relay::new(config, Handle::current()).unwrap());

        let looped = tokio::spawn({
            let relay = relay.clone();
            async move { relay.listen_and_relay_to().await }
        });
        tokio::task::yield_now().await;
        relay.close();

        tokio::time::timeout(std::time::Duration::from_secs(1), looped)
            .await
            .expect("loop should wake up promptly once closed")
            .unwrap()
            .unwrap();
    }
}
