//! The Listener (spec section 4.G, first half): a host-native listener
//! paired with a [`Config`] that carries the WATM bytes and every policy a
//! freshly spun-up [`TransportModule`] needs. Every accepted connection
//! gets its own TM instance, Engaged via `accept_for`.
//!
//! Grounded on spec section 4.G verbatim ("Each `accept` call spawns a
//! fresh TM from the same Config, runs the Listener Engage path, and
//! returns the resulting façade").

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

/// Wraps the pieces of a [`Config`] a fresh per-connection TM needs,
/// shared across every [`Listener::accept`] call rather than rebuilt from
/// scratch each time.
struct ModuleTemplate {
    wasm: Vec<u8>,
    dialer: Option<DialerPolicy>,
    config: Config,
}

pub struct Listener {
    native: TcpListener,
    template: Arc<ModuleTemplate>,
    handle: Handle,
    closed: AtomicBool,
    /// Signaled by [`Listener::close`] so an `accept` call currently
    /// blocked on the native listener wakes immediately instead of waiting
    /// for its next peer (spec section 4.G: "in-flight accepts return an
    /// error").
    close_notify: Notify,
}

impl Listener {
    /// Consumes `config`, taking its `network_listener` as the host-native
    /// listener this accepts on. Fails if `config` didn't set one.
    pub fn new(mut config: Config, handle: Handle) -> Result<Self> {
        let native = config
            .network_listener
            .take()
            .ok_or_else(|| Error::InvalidConfig("Listener requires Config::network_listener".into()))?;
        let dialer = config.network_dialer.take().map(|dial_fn| DialerPolicy {
            dial_fn: Arc::new(dial_fn),
            validator: config.dialed_address_validator.clone(),
            pinned_target: config.pinned_target.clone(),
        });
        let wasm = config.transport_module_bytes.clone();
        Ok(Listener {
            native,
            template: Arc::new(ModuleTemplate { wasm, dialer, config }),
            handle,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    /// Accepts the next host-side connection, spins up a fresh TM from
    /// this listener's Config, Engages via `accept_for`, and returns the
    /// resulting façade. Errors during Engage are fatal to this connection
    /// only (spec section 4.E: "Errors during Engage are fatal to this
    /// connection but not to the TM's host") — the caller is expected to
    /// log and call `accept` again.
    pub async fn accept(&self) -> Result<Arc<ConnectionFacade>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        let stream = tokio::select! {
            res = self.native.accept() => res.map_err(Error::FailedIo)?.0,
            _ = self.close_notify.notified() => return Err(Error::AlreadyClosed),
        };
        let _ = stream.set_nodelay(true);

        let dialer = self.template.dialer.clone();
        let iface = Arc::new(NetworkInterface::new(
            dialer,
            Some(Acceptor::pre_accepted(stream)),
            Arc::new(FdRegistry::new()),
            self.handle.clone(),
        ));

        let guest_config = self.template.config.guest_module_config()?;
        let settings = self.template.config.runtime_settings();
        let tm = TransportModule::link_with_settings(&self.template.wasm, iface, guest_config, self.handle.clone(), settings)?;
        tm.initialize().await?;
        let tm = Arc::new(tm);
        ConnectionFacade::new_listener_accepted(tm).await
    }

    /// Idempotent. Marks the listener closed and wakes any `accept` call
    /// currently blocked on the native listener so it returns
    /// `Error::AlreadyClosed` immediately instead of waiting for a peer
    /// that may never arrive (spec section 4.G).
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_listener_refuses_to_accept() {
        let native = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config::new(vec![0, 1, 2, 3]).with_listener(native);
        let listener = Listener::new(config, Handle::current()).unwrap();
        listener.close();
        assert!(matches!(listener.accept().await, Err(Error::AlreadyClosed)));
    }

    #[tokio::test]
    async fn new_requires_a_network_listener() {
        let config = Config::new(vec![0, 1, 2, 3]);
        assert!(matches!(
            Listener::new(config, Handle::current()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn close_wakes_an_accept_already_blocked_on_the_listener() {
        let native = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config::new(vec![0, 1, 2, 3]).with_listener(native);
        let listener = Arc::new(Listener::new(config, Handle::current()).unwrap());

        let blocked = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await }
        });
        tokio::task::yield_now().await;
        listener.close();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), blocked)
            .await
            .expect("accept should wake up promptly once closed")
            .unwrap();
        assert!(matches!(result, Err(Error::AlreadyClosed)));
    }
}
