//! The Connection Façade (spec section 4.F): the user-visible stream
//! object returned by a Dialer, a Listener's `accept`, or held headlessly
//! by a Relay.
//!
//! The background exit watcher is an owned `Arc<Self>` spawned as its own
//! task, watching the TM's worker-exit signal rather than polling.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{AnyConnection, LoopbackConn, SharedConn, StreamConn};
use crate::error::{Error, Result};
use crate::loopback::LoopbackPair;
use crate::tm::{TransportModule, DEFAULT_CANCEL_TIMEOUT};

/// Which of `{caller_endpoint, source_socket, destination_socket}` a
/// façade populates determines which role it plays (spec section 4.F).
enum Role {
    /// `{caller_endpoint, destination_socket}`.
    Dialer { destination: SharedConn },
    /// `{caller_endpoint, source_socket}`.
    ListenerAccepted { source: SharedConn },
    /// `{source_socket, destination_socket}`, no caller endpoint.
    Relay { source: SharedConn, destination: SharedConn },
}

/// The externally visible stream object. One type, three roles (spec
/// section 4.F); this is the `Connection` of the crate's public prelude.
pub struct ConnectionFacade {
    tm: Arc<TransportModule>,
    caller_endpoint: Option<SharedConn>,
    role: Role,
}

impl ConnectionFacade {
    /// Creates the loopback pair eagerly (spec section 3: "Created eagerly
    /// when the façade needs a caller surface"): `A` becomes the façade's
    /// own caller-facing endpoint, `B` is handed to Engage for insertion
    /// into the guest's FD table.
    fn new_caller_pair() -> (SharedConn, AnyConnection) {
        let (a, b) = LoopbackPair::new();
        (
            crate::connection::shared(AnyConnection::Loopback(LoopbackConn::new(a))),
            AnyConnection::Loopback(LoopbackConn::new(b)),
        )
    }

    /// Builds a Dialer-role façade: Engage via `dial_from`, then start the
    /// worker. Wraps the result in an `Arc` and spawns the exit watcher,
    /// since both the façade and the watcher need to outlive this call.
    pub async fn new_dialer(tm: Arc<TransportModule>) -> Result<Arc<Self>> {
        let (caller_endpoint, guest_side) = Self::new_caller_pair();
        let destination = tm.dial_from(guest_side).await?;
        Self::finish(tm, Some(caller_endpoint), Role::Dialer { destination }).await
    }

    /// Builds a Dialer-role façade using `watm_dial_fixed_v1` (spec
    /// section 4.D/4.E): the pinned target, not a guest-supplied address.
    pub async fn new_fixed_dialer(tm: Arc<TransportModule>) -> Result<Arc<Self>> {
        let (caller_endpoint, guest_side) = Self::new_caller_pair();
        let destination = tm.dial_fixed_from(guest_side).await?;
        Self::finish(tm, Some(caller_endpoint), Role::Dialer { destination }).await
    }

    /// Builds a Listener-accepted façade: Engage via `accept_for`.
    pub async fn new_listener_accepted(tm: Arc<TransportModule>) -> Result<Arc<Self>> {
        let (caller_endpoint, guest_side) = Self::new_caller_pair();
        let source = tm.accept_for(guest_side).await?;
        Self::finish(tm, Some(caller_endpoint), Role::ListenerAccepted { source }).await
    }

    /// Builds a headless Relay façade: Engage via `associate`, no caller
    /// endpoint (spec section 4.F/4.G).
    pub async fn new_relay(tm: Arc<TransportModule>) -> Result<Arc<Self>> {
        let (source, destination) = tm.associate().await?;
        Self::finish(tm, None, Role::Relay { source, destination }).await
    }

    async fn finish(tm: Arc<TransportModule>, caller_endpoint: Option<SharedConn>, role: Role) -> Result<Arc<Self>> {
        tm.start_worker().await?;
        let close_on_context_done = tm.close_on_context_done();
        let facade = Arc::new(ConnectionFacade { tm, caller_endpoint, role });
        if close_on_context_done {
            facade.clone().spawn_watcher();
        }
        Ok(facade)
    }

    /// Spawns the background task that closes this façade if the guest's
    /// worker exits without the host having requested a close (spec
    /// section 4.F: "a background watcher... closes the façade to ensure
    /// the host side does not linger"). Waits on the TM's own exit signal
    /// rather than polling — `close` is idempotent, so this races harmlessly
    /// against a host-initiated `close` that's already underway. Gated by
    /// [`RuntimeSettings::close_on_context_done`][crate::config::RuntimeSettings];
    /// a caller who disables it is responsible for calling `close` itself
    /// once it has noticed the worker exit on its own.
    fn spawn_watcher(self: Arc<Self>) {
        tokio::spawn(async move {
            let _ = self.tm.wait_for_exit().await;
            let _ = self.close().await;
        });
    }

    /// Reads from the caller endpoint (Dialer/Listener-accepted only).
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let endpoint = self
            .caller_endpoint
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "relay facade has no read/write surface"))?;
        endpoint.lock().await.read(buf).await
    }

    /// Writes to the caller endpoint (Dialer/Listener-accepted only).
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let endpoint = self
            .caller_endpoint
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "relay facade has no read/write surface"))?;
        endpoint.lock().await.write(buf).await
    }

    /// Applies `deadline` to every populated underlying Connection, then
    /// to the caller endpoint (spec section 4.F).
    pub async fn set_deadline(&self, deadline: Option<Duration>) {
        match &self.role {
            Role::Dialer { destination } => destination.lock().await.set_deadline(deadline),
            Role::ListenerAccepted { source } => source.lock().await.set_deadline(deadline),
            Role::Relay { source, destination } => {
                source.lock().await.set_deadline(deadline);
                destination.lock().await.set_deadline(deadline);
            }
        }
        if let Some(endpoint) = &self.caller_endpoint {
            endpoint.lock().await.set_deadline(deadline);
        }
    }

    /// Adjusts only the caller endpoint's read deadline (spec section
    /// 4.F: "Set-read-deadline and set-write-deadline only adjust the
    /// caller endpoint").
    pub async fn set_read_deadline(&self, deadline: Option<Duration>) -> Result<()> {
        let endpoint = self
            .caller_endpoint
            .as_ref()
            .ok_or(Error::NoSuchDevice("relay facade has no caller endpoint"))?;
        endpoint.lock().await.set_read_deadline(deadline);
        Ok(())
    }

    pub async fn set_write_deadline(&self, deadline: Option<Duration>) -> Result<()> {
        let endpoint = self
            .caller_endpoint
            .as_ref()
            .ok_or(Error::NoSuchDevice("relay facade has no caller endpoint"))?;
        endpoint.lock().await.set_write_deadline(deadline);
        Ok(())
    }

    /// Prefers the source socket, else the destination socket (spec
    /// section 4.F).
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Dialer { destination } => destination.lock().await.local_addr(),
            Role::ListenerAccepted { source } => source.lock().await.local_addr(),
            Role::Relay { source, .. } => source.lock().await.local_addr(),
        }
    }

    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Dialer { destination } => destination.lock().await.remote_addr(),
            Role::ListenerAccepted { source } => source.lock().await.remote_addr(),
            Role::Relay { source, .. } => source.lock().await.remote_addr(),
        }
    }

    /// Idempotent. Cancels the TM with the default timeout, then clears
    /// it; the TM's own registry clear closes every underlying peer
    /// socket (spec section 4.F).
    pub async fn close(&self) -> Result<()> {
        let _ = self.tm.cancel(DEFAULT_CANCEL_TIMEOUT).await;
        self.tm.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cancel_timeout_is_five_seconds() {
        assert_eq!(DEFAULT_CANCEL_TIMEOUT, Duration::from_secs(5));
    }
}
