//! `Connection` (spec section 3): any object exposing a bidirectional byte
//! stream with local/remote address and deadlines. Concrete variants are
//! `{host-accepted native socket, host-dialed native socket, loopback
//! endpoint, cancellation-pipe endpoint}`.
//!
//! Modeled as a small tagged union over a shared `StreamConn` trait per the
//! Design Note in spec section 9 ("tagged union plus trait-object-style
//! dispatch... keeps the registry's value type monomorphic"), the same
//! shape the wasmCloud actor-module host uses for its `AsyncReadPipe`/
//! `AsyncWritePipe` adapters over arbitrary `AsyncRead`/`AsyncWrite` types.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use crate::loopback::LoopbackEndpoint;

/// The capability set every `Connection` variant exposes (spec section 3).
#[async_trait]
pub trait StreamConn: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    async fn close(&mut self) -> io::Result<()>;

    /// Applies a deadline to both the read and write directions.
    fn set_deadline(&mut self, deadline: Option<Duration>);
    fn set_read_deadline(&mut self, deadline: Option<Duration>);
    fn set_write_deadline(&mut self, deadline: Option<Duration>);

    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Tracks the two independent deadlines a `StreamConn` honors, stored as
/// absolute instants once armed so repeated reads/writes against the same
/// deadline don't keep resetting the clock.
#[derive(Default, Clone, Copy)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

impl Deadlines {
    fn set_both(&mut self, d: Option<Duration>) {
        let now = Instant::now();
        self.read = d.map(|d| now + d);
        self.write = d.map(|d| now + d);
    }
}

async fn with_deadline<T>(
    deadline: Option<Instant>,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match deadline {
        Some(at) => timeout(at.saturating_duration_since(Instant::now()), fut)
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"))),
        None => fut.await,
    }
}

/// A host-native TCP socket, either dialed on the guest's behalf or
/// accepted on a Listener/Relay's native listener.
pub struct NativeStream {
    inner: TcpStream,
    deadlines: Deadlines,
}

impl NativeStream {
    pub fn new(inner: TcpStream) -> Self {
        NativeStream {
            inner,
            deadlines: Deadlines::default(),
        }
    }
}

#[async_trait]
impl StreamConn for NativeStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        with_deadline(self.deadlines.read, self.inner.read(buf)).await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        with_deadline(self.deadlines.write, self.inner.write(buf)).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    fn set_deadline(&mut self, deadline: Option<Duration>) {
        self.deadlines.set_both(deadline);
    }

    fn set_read_deadline(&mut self, deadline: Option<Duration>) {
        self.deadlines.read = deadline.map(|d| Instant::now() + d);
    }

    fn set_write_deadline(&mut self, deadline: Option<Duration>) {
        self.deadlines.write = deadline.map(|d| Instant::now() + d);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr().ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr().ok()
    }
}

/// One side of a [`crate::loopback::LoopbackPair`], wired in as a
/// `StreamConn` so it can sit in the FD registry or be the caller-facing
/// side of a facade.
pub struct LoopbackConn {
    inner: LoopbackEndpoint,
    deadlines: Deadlines,
}

impl LoopbackConn {
    pub fn new(inner: LoopbackEndpoint) -> Self {
        LoopbackConn {
            inner,
            deadlines: Deadlines::default(),
        }
    }
}

#[async_trait]
impl StreamConn for LoopbackConn {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        with_deadline(self.deadlines.read, self.inner.get_mut().read(buf)).await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        with_deadline(self.deadlines.write, self.inner.get_mut().write(buf)).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.get_mut().shutdown().await
    }

    fn set_deadline(&mut self, deadline: Option<Duration>) {
        self.deadlines.set_both(deadline);
    }

    fn set_read_deadline(&mut self, deadline: Option<Duration>) {
        self.deadlines.read = deadline.map(|d| Instant::now() + d);
    }

    fn set_write_deadline(&mut self, deadline: Option<Duration>) {
        self.deadlines.write = deadline.map(|d| Instant::now() + d);
    }

    // Loopback endpoints have no network address; both ends are
    // in-process.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// The control-pipe endpoint (spec section 3/4.E): a dedicated loopback
/// pair used only for signaling the guest to exit its mainloop. Distinct
/// from [`LoopbackConn`] only in name, so the registry/facade code reads
/// as intent rather than mechanism.
pub struct ControlPipeConn(pub LoopbackConn);

#[async_trait]
impl StreamConn for ControlPipeConn {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.close().await
    }

    fn set_deadline(&mut self, deadline: Option<Duration>) {
        self.0.set_deadline(deadline)
    }

    fn set_read_deadline(&mut self, deadline: Option<Duration>) {
        self.0.set_read_deadline(deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Duration>) {
        self.0.set_write_deadline(deadline)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// A single distinguished byte written to a control pipe's write half to
/// signal the guest's mainloop to begin shutdown (spec section 6).
pub const CONTROL_PIPE_EXIT_BYTE: u8 = 0x00;

/// A connection shared between the guest's WASI file table and the host
/// side (the [`crate::registry::FdRegistry`] and, when applicable, the
/// [`crate::facade::ConnectionFacade`] that needs to query its address or
/// set a deadline on it directly). Both sides lock the same
/// [`tokio::sync::Mutex`] rather than each holding an independent copy.
pub type SharedConn = std::sync::Arc<tokio::sync::Mutex<AnyConnection>>;

pub fn shared(conn: AnyConnection) -> SharedConn {
    std::sync::Arc::new(tokio::sync::Mutex::new(conn))
}

/// The tagged union every [`crate::registry::FdRegistry`] entry holds,
/// keeping the registry's value type monomorphic while still letting each
/// variant behave according to its own I/O source.
pub enum AnyConnection {
    Native(NativeStream),
    Loopback(LoopbackConn),
    ControlPipe(ControlPipeConn),
}

impl AnyConnection {
    fn as_conn(&self) -> &dyn StreamConn {
        match self {
            AnyConnection::Native(c) => c,
            AnyConnection::Loopback(c) => c,
            AnyConnection::ControlPipe(c) => c,
        }
    }

    fn as_conn_mut(&mut self) -> &mut dyn StreamConn {
        match self {
            AnyConnection::Native(c) => c,
            AnyConnection::Loopback(c) => c,
            AnyConnection::ControlPipe(c) => c,
        }
    }
}

#[async_trait]
impl StreamConn for AnyConnection {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.as_conn_mut().read(buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.as_conn_mut().write(buf).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.as_conn_mut().close().await
    }

    fn set_deadline(&mut self, deadline: Option<Duration>) {
        self.as_conn_mut().set_deadline(deadline)
    }

    fn set_read_deadline(&mut self, deadline: Option<Duration>) {
        self.as_conn_mut().set_read_deadline(deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Duration>) {
        self.as_conn_mut().set_write_deadline(deadline)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.as_conn().local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.as_conn().remote_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackPair;

    #[tokio::test]
    async fn read_deadline_times_out_with_no_writer() {
        let (a, _b) = LoopbackPair::new();
        let mut conn = AnyConnection::Loopback(LoopbackConn::new(a));
        conn.set_read_deadline(Some(Duration::from_millis(20)));
        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
