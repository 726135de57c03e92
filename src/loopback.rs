//! The Loopback Socket Pair (spec section 4.A): an in-process,
//! bidirectional, stream-oriented channel with two endpoints, each
//! usable either as the caller-facing stream or as a guest-visible file
//! descriptor once registered in the [`crate::registry::FdRegistry`].
//!
//! Built directly on [`tokio::io::duplex`], which already gives the two
//! endpoints back-pressure and EOF propagation for free.

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

/// Default buffer size for a loopback pair. Generous enough that a
/// pass-through WATM relaying whole reads never needs more than one
/// round-trip per `write`.
const LOOPBACK_BUFFER: usize = 64 * 1024;

/// One endpoint of a [`LoopbackPair`].
pub struct LoopbackEndpoint {
    inner: DuplexStream,
}

impl LoopbackEndpoint {
    fn new(inner: DuplexStream) -> Self {
        LoopbackEndpoint { inner }
    }

    pub fn into_split(self) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        tokio::io::split(self.inner)
    }

    pub fn get_mut(&mut self) -> &mut DuplexStream {
        &mut self.inner
    }
}

/// Two [`LoopbackEndpoint`]s `(a, b)` such that bytes written to `a` are
/// readable from `b` and vice versa (spec section 3).
pub struct LoopbackPair;

impl LoopbackPair {
    /// Creates a new pair with the default buffer size.
    pub fn new() -> (LoopbackEndpoint, LoopbackEndpoint) {
        Self::with_capacity(LOOPBACK_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> (LoopbackEndpoint, LoopbackEndpoint) {
        let (a, b) = tokio::io::duplex(capacity);
        (LoopbackEndpoint::new(a), LoopbackEndpoint::new(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bytes_written_to_one_side_arrive_on_the_other() {
        let (mut a, mut b) = LoopbackPair::new();
        a.get_mut().write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.get_mut().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn closing_one_side_signals_eof_on_the_other() {
        let (a, mut b) = LoopbackPair::new();
        drop(a);
        let mut buf = Vec::new();
        let n = b.get_mut().read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
