//! The Managed FD Registry (spec section 4.B): owner of every connection
//! the guest can reach via a file descriptor.
//!
//! `conn` entries are [`SharedConn`]s (`Arc<Mutex<AnyConnection>>`) rather
//! than values the registry exclusively owns outright: the same
//! connection is simultaneously reachable from the guest (through its
//! WASI file table) and, for a dialed/accepted peer socket, from the
//! [`crate::facade::ConnectionFacade`] that needs to query its address or
//! apply a deadline directly (spec section 4.F). The registry is still the
//! single place responsible for closing every entry exactly once at TM
//! teardown.
//!
//! Guarded by a `tokio::sync::RwLock` per spec section 5 ("guarded by a
//! reader/writer lock; insert/clear are writers, lookup is a reader").

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::connection::{shared, AnyConnection, SharedConn, StreamConn};
use crate::error::{Error, Result};
use crate::runtime::GuestRuntime;

/// `push(conn) -> fd` / `get(fd) -> conn` / `clear()` (spec section 4.B,
/// verbatim operation names).
#[derive(Default)]
pub struct FdRegistry {
    entries: RwLock<HashMap<i32, SharedConn>>,
}

impl FdRegistry {
    pub fn new() -> Self {
        FdRegistry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts `conn` into the guest's WASI file table via `runtime`, then
    /// records the resulting FD in this registry (spec section 4.B: "push
    /// inserts a native connection into the guest's WASI table and
    /// records the mapping under a lock").
    pub async fn push(&self, runtime: &mut GuestRuntime, conn: AnyConnection) -> Result<i32> {
        let shared_conn = shared(conn);
        let fd = runtime.insert_connection(shared_conn.clone())? as i32;
        self.record(fd, shared_conn).await;
        Ok(fd)
    }

    /// Lower-level half of `push`, used from within a `water_dial`-style
    /// host import closure where the guest's WASI table insertion must go
    /// through `caller.data_mut().wasi.push_file(..)` directly (the
    /// closure is itself running inside a call on the `Store` that a
    /// `&mut GuestRuntime` would otherwise need to borrow).
    pub async fn record(&self, fd: i32, conn: SharedConn) {
        self.entries.write().await.insert(fd, conn);
    }

    /// Looks up the host-side object behind a guest-returned FD. Used
    /// after the guest returns an FD from `_dial`/`_accept` so the facade
    /// can wrap that native socket as its "other end".
    pub async fn get(&self, fd: i32) -> Result<SharedConn> {
        if fd <= 0 {
            return Err(Error::InvalidFd(fd));
        }
        self.entries
            .read()
            .await
            .get(&fd)
            .cloned()
            .ok_or(Error::InvalidFd(fd))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Closes every registered connection exactly once, then drops the
    /// registry's references to them. Tolerates connections the guest (or
    /// a prior `clear`) already closed.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        for (_, conn) in entries.drain() {
            let mut conn = conn.lock().await;
            let _ = conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LoopbackConn;
    use crate::loopback::LoopbackPair;

    #[tokio::test]
    async fn record_then_get_round_trips() {
        let reg = FdRegistry::new();
        let (a, _) = LoopbackPair::new();
        reg.record(3, shared(AnyConnection::Loopback(LoopbackConn::new(a)))).await;
        assert!(reg.get(3).await.is_ok());
    }

    #[tokio::test]
    async fn negative_or_zero_fd_is_invalid() {
        let reg = FdRegistry::new();
        assert!(matches!(reg.get(0).await, Err(Error::InvalidFd(0))));
        assert!(matches!(reg.get(-3).await, Err(Error::InvalidFd(-3))));
    }

    #[tokio::test]
    async fn clear_closes_every_entry_and_empties_the_map() {
        let reg = FdRegistry::new();
        let (a, _) = LoopbackPair::new();
        let (b, _) = LoopbackPair::new();
        reg.record(1, shared(AnyConnection::Loopback(LoopbackConn::new(a)))).await;
        reg.record(2, shared(AnyConnection::Loopback(LoopbackConn::new(b)))).await;
        reg.clear().await;
        assert_eq!(reg.len().await, 0);
        assert!(reg.get(1).await.is_err());
    }
}
