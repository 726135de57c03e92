//! The Transport Module Driver (spec section 4.E): the per-guest-instance
//! state machine that takes a compiled WATM from Link through Initialize,
//! Engage, Run, Cancel, and Close.
//!
//! Guards the single guest-reentrancy thread behind an async mutex around
//! the store/instance pair, and resolves a small, caller-chosen set of
//! exports once at Initialize, keeping them as callables for the life of
//! the TM rather than re-resolving them per call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use wasmtime::ValType;

use crate::config::{GuestModuleConfig, RuntimeSettings};
use crate::connection::{
    AnyConnection, ControlPipeConn, LoopbackConn, SharedConn, StreamConn, CONTROL_PIPE_EXIT_BYTE,
};
use crate::error::{Error, Result};
use crate::imports::{link_network_interface, NetworkInterface};
use crate::loopback::LoopbackPair;
use crate::registry::FdRegistry;
use crate::runtime::{GuestExport, GuestRuntime};

/// The forceful-cancellation window used by [`TransportModule::close`]
/// (spec section 5: "five seconds unless overridden").
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

const WATM_INIT: &str = "watm_init_v1";
const WATM_CTRLPIPE: &str = "watm_ctrlpipe_v1";
const WATM_START: &str = "watm_start_v1";
const WATM_DIAL: &str = "watm_dial_v1";
const WATM_DIAL_FIXED: &str = "watm_dial_fixed_v1";
const WATM_ACCEPT: &str = "watm_accept_v1";
const WATM_ASSOCIATE: &str = "watm_associate_v1";

/// Lifecycle state of a TM (spec section 3: "Façade State Machine" — the
/// driver performs every transition; [`crate::facade::ConnectionFacade`]
/// mirrors this state rather than keeping a second copy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmState {
    New,
    Linked,
    Initialized,
    Engaged,
    Running,
    Closing,
    Closed,
}

struct Exports {
    ctrlpipe: GuestExport,
    start: GuestExport,
    dial: Option<GuestExport>,
    dial_fixed: Option<GuestExport>,
    accept: Option<GuestExport>,
    associate: Option<GuestExport>,
}

/// Per-guest-instance state machine (spec section 3/4.E).
pub struct TransportModule {
    runtime: AsyncMutex<Option<GuestRuntime>>,
    exports: AsyncMutex<Option<Exports>>,
    engine: wasmtime::Engine,
    registry: Arc<FdRegistry>,
    iface: Arc<NetworkInterface>,
    control_writer: AsyncMutex<Option<ControlPipeConn>>,
    /// Set to `true` exactly once, by the worker task itself, the moment
    /// `watm_start_v1` returns. A `watch` channel (rather than a oneshot)
    /// so both [`TransportModule::cancel`] and a
    /// [`crate::facade::ConnectionFacade`]'s background watcher can each
    /// hold an independent clone of the receiver and await completion
    /// without racing each other over who gets to consume it.
    exit_watch: AsyncMutex<Option<watch::Receiver<bool>>>,
    /// The outcome of the last `watm_start_v1` call, set by the worker
    /// task itself just before it flips `exit_watch`. A plain
    /// `Option<Arc<...>>` rather than folding the result into the watch
    /// channel's payload, since a `watch::Receiver` only exposes its
    /// current value by reference through the borrow guard.
    worker_result: SyncMutex<Option<Arc<SyncMutex<Option<Result<()>>>>>>,
    worker_handle: AsyncMutex<Option<JoinHandle<()>>>,
    state: SyncMutex<TmState>,
    closed: AtomicBool,
    /// From [`RuntimeSettings::close_on_context_done`]: whether a
    /// [`crate::facade::ConnectionFacade`] should tear itself down as soon
    /// as this TM's worker exits, rather than leaving that to the caller.
    close_on_context_done: bool,
}

impl TransportModule {
    /// *Link* (spec section 4.E, step 1): compiles `wasm`, installs
    /// `water_dial`/`water_dial_fixed`/`water_accept` (stubbing whichever
    /// `iface` doesn't provide), and instantiates.
    pub fn link(
        wasm: &[u8],
        iface: Arc<NetworkInterface>,
        guest_config: GuestModuleConfig,
        handle: Handle,
    ) -> Result<Self> {
        Self::link_with_settings(wasm, iface, guest_config, handle, RuntimeSettings::default())
    }

    /// Like [`TransportModule::link`], but honoring a caller-supplied
    /// [`RuntimeSettings`] (spec section 6: `runtime_config_factory`)
    /// instead of the default.
    pub fn link_with_settings(
        wasm: &[u8],
        iface: Arc<NetworkInterface>,
        guest_config: GuestModuleConfig,
        handle: Handle,
        settings: RuntimeSettings,
    ) -> Result<Self> {
        let (engine, module, mut linker) = GuestRuntime::compile(wasm)?;
        link_network_interface(&mut linker, iface.clone())?;
        let engine_for_interrupt = engine.clone();
        let runtime = GuestRuntime::instantiate(engine, &module, &linker, guest_config, handle)?;
        Ok(TransportModule {
            runtime: AsyncMutex::new(Some(runtime)),
            exports: AsyncMutex::new(None),
            engine: engine_for_interrupt,
            registry: iface.registry.clone(),
            iface,
            control_writer: AsyncMutex::new(None),
            exit_watch: AsyncMutex::new(None),
            worker_result: SyncMutex::new(None),
            worker_handle: AsyncMutex::new(None),
            state: SyncMutex::new(TmState::Linked),
            closed: AtomicBool::new(false),
            close_on_context_done: settings.close_on_context_done,
        })
    }

    /// Whether a facade built over this TM should close itself as soon as
    /// the worker exits on its own (spec section 6:
    /// `runtime_config_factory`'s close-on-context-done flag).
    pub fn close_on_context_done(&self) -> bool {
        self.close_on_context_done
    }

    pub fn state(&self) -> TmState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: TmState) {
        *self.state.lock().unwrap() = s;
    }

    /// *Initialize* (spec section 4.E, step 2): resolves and validates
    /// every required/optional export, then calls `_init`.
    pub async fn initialize(&self) -> Result<()> {
        if self.state() != TmState::Linked {
            return Err(Error::DoubleInit);
        }
        let mut runtime_guard = self.runtime.lock().await;
        let runtime = runtime_guard.as_mut().ok_or(Error::AlreadyClosed)?;

        let init = runtime
            .get_export(WATM_INIT, &[], &[ValType::I32])?
            .ok_or_else(|| Error::InvalidModule(format!("missing required export `{WATM_INIT}`")))?;
        let ctrlpipe = runtime
            .get_export(WATM_CTRLPIPE, &[ValType::I32], &[ValType::I32])?
            .ok_or_else(|| Error::InvalidModule(format!("missing required export `{WATM_CTRLPIPE}`")))?;
        let start = runtime
            .get_export(WATM_START, &[], &[ValType::I32])?
            .ok_or_else(|| Error::InvalidModule(format!("missing required export `{WATM_START}`")))?;
        let dial = runtime.get_export(WATM_DIAL, &[ValType::I32], &[ValType::I32])?;
        let dial_fixed = runtime.get_export(WATM_DIAL_FIXED, &[ValType::I32], &[ValType::I32])?;
        let accept = runtime.get_export(WATM_ACCEPT, &[ValType::I32], &[ValType::I32])?;
        let associate = runtime.get_export(WATM_ASSOCIATE, &[], &[ValType::I32])?;

        let code = init.call(runtime.store_mut(), None)?;
        if code != 0 {
            return Err(Error::from_code(code));
        }

        *self.exports.lock().await = Some(Exports {
            ctrlpipe,
            start,
            dial,
            dial_fixed,
            accept,
            associate,
        });
        self.set_state(TmState::Initialized);
        Ok(())
    }

    /// Pushes the control-pipe read end and calls `watm_ctrlpipe_v1` with
    /// its FD, retaining the write end for [`TransportModule::cancel`].
    /// Called by every Engage variant before its own export, so "the guest
    /// can install the cancellation FD during its own setup" (spec section
    /// 4.E, step 3).
    async fn establish_control_pipe(&self) -> Result<()> {
        let (r, w) = LoopbackPair::new();
        let r_conn = AnyConnection::ControlPipe(ControlPipeConn(LoopbackConn::new(r)));
        let fd = {
            let mut runtime_guard = self.runtime.lock().await;
            let runtime = runtime_guard.as_mut().ok_or(Error::AlreadyClosed)?;
            self.registry.push(runtime, r_conn).await?
        };
        let code = {
            let mut runtime_guard = self.runtime.lock().await;
            let runtime = runtime_guard.as_mut().ok_or(Error::AlreadyClosed)?;
            let exports_guard = self.exports.lock().await;
            let exports = exports_guard.as_ref().ok_or(Error::NotInitialized)?;
            exports.ctrlpipe.call(runtime.store_mut(), Some(fd))?
        };
        if code != 0 {
            return Err(Error::from_code(code));
        }
        *self.control_writer.lock().await = Some(ControlPipeConn(LoopbackConn::new(w)));
        Ok(())
    }

    async fn push_caller(&self, caller: AnyConnection) -> Result<i32> {
        let mut runtime_guard = self.runtime.lock().await;
        let runtime = runtime_guard.as_mut().ok_or(Error::AlreadyClosed)?;
        self.registry.push(runtime, caller).await
    }

    async fn call_export(&self, export: &GuestExport, arg: Option<i32>) -> Result<i32> {
        let mut runtime_guard = self.runtime.lock().await;
        let runtime = runtime_guard.as_mut().ok_or(Error::AlreadyClosed)?;
        export.call(runtime.store_mut(), arg)
    }

    /// *Engage* via dial (spec section 4.E, step 3): pushes `caller`,
    /// invokes `watm_dial_v1(caller_fd)`, and resolves the returned FD to
    /// the peer-facing socket the guest dialed on the host's behalf.
    pub async fn dial_from(&self, caller: AnyConnection) -> Result<SharedConn> {
        self.establish_control_pipe().await?;
        let caller_fd = self.push_caller(caller).await?;
        let dial = {
            let exports_guard = self.exports.lock().await;
            exports_guard
                .as_ref()
                .ok_or(Error::NotInitialized)?
                .dial
                .clone()
                .ok_or_else(|| Error::InvalidFunction(WATM_DIAL.into()))?
        };
        let fd = self.call_export(&dial, Some(caller_fd)).await?;
        if fd <= 0 {
            return Err(Error::from_code(fd));
        }
        let conn = self.registry.get(fd).await?;
        self.set_state(TmState::Engaged);
        Ok(conn)
    }

    /// *Engage* via fixed dial: identical to [`TransportModule::dial_from`]
    /// but invokes `watm_dial_fixed_v1`, bypassing the address validator
    /// because the host already chose the destination at configuration
    /// time (spec section 4.D/4.E).
    pub async fn dial_fixed_from(&self, caller: AnyConnection) -> Result<SharedConn> {
        self.establish_control_pipe().await?;
        let caller_fd = self.push_caller(caller).await?;
        let dial_fixed = {
            let exports_guard = self.exports.lock().await;
            exports_guard
                .as_ref()
                .ok_or(Error::NotInitialized)?
                .dial_fixed
                .clone()
                .ok_or_else(|| Error::InvalidFunction(WATM_DIAL_FIXED.into()))?
        };
        let fd = self.call_export(&dial_fixed, Some(caller_fd)).await?;
        if fd <= 0 {
            return Err(Error::from_code(fd));
        }
        let conn = self.registry.get(fd).await?;
        self.set_state(TmState::Engaged);
        Ok(conn)
    }

    /// *Engage* via accept: invokes `watm_accept_v1(caller_fd)`; the
    /// returned FD is the source-side socket (spec section 4.E, step 3).
    pub async fn accept_for(&self, caller: AnyConnection) -> Result<SharedConn> {
        self.establish_control_pipe().await?;
        let caller_fd = self.push_caller(caller).await?;
        let accept = {
            let exports_guard = self.exports.lock().await;
            exports_guard
                .as_ref()
                .ok_or(Error::NotInitialized)?
                .accept
                .clone()
                .ok_or_else(|| Error::InvalidFunction(WATM_ACCEPT.into()))?
        };
        let fd = self.call_export(&accept, Some(caller_fd)).await?;
        if fd <= 0 {
            return Err(Error::from_code(fd));
        }
        let conn = self.registry.get(fd).await?;
        self.set_state(TmState::Engaged);
        Ok(conn)
    }

    /// *Engage* via associate (spec section 4.E, step 3): no caller
    /// endpoint is involved. The guest internally calls `water_accept` and
    /// `water_dial`/`_fixed` to obtain both of its network-facing FDs; the
    /// host recovers the resulting connections from
    /// [`NetworkInterface::last_accepted`]/[`NetworkInterface::last_dialed`]
    /// rather than from an export return value, since `watm_associate_v1`
    /// returns only a status code.
    pub async fn associate(&self) -> Result<(SharedConn, SharedConn)> {
        self.establish_control_pipe().await?;
        let associate = {
            let exports_guard = self.exports.lock().await;
            exports_guard
                .as_ref()
                .ok_or(Error::NotInitialized)?
                .associate
                .clone()
                .ok_or_else(|| Error::InvalidFunction(WATM_ASSOCIATE.into()))?
        };
        let code = self.call_export(&associate, None).await?;
        if code != 0 {
            return Err(Error::from_code(code));
        }
        let source = self
            .iface
            .last_accepted
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::General("associate did not accept a source connection".into()))?;
        let destination = self
            .iface
            .last_dialed
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::General("associate did not dial a destination connection".into()))?;
        self.set_state(TmState::Engaged);
        Ok((source, destination))
    }

    /// *Run* (spec section 4.E, step 4): dispatches `watm_start_v1` on a
    /// dedicated worker task (the guest's own blocking mainloop — it must
    /// not share a thread with the async runtime) and returns immediately.
    pub async fn start_worker(&self) -> Result<()> {
        let start = {
            let exports_guard = self.exports.lock().await;
            exports_guard.as_ref().ok_or(Error::NotInitialized)?.start.clone()
        };
        let mut runtime = self
            .runtime
            .lock()
            .await
            .take()
            .ok_or(Error::AlreadyClosed)?;
        let (tx, rx) = watch::channel(false);
        let result_slot: Arc<SyncMutex<Option<Result<()>>>> = Arc::new(SyncMutex::new(None));
        let result_slot_worker = result_slot.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let result = start
                .call(runtime.store_mut(), None)
                .and_then(|code| if code == 0 { Ok(()) } else { Err(Error::from_code(code)) });
            *result_slot_worker.lock().unwrap() = Some(result);
            let _ = tx.send(true);
            // `runtime` (Store + Instance) is dropped here, disposing the
            // guest once the worker has exited.
        });
        *self.worker_handle.lock().await = Some(handle);
        *self.exit_watch.lock().await = Some(rx);
        *self.worker_result.lock().unwrap() = Some(result_slot);
        self.set_state(TmState::Running);
        Ok(())
    }

    /// Clones the worker's exit signal for an independent, non-consuming
    /// wait. Used by [`crate::facade::ConnectionFacade`]'s background
    /// watcher to detect an organic (unrequested) guest exit without racing
    /// [`TransportModule::cancel`] over who gets to observe it (spec
    /// section 4.F).
    pub async fn wait_for_exit(&self) -> Result<()> {
        let rx = self.exit_watch.lock().await.clone();
        let Some(mut rx) = rx else {
            return Ok(());
        };
        if !*rx.borrow() {
            let _ = rx.changed().await;
        }
        self.take_worker_result()
    }

    fn take_worker_result(&self) -> Result<()> {
        let slot = self.worker_result.lock().unwrap().clone();
        match slot.and_then(|s| s.lock().unwrap().take()) {
            Some(Ok(())) | None => Ok(()),
            Some(Err(e)) => Err(e),
        }
    }

    /// *Cancel* (spec section 4.E, step 5): writes the exit byte
    /// cooperatively, waits up to `timeout`, and falls back to forcing an
    /// engine-epoch trap if the worker hasn't exited by then. Idempotent —
    /// a second call with nothing left to cancel is a no-op success.
    pub async fn cancel(&self, timeout: Duration) -> Result<()> {
        if let Some(conn) = self.control_writer.lock().await.as_mut() {
            let _ = conn.write(&[CONTROL_PIPE_EXIT_BYTE]).await;
        }
        let rx = self.exit_watch.lock().await.clone();
        let Some(mut rx) = rx else {
            return Ok(());
        };
        if *rx.borrow() {
            return self.take_worker_result();
        }
        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(Ok(())) => self.take_worker_result(),
            // The sender was dropped without sending: the worker thread
            // unwound without reporting a result. Treat as exited.
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                self.engine.increment_epoch();
                Err(Error::Cancelled)
            }
        }
    }

    /// *Close* (spec section 4.E, step 6): cancel-with-default-timeout,
    /// clear the FD registry, drop the export callables, dispose the
    /// runtime. Guarded by a once-flag — a second call returns
    /// `AlreadyClosed` rather than repeating any of this.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        self.set_state(TmState::Closing);
        let _ = self.cancel(DEFAULT_CANCEL_TIMEOUT).await;
        if let Some(handle) = self.worker_handle.lock().await.take() {
            let _ = handle.await;
        }
        self.registry.clear().await;
        *self.exports.lock().await = None;
        *self.runtime.lock().await = None;
        self.set_state(TmState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tm_states_are_totally_ordered_by_declaration() {
        // Sanity check that the enum carries exactly the seven lifecycle
        // states of the Link/Initialize/Engage/Run/Cancel/Close machine.
        let all = [
            TmState::New,
            TmState::Linked,
            TmState::Initialized,
            TmState::Engaged,
            TmState::Running,
            TmState::Closing,
            TmState::Closed,
        ];
        assert_eq!(all.len(), 7);
    }

    #[test]
    fn default_cancel_timeout_matches_spec() {
        assert_eq!(DEFAULT_CANCEL_TIMEOUT, Duration::from_secs(5));
    }

    fn dialer_free_iface() -> Arc<NetworkInterface> {
        Arc::new(NetworkInterface::new(
            None,
            None,
            Arc::new(FdRegistry::new()),
            Handle::current(),
        ))
    }

    #[tokio::test]
    async fn immediate_exit_module_runs_and_reports_clean_exit() {
        let wasm = crate::test_watm::immediate_exit_module();
        let tm = TransportModule::link(&wasm, dialer_free_iface(), GuestModuleConfig::default(), Handle::current())
            .unwrap();
        tm.initialize().await.unwrap();
        tm.establish_control_pipe().await.unwrap();
        tm.start_worker().await.unwrap();
        assert!(tm.wait_for_exit().await.is_ok());
        assert!(tm.close().await.is_ok());
    }

    // Testable property 4 (cancellation termination): a guest stuck in an
    // infinite loop is still reclaimed, via the forceful engine-epoch
    // fallback, well within the timeout passed to `cancel`.
    #[tokio::test]
    async fn forceful_cancellation_traps_a_runaway_guest_within_the_timeout() {
        let wasm = crate::test_watm::spin_forever_module();
        let tm = TransportModule::link(&wasm, dialer_free_iface(), GuestModuleConfig::default(), Handle::current())
            .unwrap();
        tm.initialize().await.unwrap();
        tm.establish_control_pipe().await.unwrap();
        tm.start_worker().await.unwrap();

        let started = std::time::Instant::now();
        let result = tm.cancel(Duration::from_millis(150)).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn close_is_idempotent_after_a_forced_cancellation() {
        let wasm = crate::test_watm::spin_forever_module();
        let tm = TransportModule::link(&wasm, dialer_free_iface(), GuestModuleConfig::default(), Handle::current())
            .unwrap();
        tm.initialize().await.unwrap();
        tm.establish_control_pipe().await.unwrap();
        tm.start_worker().await.unwrap();
        let _ = tm.cancel(Duration::from_millis(150)).await;

        assert!(tm.close().await.is_ok());
        assert!(matches!(tm.close().await, Err(Error::AlreadyClosed)));
    }
}
