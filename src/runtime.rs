//! The Guest Runtime Facade (spec section 4.C): the thin capability layer
//! over the WebAssembly engine. Holds no business logic of its own — it is
//! the seam the rest of the core is built against, so the wasmtime
//! dependency never leaks past this module and [`crate::tm`].
//!
//! Compiles and instantiates a module against an arbitrary
//! caller-registered import table (`Engine`, `Module`, `Linker`,
//! `wasi_common::sync::add_to_linker`), and inserts arbitrary
//! [`AnyConnection`]s into the guest's WASI FD table via
//! `wasi_common::file::{FileType, FdFlags}`/`WasiFile`/`ctx.push_file`.

use std::any::Any;
use std::io::IoSliceMut;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task;
use wasi_common::file::{FdFlags, FileType};
use wasi_common::sync::{ambient_authority, Dir, WasiCtxBuilder};
use wasi_common::{WasiCtx, WasiFile};
use wasmtime::{AsContextMut, Caller, Config, Engine, FuncType, Instance, Linker, Module, Store, Val, ValType};

use crate::connection::{SharedConn, StreamConn};
use crate::config::{GuestModuleConfig, StdioRedirect};
use crate::error::{Error, Result};

/// State stored in the wasmtime `Store`. Holds the WASI context plus
/// whatever host-side bookkeeping the import closures need (mediated
/// entirely through [`crate::tm::TransportModule`], which owns this
/// facade).
pub struct StoreData {
    pub wasi: WasiCtx,
    pub handle: Handle,
}

/// An adapter implementing `WasiFile` over a [`SharedConn`], so an
/// arbitrary host `Connection` can be pushed into the guest's WASI file
/// table exactly the way wasmCloud's `AsyncReadPipe`/`AsyncWritePipe` wrap
/// stdio streams — generalized here to one bidirectional type instead of
/// a read-only/write-only split, since a WATM's socket FDs are read-write.
///
/// The connection is shared (not owned) because the same underlying
/// socket may also be reachable from a [`crate::facade::ConnectionFacade`]
/// that needs to set a deadline or read its address directly, concurrent
/// with the guest reading and writing it through this file.
pub struct ConnectionFile {
    inner: SharedConn,
    handle: Handle,
}

impl ConnectionFile {
    pub fn new(conn: SharedConn, handle: Handle) -> Self {
        ConnectionFile { inner: conn, handle }
    }
}

#[async_trait]
impl WasiFile for ConnectionFile {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn get_filetype(&self) -> std::result::Result<FileType, wasi_common::Error> {
        Ok(FileType::SocketStream)
    }

    async fn get_fdflags(&self) -> std::result::Result<FdFlags, wasi_common::Error> {
        Ok(FdFlags::empty())
    }

    async fn read_vectored<'a>(
        &self,
        bufs: &mut [IoSliceMut<'a>],
    ) -> std::result::Result<u64, wasi_common::Error> {
        let _guard = self.handle.enter();
        let mut conn = self.inner.lock().await;
        for buf in bufs.iter_mut() {
            if buf.is_empty() {
                continue;
            }
            let n = conn
                .read(buf)
                .await
                .map_err(|e| wasi_common::Error::from(e))?;
            return Ok(n as u64);
        }
        Ok(0)
    }

    async fn write_vectored<'a>(
        &self,
        bufs: &[std::io::IoSlice<'a>],
    ) -> std::result::Result<u64, wasi_common::Error> {
        let mut conn = self.inner.lock().await;
        for buf in bufs.iter() {
            if buf.is_empty() {
                continue;
            }
            let n = conn
                .write(buf)
                .await
                .map_err(|e| wasi_common::Error::from(e))?;
            return Ok(n as u64);
        }
        Ok(0)
    }

    async fn readable(&self) -> std::result::Result<(), wasi_common::Error> {
        Ok(())
    }

    async fn writable(&self) -> std::result::Result<(), wasi_common::Error> {
        Ok(())
    }
}

/// A resolved, signature-validated guest export. Stored rather than
/// re-resolved on every call.
#[derive(Clone)]
pub struct GuestExport {
    func: wasmtime::Func,
    param_count: usize,
}

impl GuestExport {
    /// Invokes the export with up to one `i32` argument, returning its
    /// single `i32` result — the uniform shape every `watm_*_v1` export
    /// and `water_*` import shares (spec section 6).
    pub fn call(&self, store: &mut Store<StoreData>, arg: Option<i32>) -> Result<i32> {
        let params: Vec<Val> = match (self.param_count, arg) {
            (0, _) => vec![],
            (1, Some(a)) => vec![Val::I32(a)],
            (1, None) => vec![Val::I32(0)],
            _ => return Err(Error::InvalidModule("unexpected export arity".into())),
        };
        let mut results = [Val::I32(0)];
        self.func
            .call(store.as_context_mut(), &params, &mut results)
            .map_err(|e| Error::GuestTrap(e.to_string()))?;
        Ok(results[0].unwrap_i32())
    }
}

/// The compiled-and-instantiated guest, plus everything needed to keep
/// driving it: the `Store`, the `Instance`, and an `Engine` handle used to
/// force a trap into any in-flight guest call (the "forceful" half of
/// cancellation, spec section 4.E/5).
pub struct GuestRuntime {
    engine: Engine,
    store: Store<StoreData>,
    instance: Instance,
}

impl GuestRuntime {
    /// Compiles `wasm` and prepares a `Linker` with WASI prereview-1
    /// wired in. Host imports are registered into the returned linker by
    /// the caller (`crate::imports::link_network_interface`) before
    /// [`GuestRuntime::instantiate`] is called.
    pub fn compile(wasm: &[u8]) -> Result<(Engine, Module, Linker<StoreData>)> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(Error::Wasm)?;
        let module = Module::new(&engine, wasm)
            .map_err(|e| Error::InvalidModule(format!("failed to compile module: {e}")))?;
        let mut linker: Linker<StoreData> = Linker::new(&engine);
        wasi_common::sync::add_to_linker(&mut linker, |s: &mut StoreData| &mut s.wasi)
            .map_err(Error::Wasm)?;
        Ok((engine, module, linker))
    }

    /// Instantiates `module` against `linker`, using `guest_config` to
    /// build the WASI context (argv/env/preopens). `handle` is the tokio
    /// runtime the synchronous WASI file calls bridge back into, per the
    /// `task::block_in_place`/`Handle::current().block_on` pattern used by
    /// the wasmCloud actor-module host to drive async I/O under a
    /// synchronous `WasiFile` implementation.
    pub fn instantiate(
        engine: Engine,
        module: &Module,
        linker: &Linker<StoreData>,
        guest_config: GuestModuleConfig,
        handle: Handle,
    ) -> Result<Self> {
        let mut builder = WasiCtxBuilder::new();
        for arg in &guest_config.argv {
            builder = builder.arg(arg).map_err(Error::Wasm)?;
        }
        for (k, v) in &guest_config.env {
            builder = builder.env(k, v).map_err(Error::Wasm)?;
        }
        match guest_config.stdio {
            StdioRedirect::Inherit => builder = builder.inherit_stdio(),
            StdioRedirect::Null => {}
        }
        for (guest_path, host_dir) in &guest_config.preopens {
            let dir = Dir::open_ambient_dir(host_dir, ambient_authority())
                .map_err(|e| Error::InvalidConfig(format!("failed to open preopen dir {host_dir:?}: {e}")))?;
            builder = builder
                .preopened_dir(dir, guest_path)
                .map_err(Error::Wasm)?;
        }
        let wasi = builder.build();
        let data = StoreData { wasi, handle };
        let mut store = Store::new(&engine, data);
        store.set_epoch_deadline(1);
        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| Error::InvalidModule(format!("failed to instantiate module: {e}")))?;
        Ok(GuestRuntime {
            engine,
            store,
            instance,
        })
    }

    /// Resolves `name`, validating that its signature matches
    /// `params`/`results` exactly. Absence is reported distinctly from a
    /// signature mismatch so callers can treat optional exports as
    /// "not implemented" rather than "invalid module" (spec section 4.E).
    pub fn get_export(
        &mut self,
        name: &str,
        params: &[ValType],
        results: &[ValType],
    ) -> Result<Option<GuestExport>> {
        let export = match self.instance.get_export(&mut self.store, name) {
            Some(e) => e,
            None => return Ok(None),
        };
        let func = export
            .into_func()
            .ok_or_else(|| Error::InvalidModule(format!("`{name}` is not a function export")))?;
        let ty = func.ty(&self.store);
        let got_params: Vec<ValType> = ty.params().collect();
        let got_results: Vec<ValType> = ty.results().collect();
        if got_params != params || got_results != results {
            return Err(Error::InvalidModule(format!(
                "`{name}` has an unexpected signature"
            )));
        }
        Ok(Some(GuestExport {
            func,
            param_count: params.len(),
        }))
    }

    pub fn store_mut(&mut self) -> &mut Store<StoreData> {
        &mut self.store
    }

    /// Inserts `conn` into the guest's WASI file table, returning its
    /// guest-visible FD (spec section 4.C: "insert a native connection
    /// object into the guest FD table, returning its FD"). `conn` is
    /// already shared so the caller can retain a handle to the same
    /// underlying connection (e.g. to hand to a facade) alongside the one
    /// now reachable through the guest's FD table.
    pub fn insert_connection(&mut self, conn: SharedConn) -> Result<u32> {
        let handle = self.store.data().handle.clone();
        let file = ConnectionFile::new(conn, handle);
        self.store
            .data_mut()
            .wasi
            .push_file(Box::new(file), wasi_common::file::FileAccessMode::all())
            .map_err(|e| Error::Wasm(wasmtime::Error::msg(e.to_string())))
    }

    /// Reads a guest memory scatter-list (iovec) into a host buffer, used
    /// to marshal the string arguments the guest passes to `water_dial`.
    pub fn read_iovec(caller: &mut Caller<'_, StoreData>, ptr: i32, len: i32) -> Result<Vec<u8>> {
        let memory = caller
            .get_export("memory")
            .and_then(|e| e.into_memory())
            .ok_or_else(|| Error::InvalidModule("guest module does not export `memory`".into()))?;
        if len < 0 || ptr < 0 {
            return Err(Error::InvalidArgument("negative iovec ptr/len".into()));
        }
        let data = memory.data(&caller);
        let start = ptr as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or_else(|| Error::InvalidArgument("iovec overflow".into()))?;
        data.get(start..end)
            .map(|s| s.to_vec())
            .ok_or_else(|| Error::InvalidArgument("iovec out of bounds".into()))
    }

    /// Forces a trap into any in-flight (or future) guest call on this
    /// instance by incrementing the engine's epoch past the deadline set
    /// at instantiation — the forceful half of cancellation (spec section
    /// 4.E/5): "closing the guest runtime... unblocks any guest-side
    /// blocking system call that would otherwise ignore context
    /// cancellation".
    pub fn force_interrupt(&self) {
        self.engine.increment_epoch();
    }

    pub fn register_host_func(
        linker: &mut Linker<StoreData>,
        namespace: &str,
        name: &str,
        ty: FuncType,
        func: impl Fn(Caller<'_, StoreData>, &[Val], &mut [Val]) -> std::result::Result<(), wasmtime::Error>
            + Send
            + Sync
            + 'static,
    ) -> Result<()> {
        linker
            .func_new(namespace, name, ty, func)
            .map_err(Error::Wasm)?;
        Ok(())
    }
}

/// Blocks the current (worker) thread on `fut` by entering `handle` and
/// driving the future to completion. Mirrors the
/// `task::block_in_place(|| Handle::current().block_on(...))` bridge the
/// wasmCloud actor-module host uses to call async host code from a
/// synchronous `WasiFile` method.
pub fn block_on<F: std::future::Future>(handle: &Handle, fut: F) -> F::Output {
    task::block_in_place(move || handle.block_on(fut))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_rejects_garbage_bytes() {
        let err = GuestRuntime::compile(&[0xff, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, Error::InvalidModule(_)));
    }
}
