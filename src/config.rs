//! The Configuration record handed to the core by an external collaborator
//! (CLI front-end, JSON/protobuf config loader — both out of scope here).
//!
//! `Config` is deliberately a plain, already-populated struct: this crate
//! does not parse configuration files (section 1, Out of scope) — a caller
//! builds one by hand rather than by deserializing.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};
use crate::validator::AddressValidator;

/// A boxed future returned by a [`DialerFn`].
pub type BoxDialFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>;

/// Host-side dial function: `(network, address) -> Connection`.
///
/// Defaults to a plain TCP connect (see [`default_dialer`]).
pub type DialerFn = Box<dyn Fn(&str, &str) -> BoxDialFuture + Send + Sync>;

/// Builds the guest's preopens/argv/env/stdio redirects at instantiation
/// time. Kept as an opaque factory so the core never needs to understand
/// the guest module's own configuration conventions.
pub type ModuleConfigFactory = Box<dyn Fn(&Config) -> Result<GuestModuleConfig> + Send + Sync>;

/// Compiler/interpreter preference, compilation cache, and the
/// close-on-context-done flag a caller may want to customize per facade.
pub type RuntimeConfigFactory = Box<dyn Fn() -> RuntimeSettings + Send + Sync>;

/// Per-guest-instance WASI setup: argv, environment, the guest-visible
/// directory preopens (including the well-known config preopen at
/// [`CONFIG_PREOPEN_DIR`]), and the stdio redirect policy.
#[derive(Debug, Clone, Default)]
pub struct GuestModuleConfig {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// `(guest_path, host_dir)` pairs preopened into the guest's WASI
    /// filesystem namespace. [`Config::guest_module_config`] appends the
    /// config-bytes preopen here itself, after any preopens a caller's
    /// `module_config_factory` already added.
    pub preopens: Vec<(String, PathBuf)>,
    pub stdio: StdioRedirect,
}

/// How a guest's stdio streams are wired up. Defaults to disconnected,
/// matching a bare `WasiCtxBuilder::new()` (no `inherit_stdio` call).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioRedirect {
    #[default]
    Null,
    /// Inherit the host process's own stdin/stdout/stderr.
    Inherit,
}

/// Knobs for the underlying WebAssembly engine.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Whether closing the owning context should forcibly tear down the
    /// guest runtime even if cooperative cancellation is still pending.
    pub close_on_context_done: bool,
    /// Enable wasmtime's ahead-of-time compilation cache.
    pub enable_cache: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        RuntimeSettings {
            close_on_context_done: true,
            enable_cache: false,
        }
    }
}

/// The well-known directory [`Config::guest_module_config`] preopens
/// `transport_module_config` under (section 6).
pub const CONFIG_PREOPEN_DIR: &str = "/conf";

/// The file name `transport_module_config`'s bytes are readable at, inside
/// [`CONFIG_PREOPEN_DIR`].
pub const CONFIG_FILE_NAME: &str = "watm.cfg";

/// The well-known path inside the guest where `transport_module_config` is
/// readable, read-only (section 6): `{CONFIG_PREOPEN_DIR}/{CONFIG_FILE_NAME}`.
pub const CONFIG_PREOPEN_PATH: &str = "/conf/watm.cfg";

/// The Configuration record of section 6.
pub struct Config {
    /// The WATM program bytes. Mandatory, non-empty.
    pub transport_module_bytes: Vec<u8>,
    /// Opaque bytes the WATM reads back at [`CONFIG_PREOPEN_PATH`].
    pub transport_module_config: Option<Vec<u8>>,
    /// Host-side dial function. Defaults to plain TCP connect if unset at
    /// construction time via [`Config::new`].
    pub network_dialer: Option<DialerFn>,
    /// Predicate `(network, address) -> allow | deny`. Denies everything
    /// if left at its default (see [`AddressValidator::default`]).
    pub dialed_address_validator: AddressValidator,
    /// A destination chosen by the host at configuration time; enables
    /// `water_dial_fixed`/`watm_dial_fixed_v1`.
    pub pinned_target: Option<(String, String)>,
    /// Required for Listener/Relay, ignored by a pure Dialer.
    pub network_listener: Option<TcpListener>,
    pub module_config_factory: Option<ModuleConfigFactory>,
    pub runtime_config_factory: Option<RuntimeConfigFactory>,
}

impl Config {
    /// A minimal dialer-only configuration: just the WATM bytes, with a
    /// default-deny address validator and the default TCP dialer.
    pub fn new(transport_module_bytes: Vec<u8>) -> Self {
        Config {
            transport_module_bytes,
            transport_module_config: None,
            network_dialer: Some(default_dialer()),
            dialed_address_validator: AddressValidator::default(),
            pinned_target: None,
            network_listener: None,
            module_config_factory: None,
            runtime_config_factory: None,
        }
    }

    pub fn with_address_validator(mut self, validator: AddressValidator) -> Self {
        self.dialed_address_validator = validator;
        self
    }

    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.network_listener = Some(listener);
        self
    }

    pub fn with_pinned_target(mut self, network: impl Into<String>, address: impl Into<String>) -> Self {
        self.pinned_target = Some((network.into(), address.into()));
        self
    }

    pub fn with_module_config(mut self, bytes: Vec<u8>) -> Self {
        self.transport_module_config = Some(bytes);
        self
    }

    pub(crate) fn runtime_settings(&self) -> RuntimeSettings {
        match &self.runtime_config_factory {
            Some(f) => f(),
            None => RuntimeSettings::default(),
        }
    }

    /// Builds this instantiation's [`GuestModuleConfig`]: runs the caller's
    /// `module_config_factory` if one is set, then unconditionally appends
    /// the `transport_module_config` preopen (if any) so the guest can
    /// always read its configuration back at [`CONFIG_PREOPEN_PATH`]
    /// regardless of whether a factory was supplied (section 6).
    pub(crate) fn guest_module_config(&self) -> Result<GuestModuleConfig> {
        let mut guest_config = match &self.module_config_factory {
            Some(f) => f(self)?,
            None => GuestModuleConfig::default(),
        };
        if let Some(bytes) = &self.transport_module_config {
            let dir = materialize_config_dir(bytes)?;
            guest_config.preopens.push((CONFIG_PREOPEN_DIR.to_string(), dir));
        }
        Ok(guest_config)
    }
}

/// Writes `bytes` to a fresh, process-scoped temp directory so it can be
/// preopened into the guest's WASI filesystem namespace without the core
/// needing its own in-memory `WasiDir` implementation — the guest still
/// only ever sees it through the read-only preopen `runtime::GuestRuntime`
/// builds from it, never the host path itself.
fn materialize_config_dir(bytes: &[u8]) -> Result<PathBuf> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut dir = std::env::temp_dir();
    dir.push(format!("water-watm-config-{}-{nonce}", std::process::id()));
    std::fs::create_dir_all(&dir).map_err(Error::FailedIo)?;
    std::fs::write(dir.join(CONFIG_FILE_NAME), bytes).map_err(Error::FailedIo)?;
    Ok(dir)
}

/// The default `network_dialer_fn`: a plain TCP connect with Nagle
/// disabled on success, per the Host Import Surface's handling of
/// `water_dial` (section 4.D: "For TCP results, disables Nagle").
pub fn default_dialer() -> DialerFn {
    Box::new(|network: &str, address: &str| {
        let network = network.to_string();
        let address = address.to_string();
        Box::pin(async move {
            if network != "tcp" && network != "tcp4" && network != "tcp6" {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unsupported network: {network}"),
                ));
            }
            let addr: SocketAddr = address
                .parse()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_config_defaults_to_deny_all_validator() {
        let cfg = Config::new(vec![0, 1, 2]);
        assert!(!cfg.dialed_address_validator.check("tcp", "127.0.0.1:1"));
    }

    #[tokio::test]
    async fn default_dialer_rejects_unparseable_address() {
        let dial = default_dialer();
        let err = dial("tcp", "256.267.278.289:2023").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn guest_module_config_is_empty_without_a_module_config() {
        let cfg = Config::new(vec![0, 1, 2]);
        let guest_config = cfg.guest_module_config().unwrap();
        assert!(guest_config.preopens.is_empty());
    }

    #[test]
    fn guest_module_config_preopens_the_well_known_config_dir() {
        let cfg = Config::new(vec![0, 1, 2]).with_module_config(b"hello".to_vec());
        let guest_config = cfg.guest_module_config().unwrap();
        let (guest_path, host_dir) = guest_config
            .preopens
            .iter()
            .find(|(p, _)| p == CONFIG_PREOPEN_DIR)
            .expect("config preopen present");
        assert_eq!(guest_path, CONFIG_PREOPEN_DIR);
        let contents = std::fs::read(host_dir.join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(contents, b"hello");
    }
}
