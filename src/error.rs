//! The WATER error taxonomy shared between host and guest.
//!
//! Every negative `i32` that crosses the guest/host ABI boundary (the
//! return value of `_init`, `watm_dial_v1`, `water_dial`, ...) is one of
//! these variants. [`water_error_code`] performs that mapping in the
//! direction the guest understands; the host-facing API instead returns
//! [`Error`] values directly so callers get a typed, causal chain.

use std::fmt;

/// A result type for errors that occur within the `water` crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Unspecified failure inside the guest.
    #[error("general error: {0}")]
    General(String),

    /// Malformed iovec, or a bad network/address string.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// WATM configuration rejected by the guest.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Host handed the guest a descriptor it cannot use.
    #[error("invalid file descriptor: {0}")]
    InvalidFd(i32),

    /// An optional export was invoked but is not present on this module.
    #[error("function not implemented by this module: {0}")]
    InvalidFunction(String),

    /// `_init` was invoked twice on the same [`crate::tm::TransportModule`].
    #[error("module already initialized")]
    DoubleInit,

    /// Downstream socket I/O failure.
    #[error("I/O failure: {0}")]
    FailedIo(#[from] std::io::Error),

    /// Operation attempted before `_init` succeeded.
    #[error("module not initialized")]
    NotInitialized,

    /// The address validator rejected a guest-requested dial.
    #[error("address denied by validator: {0}")]
    AddressDenied(String),

    /// Capability not linked, e.g. a dial call on a listener-only facade.
    #[error("no such device: {0}")]
    NoSuchDevice(&'static str),

    /// Context cancellation, or an exit byte on the control pipe.
    #[error("cancelled")]
    Cancelled,

    /// A WebAssembly trap or otherwise opaque engine-level fault. Fatal to
    /// the owning [`crate::tm::TransportModule`].
    #[error("guest trap: {0}")]
    GuestTrap(String),

    /// An error surfaced from the WebAssembly engine itself (compilation,
    /// instantiation, export resolution).
    #[error("wasm engine error: {0}")]
    Wasm(#[from] wasmtime::Error),

    /// The module does not export a required symbol, or an export has the
    /// wrong signature.
    #[error("invalid module: {0}")]
    InvalidModule(String),

    /// The facade, TM, or registry is already closed.
    #[error("already closed")]
    AlreadyClosed,
}

impl Error {
    /// True for the subset of variants a caller can reasonably retry (as
    /// opposed to a fatal link/init/trap failure).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::FailedIo(_) | Error::AddressDenied(_) | Error::NoSuchDevice(_)
        )
    }

    /// Maps a negative WATER wire code returned by a guest export back
    /// onto a host-side [`Error`]. `code` is assumed non-zero; callers
    /// check for success (`0`) before reaching for this conversion.
    pub fn from_code(code: i32) -> Error {
        match code {
            x if x == WaterCode::InvalidArgument as i32 => {
                Error::InvalidArgument("guest reported invalid argument".into())
            }
            x if x == WaterCode::InvalidConfig as i32 => {
                Error::InvalidConfig("guest rejected its configuration".into())
            }
            x if x == WaterCode::InvalidFd as i32 => Error::InvalidFd(code),
            x if x == WaterCode::InvalidFunction as i32 => {
                Error::InvalidFunction("guest export not implemented".into())
            }
            x if x == WaterCode::DoubleInit as i32 => Error::DoubleInit,
            x if x == WaterCode::FailedIo as i32 => {
                Error::General("guest reported a downstream I/O failure".into())
            }
            x if x == WaterCode::NotInitialized as i32 => Error::NotInitialized,
            x if x == WaterCode::AddressDenied as i32 => {
                Error::AddressDenied("guest-requested address denied".into())
            }
            x if x == WaterCode::NoSuchDevice as i32 => {
                Error::NoSuchDevice("capability not linked for this module")
            }
            x if x == WaterCode::Cancelled as i32 => Error::Cancelled,
            _ => Error::General(format!("guest returned unrecognized error code {code}")),
        }
    }
}

/// Maps a host-side [`Error`] onto the negative `i32` WATER wire code
/// handed back to the guest across an import call. Unknown/host-internal
/// variants collapse to [`WaterCode::GeneralError`].
pub fn water_error_code(err: &Error) -> i32 {
    use WaterCode::*;
    let code = match err {
        Error::General(_) => GeneralError,
        Error::InvalidArgument(_) => InvalidArgument,
        Error::InvalidConfig(_) => InvalidConfig,
        Error::InvalidFd(_) => InvalidFd,
        Error::InvalidFunction(_) => InvalidFunction,
        Error::DoubleInit => DoubleInit,
        Error::FailedIo(_) => FailedIo,
        Error::NotInitialized => NotInitialized,
        Error::AddressDenied(_) => AddressDenied,
        Error::NoSuchDevice(_) => NoSuchDevice,
        Error::Cancelled => Cancelled,
        Error::GuestTrap(_) | Error::Wasm(_) | Error::InvalidModule(_) | Error::AlreadyClosed => {
            GeneralError
        }
    };
    code as i32
}

/// The wire-level WATER error taxonomy (section 7 of the transport
/// specification). Values are negative so a guest can distinguish a
/// successful FD (`> 0`) from an error with a single sign check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WaterCode {
    GeneralError = -1,
    InvalidArgument = -2,
    InvalidConfig = -3,
    InvalidFd = -4,
    InvalidFunction = -5,
    DoubleInit = -6,
    FailedIo = -7,
    NotInitialized = -8,
    AddressDenied = -9,
    NoSuchDevice = -10,
    Cancelled = -11,
}

impl fmt::Display for WaterCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_codes_round_trip_through_sign_check() {
        assert!((WaterCode::GeneralError as i32) < 0);
        assert!((WaterCode::Cancelled as i32) < 0);
    }

    #[test]
    fn from_code_inverts_water_error_code_for_cancelled() {
        let code = water_error_code(&Error::Cancelled);
        assert!(matches!(Error::from_code(code), Error::Cancelled));
    }

    #[test]
    fn water_error_code_maps_known_variants() {
        assert_eq!(
            water_error_code(&Error::AddressDenied("x".into())),
            WaterCode::AddressDenied as i32
        );
        assert_eq!(water_error_code(&Error::DoubleInit), WaterCode::DoubleInit as i32);
        assert_eq!(
            water_error_code(&Error::GuestTrap("boom".into())),
            WaterCode::GeneralError as i32
        );
    }
}
