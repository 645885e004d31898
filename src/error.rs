//! Error taxonomy shared by every component.
//!
//! The set is closed on purpose: the external surface maps each variant
//! one-to-one onto a bus error, so adding a variant is an interface change.

use thiserror::Error;

/// Errors produced by ports, queues, probing, plugins, and modem lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    /// Descriptor-level failure on a port (open, read, write, termios).
    #[error("I/O error: {0}")]
    Io(String),

    /// A command had no completing response within its timeout.
    #[error("command timed out")]
    Timeout,

    /// The request was cancelled before completion.
    #[error("cancelled")]
    Cancelled,

    /// The modem returned an explicit error result code.
    #[error("modem rejected command: {0}")]
    ProtocolReject(String),

    /// No plugin supports the port, or its probe level was 0.
    #[error("unsupported port {0}")]
    UnsupportedPort(String),

    /// Role assembly found neither a primary nor a secondary AT port.
    #[error("failed to find primary port")]
    NoPrimary,

    /// The SIM requires an unlock code before the operation can proceed.
    #[error("SIM locked: {0}")]
    SimLocked(String),

    /// The network or SIM denied the request (e.g. registration denied).
    #[error("authorization denied")]
    AuthDenied,

    /// Transient condition; the caller should re-invoke later.
    #[error("not ready, retry later")]
    Retry,

    /// Plugin contract violation (version mismatch, grab without support).
    #[error("plugin mismatch: {0}")]
    PluginMismatch(String),

    /// The operation is not legal in the modem's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Stable identifier used by the bus surface when mapping to bus errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ProtocolReject(_) => "protocol-reject",
            Self::UnsupportedPort(_) => "unsupported-port",
            Self::NoPrimary => "no-primary",
            Self::SimLocked(_) => "sim-locked",
            Self::AuthDenied => "auth-denied",
            Self::Retry => "retry",
            Self::PluginMismatch(_) => "plugin-mismatch",
            Self::InvalidState(_) => "invalid-state",
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
