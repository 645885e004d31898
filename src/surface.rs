//! External-surface adapter.
//!
//! The daemon does not speak a bus protocol itself; it emits JSON events on
//! a broadcast channel and accepts commands on an `mpsc` channel. A bus
//! binding subscribes and translates events one-to-one into object-manager
//! signals (`InterfacesAdded`/`Removed`, `StateChanged`,
//! `PropertiesChanged`) and feeds method calls back as [`SurfaceCommand`]s.

use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, oneshot};
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::error::{Error, Result};
use crate::modem::{ModemState, StateReason};

/// Interface name used in `PropertiesChanged` events.
pub const MODEM_INTERFACE: &str = "org.modemd.Modem";

/// Object path prefix; each modem gets `<prefix>/<index>`.
const MODEM_PATH_PREFIX: &str = "/org/modemd/Modem";

/// Depth of the event broadcast channel.
const EVENT_CHANNEL_DEPTH: usize = 256;

/// Stable object path for a modem index.
#[must_use]
pub fn modem_path(index: u32) -> String {
    format!("{MODEM_PATH_PREFIX}/{index}")
}

/// Runtime-reloadable log filter handle, installed by `main`.
pub type LogReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Logging levels accepted by `SetLogging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Err,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ERR" => Ok(Self::Err),
            "WARN" => Ok(Self::Warn),
            "INFO" => Ok(Self::Info),
            "DEBUG" => Ok(Self::Debug),
            other => Err(Error::InvalidState(format!("unknown log level {other:?}"))),
        }
    }

    /// tracing filter directive for this level.
    #[must_use]
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Err => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

/// Method calls arriving from the bus binding.
pub enum SurfaceCommand {
    /// Re-trigger discovery; replies with the exported object paths.
    ScanDevices {
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Change the daemon log level at runtime.
    SetLogging {
        level: LogLevel,
        reply: oneshot::Sender<Result<()>>,
    },
    Enable {
        path: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disable {
        path: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        path: String,
        apn: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        path: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable emitter for surface events.
#[derive(Clone)]
pub struct SurfaceHandle {
    tx: broadcast::Sender<Value>,
}

impl SurfaceHandle {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    fn emit(&self, event: Value) {
        // No subscribers is fine — the binding may not be attached yet.
        let _ = self.tx.send(event);
    }

    /// A modem object appeared with its initial property set.
    pub fn modem_added(&self, path: &str, properties: Map<String, Value>) {
        self.emit(json!({
            "type": "modem.added",
            "path": path,
            "interface": MODEM_INTERFACE,
            "properties": properties,
        }));
    }

    /// A modem object was withdrawn.
    pub fn modem_removed(&self, path: &str) {
        self.emit(json!({
            "type": "modem.removed",
            "path": path,
        }));
    }

    pub fn state_changed(&self, path: &str, old: ModemState, new: ModemState, reason: StateReason) {
        self.emit(json!({
            "type": "modem.state_changed",
            "path": path,
            "old": old.as_str(),
            "new": new.as_str(),
            "reason": reason.as_str(),
        }));
    }

    pub fn properties_changed(
        &self,
        path: &str,
        changed: Map<String, Value>,
        invalidated: &[&str],
    ) {
        self.emit(json!({
            "type": "modem.properties_changed",
            "path": path,
            "interface": MODEM_INTERFACE,
            "changed": changed,
            "invalidated": invalidated,
        }));
    }
}

impl Default for SurfaceHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a `SetLogging` request to the reload handle.
pub fn apply_log_level(handle: &LogReloadHandle, level: LogLevel) -> Result<()> {
    handle
        .reload(EnvFilter::new(level.as_filter()))
        .map_err(|e| Error::InvalidState(format!("log reload failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modem_path() {
        assert_eq!(modem_path(0), "/org/modemd/Modem/0");
        assert_eq!(modem_path(12), "/org/modemd/Modem/12");
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::parse("err").unwrap(), LogLevel::Err);
        assert!(LogLevel::parse("TRACE").is_err());
    }

    #[tokio::test]
    async fn test_events_reach_subscriber() {
        let surface = SurfaceHandle::new();
        let mut rx = surface.subscribe();
        surface.modem_removed("/org/modemd/Modem/3");
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev["type"], "modem.removed");
        assert_eq!(ev["path"], "/org/modemd/Modem/3");
    }
}
