//! Scripted byte streams for tests. Never compiled into the daemon.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::Result;
use crate::port::PortInfo;
use crate::stream::{ByteStream, StreamEvent, StreamOpener};

/// What the fake modem does when a scripted command arrives.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Push these bytes back as the response.
    Data(Vec<u8>),
    /// Say nothing (drives timeouts).
    Silent,
    /// Report the port as disconnected.
    Disconnect,
}

impl Reply {
    pub fn data(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }
}

/// Maps written payloads to replies. A key scripted with several replies
/// answers them in order and repeats the last one; unscripted payloads get
/// the default reply (`Silent` unless overridden).
#[derive(Debug, Clone, Default)]
pub struct Script {
    replies: HashMap<String, Vec<Reply>>,
    fallback: Option<Reply>,
}

impl Script {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on(mut self, written: &str, reply: Reply) -> Self {
        self.replies.entry(written.to_string()).or_default().push(reply);
        self
    }

    #[must_use]
    pub fn fallback(mut self, reply: Reply) -> Self {
        self.fallback = Some(reply);
        self
    }
}

/// Scripted [`ByteStream`]: every write is logged and answered per script.
pub struct FakeStream {
    script: Script,
    counters: HashMap<String, usize>,
    tx: mpsc::Sender<StreamEvent>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: bool,
}

impl FakeStream {
    pub fn new(script: Script) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                script,
                counters: HashMap::new(),
                tx,
                writes: Arc::new(Mutex::new(Vec::new())),
                closed: false,
            },
            rx,
        )
    }

    /// Shared log of everything written to the stream, in order.
    #[must_use]
    pub fn write_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.writes)
    }

    fn reply_for(&mut self, written: &str) -> Option<Reply> {
        if let Some(seq) = self.script.replies.get(written) {
            let idx = self.counters.entry(written.to_string()).or_insert(0);
            let reply = seq.get(*idx).or_else(|| seq.last()).cloned();
            *idx += 1;
            return reply;
        }
        self.script.fallback.clone()
    }
}

impl ByteStream for FakeStream {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writes.lock().unwrap().push(bytes.to_vec());
        let written = String::from_utf8_lossy(bytes).to_string();
        match self.reply_for(&written) {
            Some(Reply::Data(data)) => {
                let _ = self.tx.try_send(StreamEvent::Data(data));
            }
            Some(Reply::Disconnect) => {
                let _ = self.tx.try_send(StreamEvent::Disconnected);
            }
            Some(Reply::Silent) | None => {}
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// [`StreamOpener`] handing out [`FakeStream`]s keyed by port name.
#[derive(Default)]
pub struct FakeOpener {
    scripts: Mutex<HashMap<String, Script>>,
    opened: Mutex<Vec<String>>,
}

impl FakeOpener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, port_name: &str, script: Script) {
        self.scripts.lock().unwrap().insert(port_name.to_string(), script);
    }

    /// Port names opened so far, in order.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl StreamOpener for FakeOpener {
    fn open(&self, port: &PortInfo) -> Result<(Box<dyn ByteStream>, mpsc::Receiver<StreamEvent>)> {
        self.opened.lock().unwrap().push(port.name.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&port.name)
            .cloned()
            .unwrap_or_default();
        let (stream, rx) = FakeStream::new(script);
        Ok((Box::new(stream), rx))
    }
}
