//! Serialized command queue over a port byte stream.
//!
//! One queue owns one stream. Commands are submitted through an `mpsc`
//! channel and answered via `oneshot`, so at most one command is ever in
//! flight on the wire and responses resolve in request order. Each request
//! carries its own timeout and an optional cache key; a run of consecutive
//! timeouts is reported so the owning modem can declare the port
//! unresponsive.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::port::{self, at_response_complete, qcdm_response_complete};
use crate::stream::{ByteStream, StreamEvent};

/// Depth of the request channel; submitters wait when it is full.
const REQUEST_CHANNEL_DEPTH: usize = 32;

/// How long a cancelled in-flight command keeps draining its response so
/// stale bytes don't bleed into the next command.
const SWALLOW_GRACE: Duration = Duration::from_millis(500);

/// How responses are delimited on this port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Line-delimited AT dialogue ending in a final result code.
    At,
    /// HDLC-framed diagnostic protocol ending in 0x7E.
    Qcdm,
}

impl Framing {
    fn complete(self, buf: &[u8]) -> bool {
        match self {
            Self::At => at_response_complete(&String::from_utf8_lossy(buf)),
            Self::Qcdm => qcdm_response_complete(buf),
        }
    }

    /// Whether a completed response should populate the cache.
    fn cacheable(self, buf: &[u8]) -> bool {
        match self {
            Self::At => port::at_response_payload(&String::from_utf8_lossy(buf)).is_ok(),
            Self::Qcdm => true,
        }
    }
}

/// Out-of-band events the owning modem listens for.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// The consecutive-timeout counter reached the configured threshold.
    Unresponsive { consecutive: u32 },
    /// Bytes arrived while no command was in flight.
    Unsolicited(Vec<u8>),
    /// The underlying stream reported EOF or an I/O error.
    Disconnected,
}

/// Tuning for a queue instance.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Port name for logging.
    pub device: String,
    /// Consecutive-timeout threshold for the unresponsive signal. 0 disables.
    pub max_timeouts: u32,
    /// Timeout applied when the caller does not specify one.
    pub default_timeout: Duration,
}

struct Request {
    payload: Vec<u8>,
    timeout: Duration,
    cache_key: Option<String>,
    token: CancellationToken,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

/// Cloneable handle to a command queue. Dropping all handles (or cancelling
/// the queue token) tears the actor down and closes the stream.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Request>,
    cancel: CancellationToken,
    default_timeout: Duration,
    device: String,
}

impl CommandQueue {
    /// Spawn the queue actor over an open stream.
    pub fn spawn(
        stream: Box<dyn ByteStream>,
        stream_rx: mpsc::Receiver<StreamEvent>,
        framing: Framing,
        options: QueueOptions,
        events: mpsc::Sender<QueueEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_DEPTH);
        let cancel = CancellationToken::new();
        let handle = Self {
            tx,
            cancel: cancel.clone(),
            default_timeout: options.default_timeout,
            device: options.device.clone(),
        };
        tokio::spawn(run_queue(stream, stream_rx, rx, framing, options, events, cancel));
        handle
    }

    /// Send an AT command with the default timeout.
    pub async fn command(&self, cmd: &str) -> Result<String> {
        self.at_submit(cmd, self.default_timeout, None, CancellationToken::new())
            .await
    }

    /// Send an AT command with a custom timeout.
    pub async fn command_with_timeout(&self, cmd: &str, timeout: Duration) -> Result<String> {
        self.at_submit(cmd, timeout, None, CancellationToken::new()).await
    }

    /// Send an AT command whose successful response is memoized under the
    /// command string; repeats are answered from the cache without
    /// transmission.
    pub async fn command_cached(&self, cmd: &str) -> Result<String> {
        self.at_submit(
            cmd,
            self.default_timeout,
            Some(cmd.to_string()),
            CancellationToken::new(),
        )
        .await
    }

    /// Send an AT command tied to a caller-scoped cancellation token.
    pub async fn command_cancellable(
        &self,
        cmd: &str,
        timeout: Duration,
        token: CancellationToken,
    ) -> Result<String> {
        self.at_submit(cmd, timeout, None, token).await
    }

    /// Send a pre-framed binary payload (diagnostic ports).
    pub async fn raw(&self, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        self.submit(payload, timeout, None, CancellationToken::new()).await
    }

    /// Cancel every pending and in-flight request and stop the actor.
    /// Submissions made after this point fail with `Cancelled`.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Port name this queue serves.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    async fn at_submit(
        &self,
        cmd: &str,
        timeout: Duration,
        cache_key: Option<String>,
        token: CancellationToken,
    ) -> Result<String> {
        let bytes = self.submit(port::frame_at(cmd), timeout, cache_key, token).await?;
        port::at_response_payload(&String::from_utf8_lossy(&bytes))
    }

    async fn submit(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
        cache_key: Option<String>,
        token: CancellationToken,
    ) -> Result<Vec<u8>> {
        // Checked before touching the channel so a cancelled queue rejects
        // deterministically, without racing the actor's shutdown.
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = Request {
            payload,
            timeout,
            cache_key,
            token,
            reply: reply_tx,
        };
        // A send failure means the actor exited, which only happens on
        // cancellation or teardown.
        self.tx.send(req).await.map_err(|_| Error::Cancelled)?;
        reply_rx
            .await
            .map_err(|_| Error::Cancelled)?
    }
}

enum Outcome {
    Response(Vec<u8>),
    Timeout,
    Cancelled,
    Disconnected,
    QueueStopped,
}

#[allow(clippy::too_many_lines)]
async fn run_queue(
    mut stream: Box<dyn ByteStream>,
    mut stream_rx: mpsc::Receiver<StreamEvent>,
    mut requests: mpsc::Receiver<Request>,
    framing: Framing,
    options: QueueOptions,
    events: mpsc::Sender<QueueEvent>,
    cancel: CancellationToken,
) {
    let device = options.device;
    let mut cache: HashMap<String, Vec<u8>> = HashMap::new();
    let mut consecutive_timeouts: u32 = 0;
    let mut disconnected = false;

    loop {
        // Idle: wait for the next request, surfacing unsolicited data.
        let req = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = requests.recv() => match maybe {
                Some(req) => req,
                None => break,
            },
            ev = stream_rx.recv(), if !disconnected => {
                match ev {
                    Some(StreamEvent::Data(bytes)) => {
                        let _ = events.try_send(QueueEvent::Unsolicited(bytes));
                    }
                    Some(StreamEvent::Disconnected) | None => {
                        disconnected = true;
                        let _ = events.try_send(QueueEvent::Disconnected);
                    }
                }
                continue;
            }
        };

        // `select!` picks ready branches in arbitrary order, so a request
        // can be popped after the queue token fired; it must never reach
        // the wire.
        if cancel.is_cancelled() {
            let _ = req.reply.send(Err(Error::Cancelled));
            break;
        }
        if req.token.is_cancelled() {
            let _ = req.reply.send(Err(Error::Cancelled));
            continue;
        }
        if disconnected {
            let _ = req.reply.send(Err(Error::Io(format!("{device}: port disconnected"))));
            continue;
        }

        if let Some(key) = &req.cache_key {
            if let Some(hit) = cache.get(key) {
                let _ = req.reply.send(Ok(hit.clone()));
                continue;
            }
        }

        // Discard residue from earlier traffic before transmitting.
        while let Ok(ev) = stream_rx.try_recv() {
            if ev == StreamEvent::Disconnected {
                disconnected = true;
            }
        }
        if disconnected {
            let _ = events.try_send(QueueEvent::Disconnected);
            let _ = req.reply.send(Err(Error::Io(format!("{device}: port disconnected"))));
            continue;
        }

        if let Err(e) = stream.write(&req.payload) {
            warn!("Queue {device}: write failed: {e}");
            let _ = req.reply.send(Err(e));
            continue;
        }

        let deadline = Instant::now() + req.timeout;
        let mut buf: Vec<u8> = Vec::with_capacity(256);
        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Outcome::QueueStopped,
                _ = req.token.cancelled() => break Outcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break Outcome::Timeout,
                ev = stream_rx.recv() => match ev {
                    Some(StreamEvent::Data(bytes)) => {
                        buf.extend_from_slice(&bytes);
                        if framing.complete(&buf) {
                            break Outcome::Response(buf);
                        }
                    }
                    Some(StreamEvent::Disconnected) | None => break Outcome::Disconnected,
                },
            }
        };

        match outcome {
            Outcome::Response(bytes) => {
                consecutive_timeouts = 0;
                if let Some(key) = req.cache_key {
                    if framing.cacheable(&bytes) {
                        cache.insert(key, bytes.clone());
                    }
                }
                let _ = req.reply.send(Ok(bytes));
            }
            Outcome::Timeout => {
                consecutive_timeouts += 1;
                debug!(
                    "Queue {device}: timeout after {:.1}s ({consecutive_timeouts} consecutive)",
                    req.timeout.as_secs_f64()
                );
                if options.max_timeouts > 0 && consecutive_timeouts >= options.max_timeouts {
                    let _ = events.try_send(QueueEvent::Unresponsive {
                        consecutive: consecutive_timeouts,
                    });
                }
                let _ = req.reply.send(Err(Error::Timeout));
            }
            Outcome::Cancelled => {
                let _ = req.reply.send(Err(Error::Cancelled));
                // Best-effort: swallow the response still owed by the modem
                // so it is not matched against the next command.
                swallow_response(&mut stream_rx, framing, &mut disconnected).await;
            }
            Outcome::Disconnected => {
                disconnected = true;
                let _ = events.try_send(QueueEvent::Disconnected);
                let _ = req.reply.send(Err(Error::Io(format!("{device}: port disconnected"))));
            }
            Outcome::QueueStopped => {
                let _ = req.reply.send(Err(Error::Cancelled));
                break;
            }
        }
    }

    // Resolve anything still queued, then release the descriptor.
    requests.close();
    while let Ok(req) = requests.try_recv() {
        let _ = req.reply.send(Err(Error::Cancelled));
    }
    stream.close();
    debug!("Queue {device}: stopped");
}

async fn swallow_response(
    stream_rx: &mut mpsc::Receiver<StreamEvent>,
    framing: Framing,
    disconnected: &mut bool,
) {
    let deadline = Instant::now() + SWALLOW_GRACE;
    let mut buf: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return,
            ev = stream_rx.recv() => match ev {
                Some(StreamEvent::Data(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    if framing.complete(&buf) {
                        return;
                    }
                }
                Some(StreamEvent::Disconnected) | None => {
                    *disconnected = true;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeStream, Reply, Script};

    fn options(max_timeouts: u32) -> QueueOptions {
        QueueOptions {
            device: "ttyTEST0".into(),
            max_timeouts,
            default_timeout: Duration::from_millis(200),
        }
    }

    fn spawn_with_script(script: Script, max_timeouts: u32) -> (CommandQueue, mpsc::Receiver<QueueEvent>) {
        let (stream, rx) = FakeStream::new(script);
        let (ev_tx, ev_rx) = mpsc::channel(16);
        let queue = CommandQueue::spawn(Box::new(stream), rx, Framing::At, options(max_timeouts), ev_tx);
        (queue, ev_rx)
    }

    #[tokio::test]
    async fn test_command_roundtrip() {
        let script = Script::new().on("AT+GMM\r", Reply::data("E362\r\nOK\r\n"));
        let (queue, _ev) = spawn_with_script(script, 0);
        assert_eq!(queue.command("+GMM").await.unwrap(), "E362");
    }

    #[tokio::test]
    async fn test_protocol_reject() {
        let script = Script::new().on("AT+CPIN?\r", Reply::data("+CME ERROR: 11\r\n"));
        let (queue, _ev) = spawn_with_script(script, 0);
        let err = queue.command("+CPIN?").await.unwrap_err();
        assert!(matches!(err, Error::ProtocolReject(_)));
    }

    #[tokio::test]
    async fn test_timeout_and_watchdog() {
        let script = Script::new().fallback(Reply::Silent);
        let (queue, mut ev) = spawn_with_script(script, 3);
        for _ in 0..2 {
            assert!(matches!(
                queue.command_with_timeout("+CSQ", Duration::from_millis(20)).await,
                Err(Error::Timeout)
            ));
        }
        assert!(ev.try_recv().is_err(), "no event below the threshold");
        assert!(matches!(
            queue.command_with_timeout("+CSQ", Duration::from_millis(20)).await,
            Err(Error::Timeout)
        ));
        match ev.recv().await {
            Some(QueueEvent::Unresponsive { consecutive }) => assert_eq!(consecutive, 3),
            other => panic!("expected unresponsive event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_resets_watchdog() {
        let script = Script::new()
            .on("AT+GMM\r", Reply::data("E362\r\nOK\r\n"))
            .fallback(Reply::Silent);
        let (queue, mut ev) = spawn_with_script(script, 2);
        let _ = queue.command_with_timeout("+CSQ", Duration::from_millis(20)).await;
        queue.command("+GMM").await.unwrap();
        let _ = queue.command_with_timeout("+CSQ", Duration::from_millis(20)).await;
        // One timeout after a success — still below the threshold of 2.
        assert!(ev.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cache_suppresses_retransmission() {
        let script = Script::new().on("AT+GMI\r", Reply::data("Novatel\r\nOK\r\n"));
        let (stream, rx) = FakeStream::new(script);
        let writes = stream.write_log();
        let (ev_tx, _ev_rx) = mpsc::channel(16);
        let queue =
            CommandQueue::spawn(Box::new(stream), rx, Framing::At, options(0), ev_tx);

        assert_eq!(queue.command_cached("+GMI").await.unwrap(), "Novatel");
        assert_eq!(queue.command_cached("+GMI").await.unwrap(), "Novatel");
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let script = Script::new().fallback(Reply::Silent);
        let (queue, _ev) = spawn_with_script(script, 0);
        let token = CancellationToken::new();
        let pending = queue.command_cancellable("+COPS?", Duration::from_secs(5), token.clone());
        tokio::pin!(pending);
        tokio::select! {
            _ = &mut pending => panic!("should not complete"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => token.cancel(),
        }
        assert!(matches!(pending.await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_all_rejects_new_commands() {
        let script = Script::new().on("AT+GMM\r", Reply::data("E362\r\nOK\r\n"));
        let (stream, rx) = FakeStream::new(script);
        let writes = stream.write_log();
        let (ev_tx, _ev_rx) = mpsc::channel(16);
        let queue =
            CommandQueue::spawn(Box::new(stream), rx, Framing::At, options(0), ev_tx);

        queue.command("+GMM").await.unwrap();
        queue.cancel_all();
        assert!(matches!(queue.command("+GMM").await, Err(Error::Cancelled)));
        // The rejected command never touched the stream.
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_fails_command() {
        let script = Script::new().on("AT\r", Reply::Disconnect);
        let (queue, mut ev) = spawn_with_script(script, 0);
        assert!(matches!(queue.command("").await, Err(Error::Io(_))));
        assert!(matches!(ev.recv().await, Some(QueueEvent::Disconnected)));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let script = Script::new()
            .on("AT1\r", Reply::data("first\r\nOK\r\n"))
            .on("AT2\r", Reply::data("second\r\nOK\r\n"));
        let (queue, _ev) = spawn_with_script(script, 0);
        let (a, b) = tokio::join!(queue.command("1"), queue.command("2"));
        assert_eq!(a.unwrap(), "first");
        assert_eq!(b.unwrap(), "second");
    }
}
