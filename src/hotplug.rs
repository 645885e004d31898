//! Hotplug record ingestion.
//!
//! Kernel uevent plumbing stays outside the daemon: a udev helper rule
//! writes one JSON object per line, either to our stdin or to a named
//! pipe. Each line carries the `(action, subsystem, name, parent, vid,
//! pid, driver, devfile)` tuple; malformed lines are logged and skipped.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::devicebus::HotplugEvent;

/// Depth of the raw record channel toward the device bus.
const RECORD_CHANNEL_DEPTH: usize = 64;

/// Spawn the reader for `source` (`-` = stdin, otherwise a path, typically
/// a FIFO). The returned receiver feeds [`crate::devicebus::spawn`].
pub fn spawn(source: String) -> mpsc::Receiver<HotplugEvent> {
    let (tx, rx) = mpsc::channel(RECORD_CHANNEL_DEPTH);
    tokio::spawn(async move {
        if source == "-" {
            info!("reading hotplug records from stdin");
            pump(BufReader::new(tokio::io::stdin()), tx).await;
        } else {
            match tokio::fs::File::open(&source).await {
                Ok(file) => {
                    info!("reading hotplug records from {source}");
                    pump(BufReader::new(file), tx).await;
                }
                Err(e) => warn!("cannot open hotplug source {source}: {e}"),
            }
        }
        info!("hotplug source closed");
    });
    rx
}

async fn pump<R: AsyncBufRead + Unpin>(reader: R, tx: mpsc::Sender<HotplugEvent>) {
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match serde_json::from_str::<HotplugEvent>(line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("malformed hotplug record ({e}): {line}"),
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("hotplug read error: {e}");
                return;
            }
        }
    }
}
