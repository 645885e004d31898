//! Hotplug event normalization.
//!
//! Raw kernel hotplug records arrive one interface at a time, but a
//! multi-interface USB modem announces its ports over tens of milliseconds.
//! The device bus groups records by parent-device path and holds each group
//! open for a settle window before dispatching, so the plugin vote sees the
//! whole candidate at once. Removals dispatch immediately.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::port::{PortInfo, Subsystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HotplugAction {
    Add,
    Remove,
    Change,
}

/// One raw hotplug record, as produced by the udev helper.
#[derive(Debug, Clone, Deserialize)]
pub struct HotplugEvent {
    pub action: HotplugAction,
    pub subsystem: String,
    /// Stable kernel name (`ttyUSB0`, `wwan0`).
    pub name: String,
    /// Parent device path; groups sibling interfaces.
    pub parent: String,
    #[serde(default)]
    pub vid: u16,
    #[serde(default)]
    pub pid: u16,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub devfile: Option<String>,
}

/// Normalized device-bus output consumed by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A physical device's interfaces stopped arriving; here is the batch.
    PortsSettled { device: String, ports: Vec<PortInfo> },
    /// An interface disappeared. Dispatched without debounce.
    PortRemoved { device: String, port_key: String },
}

/// Depth of the output channel toward the manager.
const DEVICE_EVENT_DEPTH: usize = 64;

struct PendingGroup {
    ports: Vec<PortInfo>,
    deadline: Instant,
}

/// Spawn the grouping actor. Feed raw records into `events`; consume
/// [`DeviceEvent`]s from the returned receiver.
pub fn spawn(
    mut events: mpsc::Receiver<HotplugEvent>,
    settle: Duration,
) -> mpsc::Receiver<DeviceEvent> {
    let (tx, rx) = mpsc::channel(DEVICE_EVENT_DEPTH);
    tokio::spawn(async move {
        let mut pending: HashMap<String, PendingGroup> = HashMap::new();
        loop {
            let next_deadline = pending.values().map(|g| g.deadline).min();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => handle_event(event, settle, &mut pending, &tx).await,
                    None => break,
                },
                () = async { tokio::time::sleep_until(next_deadline.unwrap()).await },
                    if next_deadline.is_some() =>
                {
                    flush_due(&mut pending, &tx).await;
                }
            }
        }
        // Input gone — dispatch whatever is still pending, then stop.
        for (device, group) in pending.drain() {
            let _ = tx
                .send(DeviceEvent::PortsSettled {
                    device,
                    ports: group.ports,
                })
                .await;
        }
        debug!("device bus stopped");
    });
    rx
}

async fn handle_event(
    event: HotplugEvent,
    settle: Duration,
    pending: &mut HashMap<String, PendingGroup>,
    tx: &mpsc::Sender<DeviceEvent>,
) {
    let subsystem = match event.subsystem.as_str() {
        "tty" => Subsystem::Tty,
        "net" => Subsystem::Net,
        other => {
            trace!("ignoring {other} subsystem event for {}", event.name);
            return;
        }
    };
    let port = PortInfo {
        name: event.name,
        subsystem,
        parent: event.parent,
        vid: event.vid,
        pid: event.pid,
        driver: event.driver,
        devfile: event.devfile,
    };

    match event.action {
        HotplugAction::Add | HotplugAction::Change => {
            debug!("({}) {} {:?}", port.parent, port.key(), event.action);
            let group = pending.entry(port.parent.clone()).or_insert_with(|| PendingGroup {
                ports: Vec::new(),
                deadline: Instant::now() + settle,
            });
            // Every sibling extends the window; re-announcements replace.
            group.deadline = Instant::now() + settle;
            group.ports.retain(|p| p.key() != port.key());
            group.ports.push(port);
        }
        HotplugAction::Remove => {
            debug!("({}) {} removed", port.parent, port.key());
            if let Some(group) = pending.get_mut(&port.parent) {
                group.ports.retain(|p| p.key() != port.key());
                if group.ports.is_empty() {
                    pending.remove(&port.parent);
                }
            }
            let _ = tx
                .send(DeviceEvent::PortRemoved {
                    device: port.parent.clone(),
                    port_key: port.key(),
                })
                .await;
        }
    }
}

async fn flush_due(pending: &mut HashMap<String, PendingGroup>, tx: &mpsc::Sender<DeviceEvent>) {
    let now = Instant::now();
    let due: Vec<String> = pending
        .iter()
        .filter(|(_, g)| g.deadline <= now)
        .map(|(device, _)| device.clone())
        .collect();
    for device in due {
        if let Some(group) = pending.remove(&device) {
            debug!("({device}) settled with {} port(s)", group.ports.len());
            let _ = tx
                .send(DeviceEvent::PortsSettled {
                    device,
                    ports: group.ports,
                })
                .await;
        }
    }
}
