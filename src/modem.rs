//! The modem object: owned ports, role assembly, lifecycle state machine,
//! identity collection, and the polled data tied to lifecycle state.
//!
//! A modem is identified by its physical-device path. Ports reference it
//! only through that path — escalations from port-level events travel over
//! a channel to the manager, never through a direct back-pointer held
//! across a suspension point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::plugin::{Unsolicited, VendorHooks};
use crate::poll::{PollOutcome, PollScheduler, PollSpec};
use crate::port::{strip_tag, AtPortFlags, PortInfo, PortKind};
use crate::queue::{CommandQueue, Framing, QueueEvent, QueueOptions};
use crate::stream::StreamOpener;
use crate::surface::SurfaceHandle;

/// Sentinel for modems that cannot report unlock retry counts.
pub const UNLOCK_RETRIES_NOT_SUPPORTED: u32 = u32::MAX;

/// Runtime lifecycle state. Ordered: comparisons like
/// `state >= Registered` express "at least registered".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModemState {
    Unknown,
    Disabled,
    Disabling,
    Enabling,
    Enabled,
    Searching,
    Registered,
    Connecting,
    Connected,
}

impl ModemState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Disabled => "disabled",
            Self::Disabling => "disabling",
            Self::Enabling => "enabling",
            Self::Enabled => "enabled",
            Self::Searching => "searching",
            Self::Registered => "registered",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Why a state transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateReason {
    None,
    UserRequested,
    Unresponsive,
    PortLost,
}

impl StateReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::UserRequested => "user-requested",
            Self::Unresponsive => "unresponsive",
            Self::PortLost => "port-lost",
        }
    }
}

/// Legal transitions. Any state may fall to `Disabled` (invalidation and
/// fatal guard failures).
fn transition_allowed(from: ModemState, to: ModemState) -> bool {
    use ModemState::{
        Connected, Connecting, Disabled, Disabling, Enabled, Enabling, Registered, Searching,
    };
    matches!(
        (from, to),
        (_, Disabled)
            | (Disabled, Enabling)
            | (Enabling, Enabled)
            | (Enabled, Searching | Registered)
            | (Searching, Registered)
            | (Registered, Searching | Connecting)
            | (Connecting, Connected | Registered)
            | (Connected, Registered | Searching)
            | (
                Enabling | Enabled | Searching | Registered | Connecting | Connected,
                Disabling
            )
    )
}

/// Network-provided time zone data; any subset may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkTimezone {
    /// Offset from UTC in minutes.
    pub offset: Option<i32>,
    /// Additional daylight-saving offset in minutes.
    pub dst_offset: Option<i32>,
    pub leap_seconds: Option<i32>,
}

impl NetworkTimezone {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offset.is_none() && self.dst_offset.is_none() && self.leap_seconds.is_none()
    }

    fn to_json(self) -> Value {
        let mut map = Map::new();
        if let Some(v) = self.offset {
            map.insert("offset".into(), json!(v));
        }
        if let Some(v) = self.dst_offset {
            map.insert("dst_offset".into(), json!(v));
        }
        if let Some(v) = self.leap_seconds {
            map.insert("leap_seconds".into(), json!(v));
        }
        Value::Object(map)
    }
}

/// Escalations a port event posts toward the manager. Delivery is via
/// channel, so the queue caller that hit the triggering error resolves
/// before the modem reacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// The watchdog counter on one of the modem's queues hit its threshold.
    Unresponsive { device: String },
    /// A port's stream reported EOF or an I/O error.
    PortLost { device: String, port_key: String },
}

/// A port grabbed by the modem.
pub struct ModemPort {
    pub info: PortInfo,
    pub kind: PortKind,
    pub flags: AtPortFlags,
    /// Open command queue; tty ports are opened on first enable.
    queue: Option<CommandQueue>,
}

/// Timing and watchdog knobs, derived from the daemon config.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    pub max_timeouts: u32,
    pub command_timeout: Duration,
    pub registration_interval: Duration,
    pub registration_retries: u32,
    pub timezone_interval: Duration,
    pub timezone_retries: u32,
    pub signal_interval: Duration,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            max_timeouts: 3,
            command_timeout: Duration::from_secs(5),
            registration_interval: Duration::from_secs(1),
            registration_retries: 60,
            timezone_interval: Duration::from_secs(5),
            timezone_retries: 6,
            signal_interval: Duration::from_secs(30),
        }
    }
}

struct ModemInner {
    ports: Vec<ModemPort>,
    primary: Option<String>,
    secondary: Option<String>,
    data: Option<String>,
    qcdm: Option<String>,
    state: ModemState,
    valid: bool,
    manufacturer: Option<String>,
    model: Option<String>,
    revision: Option<String>,
    ati: Option<String>,
    ati1: Option<String>,
    gsn: Option<String>,
    equipment_ident: Option<String>,
    device_ident: Option<String>,
    unlock_required: Option<String>,
    unlock_retries: u32,
    pin_retry_counts: Vec<(String, u32)>,
    timezone: NetworkTimezone,
    signal_quality: Option<u32>,
}

/// Everything needed to assemble a modem.
pub struct ModemParams {
    pub device: String,
    pub plugin: String,
    pub vid: u16,
    pub pid: u16,
    pub driver: String,
    pub index: u32,
    pub hooks: VendorHooks,
    pub opener: Arc<dyn StreamOpener>,
    pub surface: SurfaceHandle,
    pub escalations: mpsc::Sender<Escalation>,
    pub config: ModemConfig,
}

/// One assembled modem. Shared as `Arc<Modem>`; all mutation goes through
/// the inner lock, all observation through the surface and the state watch.
pub struct Modem {
    device: String,
    plugin: String,
    vid: u16,
    pid: u16,
    driver: String,
    path: String,
    hooks: VendorHooks,
    opener: Arc<dyn StreamOpener>,
    surface: SurfaceHandle,
    escalations: mpsc::Sender<Escalation>,
    config: ModemConfig,
    cancel: CancellationToken,
    state_tx: watch::Sender<ModemState>,
    polls: PollScheduler,
    at_ports: AtomicUsize,
    inner: Mutex<ModemInner>,
}

impl Modem {
    #[must_use]
    pub fn new(params: ModemParams) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ModemState::Unknown);
        let cancel = CancellationToken::new();
        let polls = PollScheduler::new(state_rx, cancel.child_token());
        Arc::new(Self {
            device: params.device,
            plugin: params.plugin,
            vid: params.vid,
            pid: params.pid,
            driver: params.driver,
            path: crate::surface::modem_path(params.index),
            hooks: params.hooks,
            opener: params.opener,
            surface: params.surface,
            escalations: params.escalations,
            config: params.config,
            cancel,
            state_tx,
            polls,
            at_ports: AtomicUsize::new(0),
            inner: Mutex::new(ModemInner {
                ports: Vec::new(),
                primary: None,
                secondary: None,
                data: None,
                qcdm: None,
                state: ModemState::Unknown,
                valid: true,
                manufacturer: None,
                model: None,
                revision: None,
                ati: None,
                ati1: None,
                gsn: None,
                equipment_ident: None,
                device_ident: None,
                unlock_required: None,
                unlock_retries: 0,
                pin_retry_counts: Vec::new(),
                timezone: NetworkTimezone::default(),
                signal_quality: None,
            }),
        })
    }

    /// Physical-device path (modem identity).
    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Bus object path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Number of AT ports grabbed so far (used by single-AT plugins).
    #[must_use]
    pub fn at_port_count(&self) -> usize {
        self.at_ports.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn state(&self) -> ModemState {
        *self.state_tx.borrow()
    }

    pub async fn valid(&self) -> bool {
        self.inner.lock().await.valid
    }

    // ── Port ownership ───────────────────────────────────────────────

    /// Take ownership of a classified port. The kind is fixed from here on.
    pub async fn grab_port(
        &self,
        info: PortInfo,
        kind: PortKind,
        flags: AtPortFlags,
    ) -> Result<()> {
        if kind == PortKind::Unknown {
            return Err(Error::UnsupportedPort(info.key()));
        }
        let mut inner = self.inner.lock().await;
        if inner.ports.iter().any(|p| p.info.key() == info.key()) {
            return Err(Error::InvalidState(format!("{} already grabbed", info.key())));
        }
        info!("({}) type {} claimed by {}", info.name, kind.as_str(), self.device);
        if kind == PortKind::At {
            self.at_ports.fetch_add(1, Ordering::SeqCst);
        }
        inner.ports.push(ModemPort {
            info,
            kind,
            flags,
            queue: None,
        });
        Ok(())
    }

    /// Release a removed port, cancelling anything pending on it. Returns
    /// `(was_primary, remaining_supported_ports)`.
    pub async fn release_port(&self, port_key: &str) -> (bool, usize) {
        let mut inner = self.inner.lock().await;
        let Some(idx) = inner.ports.iter().position(|p| p.info.key() == port_key) else {
            return (false, inner.ports.len());
        };
        let port = inner.ports.remove(idx);
        if let Some(queue) = &port.queue {
            queue.cancel_all();
        }
        if port.kind == PortKind::At {
            self.at_ports.fetch_sub(1, Ordering::SeqCst);
        }
        let was_primary = inner.primary.as_deref() == Some(port_key);
        let inner = &mut *inner;
        for role in [
            &mut inner.primary,
            &mut inner.secondary,
            &mut inner.data,
            &mut inner.qcdm,
        ] {
            if role.as_deref() == Some(port_key) {
                *role = None;
            }
        }
        let remaining = inner
            .ports
            .iter()
            .filter(|p| p.kind != PortKind::Ignored)
            .count();
        debug!("({}) released {port_key}, {remaining} supported ports left", self.device);
        (was_primary, remaining)
    }

    /// Apply the role precedence rules to the grabbed ports and record the
    /// primary/secondary/data/diag selection. Flags are recomputed
    /// authoritatively from the selection.
    pub async fn organize_ports(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let mut primary: Option<usize> = None;
        let mut backup_primary: Option<usize> = None;
        let mut secondary: Option<usize> = None;
        let mut backup_secondary: Option<usize> = None;
        let mut data: Option<usize> = None;
        let mut qcdm: Option<usize> = None;

        for (i, port) in inner.ports.iter().enumerate() {
            match port.kind {
                PortKind::At => {
                    let flags = port.flags;
                    if flags.contains(AtPortFlags::PRIMARY) {
                        if primary.is_none() {
                            primary = Some(i);
                        } else if backup_primary.is_none() {
                            // More than one primary and no secondaries —
                            // extra primaries serve as secondary.
                            backup_primary = Some(i);
                        }
                    }

                    if data.is_none() && flags.contains(AtPortFlags::PPP_DATA) {
                        data = Some(i);
                    }

                    // Explicitly flagged secondary ports trump unflagged ones.
                    if flags.contains(AtPortFlags::SECONDARY)
                        && !secondary
                            .is_some_and(|s| inner.ports[s].flags.contains(AtPortFlags::SECONDARY))
                    {
                        secondary = Some(i);
                    }

                    if flags.is_empty() {
                        if secondary.is_none() {
                            secondary = Some(i);
                        } else if backup_secondary.is_none() {
                            backup_secondary = Some(i);
                        }
                    }
                }
                PortKind::Qcdm => {
                    if qcdm.is_none() {
                        qcdm = Some(i);
                    }
                }
                PortKind::Net => {
                    // Net device (if any) is the preferred data port.
                    if data.is_none() || inner.ports[data.unwrap()].kind == PortKind::At {
                        data = Some(i);
                    }
                }
                PortKind::Ignored | PortKind::Unknown => {}
            }
        }

        // Fall back to a secondary port if there is no primary.
        let primary = match primary {
            Some(p) => p,
            None => secondary.take().ok_or(Error::NoPrimary)?,
        };
        let secondary = secondary.or(backup_primary).or(backup_secondary);
        let data = data.unwrap_or(primary);

        // Reset flags from the selection. The data port is cleared first
        // since it may also be the primary or secondary port.
        if inner.ports[data].kind == PortKind::At {
            inner.ports[data].flags = AtPortFlags::empty();
        }
        inner.ports[primary].flags = AtPortFlags::PRIMARY;
        if let Some(s) = secondary {
            inner.ports[s].flags = AtPortFlags::SECONDARY;
        }
        if inner.ports[data].kind == PortKind::At {
            inner.ports[data].flags |= AtPortFlags::PPP_DATA;
        }

        let primary_key = inner.ports[primary].info.key();
        let secondary_key = secondary.map(|s| inner.ports[s].info.key());
        let data_key = inner.ports[data].info.key();
        let qcdm_key = qcdm.map(|q| inner.ports[q].info.key());
        info!(
            "({}) organized ports: primary={} secondary={} data={} qcdm={}",
            self.device,
            primary_key,
            secondary_key.as_deref().unwrap_or("-"),
            data_key,
            qcdm_key.as_deref().unwrap_or("-"),
        );

        inner.primary = Some(primary_key);
        inner.secondary = secondary_key;
        inner.data = Some(data_key);
        inner.qcdm = qcdm_key;
        Ok(())
    }

    /// Mark the assembled modem visible: `unknown → disabled` plus the
    /// object-added event with the initial property set.
    pub async fn export(&self) {
        let props = self.properties().await;
        self.surface.modem_added(&self.path, props);
        if self.state() == ModemState::Unknown {
            let _ = self.set_state(ModemState::Disabled, StateReason::None).await;
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Power the radio on: `disabled → enabling → enabled`, then kick off
    /// identity collection and network search.
    pub async fn enable(self: &Arc<Self>) -> Result<()> {
        if !self.valid().await {
            return Err(Error::InvalidState("modem is invalid".into()));
        }
        if self.state() != ModemState::Disabled {
            return Err(Error::InvalidState(format!(
                "cannot enable from {}",
                self.state().as_str()
            )));
        }
        self.set_state(ModemState::Enabling, StateReason::UserRequested).await?;

        match self.enable_sequence().await {
            Ok(()) => {
                self.set_state(ModemState::Enabled, StateReason::None).await?;
                let modem = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = modem.fetch_card_info().await {
                        warn!("({}) card info failed: {e}", modem.device);
                    }
                });
                self.start_polls();
                self.set_state(ModemState::Searching, StateReason::None).await?;
                Ok(())
            }
            Err(e) => {
                // Fatal guard — fall back to disabled.
                let _ = self.set_state(ModemState::Disabled, StateReason::None).await;
                Err(e)
            }
        }
    }

    async fn enable_sequence(self: &Arc<Self>) -> Result<()> {
        self.open_ports().await?;
        let queue = self.primary_queue().await?;

        for cmd in &self.hooks.init_commands {
            match queue.command(cmd).await {
                Ok(_) => {}
                // Init commands may be unsupported on some firmware.
                Err(Error::ProtocolReject(e)) => {
                    debug!("({}) init {cmd} rejected: {e}", self.device);
                }
                Err(e) => return Err(e),
            }
        }

        match parse_cpin(&queue.command("+CPIN?").await?) {
            CpinStatus::Ready => {
                self.set_unlock_required(None).await;
            }
            CpinStatus::Locked(facility) => {
                self.set_unlock_required(Some(facility.clone())).await;
                return Err(Error::SimLocked(facility));
            }
        }

        queue.command("+CFUN=1").await?;
        Ok(())
    }

    /// Drain and power the radio off: `* → disabling → disabled`.
    pub async fn disable(&self) -> Result<()> {
        if self.state() < ModemState::Enabling {
            return Err(Error::InvalidState(format!(
                "cannot disable from {}",
                self.state().as_str()
            )));
        }
        self.set_state(ModemState::Disabling, StateReason::UserRequested).await?;
        if let Ok(queue) = self.primary_queue().await {
            match queue.command("+CFUN=0").await {
                Ok(_) | Err(Error::ProtocolReject(_)) => {}
                Err(e) => warn!("({}) radio power-down failed: {e}", self.device),
            }
        }
        self.set_state(ModemState::Disabled, StateReason::UserRequested).await
    }

    /// Activate a packet-data context: `registered → connecting → connected`.
    pub async fn connect(&self, apn: &str) -> Result<()> {
        if self.state() != ModemState::Registered {
            return Err(Error::InvalidState(format!(
                "cannot connect from {}",
                self.state().as_str()
            )));
        }
        self.set_state(ModemState::Connecting, StateReason::UserRequested).await?;

        match self.connect_sequence(apn).await {
            Ok(()) => self.set_state(ModemState::Connected, StateReason::None).await,
            Err(e) => {
                // Roll back to the previous stable state.
                let _ = self.set_state(ModemState::Registered, StateReason::None).await;
                Err(e)
            }
        }
    }

    async fn connect_sequence(&self, apn: &str) -> Result<()> {
        let queue = self.primary_queue().await?;
        queue.command(&format!("+CGDCONT=1,\"IP\",\"{apn}\"")).await?;

        let data_is_net = {
            let inner = self.inner.lock().await;
            inner
                .data
                .as_deref()
                .and_then(|key| inner.ports.iter().find(|p| p.info.key() == key))
                .is_some_and(|p| p.kind == PortKind::Net)
        };

        if data_is_net {
            queue.command("+CGACT=1,1").await?;
        } else {
            let resp = queue.command("D*99***1#").await?;
            if !resp.contains("CONNECT") {
                return Err(Error::ProtocolReject(format!("dial answered {resp:?}")));
            }
        }
        Ok(())
    }

    /// Tear down the packet-data context: `connected → registered`.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state() != ModemState::Connected {
            return Err(Error::InvalidState(format!(
                "cannot disconnect from {}",
                self.state().as_str()
            )));
        }
        let queue = self.primary_queue().await?;
        for cmd in &self.hooks.disconnect_commands {
            match queue.command(cmd).await {
                Ok(_) | Err(Error::ProtocolReject(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.set_state(ModemState::Registered, StateReason::UserRequested).await
    }

    /// Force the modem invalid: observers see a synthetic transition to
    /// `disabled`, every task and queue is cancelled, and the object is
    /// ready to be withdrawn.
    pub async fn invalidate(&self, reason: StateReason) {
        {
            let mut inner = self.inner.lock().await;
            if !inner.valid {
                return;
            }
            inner.valid = false;
            let old = inner.state;
            inner.state = ModemState::Disabled;
            self.state_tx.send_replace(ModemState::Disabled);
            self.surface
                .state_changed(&self.path, old, ModemState::Disabled, reason);
            let mut changed = Map::new();
            changed.insert("Valid".into(), json!(false));
            changed.insert("State".into(), json!(ModemState::Disabled.as_str()));
            self.surface.properties_changed(&self.path, changed, &[]);

            for port in &inner.ports {
                if let Some(queue) = &port.queue {
                    queue.cancel_all();
                }
            }
        }
        self.polls.stop_all();
        self.cancel.cancel();
        warn!("({}) invalidated: {}", self.device, reason.as_str());
    }

    /// Guarded state transition with surface notification.
    pub async fn set_state(&self, new: ModemState, reason: StateReason) -> Result<()> {
        let (old, lost_registration) = {
            let mut inner = self.inner.lock().await;
            if inner.state == new {
                return Ok(());
            }
            if !transition_allowed(inner.state, new) {
                return Err(Error::InvalidState(format!(
                    "{} → {}",
                    inner.state.as_str(),
                    new.as_str()
                )));
            }
            let old = inner.state;
            inner.state = new;
            (old, old >= ModemState::Registered && new < ModemState::Registered)
        };
        self.state_tx.send_replace(new);
        debug!(
            "({}) state {} → {} ({})",
            self.device,
            old.as_str(),
            new.as_str(),
            reason.as_str()
        );
        self.surface.state_changed(&self.path, old, new, reason);
        if lost_registration {
            // Network data is meaningless once unregistered.
            self.set_network_timezone(None, None, None).await;
        }
        Ok(())
    }

    // ── Ports and queues ─────────────────────────────────────────────

    async fn open_ports(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let primary_key = inner.primary.clone();
        let mut listeners = Vec::new();
        for port in &mut inner.ports {
            let openable = matches!(port.kind, PortKind::At | PortKind::Qcdm);
            if !openable || port.queue.is_some() {
                continue;
            }
            let framing = if port.kind == PortKind::Qcdm {
                Framing::Qcdm
            } else {
                Framing::At
            };
            let is_primary = primary_key.as_deref() == Some(port.info.key().as_str());
            match self.opener.open(&port.info) {
                Ok((stream, stream_rx)) => {
                    let (ev_tx, ev_rx) = mpsc::channel(16);
                    let queue = CommandQueue::spawn(
                        stream,
                        stream_rx,
                        framing,
                        QueueOptions {
                            device: port.info.name.clone(),
                            max_timeouts: self.config.max_timeouts,
                            default_timeout: self.config.command_timeout,
                        },
                        ev_tx,
                    );
                    listeners.push((port.info.key(), ev_rx));
                    port.queue = Some(queue);
                }
                Err(e) if is_primary => return Err(e),
                Err(e) => warn!("({}) open {} failed: {e}", self.device, port.info.key()),
            }
        }
        drop(inner);
        for (key, ev_rx) in listeners {
            self.spawn_queue_listener(key, ev_rx);
        }
        Ok(())
    }

    async fn primary_queue(&self) -> Result<CommandQueue> {
        let inner = self.inner.lock().await;
        let key = inner.primary.as_deref().ok_or(Error::NoPrimary)?;
        inner
            .ports
            .iter()
            .find(|p| p.info.key() == key)
            .and_then(|p| p.queue.clone())
            .ok_or_else(|| Error::InvalidState("primary port not open".into()))
    }

    /// Forward queue events to the manager by device path. The listener
    /// holds only a weak reference; the modem may die while events are in
    /// flight.
    fn spawn_queue_listener(
        self: &Arc<Self>,
        port_key: String,
        mut rx: mpsc::Receiver<QueueEvent>,
    ) {
        let weak = Arc::downgrade(self);
        let escalations = self.escalations.clone();
        let device = self.device.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    QueueEvent::Unresponsive { consecutive } => {
                        warn!("({device}) {port_key}: {consecutive} consecutive timeouts");
                        let _ = escalations
                            .send(Escalation::Unresponsive {
                                device: device.clone(),
                            })
                            .await;
                    }
                    QueueEvent::Disconnected => {
                        let _ = escalations
                            .send(Escalation::PortLost {
                                device: device.clone(),
                                port_key: port_key.clone(),
                            })
                            .await;
                    }
                    QueueEvent::Unsolicited(bytes) => {
                        if let Some(modem) = weak.upgrade() {
                            modem
                                .handle_unsolicited(&String::from_utf8_lossy(&bytes))
                                .await;
                        }
                    }
                }
            }
        });
    }

    /// Run inbound lines that arrived outside a command through the vendor
    /// hook table.
    pub async fn handle_unsolicited(&self, text: &str) {
        let Some(hook) = &self.hooks.unsolicited else {
            return;
        };
        for line in text.lines() {
            if let Some(Unsolicited::Timezone { offset, dst_offset }) = hook(line) {
                info!("({}) unsolicited timezone report: {offset} min", self.device);
                self.set_network_timezone(Some(offset), dst_offset, None).await;
            }
        }
    }

    // ── Card info ────────────────────────────────────────────────────

    /// Fan out the identity queries and populate manufacturer, model,
    /// revision, and identifiers. Results are cached: a second call does
    /// not touch the hardware again.
    pub async fn fetch_card_info(&self) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.manufacturer.is_some() || inner.model.is_some() || inner.revision.is_some() {
                return Ok(());
            }
        }
        let queue = self.primary_queue().await?;

        // (command, response tag to strip)
        const QUERIES: [(&str, &str); 10] = [
            ("+GMI", "+GMI:"),
            ("+GMM", "+GMM:"),
            ("+GMR", "+GMR:"),
            ("+CGMI", "+CGMI:"),
            ("+CGMM", "+CGMM:"),
            ("+CGMR", "+CGMR:"),
            ("I", ""),
            ("I1", ""),
            ("+GSN", "+GSN:"),
            ("+CGSN", "+CGSN:"),
        ];

        let results = futures::future::join_all(QUERIES.iter().map(|(cmd, tag)| {
            let queue = queue.clone();
            async move {
                match queue.command_cached(cmd).await {
                    Ok(resp) => clean_info_response(&resp, tag),
                    Err(_) => None,
                }
            }
        }))
        .await;

        let mut results = results.into_iter();
        let mut take = move || results.next().flatten();
        let (manf, model, rev) = (take(), take(), take());
        let (c_manf, c_model, c_rev) = (take(), take(), take());
        let (ati, ati1) = (take(), take());
        let (gsn, c_gsn) = (take(), take());

        let mut inner = self.inner.lock().await;
        // Prefer the 3GPP responses over the V.25ter ones.
        inner.manufacturer = c_manf.filter(|s| !s.is_empty()).or(manf);
        inner.model = c_model.filter(|s| !s.is_empty()).or(model);
        inner.revision = c_rev.filter(|s| !s.is_empty()).or(rev);
        inner.ati = ati;
        inner.ati1 = ati1;
        inner.gsn = c_gsn.filter(|s| !s.is_empty()).or(gsn);

        let equipment = inner.gsn.clone();
        if inner.equipment_ident != equipment {
            inner.equipment_ident = equipment;
            match &inner.equipment_ident {
                Some(id) => info!("Modem {}: equipment identifier set ({id})", self.path),
                None => warn!("Modem {}: equipment identifier not set", self.path),
            }
        }

        inner.device_ident = Some(create_device_identifier(
            self.vid,
            self.pid,
            [
                inner.ati.as_deref(),
                inner.ati1.as_deref(),
                inner.gsn.as_deref(),
                inner.revision.as_deref(),
                inner.model.as_deref(),
                inner.manufacturer.as_deref(),
            ],
        ));

        let mut changed = Map::new();
        changed.insert(
            "EquipmentIdentifier".into(),
            json!(inner.equipment_ident.clone().unwrap_or_default()),
        );
        changed.insert(
            "DeviceIdentifier".into(),
            json!(inner.device_ident.clone().unwrap_or_default()),
        );
        drop(inner);
        self.surface.properties_changed(&self.path, changed, &[]);
        Ok(())
    }

    /// Cached identity triple `(manufacturer, model, revision)`.
    pub async fn card_info(&self) -> (Option<String>, Option<String>, Option<String>) {
        let inner = self.inner.lock().await;
        (
            inner.manufacturer.clone(),
            inner.model.clone(),
            inner.revision.clone(),
        )
    }

    pub async fn device_identifier(&self) -> Option<String> {
        self.inner.lock().await.device_ident.clone()
    }

    // ── Polled data and unlock bookkeeping ───────────────────────────

    fn start_polls(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.polls.register(
            PollSpec {
                name: "registration",
                interval: self.config.registration_interval,
                max_retries: self.config.registration_retries,
                once_on_success: true,
            },
            |s| s == ModemState::Searching,
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(modem) => modem.poll_registration().await,
                        None => PollOutcome::Done,
                    }
                }
            },
            || async {},
        );

        let weak = Arc::downgrade(self);
        let weak_exhaust = Arc::downgrade(self);
        self.polls.register(
            PollSpec {
                name: "timezone",
                interval: self.config.timezone_interval,
                max_retries: self.config.timezone_retries,
                once_on_success: true,
            },
            |s| s >= ModemState::Registered,
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(modem) => modem.poll_timezone().await,
                        None => PollOutcome::Done,
                    }
                }
            },
            move || {
                let weak = weak_exhaust.clone();
                async move {
                    if let Some(modem) = weak.upgrade() {
                        // Give up: publish the timezone as unavailable.
                        modem.set_network_timezone(None, None, None).await;
                    }
                }
            },
        );

        let weak = Arc::downgrade(self);
        self.polls.register(
            PollSpec {
                name: "signal",
                interval: self.config.signal_interval,
                // Unbounded: a run of bad +CSQ reads must not end live
                // signal reporting while the modem stays enabled.
                max_retries: 0,
                once_on_success: false,
            },
            |s| s >= ModemState::Enabled,
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(modem) => modem.poll_signal().await,
                        None => PollOutcome::Done,
                    }
                }
            },
            || async {},
        );
    }

    async fn poll_registration(self: Arc<Self>) -> PollOutcome {
        let Ok(queue) = self.primary_queue().await else {
            return PollOutcome::Retry;
        };
        match queue.command("+CREG?").await.map(|r| parse_creg(&r)) {
            Ok(RegStatus::Home | RegStatus::Roaming) => {
                let _ = self.set_state(ModemState::Registered, StateReason::None).await;
                PollOutcome::Done
            }
            Ok(RegStatus::Denied) => {
                warn!("({}) network registration denied", self.device);
                let _ = self.set_state(ModemState::Enabled, StateReason::None).await;
                PollOutcome::Done
            }
            Ok(RegStatus::Searching | RegStatus::Idle) | Err(_) => PollOutcome::Retry,
        }
    }

    async fn poll_timezone(self: Arc<Self>) -> PollOutcome {
        let Ok(queue) = self.primary_queue().await else {
            return PollOutcome::Retry;
        };
        match queue.command("+CCLK?").await {
            Ok(resp) => match parse_cclk_timezone(&resp) {
                Some(offset) => {
                    self.set_network_timezone(Some(offset), None, None).await;
                    PollOutcome::Done
                }
                None => PollOutcome::Retry,
            },
            Err(_) => PollOutcome::Retry,
        }
    }

    async fn poll_signal(self: Arc<Self>) -> PollOutcome {
        let Ok(queue) = self.primary_queue().await else {
            return PollOutcome::Retry;
        };
        match queue.command("+CSQ").await.map(|r| parse_csq(&r)) {
            Ok(Ok(percent)) => {
                self.set_signal_quality(percent).await;
                PollOutcome::Done
            }
            _ => PollOutcome::Retry,
        }
    }

    /// Store network timezone data (any subset absent) and notify. Any
    /// update stops the timezone poll.
    pub async fn set_network_timezone(
        &self,
        offset: Option<i32>,
        dst_offset: Option<i32>,
        leap_seconds: Option<i32>,
    ) {
        let changed = {
            let mut inner = self.inner.lock().await;
            let tz = NetworkTimezone {
                offset,
                dst_offset,
                leap_seconds,
            };
            if inner.timezone == tz {
                None
            } else {
                inner.timezone = tz;
                Some(tz)
            }
        };
        self.polls.stop("timezone");
        if let Some(tz) = changed {
            let mut map = Map::new();
            map.insert("NetworkTimezone".into(), tz.to_json());
            self.surface.properties_changed(&self.path, map, &[]);
        }
    }

    pub async fn network_timezone(&self) -> NetworkTimezone {
        self.inner.lock().await.timezone
    }

    async fn set_signal_quality(&self, percent: u32) {
        let mut inner = self.inner.lock().await;
        if inner.signal_quality == Some(percent) {
            return;
        }
        inner.signal_quality = Some(percent);
        drop(inner);
        let mut map = Map::new();
        map.insert("SignalQuality".into(), json!(percent));
        self.surface.properties_changed(&self.path, map, &[]);
    }

    /// Record which facility (if any) blocks the modem, and re-slave the
    /// scalar retry count to it.
    pub async fn set_unlock_required(&self, facility: Option<String>) {
        let mut inner = self.inner.lock().await;
        if inner.unlock_required == facility {
            return;
        }
        match &facility {
            Some(f) => info!("Modem {}: unlock required ({f})", self.path),
            None => info!("Modem {}: unlock no longer required", self.path),
        }
        inner.unlock_required = facility;
        recompute_unlock_retries(&mut inner);
        let mut map = Map::new();
        map.insert(
            "UnlockRequired".into(),
            json!(inner.unlock_required.clone().unwrap_or_default()),
        );
        map.insert("UnlockRetries".into(), json!(inner.unlock_retries));
        drop(inner);
        self.surface.properties_changed(&self.path, map, &[]);
    }

    /// Update the per-facility retry counts. `None` means the modem cannot
    /// report counts at all.
    pub async fn set_pin_retry_counts(&self, counts: Option<Vec<(String, u32)>>) {
        let mut inner = self.inner.lock().await;
        match counts {
            None => {
                inner.pin_retry_counts.clear();
                inner.unlock_retries = UNLOCK_RETRIES_NOT_SUPPORTED;
            }
            Some(counts) => {
                inner.pin_retry_counts = counts;
                recompute_unlock_retries(&mut inner);
            }
        }
        let mut map = Map::new();
        map.insert(
            "PinRetryCounts".into(),
            json!(inner
                .pin_retry_counts
                .iter()
                .cloned()
                .collect::<HashMap<_, _>>()),
        );
        map.insert("UnlockRetries".into(), json!(inner.unlock_retries));
        drop(inner);
        self.surface.properties_changed(&self.path, map, &[]);
    }

    pub async fn unlock_retries(&self) -> u32 {
        self.inner.lock().await.unlock_retries
    }

    // ── Properties ───────────────────────────────────────────────────

    /// Full property snapshot for the bus surface.
    pub async fn properties(&self) -> Map<String, Value> {
        let inner = self.inner.lock().await;
        let mut map = Map::new();
        map.insert("State".into(), json!(inner.state.as_str()));
        map.insert("Valid".into(), json!(inner.valid));
        map.insert("MasterDevice".into(), json!(self.device));
        map.insert("Driver".into(), json!(self.driver));
        map.insert("Plugin".into(), json!(self.plugin));
        map.insert(
            "EquipmentIdentifier".into(),
            json!(inner.equipment_ident.clone().unwrap_or_default()),
        );
        map.insert(
            "DeviceIdentifier".into(),
            json!(inner.device_ident.clone().unwrap_or_default()),
        );
        map.insert(
            "UnlockRequired".into(),
            json!(inner.unlock_required.clone().unwrap_or_default()),
        );
        map.insert("UnlockRetries".into(), json!(inner.unlock_retries));
        map.insert(
            "PinRetryCounts".into(),
            json!(inner
                .pin_retry_counts
                .iter()
                .cloned()
                .collect::<HashMap<_, _>>()),
        );
        map.insert("HwVid".into(), json!(self.vid));
        map.insert("HwPid".into(), json!(self.pid));
        map.insert("NetworkTimezone".into(), inner.timezone.to_json());
        map
    }
}

/// Recompute the scalar retry count from the active facility: it mirrors
/// the count of the facility named by `unlock_required`, 0 when unlocked.
fn recompute_unlock_retries(inner: &mut ModemInner) {
    inner.unlock_retries = match &inner.unlock_required {
        Some(facility) => inner
            .pin_retry_counts
            .iter()
            .find(|(name, _)| name == facility)
            .map_or(0, |(_, count)| *count),
        None => 0,
    };
}

/// Deterministic device identifier from hardware ids and identity strings.
/// Only alphanumeric characters contribute, so formatting quirks between
/// firmware revisions don't change the identity.
fn create_device_identifier(vid: u16, pid: u16, fields: [Option<&str>; 6]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{vid:04x}{pid:04x}"));
    for field in fields.into_iter().flatten() {
        let cleaned: String = field
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        hasher.update(cleaned);
    }
    let digest = hex::encode(hasher.finalize());
    digest[..40].to_string()
}

/// Hex-encode a byte slice (replacement for the `hex` crate, to avoid extra deps).
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().fold(
            String::with_capacity(bytes.as_ref().len() * 2),
            |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{b:02x}");
                s
            },
        )
    }
}

/// Strip echo tags and blank lines out of a card-info response. Empty
/// results are reported as `None` so the preference logic can fall back.
fn clean_info_response(payload: &str, tag: &str) -> Option<String> {
    let joined = payload
        .lines()
        .map(|line| {
            if tag.is_empty() {
                line.trim()
            } else {
                strip_tag(line, tag)
            }
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

enum CpinStatus {
    Ready,
    Locked(String),
}

/// Parse `+CPIN?` → ready or the blocking facility, normalized to the
/// conventional lowercase-dashed facility names (`sim-pin`, `sim-puk`, …).
fn parse_cpin(payload: &str) -> CpinStatus {
    let code = payload
        .lines()
        .find_map(|l| l.trim().strip_prefix("+CPIN:"))
        .map(str::trim)
        .unwrap_or("READY");
    if code.eq_ignore_ascii_case("READY") {
        CpinStatus::Ready
    } else {
        CpinStatus::Locked(code.to_ascii_lowercase().replace(' ', "-"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegStatus {
    Idle,
    Home,
    Searching,
    Denied,
    Roaming,
}

/// Parse `+CREG: <n>,<stat>`.
fn parse_creg(payload: &str) -> RegStatus {
    let stat = payload
        .lines()
        .find_map(|l| l.trim().strip_prefix("+CREG:"))
        .and_then(|rest| rest.split(',').nth(1))
        .and_then(|s| s.trim().parse::<u32>().ok());
    match stat {
        Some(1) => RegStatus::Home,
        Some(2) => RegStatus::Searching,
        Some(3) => RegStatus::Denied,
        Some(5) => RegStatus::Roaming,
        _ => RegStatus::Idle,
    }
}

/// Parse `+CSQ: <rssi>,<ber>` into a 0–100 quality percentage.
fn parse_csq(payload: &str) -> Result<u32> {
    let rssi: u32 = payload
        .lines()
        .find_map(|l| l.trim().strip_prefix("+CSQ:"))
        .and_then(|rest| rest.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| Error::ProtocolReject("malformed +CSQ response".into()))?;
    if rssi == 99 {
        return Err(Error::Retry);
    }
    Ok((rssi * 100 / 31).min(100))
}

/// Pull the timezone suffix out of a `+CCLK?` clock report
/// (`"yy/MM/dd,hh:mm:ss±zz"`, `zz` in quarter-hours).
fn parse_cclk_timezone(payload: &str) -> Option<i32> {
    let line = payload
        .lines()
        .find_map(|l| l.trim().strip_prefix("+CCLK:"))?
        .trim()
        .trim_matches('"');
    let time_part = line.split(',').nth(1)?;
    let sign_pos = time_part.rfind(['+', '-'])?;
    let quarters: i32 = time_part[sign_pos..].parse().ok()?;
    Some(quarters * 15)
}
