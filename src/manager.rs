//! Single authority for modem discovery and the modem table.
//!
//! The manager consumes normalized device events, runs the plugin vote
//! (probing when a plugin asks for it), lets the winner grab the port,
//! assembles modems, and reacts to escalations and surface commands. Work
//! for one physical device is strictly serialized: vote → probe → grab →
//! role assignment → lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::devicebus::DeviceEvent;
use crate::error::{Error, Result};
use crate::modem::{Escalation, Modem, ModemConfig, ModemParams, StateReason};
use crate::plugin::{PluginRegistry, Vote};
use crate::port::PortInfo;
use crate::probe::{Capability, ProbeCache, ProbeConfig, Prober};
use crate::stream::StreamOpener;
use crate::surface::{self, LogReloadHandle, SurfaceCommand, SurfaceHandle};

/// Depth of the escalation channel from port listeners.
const ESCALATION_DEPTH: usize = 32;

pub struct DeviceManager {
    registry: PluginRegistry,
    prober: Prober,
    probe_cache: ProbeCache,
    opener: Arc<dyn StreamOpener>,
    surface: SurfaceHandle,
    modem_config: ModemConfig,
    modems: HashMap<String, Arc<Modem>>,
    /// Every port sighted and not yet removed, per device. Rescans re-vote
    /// the unclaimed ones.
    seen_ports: HashMap<String, Vec<PortInfo>>,
    /// Port keys currently owned by a modem (living or invalidated).
    claimed: HashSet<String>,
    exported: HashSet<String>,
    next_index: u32,
    escalations_tx: mpsc::Sender<Escalation>,
    escalations_rx: Option<mpsc::Receiver<Escalation>>,
    log_reload: Option<LogReloadHandle>,
}

impl DeviceManager {
    #[must_use]
    pub fn new(
        registry: PluginRegistry,
        opener: Arc<dyn StreamOpener>,
        surface: SurfaceHandle,
        modem_config: ModemConfig,
        probe_config: ProbeConfig,
        log_reload: Option<LogReloadHandle>,
    ) -> Self {
        let (escalations_tx, escalations_rx) = mpsc::channel(ESCALATION_DEPTH);
        Self {
            prober: Prober::new(Arc::clone(&opener), probe_config),
            probe_cache: ProbeCache::new(),
            registry,
            opener,
            surface,
            modem_config,
            modems: HashMap::new(),
            seen_ports: HashMap::new(),
            claimed: HashSet::new(),
            exported: HashSet::new(),
            next_index: 0,
            escalations_tx,
            escalations_rx: Some(escalations_rx),
            log_reload,
        }
    }

    /// Drive the manager until every input closes.
    pub async fn run(
        mut self,
        mut device_events: mpsc::Receiver<DeviceEvent>,
        mut commands: mpsc::Receiver<SurfaceCommand>,
    ) {
        let mut escalations = self.escalations_rx.take().expect("run called once");
        loop {
            tokio::select! {
                Some(event) = device_events.recv() => self.handle_device_event(event).await,
                Some(escalation) = escalations.recv() => self.handle_escalation(escalation).await,
                Some(command) = commands.recv() => self.handle_command(command).await,
                else => break,
            }
        }
        info!("device manager stopped");
    }

    async fn handle_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::PortsSettled { device, ports } => {
                let seen = self.seen_ports.entry(device.clone()).or_default();
                for port in &ports {
                    seen.retain(|p| p.key() != port.key());
                    seen.push(port.clone());
                }
                for port in ports {
                    self.consider_port(port).await;
                }
            }
            DeviceEvent::PortRemoved { device, port_key } => {
                self.handle_port_removed(&device, &port_key).await;
            }
        }
    }

    /// One port through the pipeline: vote, probe on demand, grab, organize.
    async fn consider_port(&mut self, port: PortInfo) {
        let key = port.key();
        if self.claimed.contains(&key) {
            return;
        }

        let existing = self.modems.get(&port.parent).cloned();
        let mut caps = self.probe_cache.get(&port.parent);
        let mut vote = self.registry.vote(&port, caps, existing.as_ref());

        if matches!(vote, Vote::NeedsProbe) {
            match self.probe_cache.classify(&self.prober, &port).await {
                Ok(probed) => {
                    caps = Some(probed);
                    vote = self.registry.vote(&port, caps, existing.as_ref());
                }
                Err(e) => {
                    warn!("({key}) probe failed: {e}");
                    return;
                }
            }
        }

        match vote {
            Vote::Unsupported => {
                debug!("({key}) no plugin supports this port");
            }
            Vote::NeedsProbe => {
                warn!("({key}) still in progress after probe; ignoring");
            }
            Vote::Winner { plugin, level } => {
                let caps = caps.unwrap_or(Capability::empty());
                let grant =
                    match self
                        .registry
                        .grab(&plugin, level, &port, caps, existing.as_ref())
                    {
                        Ok(grant) => grant,
                        Err(e) => {
                            warn!("({key}) grab refused: {e}");
                            return;
                        }
                    };

                let modem = match existing {
                    Some(modem) => modem,
                    None => self.create_modem(plugin.name(), plugin.hooks(), &port),
                };
                if let Err(e) = modem.grab_port(port, grant.kind, grant.flags).await {
                    warn!("({key}) grab failed: {e}");
                    return;
                }
                self.claimed.insert(key);

                match modem.organize_ports().await {
                    Ok(()) => {
                        if self.exported.insert(modem.device().to_string()) {
                            modem.export().await;
                            info!(
                                "exported modem {} for {} (plugin {})",
                                modem.path(),
                                modem.device(),
                                modem.plugin()
                            );
                        }
                    }
                    Err(Error::NoPrimary) => {
                        // A net or diag port arrived first; wait for an AT
                        // sibling before exposing the modem.
                        debug!("({}) not yet assemblable", modem.device());
                    }
                    Err(e) => warn!("({}) role assignment failed: {e}", modem.device()),
                }
            }
        }
    }

    fn create_modem(
        &mut self,
        plugin_name: &str,
        hooks: crate::plugin::VendorHooks,
        port: &PortInfo,
    ) -> Arc<Modem> {
        let index = self.next_index;
        self.next_index += 1;
        let modem = Modem::new(ModemParams {
            device: port.parent.clone(),
            plugin: plugin_name.to_string(),
            vid: port.vid,
            pid: port.pid,
            driver: port.driver.clone(),
            index,
            hooks,
            opener: Arc::clone(&self.opener),
            surface: self.surface.clone(),
            escalations: self.escalations_tx.clone(),
            config: self.modem_config.clone(),
        });
        self.modems.insert(port.parent.clone(), Arc::clone(&modem));
        modem
    }

    async fn handle_port_removed(&mut self, device: &str, port_key: &str) {
        self.claimed.remove(port_key);
        let mut device_gone = false;
        if let Some(seen) = self.seen_ports.get_mut(device) {
            seen.retain(|p| p.key() != port_key);
            if seen.is_empty() {
                self.seen_ports.remove(device);
                device_gone = true;
            }
        }

        if let Some(modem) = self.modems.get(device).cloned() {
            let (was_primary, remaining) = modem.release_port(port_key).await;
            if was_primary || remaining == 0 {
                self.remove_modem(device, StateReason::PortLost).await;
            }
        }

        if device_gone {
            // A re-plugged device is probed afresh.
            self.probe_cache.invalidate(device);
        }
    }

    async fn remove_modem(&mut self, device: &str, reason: StateReason) {
        if let Some(modem) = self.modems.remove(device) {
            modem.invalidate(reason).await;
            self.surface.modem_removed(modem.path());
            self.exported.remove(device);
            info!("removed modem {} ({})", modem.path(), reason.as_str());
        }
    }

    async fn handle_escalation(&mut self, escalation: Escalation) {
        match escalation {
            Escalation::Unresponsive { device } => {
                self.remove_modem(&device, StateReason::Unresponsive).await;
            }
            Escalation::PortLost { device, port_key } => {
                // The descriptor died before (or without) a hotplug remove.
                if let Some(modem) = self.modems.get(&device).cloned() {
                    let (was_primary, remaining) = modem.release_port(&port_key).await;
                    if was_primary || remaining == 0 {
                        self.remove_modem(&device, StateReason::PortLost).await;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: SurfaceCommand) {
        match command {
            SurfaceCommand::ScanDevices { reply } => {
                let _ = reply.send(self.scan_devices().await);
            }
            SurfaceCommand::SetLogging { level, reply } => {
                let result = match &self.log_reload {
                    Some(handle) => surface::apply_log_level(handle, level),
                    None => Err(Error::InvalidState("log reload not available".into())),
                };
                let _ = reply.send(result);
            }
            SurfaceCommand::Enable { path, reply } => {
                let _ = reply.send(match self.modem_by_path(&path) {
                    Ok(modem) => modem.enable().await,
                    Err(e) => Err(e),
                });
            }
            SurfaceCommand::Disable { path, reply } => {
                let _ = reply.send(match self.modem_by_path(&path) {
                    Ok(modem) => modem.disable().await,
                    Err(e) => Err(e),
                });
            }
            SurfaceCommand::Connect { path, apn, reply } => {
                let _ = reply.send(match self.modem_by_path(&path) {
                    Ok(modem) => modem.connect(&apn).await,
                    Err(e) => Err(e),
                });
            }
            SurfaceCommand::Disconnect { path, reply } => {
                let _ = reply.send(match self.modem_by_path(&path) {
                    Ok(modem) => modem.disconnect().await,
                    Err(e) => Err(e),
                });
            }
        }
    }

    /// Re-run the vote for every sighted, unclaimed port. Owned ports are
    /// skipped, so back-to-back scans return the same object set.
    async fn scan_devices(&mut self) -> Vec<String> {
        let candidates: Vec<PortInfo> = self
            .seen_ports
            .values()
            .flatten()
            .filter(|p| !self.claimed.contains(&p.key()))
            .cloned()
            .collect();
        for port in candidates {
            self.consider_port(port).await;
        }
        let mut paths: Vec<String> = self.modems.values().map(|m| m.path().to_string()).collect();
        paths.sort();
        paths
    }

    fn modem_by_path(&self, path: &str) -> Result<Arc<Modem>> {
        self.modems
            .values()
            .find(|m| m.path() == path)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("no modem at {path}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::builtin_plugins;
    use crate::probe::ProbeConfig;
    use crate::testutil::{FakeOpener, Reply, Script};
    use std::time::Duration;

    fn gsm_script() -> Script {
        Script::new()
            .on("AT\r", Reply::data("OK\r\n"))
            .on("AT+GCAP\r", Reply::data("+GCAP: +CGSM,+DS\r\nOK\r\n"))
    }

    fn tty_port(name: &str, parent: &str, vid: u16, pid: u16) -> PortInfo {
        PortInfo {
            name: name.into(),
            subsystem: crate::port::Subsystem::Tty,
            parent: parent.into(),
            vid,
            pid,
            driver: "option".into(),
            devfile: Some(format!("/dev/{name}")),
        }
    }

    fn manager_with(opener: Arc<FakeOpener>) -> DeviceManager {
        DeviceManager::new(
            PluginRegistry::load(&builtin_plugins()),
            opener,
            SurfaceHandle::new(),
            ModemConfig::default(),
            ProbeConfig {
                attempt_timeout: Duration::from_millis(20),
                at_attempts: 2,
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_single_gsm_port_becomes_modem() {
        let opener = Arc::new(FakeOpener::new());
        opener.script("ttyACM0", gsm_script());
        let mut manager = manager_with(opener);
        let mut events = manager.surface.subscribe();

        manager
            .handle_device_event(DeviceEvent::PortsSettled {
                device: "/devices/usb1".into(),
                ports: vec![tty_port("ttyACM0", "/devices/usb1", 0x12d1, 0x1506)],
            })
            .await;

        let modem = manager.modems.get("/devices/usb1").expect("modem exists");
        assert_eq!(modem.path(), "/org/modemd/Modem/0");
        assert_eq!(modem.plugin(), "Generic");

        let added = events.recv().await.unwrap();
        assert_eq!(added["type"], "modem.added");
        assert_eq!(added["path"], "/org/modemd/Modem/0");
        assert_eq!(added["properties"]["HwVid"], 0x12d1);
        assert_eq!(added["properties"]["HwPid"], 0x1506);

        let state = events.recv().await.unwrap();
        assert_eq!(state["type"], "modem.state_changed");
        assert_eq!(state["new"], "disabled");
    }

    #[tokio::test]
    async fn test_vendor_device_uses_vendor_plugin() {
        let opener = Arc::new(FakeOpener::new());
        opener.script("ttyUSB0", gsm_script());
        opener.script("ttyUSB1", gsm_script());
        let mut manager = manager_with(opener);

        manager
            .handle_device_event(DeviceEvent::PortsSettled {
                device: "/usb7".into(),
                ports: vec![
                    tty_port("ttyUSB0", "/usb7", 0x1410, 0x9010),
                    tty_port("ttyUSB1", "/usb7", 0x1410, 0x9010),
                ],
            })
            .await;

        let modem = manager.modems.get("/usb7").expect("modem exists");
        assert_eq!(modem.plugin(), "Novatel");
        // Single-AT policy: the second AT port was grabbed as ignored.
        assert_eq!(modem.at_port_count(), 1);
    }

    #[tokio::test]
    async fn test_silent_device_is_not_claimed() {
        let opener = Arc::new(FakeOpener::new());
        let mut manager = manager_with(opener);

        manager
            .handle_device_event(DeviceEvent::PortsSettled {
                device: "/usb1".into(),
                ports: vec![tty_port("ttyS0", "/usb1", 0, 0)],
            })
            .await;

        assert!(manager.modems.is_empty());
        assert!(manager.claimed.is_empty());
    }

    #[tokio::test]
    async fn test_scan_devices_idempotent() {
        let opener = Arc::new(FakeOpener::new());
        opener.script("ttyACM0", gsm_script());
        let mut manager = manager_with(opener);

        manager
            .handle_device_event(DeviceEvent::PortsSettled {
                device: "/usb1".into(),
                ports: vec![tty_port("ttyACM0", "/usb1", 0x12d1, 0x1506)],
            })
            .await;

        let first = manager.scan_devices().await;
        let second = manager.scan_devices().await;
        assert_eq!(first, vec!["/org/modemd/Modem/0".to_string()]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_primary_port_removal_tears_down_modem() {
        let opener = Arc::new(FakeOpener::new());
        opener.script("ttyACM0", gsm_script());
        let mut manager = manager_with(opener);
        let mut events = manager.surface.subscribe();

        manager
            .handle_device_event(DeviceEvent::PortsSettled {
                device: "/usb1".into(),
                ports: vec![tty_port("ttyACM0", "/usb1", 0x12d1, 0x1506)],
            })
            .await;
        assert_eq!(manager.modems.len(), 1);

        manager
            .handle_device_event(DeviceEvent::PortRemoved {
                device: "/usb1".into(),
                port_key: "tty/ttyACM0".into(),
            })
            .await;
        assert!(manager.modems.is_empty());
        assert!(manager.probe_cache.get("/usb1").is_none());

        // Drain events: added, state change, then invalidation + removal.
        let mut saw_removed = false;
        while let Ok(ev) = events.try_recv() {
            if ev["type"] == "modem.removed" {
                saw_removed = true;
            }
        }
        assert!(saw_removed);
    }

    #[tokio::test]
    async fn test_unresponsive_escalation_removes_modem() {
        let opener = Arc::new(FakeOpener::new());
        opener.script("ttyACM0", gsm_script());
        let mut manager = manager_with(opener);
        let mut events = manager.surface.subscribe();

        manager
            .handle_device_event(DeviceEvent::PortsSettled {
                device: "/usb1".into(),
                ports: vec![tty_port("ttyACM0", "/usb1", 0x12d1, 0x1506)],
            })
            .await;
        let modem = manager.modems.get("/usb1").cloned().unwrap();

        manager
            .handle_escalation(Escalation::Unresponsive {
                device: "/usb1".into(),
            })
            .await;

        assert!(!modem.valid().await);
        assert!(manager.modems.is_empty());

        let mut disabled_before_removed = false;
        let mut saw_removed = false;
        while let Ok(ev) = events.try_recv() {
            if ev["type"] == "modem.state_changed"
                && ev["new"] == "disabled"
                && ev["reason"] == "unresponsive"
                && !saw_removed
            {
                disabled_before_removed = true;
            }
            if ev["type"] == "modem.removed" {
                saw_removed = true;
            }
        }
        assert!(saw_removed);
        assert!(disabled_before_removed, "disabled must precede removal");
    }

    #[tokio::test]
    async fn test_replug_same_identity_index_advances() {
        let opener = Arc::new(FakeOpener::new());
        opener.script("ttyACM0", gsm_script());
        let mut manager = manager_with(opener);

        manager
            .handle_device_event(DeviceEvent::PortsSettled {
                device: "/usb1".into(),
                ports: vec![tty_port("ttyACM0", "/usb1", 0x12d1, 0x1506)],
            })
            .await;
        manager
            .handle_device_event(DeviceEvent::PortRemoved {
                device: "/usb1".into(),
                port_key: "tty/ttyACM0".into(),
            })
            .await;
        manager
            .handle_device_event(DeviceEvent::PortsSettled {
                device: "/usb1".into(),
                ports: vec![tty_port("ttyACM0", "/usb1", 0x12d1, 0x1506)],
            })
            .await;

        let modem = manager.modems.get("/usb1").expect("re-assembled");
        // Object paths are never reused.
        assert_eq!(modem.path(), "/org/modemd/Modem/1");
    }
}
