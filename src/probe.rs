//! Port capability probing.
//!
//! A probe runs a short classification dialogue against a candidate tty
//! port: a few `AT` pings, a cached `+GCAP` capability query, and — for
//! ports that stay silent — a single QCDM Version Info exchange. The result
//! is a capability bitset, cached per physical device so sibling ports are
//! classified without touching the hardware again. Probing is single-flight
//! per physical device.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bitflags::bitflags;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::port::{self, PortInfo};
use crate::queue::{CommandQueue, Framing, QueueOptions};
use crate::stream::StreamOpener;

bitflags! {
    /// Command sets a probed port honors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capability: u32 {
        /// GSM 07.07/07.05 AT command set.
        const GSM_AT  = 1 << 0;
        /// CDMA IS-707-A voice/data.
        const IS707_A = 1 << 1;
        /// CDMA IS-707-P packet data.
        const IS707_P = 1 << 2;
        /// CDMA IS-856 (1xEVDO rev 0).
        const IS856   = 1 << 3;
        /// CDMA IS-856-A (1xEVDO rev A).
        const IS856_A = 1 << 4;
        /// Qualcomm diagnostic protocol.
        const QCDM    = 1 << 5;
    }
}

impl Capability {
    /// Any CDMA family capability.
    #[must_use]
    pub fn cdma() -> Self {
        Self::IS707_A | Self::IS707_P | Self::IS856 | Self::IS856_A
    }
}

/// Probe pacing knobs.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Per-attempt response budget.
    pub attempt_timeout: Duration,
    /// `AT` pings before a port is declared silent.
    pub at_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(100),
            at_attempts: 6,
        }
    }
}

/// QCDM Version Info request (command byte 0x00).
const QCDM_VERSION_INFO: [u8; 1] = [0x00];

/// Runs classification dialogues. Holds no descriptors between probes.
pub struct Prober {
    opener: std::sync::Arc<dyn StreamOpener>,
    config: ProbeConfig,
}

impl Prober {
    pub fn new(opener: std::sync::Arc<dyn StreamOpener>, config: ProbeConfig) -> Self {
        Self { opener, config }
    }

    /// Classify one port. The descriptor is held only for the duration of
    /// the dialogue.
    pub async fn probe(&self, port: &PortInfo) -> Result<Capability> {
        let caps = match self.at_dialogue(port).await? {
            Some(caps) => caps,
            None => self.qcdm_dialogue(port).await?,
        };
        info!("({}): probe result {:#04x}", port.name, caps.bits());
        Ok(caps)
    }

    /// AT leg: returns `None` when the port never answers.
    async fn at_dialogue(&self, port: &PortInfo) -> Result<Option<Capability>> {
        let queue = self.open_queue(port, Framing::At)?;

        let mut responded = false;
        for attempt in 0..self.config.at_attempts {
            match queue.command_with_timeout("", self.config.attempt_timeout).await {
                Ok(_) | Err(Error::ProtocolReject(_)) => {
                    responded = true;
                    break;
                }
                Err(Error::Timeout) => {
                    debug!("({}): AT attempt {} silent", port.name, attempt + 1);
                }
                Err(e) => return Err(e),
            }
        }
        if !responded {
            queue.cancel_all();
            return Ok(None);
        }

        // The port speaks AT; refine with the capability report.
        let mut caps = Capability::GSM_AT;
        let gcap_timeout = self.config.attempt_timeout * 3;
        match queue.command_with_timeout("+GCAP", gcap_timeout).await {
            Ok(resp) => caps |= parse_gcap(&resp),
            Err(Error::ProtocolReject(_) | Error::Timeout) => {
                // Some firmware only reveals CDMA support through ATI.
                if let Ok(resp) = queue.command_with_timeout("I", gcap_timeout).await {
                    if resp.to_ascii_uppercase().contains("CDMA") {
                        caps |= Capability::IS707_A;
                    }
                }
            }
            Err(e) => return Err(e),
        }
        queue.cancel_all();
        Ok(Some(caps))
    }

    /// QCDM leg: one Version Info exchange over HDLC framing.
    async fn qcdm_dialogue(&self, port: &PortInfo) -> Result<Capability> {
        let queue = self.open_queue(port, Framing::Qcdm)?;
        let request = port::frame_qcdm(&QCDM_VERSION_INFO);
        let caps = match queue.raw(request, self.config.attempt_timeout * 3).await {
            Ok(frame) => match port::unframe_qcdm(&frame) {
                Ok(payload) if payload.first() == Some(&QCDM_VERSION_INFO[0]) => Capability::QCDM,
                _ => Capability::empty(),
            },
            Err(Error::Timeout | Error::ProtocolReject(_)) => Capability::empty(),
            Err(e) => return Err(e),
        };
        queue.cancel_all();
        Ok(caps)
    }

    fn open_queue(&self, port: &PortInfo, framing: Framing) -> Result<CommandQueue> {
        let (stream, rx) = self.opener.open(port)?;
        // Probe queues are throwaway; nobody listens for their events.
        let (ev_tx, _ev_rx) = mpsc::channel(4);
        Ok(CommandQueue::spawn(
            stream,
            rx,
            framing,
            QueueOptions {
                device: port.name.clone(),
                max_timeouts: 0,
                default_timeout: self.config.attempt_timeout,
            },
            ev_tx,
        ))
    }
}

/// Parse a `+GCAP` report into capability flags.
fn parse_gcap(response: &str) -> Capability {
    let upper = response.to_ascii_uppercase();
    let mut caps = Capability::empty();
    if upper.contains("+CGSM") {
        caps |= Capability::GSM_AT;
    }
    if upper.contains("+CIS707-A") || upper.contains("+CIS707A") {
        caps |= Capability::IS707_A;
    }
    if upper.contains("+CIS707P") || upper.contains("+CIS707-P") {
        caps |= Capability::IS707_P;
    }
    // Order matters: the rev-A token contains the rev-0 token.
    if upper.contains("CIS-856-A") {
        caps |= Capability::IS856_A;
    }
    if upper.contains("CIS-856") && !upper.contains("CIS-856-A") {
        caps |= Capability::IS856;
    }
    caps
}

enum CacheEntry {
    Running(broadcast::Sender<Capability>),
    Done(Capability),
}

/// Per-physical-device probe results, single-flight per device.
#[derive(Default)]
pub struct ProbeCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ProbeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed result for a physical device, if any.
    pub fn get(&self, parent: &str) -> Option<Capability> {
        match self.entries.lock().unwrap().get(parent) {
            Some(CacheEntry::Done(caps)) => Some(*caps),
            _ => None,
        }
    }

    /// Forget a device's result (on removal, so a re-plug re-probes).
    pub fn invalidate(&self, parent: &str) {
        self.entries.lock().unwrap().remove(parent);
    }

    /// Return the cached bitset, join an in-flight probe, or run the probe
    /// ourselves — whichever the cache state dictates.
    pub async fn classify(&self, prober: &Prober, port: &PortInfo) -> Result<Capability> {
        enum Action {
            Done(Capability),
            Wait(broadcast::Receiver<Capability>),
            Probe,
        }
        let action = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(&port.parent) {
                Some(CacheEntry::Done(caps)) => Action::Done(*caps),
                Some(CacheEntry::Running(tx)) => Action::Wait(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    entries.insert(port.parent.clone(), CacheEntry::Running(tx));
                    Action::Probe
                }
            }
        };
        match action {
            Action::Done(caps) => Ok(caps),
            // Sibling probe in flight — wait for its broadcast.
            Action::Wait(mut rx) => rx.recv().await.map_err(|_| Error::Retry),
            Action::Probe => self.run_probe(prober, port).await,
        }
    }

    async fn run_probe(&self, prober: &Prober, port: &PortInfo) -> Result<Capability> {
        let result = prober.probe(port).await;
        let caps = *result.as_ref().unwrap_or(&Capability::empty());
        let mut entries = self.entries.lock().unwrap();
        if let Some(CacheEntry::Running(tx)) =
            entries.insert(port.parent.clone(), CacheEntry::Done(caps))
        {
            let _ = tx.send(caps);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::frame_qcdm;
    use crate::testutil::{FakeOpener, Reply, Script};
    use std::sync::Arc;

    fn prober_with(opener: FakeOpener) -> (Prober, Arc<FakeOpener>) {
        let opener = Arc::new(opener);
        let config = ProbeConfig {
            attempt_timeout: Duration::from_millis(20),
            at_attempts: 3,
        };
        (Prober::new(opener.clone(), config), opener)
    }

    fn tty_port(name: &str, parent: &str) -> PortInfo {
        PortInfo {
            name: name.into(),
            subsystem: crate::port::Subsystem::Tty,
            parent: parent.into(),
            vid: 0x12d1,
            pid: 0x1506,
            driver: "option".into(),
            devfile: Some(format!("/dev/{name}")),
        }
    }

    #[tokio::test]
    async fn test_probe_gsm_port() {
        let opener = FakeOpener::new();
        opener.script(
            "ttyUSB0",
            Script::new()
                .on("AT\r", Reply::data("OK\r\n"))
                .on("AT+GCAP\r", Reply::data("+GCAP: +CGSM,+DS,+ES\r\nOK\r\n")),
        );
        let (prober, _) = prober_with(opener);
        let caps = prober.probe(&tty_port("ttyUSB0", "/usb1")).await.unwrap();
        assert!(caps.contains(Capability::GSM_AT));
        assert!(!caps.intersects(Capability::cdma()));
    }

    #[tokio::test]
    async fn test_probe_cdma_via_ati() {
        let opener = FakeOpener::new();
        opener.script(
            "ttyUSB0",
            Script::new()
                .on("AT\r", Reply::data("OK\r\n"))
                .on("AT+GCAP\r", Reply::data("ERROR\r\n"))
                .on("ATI\r", Reply::data("Manufacturer: ACME CDMA\r\nOK\r\n")),
        );
        let (prober, _) = prober_with(opener);
        let caps = prober.probe(&tty_port("ttyUSB0", "/usb1")).await.unwrap();
        assert!(caps.contains(Capability::IS707_A));
    }

    #[tokio::test]
    async fn test_probe_silent_port_is_unsupported() {
        let opener = FakeOpener::new();
        let (prober, _) = prober_with(opener);
        let caps = prober.probe(&tty_port("ttyUSB9", "/usb1")).await.unwrap();
        assert!(caps.is_empty());
    }

    #[tokio::test]
    async fn test_probe_qcdm_port() {
        let request = String::from_utf8_lossy(&frame_qcdm(&[0x00])).to_string();
        let mut version_info = vec![0x00u8];
        version_info.extend_from_slice(b"DIAG");
        let opener = FakeOpener::new();
        opener.script(
            "ttyUSB1",
            Script::new().on(&request, Reply::Data(frame_qcdm(&version_info))),
        );
        let (prober, _) = prober_with(opener);
        let caps = prober.probe(&tty_port("ttyUSB1", "/usb1")).await.unwrap();
        assert_eq!(caps, Capability::QCDM);
    }

    #[tokio::test]
    async fn test_cache_probes_device_once() {
        let opener = FakeOpener::new();
        opener.script(
            "ttyUSB0",
            Script::new()
                .on("AT\r", Reply::data("OK\r\n"))
                .on("AT+GCAP\r", Reply::data("+GCAP: +CGSM\r\nOK\r\n")),
        );
        let (prober, opener) = prober_with(opener);
        let cache = ProbeCache::new();

        let p0 = tty_port("ttyUSB0", "/usb1");
        let p1 = tty_port("ttyUSB1", "/usb1");
        let caps0 = cache.classify(&prober, &p0).await.unwrap();
        let caps1 = cache.classify(&prober, &p1).await.unwrap();
        assert_eq!(caps0, caps1);
        assert_eq!(opener.opened(), vec!["ttyUSB0".to_string()]);

        cache.invalidate("/usb1");
        assert!(cache.get("/usb1").is_none());
    }

    #[test]
    fn test_parse_gcap_tokens() {
        assert_eq!(parse_gcap("+GCAP: +CGSM,+FCLASS"), Capability::GSM_AT);
        let cdma = parse_gcap("+GCAP: +CIS707-A, CIS-856, CIS-856-A");
        assert!(cdma.contains(Capability::IS707_A));
        assert!(cdma.contains(Capability::IS856_A));
    }
}
