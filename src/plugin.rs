//! Plugin contract and registry.
//!
//! Plugins decide which daemon component owns a newly seen port. The
//! registry runs a two-phase vote: `supports_port` (which may demand a
//! probe first), then `grab_port` on the single winner. Vendor variation is
//! expressed as data — filters on the plugin, a [`VendorHooks`] table on the
//! modem — not as subclassing.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::modem::Modem;
use crate::port::{AtPortFlags, PortInfo, PortKind, Subsystem};
use crate::probe::Capability;

/// Plugin ABI version. Descriptors with a different major version are
/// rejected at load.
pub const PLUGIN_MAJOR_VERSION: u16 = 1;
pub const PLUGIN_MINOR_VERSION: u16 = 0;

/// Externally supplied module entry: version fields plus a factory.
pub struct PluginDescriptor {
    pub major_version: u16,
    pub minor_version: u16,
    pub factory: fn() -> Arc<dyn Plugin>,
}

/// First-phase vote result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSupport {
    Unsupported,
    /// The plugin needs the port's probe result before it can answer.
    InProgress,
    /// Supported at the given level; higher wins.
    Supported(u32),
}

/// What a winning plugin decides about a port.
#[derive(Debug)]
pub struct PortGrant {
    pub kind: PortKind,
    pub flags: AtPortFlags,
}

/// An unsolicited line recognized by a vendor hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsolicited {
    /// Network timezone report (offset minutes, optional DST offset minutes).
    Timezone { offset: i32, dst_offset: Option<i32> },
}

/// Vendor-override table installed on each modem. The generic lifecycle code
/// calls into these instead of dispatching on a class hierarchy.
pub struct VendorHooks {
    /// Commands sent, in order, when enabling the modem.
    pub init_commands: Vec<String>,
    /// Commands sent when tearing down a data connection.
    pub disconnect_commands: Vec<String>,
    /// Recognizer for unsolicited lines arriving outside a command.
    pub unsolicited: Option<Box<dyn Fn(&str) -> Option<Unsolicited> + Send + Sync>>,
}

impl Default for VendorHooks {
    fn default() -> Self {
        Self {
            init_commands: vec!["Z".into(), "E0".into(), "+CMEE=1".into()],
            disconnect_commands: vec!["H".into()],
            unsolicited: Some(Box::new(parse_ctzv)),
        }
    }
}

/// Parse a `+CTZV: <tz>[,<dst>]` unsolicited report. `<tz>` is in
/// quarter-hours, possibly signed and zero-padded.
fn parse_ctzv(line: &str) -> Option<Unsolicited> {
    let rest = line.trim().strip_prefix("+CTZV:")?.trim();
    let mut parts = rest.split(',').map(str::trim);
    let quarters: i32 = parts.next()?.trim_matches('"').parse().ok()?;
    let dst = parts.next().and_then(|p| p.parse::<i32>().ok());
    Some(Unsolicited::Timezone {
        offset: quarters * 15,
        dst_offset: dst.map(|d| d * 60),
    })
}

/// The plugin contract.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn allowed_subsystems(&self) -> &[Subsystem];

    /// `(vid, pid)` allow-list; empty means all devices.
    fn allowed_ids(&self) -> &[(u16, u16)] {
        &[]
    }

    /// Refuse to manage more than one AT port per modem.
    fn allowed_single_at(&self) -> bool {
        false
    }

    /// First phase: can this plugin own the port? `caps` is `None` until a
    /// probe has run; plugins that need it answer [`PortSupport::InProgress`].
    fn supports_port(
        &self,
        port: &PortInfo,
        existing: Option<&Arc<Modem>>,
        caps: Option<Capability>,
    ) -> PortSupport;

    /// Second phase: fix the port's kind and role hints. Only called on the
    /// winning plugin, with the probe result it voted on.
    fn grab_port(
        &self,
        port: &PortInfo,
        caps: Capability,
        existing: Option<&Arc<Modem>>,
    ) -> Result<PortGrant>;

    /// Hook table for modems this plugin creates.
    fn hooks(&self) -> VendorHooks {
        VendorHooks::default()
    }
}

/// Shared filter: does the port match the plugin's subsystem and id lists?
fn filters_match(plugin: &dyn Plugin, port: &PortInfo) -> bool {
    if !plugin.allowed_subsystems().contains(&port.subsystem) {
        return false;
    }
    let ids = plugin.allowed_ids();
    ids.is_empty() || ids.contains(&(port.vid, port.pid))
}

// ── Generic plugin ───────────────────────────────────────────────────

/// Catch-all plugin: owns any tty port whose probe shows a known command
/// set. Loses every tie by construction (consulted last).
pub struct GenericPlugin;

pub const GENERIC_PLUGIN_NAME: &str = "Generic";

impl GenericPlugin {
    fn level_for(caps: Capability) -> u32 {
        if caps.intersects(Capability::GSM_AT | Capability::cdma() | Capability::QCDM) {
            5
        } else {
            0
        }
    }
}

impl Plugin for GenericPlugin {
    fn name(&self) -> &str {
        GENERIC_PLUGIN_NAME
    }

    fn allowed_subsystems(&self) -> &[Subsystem] {
        &[Subsystem::Tty]
    }

    fn supports_port(
        &self,
        port: &PortInfo,
        _existing: Option<&Arc<Modem>>,
        caps: Option<Capability>,
    ) -> PortSupport {
        if !filters_match(self, port) {
            return PortSupport::Unsupported;
        }
        match caps {
            None => PortSupport::InProgress,
            Some(caps) => match Self::level_for(caps) {
                0 => PortSupport::Unsupported,
                level => PortSupport::Supported(level),
            },
        }
    }

    fn grab_port(
        &self,
        port: &PortInfo,
        caps: Capability,
        _existing: Option<&Arc<Modem>>,
    ) -> Result<PortGrant> {
        if Self::level_for(caps) == 0 {
            return Err(Error::UnsupportedPort(port.key()));
        }
        let kind = if caps.intersects(Capability::GSM_AT | Capability::cdma()) {
            PortKind::At
        } else {
            PortKind::Qcdm
        };
        Ok(PortGrant {
            kind,
            flags: AtPortFlags::empty(),
        })
    }
}

// ── Novatel plugin ───────────────────────────────────────────────────

/// Vendor plugin for Novatel E362-class devices: claims its (vid, pid) pair
/// outright, prefers the net interface for data, and manages a single AT
/// port (extras are grabbed as ignored).
pub struct NovatelPlugin;

impl Plugin for NovatelPlugin {
    fn name(&self) -> &str {
        "Novatel"
    }

    fn allowed_subsystems(&self) -> &[Subsystem] {
        &[Subsystem::Tty, Subsystem::Net]
    }

    fn allowed_ids(&self) -> &[(u16, u16)] {
        &[(0x1410, 0x9010)]
    }

    fn allowed_single_at(&self) -> bool {
        true
    }

    fn supports_port(
        &self,
        port: &PortInfo,
        _existing: Option<&Arc<Modem>>,
        caps: Option<Capability>,
    ) -> PortSupport {
        if !filters_match(self, port) {
            return PortSupport::Unsupported;
        }
        if port.subsystem == Subsystem::Net {
            return PortSupport::Supported(10);
        }
        match caps {
            None => PortSupport::InProgress,
            Some(caps) if !caps.is_empty() => PortSupport::Supported(10),
            Some(_) => PortSupport::Unsupported,
        }
    }

    fn grab_port(
        &self,
        port: &PortInfo,
        caps: Capability,
        existing: Option<&Arc<Modem>>,
    ) -> Result<PortGrant> {
        if port.subsystem == Subsystem::Net {
            return Ok(PortGrant {
                kind: PortKind::Net,
                flags: AtPortFlags::empty(),
            });
        }
        if caps.contains(Capability::QCDM) && !caps.contains(Capability::GSM_AT) {
            return Ok(PortGrant {
                kind: PortKind::Qcdm,
                flags: AtPortFlags::empty(),
            });
        }
        // Single-AT policy: extra AT ports are taken but left unused.
        if self.allowed_single_at() && existing.is_some_and(|m| m.at_port_count() > 0) {
            return Ok(PortGrant {
                kind: PortKind::Ignored,
                flags: AtPortFlags::empty(),
            });
        }
        Ok(PortGrant {
            kind: PortKind::At,
            flags: AtPortFlags::PRIMARY,
        })
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Outcome of a registry vote for one port.
pub enum Vote {
    Unsupported,
    /// At least one plugin wants a probe result first.
    NeedsProbe,
    Winner { plugin: Arc<dyn Plugin>, level: u32 },
}

/// Loaded plugin set, consulted in stable order: vendor plugins sorted by
/// name, the generic plugin last.
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Instantiate plugins from descriptors, rejecting ABI mismatches.
    pub fn load(descriptors: &[PluginDescriptor]) -> Self {
        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
        for desc in descriptors {
            if desc.major_version != PLUGIN_MAJOR_VERSION {
                warn!(
                    "Rejecting plugin with ABI {}.{} (daemon is {}.{})",
                    desc.major_version,
                    desc.minor_version,
                    PLUGIN_MAJOR_VERSION,
                    PLUGIN_MINOR_VERSION
                );
                continue;
            }
            plugins.push((desc.factory)());
        }
        plugins.sort_by(|a, b| {
            let a_generic = a.name() == GENERIC_PLUGIN_NAME;
            let b_generic = b.name() == GENERIC_PLUGIN_NAME;
            a_generic.cmp(&b_generic).then_with(|| a.name().cmp(b.name()))
        });
        debug!(
            "Loaded plugins: {}",
            plugins.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
        );
        Self { plugins }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run the first-phase vote over all plugins.
    pub fn vote(
        &self,
        port: &PortInfo,
        caps: Option<Capability>,
        existing: Option<&Arc<Modem>>,
    ) -> Vote {
        let mut best: Option<(Arc<dyn Plugin>, u32)> = None;
        let mut needs_probe = false;
        for plugin in &self.plugins {
            match plugin.supports_port(port, existing, caps) {
                PortSupport::Unsupported => {}
                PortSupport::InProgress => needs_probe = true,
                PortSupport::Supported(level) => {
                    // Strictly greater wins; ties keep the earlier plugin,
                    // which is why the generic plugin sorts last.
                    if best.as_ref().is_none_or(|(_, b)| level > *b) {
                        best = Some((Arc::clone(plugin), level));
                    }
                }
            }
        }
        if needs_probe {
            return Vote::NeedsProbe;
        }
        match best {
            Some((plugin, level)) => Vote::Winner { plugin, level },
            None => Vote::Unsupported,
        }
    }

    /// Second phase: let the winner fix the port's kind. A support level of
    /// 0 must never reach a grab.
    pub fn grab(
        &self,
        plugin: &Arc<dyn Plugin>,
        level: u32,
        port: &PortInfo,
        caps: Capability,
        existing: Option<&Arc<Modem>>,
    ) -> Result<PortGrant> {
        if level == 0 {
            return Err(Error::UnsupportedPort(port.key()));
        }
        let grant = plugin.grab_port(port, caps, existing)?;
        if grant.kind == PortKind::Unknown {
            return Err(Error::PluginMismatch(format!(
                "{} grabbed {} without assigning a kind",
                plugin.name(),
                port.key()
            )));
        }
        Ok(grant)
    }
}

/// Descriptors for the plugins compiled into the daemon.
#[must_use]
pub fn builtin_plugins() -> Vec<PluginDescriptor> {
    vec![
        PluginDescriptor {
            major_version: PLUGIN_MAJOR_VERSION,
            minor_version: PLUGIN_MINOR_VERSION,
            factory: || Arc::new(NovatelPlugin),
        },
        PluginDescriptor {
            major_version: PLUGIN_MAJOR_VERSION,
            minor_version: PLUGIN_MINOR_VERSION,
            factory: || Arc::new(GenericPlugin),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tty_port(vid: u16, pid: u16) -> PortInfo {
        PortInfo {
            name: "ttyUSB0".into(),
            subsystem: Subsystem::Tty,
            parent: "/usb1".into(),
            vid,
            pid,
            driver: "option".into(),
            devfile: Some("/dev/ttyUSB0".into()),
        }
    }

    fn net_port(vid: u16, pid: u16) -> PortInfo {
        PortInfo {
            name: "wwan0".into(),
            subsystem: Subsystem::Net,
            parent: "/usb1".into(),
            vid,
            pid,
            driver: "qmi_wwan".into(),
            devfile: None,
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let descriptors = vec![
            PluginDescriptor {
                major_version: PLUGIN_MAJOR_VERSION + 1,
                minor_version: 0,
                factory: || Arc::new(NovatelPlugin),
            },
            PluginDescriptor {
                major_version: PLUGIN_MAJOR_VERSION,
                minor_version: PLUGIN_MINOR_VERSION,
                factory: || Arc::new(GenericPlugin),
            },
        ];
        let registry = PluginRegistry::load(&descriptors);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_vote_requires_probe_first() {
        let registry = PluginRegistry::load(&builtin_plugins());
        let port = tty_port(0x12d1, 0x1506);
        assert!(matches!(registry.vote(&port, None, None), Vote::NeedsProbe));
    }

    #[test]
    fn test_vendor_outranks_generic() {
        let registry = PluginRegistry::load(&builtin_plugins());
        let port = tty_port(0x1410, 0x9010);
        match registry.vote(&port, Some(Capability::GSM_AT), None) {
            Vote::Winner { plugin, level } => {
                assert_eq!(plugin.name(), "Novatel");
                assert_eq!(level, 10);
            }
            _ => panic!("expected winner"),
        }
    }

    #[test]
    fn test_generic_wins_unmatched_device() {
        let registry = PluginRegistry::load(&builtin_plugins());
        let port = tty_port(0x12d1, 0x1506);
        match registry.vote(&port, Some(Capability::GSM_AT), None) {
            Vote::Winner { plugin, level } => {
                assert_eq!(plugin.name(), GENERIC_PLUGIN_NAME);
                assert_eq!(level, 5);
            }
            _ => panic!("expected winner"),
        }
    }

    #[test]
    fn test_probe_level_zero_is_unsupported() {
        let registry = PluginRegistry::load(&builtin_plugins());
        let port = tty_port(0x12d1, 0x1506);
        assert!(matches!(
            registry.vote(&port, Some(Capability::empty()), None),
            Vote::Unsupported
        ));
    }

    #[test]
    fn test_grab_rejects_level_zero() {
        let registry = PluginRegistry::load(&builtin_plugins());
        let plugin: Arc<dyn Plugin> = Arc::new(GenericPlugin);
        let port = tty_port(0x12d1, 0x1506);
        let err = registry
            .grab(&plugin, 0, &port, Capability::GSM_AT, None)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedPort(_)));
    }

    #[test]
    fn test_net_port_supported_without_probe() {
        let registry = PluginRegistry::load(&builtin_plugins());
        let port = net_port(0x1410, 0x9010);
        assert!(matches!(
            registry.vote(&port, None, None),
            Vote::Winner { level: 10, .. }
        ));
    }

    #[test]
    fn test_generic_grab_kind() {
        let plugin = GenericPlugin;
        let at = plugin
            .grab_port(&tty_port(0, 0), Capability::GSM_AT, None)
            .unwrap();
        assert_eq!(at.kind, PortKind::At);
        let qcdm = plugin
            .grab_port(&tty_port(0, 0), Capability::QCDM, None)
            .unwrap();
        assert_eq!(qcdm.kind, PortKind::Qcdm);
    }

    #[test]
    fn test_parse_ctzv() {
        assert_eq!(
            parse_ctzv("+CTZV: +08"),
            Some(Unsolicited::Timezone {
                offset: 120,
                dst_offset: None
            })
        );
        assert_eq!(
            parse_ctzv("+CTZV: -20,1"),
            Some(Unsolicited::Timezone {
                offset: -300,
                dst_offset: Some(60)
            })
        );
        assert_eq!(parse_ctzv("+CREG: 0,1"), None);
    }
}
