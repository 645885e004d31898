//! Port data model and wire framing for AT and QCDM ports.
//!
//! A port is one kernel-exposed interface of a modem: a `tty` character
//! device, a `net` interface, or something we ignore. All ports of one
//! physical modem share a parent device path, which is the grouping key
//! everywhere in the daemon.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kernel subsystem a port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Tty,
    Net,
    Other,
}

impl Subsystem {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tty => "tty",
            Self::Net => "net",
            Self::Other => "other",
        }
    }
}

/// What a port turned out to be, assigned after probing. Fixed once grabbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Unknown,
    At,
    Qcdm,
    Net,
    Ignored,
}

impl PortKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::At => "at",
            Self::Qcdm => "qcdm",
            Self::Net => "net",
            Self::Ignored => "ignored",
        }
    }
}

bitflags! {
    /// Role hints a plugin attaches to an AT port at grab time. Authoritative
    /// roles are recomputed during assembly; see `modem::organize_ports`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtPortFlags: u32 {
        const PRIMARY   = 1 << 0;
        const SECONDARY = 1 << 1;
        const PPP_DATA  = 1 << 2;
    }
}

impl Default for AtPortFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Static description of a candidate port, built from a hotplug record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Stable kernel name (`ttyUSB0`, `wwan0`).
    pub name: String,
    pub subsystem: Subsystem,
    /// Parent device path shared by all ports of one modem.
    pub parent: String,
    pub vid: u16,
    pub pid: u16,
    pub driver: String,
    /// Character device path. Absent on buses without device files.
    pub devfile: Option<String>,
}

impl PortInfo {
    /// Map key unique across subsystems (`tty/ttyUSB0`).
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.subsystem.as_str(), self.name)
    }
}

// ── AT framing ───────────────────────────────────────────────────────

/// Final result codes that terminate an AT response.
const AT_FINALS: [&str; 6] = ["OK", "ERROR", "CONNECT", "NO CARRIER", "BUSY", "NO DIALTONE"];

/// Check whether an accumulated AT response contains a final result code.
#[must_use]
pub fn at_response_complete(response: &str) -> bool {
    for line in response.lines() {
        let trimmed = line.trim();
        if AT_FINALS.contains(&trimmed)
            || trimmed.starts_with("+CME ERROR:")
            || trimmed.starts_with("+CMS ERROR:")
            || trimmed.starts_with("CONNECT ")
        {
            return true;
        }
    }
    false
}

/// Remove NUL bytes and non-printable control characters (except CR/LF).
/// Stale buffer data can contain garbage bytes that break line parsing.
#[must_use]
pub fn sanitize_response(response: &str) -> String {
    response
        .chars()
        .filter(|&c| c == '\r' || c == '\n' || !c.is_control())
        .filter(|&c| c != '\u{FFFD}')
        .collect()
}

/// Strip command echo lines (safety net for echo not fully disabled).
#[must_use]
pub fn strip_echo(response: &str) -> String {
    response
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return false;
            }
            let alpha_start = trimmed.find(|c: char| c.is_ascii_alphabetic());
            if let Some(pos) = alpha_start {
                !trimmed[pos..].starts_with("AT")
            } else {
                true
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

/// Strip a leading tag (`+CGMM:`) from a response line, if present.
#[must_use]
pub fn strip_tag<'a>(line: &'a str, tag: &str) -> &'a str {
    let trimmed = line.trim();
    trimmed
        .strip_prefix(tag)
        .map_or(trimmed, str::trim_start)
}

/// Split a completed AT response into its payload, or a `ProtocolReject`
/// carrying the error line.
pub fn at_response_payload(response: &str) -> Result<String> {
    let cleaned = strip_echo(&sanitize_response(response));
    let mut payload = Vec::new();
    for line in cleaned.lines() {
        let trimmed = line.trim();
        if trimmed == "OK" {
            return Ok(payload.join("\r\n"));
        }
        if trimmed.starts_with("CONNECT") {
            payload.push(trimmed.to_string());
            return Ok(payload.join("\r\n"));
        }
        if trimmed == "ERROR"
            || trimmed.starts_with("+CME ERROR:")
            || trimmed.starts_with("+CMS ERROR:")
            || trimmed == "NO CARRIER"
            || trimmed == "BUSY"
            || trimmed == "NO DIALTONE"
        {
            return Err(Error::ProtocolReject(trimmed.to_string()));
        }
        payload.push(trimmed.to_string());
    }
    // No final result code — callers only see completed responses, but a
    // disconnect mid-response lands here.
    Ok(payload.join("\r\n"))
}

/// Frame an AT command for the wire: `+GMI` → `AT+GMI\r`.
#[must_use]
pub fn frame_at(command: &str) -> Vec<u8> {
    let mut framed = String::with_capacity(command.len() + 3);
    if !command.starts_with("AT") && !command.starts_with("at") {
        framed.push_str("AT");
    }
    framed.push_str(command);
    framed.push('\r');
    framed.into_bytes()
}

// ── QCDM framing ─────────────────────────────────────────────────────

const QCDM_TRAILER: u8 = 0x7E;
const QCDM_ESCAPE: u8 = 0x7D;
const QCDM_ESCAPE_XOR: u8 = 0x20;

/// HDLC-frame a diagnostic payload: append CRC-16/X.25, escape, terminate.
#[must_use]
pub fn frame_qcdm(payload: &[u8]) -> Vec<u8> {
    let crc = crc16::State::<crc16::X_25>::calculate(payload);
    let mut raw = payload.to_vec();
    raw.push((crc & 0xFF) as u8);
    raw.push((crc >> 8) as u8);

    let mut framed = Vec::with_capacity(raw.len() + 3);
    for byte in raw {
        if byte == QCDM_TRAILER || byte == QCDM_ESCAPE {
            framed.push(QCDM_ESCAPE);
            framed.push(byte ^ QCDM_ESCAPE_XOR);
        } else {
            framed.push(byte);
        }
    }
    framed.push(QCDM_TRAILER);
    framed
}

/// Check whether an accumulated buffer holds a complete QCDM frame.
#[must_use]
pub fn qcdm_response_complete(buf: &[u8]) -> bool {
    buf.iter().any(|&b| b == QCDM_TRAILER)
}

/// Unescape and CRC-check a QCDM frame, returning the payload.
pub fn unframe_qcdm(buf: &[u8]) -> Result<Vec<u8>> {
    let end = buf
        .iter()
        .position(|&b| b == QCDM_TRAILER)
        .ok_or_else(|| Error::ProtocolReject("unterminated diagnostic frame".into()))?;

    let mut raw = Vec::with_capacity(end);
    let mut escaped = false;
    for &byte in &buf[..end] {
        if escaped {
            raw.push(byte ^ QCDM_ESCAPE_XOR);
            escaped = false;
        } else if byte == QCDM_ESCAPE {
            escaped = true;
        } else {
            raw.push(byte);
        }
    }

    if raw.len() < 3 {
        return Err(Error::ProtocolReject("short diagnostic frame".into()));
    }
    let (payload, fcs) = raw.split_at(raw.len() - 2);
    let expected = crc16::State::<crc16::X_25>::calculate(payload);
    let got = u16::from(fcs[0]) | (u16::from(fcs[1]) << 8);
    if expected != got {
        return Err(Error::ProtocolReject("diagnostic frame CRC mismatch".into()));
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_complete_ok() {
        assert!(at_response_complete("+CSQ: 15,99\r\nOK\r\n"));
    }

    #[test]
    fn test_at_complete_cme_error() {
        assert!(at_response_complete("+CME ERROR: 10\r\n"));
    }

    #[test]
    fn test_at_complete_connect() {
        assert!(at_response_complete("CONNECT 150000000\r\n"));
    }

    #[test]
    fn test_at_incomplete() {
        assert!(!at_response_complete("+CSQ: 15,99\r\n"));
    }

    #[test]
    fn test_payload_strips_echo_and_final() {
        let resp = "AT+GMM\r\nE362\r\nOK\r\n";
        assert_eq!(at_response_payload(resp).unwrap(), "E362");
    }

    #[test]
    fn test_payload_error_rejects() {
        let err = at_response_payload("+CME ERROR: 11\r\n").unwrap_err();
        assert!(matches!(err, Error::ProtocolReject(_)));
    }

    #[test]
    fn test_strip_tag() {
        assert_eq!(strip_tag("+CGMM: N900", "+CGMM:"), "N900");
        assert_eq!(strip_tag("N900", "+CGMM:"), "N900");
    }

    #[test]
    fn test_frame_at_adds_prefix_and_cr() {
        assert_eq!(frame_at("+GMI"), b"AT+GMI\r");
        assert_eq!(frame_at("ATZ"), b"ATZ\r");
        assert_eq!(frame_at("I1"), b"ATI1\r");
    }

    #[test]
    fn test_qcdm_roundtrip() {
        let payload = [0x00, 0x7E, 0x7D, 0x42];
        let framed = frame_qcdm(&payload);
        assert_eq!(*framed.last().unwrap(), 0x7E);
        // Escaped bytes must not appear raw inside the frame body.
        assert!(!framed[..framed.len() - 1].contains(&0x7E));
        assert_eq!(unframe_qcdm(&framed).unwrap(), payload);
    }

    #[test]
    fn test_qcdm_crc_mismatch() {
        let mut framed = frame_qcdm(&[0x00]);
        framed[0] ^= 0xFF;
        assert!(unframe_qcdm(&framed).is_err());
    }

    #[test]
    fn test_port_key() {
        let port = PortInfo {
            name: "ttyUSB0".into(),
            subsystem: Subsystem::Tty,
            parent: "/sys/devices/usb1/1-1".into(),
            vid: 0x12d1,
            pid: 0x1506,
            driver: "option".into(),
            devfile: Some("/dev/ttyUSB0".into()),
        };
        assert_eq!(port.key(), "tty/ttyUSB0");
    }
}
