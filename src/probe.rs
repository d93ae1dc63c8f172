//! Modem discovery.
//!
//! A minimal AT handshake that identifies the equipment behind a serial port
//! and verifies it can do text-mode SMS, before the supervisor lets a worker
//! claim the port. Probing is deliberately tolerant: any failure just means
//! "not a modem this tick" — the port will be scanned again.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::supervisor::PortProber;
use crate::transport::{sanitize_text, SerialTransport, Transport, TransportError};

static IMEI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{14,17})\b").expect("IMEI pattern"));

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub baudrate: u32,
    /// Serial read timeout while probing.
    pub timeout: Duration,
    /// How long to wait for each handshake response.
    pub max_wait: Duration,
}

impl ProbeConfig {
    pub fn new(baudrate: u32, timeout: Duration) -> Self {
        Self {
            baudrate,
            timeout,
            max_wait: Duration::from_millis(1500),
        }
    }
}

/// Write one command and collect the response until a final result code or
/// `wait` elapses.
fn probe_send<T: Transport>(
    transport: &mut T,
    cmd: &str,
    wait: Duration,
) -> Result<String, TransportError> {
    transport.write(format!("{cmd}\r").as_bytes())?;
    let deadline = Instant::now() + wait;
    let mut buf = String::new();
    while Instant::now() < deadline {
        let chunk = transport.read_available()?;
        buf.push_str(&sanitize_text(&String::from_utf8_lossy(&chunk)));
        if buf.contains("OK") || buf.contains("ERROR") || buf.contains("+CME ERROR") {
            break;
        }
    }
    Ok(buf)
}

/// Probe an open transport for an SMS-capable modem, returning its IMEI.
/// Transport errors and negative handshakes both come back as `None`.
pub fn probe_imei<T: Transport>(transport: &mut T, cfg: &ProbeConfig) -> Option<String> {
    match probe_steps(transport, cfg) {
        Ok(imei) => imei,
        Err(e) => {
            debug!("probe aborted: {e}");
            None
        }
    }
}

fn probe_steps<T: Transport>(
    transport: &mut T,
    cfg: &ProbeConfig,
) -> Result<Option<String>, TransportError> {
    let resp = probe_send(transport, "AT", cfg.max_wait)?;
    if !resp.contains("OK") {
        return Ok(None);
    }

    for cmd in ["AT+CGSN", "AT+GSN"] {
        let _ = transport.reset_input();
        let resp = probe_send(transport, cmd, cfg.max_wait)?;
        if let Some(caps) = IMEI_RE.captures(&resp) {
            let imei = caps[1].to_string();
            if !sms_capable(transport)? {
                return Ok(None);
            }
            ussd_capable(transport)?;
            return Ok(Some(imei));
        }
    }
    Ok(None)
}

/// Text mode must come up and the modem must accept SIM storage and the
/// list command before a worker is worth spawning.
fn sms_capable<T: Transport>(transport: &mut T) -> Result<bool, TransportError> {
    probe_send(transport, "ATE0", Duration::from_secs(1))?;
    probe_send(transport, "AT+CMEE=2", Duration::from_secs(1))?;
    let text_mode = probe_send(transport, "AT+CMGF=1", Duration::from_millis(1200))?;
    if !text_mode.contains("OK") {
        return Ok(false);
    }
    probe_send(transport, "AT+CPMS?", Duration::from_millis(1200))?;
    probe_send(transport, "AT+CPMS=\"SM\",\"SM\",\"SM\"", Duration::from_millis(1500))?;
    let listing = probe_send(transport, "AT+CMGL=?", Duration::from_millis(1200))?;
    Ok(listing.contains("+CMGL:") && listing.contains("OK"))
}

/// USSD support is informational only — MSISDN lookup degrades gracefully.
fn ussd_capable<T: Transport>(transport: &mut T) -> Result<(), TransportError> {
    let enable = probe_send(transport, "AT+CUSD=1", Duration::from_millis(1200))?;
    let query = probe_send(transport, "AT+CUSD=?", Duration::from_millis(1200))?;
    let capable = query.contains("OK") || enable.contains("OK");
    debug!("ussd capable={capable}");
    Ok(())
}

/// Production prober: enumerates OS serial ports and drives the handshake
/// over a real transport.
pub struct SerialProber {
    manual_ports: Option<Vec<String>>,
    cfg: ProbeConfig,
}

impl SerialProber {
    pub fn new(manual_ports: Option<Vec<String>>, cfg: ProbeConfig) -> Self {
        Self { manual_ports, cfg }
    }
}

impl PortProber for SerialProber {
    fn candidate_ports(&self) -> Vec<String> {
        let ports: Vec<String> = match serialport::available_ports() {
            Ok(list) => list.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                warn!("port enumeration failed: {e}");
                Vec::new()
            }
        };
        match &self.manual_ports {
            Some(allow) => ports.into_iter().filter(|p| allow.contains(p)).collect(),
            None => ports,
        }
    }

    fn probe(&self, port: &str) -> Option<String> {
        let mut transport = match SerialTransport::open(port, self.cfg.baudrate, self.cfg.timeout) {
            Ok(t) => t,
            Err(e) => {
                debug!("probe open failed port={port}: {e}");
                return None;
            }
        };
        let imei = probe_imei(&mut transport, &self.cfg);
        if let Some(imei) = &imei {
            info!("probe ok port={port} imei={imei}");
        }
        imei
    }
}
