//! Per-port AT session driver.
//!
//! One session owns one serial transport for the life of a worker. Every
//! transport access goes through a single mutex: a command holds the lock
//! from send to response-complete, and the USSD drain holds it across the
//! late `+CUSD:` wait, so the listen loop can never interleave with either.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::codec;
use crate::transport::{sanitize_text, Transport, TransportError};

/// Default wait for a command's final result code.
const CMD_WAIT: Duration = Duration::from_secs(2);
/// `+CMGR` responses carry a body and arrive a little slower.
const READ_WAIT: Duration = Duration::from_secs(3);
/// Listing every unread message can take a while on a full SIM.
const LIST_WAIT: Duration = Duration::from_secs(4);
/// USSD replies routinely trail the initial OK by several seconds.
const USSD_WAIT: Duration = Duration::from_secs(12);

/// Text-mode SMS setup: verbose errors, UCS-2 charset, SIM storage, and
/// `+CMTI` URCs for newly stored messages.
const INIT_SEQUENCE: [&str; 7] = [
    "AT",
    "ATE0",
    "AT+CMEE=2",
    "AT+CSCS=\"UCS2\"",
    "AT+CMGF=1",
    "AT+CPMS=\"SM\",\"SM\",\"SM\"",
    "AT+CNMI=2,1,0,0,0",
];

/// Where the session is in its lifecycle. Transitions are strictly
/// sequential within a session; the value exists for log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Initializing,
    IdleListening,
    HandlingUrc,
    QueryingUssd,
    Closed,
}

pub struct ModemSession<T: Transport> {
    transport: Mutex<T>,
    port: String,
    state: Mutex<SessionState>,
}

impl<T: Transport> ModemSession<T> {
    pub fn new(transport: T, port: &str) -> Self {
        Self {
            transport: Mutex::new(transport),
            port: port.to_string(),
            state: Mutex::new(SessionState::Opening),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub(crate) fn enter(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("session port={} {:?} -> {next:?}", self.port, *state);
        *state = next;
    }

    /// Execute one command: reset buffers, write `cmd\r`, poll the input
    /// until a final result code or `max_wait` elapses. A timeout returns
    /// the partial buffer; only transport loss is an error.
    pub fn send(&self, cmd: &str, max_wait: Duration) -> Result<String, TransportError> {
        let mut transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = transport.reset_input();
        let _ = transport.reset_output();
        debug!("AT send port={} cmd={cmd}", self.port);
        transport.write(format!("{cmd}\r").as_bytes())?;

        let deadline = Instant::now() + max_wait;
        let mut buf = String::new();
        while Instant::now() < deadline {
            let chunk = transport.read_available()?;
            buf.push_str(&sanitize_text(&String::from_utf8_lossy(&chunk)));

            if buf.contains("\nOK") || buf.trim_end().ends_with("OK") {
                debug!("AT ok port={} cmd={cmd}", self.port);
                return Ok(buf);
            }
            if buf.contains("ERROR") || buf.contains("+CME ERROR") {
                warn!("AT error port={} cmd={cmd} resp={}", self.port, buf.trim());
                return Ok(buf);
            }
        }
        warn!("AT timeout port={} cmd={cmd} resp={}", self.port, buf.trim());
        Ok(buf)
    }

    /// Run the text-mode init sequence. Individual failures are logged and
    /// skipped — modems frequently answer later commands regardless.
    pub fn init_for_sms(&self) {
        self.enter(SessionState::Initializing);
        for cmd in INIT_SEQUENCE {
            if let Err(e) = self.send(cmd, CMD_WAIT) {
                warn!("init failed port={} cmd={cmd} err={e}", self.port);
            }
        }
    }

    pub fn read_sms(&self, index: u32) -> Result<String, TransportError> {
        self.send(&format!("AT+CMGR={index}"), READ_WAIT)
    }

    pub fn list_unread(&self) -> Result<String, TransportError> {
        self.send("AT+CMGL=\"REC UNREAD\"", LIST_WAIT)
    }

    pub fn delete_sms(&self, index: u32) -> Result<String, TransportError> {
        self.send(&format!("AT+CMGD={index}"), CMD_WAIT)
    }

    /// Wipe the SIM storage. Messages stored before this worker existed have
    /// no usable reception time.
    pub fn delete_all_sms(&self) -> Result<String, TransportError> {
        self.send("AT+CMGD=1,4", CMD_WAIT)
    }

    /// One bounded line read for the listen loop. `Ok(None)` on a quiet
    /// timeout so callers can check their stop flag between reads.
    pub fn read_line(&self) -> Result<Option<String>, TransportError> {
        let mut transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        transport.read_line()
    }

    /// Send a USSD request and drain the input until the `+CUSD:` reply
    /// shows up — it may arrive seconds after the initial OK, so the lock is
    /// held across the whole wait.
    pub fn query_ussd(&self, code: &str) -> Result<String, TransportError> {
        self.enter(SessionState::QueryingUssd);
        let mut transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = transport.reset_input();
        let _ = transport.reset_output();
        debug!("USSD send port={} code={code}", self.port);
        transport.write(format!("AT+CUSD=1,\"{code}\",15\r").as_bytes())?;

        let deadline = Instant::now() + USSD_WAIT;
        let mut buf = String::new();
        while Instant::now() < deadline {
            let chunk = transport.read_available()?;
            buf.push_str(&sanitize_text(&String::from_utf8_lossy(&chunk)));

            if buf.contains("+CUSD:") {
                return Ok(buf);
            }
            if buf.contains("ERROR") || buf.contains("+CME ERROR") {
                warn!("USSD error port={} code={code} resp={}", self.port, buf.trim());
                return Ok(buf);
            }
        }
        warn!("USSD timeout port={} code={code} resp={}", self.port, buf.trim());
        Ok(buf)
    }

    /// Abort a pending USSD dialogue.
    pub fn cancel_ussd(&self) -> Result<String, TransportError> {
        self.send("AT+CUSD=2", CMD_WAIT)
    }

    /// Best-effort subscriber number: USSD self-query first, `AT+CNUM` as
    /// the alternative. Empty when neither yields a number — downstream
    /// tolerates that.
    pub fn resolve_msisdn(&self, ussd_code: &str) -> String {
        match self.query_ussd(ussd_code) {
            Ok(resp) => {
                let reply = codec::parse_cusd(&resp);
                if let Some(text) = reply.text {
                    let normalized = codec::normalize_ussd(&text, reply.dcs);
                    if let Some(msisdn) = codec::extract_msisdn(&normalized) {
                        return msisdn;
                    }
                }
            }
            Err(e) => warn!("USSD failed port={} err={e}", self.port),
        }
        match self.send("AT+CNUM", READ_WAIT) {
            Ok(resp) => codec::parse_cnum(&resp).unwrap_or_default(),
            Err(e) => {
                warn!("CNUM failed port={} err={e}", self.port);
                String::new()
            }
        }
    }

    /// Mark the session closed. The transport is released on drop.
    pub fn close(self) {
        self.enter(SessionState::Closed);
    }
}

#[cfg(test)]
impl<T: Transport> ModemSession<T> {
    /// Direct transport access for inspecting scripted fakes.
    pub(crate) fn transport_for_tests(&self) -> std::sync::MutexGuard<'_, T> {
        self.transport.lock().unwrap()
    }
}
