//! Serial byte transport.
//!
//! Wraps the `serialport` crate behind the small [`Transport`] trait that the
//! probe, session and worker layers are written against, so the protocol
//! logic can be driven by a scripted fake in tests. The trait is deliberately
//! byte-oriented: framing and result-code detection live one layer up.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;
use tracing::debug;

/// Settle delay before draining the input buffer. Modems emit multi-line
/// responses slowly and the AT dialect tolerates the latency.
const SETTLE_DELAY: Duration = Duration::from_millis(150);

#[derive(Debug, Error)]
pub enum TransportError {
    /// The port could not be opened — missing, busy, or permission-denied.
    #[error("open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    /// Read/write failure on an open port. Usually means the device is gone.
    #[error("serial I/O: {0}")]
    Io(#[from] std::io::Error),
    /// Buffer-control operation (flush/clear) failed.
    #[error("serial control: {0}")]
    Control(#[from] serialport::Error),
}

/// A byte-duplex stream with timeouts, as seen by the AT layers.
pub trait Transport: Send {
    /// Write all bytes and flush.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Drain whatever is buffered, after a short settle delay. Returns an
    /// empty vector when the modem stayed quiet.
    fn read_available(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Read one line, blocking up to the configured read timeout.
    /// `Ok(None)` on a quiet timeout; `Err` only on device loss.
    fn read_line(&mut self) -> Result<Option<String>, TransportError>;

    fn reset_input(&mut self) -> Result<(), TransportError>;
    fn reset_output(&mut self) -> Result<(), TransportError>;
}

/// Strip NUL bytes and control garbage (except CR/LF/TAB) that stale modem
/// buffers can inject, along with lossy-decode replacement characters that
/// would otherwise break line-based parsing.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|&c| c == '\r' || c == '\n' || c == '\t' || (!c.is_control() && c != '\u{FFFD}'))
        .collect()
}

/// Production transport over a real serial device.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Open `name` at `baudrate` with the given per-read timeout.
    pub fn open(name: &str, baudrate: u32, read_timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(name, baudrate)
            .timeout(read_timeout)
            .open()
            .map_err(|source| TransportError::Open {
                port: name.to_string(),
                source,
            })?;
        debug!("serial opened port={name} baudrate={baudrate}");
        Ok(Self {
            port,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        debug!("serial closed port={}", self.name);
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        std::thread::sleep(SETTLE_DELAY);
        let buffered = self.port.bytes_to_read()? as usize;
        if buffered == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; buffered];
        let read = self.port.read(&mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if line.is_empty() {
                        return Ok(None);
                    }
                    // Surface the partial line rather than dropping it.
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(sanitize_text(&String::from_utf8_lossy(&line))))
    }

    fn reset_input(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn reset_output(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::Output)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::sanitize_text;

    #[test]
    fn sanitize_strips_control_garbage() {
        let cleaned = sanitize_text("\u{0}+CMTI: \"SM\",7\r\nOK\u{FFFD}");
        assert_eq!(cleaned, "+CMTI: \"SM\",7\r\nOK");
    }

    #[test]
    fn sanitize_keeps_plain_text() {
        assert_eq!(sanitize_text("Ma OTP: 482913"), "Ma OTP: 482913");
    }
}
