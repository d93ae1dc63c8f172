//! Short-TTL OTP store.
//!
//! Workers publish one entry per harvested SMS, keyed by the prefixed sender.
//! Concurrent messages from the same sender overwrite each other on purpose:
//! OTPs are short-lived and the latest wins. Caching is best-effort — a put
//! that fails is logged and forgotten, never propagated into the SMS loop.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use redis::Commands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One harvested SMS, as published to the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpMessage {
    /// Extracted one-time password; empty when none was found.
    pub otp: String,
    pub sender: String,
    pub text: String,
    /// Service-center timestamp, verbatim from the modem.
    pub timestamp: String,
    /// When this process read the message.
    pub received_at: DateTime<Utc>,
    pub port: String,
    pub imei: String,
    #[serde(rename = "index")]
    pub sms_index: u32,
    /// Receiving SIM's own number. Not part of the wire payload.
    #[serde(skip)]
    pub msisdn: String,
}

/// Two-method contract every cache backend satisfies.
pub trait OtpStore: Send + Sync {
    /// Store `message` under the sender's key with the configured TTL.
    /// Best-effort: failures are logged, never propagated.
    fn put(&self, sender: &str, message: &OtpMessage);

    /// Latest payload for `sender`; `None` on miss or any backend error.
    fn get(&self, sender: &str) -> Option<OtpMessage>;
}

fn cache_key(prefix: &str, sender: &str) -> String {
    let sender = if sender.is_empty() { "unknown" } else { sender };
    format!("{prefix}{sender}")
}

/// Redis-backed store shared by all workers.
///
/// Holds one lazily established connection behind a mutex; a connection-level
/// failure drops it so the next call reconnects.
pub struct RedisOtpCache {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
    ttl_seconds: u64,
    key_prefix: String,
}

impl RedisOtpCache {
    /// Validate the URL and prepare a client. No connection is made yet —
    /// Redis may come up after the harvester does.
    pub fn open(url: &str, ttl_seconds: u64, key_prefix: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            ttl_seconds,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn key(&self, sender: &str) -> String {
        cache_key(&self.key_prefix, sender)
    }

    /// Run `op` on the shared connection, establishing it first if needed.
    /// A dropped link is discarded so the next call dials again.
    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> redis::RedisResult<T> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.client.get_connection()?,
        };
        let result = op(&mut conn);
        match &result {
            Err(e) if e.is_connection_dropped() || e.is_io_error() => {
                debug!("redis connection dropped: {e}");
            }
            _ => *guard = Some(conn),
        }
        result
    }
}

impl OtpStore for RedisOtpCache {
    fn put(&self, sender: &str, message: &OtpMessage) {
        let key = self.key(sender);
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("put key={key} serialize err={e}");
                return;
            }
        };
        let result = self.with_conn(|conn| {
            redis::cmd("SETEX")
                .arg(&key)
                .arg(self.ttl_seconds)
                .arg(payload.as_str())
                .query::<()>(conn)
        });
        match result {
            Ok(()) => {
                info!("put: {key}");
                debug!("put payload key={key} payload={payload}");
            }
            Err(e) => warn!("put key={key} err={e}"),
        }
    }

    fn get(&self, sender: &str) -> Option<OtpMessage> {
        let key = self.key(sender);
        let value: Option<String> = self.with_conn(|conn| conn.get(&key)).ok()?;
        serde_json::from_str(&value?).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message() -> OtpMessage {
        OtpMessage {
            otp: "482913".to_string(),
            sender: "VCB".to_string(),
            text: "Mã OTP: 482913".to_string(),
            timestamp: "25/01/10,12:34:56+28".to_string(),
            received_at: Utc.with_ymd_and_hms(2025, 1, 10, 5, 34, 56).unwrap(),
            port: "/dev/ttyUSB0".to_string(),
            imei: "123456789012345".to_string(),
            sms_index: 7,
            msisdn: "0912345678".to_string(),
        }
    }

    #[test]
    fn key_uses_prefix_and_falls_back_to_unknown() {
        assert_eq!(cache_key("otp:", "VCB"), "otp:VCB");
        assert_eq!(cache_key("otp:", ""), "otp:unknown");
        assert_eq!(cache_key("", "VCB"), "VCB");
    }

    #[test]
    fn wire_payload_shape() {
        let json = serde_json::to_string(&message()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let obj = value.as_object().unwrap();
        for field in ["otp", "sender", "text", "timestamp", "received_at", "port", "imei", "index"] {
            assert!(obj.contains_key(field), "missing {field}");
        }
        // msisdn never crosses the wire
        assert!(!obj.contains_key("msisdn"));
        assert_eq!(obj["index"], 7);
        // non-ASCII preserved, not \u-escaped
        assert!(json.contains("Mã"));
        // ISO-8601 UTC
        assert!(obj["received_at"].as_str().unwrap().starts_with("2025-01-10T05:34:56"));
    }

    #[test]
    fn payload_round_trips() {
        let json = serde_json::to_string(&message()).unwrap();
        let back: OtpMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.otp, "482913");
        assert_eq!(back.sms_index, 7);
        assert_eq!(back.msisdn, "");
    }
}
