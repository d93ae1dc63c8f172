//! Configuration loading and defaults.
//!
//! Everything comes from environment variables, read once at startup into an
//! immutable [`AppConfig`]. All variables are optional:
//!
//! | Variable | Default |
//! |---|---|
//! | `SERIAL_PORTS` | empty — scan every enumerable port |
//! | `BAUDRATE` | `115200` |
//! | `SCAN_INTERVAL_SECONDS` | `3.0` |
//! | `PROBE_TIMEOUT_SECONDS` | `1.2` |
//! | `SERIAL_TIMEOUT_SECONDS` | `2.0` |
//! | `POLL_INTERVAL_SECONDS` | `2.0` |
//! | `REDIS_URL` | `redis://localhost:6379/0` |
//! | `OTP_TTL_SECONDS` | `300` |
//! | `OTP_KEY_PREFIX` | `otp:` |
//! | `OTP_REGEX` | `\b(\d{4,8})\b` |
//! | `DELETE_AFTER_READ` | `true` |
//! | `SMS_INTAKE` | `urc` (`poll` switches to CMGL polling) |
//! | `USSD_MSISDN_CODE` | `*101#` |
//! | `LOG_LEVEL` | `INFO` (`RUST_LOG` overrides) |
//! | `LOG_FILE` | `logs/app.log` |
//!
//! Malformed values are a startup error; the process exits non-zero.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: expected a number, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var}: expected a boolean (1/true/yes/y/on or 0/false/no/n/off), got {value:?}")]
    InvalidBool { var: &'static str, value: String },
    #[error("SMS_INTAKE: expected \"urc\" or \"poll\", got {0:?}")]
    InvalidIntake(String),
    #[error("LOG_LEVEL: expected trace/debug/info/warn/error, got {0:?}")]
    InvalidLogLevel(String),
    #[error("{var}: must be positive")]
    NonPositive { var: &'static str },
}

/// How inbound SMS are picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeMode {
    /// `+CMTI` URCs announce each stored message (default).
    Urc,
    /// Poll `AT+CMGL="REC UNREAD"` — for modems that drop URCs under load.
    Poll,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Allow-list of port names; `None` scans everything enumerable.
    pub manual_ports: Option<Vec<String>>,
    pub baudrate: u32,
    pub scan_interval: Duration,
    pub probe_timeout: Duration,
    pub serial_timeout: Duration,
    pub poll_interval: Duration,
    pub redis_url: String,
    pub otp_ttl_seconds: u64,
    pub otp_key_prefix: String,
    pub otp_regex: String,
    pub delete_after_read: bool,
    pub intake: IntakeMode,
    pub ussd_msisdn_code: String,
    pub log_level: String,
    pub log_file: String,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_env(|var| std::env::var(var).ok())
    }

    fn from_env(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let ports_raw = get("SERIAL_PORTS").unwrap_or_default();
        let manual_ports: Vec<String> = ports_raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(ToString::to_string)
            .collect();

        let log_level = env_str(&get, "LOG_LEVEL", "INFO");
        if !matches!(
            log_level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::InvalidLogLevel(log_level));
        }

        Ok(Self {
            manual_ports: if manual_ports.is_empty() {
                None
            } else {
                Some(manual_ports)
            },
            baudrate: env_u32(&get, "BAUDRATE", 115_200)?,
            scan_interval: env_secs(&get, "SCAN_INTERVAL_SECONDS", 3.0)?,
            probe_timeout: env_secs(&get, "PROBE_TIMEOUT_SECONDS", 1.2)?,
            serial_timeout: env_secs(&get, "SERIAL_TIMEOUT_SECONDS", 2.0)?,
            poll_interval: env_secs(&get, "POLL_INTERVAL_SECONDS", 2.0)?,
            redis_url: env_str(&get, "REDIS_URL", "redis://localhost:6379/0"),
            otp_ttl_seconds: env_u64(&get, "OTP_TTL_SECONDS", 300)?,
            otp_key_prefix: env_str(&get, "OTP_KEY_PREFIX", "otp:"),
            otp_regex: env_str(&get, "OTP_REGEX", r"\b(\d{4,8})\b"),
            delete_after_read: env_bool(&get, "DELETE_AFTER_READ", true)?,
            intake: parse_intake(&env_str(&get, "SMS_INTAKE", "urc"))?,
            ussd_msisdn_code: env_str(&get, "USSD_MSISDN_CODE", "*101#"),
            log_level,
            log_file: env_str(&get, "LOG_FILE", "logs/app.log"),
        })
    }
}

fn env_str(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: &str) -> String {
    match get(var) {
        Some(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_secs(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: f64,
) -> Result<Duration, ConfigError> {
    let value = match get(var) {
        Some(value) if !value.trim().is_empty() => value,
        _ => return Ok(Duration::from_secs_f64(default)),
    };
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber { var, value: value.clone() })?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::NonPositive { var });
    }
    Ok(Duration::from_secs_f64(secs))
}

fn env_u64(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    let value = match get(var) {
        Some(value) if !value.trim().is_empty() => value,
        _ => return Ok(default),
    };
    let parsed = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber { var, value: value.clone() })?;
    if parsed == 0 {
        return Err(ConfigError::NonPositive { var });
    }
    Ok(parsed)
}

fn env_u32(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u32,
) -> Result<u32, ConfigError> {
    let value = env_u64(get, var, u64::from(default))?;
    u32::try_from(value).map_err(|_| ConfigError::InvalidNumber {
        var,
        value: value.to_string(),
    })
}

fn env_bool(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(value) = get(var) else {
        return Ok(default);
    };
    match value.trim().to_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool { var, value }),
    }
}

fn parse_intake(value: &str) -> Result<IntakeMode, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "urc" => Ok(IntakeMode::Urc),
        "poll" => Ok(IntakeMode::Poll),
        _ => Err(ConfigError::InvalidIntake(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AppConfig::from_env(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_with_empty_environment() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.manual_ports, None);
        assert_eq!(cfg.baudrate, 115_200);
        assert_eq!(cfg.scan_interval, Duration::from_secs(3));
        assert_eq!(cfg.probe_timeout, Duration::from_millis(1200));
        assert_eq!(cfg.redis_url, "redis://localhost:6379/0");
        assert_eq!(cfg.otp_ttl_seconds, 300);
        assert_eq!(cfg.otp_key_prefix, "otp:");
        assert!(cfg.delete_after_read);
        assert_eq!(cfg.intake, IntakeMode::Urc);
        assert_eq!(cfg.ussd_msisdn_code, "*101#");
        assert_eq!(cfg.log_file, "logs/app.log");
    }

    #[test]
    fn port_list_is_split_and_trimmed() {
        let cfg = load(&[("SERIAL_PORTS", "/dev/ttyUSB0, /dev/ttyUSB2 ,")]).unwrap();
        assert_eq!(
            cfg.manual_ports.as_deref(),
            Some(&["/dev/ttyUSB0".to_string(), "/dev/ttyUSB2".to_string()][..])
        );
    }

    #[test]
    fn fractional_durations_parse() {
        let cfg = load(&[("PROBE_TIMEOUT_SECONDS", "0.5")]).unwrap();
        assert_eq!(cfg.probe_timeout, Duration::from_millis(500));
    }

    #[test]
    fn malformed_values_are_startup_errors() {
        assert!(matches!(
            load(&[("BAUDRATE", "fast")]),
            Err(ConfigError::InvalidNumber { var: "BAUDRATE", .. })
        ));
        assert!(matches!(
            load(&[("SCAN_INTERVAL_SECONDS", "-1")]),
            Err(ConfigError::NonPositive { var: "SCAN_INTERVAL_SECONDS" })
        ));
        assert!(matches!(
            load(&[("DELETE_AFTER_READ", "maybe")]),
            Err(ConfigError::InvalidBool { var: "DELETE_AFTER_READ", .. })
        ));
        assert!(matches!(
            load(&[("SMS_INTAKE", "push")]),
            Err(ConfigError::InvalidIntake(_))
        ));
        assert!(matches!(
            load(&[("LOG_LEVEL", "verbose")]),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn bool_synonyms() {
        for truthy in ["1", "true", "YES", "y", "On"] {
            assert!(load(&[("DELETE_AFTER_READ", truthy)]).unwrap().delete_after_read);
        }
        for falsy in ["0", "false", "NO", "n", "Off"] {
            assert!(!load(&[("DELETE_AFTER_READ", falsy)]).unwrap().delete_after_read);
        }
    }

    #[test]
    fn intake_mode_parses_case_insensitively() {
        assert_eq!(load(&[("SMS_INTAKE", "POLL")]).unwrap().intake, IntakeMode::Poll);
        assert_eq!(load(&[("SMS_INTAKE", "urc")]).unwrap().intake, IntakeMode::Urc);
    }
}
