#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

//! otp-harvester library — the building blocks of the modem OTP pipeline.
//!
//! - `supervisor` — port scanning and worker lifecycle
//! - `probe` — AT handshake identifying SMS-capable modems
//! - `modem` — per-port AT session driver
//! - `worker` — SMS → OTP → cache pipeline
//! - `codec` — pure parsers for `+CMGL`/`+CMGR`/`+CMTI`/`+CUSD`/`+CNUM`
//! - `otp` — regex OTP extraction
//! - `cache` — short-TTL Redis store for harvested OTPs
//! - `transport` — serial byte transport with timeouts
//! - `config` — environment configuration

pub mod cache;
pub mod codec;
pub mod config;
pub mod modem;
pub mod otp;
pub mod probe;
pub mod supervisor;
pub mod transport;
pub mod worker;

// Re-export key types at crate root for convenience.
pub use cache::{OtpMessage, OtpStore, RedisOtpCache};
pub use config::AppConfig;
pub use otp::OtpExtractor;
pub use supervisor::PortSupervisor;
