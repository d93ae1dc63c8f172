//! Per-modem worker: turns inbound SMS on one port into cache entries.
//!
//! A worker owns its port for as long as the modem answers. It initializes
//! the session, resolves the SIM's own number, wipes stale storage, then
//! harvests messages either URC-driven (`+CMTI` notifications, the default)
//! or by polling `AT+CMGL="REC UNREAD"` for modems that drop URCs under
//! load. Transport loss ends the worker; the supervisor reaps it and the
//! port becomes probeable again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cache::{OtpMessage, OtpStore};
use crate::codec::{self, Sms};
use crate::config::{AppConfig, IntakeMode};
use crate::modem::{ModemSession, SessionState};
use crate::otp::OtpExtractor;
use crate::supervisor::{SessionFactory, SessionRunner};
use crate::transport::{SerialTransport, Transport, TransportError};

/// Granularity of stop-flag checks while sleeping between poll rounds.
const SLEEP_SLICE: Duration = Duration::from_millis(200);

pub struct SmsWorker {
    port: String,
    imei: String,
    cfg: Arc<AppConfig>,
    cache: Arc<dyn OtpStore>,
    extractor: Arc<OtpExtractor>,
}

impl SmsWorker {
    pub fn new(
        port: &str,
        imei: &str,
        cfg: Arc<AppConfig>,
        cache: Arc<dyn OtpStore>,
        extractor: Arc<OtpExtractor>,
    ) -> Self {
        Self {
            port: port.to_string(),
            imei: imei.to_string(),
            cfg,
            cache,
            extractor,
        }
    }

    fn run_session<T: Transport>(
        &self,
        session: &ModemSession<T>,
        stop: &AtomicBool,
    ) -> Result<(), TransportError> {
        session.init_for_sms();
        info!("connected imei={} port={}", self.imei, self.port);

        let msisdn = session.resolve_msisdn(&self.cfg.ussd_msisdn_code);
        info!("msisdn imei={} value={msisdn:?}", self.imei);

        if let Err(e) = session.delete_all_sms() {
            warn!("delete-all failed imei={} err={e}", self.imei);
        }

        match self.cfg.intake {
            IntakeMode::Urc => self.listen_urc(session, &msisdn, stop),
            IntakeMode::Poll => self.poll_unread(session, &msisdn, stop),
        }
    }

    /// URC intake: the listen loop is the sole transport reader. Each
    /// `+CMTI` index is fetched, parsed and pushed through the pipeline.
    fn listen_urc<T: Transport>(
        &self,
        session: &ModemSession<T>,
        msisdn: &str,
        stop: &AtomicBool,
    ) -> Result<(), TransportError> {
        session.enter(SessionState::IdleListening);
        while !stop.load(Ordering::Relaxed) {
            let Some(line) = session.read_line()? else {
                continue;
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with("+CME ERROR") {
                continue;
            }
            if line.starts_with("+CMTI") {
                session.enter(SessionState::HandlingUrc);
                match codec::parse_cmti(line) {
                    Ok(index) => {
                        debug!("sms arrived imei={} idx={index}", self.imei);
                        self.handle_sms(session, index, msisdn);
                    }
                    Err(e) => warn!("bad CMTI imei={} err={e}", self.imei),
                }
                session.enter(SessionState::IdleListening);
            }
            // Anything else is noise for this pipeline.
        }
        Ok(())
    }

    /// Polling intake for modems that drop `+CMTI` under load.
    fn poll_unread<T: Transport>(
        &self,
        session: &ModemSession<T>,
        msisdn: &str,
        stop: &AtomicBool,
    ) -> Result<(), TransportError> {
        session.enter(SessionState::IdleListening);
        while !stop.load(Ordering::Relaxed) {
            let resp = session.list_unread()?;
            for mut sms in codec::parse_cmgl(&resp) {
                sms.text = codec::decode_ucs2_if_hex(&sms.text);
                self.publish(session, &sms, msisdn);
            }

            let mut slept = Duration::ZERO;
            while slept < self.cfg.poll_interval && !stop.load(Ordering::Relaxed) {
                std::thread::sleep(SLEEP_SLICE.min(self.cfg.poll_interval - slept));
                slept += SLEEP_SLICE;
            }
        }
        Ok(())
    }

    /// Fetch one stored message and push it through the pipeline. Read and
    /// parse failures drop the message with a log line — never a partial
    /// publish.
    fn handle_sms<T: Transport>(&self, session: &ModemSession<T>, index: u32, msisdn: &str) {
        let resp = match session.read_sms(index) {
            Ok(resp) => resp,
            Err(e) => {
                warn!("CMGR failed imei={} idx={index} err={e}", self.imei);
                return;
            }
        };
        match codec::parse_cmgr(&resp, index) {
            Ok(sms) => self.publish(session, &sms, msisdn),
            Err(e) => warn!("dropping unparsable SMS imei={} idx={index} err={e}", self.imei),
        }
    }

    /// Extract the OTP and publish. Only messages that actually carry an
    /// OTP reach the cache; everything gets deleted when configured to.
    fn publish<T: Transport>(&self, session: &ModemSession<T>, sms: &Sms, msisdn: &str) {
        match self.extractor.extract(&sms.text) {
            Some(otp) => {
                let message = OtpMessage {
                    otp: otp.clone(),
                    sender: sms.sender.clone(),
                    text: sms.text.clone(),
                    timestamp: sms.timestamp.clone(),
                    received_at: Utc::now(),
                    port: self.port.clone(),
                    imei: self.imei.clone(),
                    sms_index: sms.index,
                    msisdn: msisdn.to_string(),
                };
                self.cache.put(&sms.sender, &message);
                info!(
                    "PUSH imei={} port={} sender={} otp={otp} idx={}",
                    self.imei, self.port, sms.sender, sms.index
                );
            }
            None => info!(
                "NO_OTP imei={} port={} sender={} idx={}",
                self.imei, self.port, sms.sender, sms.index
            ),
        }
        if self.cfg.delete_after_read {
            if let Err(e) = session.delete_sms(sms.index) {
                warn!("CMGD failed imei={} idx={} err={e}", self.imei, sms.index);
            }
        }
    }
}

impl SessionRunner for SmsWorker {
    fn run(self: Box<Self>, stop: Arc<AtomicBool>) {
        let transport =
            match SerialTransport::open(&self.port, self.cfg.baudrate, self.cfg.serial_timeout) {
                Ok(t) => t,
                Err(e) => {
                    error!("DISCONNECTED imei={} port={} err={e}", self.imei, self.port);
                    return;
                }
            };
        let session = ModemSession::new(transport, &self.port);
        match self.run_session(&session, &stop) {
            Ok(()) => info!("stopped imei={} port={}", self.imei, self.port),
            Err(e) => error!("DISCONNECTED imei={} port={} err={e}", self.imei, self.port),
        }
        session.close();
    }
}

/// Binds the shared config, cache and extractor once at startup; the
/// supervisor calls it for every newly probed modem.
pub struct SmsWorkerFactory {
    pub cfg: Arc<AppConfig>,
    pub cache: Arc<dyn OtpStore>,
    pub extractor: Arc<OtpExtractor>,
}

impl SessionFactory for SmsWorkerFactory {
    fn create(&self, port: &str, imei: &str) -> Box<dyn SessionRunner> {
        Box::new(SmsWorker::new(
            port,
            imei,
            self.cfg.clone(),
            self.cache.clone(),
            self.extractor.clone(),
        ))
    }
}
