//! Port supervision: scanning, probing, and worker lifecycle.
//!
//! The supervisor keeps at most one worker per modem identity. Each tick it
//! reaps dead workers first (so the busy-port set reflects live workers
//! only), enumerates candidate ports, probes the free ones, and spawns a
//! named worker thread per newly discovered modem. Worker death is a reap
//! signal, never a fatal error — the port simply becomes probeable again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Discovers candidate ports and identifies the modems behind them.
pub trait PortProber: Send + Sync {
    fn candidate_ports(&self) -> Vec<String>;

    /// `Some(imei)` when the port hosts an SMS-capable modem.
    fn probe(&self, port: &str) -> Option<String>;
}

/// Builds the per-modem pipeline. Bound once at startup.
pub trait SessionFactory: Send + Sync {
    fn create(&self, port: &str, imei: &str) -> Box<dyn SessionRunner>;
}

/// The body of a worker thread.
pub trait SessionRunner: Send {
    fn run(self: Box<Self>, stop: Arc<AtomicBool>);
}

/// A running per-modem worker, owned and mutated only by the supervisor.
pub struct WorkerHandle {
    pub imei: String,
    pub port: String,
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn join(self) {
        let imei = self.imei.clone();
        if self.thread.join().is_err() {
            warn!("worker thread panicked imei={imei}");
        }
    }
}

pub struct PortSupervisor {
    scan_interval: Duration,
    prober: Arc<dyn PortProber>,
    factory: Arc<dyn SessionFactory>,
    stopped: Mutex<bool>,
    stop_cv: Condvar,
}

impl PortSupervisor {
    pub fn new(
        scan_interval: Duration,
        prober: Arc<dyn PortProber>,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            scan_interval,
            prober,
            factory,
            stopped: Mutex::new(false),
            stop_cv: Condvar::new(),
        }
    }

    /// Request a graceful stop. Idempotent, callable from any thread.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.stop_cv.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for the scan interval, waking early on `stop()`. Returns
    /// whether a stop was requested.
    fn sleep_or_stop(&self) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .stop_cv
            .wait_timeout_while(guard, self.scan_interval, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Run the scan loop until `stop()`. Blocking; spawn it on a dedicated
    /// thread. On exit every worker is signalled and joined — they leave
    /// their read loops within one serial timeout.
    pub fn run(&self) {
        info!("supervisor started scan_interval={:?}", self.scan_interval);
        let mut workers: HashMap<String, WorkerHandle> = HashMap::new();

        while !self.is_stopped() {
            self.tick(&mut workers);
            if self.sleep_or_stop() {
                break;
            }
        }

        for handle in workers.values() {
            handle.request_stop();
        }
        for (imei, handle) in workers.drain() {
            debug!("joining worker imei={imei}");
            handle.join();
        }
        info!("supervisor stopped");
    }

    fn tick(&self, workers: &mut HashMap<String, WorkerHandle>) {
        // Reap before probing so busy ports stay consistent within the tick.
        let dead: Vec<String> = workers
            .iter()
            .filter(|(_, handle)| !handle.is_alive())
            .map(|(imei, _)| imei.clone())
            .collect();
        for imei in dead {
            if let Some(handle) = workers.remove(&imei) {
                warn!("worker dead imei={imei} (was port={})", handle.port);
                handle.join();
            }
        }

        let ports = self.prober.candidate_ports();
        let busy: HashSet<String> = workers.values().map(|h| h.port.clone()).collect();
        let candidates: Vec<String> = ports
            .into_iter()
            .filter(|port| !busy.contains(port))
            .collect();
        debug!("candidate ports={candidates:?} busy={busy:?}");

        for port in candidates {
            if self.is_stopped() {
                return;
            }
            let Some(imei) = self.prober.probe(&port) else {
                debug!("port not a modem: {port}");
                continue;
            };
            if let Some(existing) = workers.get(&imei) {
                // Modems often expose several AT channels; the first port
                // that answered keeps the identity.
                info!(
                    "duplicate imei={imei} on port={port}, already served by {}",
                    existing.port
                );
                continue;
            }
            match self.spawn_worker(&port, &imei) {
                Ok(handle) => {
                    info!("spawned worker imei={imei} port={port}");
                    workers.insert(imei, handle);
                }
                Err(e) => warn!("failed to spawn worker imei={imei} port={port} err={e}"),
            }
        }
    }

    fn spawn_worker(&self, port: &str, imei: &str) -> std::io::Result<WorkerHandle> {
        let runner = self.factory.create(port, imei);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name(format!("worker-{imei}"))
            .spawn(move || runner.run(thread_stop))?;
        Ok(WorkerHandle {
            imei: imei.to_string(),
            port: port.to_string(),
            stop,
            thread,
        })
    }
}
