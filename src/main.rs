#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! # otp-harvester
//!
//! Supervises a bank of GSM modems attached over serial ports: probes each
//! enumerable port for an SMS-capable modem, runs one worker per modem that
//! subscribes to inbound SMS, extracts one-time passwords, and publishes
//! them to Redis with a short TTL so sibling processes can consume them.
//!
//! Configuration is environment-only (see `config`); the process shuts down
//! cleanly on SIGINT/SIGTERM.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use otp_harvester::{
    cache::RedisOtpCache,
    config::AppConfig,
    otp::OtpExtractor,
    probe::{ProbeConfig, SerialProber},
    supervisor::PortSupervisor,
    worker::SmsWorkerFactory,
};

/// SMS OTP harvester over a bank of serial GSM modems.
#[derive(Parser)]
#[command(name = "otp-harvester", version)]
struct Cli {}

#[tokio::main]
async fn main() {
    let _cli = Cli::parse();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config) {
        eprintln!("cannot open log file {}: {e}", config.log_file);
        std::process::exit(1);
    }

    info!("otp-harvester v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "ports={:?} baud={} scan={:?} probe_timeout={:?} intake={:?}",
        config.manual_ports, config.baudrate, config.scan_interval, config.probe_timeout,
        config.intake
    );

    let cache = match RedisOtpCache::open(
        &config.redis_url,
        config.otp_ttl_seconds,
        &config.otp_key_prefix,
    ) {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            error!("invalid REDIS_URL {:?}: {e}", config.redis_url);
            std::process::exit(1);
        }
    };
    let extractor = Arc::new(OtpExtractor::new(&config.otp_regex));

    let prober = Arc::new(SerialProber::new(
        config.manual_ports.clone(),
        ProbeConfig::new(config.baudrate, config.probe_timeout),
    ));
    let scan_interval = config.scan_interval;
    let factory = Arc::new(SmsWorkerFactory {
        cfg: Arc::new(config),
        cache,
        extractor,
    });

    let supervisor = Arc::new(PortSupervisor::new(scan_interval, prober, factory));

    let run_loop = supervisor.clone();
    let mut supervisor_task = tokio::task::spawn_blocking(move || run_loop.run());

    tokio::select! {
        () = shutdown_signal() => {
            supervisor.stop();
            if let Err(e) = supervisor_task.await {
                error!("supervisor thread panicked: {e}");
            }
        }
        result = &mut supervisor_task => {
            match result {
                Ok(()) => warn!("supervisor loop exited before shutdown signal"),
                Err(e) => error!("supervisor thread panicked: {e}"),
            }
        }
    }

    info!("Goodbye");
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

/// Two fmt layers: stderr and the append-mode log file, both honoring
/// `RUST_LOG` over the configured level.
fn init_tracing(config: &AppConfig) -> std::io::Result<()> {
    if let Some(dir) = Path::new(&config.log_file).parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_lowercase()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(Arc::new(file)),
        )
        .init();
    Ok(())
}
