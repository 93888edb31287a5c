//! Powerline modem gateway binary.
//!
//! Connects to a modem (or discovers one among candidate ports), verifies it
//! answers the identity query, logs everything it reports, and optionally
//! sends a list of hex encoded commands once the modem is verified.

use clap::Parser;
use plm_session::{ConnectionManager, PlmEvent, PortInfo, TcpTransport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::PlmConfig;
use logging::PlmLogFormatter;

/// Verified connection to an Insteon powerline modem
#[derive(Parser, Debug)]
#[command(name = "plm-gateway", version, about = "Verified connection to an Insteon powerline modem")]
struct Args {
    /// Configuration file path (YAML, `plm:` section)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Modem address, e.g. 192.168.1.40:9761
    #[arg(long)]
    address: Option<String>,

    /// Search the candidate ports for a modem
    #[arg(long)]
    discover: bool,

    /// Candidate address for discovery (repeatable)
    #[arg(long)]
    candidate: Vec<String>,

    /// Trust the transport as soon as it opens
    #[arg(long)]
    no_verify: bool,

    /// Interval between identity probes, e.g. 1s
    #[arg(long)]
    handshake_interval: Option<humantime::Duration>,

    /// Retries after the first identity probe
    #[arg(long)]
    max_handshake_attempts: Option<u32>,

    /// Verification deadline, e.g. 10s
    #[arg(long)]
    watchdog: Option<humantime::Duration>,

    /// Hex command to send once the modem is verified (repeatable), e.g. "02 6D"
    #[arg(long)]
    send: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command line flags take precedence over file and environment
    fn apply_to(&self, config: &mut PlmConfig) {
        if let Some(address) = &self.address {
            config.connection.address = Some(address.clone());
        }
        if self.discover {
            config.discover = true;
        }
        if !self.candidate.is_empty() {
            config.candidates = self.candidate.clone();
        }
        if self.no_verify {
            config.connection.verify_connection = false;
        }
        if let Some(interval) = &self.handshake_interval {
            config.connection.handshake_interval_ms = millis(interval);
        }
        if let Some(attempts) = self.max_handshake_attempts {
            config.connection.max_handshake_attempts = attempts;
        }
        if let Some(watchdog) = &self.watchdog {
            config.connection.watchdog_delay_ms = millis(watchdog);
        }
    }
}

fn millis(duration: &humantime::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("plm_gateway={}", args.log_level).parse()?)
        .add_directive(format!("plm_session={}", args.log_level).parse()?)
        .add_directive(format!("plm_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(PlmLogFormatter::new("plm-gateway"))
        .init();

    info!("Starting PLM gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = PlmConfig::load(args.config.as_deref())?;
    args.apply_to(&mut config);

    if !config.discover && config.connection.address.is_none() {
        anyhow::bail!("no modem address configured; pass --address or --discover");
    }

    let transport = Arc::new(TcpTransport::new(
        config.candidates.iter().map(PortInfo::new).collect(),
    ));
    let mut connection = config.connection.clone();
    if config.discover {
        // Discovery picks the address
        connection.address = None;
    }

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let plm = ConnectionManager::spawn(connection, transport, events_tx);

    if config.discover {
        let ports = plm.discover().await?;
        component_info!("discovery", "Searching {} candidate ports", ports.len());
    }

    let mut pending_sends = args.send.clone();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

    info!("Gateway started. Waiting for events...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }

            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    component_warn!("session", "Connection manager stopped");
                    break;
                };
                match event {
                    PlmEvent::Connected { address } => {
                        component_info!("session", "Modem ready on {}", address);
                        for command in std::mem::take(&mut pending_sends) {
                            match plm.send_hex(&command).await {
                                Ok(()) => component_debug!("session", "Sent {}", command),
                                Err(e) => component_warn!("session", "Failed to send {:?}: {}", command, e),
                            }
                        }
                    }
                    PlmEvent::Disconnected { address } => {
                        component_warn!("session", "Disconnected from {}", address);
                    }
                    PlmEvent::VerificationFailed { address } => {
                        component_warn!("session", "No modem answered on {}", address);
                    }
                    PlmEvent::Data(message) => {
                        component_info!(
                            "data",
                            "{}: {}",
                            message.type_name(),
                            hex::encode_upper(&message.raw)
                        );
                    }
                    PlmEvent::DiscoveryExhausted => {
                        component_error!("discovery", "No modem found on any candidate port");
                        anyhow::bail!("discovery found no modem");
                    }
                }
            }
        }
    }

    plm.disconnect();
    info!("PLM gateway shutdown complete");
    Ok(())
}
