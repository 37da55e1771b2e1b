//! Charge point simulator CLI
//!
//! Connects one simulated charge point to a CSMS, runs a single charging
//! session and disconnects.
//!
//! # Usage
//!
//! ```bash
//! # One-minute session against a local CSMS
//! cpsim-node --url ws://localhost:8180/ocpp --station CP001 --id-tag User123
//!
//! # OCPP 2.0.1, meter values every 10s, charge until Ctrl-C
//! cpsim-node --url ws://localhost:9000 --station CP002 --id-tag User123 \
//!     --ocpp-version 2.0.1 --interval 10 --charge-secs 0
//!
//! # Settings from a JSON file, flags override
//! cpsim-node --config station.json --log-level debug
//! ```

use std::time::Duration;

use clap::Parser;
use cpsim_engine::{
    ChargePoint, LogKind, OcppVersion, SessionState, SimulatedTransactionIds, SimulatorConfig,
    WsTransport,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Simulated OCPP charge point
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSMS WebSocket URL (station id is appended)
    #[arg(short, long)]
    url: Option<String>,

    /// Charge station id
    #[arg(short, long)]
    station: Option<String>,

    /// Id tag presented in StartTransaction
    #[arg(long)]
    id_tag: Option<String>,

    /// Connector to charge on
    #[arg(long)]
    connector: Option<u32>,

    /// Meter value interval in seconds
    #[arg(long)]
    interval: Option<u64>,

    /// OCPP version (1.6 or 2.0.1)
    #[arg(long)]
    ocpp_version: Option<OcppVersion>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<String>,

    /// How long to charge before stopping; 0 charges until Ctrl-C
    #[arg(long, default_value = "60")]
    charge_secs: u64,

    /// Draw transaction ids locally instead of reading them from the CSMS
    #[arg(long)]
    simulated_transaction_ids: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins if set
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config = build_config(&args)?;
    let connect_timeout = config.call_timeout();

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP Charge Point Simulator                     ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Station:  {:<50} ║", truncate(&config.station_id, 50));
    println!("║  CSMS URL: {:<50} ║", truncate(&config.connection_url(), 50));
    println!("║  OCPP:     {:<50} ║", config.ocpp_version.subprotocol());
    println!("║  Id tag:   {:<50} ║", truncate(&config.id_tag, 50));
    println!("║  Meter:    {:<50} ║", format!("every {}s", config.meter_interval_secs));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let cp = if args.simulated_transaction_ids {
        warn!("Transaction ids are simulated locally");
        ChargePoint::with_transaction_ids(config, WsTransport::default(), SimulatedTransactionIds)
    } else {
        ChargePoint::new(config, WsTransport::default())
    };

    // Event log to the console; failures and rejections go to stderr
    let mut log_feed = cp.subscribe_log();
    tokio::spawn(async move {
        loop {
            match log_feed.recv().await {
                Ok(entry) if matches!(entry.kind, LogKind::Failure | LogKind::Rejected) => {
                    eprintln!("{}", entry)
                }
                Ok(entry) => println!("{}", entry),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event log printer skipped {} entries", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    cp.connect()?;
    if !cp.wait_for_state(SessionState::Connected, connect_timeout).await {
        error!("CSMS did not accept the connection in time");
        let _ = cp.disconnect();
        return Err("connection failed".into());
    }

    cp.start_charging()?;
    if !cp.wait_for_start(connect_timeout).await {
        error!("StartTransaction was not accepted");
        let _ = cp.disconnect();
        return Err("charging did not start".into());
    }
    info!("Charging, transaction {:?}", cp.transaction_id());

    if args.charge_secs == 0 {
        tokio::signal::ctrl_c().await?;
    } else {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.charge_secs)) => {}
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
    }

    if cp.state() == SessionState::Charging {
        cp.stop_charging()?;
        cp.wait_for_state(SessionState::Connected, connect_timeout).await;
    }

    if cp.state() != SessionState::Disconnected {
        cp.disconnect()?;
    }
    info!("Done");

    Ok(())
}

/// File settings first, then command line overrides
fn build_config(args: &Args) -> Result<SimulatorConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SimulatorConfig::from_json_file(path)?,
        None => SimulatorConfig::default(),
    };

    if let Some(url) = &args.url {
        config.csms_url = url.clone();
    }
    if let Some(station) = &args.station {
        config.station_id = station.clone();
    }
    if let Some(id_tag) = &args.id_tag {
        config.id_tag = id_tag.clone();
    }
    if let Some(connector) = args.connector {
        config.connector_id = connector;
    }
    if let Some(interval) = args.interval {
        config.meter_interval_secs = interval;
    }
    if let Some(version) = args.ocpp_version {
        config.ocpp_version = version;
    }

    config.validate()?;
    Ok(config)
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
