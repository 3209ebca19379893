//! ==============================================================================
//! main.rs - rigbridge entry point
//! ==============================================================================
//!
//! purpose:
//!     connects a serial-attached water treatment rig to a firebase realtime
//!     database: telemetry goes up, actuator intent comes down.
//!
//! responsibilities:
//!     - parse flags and load bridge.toml (flags win)
//!     - set up tracing
//!     - authenticate against firebase, check access, prepare the control doc
//!     - open the serial port and wait for the board to reset
//!     - run the bridge until ctrl-c or until the link is lost for good
//!
//! relationships:
//!     - uses: config.rs, remote.rs, reconciler.rs, stream.rs, bridge.rs
//!
//! startup sequence:
//!
//!     flags + config -> tracing -> firebase -> check -> control doc
//!         -> serial open -> settle -> bridge.run() -> close
//!
//! exit codes:
//!     0 on ctrl-c, 1 when startup fails or the link is lost without --reconnect.
//!
//! ==============================================================================

use anyhow::{Context, Result};
use clap::Parser;
use rigbridge::bridge::Bridge;
use rigbridge::config::BridgeConfig;
use rigbridge::reconciler::ensure_control_document;
use rigbridge::remote::{check_connectivity, FirebaseStore, RemoteStore};
use rigbridge::shutdown::Shutdown;
use rigbridge::stream::{shared, SerialStream};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rigbridge", version)]
#[command(about = "Serial to Firebase bridge for the water treatment rig", long_about = None)]
struct Args {
    /// Serial port the microcontroller is attached to (e.g. /dev/ttyACM0, COM3)
    #[arg(short, long)]
    port: String,

    /// Baud rate [default: 9600]
    #[arg(short, long)]
    baud: Option<u32>,

    /// Sensor upload interval in seconds [default: 1]
    #[arg(short, long)]
    interval: Option<u64>,

    /// Keep retrying the serial port after a failed reset
    #[arg(short, long)]
    reconnect: bool,

    /// Config file (defaults to config/bridge.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR] {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging.level);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

// ==============================================================================
// startup
// ==============================================================================

fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::load_or_default(),
    };

    config.serial.port = args.port.clone();
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(interval) = args.interval {
        config.polling.upload_interval_seconds = interval;
    }
    config.serial.reconnect |= args.reconnect;

    config.validate()?;
    Ok(config)
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("{}={}", env!("CARGO_CRATE_NAME"), level).into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: BridgeConfig) -> Result<()> {
    tracing::info!("rigbridge v{} starting", env!("CARGO_PKG_VERSION"));
    config.log_summary();

    // step 1: firebase
    if config.firebase.database_url.is_empty() {
        anyhow::bail!("firebase.database_url is not set in the config file");
    }
    tracing::info!(
        "looking for firebase credentials at {}",
        config.firebase.credentials_path.display()
    );
    let remote: Arc<dyn RemoteStore> = Arc::new(FirebaseStore::from_credentials_file(
        &config.firebase.database_url,
        &config.firebase.credentials_path,
        Duration::from_secs(config.firebase.request_timeout_seconds),
    )?);
    tracing::info!("firebase initialized");

    check_connectivity(remote.as_ref()).await;

    if let Err(e) = ensure_control_document(remote.as_ref(), &config.firebase.control_path).await {
        tracing::warn!("error initializing control values: {:#}", e);
    }

    // step 2: serial
    let (port, baud) = (config.serial.port.clone(), config.serial.baud_rate);
    let serial = tokio::task::spawn_blocking(move || SerialStream::open(&port, baud))
        .await?
        .with_context(|| format!("failed to open serial port {}", config.serial.port))?;
    tokio::time::sleep(Duration::from_millis(config.serial.settle_ms)).await;

    // step 3: run until ctrl-c
    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.trigger();
        }
    });

    let bridge = Bridge::new(&config, remote, shared(serial));
    tracing::info!("bridge running, press ctrl+c to stop");
    let result = bridge.run(shutdown).await;

    tracing::info!("bridge stopped");
    result
}
