//! Telemetry Agent - Main Entry Point
//!
//! Storage bootstrap, then link, broker session and the sampling loop until
//! SIGINT or SIGTERM.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use telemetry_agent::config::{AdcBackend, AgentConfig};
use telemetry_agent::link::HostLinkDriver;
use telemetry_agent::observability::{
    init_default_logging, init_logging, logging::parse_spans_flag, metrics, LogFormat,
};
use telemetry_agent::sensor::{iio::IioAdc, simulated::SimulatedAdc, AdcReader};
use telemetry_agent::storage::{init_storage, FileStorage};
use telemetry_agent::transport::mqtt::{parse_broker_url, MqttSession};
use telemetry_agent::{AgentError, AgentResult, TelemetryAgent};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};

/// Sensor telemetry agent
#[derive(Parser)]
#[command(name = "telemetry-agent")]
#[command(about = "Publishes calibrated sensor readings to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TELEMETRY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_observability(cli.verbose);

    info!("Starting telemetry agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await.map_err(Into::into),
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_observability(verbose: u8) {
    let level = match verbose {
        0 => return init_default_logging(),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let format =
        LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()));
    let include_spans = parse_spans_flag(&std::env::var("LOG_SPANS").unwrap_or_default());
    init_logging(level, format, include_spans);
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for path_str in ["telemetry.toml", "config/telemetry.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AgentConfig::load_from_file(&path)?);
        }
    }

    warn!("No configuration file found, using the compiled-in channel table");
    let config = AgentConfig::reference();
    config.validate()?;
    Ok(config)
}

fn build_adc(config: &AgentConfig) -> Box<dyn AdcReader> {
    match config.adc.backend {
        AdcBackend::Simulated => {
            info!("Using simulated ADC");
            Box::new(SimulatedAdc::new(config.adc.width))
        }
        AdcBackend::Iio => {
            info!(device = %config.adc.iio_device.display(), "Using IIO ADC");
            Box::new(IioAdc::new(&config.adc.iio_device))
        }
    }
}

struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
}

impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }
}

/// Flip the shutdown flag on SIGINT or SIGTERM
async fn forward_shutdown_signals(
    ShutdownSignals {
        mut sigint,
        mut sigterm,
    }: ShutdownSignals,
    shutdown_tx: watch::Sender<bool>,
) {
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    let _ = shutdown_tx.send(true);
}

async fn run_agent(config: AgentConfig) -> AgentResult<()> {
    info!("Application starting with agent ID: {}", config.agent.id);
    metrics().set_agent_state("initializing");

    let mut storage = FileStorage::new(&config.storage.path);
    init_storage(&mut storage)?;

    let broker = parse_broker_url(&config.mqtt.broker_url)?;
    let driver = HostLinkDriver::new(
        broker.host.clone(),
        broker.port,
        config.link.probe_timeout(),
    );
    let transport = MqttSession::new(&config.agent.id, config.mqtt.clone())?;
    let adc = build_adc(&config);

    // Without handlers the agent could never be stopped cleanly
    let signals = ShutdownSignals::install().map_err(|e| {
        error!("Cannot install SIGINT/SIGTERM handlers: {}", e);
        AgentError::Signals(e)
    })?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown_signals(signals, shutdown_tx));

    let mut agent = TelemetryAgent::new(config, driver, transport, adc);
    let result = agent.run(shutdown_rx).await;

    info!(metrics = %metrics().get_metrics().to_json(), "Final metrics");

    let iterations = result?;
    info!(iterations, "Sampling loop finished");
    Ok(())
}

fn handle_config_command(
    mut config: AgentConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    if show {
        if !config.link.passphrase.is_empty() {
            config.link.passphrase = "<redacted>".to_string();
        }
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
