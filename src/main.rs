//! BobNet sensor node - Main Entry Point

use bobnet_sensors::agent::{AgentLifecycle, ShutdownReason};
use bobnet_sensors::config::SensorsConfig;
use bobnet_sensors::looper::Looper;
use bobnet_sensors::observability::{init_logging, logging, LogFormat};
use bobnet_sensors::protocol::DataMessage;
use bobnet_sensors::sensors::{DeviceRegistry, Sensors};
use bobnet_sensors::transport::mqtt::{ConnectionSettings, MqttConnection};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info, Level};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["bobnet.toml", "config/bobnet.toml"];

/// Sensor node forwarding readings to an MQTT device bridge
#[derive(Parser)]
#[command(name = "bobnet-sensors")]
#[command(about = "Sensor node forwarding readings to an MQTT device bridge")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the configured sensors until interrupted
    Run,
    /// Validate the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Publish a single reading and exit
    Send {
        /// Reading payload, a JSON object
        #[arg(long, default_value = r#"{"message": "value"}"#)]
        data: String,

        /// Device name the reading is reported under
        #[arg(long, default_value = "cli")]
        device: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => logging::default_level(),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    init_logging(
        level,
        LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default()),
        logging::parse_spans(&std::env::var("LOG_SPANS").unwrap_or_default()),
    );

    info!("Starting bobnet-sensors v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Send { data, device } => send_reading(config, &device, &data).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<SensorsConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(SensorsConfig::load_from_file(path)?);
    }

    let path = DEFAULT_CONFIG_PATHS
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .ok_or("No configuration file found. Provide one with -c/--config or create bobnet.toml")?;

    info!("Loading configuration from: {}", path.display());
    Ok(SensorsConfig::load_from_file(path)?)
}

async fn connect(
    config: &SensorsConfig,
    looper: Looper,
) -> Result<MqttConnection, Box<dyn std::error::Error>> {
    let settings = ConnectionSettings::from_config(&config.iotcore).await?;
    Ok(MqttConnection::new(settings, looper))
}

async fn run_agent(config: SensorsConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(device_id = %config.iotcore.device_id, "Application starting");

    let registry = DeviceRegistry::with_builtin();
    let sensors = Sensors::from_config(&config.sensors, &registry)?;

    let looper = Looper::new();
    let transport = connect(&config, looper.clone()).await?;
    let mut agent = AgentLifecycle::new(transport, sensors, looper);

    agent.start().await?;
    info!("Agent is running");

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let shutdown_signal = async {
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
    };

    let reason = agent.wait_for_shutdown(shutdown_signal).await;
    agent.shutdown().await?;

    match reason {
        ShutdownReason::Signal => Ok(()),
        ShutdownReason::TransportFailure(state) => {
            Err(format!("Transport failed fatally: {state:?}").into())
        }
    }
}

fn handle_config_command(
    config: &SensorsConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = DeviceRegistry::with_builtin();
    let sensors = Sensors::from_config(&config.sensors, &registry)?;

    if show {
        let mut shown = config.clone();
        if shown.iotcore.private_key.is_some() {
            shown.iotcore.private_key = Some("***".to_string());
        }
        println!("{}", toml::to_string_pretty(&shown)?);
    }

    info!(sensors = sensors.len(), "Configuration validation complete");
    Ok(())
}

async fn send_reading(
    config: SensorsConfig,
    device: &str,
    data: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let data: Map<String, Value> = serde_json::from_str(data)?;

    let connection = connect(&config, Looper::new()).await?;
    connection.connect().await?;

    let result = connection
        .publish(&DataMessage::new(device, data).into())
        .await;
    connection.disconnect().await?;
    result?;

    info!(device = %device, "Reading sent");
    Ok(())
}
