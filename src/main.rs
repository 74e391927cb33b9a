//! broker-link - Main Entry Point
//!
//! Runs a broker connection on a fixed tick, publishes one-off messages, or
//! validates a configuration file.

use broker_link::config::BridgeConfig;
use broker_link::manager::{ConnectionManager, ConnectionObserver, EventForwarder, LinkEvent};
use broker_link::observability::init_default_logging;
use broker_link::transport::mqtt::RumqttcConnector;
use broker_link::ManagerError;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Upper bound on waiting for the broker in one-shot commands, on top of the configured delays
const ONE_SHOT_GRACE: Duration = Duration::from_secs(5);

/// MQTT broker connection manager
#[derive(Parser)]
#[command(name = "broker-link")]
#[command(about = "Tick-driven MQTT broker connection manager")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BROKER_LINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print decoded messages until Ctrl-C
    Run {
        /// Connect even when auto_connect is disabled
        #[arg(long)]
        connect: bool,
    },
    /// Publish a single message and exit
    Publish {
        topic: String,
        message: String,
        /// Send the message as a 4-byte little-endian float
        #[arg(long)]
        float: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

/// Prints decoded messages and connection changes
struct ConsoleObserver;

impl ConnectionObserver for ConsoleObserver {
    fn connection_succeeded(&mut self) {
        info!("Connected to broker");
    }

    fn connection_failed(&mut self, error: &ManagerError) {
        error!("Connection failed: {}", error);
    }

    fn disconnected(&mut self) {
        info!("Disconnected from broker");
    }

    fn connection_lost(&mut self) {
        warn!("Connection to broker lost");
    }

    fn message_decoded(&mut self, topic: &str, text: &str) {
        println!("{topic}\t{text}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting broker-link v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { connect } => run_link(config, connect).await,
        Commands::Publish {
            topic,
            message,
            float,
        } => publish_once(config, &topic, &message, float).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(BridgeConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["broker.toml", "config/broker.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(BridgeConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create broker.toml".into())
        }
    }
}

async fn run_link(config: BridgeConfig, force_connect: bool) -> Result<(), Box<dyn std::error::Error>> {
    let tick_interval = config.runtime.tick_interval();
    let mut manager = ConnectionManager::new(config.broker, RumqttcConnector::new())?
        .with_runtime_section(&config.runtime);
    manager.add_observer(Box::new(ConsoleObserver));

    if !manager.start() && force_connect {
        manager.connect();
    }

    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.tick();
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    manager.shutdown();
    let stats = manager.stats();
    info!(
        "Link stats: received={} published={} skipped={} losses={}",
        stats.messages_received,
        stats.messages_published,
        stats.publishes_skipped,
        stats.connection_losses
    );
    Ok(())
}

async fn publish_once(
    config: BridgeConfig,
    topic: &str,
    message: &str,
    as_float: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload = if as_float {
        let value: f32 = message
            .trim()
            .parse()
            .map_err(|e| format!("'{message}' is not a number: {e}"))?;
        value.to_le_bytes().to_vec()
    } else {
        message.as_bytes().to_vec()
    };

    let deadline = Instant::now()
        + config.broker.connect_delay()
        + config.broker.settle_delay()
        + config.broker.connect_timeout()
        + ONE_SHOT_GRACE;
    let tick_interval = config.runtime.tick_interval();

    let mut manager = ConnectionManager::new(config.broker, RumqttcConnector::new())?;
    let (forwarder, mut events) = EventForwarder::channel();
    manager.add_observer(Box::new(forwarder));
    manager.connect();

    loop {
        if Instant::now() >= deadline {
            manager.shutdown();
            return Err("Timed out waiting for the broker".into());
        }
        tokio::time::sleep(tick_interval).await;
        manager.tick();

        match events.try_recv() {
            Ok(LinkEvent::ConnectionSucceeded) => break,
            Ok(LinkEvent::ConnectionFailed(reason)) => {
                manager.shutdown();
                return Err(reason.into());
            }
            _ => {}
        }
    }

    if !manager.publish_bytes(topic, payload) {
        manager.shutdown();
        return Err(format!("Publish to '{topic}' was not accepted").into());
    }

    // QoS 1/2 exchanges must finish before DISCONNECT goes out
    let flush_deadline = Instant::now() + ONE_SHOT_GRACE;
    while manager.pending_publishes() > 0 && Instant::now() < flush_deadline {
        tokio::time::sleep(tick_interval).await;
        manager.tick();
    }
    if manager.pending_publishes() > 0 {
        manager.shutdown();
        return Err(format!("Broker did not acknowledge the publish to '{topic}'").into());
    }
    info!("Published to {}", topic);

    manager.disconnect();
    while Instant::now() < deadline && manager.state().is_transitioning() {
        tokio::time::sleep(tick_interval).await;
        manager.tick();
    }
    manager.shutdown();
    Ok(())
}

fn handle_config_command(
    config: &BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Configuration is valid: {}:{} (tls: {}), {} topic(s)",
        config.broker.address,
        config.broker.port,
        config.broker.encrypted,
        config.broker.topics.len()
    );
    if show {
        let mut redacted = config.clone();
        if redacted.broker.password.is_some() {
            redacted.broker.password = Some("********".to_string());
        }
        println!("{}", toml::to_string_pretty(&redacted)?);
    }
    Ok(())
}
