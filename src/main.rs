//! notify-tail - consume a topic/channel and log every message

use clap::Parser;
use notifier::config::{DiscoverySection, SubscriptionSection};
use notifier::observability::init_default_logging;
use notifier::{
    Discovery, HandlerError, Message, NotifierConfig, NotifyClient, TlsSettings,
};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info};

const PREVIEW_LEN: usize = 120;

/// Tail a queue topic through a notify client
#[derive(Parser)]
#[command(name = "notify-tail")]
#[command(about = "Consume a topic/channel and log every message")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Topic to consume (overrides the config file)
    #[arg(short, long)]
    topic: Option<String>,

    /// Channel to consume on (overrides the config file)
    #[arg(long)]
    channel: Option<String>,

    /// Lookup service address; repeat for several
    #[arg(long = "lookup", value_name = "ADDR", conflicts_with = "node")]
    lookups: Vec<String>,

    /// Connect straight to one node at host:port
    #[arg(long, value_name = "HOST:PORT")]
    node: Option<String>,

    /// Delivery attempts before a message is given up
    #[arg(long, env = "NOTIFY_MAX_ATTEMPTS")]
    max_attempts: Option<u16>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting notify-tail v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run_tail(config).await {
        error!("notify-tail failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(cli: &Cli) -> Result<NotifierConfig, Box<dyn std::error::Error>> {
    let mut config = match cli.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            read_unvalidated(path)?
        }
        None => match ["notifier.toml", "config/notifier.toml"]
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
        {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                read_unvalidated(path)?
            }
            None => empty_configuration(),
        },
    };

    apply_overrides(&mut config, cli);
    config.validate()?;
    Ok(config)
}

/// Parse without validating so command line overrides can fill the gaps
fn read_unvalidated(path: &Path) -> Result<NotifierConfig, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

fn empty_configuration() -> NotifierConfig {
    NotifierConfig {
        subscription: SubscriptionSection {
            topic: String::new(),
            channel: String::new(),
            max_attempts: None,
        },
        discovery: DiscoverySection::default(),
        tls: Default::default(),
        consumer: Default::default(),
    }
}

fn apply_overrides(config: &mut NotifierConfig, cli: &Cli) {
    if let Some(topic) = &cli.topic {
        config.subscription.topic = topic.clone();
    }
    if let Some(channel) = &cli.channel {
        config.subscription.channel = channel.clone();
    }
    if cli.max_attempts.is_some() {
        config.subscription.max_attempts = cli.max_attempts;
    }
    if !cli.lookups.is_empty() {
        config.discovery.lookup_addresses = cli.lookups.clone();
        config.discovery.node_address = None;
    }
    if let Some(node) = &cli.node {
        config.discovery.node_address = Some(node.clone());
        config.discovery.lookup_addresses.clear();
    }
}

fn discovery_for(config: &NotifierConfig) -> Discovery {
    match &config.discovery.node_address {
        Some(node) => Discovery::Direct(node.clone()),
        None => Discovery::Lookup(config.discovery.lookup_addresses.clone()),
    }
}

fn log_message(message: &Message) -> Result<(), HandlerError> {
    let body = message.body();
    let preview: String = String::from_utf8_lossy(body).chars().take(PREVIEW_LEN).collect();
    info!(
        message_id = %message.id(),
        attempts = message.attempts(),
        size = body.len(),
        node = message.node(),
        preview = %preview,
        "Received message"
    );
    Ok(())
}

async fn run_tail(config: NotifierConfig) -> Result<(), Box<dyn std::error::Error>> {
    let topic = config.subscription.topic.clone();
    let channel = config.subscription.channel.clone();

    let mut consumer_config = config.consumer_config();
    if config.tls.enabled {
        consumer_config =
            consumer_config.with_tls(TlsSettings::new(&config.tls.cert_path, &config.tls.key_path)?);
    }

    let mut client: NotifyClient = NotifyClient::with_config(&topic, &channel, consumer_config)?;
    client.add_handler(log_message);

    let discovery = discovery_for(&config);
    info!(topic = %topic, channel = %channel, strategy = discovery.name(), "Connecting");
    client.connect(discovery).await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Tailing messages, press Ctrl-C to stop...");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    client.close();
    client.join().await;
    Ok(())
}
