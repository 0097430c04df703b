use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use llm_relay::config::{LogFormat, LoggingConfig};
use llm_relay::directory::TracingUsageSink;
use llm_relay::relay::open_health_store;
use llm_relay::{Relay, RelayConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "llm-relay")]
#[command(about = "Chat-completion relay with credential failover and egress proxies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        #[arg(long)]
        config: PathBuf,
        /// Overrides `listen` from the config file.
        #[arg(long)]
        listen: Option<String>,
        /// Forces JSON log lines regardless of the configured format.
        #[arg(long)]
        json_logs: bool,
    },
    /// Run one health cycle and print a JSON summary.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the stored form of a secret under the configured codec.
    EncryptSecret {
        #[arg(long)]
        config: PathBuf,
        /// Plaintext credential or proxy password.
        value: String,
    },
}

fn init_tracing(logging: &LoggingConfig, force_json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let json = force_json || logging.format == LogFormat::Json;
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing already initialised: {err}");
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}

async fn build_relay(config: &RelayConfig) -> Result<Relay, Box<dyn std::error::Error>> {
    let store = open_health_store(&config.health).await?;
    let relay = Relay::from_config(config, store, Arc::new(TracingUsageSink))?;
    relay.seed_alert_configs().await?;
    Ok(relay)
}

async fn serve(
    config: RelayConfig,
    listen: Option<String>,
    json_logs: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&config.logging, json_logs);
    let listen = listen.unwrap_or_else(|| config.listen.clone());
    let relay = build_relay(&config).await?;

    let cancel = CancellationToken::new();
    let _scheduler = relay.scheduler().map(|scheduler| {
        tracing::info!(interval_secs = config.health.interval_secs, "health checks enabled");
        scheduler.start(cancel.child_token())
    });

    let app = llm_relay::http::router(relay.http_state());
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(
        listen = %listen,
        backends = config.backends.len(),
        credentials = config.credentials.len(),
        proxies = config.proxies.len(),
        "llm-relay listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;
    Ok(())
}

async fn check(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&config.logging, false);
    let relay = build_relay(&config).await?;
    let summary = relay.checker().run_cycle().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn encrypt_secret(config: RelayConfig, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let codec = config.codec()?;
    println!("{}", codec.encode(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            config,
            listen,
            json_logs,
        } => serve(RelayConfig::load(&config)?, listen, json_logs).await,
        Command::Check { config } => check(RelayConfig::load(&config)?).await,
        Command::EncryptSecret { config, value } => {
            encrypt_secret(RelayConfig::load(&config)?, &value)
        }
    }
}
