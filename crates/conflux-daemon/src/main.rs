mod cli;

use std::{sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use conflux_core::model::{KeyVersion, Principal};
use conflux_daemon::{
    config::{self, Config, LogFormat},
    storage, ConfigService,
};
use conflux_sync::{PushDispatcher, WebhookNotifier};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Command, ConfigCommand, KeysCommand};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();
    let config_path = config::resolve_path(cli.config)?;
    let config = Config::load(&config_path)?;
    init_tracing(config.log_format);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config).await?,
        Command::Version => print_version(),
        Command::Health => run_health_check(&config).await?,
        Command::Config(ConfigCommand::Init) => {
            let path = config::write_default_if_missing(&config, &config_path)?;
            println!("Config initialized at {}", path.display());
        }
        Command::Keys(cmd) => run_keys(cmd, &config).await?,
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

fn print_version() {
    println!("confluxd {}", env!("CARGO_PKG_VERSION"));
}

async fn run(config: &Config) -> Result<()> {
    let service = storage::open_service(config).await?;
    let cancel = CancellationToken::new();

    let notifier = WebhookNotifier::new(Duration::from_secs(config.distribution.push_timeout_secs))
        .map_err(|e| eyre!(e.to_string()))?;
    let dispatcher = PushDispatcher::new(
        Arc::clone(service.coordinator()),
        Arc::new(notifier),
        Duration::from_secs(config.distribution.push_interval_secs.max(1)),
    );
    let push = tokio::spawn(dispatcher.run(cancel.clone()));
    let rotation = tokio::spawn(Arc::clone(service.rotation()).run(cancel.clone()));

    info!("confluxd running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    push.await?;
    rotation.await?;
    Ok(())
}

async fn run_health_check(config: &Config) -> Result<()> {
    let service = storage::open_service(config).await?;
    let report = service.health().await.map_err(|e| eyre!(e.to_string()))?;
    println!("Keys: ok (active v{}, {} versions)", report.active_key, report.key_versions);
    println!("Storage: ok");
    Ok(())
}

async fn run_keys(cmd: KeysCommand, config: &Config) -> Result<()> {
    let service = storage::open_service(config).await?;
    match cmd {
        KeysCommand::List(op) => {
            for key in keys_for(&service, &op.principal).await? {
                println!("v{}\t{:?}\t{}", key.version, key.state, key.created_at);
            }
        }
        KeysCommand::Rotate(op) => {
            let principal = principal(&op.principal)?;
            let report = service
                .rotate_master_key(&principal)
                .await
                .map_err(|e| eyre!(e.to_string()))?;
            println!(
                "Rotated v{} -> v{}: {} resealed, {} rewrapped, {} failed; v{} retires after {}",
                report.from,
                report.to,
                report.resealed,
                report.rewrapped,
                report.failed,
                report.from,
                report.retire_after
            );
        }
        KeysCommand::Retire { version, operator } => {
            let principal = principal(&operator.principal)?;
            service
                .retire_key(&principal, KeyVersion(version))
                .await
                .map_err(|e| eyre!(e.to_string()))?;
            println!("Retired v{version}");
        }
    }
    Ok(())
}

async fn keys_for(
    service: &ConfigService,
    subject: &str,
) -> Result<Vec<conflux_storage::envelope::KeyInfo>> {
    service
        .key_versions(&principal(subject)?)
        .await
        .map_err(|e| eyre!(e.to_string()))
}

fn principal(subject: &str) -> Result<Principal> {
    Principal::new(subject).map_err(|e| eyre!(e.to_string()))
}
