//! CLI entry point for dispatchd.
//!
//! Provides the `dispatchd` command:
//! - `dispatchd run` -- run the dispatcher service against a TOML config
//! - `dispatchd control` -- send a control command and print the replies
//! - `dispatchd worker` -- hidden; the worker loop spawned by the service

mod cli;
mod helpers;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use dispatchd_broker::{Broker, BrokeredProducer, PgBroker};
use dispatchd_client::{BrokerFactory, Control};
use dispatchd_core::{BrokerEntry, DispatcherConfig};
use dispatchd_service::{DispatcherMain, SubprocessSpawner, WorkerPool};

use crate::cli::{Cli, Commands};
use crate::helpers::init_tracing;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing).
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => cmd_run(&config).await,
        Commands::Control {
            command,
            config,
            channel,
            data,
            expected_replies,
            timeout,
            no_reply,
        } => {
            cmd_control(
                &command,
                &config,
                channel,
                data,
                expected_replies,
                timeout,
                no_reply,
            )
            .await
        }
        Commands::Worker { worker_id } => cmd_worker(worker_id).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: &Path) -> Result<()> {
    init_tracing("info");

    let config = DispatcherConfig::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    let node_id = config.resolve_node_id();

    let mut producers = Vec::new();
    for (name, entry) in &config.brokers {
        let broker = build_broker(name, entry)?;
        producers.push(BrokeredProducer::new(broker, entry.channels.clone(), false));
    }
    if producers.is_empty() {
        bail!("no brokers configured; nothing to listen on");
    }

    let spawner = Arc::new(SubprocessSpawner::new(config.pool.fork_mode));
    let pool = WorkerPool::new(spawner, config.pool.max_workers);

    let dispatcher = DispatcherMain::new(producers, pool, Some(node_id));
    info!(node_id = %dispatcher.node_id(), "starting dispatchd service");
    dispatcher.main().await;
    Ok(())
}

fn build_broker(name: &str, entry: &BrokerEntry) -> Result<Arc<dyn Broker>> {
    match name {
        "pg_notify" => {
            let dsn = entry
                .str_option("dsn")
                .context("brokers.pg_notify.config.dsn is required")?;
            Ok(Arc::new(PgBroker::new(dsn)))
        }
        other => Err(dispatchd_core::CoreError::UnknownBroker {
            name: other.to_string(),
        }
        .into()),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: control
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn cmd_control(
    command: &str,
    config_path: &Path,
    channel: Option<String>,
    data: Option<String>,
    expected_replies: usize,
    timeout: f64,
    no_reply: bool,
) -> Result<()> {
    init_tracing("warn");

    let config = DispatcherConfig::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    let entry = config
        .brokers
        .get("pg_notify")
        .context("config has no pg_notify broker")?;
    let dsn = entry
        .str_option("dsn")
        .context("brokers.pg_notify.config.dsn is required")?
        .to_string();
    let target = channel
        .or_else(|| entry.channels.first().cloned())
        .context("no target channel: pass --channel or configure broker channels")?;

    let factory: BrokerFactory = Arc::new(move || Arc::new(PgBroker::new(dsn.clone())));
    let control = Control::new(factory, Some(target));

    let data = data
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .context("--data must be valid JSON")?;

    if no_reply {
        control.acontrol(command, data).await?;
        return Ok(());
    }

    let replies = control
        .acontrol_with_reply(
            command,
            expected_replies,
            Duration::from_secs_f64(timeout.max(0.0)),
            data,
        )
        .await?;
    for reply in replies {
        println!("{reply}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: worker (hidden)
// ---------------------------------------------------------------------------

async fn cmd_worker(worker_id: usize) -> Result<()> {
    // Worker stdout carries protocol frames; logs go to stderr only.
    init_tracing("info");
    dispatchd_service::worker::run_worker(worker_id)
        .await
        .context("worker loop failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_pg_broker_builds() {
        let config = DispatcherConfig::from_toml(
            r#"
[brokers.pg_notify]
channels = ["test_channel"]
[brokers.pg_notify.config]
dsn = "postgres://dispatch@127.0.0.1/dispatch_db"
"#,
        )
        .unwrap();
        let entry = &config.brokers["pg_notify"];
        build_broker("pg_notify", entry).expect("pg_notify broker should build");
    }

    #[test]
    fn unknown_broker_name_is_rejected_at_startup() {
        let entry = BrokerEntry::default();
        let error = match build_broker("rabbitmq", &entry) {
            Ok(_) => panic!("expected build_broker to fail for an unknown broker"),
            Err(error) => error,
        };
        assert!(error.to_string().contains("unknown broker `rabbitmq`"));
    }

    #[test]
    fn missing_dsn_is_rejected() {
        let entry = BrokerEntry::default();
        assert!(build_broker("pg_notify", &entry).is_err());
    }
}
