//! fwrebuild service: loads config and rules, then serves the Task API
//!
//! Usage: fwrebuild [config.toml]

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fwrebuild::api::{self, AppState};
use fwrebuild::config::{self, Config, ExecutorKind};
use fwrebuild::executor::{DryRunExecutor, Executor, SshExecutor};
use fwrebuild::{InMemoryRuleStore, RebuildOrchestrator, TaskRegistry};

fn build_executor(config: &Config) -> Arc<dyn Executor> {
    let exec = &config.executor;
    match exec.kind {
        ExecutorKind::DryRun => Arc::new(DryRunExecutor::new(Duration::from_millis(
            exec.dry_run_delay_ms,
        ))),
        ExecutorKind::Ssh => Arc::new(SshExecutor::new(
            &exec.ssh_binary,
            exec.ssh_options.clone(),
            config.ssh_targets(),
            Duration::from_secs(exec.command_timeout_secs),
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config::resolve_path(std::env::args().nth(1));
    let config = config::load_config(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    fwrebuild::logging::init(&config.logging).context("Failed to initialise logging")?;
    info!("fwrebuild starting (config: {config_path})");

    let rules = InMemoryRuleStore::load(Path::new(&config.rules_file))
        .with_context(|| format!("Failed to load rules from {}", config.rules_file))?;
    for server_id in config.servers.keys() {
        rules.register_server(server_id);
    }

    let registry = match config.storage.task_db.as_deref() {
        Some(path) => TaskRegistry::with_db(path)
            .with_context(|| format!("Failed to open task database {path}"))?,
        None => TaskRegistry::new(),
    };
    info!("Task registry ready ({} stored tasks)", registry.len());

    let orchestrator = RebuildOrchestrator::new(
        Arc::new(registry),
        Arc::new(rules),
        build_executor(&config),
        config.rebuild.clone(),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {e}"),
        }
    });

    let served = api::serve(
        &config.http.listen,
        AppState::new(orchestrator.clone()),
        shutdown.clone(),
    )
    .await;

    orchestrator
        .shutdown(config.rebuild.cancel_grace() + Duration::from_secs(1))
        .await;
    served.context("Task API server failed")?;
    info!("fwrebuild stopped");
    Ok(())
}
