//! CLI entry point for the Synapse micro-kernel.
//!
//! The `synapse` binary loads configuration, starts the enabled listeners
//! and runs until a shutdown trigger arrives (signal, panic or listener
//! failure).  Every trigger goes through the kernel's
//! [`ShutdownCoordinator`], and the process exits with the code of the
//! trigger that started the shutdown.

mod cli;
mod helpers;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use synapse_gateway::{HttpGateway, HttpLink, StreamGateway};
use synapse_kernel::{KernelConfig, Router, ShutdownCoordinator, ShutdownTrigger};

use crate::cli::Cli;
use crate::helpers::{init_tracing, install_panic_hook, spawn_signal_listener};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dotenv = dotenvy::dotenv();

    let config = load_config(&cli)?;
    init_tracing(&config.kernel.log_level, cli.json);

    if let Ok(path) = dotenv {
        info!(path = %path.display(), "loaded environment file");
    }
    info!(
        config = %cli.config.display(),
        stream = config.stream.enabled,
        http = config.http.enabled,
        "starting synapse kernel"
    );

    let code = run(config).await?;
    std::process::exit(code);
}

/// Read the configuration file, then apply environment and CLI overrides.
fn load_config(cli: &Cli) -> Result<KernelConfig> {
    let mut config = KernelConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    cli.apply(&mut config);
    config
        .validate()
        .context("invalid configuration after command-line overrides")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Serve until the first shutdown trigger and return the exit code.
async fn run(config: KernelConfig) -> Result<i32> {
    let router = Arc::new(Router::from_config(&config));
    let coordinator = Arc::new(ShutdownCoordinator::new(
        Arc::clone(&router),
        config.shutdown_deadline(),
    ));

    let (trigger_tx, mut triggers) = mpsc::unbounded_channel();
    install_panic_hook(trigger_tx.clone());
    spawn_signal_listener(trigger_tx.clone());

    let mut listeners = JoinSet::new();

    if config.stream.enabled {
        let gateway = StreamGateway::bind(&config.stream.bind, Arc::clone(&router))
            .await
            .context("failed to start stream listener")?;
        info!(addr = %gateway.local_addr()?, "modules may connect over TCP");
        listeners.spawn(gateway.serve(coordinator.stop_signal()));
    }

    if config.http.enabled {
        let gateway = HttpGateway::bind(
            &config.http.bind,
            Arc::clone(&router),
            HttpLink::from_config(&config.http),
        )
        .await
        .context("failed to start http listener")?;
        info!(addr = %gateway.local_addr()?, "modules may connect over HTTP");
        listeners.spawn(gateway.serve(coordinator.stop_signal()));
    }

    // A listener that fails can no longer take on modules.
    let supervisor_tx = trigger_tx.clone();
    let supervised = Arc::clone(&coordinator);
    tokio::spawn(async move {
        while let Some(joined) = listeners.join_next().await {
            let trigger = match joined {
                Ok(Ok(())) => {
                    if !supervised.is_shutting_down() {
                        warn!("listener stopped before shutdown");
                    }
                    ShutdownTrigger::Exit(0)
                }
                Ok(Err(e)) => {
                    error!(error = %e, "listener failed");
                    ShutdownTrigger::Fault
                }
                Err(e) => {
                    error!(error = %e, "listener task aborted");
                    ShutdownTrigger::Fault
                }
            };
            let _ = supervisor_tx.send(trigger);
        }
    });

    let Some(first) = triggers.recv().await else {
        warn!("trigger channel closed unexpectedly");
        return Ok(ShutdownTrigger::Fault.exit_code());
    };

    let shutdown = coordinator.shutdown(first);
    tokio::pin!(shutdown);

    // Later triggers are reported to the coordinator, which ignores them.
    let report = loop {
        tokio::select! {
            report = &mut shutdown => break report,
            Some(trigger) = triggers.recv() => {
                if coordinator.shutdown(trigger).await.is_none() {
                    info!(trigger = %trigger, "shutdown already running");
                }
            }
        }
    };

    let code = report
        .map(|r| r.exit_code)
        .unwrap_or_else(|| first.exit_code());
    info!(exit_code = code, "synapse kernel stopped");
    Ok(code)
}
