// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bonwerk: role-based print orchestration daemon
//
// Entry point. Initialises logging, loads config, restores paired printers
// and runs until Ctrl-C.

mod services;

use services::daemon;
use services::data_dir;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Bonwerk starting");

    let default_dir = data_dir::data_dir(None);
    let config = daemon::load_config(&default_dir);
    let dir = match config.data_dir.as_deref() {
        Some(custom) => data_dir::data_dir(Some(custom)),
        None => default_dir,
    };
    tracing::info!(path = %dir.display(), transport = ?config.transport, "data directory");

    let mut orchestrator = daemon::build_orchestrator(&config, &dir);
    let logger = tokio::spawn(daemon::log_events(orchestrator.subscribe()));

    let restored = orchestrator.start().await;
    tracing::info!(
        seeded = restored.seeded.len(),
        connected = restored.connected.len(),
        failed = restored.failed.len(),
        "saved printers restored"
    );

    if !config.known_printers.is_empty() {
        let count = daemon::register_known_printers(&orchestrator, &config.known_printers);
        tracing::info!(count, "known printers registered");
    }

    if config.scan_on_start {
        match orchestrator.directory().start_scan().await {
            Ok(found) => tracing::info!(found, "initial scan finished"),
            Err(e) => tracing::warn!(error = %e, "initial scan failed"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for Ctrl-C, shutting down");
    }

    tracing::info!("Bonwerk stopping");
    orchestrator.stop().await;
    logger.abort();
}
