// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level controller runner — shared by `main` and integration tests.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::{Event, Topic};
use crate::link::serial::SerialLink;
use crate::store::mem::MemStore;
use crate::store::Store;
use crate::supervisor;

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / WICKET_LOG_LEVEL > RUST_LOG > default ("info").
    let filter = if std::env::var("WICKET_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Run the controller to completion: seed store, serial link, supervisor,
/// SIGINT-triggered graceful shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);

    let Some(ref seed_path) = config.seed else {
        anyhow::bail!("--seed <file> is required (module and person definitions)");
    };
    let store: Arc<dyn Store> = Arc::new(MemStore::load(seed_path)?);
    let link = SerialLink::new(config.link_settings());

    let controller = supervisor::start(&config, store, link).await?;

    // Movements are worth an operator-visible line even with no other
    // subscriber attached.
    controller.bus().subscribe(Topic::MovementDetected, |event| {
        if let Event::MovementDetected { identifier, allowed, reason, .. } = event {
            info!(
                identifier = %identifier,
                allowed,
                reason = reason.as_deref().unwrap_or(""),
                "movement detected"
            );
        }
        Ok(())
    });

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    controller.shutdown().await
}
