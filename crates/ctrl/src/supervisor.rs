// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup/shutdown orchestration.
//!
//! Startup order is fixed: validate config → persistence health check →
//! open serial link → warm the registry from the store → spawn the
//! scheduler.  Any failure aborts startup.  A scheduler fault is restarted
//! after a short backoff; only cancellation ends it cleanly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::access::Processor;
use crate::config::Config;
use crate::events::EventBus;
use crate::link::Boxed;
use crate::proto::{encode_continue, encode_pulse, encode_set_time, encode_stop};
use crate::registry::{ModuleSnapshot, Registry, RegistryStats};
use crate::scheduler::{CommandSender, Diag, Scheduler, SchedulerSettings};
use crate::store::Store;

/// Pause before re-entering a faulted scheduler.
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Running controller: the handle the binary (and embedders) drive.
pub struct Controller {
    registry: Arc<RwLock<Registry>>,
    bus: Arc<EventBus>,
    commands: CommandSender,
    diag: Arc<Diag>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    grace: Duration,
}

impl Controller {
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn commands(&self) -> &CommandSender {
        &self.commands
    }

    pub fn diag(&self) -> &Arc<Diag> {
        &self.diag
    }

    /// Consistent view of all modules.
    pub fn snapshot(&self) -> Vec<ModuleSnapshot> {
        self.registry.read().snapshot()
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.read().stats()
    }

    /// Queue a barrier-open for the module's next turn.
    pub fn open_now(&self, address: u8) -> bool {
        self.commands.send(address, encode_continue(address, ""))
    }

    /// Queue a stop-sequence.
    pub fn stop_now(&self, address: u8) -> bool {
        self.commands.send(address, encode_stop(address))
    }

    /// Queue a pulse on one of the module's outputs.
    pub fn pulse(&self, address: u8, output: u8, duration_ms: u16) -> bool {
        self.commands.send(address, encode_pulse(address, output, duration_ms))
    }

    /// Queue a clock sync with the controller's current wall-clock.
    pub fn sync_time(&self, address: u8) -> bool {
        self.commands.send(address, encode_set_time(address, Local::now()))
    }

    /// Stop the scheduler (observed between ticks), waiting up to the
    /// configured grace period.  The scheduler closes the link on its way
    /// out.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("shutdown requested");
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(self.grace, &mut task).await {
            Ok(result) => result.context("scheduler task"),
            Err(_) => {
                warn!(grace_secs = self.grace.as_secs(), "scheduler missed shutdown grace");
                task.abort();
                Ok(())
            }
        }
    }
}

/// Bring the controller up; see the module docs for the order.
pub async fn start(
    config: &Config,
    store: Arc<dyn Store>,
    link: impl Boxed,
) -> anyhow::Result<Controller> {
    config.validate()?;
    store.health_check().context("persistence health check")?;

    let mut link = link.boxed();
    link.open()
        .await
        .map_err(|e| anyhow::anyhow!("opening serial link: {e}"))?;

    let modules = store.load_modules_for_polling().context("loading module configurations")?;
    let mut registry = Registry::from_configs(modules).context("warming module registry")?;

    // Sync every module clock on the first round.
    let now = Local::now();
    for address in registry.addresses() {
        registry.push_command(address, encode_set_time(address, now));
    }
    info!(modules = registry.len(), "module registry warmed");

    let registry = Arc::new(RwLock::new(registry));
    let bus = Arc::new(EventBus::new());
    let processor =
        Processor::new(Arc::clone(&store), config.policy_settings(), config.epoch_base()?);
    let settings: SchedulerSettings = config.scheduler_settings();
    let (mut scheduler, commands, diag) = Scheduler::new(
        link,
        Arc::clone(&registry),
        processor,
        Arc::clone(&bus),
        settings,
    );

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        loop {
            match scheduler.run(run_cancel.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    error!(err = %e, "scheduler fault");
                    if run_cancel.is_cancelled() {
                        break;
                    }
                    tokio::time::sleep(RESTART_BACKOFF).await;
                    warn!("restarting scheduler");
                }
            }
        }
    });

    Ok(Controller {
        registry,
        bus,
        commands,
        diag,
        cancel,
        task,
        grace: config.shutdown_grace(),
    })
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
