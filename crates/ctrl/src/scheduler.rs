// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cyclic polling scheduler: the single task that owns the bus.
//!
//! Each tick serves one module: drain injected commands, pick the next
//! module in polling order, send its queued frame (or synthesize a status
//! poll), validate the reply, route it.  All registry writes happen here;
//! events are collected while the write lock is held and published after it
//! drops, so subscribers may take registry snapshots.  The stop token is
//! observed between ticks only — a frame in flight always completes or times
//! out naturally.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Local;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::access::Processor;
use crate::events::{Event, EventBus};
use crate::link::BusLink;
use crate::proto::{
    encode_ok_download_novelty, encode_read_status, novelty_bytes, opcode_of, parse_status,
    read_timeout_for, validate_and_parse, FrameFault, ValidateResult, OP_READ_STATUS,
};
use crate::registry::{BarrierState, ModuleState, Registry, SensorState};

/// Nap while the registry has no modules to poll.
const IDLE_NAP: Duration = Duration::from_secs(1);

/// Injection queue depth; operator commands beyond this are dropped.
const INJECT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Delay between successive bus turns (not per-module).
    pub polling_interval: Duration,
    pub max_retries: u32,
    pub bus_reopen_threshold: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(1000),
            max_retries: 3,
            bus_reopen_threshold: 10,
        }
    }
}

/// Shared scheduler counters for diagnostics surfaces.
#[derive(Debug, Default)]
pub struct Diag {
    rounds: AtomicU64,
    bus_consecutive_errors: AtomicU32,
    port_reopens: AtomicU32,
}

impl Diag {
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    pub fn bus_consecutive_errors(&self) -> u32 {
        self.bus_consecutive_errors.load(Ordering::Relaxed)
    }

    pub fn port_reopens(&self) -> u32 {
        self.port_reopens.load(Ordering::Relaxed)
    }
}

/// A command handed to the scheduler from outside its task.
#[derive(Debug)]
enum Inject {
    /// Queue on the module; dispatched on its next turn.
    Queued { address: u8, frame: Bytes },
    /// Dispatch inside the scheduler's critical section, bypassing the
    /// round-robin, without waiting for a reply.  Operator/test use.
    Immediate { address: u8, frame: Bytes },
}

/// Thread-safe handle for injecting commands into the scheduler.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Inject>,
}

impl CommandSender {
    /// Queue a frame for a module's next turn.  False when the scheduler is
    /// gone or the injection queue is full.
    pub fn send(&self, address: u8, frame: Bytes) -> bool {
        self.tx.try_send(Inject::Queued { address, frame }).is_ok()
    }

    /// Dispatch a frame ahead of the round-robin, fire-and-forget.
    pub fn send_immediate(&self, address: u8, frame: Bytes) -> bool {
        self.tx.try_send(Inject::Immediate { address, frame }).is_ok()
    }
}

pub struct Scheduler {
    link: Box<dyn BusLink>,
    registry: Arc<RwLock<Registry>>,
    processor: Processor,
    bus: Arc<EventBus>,
    settings: SchedulerSettings,
    inject_rx: mpsc::Receiver<Inject>,
    diag: Arc<Diag>,
    cursor: usize,
    bus_errors: u32,
}

impl Scheduler {
    pub fn new(
        link: Box<dyn BusLink>,
        registry: Arc<RwLock<Registry>>,
        processor: Processor,
        bus: Arc<EventBus>,
        settings: SchedulerSettings,
    ) -> (Self, CommandSender, Arc<Diag>) {
        let (tx, inject_rx) = mpsc::channel(INJECT_QUEUE_DEPTH);
        let diag = Arc::new(Diag::default());
        let scheduler = Self {
            link,
            registry,
            processor,
            bus,
            settings,
            inject_rx,
            diag: Arc::clone(&diag),
            cursor: 0,
            bus_errors: 0,
        };
        (scheduler, CommandSender { tx }, diag)
    }

    /// Drive the bus until cancelled.  Closes the link on the way out.
    ///
    /// `&mut self` so the supervisor's restart loop can re-enter after a
    /// fault without rebuilding the link.
    pub async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(
            interval_ms = self.settings.polling_interval.as_millis() as u64,
            "polling scheduler started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.drain_injections().await;

            let Some((address, frame)) = self.next_turn() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_NAP) => {}
                }
                continue;
            };

            let op = opcode_of(&frame).unwrap_or(OP_READ_STATUS).to_owned();
            match self.link.poll(frame, read_timeout_for(&op), true).await {
                Ok(reply) => self.on_reply(address, &reply),
                Err(e) => self.on_failure(address, &e.to_string()),
            }
            self.maybe_reopen().await;
            self.diag.rounds.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.polling_interval) => {}
            }
        }

        if let Err(e) = self.link.close().await {
            warn!(err = %e, "closing serial port");
        }
        info!("polling scheduler stopped");
        Ok(())
    }

    /// Apply commands injected from other tasks since the last tick.
    async fn drain_injections(&mut self) {
        while let Ok(inject) = self.inject_rx.try_recv() {
            match inject {
                Inject::Queued { address, frame } => {
                    if !self.registry.write().push_command(address, frame) {
                        warn!(address, "injected command dropped (unknown address or duplicate)");
                    }
                }
                Inject::Immediate { address, frame } => {
                    debug!(address, "dispatching immediate command");
                    if let Err(e) = self.link.poll(frame, Duration::ZERO, false).await {
                        warn!(address, err = %e, "immediate command failed");
                    }
                }
            }
        }
    }

    /// Next module in polling order with its frame to send.
    fn next_turn(&mut self) -> Option<(u8, Bytes)> {
        let mut registry = self.registry.write();
        if registry.is_empty() {
            return None;
        }
        let index = self.cursor % registry.len();
        self.cursor = (self.cursor + 1) % registry.len();
        let address = registry.address_at(index)?;
        let module = registry.get_mut(address)?;
        let frame = module
            .runtime
            .next_command()
            .unwrap_or_else(|| encode_read_status(address));
        module.runtime.last_command_sent = Some(frame.clone());
        Some((address, frame))
    }

    fn on_reply(&mut self, address: u8, reply: &[u8]) {
        let (op, payload) = match validate_and_parse(reply, address) {
            ValidateResult::Valid { op, payload, .. } => (op, payload),
            ValidateResult::Invalid { reason } => {
                self.on_failure(address, &reason.to_string());
                return;
            }
        };

        if !is_known_op(&op) {
            // Well-formed frame with an opcode we never sent: likely a
            // firmware mismatch.  Transient for retry purposes.
            warn!(address, op = %op, "unexpected opcode in reply");
            self.on_failure(address, &FrameFault::UnknownOp { op }.to_string());
            return;
        }

        let now = Local::now();
        let mut out: Vec<Event> = Vec::new();
        {
            let mut registry = self.registry.write();
            let Some(module) = registry.get_mut(address) else {
                return;
            };
            let module_id = module.config.module_id;

            module.runtime.retry_count = 0;
            module.runtime.consecutive_errors = 0;
            module.runtime.last_communication = Some(now);
            let mut changed = module.runtime.state != ModuleState::Online;
            module.runtime.state = ModuleState::Online;

            let mut novelty: Option<Vec<u8>> = None;
            if op == "S0" || op == "S6" {
                let bits = parse_status(&payload);
                let barrier = if bits.barrier_open { BarrierState::Open } else { BarrierState::Closed };
                let sensor = if bits.sensor_occupied { SensorState::Occupied } else { SensorState::Free };
                if module.runtime.barrier_state != barrier
                    || module.runtime.sensor_state != sensor
                {
                    module.runtime.barrier_state = barrier;
                    module.runtime.sensor_state = sensor;
                    changed = true;
                }
                if op == "S6" || bits.has_novelty {
                    novelty = Some(novelty_bytes(&payload).to_vec());
                }
            } else {
                debug!(address, op = %op, "command acknowledged");
            }

            let barrier_state = module.runtime.barrier_state;
            let sensor_state = module.runtime.sensor_state;
            if changed {
                out.push(Event::ModuleStateChanged {
                    module_id,
                    address,
                    state: ModuleState::Online,
                    barrier_state,
                    sensor_state,
                });
            }

            if let Some(bytes) = novelty {
                // Ack first: it must go out on this module's very next turn
                // so the module can drop its buffer; actuations queue behind
                // it.
                registry.push_command(address, encode_ok_download_novelty(address));
                self.processor.handle_novelty(&mut registry, address, &bytes, now, &mut out);
            }
        }

        self.bus_errors = 0;
        self.diag.bus_consecutive_errors.store(0, Ordering::Relaxed);
        self.bus.publish_all(&out);
    }

    fn on_failure(&mut self, address: u8, detail: &str) {
        let mut out: Vec<Event> = Vec::new();
        {
            let mut registry = self.registry.write();
            let Some(module) = registry.get_mut(address) else {
                return;
            };
            let module_id = module.config.module_id;

            module.runtime.retry_count += 1;
            module.runtime.consecutive_errors += 1;
            warn!(
                address,
                attempt = module.runtime.retry_count,
                detail,
                "module poll failed"
            );

            if module.runtime.retry_count >= self.settings.max_retries {
                module.runtime.retry_count = 0;
                let was = module.runtime.state;
                module.runtime.state = ModuleState::Error;
                let cleared = module.runtime.clear_pending();
                if cleared > 0 {
                    debug!(address, cleared, "stale pending commands dropped");
                }
                if was != ModuleState::Error {
                    error!(address, module_id, "module unresponsive, marked error");
                    out.push(Event::ModuleStateChanged {
                        module_id,
                        address,
                        state: ModuleState::Error,
                        barrier_state: module.runtime.barrier_state,
                        sensor_state: module.runtime.sensor_state,
                    });
                }
            }
        }

        out.push(Event::CommunicationError { address, detail: detail.to_owned() });
        self.bus_errors += 1;
        self.diag.bus_consecutive_errors.store(self.bus_errors, Ordering::Relaxed);
        self.bus.publish_all(&out);
    }

    /// Bus-level recovery: reopen the port once consecutive errors across
    /// all modules cross the threshold.
    async fn maybe_reopen(&mut self) {
        if self.bus_errors < self.settings.bus_reopen_threshold {
            return;
        }
        warn!(errors = self.bus_errors, "bus error threshold reached, reopening port");
        self.bus_errors = 0;
        self.diag.bus_consecutive_errors.store(0, Ordering::Relaxed);
        self.diag.port_reopens.fetch_add(1, Ordering::Relaxed);
        match self.link.reopen().await {
            Ok(()) => info!("serial port reopened"),
            Err(e) => error!(err = %e, "port reopen failed"),
        }
    }
}

/// Opcodes the controller itself emits (and therefore expects echoed back).
fn is_known_op(op: &str) -> bool {
    matches!(op, "S0" | "S6" | "K0" | "K1" | "O1" | "T0")
        || (op.len() == 2 && op.starts_with('P') && op.as_bytes()[1].is_ascii_digit())
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
