// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Module registry: per-module configuration and runtime state.
//!
//! The registry is single-writer — only the scheduler task mutates it —
//! behind an `Arc<parking_lot::RwLock<_>>` that is never held across an
//! await.  Observers take [`Registry::snapshot`] for a consistent view.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;

use anyhow::{bail, Context};
use bytes::Bytes;
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Addressable field-device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    Barrier,
    Turnstile,
    Door,
    CardReader,
    TicketDispenser,
}

/// What a module type can do; drives policy checks instead of dynamic
/// dispatch on the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub has_barrier: bool,
    pub has_sensors: bool,
    pub supports_tickets: bool,
    pub bidirectional: bool,
}

impl ModuleType {
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Barrier => Capabilities {
                has_barrier: true,
                has_sensors: true,
                supports_tickets: true,
                bidirectional: false,
            },
            Self::Turnstile => Capabilities {
                has_barrier: false,
                has_sensors: true,
                supports_tickets: false,
                bidirectional: true,
            },
            Self::Door => Capabilities {
                has_barrier: false,
                has_sensors: true,
                supports_tickets: false,
                bidirectional: true,
            },
            Self::CardReader => Capabilities {
                has_barrier: false,
                has_sensors: false,
                supports_tickets: false,
                bidirectional: false,
            },
            Self::TicketDispenser => Capabilities {
                has_barrier: false,
                has_sensors: false,
                supports_tickets: true,
                bidirectional: false,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Barrier => "barrier",
            Self::Turnstile => "turnstile",
            Self::Door => "door",
            Self::CardReader => "card_reader",
            Self::TicketDispenser => "ticket_dispenser",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Movement direction a module produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Entry,
    Exit,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Self::Entry => Self::Exit,
            Self::Exit => Self::Entry,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        }
    }
}

/// Movement kind a module produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Pedestrian,
    Vehicular,
}

/// Communication state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Offline,
    Online,
    Error,
    Initializing,
}

impl ModuleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Error => "error",
            Self::Initializing => "initializing",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last reported barrier position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierState {
    Closed,
    Open,
    MovingUp,
    MovingDown,
    Blocked,
    Unknown,
}

/// Last reported presence-sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorState {
    Free,
    Occupied,
    Unknown,
}

/// Immutable per-module configuration, loaded from the store at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub module_id: i64,
    /// Bus address, 1..=255, unique among polled modules.
    pub address: u8,
    pub name: String,
    pub module_type: ModuleType,
    /// Round-robin ordering key, ascending.
    #[serde(default)]
    pub polling_order: i32,
    #[serde(default)]
    pub pulse_duration_ms: u16,
    #[serde(default)]
    pub requires_ticket_validation: bool,
    /// Peer module on the entry side, when this module is an exit point.
    #[serde(default)]
    pub peer_entry_module_id: Option<i64>,
    /// Peer module on the exit side, when this module is an entry point.
    #[serde(default)]
    pub peer_exit_module_id: Option<i64>,
}

impl ModuleConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.module_id <= 0 {
            bail!("module_id must be positive");
        }
        if self.address == 0 {
            bail!("address must be in 1..=255");
        }
        if self.name.trim().is_empty() {
            bail!("name must not be empty");
        }
        if self.requires_ticket_validation && !self.module_type.capabilities().supports_tickets {
            bail!(
                "module type {} does not support ticket validation",
                self.module_type
            );
        }
        Ok(())
    }

    /// Direction this module produces: an exit peer makes it an entry point,
    /// an entry peer makes it an exit point; unpeered modules are entries.
    pub fn direction(&self) -> Direction {
        if self.peer_entry_module_id.is_some() && self.peer_exit_module_id.is_none() {
            Direction::Exit
        } else {
            Direction::Entry
        }
    }

    /// The module on the opposite side of this one, if configured.
    pub fn peer_id(&self) -> Option<i64> {
        match self.direction() {
            Direction::Entry => self.peer_exit_module_id,
            Direction::Exit => self.peer_entry_module_id,
        }
    }

    pub fn kind(&self) -> MovementKind {
        match self.module_type {
            ModuleType::Barrier | ModuleType::TicketDispenser => MovementKind::Vehicular,
            _ => MovementKind::Pedestrian,
        }
    }

    /// Whether a recognized identification actuates this module.
    pub fn acts_on_identification(&self) -> bool {
        self.module_type.capabilities().has_barrier
            || matches!(self.module_type, ModuleType::CardReader)
    }
}

/// Mutable per-module runtime state; written only by the scheduler task.
#[derive(Debug, Clone)]
pub struct ModuleRuntime {
    pub state: ModuleState,
    pub barrier_state: BarrierState,
    pub sensor_state: SensorState,
    pub retry_count: u32,
    pub consecutive_errors: u32,
    pub last_communication: Option<DateTime<Local>>,
    pub last_command_sent: Option<Bytes>,
    pending: VecDeque<Bytes>,
}

impl Default for ModuleRuntime {
    fn default() -> Self {
        Self {
            state: ModuleState::Initializing,
            barrier_state: BarrierState::Unknown,
            sensor_state: SensorState::Unknown,
            retry_count: 0,
            consecutive_errors: 0,
            last_communication: None,
            last_command_sent: None,
            pending: VecDeque::new(),
        }
    }
}

impl ModuleRuntime {
    /// Queue a frame unless an identical one is already pending.
    pub fn push_command(&mut self, frame: Bytes) -> bool {
        if self.pending.contains(&frame) {
            return false;
        }
        self.pending.push_back(frame);
        true
    }

    pub fn next_command(&mut self) -> Option<Bytes> {
        self.pending.pop_front()
    }

    pub fn clear_pending(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// One configured module with its runtime state.
#[derive(Debug, Clone)]
pub struct Module {
    pub config: ModuleConfig,
    pub runtime: ModuleRuntime,
}

/// Consistent point-in-time view of one module, for observers.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSnapshot {
    pub module_id: i64,
    pub address: u8,
    pub name: String,
    pub module_type: ModuleType,
    pub state: ModuleState,
    pub barrier_state: BarrierState,
    pub sensor_state: SensorState,
    pub consecutive_errors: u32,
    pub pending_commands: usize,
    pub last_communication: Option<DateTime<Local>>,
}

/// Aggregate module counts, for diagnostics surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub error: usize,
}

/// All polled modules, keyed by bus address in polling order.
#[derive(Debug, Default)]
pub struct Registry {
    modules: IndexMap<u8, Module>,
    by_id: HashMap<i64, u8>,
}

impl Registry {
    /// Build from loaded configurations: validates each, rejects duplicate
    /// addresses and ids, and fixes the polling order (`polling_order`
    /// ascending, then `module_id`).
    pub fn from_configs(mut configs: Vec<ModuleConfig>) -> anyhow::Result<Self> {
        configs.sort_by_key(|c| (c.polling_order, c.module_id));

        let mut modules = IndexMap::with_capacity(configs.len());
        let mut by_id = HashMap::with_capacity(configs.len());
        for config in configs {
            config
                .validate()
                .with_context(|| format!("module {} ({})", config.module_id, config.name))?;
            if by_id.insert(config.module_id, config.address).is_some() {
                bail!("duplicate module id {}", config.module_id);
            }
            let address = config.address;
            let prev = modules.insert(
                address,
                Module { config, runtime: ModuleRuntime::default() },
            );
            if prev.is_some() {
                bail!("duplicate bus address {address:02}");
            }
        }
        Ok(Self { modules, by_id })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Bus addresses in polling order.
    pub fn addresses(&self) -> Vec<u8> {
        self.modules.keys().copied().collect()
    }

    /// Address at a round-robin cursor position.
    pub fn address_at(&self, index: usize) -> Option<u8> {
        self.modules.get_index(index).map(|(addr, _)| *addr)
    }

    pub fn get(&self, address: u8) -> Option<&Module> {
        self.modules.get(&address)
    }

    pub fn get_mut(&mut self, address: u8) -> Option<&mut Module> {
        self.modules.get_mut(&address)
    }

    pub fn by_module_id(&self, module_id: i64) -> Option<&Module> {
        self.by_id.get(&module_id).and_then(|addr| self.modules.get(addr))
    }

    /// Queue a frame for a module; false when the address is unknown or the
    /// identical frame is already pending.
    pub fn push_command(&mut self, address: u8, frame: Bytes) -> bool {
        match self.modules.get_mut(&address) {
            Some(module) => module.runtime.push_command(frame),
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<ModuleSnapshot> {
        self.modules
            .values()
            .map(|m| ModuleSnapshot {
                module_id: m.config.module_id,
                address: m.config.address,
                name: m.config.name.clone(),
                module_type: m.config.module_type,
                state: m.runtime.state,
                barrier_state: m.runtime.barrier_state,
                sensor_state: m.runtime.sensor_state,
                consecutive_errors: m.runtime.consecutive_errors,
                pending_commands: m.runtime.pending_len(),
                last_communication: m.runtime.last_communication,
            })
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats { total: self.modules.len(), ..Default::default() };
        for module in self.modules.values() {
            match module.runtime.state {
                ModuleState::Online => stats.online += 1,
                ModuleState::Error => stats.error += 1,
                ModuleState::Offline | ModuleState::Initializing => stats.offline += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
