// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistence contract.
//!
//! The controller consumes a movement/ticket store but does not define its
//! deployment: DB-backed implementations are external collaborators behind
//! [`Store`].  [`mem::MemStore`] is the in-process implementation used by the
//! shipped binary (JSON-seeded) and by tests.  Calls are synchronous and
//! bounded; each implementation owns its transaction discipline.

pub mod mem;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::registry::{Direction, ModuleConfig, MovementKind};

/// A physical credential: card number or printed ticket code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub identifier_id: i64,
    /// Opaque short string, unique, as printed on the credential.
    pub number: String,
}

/// An identity with a validity window; open-ended bounds are unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub person_id: i64,
    pub name: String,
    #[serde(default)]
    pub valid_from: Option<DateTime<Local>>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Local>>,
}

/// An immutable access event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub movement_id: i64,
    pub module_id: i64,
    pub identifier_id: i64,
    pub instant: DateTime<Local>,
    pub direction: Direction,
    pub kind: MovementKind,
}

/// A parking ticket in the active set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: i64,
    pub number: i64,
    pub entry_instant: DateTime<Local>,
    pub entry_module_id: i64,
    pub validated: bool,
}

/// A ticket after the atomic move to the history set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTicket {
    pub ticket: Ticket,
    pub exit_instant: DateTime<Local>,
    pub exit_module_id: i64,
}

/// Transactional movement/ticket store plus module configuration source.
pub trait Store: Send + Sync {
    /// Must succeed before the controller starts.
    fn health_check(&self) -> anyhow::Result<()>;

    /// Module configurations, unordered; the registry fixes polling order.
    fn load_modules_for_polling(&self) -> anyhow::Result<Vec<ModuleConfig>>;

    fn identifier_by_number(&self, number: &str) -> anyhow::Result<Option<Identifier>>;

    /// Person assigned to an identifier via the many-to-many relation.
    fn person_for_identifier(&self, identifier_id: i64) -> anyhow::Result<Option<Person>>;

    /// Most recent movement for a person at or after `since`, across all of
    /// the person's identifiers.
    fn last_movement_for_person(
        &self,
        person_id: i64,
        since: DateTime<Local>,
    ) -> anyhow::Result<Option<Movement>>;

    /// Persist a movement together with its category attributes in one
    /// transaction.
    fn create_movement(&self, movement: &Movement) -> anyhow::Result<()>;

    fn insert_active_ticket(&self, ticket: &Ticket) -> anyhow::Result<()>;

    fn find_active_ticket_by_number(&self, number: i64) -> anyhow::Result<Option<Ticket>>;

    /// Atomically delete from the active set and insert into history.
    fn move_ticket_to_history(
        &self,
        number: i64,
        exit_instant: DateTime<Local>,
        exit_module_id: i64,
    ) -> anyhow::Result<ClosedTicket>;

    /// `max(active.number, history.number) + 1`.
    fn next_ticket_number(&self) -> anyhow::Result<i64>;
}
