// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process [`Store`] over a single mutex.
//!
//! The single lock makes every operation — including the active→history
//! ticket move — atomic by construction.  Seeded from a JSON file shaped
//! like [`Seed`].

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::registry::ModuleConfig;
use crate::store::{ClosedTicket, Identifier, Movement, Person, Store, Ticket};

/// JSON seed: modules plus persons with their assigned identifier numbers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub persons: Vec<PersonSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonSeed {
    pub person_id: i64,
    pub name: String,
    #[serde(default)]
    pub valid_from: Option<DateTime<Local>>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Local>>,
    /// Identifier numbers assigned to this person.
    #[serde(default)]
    pub identifiers: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    modules: Vec<ModuleConfig>,
    identifiers_by_number: HashMap<String, Identifier>,
    persons: HashMap<i64, Person>,
    /// identifier_id → person_id (the many-to-many relation, one row per
    /// identifier here).
    assignments: HashMap<i64, i64>,
    movements: Vec<Movement>,
    active_tickets: HashMap<i64, Ticket>,
    history_tickets: HashMap<i64, ClosedTicket>,
    next_identifier_id: i64,
}

pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { next_identifier_id: 1, ..Default::default() }) }
    }

    pub fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            inner.modules = seed.modules;
            for person in seed.persons {
                let row = Person {
                    person_id: person.person_id,
                    name: person.name,
                    valid_from: person.valid_from,
                    valid_to: person.valid_to,
                };
                inner.persons.insert(row.person_id, row);
                for number in person.identifiers {
                    let id = inner.next_identifier_id;
                    inner.next_identifier_id += 1;
                    inner.identifiers_by_number.insert(
                        number.clone(),
                        Identifier { identifier_id: id, number },
                    );
                    inner.assignments.insert(id, person.person_id);
                }
            }
        }
        store
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        let seed: Seed = serde_json::from_str(&raw)
            .with_context(|| format!("parsing seed file {}", path.display()))?;
        Ok(Self::from_seed(seed))
    }

    /// Register an identifier that is present on credentials but assigned to
    /// nobody (used by tests and enrollment tooling).
    pub fn add_unassigned_identifier(&self, number: &str) -> Identifier {
        let mut inner = self.inner.lock();
        let id = inner.next_identifier_id;
        inner.next_identifier_id += 1;
        let row = Identifier { identifier_id: id, number: number.to_owned() };
        inner.identifiers_by_number.insert(number.to_owned(), row.clone());
        row
    }

    /// All persisted movements, oldest first.
    pub fn movements(&self) -> Vec<Movement> {
        self.inner.lock().movements.clone()
    }

    pub fn active_ticket_count(&self) -> usize {
        self.inner.lock().active_tickets.len()
    }

    pub fn history_ticket_count(&self) -> usize {
        self.inner.lock().history_tickets.len()
    }

    /// True while no ticket number appears in both sets.
    pub fn ticket_sets_disjoint(&self) -> bool {
        let inner = self.inner.lock();
        inner.active_tickets.keys().all(|n| !inner.history_tickets.contains_key(n))
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemStore {
    fn health_check(&self) -> anyhow::Result<()> {
        // The lock is the whole backend; acquiring it is the health probe.
        let _inner = self.inner.lock();
        Ok(())
    }

    fn load_modules_for_polling(&self) -> anyhow::Result<Vec<ModuleConfig>> {
        Ok(self.inner.lock().modules.clone())
    }

    fn identifier_by_number(&self, number: &str) -> anyhow::Result<Option<Identifier>> {
        Ok(self.inner.lock().identifiers_by_number.get(number).cloned())
    }

    fn person_for_identifier(&self, identifier_id: i64) -> anyhow::Result<Option<Person>> {
        let inner = self.inner.lock();
        Ok(inner
            .assignments
            .get(&identifier_id)
            .and_then(|person_id| inner.persons.get(person_id))
            .cloned())
    }

    fn last_movement_for_person(
        &self,
        person_id: i64,
        since: DateTime<Local>,
    ) -> anyhow::Result<Option<Movement>> {
        let inner = self.inner.lock();
        let ids: Vec<i64> = inner
            .assignments
            .iter()
            .filter(|(_, pid)| **pid == person_id)
            .map(|(id, _)| *id)
            .collect();
        Ok(inner
            .movements
            .iter()
            .filter(|m| ids.contains(&m.identifier_id) && m.instant >= since)
            .max_by_key(|m| m.instant)
            .cloned())
    }

    fn create_movement(&self, movement: &Movement) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if inner.movements.iter().any(|m| m.movement_id == movement.movement_id) {
            bail!("movement {} already exists", movement.movement_id);
        }
        inner.movements.push(movement.clone());
        Ok(())
    }

    fn insert_active_ticket(&self, ticket: &Ticket) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if inner.active_tickets.contains_key(&ticket.number)
            || inner.history_tickets.contains_key(&ticket.number)
        {
            bail!("ticket number {} already exists", ticket.number);
        }
        inner.active_tickets.insert(ticket.number, ticket.clone());
        Ok(())
    }

    fn find_active_ticket_by_number(&self, number: i64) -> anyhow::Result<Option<Ticket>> {
        Ok(self.inner.lock().active_tickets.get(&number).cloned())
    }

    fn move_ticket_to_history(
        &self,
        number: i64,
        exit_instant: DateTime<Local>,
        exit_module_id: i64,
    ) -> anyhow::Result<ClosedTicket> {
        let mut inner = self.inner.lock();
        let Some(ticket) = inner.active_tickets.remove(&number) else {
            bail!("ticket {number} is not in the active set");
        };
        let closed = ClosedTicket { ticket, exit_instant, exit_module_id };
        inner.history_tickets.insert(number, closed.clone());
        Ok(closed)
    }

    fn next_ticket_number(&self) -> anyhow::Result<i64> {
        let inner = self.inner.lock();
        let max_active = inner.active_tickets.keys().max().copied().unwrap_or(0);
        let max_history = inner.history_tickets.keys().max().copied().unwrap_or(0);
        Ok(max_active.max(max_history) + 1)
    }
}

#[cfg(test)]
#[path = "mem_tests.rs"]
mod tests;
