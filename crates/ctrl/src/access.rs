// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event processor: turns decoded novelties into access decisions.
//!
//! Runs synchronously on the scheduler task while the registry write lock is
//! held, so it never publishes directly — decisions append to an event sink
//! the scheduler flushes after releasing the lock.  Store calls are bounded
//! lookups/inserts.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate};
use tracing::{info, warn};

use crate::events::Event;
use crate::ids::{movement_id_at, ticket_id_at};
use crate::policy::{
    check_antipassback, check_minimum_stay, check_validity_window, Decision, DenyReason,
    PolicySettings,
};
use crate::proto::{encode_continue, latin1, parse_novelty};
use crate::registry::{ModuleConfig, ModuleType, Registry};
use crate::store::{ClosedTicket, Identifier, Movement, Person, Store, Ticket};

/// Outcome of a ticket presentation at an exit lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketCheck {
    Valid { duration_minutes: i64 },
    Invalid,
}

pub struct Processor {
    store: Arc<dyn Store>,
    policy: PolicySettings,
    epoch_base: NaiveDate,
}

impl Processor {
    pub fn new(store: Arc<dyn Store>, policy: PolicySettings, epoch_base: NaiveDate) -> Self {
        Self { store, policy, epoch_base }
    }

    /// Consume the novelty bytes a module reported (status prefix already
    /// stripped).  Appends resulting events to `out`; queues actuations on
    /// the module.
    pub fn handle_novelty(
        &self,
        registry: &mut Registry,
        address: u8,
        bytes: &[u8],
        now: DateTime<Local>,
        out: &mut Vec<Event>,
    ) {
        let Some(module) = registry.get(address).map(|m| m.config.clone()) else {
            warn!(address, "novelty from unknown address");
            return;
        };
        let Some(novelty) = parse_novelty(bytes) else {
            warn!(
                address,
                raw = %latin1(bytes),
                "novelty too short to carry an identifier"
            );
            return;
        };

        out.push(Event::NoveltyReceived {
            module_id: module.module_id,
            address,
            identifier: novelty.identifier.clone(),
            raw: latin1(bytes),
        });

        if module.requires_ticket_validation {
            self.handle_ticket_novelty(registry, &module, &novelty.identifier, now, out);
        } else {
            self.handle_card_novelty(registry, &module, &novelty.identifier, now, out);
        }
    }

    fn handle_card_novelty(
        &self,
        registry: &mut Registry,
        module: &ModuleConfig,
        identifier: &str,
        now: DateTime<Local>,
        out: &mut Vec<Event>,
    ) {
        let (decision, identifier_row, person) = self.decide(identifier, module, now);

        if !decision.allowed {
            warn!(
                identifier,
                module = %module.name,
                reason = decision.reason.as_str(),
                "access denied"
            );
            out.push(self.movement_event(module, identifier, person.as_ref(), None, &decision));
            return;
        }

        // decide() only allows once both rows resolved.
        let Some(identifier_row) = identifier_row else {
            return;
        };

        let movement_id = movement_id_at(now, self.epoch_base);
        let movement = Movement {
            movement_id,
            module_id: module.module_id,
            identifier_id: identifier_row.identifier_id,
            instant: now,
            direction: module.direction(),
            kind: module.kind(),
        };

        if let Err(e) = self.store.create_movement(&movement) {
            warn!(identifier, err = %e, "movement persist failed");
            let denied = Decision::deny(DenyReason::Persistence);
            out.push(self.movement_event(module, identifier, person.as_ref(), None, &denied));
            return;
        }

        if module.acts_on_identification() {
            registry.push_command(module.address, encode_continue(module.address, ""));
        }

        info!(
            identifier,
            module = %module.name,
            movement_id,
            direction = module.direction().as_str(),
            "movement recorded"
        );
        out.push(self.movement_event(
            module,
            identifier,
            person.as_ref(),
            Some(movement_id),
            &Decision::allow(),
        ));
    }

    fn handle_ticket_novelty(
        &self,
        registry: &mut Registry,
        module: &ModuleConfig,
        identifier: &str,
        now: DateTime<Local>,
        out: &mut Vec<Event>,
    ) {
        if module.module_type == ModuleType::TicketDispenser {
            match self.issue_ticket(module, now) {
                Ok(number) => {
                    info!(module = %module.name, number, "ticket issued");
                    out.push(Event::TicketIssued {
                        module_id: module.module_id,
                        address: module.address,
                        number,
                    });
                    if module.acts_on_identification() {
                        registry
                            .push_command(module.address, encode_continue(module.address, ""));
                    }
                }
                Err(e) => {
                    warn!(module = %module.name, err = %e, "ticket issue failed");
                    let denied = Decision::deny(DenyReason::Persistence);
                    out.push(self.movement_event(module, identifier, None, None, &denied));
                }
            }
            return;
        }

        // Exit lane: the identifier digits are the presented ticket number.
        let Ok(number) = identifier.trim().parse::<i64>() else {
            warn!(identifier, module = %module.name, "unparseable ticket number");
            let denied = Decision::deny(DenyReason::UnknownTicket);
            out.push(self.movement_event(module, identifier, None, None, &denied));
            return;
        };

        match self.validate_ticket(number, now) {
            Ok(TicketCheck::Valid { duration_minutes }) => {
                match self.close_ticket(number, module, now) {
                    Ok(_closed) => {
                        info!(number, duration_minutes, module = %module.name, "ticket closed");
                        out.push(Event::TicketClosed {
                            module_id: module.module_id,
                            address: module.address,
                            number,
                            duration_minutes,
                        });
                        if module.acts_on_identification() {
                            registry.push_command(
                                module.address,
                                encode_continue(module.address, ""),
                            );
                        }
                    }
                    Err(e) => {
                        warn!(number, err = %e, "ticket close failed");
                        let denied = Decision::deny(DenyReason::Persistence);
                        out.push(self.movement_event(module, identifier, None, None, &denied));
                    }
                }
            }
            Ok(TicketCheck::Invalid) => {
                warn!(number, module = %module.name, "unknown ticket presented");
                let denied = Decision::deny(DenyReason::UnknownTicket);
                out.push(self.movement_event(module, identifier, None, None, &denied));
            }
            Err(e) => {
                warn!(number, err = %e, "ticket lookup failed");
                let denied = Decision::deny(DenyReason::Persistence);
                out.push(self.movement_event(module, identifier, None, None, &denied));
            }
        }
    }

    /// The access-decision chain: identifier → person → validity window →
    /// anti-passback → minimum stay.
    pub fn decide(
        &self,
        identifier: &str,
        module: &ModuleConfig,
        now: DateTime<Local>,
    ) -> (Decision, Option<Identifier>, Option<Person>) {
        let identifier_row = match self.store.identifier_by_number(identifier) {
            Ok(Some(row)) => row,
            Ok(None) => return (Decision::deny(DenyReason::UnknownIdentifier), None, None),
            Err(e) => {
                warn!(identifier, err = %e, "identifier lookup failed");
                return (Decision::deny(DenyReason::Persistence), None, None);
            }
        };

        let person = match self.store.person_for_identifier(identifier_row.identifier_id) {
            Ok(Some(person)) => person,
            Ok(None) => {
                return (
                    Decision::deny(DenyReason::UnassignedIdentifier),
                    Some(identifier_row),
                    None,
                )
            }
            Err(e) => {
                warn!(identifier, err = %e, "person lookup failed");
                return (Decision::deny(DenyReason::Persistence), Some(identifier_row), None);
            }
        };

        let window = check_validity_window(&person, now);
        if !window.allowed {
            return (window, Some(identifier_row), Some(person));
        }

        let ap_since = now - to_chrono(self.policy.antipassback_window);
        let last_for_ap = match self.store.last_movement_for_person(person.person_id, ap_since) {
            Ok(last) => last,
            Err(e) => {
                warn!(identifier, err = %e, "movement history lookup failed");
                return (
                    Decision::deny(DenyReason::Persistence),
                    Some(identifier_row),
                    Some(person),
                );
            }
        };
        let ap = check_antipassback(
            last_for_ap.as_ref(),
            module.direction(),
            module.module_id,
            module.peer_id(),
            now,
            self.policy.antipassback_window,
        );
        if !ap.allowed {
            return (ap, Some(identifier_row), Some(person));
        }

        let stay_since = now - to_chrono(self.policy.min_stay_window);
        let last_for_stay = match self.store.last_movement_for_person(person.person_id, stay_since)
        {
            Ok(last) => last,
            Err(e) => {
                warn!(identifier, err = %e, "movement history lookup failed");
                return (
                    Decision::deny(DenyReason::Persistence),
                    Some(identifier_row),
                    Some(person),
                );
            }
        };
        let stay = check_minimum_stay(last_for_stay.as_ref(), now, &self.policy);
        if !stay.allowed {
            return (stay, Some(identifier_row), Some(person));
        }

        (Decision::allow(), Some(identifier_row), Some(person))
    }

    /// Allocate and persist a new active ticket; returns its number.
    pub fn issue_ticket(&self, module: &ModuleConfig, now: DateTime<Local>) -> anyhow::Result<i64> {
        let number = self.store.next_ticket_number()?;
        let ticket = Ticket {
            ticket_id: ticket_id_at(now, self.epoch_base),
            number,
            entry_instant: now,
            entry_module_id: module.module_id,
            validated: false,
        };
        self.store.insert_active_ticket(&ticket)?;
        Ok(number)
    }

    /// Check a presented ticket without mutating it.
    pub fn validate_ticket(&self, number: i64, now: DateTime<Local>) -> anyhow::Result<TicketCheck> {
        match self.store.find_active_ticket_by_number(number)? {
            Some(ticket) => {
                let duration_minutes = now.signed_duration_since(ticket.entry_instant).num_minutes();
                Ok(TicketCheck::Valid { duration_minutes })
            }
            None => Ok(TicketCheck::Invalid),
        }
    }

    /// Atomically move a ticket to the history set.
    pub fn close_ticket(
        &self,
        number: i64,
        module: &ModuleConfig,
        now: DateTime<Local>,
    ) -> anyhow::Result<ClosedTicket> {
        self.store.move_ticket_to_history(number, now, module.module_id)
    }

    fn movement_event(
        &self,
        module: &ModuleConfig,
        identifier: &str,
        person: Option<&Person>,
        movement_id: Option<i64>,
        decision: &Decision,
    ) -> Event {
        Event::MovementDetected {
            module_id: module.module_id,
            address: module.address,
            identifier: identifier.to_owned(),
            person_id: person.map(|p| p.person_id),
            movement_id,
            direction: module.direction(),
            kind: module.kind(),
            allowed: decision.allowed,
            reason: (!decision.allowed).then(|| decision.reason.as_str().to_owned()),
        }
    }
}

fn to_chrono(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::hours(48))
}

#[cfg(test)]
#[path = "access_tests.rs"]
mod tests;
