// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::proto::opcode_of;
use crate::registry::{Direction, ModuleConfig, MovementKind};
use crate::store::mem::{MemStore, PersonSeed, Seed};
use chrono::Duration;

fn module(module_id: i64, address: u8, module_type: ModuleType) -> ModuleConfig {
    ModuleConfig {
        module_id,
        address,
        name: format!("m{module_id}"),
        module_type,
        polling_order: 0,
        pulse_duration_ms: 0,
        requires_ticket_validation: false,
        peer_entry_module_id: None,
        peer_exit_module_id: None,
    }
}

/// Entry barrier A (module 1, addr 5) peered with exit barrier B (module 2,
/// addr 6), plus person Ada holding card 00001234.
fn fixture() -> (Arc<MemStore>, ModuleConfig, ModuleConfig) {
    let mut entry = module(1, 5, ModuleType::Barrier);
    entry.peer_exit_module_id = Some(2);
    let mut exit = module(2, 6, ModuleType::Barrier);
    exit.peer_entry_module_id = Some(1);

    let store = Arc::new(MemStore::from_seed(Seed {
        modules: vec![entry.clone(), exit.clone()],
        persons: vec![PersonSeed {
            person_id: 10,
            name: "Ada".to_owned(),
            valid_from: None,
            valid_to: None,
            identifiers: vec!["00001234".to_owned()],
        }],
    }));
    (store, entry, exit)
}

fn processor(store: Arc<MemStore>) -> Processor {
    Processor::new(store, PolicySettings::default(), crate::ids::default_epoch_base())
}

fn registry_for(configs: Vec<ModuleConfig>) -> Registry {
    Registry::from_configs(configs).unwrap()
}

#[test]
fn unknown_identifier_denied() {
    let (store, entry, _) = fixture();
    let p = processor(store);
    let (decision, _, _) = p.decide("99999999", &entry, Local::now());
    assert_eq!(decision, Decision::deny(DenyReason::UnknownIdentifier));
}

#[test]
fn unassigned_identifier_denied() {
    let (store, entry, _) = fixture();
    store.add_unassigned_identifier("55555555");
    let p = processor(Arc::clone(&store));
    let (decision, row, person) = p.decide("55555555", &entry, Local::now());
    assert_eq!(decision, Decision::deny(DenyReason::UnassignedIdentifier));
    assert!(row.is_some());
    assert!(person.is_none());
}

#[test]
fn valid_card_allowed() {
    let (store, entry, _) = fixture();
    let p = processor(store);
    let (decision, row, person) = p.decide("00001234", &entry, Local::now());
    assert!(decision.allowed);
    assert!(row.is_some());
    assert_eq!(person.map(|p| p.person_id), Some(10));
}

#[test]
fn antipassback_denies_double_entry_but_allows_exit_via_peer() {
    let (store, entry, exit) = fixture();
    let now = Local::now();
    let card = store.identifier_by_number("00001234").unwrap().unwrap();

    // Ada entered through A two hours ago.
    store
        .create_movement(&Movement {
            movement_id: 1,
            module_id: entry.module_id,
            identifier_id: card.identifier_id,
            instant: now - Duration::hours(2),
            direction: Direction::Entry,
            kind: MovementKind::Vehicular,
        })
        .unwrap();

    let p = processor(Arc::clone(&store));

    // Presenting at A again: denied, no movement row created.
    let (at_entry, _, _) = p.decide("00001234", &entry, now);
    assert_eq!(at_entry, Decision::deny(DenyReason::AntiPassback));

    // Presenting at B: allowed; the full pipeline records an exit movement.
    let mut registry = registry_for(vec![entry.clone(), exit.clone()]);
    let mut out = Vec::new();
    p.handle_novelty(&mut registry, exit.address, b"00001234", now, &mut out);

    let movements = store.movements();
    assert_eq!(movements.len(), 2);
    assert_eq!(movements[1].direction, Direction::Exit);
    assert_eq!(movements[1].module_id, exit.module_id);

    assert!(out.iter().any(|e| matches!(
        e,
        Event::MovementDetected { allowed: true, direction: Direction::Exit, .. }
    )));
}

#[test]
fn denied_novelty_creates_no_movement_and_is_not_silent() {
    let (store, entry, exit) = fixture();
    let now = Local::now();
    let card = store.identifier_by_number("00001234").unwrap().unwrap();
    store
        .create_movement(&Movement {
            movement_id: 1,
            module_id: entry.module_id,
            identifier_id: card.identifier_id,
            instant: now - Duration::hours(2),
            direction: Direction::Entry,
            kind: MovementKind::Vehicular,
        })
        .unwrap();

    let p = processor(Arc::clone(&store));
    let mut registry = registry_for(vec![entry.clone(), exit]);
    let mut out = Vec::new();
    p.handle_novelty(&mut registry, entry.address, b"00001234", now, &mut out);

    assert_eq!(store.movements().len(), 1);
    // No actuation queued on a deny.
    assert_eq!(registry.get(entry.address).map(|m| m.runtime.pending_len()), Some(0));
    // Deny is published, with its reason.
    assert!(out.iter().any(|e| matches!(
        e,
        Event::MovementDetected { allowed: false, reason: Some(r), .. } if r == "anti-passback"
    )));
}

#[test]
fn allowed_novelty_queues_barrier_open() {
    let (store, entry, exit) = fixture();
    let p = processor(store);
    let mut registry = registry_for(vec![entry.clone(), exit]);
    let mut out = Vec::new();
    p.handle_novelty(&mut registry, entry.address, b"00001234", Local::now(), &mut out);

    let module = registry.get_mut(entry.address).unwrap();
    let queued = module.runtime.next_command().unwrap();
    assert_eq!(opcode_of(&queued), Some("K1"));
}

#[test]
fn minimum_stay_defeats_double_read() {
    let (store, entry, exit) = fixture();
    let now = Local::now();
    let p = processor(Arc::clone(&store));

    let mut registry = registry_for(vec![entry.clone(), exit.clone()]);
    let mut out = Vec::new();
    p.handle_novelty(&mut registry, entry.address, b"00001234", now, &mut out);
    assert_eq!(store.movements().len(), 1);

    // The reader fires again twenty seconds later.
    let again = now + Duration::seconds(20);
    let (decision, _, _) = p.decide("00001234", &exit, again);
    assert_eq!(decision, Decision::deny(DenyReason::MinimumStay));
}

#[test]
fn expired_person_denied() {
    let store = Arc::new(MemStore::from_seed(Seed {
        modules: vec![],
        persons: vec![PersonSeed {
            person_id: 1,
            name: "Old".to_owned(),
            valid_from: None,
            valid_to: Some(Local::now() - Duration::days(1)),
            identifiers: vec!["00009999".to_owned()],
        }],
    }));
    let p = processor(store);
    let (decision, _, _) = p.decide("00009999", &module(1, 5, ModuleType::Barrier), Local::now());
    assert_eq!(decision, Decision::deny(DenyReason::Expired));
}

#[test]
fn ticket_issue_validate_close_lifecycle() {
    let mut dispenser = module(1, 5, ModuleType::TicketDispenser);
    dispenser.requires_ticket_validation = true;
    let mut exit = module(2, 6, ModuleType::Barrier);
    exit.requires_ticket_validation = true;

    let store = Arc::new(MemStore::new());
    let p = processor(Arc::clone(&store));
    let t0 = Local::now();

    // Issue at the dispenser.
    let number = p.issue_ticket(&dispenser, t0).unwrap();
    assert_eq!(number, 1);
    assert_eq!(store.active_ticket_count(), 1);

    // Validate at the exit 90 minutes later: no state change.
    let t1 = t0 + Duration::minutes(90);
    assert_eq!(
        p.validate_ticket(number, t1).unwrap(),
        TicketCheck::Valid { duration_minutes: 90 }
    );
    assert_eq!(store.active_ticket_count(), 1);

    // Close: moved to history with the exit module recorded.
    let closed = p.close_ticket(number, &exit, t1).unwrap();
    assert_eq!(closed.exit_module_id, exit.module_id);
    assert_eq!(store.active_ticket_count(), 0);
    assert_eq!(store.history_ticket_count(), 1);

    // Re-validating after close is invalid.
    assert_eq!(p.validate_ticket(number, t1).unwrap(), TicketCheck::Invalid);
}

#[test]
fn ticket_novelties_drive_the_lifecycle() {
    let mut dispenser = module(1, 5, ModuleType::TicketDispenser);
    dispenser.requires_ticket_validation = true;
    let mut exit = module(2, 6, ModuleType::Barrier);
    exit.requires_ticket_validation = true;

    let store = Arc::new(MemStore::new());
    let p = processor(Arc::clone(&store));
    let mut registry = registry_for(vec![dispenser.clone(), exit.clone()]);
    let now = Local::now();

    // Button press at the dispenser surfaces as a novelty.
    let mut out = Vec::new();
    p.handle_novelty(&mut registry, dispenser.address, b"00000000", now, &mut out);
    assert!(out.iter().any(|e| matches!(e, Event::TicketIssued { number: 1, .. })));

    // The printed ticket number is presented at the exit lane.
    let mut out = Vec::new();
    p.handle_novelty(
        &mut registry,
        exit.address,
        b"00000001",
        now + Duration::minutes(30),
        &mut out,
    );
    assert!(out
        .iter()
        .any(|e| matches!(e, Event::TicketClosed { number: 1, duration_minutes: 30, .. })));
    assert!(store.ticket_sets_disjoint());

    // The exit barrier opens for a closed ticket.
    let queued = registry.get_mut(exit.address).unwrap().runtime.next_command().unwrap();
    assert_eq!(opcode_of(&queued), Some("K1"));

    // An unknown number is denied, not silently dropped.
    let mut out = Vec::new();
    p.handle_novelty(&mut registry, exit.address, b"00000042", now, &mut out);
    assert!(out.iter().any(|e| matches!(
        e,
        Event::MovementDetected { allowed: false, reason: Some(r), .. } if r == "unknown ticket"
    )));
}

#[test]
fn short_novelty_is_dropped() {
    let (store, entry, exit) = fixture();
    let p = processor(Arc::clone(&store));
    let mut registry = registry_for(vec![entry.clone(), exit]);
    let mut out = Vec::new();
    p.handle_novelty(&mut registry, entry.address, b"123", Local::now(), &mut out);
    assert!(out.is_empty());
    assert!(store.movements().is_empty());
}

/// Store whose movement insert always fails; exercises the persistence-deny
/// path.
struct BrokenMovements(MemStore);

impl Store for BrokenMovements {
    fn health_check(&self) -> anyhow::Result<()> {
        self.0.health_check()
    }
    fn load_modules_for_polling(&self) -> anyhow::Result<Vec<ModuleConfig>> {
        self.0.load_modules_for_polling()
    }
    fn identifier_by_number(&self, number: &str) -> anyhow::Result<Option<Identifier>> {
        self.0.identifier_by_number(number)
    }
    fn person_for_identifier(&self, identifier_id: i64) -> anyhow::Result<Option<Person>> {
        self.0.person_for_identifier(identifier_id)
    }
    fn last_movement_for_person(
        &self,
        person_id: i64,
        since: DateTime<Local>,
    ) -> anyhow::Result<Option<Movement>> {
        self.0.last_movement_for_person(person_id, since)
    }
    fn create_movement(&self, _movement: &Movement) -> anyhow::Result<()> {
        anyhow::bail!("transaction rolled back")
    }
    fn insert_active_ticket(&self, ticket: &Ticket) -> anyhow::Result<()> {
        self.0.insert_active_ticket(ticket)
    }
    fn find_active_ticket_by_number(&self, number: i64) -> anyhow::Result<Option<Ticket>> {
        self.0.find_active_ticket_by_number(number)
    }
    fn move_ticket_to_history(
        &self,
        number: i64,
        exit_instant: DateTime<Local>,
        exit_module_id: i64,
    ) -> anyhow::Result<ClosedTicket> {
        self.0.move_ticket_to_history(number, exit_instant, exit_module_id)
    }
    fn next_ticket_number(&self) -> anyhow::Result<i64> {
        self.0.next_ticket_number()
    }
}

#[test]
fn persistence_failure_surfaces_as_deny() {
    let mut entry = module(1, 5, ModuleType::Barrier);
    entry.peer_exit_module_id = Some(2);
    let mut exit = module(2, 6, ModuleType::Barrier);
    exit.peer_entry_module_id = Some(1);

    let mem = MemStore::from_seed(Seed {
        modules: vec![],
        persons: vec![PersonSeed {
            person_id: 10,
            name: "Ada".to_owned(),
            valid_from: None,
            valid_to: None,
            identifiers: vec!["00001234".to_owned()],
        }],
    });
    let store: Arc<dyn Store> = Arc::new(BrokenMovements(mem));
    let p = Processor::new(store, PolicySettings::default(), crate::ids::default_epoch_base());

    let mut registry = registry_for(vec![entry.clone(), exit]);
    let mut out = Vec::new();
    p.handle_novelty(&mut registry, entry.address, b"00001234", Local::now(), &mut out);

    assert!(out.iter().any(|e| matches!(
        e,
        Event::MovementDetected { allowed: false, reason: Some(r), .. } if r == "persistence"
    )));
    // The barrier does not open on a failed persist.
    assert_eq!(registry.get(entry.address).map(|m| m.runtime.pending_len()), Some(0));
}
