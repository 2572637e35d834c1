// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::proto::{encode_continue, encode_read_status};

fn config(module_id: i64, address: u8) -> ModuleConfig {
    ModuleConfig {
        module_id,
        address,
        name: format!("module-{module_id}"),
        module_type: ModuleType::Barrier,
        polling_order: 0,
        pulse_duration_ms: 1000,
        requires_ticket_validation: false,
        peer_entry_module_id: None,
        peer_exit_module_id: None,
    }
}

#[test]
fn polling_order_then_module_id() {
    let mut a = config(1, 10);
    a.polling_order = 2;
    let mut b = config(2, 20);
    b.polling_order = 1;
    let mut c = config(3, 30);
    c.polling_order = 1;

    let registry = Registry::from_configs(vec![a, b, c]).unwrap();
    assert_eq!(registry.addresses(), vec![20, 30, 10]);
    assert_eq!(registry.address_at(0), Some(20));
    assert_eq!(registry.address_at(3), None);
}

#[test]
fn duplicate_address_rejected() {
    let err = Registry::from_configs(vec![config(1, 5), config(2, 5)]).unwrap_err();
    assert!(err.to_string().contains("duplicate bus address"));
}

#[test]
fn duplicate_module_id_rejected() {
    let err = Registry::from_configs(vec![config(1, 5), config(1, 6)]).unwrap_err();
    assert!(err.to_string().contains("duplicate module id"));
}

#[test]
fn zero_address_rejected() {
    let err = Registry::from_configs(vec![config(1, 0)]).unwrap_err();
    assert!(err.to_string().contains("address"));
}

#[test]
fn empty_name_rejected() {
    let mut bad = config(1, 5);
    bad.name = "  ".to_owned();
    assert!(bad.validate().is_err());
}

#[test]
fn ticket_validation_needs_capability() {
    let mut bad = config(1, 5);
    bad.module_type = ModuleType::Turnstile;
    bad.requires_ticket_validation = true;
    let err = bad.validate().unwrap_err();
    assert!(err.to_string().contains("ticket validation"));

    let mut ok = config(2, 6);
    ok.module_type = ModuleType::TicketDispenser;
    ok.requires_ticket_validation = true;
    assert!(ok.validate().is_ok());
}

#[test]
fn pending_queue_dedupes_and_preserves_order() {
    let mut runtime = ModuleRuntime::default();
    let open = encode_continue(5, "");
    let status = encode_read_status(5);

    assert!(runtime.push_command(open.clone()));
    assert!(runtime.push_command(status.clone()));
    assert!(!runtime.push_command(open.clone()));
    assert_eq!(runtime.pending_len(), 2);

    assert_eq!(runtime.next_command(), Some(open.clone()));
    assert_eq!(runtime.next_command(), Some(status));
    assert_eq!(runtime.next_command(), None);

    // Once popped, the same frame may queue again.
    assert!(runtime.push_command(open));
}

#[test]
fn clear_pending_empties_queue() {
    let mut runtime = ModuleRuntime::default();
    runtime.push_command(encode_continue(5, ""));
    runtime.push_command(encode_read_status(5));
    assert_eq!(runtime.clear_pending(), 2);
    assert_eq!(runtime.pending_len(), 0);
}

#[test]
fn direction_follows_peer_linkage() {
    let mut entry = config(1, 5);
    entry.peer_exit_module_id = Some(2);
    assert_eq!(entry.direction(), Direction::Entry);
    assert_eq!(entry.peer_id(), Some(2));

    let mut exit = config(2, 6);
    exit.peer_entry_module_id = Some(1);
    assert_eq!(exit.direction(), Direction::Exit);
    assert_eq!(exit.peer_id(), Some(1));

    let unpeered = config(3, 7);
    assert_eq!(unpeered.direction(), Direction::Entry);
    assert_eq!(unpeered.peer_id(), None);
}

#[test]
fn kind_follows_module_type() {
    let mut m = config(1, 5);
    assert_eq!(m.kind(), MovementKind::Vehicular);
    m.module_type = ModuleType::Turnstile;
    assert_eq!(m.kind(), MovementKind::Pedestrian);
}

#[test]
fn actuation_capability() {
    let mut m = config(1, 5);
    assert!(m.acts_on_identification());
    m.module_type = ModuleType::CardReader;
    assert!(m.acts_on_identification());
    m.module_type = ModuleType::TicketDispenser;
    assert!(!m.acts_on_identification());
}

#[test]
fn snapshot_reflects_runtime() {
    let mut registry = Registry::from_configs(vec![config(1, 5), config(2, 6)]).unwrap();
    if let Some(module) = registry.get_mut(5) {
        module.runtime.state = ModuleState::Online;
        module.runtime.push_command(encode_continue(5, ""));
    }

    let snap = registry.snapshot();
    assert_eq!(snap.len(), 2);
    assert_eq!(snap[0].address, 5);
    assert_eq!(snap[0].state, ModuleState::Online);
    assert_eq!(snap[0].pending_commands, 1);
    assert_eq!(snap[1].state, ModuleState::Initializing);

    let stats = registry.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.online, 1);
    assert_eq!(stats.offline, 1);
}

#[test]
fn secondary_index_by_module_id() {
    let registry = Registry::from_configs(vec![config(1, 5), config(2, 6)]).unwrap();
    assert_eq!(registry.by_module_id(2).map(|m| m.config.address), Some(6));
    assert!(registry.by_module_id(99).is_none());
}
