// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::ids::default_epoch_base;
use crate::policy::PolicySettings;
use crate::proto::{encode_custom, encode_stop};
use crate::registry::ModuleSnapshot;
use crate::store::mem::{MemStore, PersonSeed, Seed};
use crate::test_support::{barrier, novelty_reply, FakeLink, FakeLinkProbes, Reply};
use parking_lot::Mutex;

struct Harness {
    registry: Arc<RwLock<Registry>>,
    probes: FakeLinkProbes,
    commands: CommandSender,
    diag: Arc<Diag>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    state_events: Arc<Mutex<Vec<Event>>>,
    comm_events: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn start(link: FakeLink, configs: Vec<crate::registry::ModuleConfig>, store: Arc<MemStore>) -> Self {
        let probes = link.probes();
        let registry = Arc::new(RwLock::new(
            Registry::from_configs(configs).unwrap_or_default(),
        ));
        let bus = Arc::new(EventBus::new());

        let state_events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&state_events);
        bus.subscribe(crate::events::Topic::ModuleStateChanged, move |event| {
            sink.lock().push(event.clone());
            Ok(())
        });
        let comm_events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&comm_events);
        bus.subscribe(crate::events::Topic::CommunicationError, move |event| {
            if let Event::CommunicationError { detail, .. } = event {
                sink.lock().push(detail.clone());
            }
            Ok(())
        });

        let processor = Processor::new(
            Arc::clone(&store) as Arc<dyn crate::store::Store>,
            PolicySettings::default(),
            default_epoch_base(),
        );
        let settings = SchedulerSettings {
            polling_interval: Duration::from_millis(10),
            max_retries: 3,
            bus_reopen_threshold: 10,
        };
        let (mut scheduler, commands, diag) = Scheduler::new(
            Box::new(link),
            Arc::clone(&registry),
            processor,
            Arc::clone(&bus),
            settings,
        );
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move { scheduler.run(run_cancel).await });

        Self {
            registry,
            probes,
            commands,
            diag,
            cancel,
            task,
            state_events,
            comm_events,
        }
    }

    async fn wait_for<F: Fn(&Self) -> bool>(&self, cond: F) {
        for _ in 0..10_000 {
            if cond(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(cond(self), "condition not reached");
    }

    fn module_snapshot(&self, address: u8) -> Option<ModuleSnapshot> {
        self.registry
            .read()
            .snapshot()
            .into_iter()
            .find(|m| m.address == address)
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

fn empty_store() -> Arc<MemStore> {
    Arc::new(MemStore::new())
}

#[tokio::test(start_paused = true)]
async fn first_valid_reply_brings_module_online() {
    let h = Harness::start(FakeLink::auto_status(), vec![barrier(1, 5)], empty_store());

    h.wait_for(|h| h.probes.sent_count() >= 2).await;
    let snap = h.module_snapshot(5).unwrap();
    assert_eq!(snap.state, ModuleState::Online);
    assert_eq!(snap.consecutive_errors, 0);
    assert!(snap.last_communication.is_some());
    assert_eq!(h.probes.sent_ops()[0], "S0");

    // Exactly one transition to online was published.
    let states: Vec<_> = h
        .state_events
        .lock()
        .iter()
        .filter_map(|e| match e {
            Event::ModuleStateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![ModuleState::Online]);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn round_robin_follows_polling_order() {
    let mut first = barrier(1, 10);
    first.polling_order = 2;
    let mut second = barrier(2, 20);
    second.polling_order = 1;

    let h = Harness::start(FakeLink::auto_status(), vec![first, second], empty_store());
    h.wait_for(|h| h.probes.sent_count() >= 4).await;

    let sent = h.probes.sent();
    let addrs: Vec<u8> = sent
        .iter()
        .take(4)
        .filter_map(|f| crate::proto::parse_address_of(f))
        .collect();
    assert_eq!(addrs, vec![20, 10, 20, 10]);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn retry_escalation_marks_module_error_once_and_recovers() {
    let link = FakeLink::auto_status();
    for _ in 0..3 {
        link.push_reply(Reply::Timeout);
    }
    let h = Harness::start(link, vec![barrier(1, 5)], empty_store());

    // Seed a stale actuation that must not survive the error transition.
    h.registry.write().push_command(5, encode_stop(5));

    h.wait_for(|h| h.probes.sent_count() >= 3).await;
    h.wait_for(|h| h.module_snapshot(5).is_some_and(|m| m.state == ModuleState::Error)).await;

    let snap = h.module_snapshot(5).unwrap();
    assert_eq!(snap.pending_commands, 0);
    let error_events = h
        .state_events
        .lock()
        .iter()
        .filter(|e| matches!(e, Event::ModuleStateChanged { state: ModuleState::Error, .. }))
        .count();
    assert_eq!(error_events, 1);

    // Script exhausted: auto replies take over and the module comes back.
    h.wait_for(|h| h.module_snapshot(5).is_some_and(|m| m.state == ModuleState::Online)).await;
    let online_events = h
        .state_events
        .lock()
        .iter()
        .filter(|e| matches!(e, Event::ModuleStateChanged { state: ModuleState::Online, .. }))
        .count();
    assert_eq!(online_events, 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn bus_reopens_exactly_once_at_threshold() {
    // No script, no auto replies: every poll times out.
    let h = Harness::start(FakeLink::new(), vec![barrier(1, 5), barrier(2, 6)], empty_store());

    h.wait_for(|h| h.probes.reopen_count() >= 1).await;
    assert_eq!(h.probes.reopen_count(), 1);
    assert_eq!(h.diag.port_reopens(), 1);
    assert_eq!(h.diag.bus_consecutive_errors(), 0);
    // The threshold is exact: ten failed polls, then the reopen.
    assert_eq!(h.probes.sent_count(), 10);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn novelty_acks_before_actuation_and_records_movement() {
    let store = Arc::new(MemStore::from_seed(Seed {
        modules: vec![],
        persons: vec![PersonSeed {
            person_id: 1,
            name: "Ada".to_owned(),
            valid_from: None,
            valid_to: None,
            identifiers: vec!["00001234".to_owned()],
        }],
    }));

    let link = FakeLink::auto_status();
    // First poll answers with a buffered novelty (bit7 set) for card 00001234.
    link.push_reply(Reply::Frame(novelty_reply(5, &[0x83, 0x00], b"00001234").to_vec()));
    let h = Harness::start(link, vec![barrier(1, 5)], Arc::clone(&store));

    h.wait_for(|h| h.probes.sent_count() >= 3).await;
    let ops = h.probes.sent_ops();
    // Status poll, then the O1 ack on the very next turn, then the barrier
    // open queued by the event processor.
    assert_eq!(&ops[..3], &["S0".to_owned(), "O1".to_owned(), "K1".to_owned()]);

    assert_eq!(store.movements().len(), 1);
    assert_eq!(store.movements()[0].module_id, 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_opcode_counts_as_communication_error() {
    let link = FakeLink::auto_status();
    link.push_reply(Reply::Frame(encode_custom(5, "Z9", &[]).to_vec()));
    let h = Harness::start(link, vec![barrier(1, 5)], empty_store());

    h.wait_for(|h| !h.comm_events.lock().is_empty()).await;
    assert!(h.comm_events.lock()[0].contains("unknown_op"));

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn checksum_garbage_counts_as_communication_error() {
    let link = FakeLink::auto_status();
    link.push_reply(Reply::Frame(b"\x02 garbage \x03ZZ".to_vec()));
    let h = Harness::start(link, vec![barrier(1, 5)], empty_store());

    h.wait_for(|h| !h.comm_events.lock().is_empty()).await;
    let snap = h.module_snapshot(5).unwrap();
    assert!(snap.consecutive_errors <= 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn injected_command_dispatches_on_module_turn() {
    let h = Harness::start(FakeLink::auto_status(), vec![barrier(1, 5)], empty_store());
    h.wait_for(|h| h.probes.sent_count() >= 1).await;

    assert!(h.commands.send(5, encode_stop(5)));
    h.wait_for(|h| h.probes.sent_ops().iter().any(|op| op == "K0")).await;

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn injected_command_for_unknown_address_is_dropped() {
    let h = Harness::start(FakeLink::auto_status(), vec![barrier(1, 5)], empty_store());
    assert!(h.commands.send(99, encode_stop(99)));
    h.wait_for(|h| h.probes.sent_count() >= 3).await;
    assert!(h.probes.sent_ops().iter().all(|op| op != "K0"));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn immediate_command_bypasses_round_robin() {
    let h = Harness::start(FakeLink::auto_status(), vec![barrier(1, 5)], empty_store());
    h.wait_for(|h| h.probes.sent_count() >= 1).await;

    let before = h.probes.sent_count();
    assert!(h.commands.send_immediate(5, encode_custom(5, "P1", b"0500")));
    h.wait_for(move |h| h.probes.sent_count() > before + 1).await;
    assert!(h.probes.sent_ops().iter().any(|op| op == "P1"));

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_loop_and_closes_the_link() {
    let h = Harness::start(FakeLink::auto_status(), vec![barrier(1, 5)], empty_store());
    h.wait_for(|h| h.probes.sent_count() >= 2).await;

    let probes = h.probes.clone();
    h.stop().await;
    assert!(!probes.is_open());
}

#[tokio::test(start_paused = true)]
async fn empty_registry_idles_without_polling() {
    let h = Harness::start(FakeLink::auto_status(), vec![], empty_store());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.probes.sent_count(), 0);
    assert_eq!(h.diag.rounds(), 0);
    h.stop().await;
}
