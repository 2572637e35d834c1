// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process publish/subscribe for controller events.
//!
//! Publication is synchronous on the scheduler task: handlers must be total
//! and short, and hand real work (camera capture, UI refresh) to their own
//! tasks.  A failing handler is logged and isolated; the remaining
//! subscribers still receive the event.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::error;

use crate::registry::{BarrierState, Direction, ModuleState, MovementKind, SensorState};

/// Subscription topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    MovementDetected,
    ModuleStateChanged,
    NoveltyReceived,
    CommunicationError,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MovementDetected => "movement_detected",
            Self::ModuleStateChanged => "module_state_changed",
            Self::NoveltyReceived => "novelty_received",
            Self::CommunicationError => "communication_error",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller events, tagged for wire/log serialization.
///
/// Ticket issuance and closure are movement traffic and ride the
/// `movement_detected` topic.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    MovementDetected {
        module_id: i64,
        address: u8,
        identifier: String,
        person_id: Option<i64>,
        movement_id: Option<i64>,
        direction: Direction,
        kind: MovementKind,
        allowed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TicketIssued {
        module_id: i64,
        address: u8,
        number: i64,
    },
    TicketClosed {
        module_id: i64,
        address: u8,
        number: i64,
        duration_minutes: i64,
    },
    ModuleStateChanged {
        module_id: i64,
        address: u8,
        state: ModuleState,
        barrier_state: BarrierState,
        sensor_state: SensorState,
    },
    NoveltyReceived {
        module_id: i64,
        address: u8,
        identifier: String,
        raw: String,
    },
    CommunicationError {
        address: u8,
        detail: String,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Self::MovementDetected { .. }
            | Self::TicketIssued { .. }
            | Self::TicketClosed { .. } => Topic::MovementDetected,
            Self::ModuleStateChanged { .. } => Topic::ModuleStateChanged,
            Self::NoveltyReceived { .. } => Topic::NoveltyReceived,
            Self::CommunicationError { .. } => Topic::CommunicationError,
        }
    }
}

type Handler = Box<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Synchronous fan-out of controller events to registered handlers.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<Topic, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one topic.
    pub fn subscribe<F>(&self, topic: Topic, handler: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.write().entry(topic).or_default().push(Box::new(handler));
    }

    /// Deliver an event to every subscriber of its topic.
    ///
    /// Handler failures are logged and do not stop delivery to the rest.
    pub fn publish(&self, event: &Event) {
        let topic = event.topic();
        let handlers = self.handlers.read();
        let Some(subscribers) = handlers.get(&topic) else {
            return;
        };
        for handler in subscribers {
            if let Err(e) = handler(event) {
                error!(topic = %topic, err = %e, "event handler failed");
            }
        }
    }

    /// Publish a batch in order; used by the scheduler after it releases the
    /// registry lock.
    pub fn publish_all(&self, events: &[Event]) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.handlers.read().get(&topic).map_or(0, Vec::len)
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
