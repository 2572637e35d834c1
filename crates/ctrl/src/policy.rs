// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Access-decision rules.
//!
//! Pure functions over already-fetched rows; the event processor supplies
//! `now` and the person's last movement so these stay trivially testable and
//! reusable outside the scheduler.

use std::time::Duration;

use chrono::{DateTime, Local};

use crate::registry::Direction;
use crate::store::{Movement, Person};

/// Tunable policy thresholds.
#[derive(Debug, Clone)]
pub struct PolicySettings {
    /// How far back anti-passback looks for the person's last movement.
    pub antipassback_window: Duration,
    /// Minimum interval between two movements of the same person.
    pub min_stay: Duration,
    /// How far back the minimum-stay check looks.
    pub min_stay_window: Duration,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            antipassback_window: Duration::from_secs(48 * 3600),
            min_stay: Duration::from_secs(5 * 60),
            min_stay_window: Duration::from_secs(3600),
        }
    }
}

/// Outcome of the decision chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// One-line deny reason; empty when allowed.
    pub reason: DenyReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    None,
    UnknownIdentifier,
    UnassignedIdentifier,
    NotYetValid,
    Expired,
    AntiPassback,
    MinimumStay,
    UnknownTicket,
    Persistence,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::UnknownIdentifier => "unknown identifier",
            Self::UnassignedIdentifier => "unassigned identifier",
            Self::NotYetValid => "not yet valid",
            Self::Expired => "expired",
            Self::AntiPassback => "anti-passback",
            Self::MinimumStay => "minimum stay",
            Self::UnknownTicket => "unknown ticket",
            Self::Persistence => "persistence",
        }
    }
}

impl Decision {
    pub fn allow() -> Self {
        Self { allowed: true, reason: DenyReason::None }
    }

    pub fn deny(reason: DenyReason) -> Self {
        Self { allowed: false, reason }
    }
}

/// Inclusive validity window in local wall-clock; an open bound is
/// unbounded on that side.
pub fn check_validity_window(person: &Person, now: DateTime<Local>) -> Decision {
    if let Some(from) = person.valid_from {
        if now < from {
            return Decision::deny(DenyReason::NotYetValid);
        }
    }
    if let Some(to) = person.valid_to {
        if now > to {
            return Decision::deny(DenyReason::Expired);
        }
    }
    Decision::allow()
}

/// Anti-passback over the entry↔exit peer linkage.
///
/// A person whose last movement (within the window) was in `candidate`'s
/// direction through this module or its peer must first move the opposite
/// way.  Without a configured peer the check is a no-op.
pub fn check_antipassback(
    last: Option<&Movement>,
    candidate: Direction,
    module_id: i64,
    peer_id: Option<i64>,
    now: DateTime<Local>,
    window: Duration,
) -> Decision {
    let Some(peer) = peer_id else {
        return Decision::allow();
    };
    let Some(last) = last else {
        return Decision::allow();
    };
    let age = now.signed_duration_since(last.instant);
    if age.num_milliseconds() > i64::try_from(window.as_millis()).unwrap_or(i64::MAX) {
        return Decision::allow();
    }
    if last.direction == candidate && (last.module_id == module_id || last.module_id == peer) {
        return Decision::deny(DenyReason::AntiPassback);
    }
    Decision::allow()
}

/// Minimum stay between two movements of the same person, defeating
/// accidental double-reads.
pub fn check_minimum_stay(
    last: Option<&Movement>,
    now: DateTime<Local>,
    settings: &PolicySettings,
) -> Decision {
    let Some(last) = last else {
        return Decision::allow();
    };
    let age = now.signed_duration_since(last.instant);
    let window_ms = i64::try_from(settings.min_stay_window.as_millis()).unwrap_or(i64::MAX);
    if age.num_milliseconds() > window_ms {
        return Decision::allow();
    }
    let min_ms = i64::try_from(settings.min_stay.as_millis()).unwrap_or(i64::MAX);
    if age.num_milliseconds() < min_ms {
        return Decision::deny(DenyReason::MinimumStay);
    }
    Decision::allow()
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
