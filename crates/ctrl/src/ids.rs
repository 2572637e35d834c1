// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Movement identifier scheme.
//!
//! `days_since(epoch_base) * 10^8 + milliseconds_since_midnight`.  The upper
//! digits reveal the day, the lower digits the time of day, so an operator
//! can read a movement id off a report.  Within a day the scheme is
//! monotonic at millisecond resolution.

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, Timelike};

/// Multiplier separating the day component from the time-of-day component.
pub const DAY_FACTOR: i64 = 100_000_000;

/// Offset added to movement ids to form ticket ids.
pub const TICKET_ID_OFFSET: i64 = 50_000_000;

/// The fixed default epoch base (legacy installations count days from here).
pub const DEFAULT_EPOCH_BASE_YMD: (i32, u32, u32) = (2007, 6, 1);

/// Default epoch base as a date.
pub fn default_epoch_base() -> NaiveDate {
    let (y, m, d) = DEFAULT_EPOCH_BASE_YMD;
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

/// Movement id for an instant.
pub fn movement_id_at(now: DateTime<Local>, epoch_base: NaiveDate) -> i64 {
    let days = now.date_naive().signed_duration_since(epoch_base).num_days();
    let time = now.time();
    let millis = i64::from(time.num_seconds_from_midnight()) * 1000
        + i64::from(time.nanosecond() / 1_000_000);
    days * DAY_FACTOR + millis
}

/// Ticket id for an instant: the movement id plus a fixed offset so the two
/// id spaces cannot collide.
pub fn ticket_id_at(now: DateTime<Local>, epoch_base: NaiveDate) -> i64 {
    movement_id_at(now, epoch_base) + TICKET_ID_OFFSET
}

/// Recover the date and time-of-day encoded in a movement id.
pub fn parse_movement_id(id: i64, epoch_base: NaiveDate) -> Option<(NaiveDate, NaiveTime)> {
    if id < 0 {
        return None;
    }
    let days = id / DAY_FACTOR;
    let millis = id % DAY_FACTOR;
    let date = epoch_base.checked_add_signed(Duration::days(days))?;
    let seconds = u32::try_from(millis / 1000).ok()?;
    let nanos = u32::try_from((millis % 1000) * 1_000_000).ok()?;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(seconds, nanos)?;
    Some((date, time))
}

#[cfg(test)]
#[path = "ids_tests.rs"]
mod tests;
