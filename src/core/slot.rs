//! Chain time and forging slots
//!
//! Block timestamps count seconds since the chain epoch. Time is divided into
//! fixed slots, one delegate per slot.

use chrono::{DateTime, TimeZone, Utc};

/// Seconds per forging slot
pub const BLOCK_TIME: i64 = 8;

/// Number of delegates in a forging round
pub const ACTIVE_DELEGATES: i64 = 51;

/// Chain epoch: 2017-03-21T13:00:00Z
pub fn epoch_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2017, 3, 21, 13, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Seconds elapsed since the epoch at `time`
pub fn epoch_time(time: DateTime<Utc>) -> i64 {
    (time - epoch_start()).num_seconds()
}

/// Current chain time
pub fn now() -> i64 {
    epoch_time(Utc::now())
}

/// Wall-clock time for a chain timestamp
pub fn real_time(epoch_time: i64) -> DateTime<Utc> {
    epoch_start() + chrono::Duration::seconds(epoch_time)
}

pub fn slot_number(epoch_time: i64) -> i64 {
    epoch_time.div_euclid(BLOCK_TIME)
}

/// Forging is only allowed during the first half of a slot
pub fn is_forging_allowed(epoch_time: i64) -> bool {
    slot_number(epoch_time) == slot_number(epoch_time + BLOCK_TIME / 2)
}

pub fn slot_time(slot: i64) -> i64 {
    slot * BLOCK_TIME
}

pub fn next_slot(epoch_time: i64) -> i64 {
    slot_number(epoch_time) + 1
}

/// Last slot of the round starting at `next_slot`
pub fn last_slot(next_slot: i64) -> i64 {
    next_slot + ACTIVE_DELEGATES
}
