use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_utc() -> NaiveDateTime {
    Utc::now().naive_utc()
}

pub(crate) const EMPTY_RANGE: &str = "start must be before end";

/// Every malformed range is `InvalidRange`, checked before anything is looked up.
pub(crate) fn validate_stay(start: NaiveDate, end: NaiveDate) -> Result<Stay, EngineError> {
    validate_range(start, end, MAX_STAY_NIGHTS, "stay longer than 366 nights")
}

/// Query windows may be wider than a stay, up to `MAX_QUERY_WINDOW_DAYS`.
pub(crate) fn validate_window(start: NaiveDate, end: NaiveDate) -> Result<Stay, EngineError> {
    validate_range(start, end, MAX_QUERY_WINDOW_DAYS, "window wider than 3660 days")
}

fn validate_range(start: NaiveDate, end: NaiveDate, max_days: i64, too_long: &'static str) -> Result<Stay, EngineError> {
    let invalid = |reason| EngineError::InvalidRange { start, end, reason };
    if start >= end {
        return Err(invalid(EMPTY_RANGE));
    }
    if start.year() < MIN_VALID_YEAR || end.year() > MAX_VALID_YEAR {
        return Err(invalid("date outside 1970..=2200"));
    }
    let range = Stay::new(start, end);
    if range.nights() > max_days {
        return Err(invalid(too_long));
    }
    Ok(range)
}

/// Active reservations among `candidates` that collide with `stay`, skipping `exclude`.
pub(crate) fn colliding(candidates: Vec<Reservation>, stay: &Stay, exclude: Option<Ulid>) -> Vec<Reservation> {
    candidates
        .into_iter()
        .filter(|r| r.is_active() && Some(r.id) != exclude && r.stay().overlaps(stay))
        .collect()
}

pub(crate) fn check_no_conflict(candidates: Vec<Reservation>, stay: &Stay, exclude: Option<Ulid>) -> Result<(), EngineError> {
    match colliding(candidates, stay, exclude).first() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
