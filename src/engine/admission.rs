//! Booking admission: the pure accept/reject decision for a single request.
//!
//! Nothing here touches the store. The engine gathers the resident's prior
//! bookings and the amenity's bookings for the requested day, then calls
//! [`evaluate`] while holding the amenity's write lock.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::limits::MAX_TIME_INPUT_LEN;
use crate::model::*;

use super::Rejection;

/// How many of the resident's most recent prior bookings the streak rule looks at.
pub const PRIOR_BOOKINGS_CONSIDERED: usize = 2;

/// Canonical values of an accepted request, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub label: String,
}

impl Admission {
    pub fn slot(&self) -> TimeSlot {
        TimeSlot::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accepted(Admission),
    Rejected(Rejection),
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accepted(_))
    }

    pub fn into_result(self) -> Result<Admission, Rejection> {
        match self {
            Decision::Accepted(a) => Ok(a),
            Decision::Rejected(r) => Err(r),
        }
    }
}

/// Decide whether `request` may be admitted.
///
/// `prior` holds the resident's active bookings of the same amenity dated
/// before `request.date`, most recent first; only the first two are used.
/// `candidates` holds the amenity's active bookings on `request.date`.
///
/// Checks run in order: time validation, consecutive-day limit, slot overlap.
pub fn evaluate(
    request: &BookingRequest,
    prior: &[BookingRecord],
    candidates: &[BookingRecord],
) -> Decision {
    let slot = match normalize(&request.time) {
        Ok(slot) => slot,
        Err(r) => return Decision::Rejected(r),
    };

    if extends_streak(prior, request.date) {
        return Decision::Rejected(Rejection::ConsecutiveDayLimitExceeded);
    }

    if let Some(existing) = find_overlap(&slot, candidates) {
        return Decision::Rejected(Rejection::SlotOverlap(existing.id));
    }

    Decision::Accepted(Admission {
        start: slot.start,
        end: slot.end,
        label: slot.label(),
    })
}

/// Parse a strict 24-hour `HH:MM` value (`^([01]\d|2[0-3]):[0-5]\d$`).
pub fn parse_time(s: &str) -> Result<TimeOfDay, Rejection> {
    let invalid = || Rejection::InvalidInput(format!("invalid time {s:?} (HH:MM expected)"));
    let b = s.as_bytes();
    if b.len() != 5 || b[2] != b':' {
        return Err(invalid());
    }
    let digit = |c: u8| c.is_ascii_digit().then(|| u16::from(c - b'0'));
    let (Some(h1), Some(h2), Some(m1), Some(m2)) = (digit(b[0]), digit(b[1]), digit(b[3]), digit(b[4]))
    else {
        return Err(invalid());
    };
    TimeOfDay::from_hm(h1 * 10 + h2, m1 * 10 + m2).ok_or_else(invalid)
}

/// Validate a requested time range and produce its slot.
pub fn normalize(time: &TimeRange) -> Result<TimeSlot, Rejection> {
    let (start, end) = match time {
        TimeRange::Split { start, end } => (parse_time(start)?, parse_time(end)?),
        TimeRange::Combined(range) => {
            let (start, end) = split_combined(range)?;
            (parse_time(start)?, parse_time(end)?)
        }
    };
    if end <= start {
        return Err(Rejection::InvalidInput(format!(
            "end time {end} must be after start time {start}"
        )));
    }
    Ok(TimeSlot::new(start, end))
}

/// Split a legacy `HH:MM-HH:MM` / `HH:MM to HH:MM` string into its halves.
fn split_combined(range: &str) -> Result<(&str, &str), Rejection> {
    if range.len() > MAX_TIME_INPUT_LEN {
        return Err(Rejection::InvalidInput("time range too long".into()));
    }
    range
        .split_once(" to ")
        .or_else(|| range.split_once('-'))
        .map(|(start, end)| (start.trim(), end.trim()))
        .ok_or_else(|| {
            Rejection::InvalidInput(format!("invalid time range {range:?} (HH:MM-HH:MM expected)"))
        })
}

/// Parse a calendar date, discarding any time-of-day component.
///
/// Accepts `YYYY-MM-DD`, a naive `YYYY-MM-DDTHH:MM:SS`, or RFC 3339.
pub fn parse_date(s: &str) -> Result<NaiveDate, Rejection> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| s.parse::<NaiveDateTime>().map(|dt| dt.date()))
        .or_else(|_| DateTime::parse_from_rfc3339(s).map(|dt| dt.date_naive()))
        .map_err(|_| Rejection::InvalidInput(format!("invalid date {s:?} (YYYY-MM-DD expected)")))
}

/// Whole days from `earlier` to `later` (negative if reversed).
pub fn days_between(earlier: NaiveDate, later: NaiveDate) -> i64 {
    (later - earlier).num_days()
}

/// True if booking `date` would make a third consecutive day after the two most
/// recent prior bookings. Only those two are inspected: a gap before them resets
/// the streak, so days 1-2, skip, 4-5-6 is never caught as a whole.
pub fn extends_streak(prior: &[BookingRecord], date: NaiveDate) -> bool {
    let mut recent = prior.iter().filter(|b| b.is_active());
    let (Some(last), Some(second_last)) = (recent.next(), recent.next()) else {
        return false;
    };
    let gap = days_between(second_last.date, last.date).abs();
    let new_gap = days_between(last.date, date);
    gap == 1 && new_gap == 1
}

/// First active candidate whose slot intersects `slot`.
pub fn find_overlap<'a>(slot: &TimeSlot, candidates: &'a [BookingRecord]) -> Option<&'a BookingRecord> {
    candidates
        .iter()
        .filter(|b| b.is_active())
        .find(|b| b.slot.start < slot.end && b.slot.end > slot.start)
}
