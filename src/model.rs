use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque resident identifier (username in practice).
pub type ResidentId = String;

/// Opaque amenity identifier (amenity title in practice).
pub type AmenityId = String;

/// Unix milliseconds, used for creation timestamps only.
pub type Ms = i64;

/// Minute-resolution time of day, `00:00..=23:59`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self(hour * 60 + minute))
        } else {
            None
        }
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u16 {
        self.0 / 60
    }

    pub fn minute(self) -> u16 {
        self.0 % 60
    }

    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_num_seconds_from_midnight_opt(u32::from(self.0) * 60, 0).unwrap_or_default()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

/// Half-open time-of-day interval `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl TimeSlot {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        debug_assert!(start < end, "TimeSlot start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> u16 {
        self.end.minutes() - self.start.minutes()
    }

    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Canonical `HH:MM-HH:MM` label.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    /// Pending and confirmed bookings hold their slot; cancelled ones do not.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Confirmed)
                | (BookingStatus::Pending, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "Pending",
            BookingStatus::Confirmed => "Confirmed",
            BookingStatus::Cancelled => "Cancelled",
        }
    }

    /// Case-insensitive parse of the three allowed status names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested time as supplied by a client, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeRange {
    /// Separate `HH:MM` start and end fields.
    Split { start: String, end: String },
    /// Legacy single string: `HH:MM-HH:MM` or `HH:MM to HH:MM`.
    Combined(String),
}

impl TimeRange {
    pub fn split(start: impl Into<String>, end: impl Into<String>) -> Self {
        TimeRange::Split {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// Shape check for contact addresses: one `@`, no whitespace, and a dot
/// inside the domain with text on both sides.
pub fn is_valid_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
}

/// A booking request as accepted at the boundary. Only these fields can be set on create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub resident_id: ResidentId,
    pub resident_name: String,
    pub resident_email: String,
    pub amenity_id: AmenityId,
    pub date: NaiveDate,
    pub time: TimeRange,
}

/// Fields a client may change on an existing booking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub status: Option<BookingStatus>,
    pub time: Option<TimeRange>,
    pub resident_name: Option<String>,
    pub resident_email: Option<String>,
}

impl BookingPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.time.is_none()
            && self.resident_name.is_none()
            && self.resident_email.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: Ulid,
    pub resident_id: ResidentId,
    pub resident_name: String,
    pub resident_email: String,
    pub amenity_id: AmenityId,
    pub date: NaiveDate,
    pub slot: TimeSlot,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl BookingRecord {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.slot.start.to_naive_time())
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.slot.end.to_naive_time())
    }
}

/// All bookings of one amenity, grouped by date. Each day is sorted by slot start.
#[derive(Debug, Clone)]
pub struct AmenityState {
    pub id: AmenityId,
    pub days: BTreeMap<NaiveDate, Vec<BookingRecord>>,
}

impl AmenityState {
    pub fn new(id: AmenityId) -> Self {
        Self {
            id,
            days: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.days.values().all(Vec::is_empty)
    }

    /// Insert a record keeping its day sorted by slot start.
    pub fn insert_booking(&mut self, record: BookingRecord) {
        let day = self.days.entry(record.date).or_default();
        let pos = day.partition_point(|b| b.slot.start <= record.slot.start);
        day.insert(pos, record);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<BookingRecord> {
        let (date, pos) = self
            .days
            .iter()
            .find_map(|(date, day)| day.iter().position(|b| b.id == id).map(|pos| (*date, pos)))?;
        let day = self.days.get_mut(&date)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(removed)
    }

    pub fn get(&self, id: Ulid) -> Option<&BookingRecord> {
        self.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut BookingRecord> {
        self.days.values_mut().flatten().find(|b| b.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BookingRecord> {
        self.days.values().flatten()
    }

    /// Every booking on `date`, any status.
    pub fn on(&self, date: NaiveDate) -> impl Iterator<Item = &BookingRecord> {
        self.days.get(&date).into_iter().flatten()
    }

    /// Pending and confirmed bookings on `date`.
    pub fn active_on(&self, date: NaiveDate) -> impl Iterator<Item = &BookingRecord> {
        self.on(date).filter(|b| b.is_active())
    }

    /// The resident's active bookings strictly before `before`, most recent date first.
    pub fn prior_for_resident(
        &self,
        resident_id: &str,
        before: NaiveDate,
        limit: usize,
    ) -> Vec<BookingRecord> {
        self.days
            .range(..before)
            .rev()
            .flat_map(|(_, day)| day.iter().rev())
            .filter(|b| b.is_active() && b.resident_id == resident_id)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Persisted state changes. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingRequested {
        id: Ulid,
        resident_id: ResidentId,
        resident_name: String,
        resident_email: String,
        amenity_id: AmenityId,
        date: NaiveDate,
        slot: TimeSlot,
        created_at: Ms,
    },
    BookingConfirmed {
        id: Ulid,
        amenity_id: AmenityId,
    },
    BookingCancelled {
        id: Ulid,
        amenity_id: AmenityId,
    },
    BookingRescheduled {
        id: Ulid,
        amenity_id: AmenityId,
        slot: TimeSlot,
    },
    BookingDeleted {
        id: Ulid,
        amenity_id: AmenityId,
    },
    /// Carries the full contact after the change, not a diff.
    ContactUpdated {
        id: Ulid,
        amenity_id: AmenityId,
        resident_name: String,
        resident_email: String,
    },
}

impl Event {
    pub fn amenity_id(&self) -> &str {
        match self {
            Event::BookingRequested { amenity_id, .. }
            | Event::BookingConfirmed { amenity_id, .. }
            | Event::BookingCancelled { amenity_id, .. }
            | Event::BookingRescheduled { amenity_id, .. }
            | Event::BookingDeleted { amenity_id, .. }
            | Event::ContactUpdated { amenity_id, .. } => amenity_id,
        }
    }

    pub fn booking_id(&self) -> Ulid {
        match self {
            Event::BookingRequested { id, .. }
            | Event::BookingConfirmed { id, .. }
            | Event::BookingCancelled { id, .. }
            | Event::BookingRescheduled { id, .. }
            | Event::BookingDeleted { id, .. }
            | Event::ContactUpdated { id, .. } => *id,
        }
    }
}
