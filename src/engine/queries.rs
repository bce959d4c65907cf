use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_RESULT_ROWS;
use crate::model::*;

use super::{Engine, SharedAmenityState};

/// Row filter for booking listings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub id: Option<Ulid>,
    pub resident_id: Option<ResidentId>,
    pub amenity_id: Option<AmenityId>,
    pub date: Option<NaiveDate>,
    pub status: Option<BookingStatus>,
}

impl BookingFilter {
    pub fn matches(&self, b: &BookingRecord) -> bool {
        self.id.is_none_or(|id| b.id == id)
            && self.resident_id.as_deref().is_none_or(|r| b.resident_id == r)
            && self.amenity_id.as_deref().is_none_or(|a| b.amenity_id == a)
            && self.date.is_none_or(|d| b.date == d)
            && self.status.is_none_or(|s| b.status == s)
    }
}

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Option<BookingRecord> {
        let amenity_id = self.get_amenity_for_booking(&id)?;
        let state = self.get_amenity(&amenity_id)?;
        let guard = state.read().await;
        guard.get(id).cloned()
    }

    /// Store query (a): the resident's active bookings of `amenity_id` dated
    /// strictly before `before`, most recent first, at most `limit`.
    pub async fn prior_bookings(
        &self,
        resident_id: &str,
        amenity_id: &str,
        before: NaiveDate,
        limit: usize,
    ) -> Vec<BookingRecord> {
        let Some(state) = self.get_amenity(amenity_id) else {
            return vec![];
        };
        let guard = state.read().await;
        guard.prior_for_resident(resident_id, before, limit)
    }

    /// Store query (b): active bookings of `amenity_id` on `date`, by start time.
    pub async fn overlapping_candidates(&self, amenity_id: &str, date: NaiveDate) -> Vec<BookingRecord> {
        let Some(state) = self.get_amenity(amenity_id) else {
            return vec![];
        };
        let guard = state.read().await;
        guard.active_on(date).cloned().collect()
    }

    /// All bookings (any status) of an amenity, optionally limited to one day.
    pub async fn bookings_for_amenity(&self, amenity_id: &str, date: Option<NaiveDate>) -> Vec<BookingRecord> {
        self.list_bookings(&BookingFilter {
            amenity_id: Some(amenity_id.to_string()),
            date,
            ..Default::default()
        })
        .await
    }

    pub async fn bookings_for_resident(&self, resident_id: &str) -> Vec<BookingRecord> {
        self.list_bookings(&BookingFilter {
            resident_id: Some(resident_id.to_string()),
            ..Default::default()
        })
        .await
    }

    /// Bookings matching `filter`, ordered by date, start time, then amenity.
    /// Truncated to [`MAX_RESULT_ROWS`].
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<BookingRecord> {
        if let Some(id) = filter.id {
            return self
                .get_booking(id)
                .await
                .filter(|b| filter.matches(b))
                .into_iter()
                .collect();
        }

        let states: Vec<SharedAmenityState> = match &filter.amenity_id {
            Some(amenity_id) => self.get_amenity(amenity_id).into_iter().collect(),
            None => self.amenities.iter().map(|e| e.value().clone()).collect(),
        };

        let mut rows = Vec::new();
        for state in states {
            let guard = state.read().await;
            match filter.date {
                Some(date) => rows.extend(guard.on(date).filter(|b| filter.matches(b)).cloned()),
                None => rows.extend(guard.iter().filter(|b| filter.matches(b)).cloned()),
            }
        }
        rows.sort_by(|a, b| {
            (a.date, a.slot.start, &a.amenity_id, a.id).cmp(&(b.date, b.slot.start, &b.amenity_id, b.id))
        });
        rows.truncate(MAX_RESULT_ROWS);
        rows
    }
}
