use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability;
use super::conflict::{block_reason, check_no_conflict, validate_span};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let area_id = self
            .area_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let st = self
            .get_area_state(&area_id)
            .ok_or(EngineError::NotFound(area_id))?;
        let guard = st.read().await;
        guard
            .get(&id)
            .map(ReservationInfo::from)
            .ok_or(EngineError::NotFound(id))
    }

    /// Every record of the area overlapping `window`, history included, by start.
    pub async fn list_for_area(
        &self,
        area_id: Ulid,
        window: Span,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        validate_span(&window)?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let st = self
            .get_area_state(&area_id)
            .ok_or(EngineError::NotFound(area_id))?;
        let guard = st.read().await;
        Ok(guard.overlapping(&window).map(ReservationInfo::from).collect())
    }

    /// A unit's reservations across all areas, newest start first.
    pub async fn list_for_owner(&self, owner_id: Ulid) -> Vec<ReservationInfo> {
        let ids: Vec<Ulid> = self
            .owner_index
            .get(&owner_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(area_id) = self.area_for_reservation(&id) else {
                continue;
            };
            let Some(st) = self.get_area_state(&area_id) else {
                continue;
            };
            let guard = st.read().await;
            if let Some(r) = guard.get(&id) {
                out.push(ReservationInfo::from(r));
            }
        }
        out.sort_by(|a, b| b.start.cmp(&a.start).then(b.id.cmp(&a.id)));
        out
    }

    /// Would `[start, end)` be accepted right now? Same answer as a request,
    /// without the per-unit checks.
    pub async fn check_availability(&self, area_id: Ulid, span: Span) -> Result<(), EngineError> {
        validate_span(&span)?;
        let st = self
            .get_area_state(&area_id)
            .ok_or(EngineError::NotFound(area_id))?;
        let guard = st.read().await;
        check_no_conflict(&guard, &span, None)
    }

    /// Unoccupied stretches of one local day.
    pub async fn free_windows(&self, area_id: Ulid, day: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let span = self.clock().day_span(day)?;
        let st = self
            .get_area_state(&area_id)
            .ok_or(EngineError::NotFound(area_id))?;
        let guard = st.read().await;
        Ok(availability::free_windows(&guard, &span))
    }

    /// Reason of the block covering any part of `day` in this area.
    pub async fn day_block(&self, area_id: Ulid, day: NaiveDate) -> Result<Option<String>, EngineError> {
        let span = self.clock().day_span(day)?;
        let st = self
            .get_area_state(&area_id)
            .ok_or(EngineError::NotFound(area_id))?;
        let guard = st.read().await;
        Ok(block_reason(&guard, &span))
    }

    pub async fn day_status(&self, area_id: Ulid, day: NaiveDate) -> Result<DayStatus, EngineError> {
        let span = self.clock().day_span(day)?;
        let st = self
            .get_area_state(&area_id)
            .ok_or(EngineError::NotFound(area_id))?;
        let guard = st.read().await;
        if let Some(reason) = block_reason(&guard, &span) {
            return Ok(DayStatus::Blocked { reason });
        }
        if guard.occupying(&span).next().is_some() {
            return Ok(DayStatus::Partial);
        }
        Ok(DayStatus::Free)
    }
}
