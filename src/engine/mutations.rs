use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::BOOKING_OUTCOMES_TOTAL;

use super::conflict::{
    check_no_conflict, check_not_blocked, confirmed_in, now_ms, owner_count_in, validate_duration,
    validate_span,
};
use super::lifecycle;
use super::{apply_to_area, Engine, EngineError, WalCommand};

/// Count and log the result of a façade call.
fn record_outcome<T>(operation: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!(BOOKING_OUTCOMES_TOTAL, "operation" => operation, "outcome" => outcome)
        .increment(1);
    match result {
        Err(e @ EngineError::WalError(_)) => {
            tracing::error!(operation, error = %e, "booking operation failed");
        }
        // already logged at warn where it was detected
        Err(EngineError::InvalidTransition { .. }) => {}
        Err(e) => tracing::debug!(operation, outcome, error = %e, "booking operation refused"),
        Ok(_) => {}
    }
}

fn check_text(value: &Option<String>, what: &'static str) -> Result<(), EngineError> {
    if let Some(v) = value
        && v.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded(what));
        }
    Ok(())
}

impl Engine {
    pub async fn request_reservation(
        &self,
        id: Ulid,
        req: ReservationRequest,
        actor: Actor,
    ) -> Result<Reservation, EngineError> {
        let result = self.place_request(id, req, actor).await;
        record_outcome("request_reservation", &result);
        result
    }

    async fn place_request(
        &self,
        id: Ulid,
        req: ReservationRequest,
        actor: Actor,
    ) -> Result<Reservation, EngineError> {
        let occupant = match (actor, req.owner) {
            (Actor::Resident(unit), None) => Occupant::Owner(unit),
            (Actor::Resident(unit), Some(owner)) if owner == unit => Occupant::Owner(unit),
            (Actor::Resident(_), Some(_)) => {
                return Err(EngineError::Forbidden("residents can only book for their own unit"));
            }
            (Actor::Admin, Some(owner)) => Occupant::Owner(owner),
            (Actor::Admin, None) => Occupant::WalkIn,
        };
        check_text(&req.reason, "reason too long")?;
        validate_span(&req.span)?;

        // Claim the id before taking any area lock: two requests reusing one
        // id on different areas never both get through.
        match self.reservation_to_area.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(req.area_id);
            }
        }
        let result = self.insert_request(id, req, actor, occupant).await;
        if result.is_err() {
            self.reservation_to_area.remove(&id);
        }
        result
    }

    async fn insert_request(
        &self,
        id: Ulid,
        req: ReservationRequest,
        actor: Actor,
        occupant: Occupant,
    ) -> Result<Reservation, EngineError> {
        let st = self
            .get_area_state(&req.area_id)
            .ok_or(EngineError::NotFound(req.area_id))?;
        let mut guard = st.write().await;
        if !guard.area.active {
            return Err(EngineError::Validation(format!(
                "area {} is not accepting reservations",
                guard.area.name
            )));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_AREA {
            return Err(EngineError::LimitExceeded("too many reservations on area"));
        }
        validate_duration(&guard.area, &req.span)?;

        let limit = guard.area.monthly_limit_per_unit;
        if let Actor::Resident(unit) = actor
            && limit > 0
        {
            let month = self.clock().month_span(req.span.start)?;
            if owner_count_in(&guard, unit, &month) >= limit as usize {
                return Err(EngineError::MonthlyLimitExceeded { limit });
            }
        }

        check_no_conflict(&guard, &req.span, None)?;

        let reservation = Reservation {
            id,
            area_id: req.area_id,
            occupant,
            span: req.span,
            status: lifecycle::initial_status(&actor, &guard.area),
            reason: req.reason,
            note: None,
            created_at: now_ms(),
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(req.area_id, &mut guard, &event).await?;
        tracing::info!(
            reservation_id = %id,
            area_id = %req.area_id,
            status = %reservation.status,
            kind = reservation.occupant.kind(),
            "reservation created"
        );
        Ok(reservation)
    }

    /// Block a whole local day on several areas at once. All-or-nothing.
    pub async fn create_block(
        &self,
        area_ids: &[Ulid],
        day: NaiveDate,
        reason: String,
        actor: Actor,
    ) -> Result<Vec<Reservation>, EngineError> {
        let result = self.place_blocks(area_ids, day, reason, actor).await;
        record_outcome("create_block", &result);
        result
    }

    async fn place_blocks(
        &self,
        area_ids: &[Ulid],
        day: NaiveDate,
        reason: String,
        actor: Actor,
    ) -> Result<Vec<Reservation>, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden("only administrators can block dates"));
        }
        let reason = reason.trim().to_string();
        if reason.is_empty() {
            return Err(EngineError::Validation("a block needs a reason".into()));
        }
        check_text(&Some(reason.clone()), "reason too long")?;

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut ids = area_ids.to_vec();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return Err(EngineError::Validation("no areas to block".into()));
        }
        if ids.len() > MAX_BLOCK_AREAS {
            return Err(EngineError::LimitExceeded("too many areas in one block"));
        }
        let span = self.clock().day_span(day)?;
        validate_span(&span)?;

        let mut guards = Vec::with_capacity(ids.len());
        for area_id in &ids {
            let st = self
                .get_area_state(area_id)
                .ok_or(EngineError::NotFound(*area_id))?;
            let guard = st.write_owned().await;
            if !guard.area.active {
                return Err(EngineError::Validation(format!(
                    "area {} is not active",
                    guard.area.name
                )));
            }
            if guard.reservations.len() >= MAX_RESERVATIONS_PER_AREA {
                return Err(EngineError::LimitExceeded("too many reservations on area"));
            }
            guards.push(guard);
        }

        // Phase 1: nothing confirmed may be orphaned by the block.
        for guard in &guards {
            if let Some((reservation_id, taken)) = confirmed_in(guard, &span) {
                return Err(EngineError::ConflictingConfirmedBooking {
                    area_id: guard.area.id,
                    reservation_id,
                    span: taken,
                });
            }
        }

        // Phase 2: one event for the whole batch.
        let now = now_ms();
        let blocks: Vec<Reservation> = ids
            .iter()
            .map(|area_id| Reservation {
                id: Ulid::new(),
                area_id: *area_id,
                occupant: Occupant::Block,
                span,
                status: Status::Blocked,
                reason: Some(reason.clone()),
                note: None,
                created_at: now,
            })
            .collect();
        let event = Event::BlocksPlaced {
            blocks: blocks.clone(),
        };
        self.wal_append(&event).await?;
        for guard in guards.iter_mut() {
            apply_to_area(guard, &event, &self.indexes());
            self.notify.send(guard.area.id, &event);
        }
        tracing::info!(%day, areas = ids.len(), reason = %reason, "day blocked");
        Ok(blocks)
    }

    /// Approve or reject a pending request.
    pub async fn decide(
        &self,
        id: Ulid,
        decision: Decision,
        note: Option<String>,
        actor: Actor,
    ) -> Result<Reservation, EngineError> {
        let result = self.apply_decision(id, decision, note, actor).await;
        record_outcome("decide", &result);
        result
    }

    async fn apply_decision(
        &self,
        id: Ulid,
        decision: Decision,
        note: Option<String>,
        actor: Actor,
    ) -> Result<Reservation, EngineError> {
        check_text(&note, "note too long")?;
        let (area_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let record = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        let to = decision.target();
        lifecycle::authorize(&record, to, &actor)?;
        if decision == Decision::Approve {
            // A block placed after the request wins.
            check_not_blocked(&guard, &record.span)?;
        }

        let event = Event::StatusChanged {
            id,
            area_id,
            status: to,
            note,
        };
        self.persist_and_apply(area_id, &mut guard, &event).await?;
        tracing::info!(reservation_id = %id, %area_id, status = %to, "reservation decided");
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn cancel(&self, id: Ulid, actor: Actor) -> Result<Reservation, EngineError> {
        let result = self.apply_cancel(id, actor).await;
        record_outcome("cancel", &result);
        result
    }

    async fn apply_cancel(&self, id: Ulid, actor: Actor) -> Result<Reservation, EngineError> {
        let (area_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let record = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        lifecycle::authorize(&record, Status::Cancelled, &actor)?;

        let event = Event::StatusChanged {
            id,
            area_id,
            status: Status::Cancelled,
            note: None,
        };
        self.persist_and_apply(area_id, &mut guard, &event).await?;
        tracing::info!(reservation_id = %id, %area_id, from = %record.status, "reservation cancelled");
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Lift every block of one area that starts on `day`. Blocks placed on
    /// other areas in the same batch stay.
    pub async fn unblock_day(
        &self,
        area_id: Ulid,
        day: NaiveDate,
        actor: Actor,
    ) -> Result<Vec<Reservation>, EngineError> {
        let result = self.lift_blocks(area_id, day, actor).await;
        record_outcome("unblock_day", &result);
        result
    }

    async fn lift_blocks(
        &self,
        area_id: Ulid,
        day: NaiveDate,
        actor: Actor,
    ) -> Result<Vec<Reservation>, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden("only administrators can unblock dates"));
        }
        let st = self
            .get_area_state(&area_id)
            .ok_or(EngineError::NotFound(area_id))?;
        let span = self.clock().day_span(day)?;
        let mut guard = st.write().await;

        let targets: Vec<Ulid> = guard
            .overlapping(&span)
            .filter(|r| r.status == Status::Blocked && span.contains_instant(r.span.start))
            .map(|r| r.id)
            .collect();

        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let event = Event::BlocksLifted {
            area_id,
            ids: targets.clone(),
        };
        self.persist_and_apply(area_id, &mut guard, &event).await?;
        let lifted: Vec<Reservation> = targets
            .iter()
            .filter_map(|id| guard.get(id).cloned())
            .collect();
        tracing::info!(%area_id, %day, lifted = lifted.len(), "day unblocked");
        Ok(lifted)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// Holds the registry lock and a read lock on every area until the swap is
    /// done, so no append can slip between the snapshot and the rewrite.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;

        let mut handles: Vec<_> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(handles.len());
        for (_, st) in handles {
            guards.push(st.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::AreaCreated {
                area: guard.area.clone(),
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: r.clone(),
                });
            }
        }
        let written = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::debug!(events = written, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
