use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::Validation("end must be after start".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Booking length must sit within the area's `[min, max]` hours.
pub(crate) fn validate_duration(area: &Area, span: &Span) -> Result<(), EngineError> {
    let dur = span.duration_ms();
    let min = Ms::from(area.min_booking_hours) * HOUR_MS;
    let max = Ms::from(area.max_booking_hours) * HOUR_MS;
    if dur < min {
        return Err(EngineError::Validation(format!(
            "{} requires at least {} hour(s)",
            area.name, area.min_booking_hours
        )));
    }
    if dur > max {
        return Err(EngineError::Validation(format!(
            "{} allows at most {} hour(s)",
            area.name, area.max_booking_hours
        )));
    }
    Ok(())
}

/// Is `[start, end)` free in this area?
///
/// A block anywhere in the window wins over ordinary bookings, so the caller
/// sees `DateBlocked` rather than `SlotTaken` when both apply. `skip` excludes
/// one record (used when re-checking a record against its neighbours).
pub(crate) fn check_no_conflict(
    st: &AreaState,
    span: &Span,
    skip: Option<Ulid>,
) -> Result<(), EngineError> {
    let mut taken: Option<Ulid> = None;
    for r in st.occupying(span) {
        if Some(r.id) == skip {
            continue;
        }
        if r.status == Status::Blocked {
            return Err(EngineError::DateBlocked {
                reason: r.reason.clone().unwrap_or_else(|| "blocked".into()),
            });
        }
        if taken.is_none() {
            taken = Some(r.id);
        }
    }
    match taken {
        Some(conflicting) => Err(EngineError::SlotTaken { conflicting }),
        None => Ok(()),
    }
}

/// Only blocks, ignoring bookings. Used when approving a pending request.
pub(crate) fn check_not_blocked(st: &AreaState, span: &Span) -> Result<(), EngineError> {
    match block_reason(st, span) {
        Some(reason) => Err(EngineError::DateBlocked { reason }),
        None => Ok(()),
    }
}

/// Reason of the first occupying block overlapping `span`, if any.
pub(crate) fn block_reason(st: &AreaState, span: &Span) -> Option<String> {
    st.occupying(span)
        .find(|r| r.status == Status::Blocked)
        .map(|r| r.reason.clone().unwrap_or_else(|| "blocked".into()))
}

/// First confirmed booking that a block over `span` would orphan.
pub(crate) fn confirmed_in(st: &AreaState, span: &Span) -> Option<(Ulid, Span)> {
    st.occupying(span)
        .find(|r| r.status == Status::Confirmed)
        .map(|r| (r.id, r.span))
}

/// Occupying records held by `owner` that start inside `window`.
pub(crate) fn owner_count_in(st: &AreaState, owner: Ulid, window: &Span) -> usize {
    st.occupying(window)
        .filter(|r| r.occupant.owner() == Some(owner) && window.contains_instant(r.span.start))
        .count()
}
