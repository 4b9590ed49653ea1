//! Reservation status machine.
//!
//! ```text
//!   create(resident) ──► PENDING ──approve──► CONFIRMED
//!   create(admin)    ──► CONFIRMED              │
//!   create(block)    ──► BLOCKED                │
//!                        PENDING ──reject───► REJECTED
//!          PENDING | CONFIRMED ──cancel─────► CANCELLED
//!                        BLOCKED ──unblock──► CANCELLED
//! ```

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Status a new record starts in.
pub(crate) fn initial_status(actor: &Actor, area: &Area) -> Status {
    match actor {
        Actor::Admin => Status::Confirmed,
        Actor::Resident(_) if area.auto_approve => Status::Confirmed,
        Actor::Resident(_) => Status::Pending,
    }
}

pub(crate) fn is_allowed(from: Status, to: Status) -> bool {
    matches!(
        (from, to),
        (Status::Pending, Status::Confirmed)
            | (Status::Pending, Status::Rejected)
            | (Status::Pending, Status::Cancelled)
            | (Status::Confirmed, Status::Cancelled)
            | (Status::Blocked, Status::Cancelled)
    )
}

/// Check that `actor` may move `record` to `to`.
///
/// Structural validity is checked first, so a resident poking at a terminal
/// record still gets `InvalidTransition`.
pub(crate) fn authorize(record: &Reservation, to: Status, actor: &Actor) -> Result<(), EngineError> {
    if !is_allowed(record.status, to) {
        return Err(invalid(record.id, record.status, to));
    }
    match actor {
        Actor::Admin => Ok(()),
        Actor::Resident(unit) => {
            if to != Status::Cancelled {
                return Err(EngineError::Forbidden("only administrators can approve or reject"));
            }
            if record.is_block() {
                return Err(EngineError::Forbidden("only administrators can unblock"));
            }
            if record.occupant.owner() != Some(*unit) {
                return Err(EngineError::Forbidden("residents can only cancel their own reservations"));
            }
            Ok(())
        }
    }
}

fn invalid(id: Ulid, from: Status, to: Status) -> EngineError {
    tracing::warn!(%id, %from, %to, "rejected impossible status transition");
    EngineError::InvalidTransition { id, from, to }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const ALL: [Status; 5] = [
        Status::Pending,
        Status::Confirmed,
        Status::Rejected,
        Status::Cancelled,
        Status::Blocked,
    ];

    fn area(auto_approve: bool) -> Area {
        Area {
            id: Ulid::new(),
            name: "Gym".into(),
            capacity: 5,
            price_per_hour: Decimal::ZERO,
            min_booking_hours: 1,
            max_booking_hours: 2,
            monthly_limit_per_unit: 0,
            auto_approve,
            active: true,
            created_at: 0,
        }
    }

    fn record(occupant: Occupant, status: Status) -> Reservation {
        Reservation {
            id: Ulid::new(),
            area_id: Ulid::new(),
            occupant,
            span: Span::new(0, 1000),
            status,
            reason: None,
            note: None,
            created_at: 0,
        }
    }

    #[test]
    fn initial_status_by_role() {
        let unit = Ulid::new();
        assert_eq!(initial_status(&Actor::Resident(unit), &area(false)), Status::Pending);
        assert_eq!(initial_status(&Actor::Resident(unit), &area(true)), Status::Confirmed);
        assert_eq!(initial_status(&Actor::Admin, &area(false)), Status::Confirmed);
    }

    #[test]
    fn transition_table() {
        let allowed = [
            (Status::Pending, Status::Confirmed),
            (Status::Pending, Status::Rejected),
            (Status::Pending, Status::Cancelled),
            (Status::Confirmed, Status::Cancelled),
            (Status::Blocked, Status::Cancelled),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    is_allowed(from, to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [Status::Rejected, Status::Cancelled] {
            for to in ALL {
                assert!(!is_allowed(from, to));
            }
        }
    }

    #[test]
    fn resident_may_cancel_own_only() {
        let unit = Ulid::new();
        let own = record(Occupant::Owner(unit), Status::Confirmed);
        assert!(authorize(&own, Status::Cancelled, &Actor::Resident(unit)).is_ok());

        let other = record(Occupant::Owner(Ulid::new()), Status::Confirmed);
        assert!(matches!(
            authorize(&other, Status::Cancelled, &Actor::Resident(unit)),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[test]
    fn resident_cannot_decide_or_unblock() {
        let unit = Ulid::new();
        let pending = record(Occupant::Owner(unit), Status::Pending);
        assert!(matches!(
            authorize(&pending, Status::Confirmed, &Actor::Resident(unit)),
            Err(EngineError::Forbidden(_))
        ));
        let block = record(Occupant::Block, Status::Blocked);
        assert!(matches!(
            authorize(&block, Status::Cancelled, &Actor::Resident(unit)),
            Err(EngineError::Forbidden(_))
        ));
        assert!(authorize(&block, Status::Cancelled, &Actor::Admin).is_ok());
    }

    #[test]
    fn terminal_record_reports_invalid_transition_before_authorization() {
        let unit = Ulid::new();
        let cancelled = record(Occupant::Owner(Ulid::new()), Status::Cancelled);
        assert!(matches!(
            authorize(&cancelled, Status::Cancelled, &Actor::Resident(unit)),
            Err(EngineError::InvalidTransition { .. })
        ));
    }
}
