use thiserror::Error;
use ulid::Ulid;

use crate::model::{Span, Status};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("slot taken: overlaps reservation {conflicting}")]
    SlotTaken { conflicting: Ulid },

    #[error("date blocked: {reason}")]
    DateBlocked { reason: String },

    #[error("monthly limit of {limit} reservations per unit reached")]
    MonthlyLimitExceeded { limit: u32 },

    #[error(
        "area {area_id} has confirmed reservation {reservation_id} at [{}, {}); resolve it before blocking",
        .span.start,
        .span.end
    )]
    ConflictingConfirmedBooking {
        area_id: Ulid,
        reservation_id: Ulid,
        span: Span,
    },

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: Ulid, from: Status, to: Status },

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::SlotTaken { .. } => "slot_taken",
            EngineError::DateBlocked { .. } => "date_blocked",
            EngineError::MonthlyLimitExceeded { .. } => "monthly_limit_exceeded",
            EngineError::ConflictingConfirmedBooking { .. } => "conflicting_confirmed_booking",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// Ordinary business outcomes a person has to react to; not system failures.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            EngineError::SlotTaken { .. }
                | EngineError::DateBlocked { .. }
                | EngineError::MonthlyLimitExceeded { .. }
        )
    }

    /// SQLSTATE reported over the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::SlotTaken { .. } => "23P01",
            EngineError::DateBlocked { .. } => "23P02",
            EngineError::MonthlyLimitExceeded { .. } => "23P03",
            EngineError::ConflictingConfirmedBooking { .. } => "23P04",
            EngineError::InvalidTransition { .. } => "55000",
            EngineError::Forbidden(_) => "42501",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_and_taken_are_distinguishable() {
        let taken = EngineError::SlotTaken {
            conflicting: Ulid::new(),
        };
        let blocked = EngineError::DateBlocked {
            reason: "pool maintenance".into(),
        };
        assert_ne!(taken.sqlstate(), blocked.sqlstate());
        assert!(blocked.to_string().contains("pool maintenance"));
        assert!(taken.is_expected() && blocked.is_expected());
    }

    #[test]
    fn invalid_transition_is_not_expected() {
        let e = EngineError::InvalidTransition {
            id: Ulid::new(),
            from: Status::Rejected,
            to: Status::Rejected,
        };
        assert!(!e.is_expected());
        assert_eq!(e.label(), "invalid_transition");
        assert!(e.to_string().contains("REJECTED -> REJECTED"));
    }
}
