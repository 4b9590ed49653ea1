use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only time type inside the engine.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Areas ────────────────────────────────────────────────────────

/// A bookable common area and its booking rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub id: Ulid,
    pub name: String,
    /// People the area holds. Informational: bookings are exclusive.
    pub capacity: u32,
    pub price_per_hour: Decimal,
    pub min_booking_hours: u32,
    pub max_booking_hours: u32,
    /// Occupying reservations one unit may hold here per calendar month. 0 = no limit.
    pub monthly_limit_per_unit: u32,
    /// Resident requests skip the PENDING stage.
    pub auto_approve: bool,
    pub active: bool,
    pub created_at: Ms,
}

/// Fields for a new area. Defaults follow the condominium portal's schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaSpec {
    pub name: String,
    pub capacity: u32,
    pub price_per_hour: Decimal,
    pub min_booking_hours: u32,
    pub max_booking_hours: u32,
    pub monthly_limit_per_unit: u32,
    pub auto_approve: bool,
}

impl AreaSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: 10,
            price_per_hour: Decimal::ZERO,
            min_booking_hours: 1,
            max_booking_hours: 4,
            monthly_limit_per_unit: 2,
            auto_approve: false,
        }
    }
}

/// Partial update of an area. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AreaPatch {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub price_per_hour: Option<Decimal>,
    pub min_booking_hours: Option<u32>,
    pub max_booking_hours: Option<u32>,
    pub monthly_limit_per_unit: Option<u32>,
    pub auto_approve: Option<bool>,
    pub active: Option<bool>,
}

impl AreaPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, area: &Area) -> Area {
        let mut next = area.clone();
        if let Some(ref name) = self.name {
            next.name = name.clone();
        }
        if let Some(v) = self.capacity {
            next.capacity = v;
        }
        if let Some(v) = self.price_per_hour {
            next.price_per_hour = v;
        }
        if let Some(v) = self.min_booking_hours {
            next.min_booking_hours = v;
        }
        if let Some(v) = self.max_booking_hours {
            next.max_booking_hours = v;
        }
        if let Some(v) = self.monthly_limit_per_unit {
            next.monthly_limit_per_unit = v;
        }
        if let Some(v) = self.auto_approve {
            next.auto_approve = v;
        }
        if let Some(v) = self.active {
            next.active = v;
        }
        next
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Confirmed,
    Rejected,
    Cancelled,
    Blocked,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Confirmed => "CONFIRMED",
            Status::Rejected => "REJECTED",
            Status::Cancelled => "CANCELLED",
            Status::Blocked => "BLOCKED",
        }
    }

    /// Counts against availability.
    pub fn is_occupying(&self) -> bool {
        matches!(self, Status::Pending | Status::Confirmed | Status::Blocked)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Rejected | Status::Cancelled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Status::Pending),
            "CONFIRMED" => Ok(Status::Confirmed),
            "REJECTED" => Ok(Status::Rejected),
            "CANCELLED" => Ok(Status::Cancelled),
            "BLOCKED" => Ok(Status::Blocked),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Who a reservation row stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Occupant {
    /// Booked for a unit.
    Owner(Ulid),
    /// Administrator booking attributed to no unit.
    WalkIn,
    /// Full-day administrative block.
    Block,
}

impl Occupant {
    pub fn owner(&self) -> Option<Ulid> {
        match self {
            Occupant::Owner(id) => Some(*id),
            Occupant::WalkIn | Occupant::Block => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Occupant::Owner(_) => "booking",
            Occupant::WalkIn => "walk_in",
            Occupant::Block => "block",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub area_id: Ulid,
    pub occupant: Occupant,
    pub span: Span,
    pub status: Status,
    pub reason: Option<String>,
    /// Administrator note left on approval or rejection.
    pub note: Option<String>,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_occupying(&self) -> bool {
        self.status.is_occupying()
    }

    pub fn is_block(&self) -> bool {
        matches!(self.occupant, Occupant::Block)
    }
}

/// Who is calling the façade. Identity and role come from outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Resident(Ulid),
    Admin,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn target(&self) -> Status {
        match self {
            Decision::Approve => Status::Confirmed,
            Decision::Reject => Status::Rejected,
        }
    }
}

/// A candidate booking, already normalized to UTC instants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub area_id: Ulid,
    pub span: Span,
    /// Unit the booking is for. Residents may omit it (defaults to themselves);
    /// administrators omit it for walk-in bookings.
    pub owner: Option<Ulid>,
    pub reason: Option<String>,
}

// ── Per-area ledger ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AreaState {
    pub area: Area,
    /// Every reservation ever made on the area (history included), sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl AreaState {
    pub fn new(area: Area) -> Self {
        Self {
            area,
            reservations: Vec::new(),
        }
    }

    /// Insert a record maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Records of any status whose span overlaps the query window.
    /// Uses binary search to skip records starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Overlapping records that count against availability.
    pub fn occupying(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        self.overlapping(query).filter(|r| r.is_occupying())
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AreaCreated {
        area: Area,
    },
    AreaUpdated {
        area: Area,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    /// One or more blocks placed together; replayed as a unit.
    BlocksPlaced {
        blocks: Vec<Reservation>,
    },
    StatusChanged {
        id: Ulid,
        area_id: Ulid,
        status: Status,
        note: Option<String>,
    },
    /// Every block of one area lifted together by an unblock.
    BlocksLifted {
        area_id: Ulid,
        ids: Vec<Ulid>,
    },
}

impl Event {
    /// Areas touched by the event.
    pub fn area_ids(&self) -> Vec<Ulid> {
        match self {
            Event::AreaCreated { area } | Event::AreaUpdated { area } => vec![area.id],
            Event::ReservationCreated { reservation } => vec![reservation.area_id],
            Event::BlocksPlaced { blocks } => blocks.iter().map(|b| b.area_id).collect(),
            Event::StatusChanged { area_id, .. } | Event::BlocksLifted { area_id, .. } => {
                vec![*area_id]
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A reservation as shown to callers, with its availability classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub area_id: Ulid,
    pub owner_id: Option<Ulid>,
    pub kind: &'static str,
    pub start: Ms,
    pub end: Ms,
    pub status: Status,
    pub occupying: bool,
    pub reason: Option<String>,
    pub note: Option<String>,
    pub created_at: Ms,
}

impl From<&Reservation> for ReservationInfo {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            area_id: r.area_id,
            owner_id: r.occupant.owner(),
            kind: r.occupant.kind(),
            start: r.span.start,
            end: r.span.end,
            status: r.status,
            occupying: r.is_occupying(),
            reason: r.reason.clone(),
            note: r.note.clone(),
            created_at: r.created_at,
        }
    }
}

/// Calendar classification of one local day of an area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayStatus {
    Free,
    Partial,
    Blocked { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area() -> Area {
        Area {
            id: Ulid::new(),
            name: "Pool".into(),
            capacity: 10,
            price_per_hour: Decimal::ZERO,
            min_booking_hours: 1,
            max_booking_hours: 4,
            monthly_limit_per_unit: 2,
            auto_approve: false,
            active: true,
            created_at: 0,
        }
    }

    fn record(area_id: Ulid, start: Ms, end: Ms, status: Status) -> Reservation {
        Reservation {
            id: Ulid::new(),
            area_id,
            occupant: Occupant::Owner(Ulid::new()),
            span: Span::new(start, end),
            status,
            reason: None,
            note: None,
            created_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn status_literals() {
        for s in [
            Status::Pending,
            Status::Confirmed,
            Status::Rejected,
            Status::Cancelled,
            Status::Blocked,
        ] {
            assert_eq!(s.as_str().parse::<Status>().unwrap(), s);
        }
        assert_eq!("confirmed".parse::<Status>().unwrap(), Status::Confirmed);
        assert!("CONFIRMADO".parse::<Status>().is_err());
    }

    #[test]
    fn occupying_and_terminal_sets() {
        assert!(Status::Pending.is_occupying());
        assert!(Status::Confirmed.is_occupying());
        assert!(Status::Blocked.is_occupying());
        assert!(!Status::Rejected.is_occupying());
        assert!(!Status::Cancelled.is_occupying());

        assert!(Status::Rejected.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(!Status::Blocked.is_terminal());
    }

    #[test]
    fn reservations_stay_sorted() {
        let a = area();
        let mut st = AreaState::new(a.clone());
        st.insert_reservation(record(a.id, 300, 400, Status::Pending));
        st.insert_reservation(record(a.id, 100, 200, Status::Confirmed));
        st.insert_reservation(record(a.id, 200, 300, Status::Cancelled));
        let starts: Vec<Ms> = st.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let a = area();
        let mut st = AreaState::new(a.clone());
        st.insert_reservation(record(a.id, 100, 200, Status::Confirmed));
        st.insert_reservation(record(a.id, 450, 600, Status::Confirmed));
        st.insert_reservation(record(a.id, 1000, 1100, Status::Confirmed));

        let hits: Vec<_> = st.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let a = area();
        let mut st = AreaState::new(a.clone());
        st.insert_reservation(record(a.id, 100, 200, Status::Confirmed));
        assert_eq!(st.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn occupying_filters_history() {
        let a = area();
        let mut st = AreaState::new(a.clone());
        st.insert_reservation(record(a.id, 100, 200, Status::Cancelled));
        st.insert_reservation(record(a.id, 100, 200, Status::Rejected));
        st.insert_reservation(record(a.id, 150, 250, Status::Pending));
        let hits: Vec<_> = st.occupying(&Span::new(0, 1000)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].status, Status::Pending);
    }

    #[test]
    fn patch_merges_only_given_fields() {
        let a = area();
        let patch = AreaPatch {
            capacity: Some(25),
            active: Some(false),
            ..Default::default()
        };
        let next = patch.apply(&a);
        assert_eq!(next.capacity, 25);
        assert!(!next.active);
        assert_eq!(next.name, a.name);
        assert!(AreaPatch::default().is_empty());
        assert!(!patch.is_empty());
    }

    #[test]
    fn occupant_kinds() {
        let owner = Ulid::new();
        assert_eq!(Occupant::Owner(owner).owner(), Some(owner));
        assert_eq!(Occupant::WalkIn.owner(), None);
        assert_eq!(Occupant::Block.kind(), "block");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let a = area();
        let event = Event::AreaCreated {
            area: Area {
                price_per_hour: Decimal::new(4550, 2),
                ..a
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
