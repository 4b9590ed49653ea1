//! Wall-clock normalization.
//!
//! Callers speak in local dates and times of the condominium; the engine only
//! ever sees UTC milliseconds. Every local value crosses into the engine
//! through [`CondoClock`], once.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::engine::EngineError;
use crate::model::{Ms, Span};

const LOCAL_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// A point in time as supplied by a caller, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInput {
    /// Already absolute (unix ms or a timestamp carrying an offset).
    Instant(Ms),
    /// Wall-clock time in the condominium's timezone.
    Local(NaiveDateTime),
}

impl TimeInput {
    /// Parse RFC 3339 (absolute) or `YYYY-MM-DD[T ]HH:MM[:SS]` (local).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(TimeInput::Instant(dt.timestamp_millis()));
        }
        LOCAL_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .map(TimeInput::Local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondoClock {
    tz: Tz,
}

impl CondoClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn from_name(name: &str) -> Result<Self, EngineError> {
        let tz: Tz = name
            .parse()
            .map_err(|_| EngineError::Validation(format!("unknown timezone: {name}")))?;
        Ok(Self::new(tz))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn resolve(&self, input: TimeInput) -> Result<Ms, EngineError> {
        match input {
            TimeInput::Instant(ms) => Ok(ms),
            TimeInput::Local(local) => self.local_to_instant(local),
        }
    }

    /// A wall-clock time that falls in a DST gap is rejected; one that occurs
    /// twice (DST fold) resolves to the earlier instant.
    pub fn local_to_instant(&self, local: NaiveDateTime) -> Result<Ms, EngineError> {
        match self.tz.from_local_datetime(&local) {
            LocalResult::Single(dt) => Ok(dt.timestamp_millis()),
            LocalResult::Ambiguous(earliest, _) => Ok(earliest.timestamp_millis()),
            LocalResult::None => Err(EngineError::Validation(format!(
                "{local} does not exist in {}",
                self.tz
            ))),
        }
    }

    /// Normalize a pair of caller times into an engine interval.
    pub fn interval(&self, start: TimeInput, end: TimeInput) -> Result<Span, EngineError> {
        let start = self.resolve(start)?;
        let end = self.resolve(end)?;
        if end <= start {
            return Err(EngineError::Validation("end must be after start".into()));
        }
        Ok(Span::new(start, end))
    }

    pub fn local_date(&self, instant: Ms) -> Result<NaiveDate, EngineError> {
        let utc = DateTime::<Utc>::from_timestamp_millis(instant)
            .ok_or_else(|| EngineError::Validation(format!("timestamp out of range: {instant}")))?;
        Ok(utc.with_timezone(&self.tz).date_naive())
    }

    /// First instant of a local day. Midnight can be skipped by a DST jump, in
    /// which case the day starts at the first wall-clock time that exists.
    pub fn start_of_day(&self, date: NaiveDate) -> Result<Ms, EngineError> {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| EngineError::Validation(format!("bad date: {date}")))?;
        for step in 0..=12 {
            let candidate = midnight + Duration::minutes(15 * step);
            match self.tz.from_local_datetime(&candidate) {
                LocalResult::Single(dt) => return Ok(dt.timestamp_millis()),
                LocalResult::Ambiguous(earliest, _) => return Ok(earliest.timestamp_millis()),
                LocalResult::None => continue,
            }
        }
        Err(EngineError::Validation(format!(
            "no start of day for {date} in {}",
            self.tz
        )))
    }

    /// The whole local day `[00:00, next 00:00)`. 23 or 25 hours long across DST changes.
    pub fn day_span(&self, date: NaiveDate) -> Result<Span, EngineError> {
        let next = date
            .succ_opt()
            .ok_or_else(|| EngineError::Validation(format!("bad date: {date}")))?;
        Ok(Span::new(self.start_of_day(date)?, self.start_of_day(next)?))
    }

    /// The local calendar month containing `instant`.
    pub fn month_span(&self, instant: Ms) -> Result<Span, EngineError> {
        let date = self.local_date(instant)?;
        let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
            .ok_or_else(|| EngineError::Validation(format!("bad date: {date}")))?;
        let (ny, nm) = if date.month() == 12 {
            (date.year() + 1, 1)
        } else {
            (date.year(), date.month() + 1)
        };
        let next = NaiveDate::from_ymd_opt(ny, nm, 1)
            .ok_or_else(|| EngineError::Validation(format!("bad date: {date}")))?;
        Ok(Span::new(self.start_of_day(first)?, self.start_of_day(next)?))
    }
}
