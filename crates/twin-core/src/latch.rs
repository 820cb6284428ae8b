//! Per-actuator debouncing of decoded facet states into operator labels.
//!
//! The latch step is a pure function of the previous record, the new
//! observation and the caller-supplied clock, so every timing rule can be
//! exercised with plain millisecond values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::facet::{decode_hint, decode_reading, Decoded, EndState, StableState};
use crate::model::{ActuatorReading, PendingCommand};

pub const CONFIRM_WINDOW_MS: i64 = 200;
pub const TRANSITION_HOLD_MS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatchTiming {
    pub confirm_window_ms: i64,
    pub transition_hold_ms: i64,
    /// `None` holds the last confirmed state for as long as readings stay indeterminate.
    pub indeterminate_expiry_ms: Option<i64>,
}

impl Default for LatchTiming {
    fn default() -> Self {
        Self {
            confirm_window_ms: CONFIRM_WINDOW_MS,
            transition_hold_ms: TRANSITION_HOLD_MS,
            indeterminate_expiry_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisplayLabel {
    /// No confirmed state yet.
    #[default]
    Empty,
    Retracted,
    Extended,
    Opening,
    Closing,
    Error,
    Unknown,
}

impl DisplayLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "",
            Self::Retracted => "RETRACTED",
            Self::Extended => "EXTENDED",
            Self::Opening => "OPENING",
            Self::Closing => "CLOSING",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DisplayLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EndState> for DisplayLabel {
    fn from(value: EndState) -> Self {
        match value {
            EndState::Retracted => DisplayLabel::Retracted,
            EndState::Extended => DisplayLabel::Extended,
        }
    }
}

fn transition_label(command: PendingCommand) -> DisplayLabel {
    match command {
        PendingCommand::Extend => DisplayLabel::Opening,
        PendingCommand::Retract => DisplayLabel::Closing,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LatchRecord {
    pub last_confirmed: Option<EndState>,
    pub candidate: Option<EndState>,
    pub candidate_since_ms: Option<i64>,
    pub last_confirmed_at_ms: Option<i64>,
    pub indeterminate_since_ms: Option<i64>,
}

impl LatchRecord {
    fn clear_candidate(&mut self) {
        self.candidate = None;
        self.candidate_since_ms = None;
    }

    fn commit(&mut self, state: EndState, now_ms: i64) {
        self.last_confirmed = Some(state);
        self.last_confirmed_at_ms = Some(now_ms);
        self.clear_candidate();
    }

    fn confirmed_label(&self) -> DisplayLabel {
        self.last_confirmed
            .map(DisplayLabel::from)
            .unwrap_or(DisplayLabel::Empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub decoded: Decoded,
    pub pending: Option<PendingCommand>,
    pub hint: Option<StableState>,
}

impl Observation {
    pub fn from_reading(reading: &ActuatorReading) -> Self {
        Self {
            decoded: decode_reading(reading),
            pending: reading.pending_command,
            hint: reading.state_hint.as_deref().and_then(decode_hint),
        }
    }
}

/// Advances one latch record by one observation.
pub fn step(
    prev: &LatchRecord,
    observation: &Observation,
    now_ms: i64,
    timing: &LatchTiming,
) -> (LatchRecord, DisplayLabel) {
    let mut next = *prev;

    let end = match observation.decoded.state {
        StableState::Conflict => {
            next.clear_candidate();
            next.indeterminate_since_ms = None;
            return (next, DisplayLabel::Error);
        }
        StableState::Indeterminate => {
            let label = step_indeterminate(&mut next, observation, now_ms, timing);
            return (next, label);
        }
        StableState::Retracted => EndState::Retracted,
        StableState::Extended => EndState::Extended,
    };

    next.indeterminate_since_ms = None;

    if next.last_confirmed == Some(end) {
        next.clear_candidate();
        return (next, DisplayLabel::from(end));
    }

    if next.candidate != Some(end) {
        next.candidate = Some(end);
        next.candidate_since_ms = Some(now_ms);
    }
    let since = next.candidate_since_ms.unwrap_or(now_ms);
    if now_ms - since >= timing.confirm_window_ms {
        next.commit(end, now_ms);
        return (next, DisplayLabel::from(end));
    }

    let label = match (next.last_confirmed, observation.pending) {
        (Some(_), Some(command)) if command.target() == end => transition_label(command),
        _ => next.confirmed_label(),
    };
    (next, label)
}

fn step_indeterminate(
    record: &mut LatchRecord,
    observation: &Observation,
    now_ms: i64,
    timing: &LatchTiming,
) -> DisplayLabel {
    let indeterminate_since = *record.indeterminate_since_ms.get_or_insert(now_ms);

    let Some(confirmed) = record.last_confirmed else {
        // Without an anchor a transition label means nothing; seed from the hint.
        return match observation.hint.and_then(StableState::end_state) {
            Some(seed) => {
                record.commit(seed, now_ms);
                DisplayLabel::from(seed)
            }
            None => DisplayLabel::Empty,
        };
    };

    if let Some(command) = observation.pending {
        if command.target() != confirmed {
            return transition_label(command);
        }
    }

    if let Some(expiry) = timing.indeterminate_expiry_ms {
        let held_since_commit = record
            .last_confirmed_at_ms
            .map(|at| now_ms - at)
            .unwrap_or(i64::MAX);
        if held_since_commit >= timing.transition_hold_ms
            && now_ms - indeterminate_since >= expiry
        {
            return DisplayLabel::Unknown;
        }
    }

    DisplayLabel::from(confirmed)
}

/// Latch records keyed by actuator id, created lazily on first observation.
#[derive(Debug, Clone, Default)]
pub struct LatchTable {
    timing: LatchTiming,
    records: HashMap<String, LatchRecord>,
}

impl LatchTable {
    pub fn new(timing: LatchTiming) -> Self {
        Self {
            timing,
            records: HashMap::new(),
        }
    }

    pub fn timing(&self) -> &LatchTiming {
        &self.timing
    }

    pub fn get(&self, id: &str) -> Option<&LatchRecord> {
        self.records.get(id)
    }

    pub fn commit(&mut self, id: &str, record: LatchRecord) {
        self.records.insert(id.to_string(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn observe(&mut self, reading: &ActuatorReading, now_ms: i64) -> DisplayLabel {
        self.observe_with(&reading.id, &Observation::from_reading(reading), now_ms)
    }

    pub fn observe_with(&mut self, id: &str, observation: &Observation, now_ms: i64) -> DisplayLabel {
        let prev = self.get(id).copied().unwrap_or_default();
        let (next, label) = step(&prev, observation, now_ms, &self.timing);
        self.commit(id, next);
        label
    }
}
