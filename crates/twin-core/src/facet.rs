use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{ActuatorReading, FacetPair};

/// Semantic state derived from the two end-stop facets of an actuator.
///
/// `S1` is the retracted end-stop contact and `S2` the extended one. Both
/// closed at once is physically impossible and surfaces as `Conflict`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StableState {
    Retracted,
    Extended,
    Indeterminate,
    Conflict,
}

impl StableState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retracted => "RETRACTED",
            Self::Extended => "EXTENDED",
            Self::Indeterminate => "INDETERMINATE",
            Self::Conflict => "CONFLICT",
        }
    }

    pub fn end_state(self) -> Option<EndState> {
        match self {
            Self::Retracted => Some(EndState::Retracted),
            Self::Extended => Some(EndState::Extended),
            Self::Indeterminate | Self::Conflict => None,
        }
    }
}

impl fmt::Display for StableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two committable resting positions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndState {
    Retracted,
    Extended,
}

impl EndState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retracted => "RETRACTED",
            Self::Extended => "EXTENDED",
        }
    }
}

impl From<EndState> for StableState {
    fn from(value: EndState) -> Self {
        match value {
            EndState::Retracted => StableState::Retracted,
            EndState::Extended => StableState::Extended,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Decoded {
    pub state: StableState,
    pub conflict: bool,
}

impl Decoded {
    fn of(state: StableState) -> Self {
        Self {
            state,
            conflict: state == StableState::Conflict,
        }
    }
}

pub fn decode(sensor_a: bool, sensor_b: bool) -> Decoded {
    let state = match (sensor_a, sensor_b) {
        (true, false) => StableState::Retracted,
        (false, true) => StableState::Extended,
        (false, false) => StableState::Indeterminate,
        (true, true) => StableState::Conflict,
    };
    Decoded::of(state)
}

/// Normalizes a coarse backend state string. Unrecognized text yields `None`.
pub fn decode_hint(hint: &str) -> Option<StableState> {
    let normalized: String = hint
        .trim()
        .to_lowercase()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .collect();
    match normalized.as_str() {
        "" => None,
        "opening" | "closing" | "moving" | "transit" | "intransit" | "transition"
        | "indeterminate" | "between" | "unknown" => Some(StableState::Indeterminate),
        "conflict" | "error" | "err" | "fault" => Some(StableState::Conflict),
        "closed" | "close" | "home" | "in" | "down" => Some(StableState::Retracted),
        "open" | "opened" | "out" | "up" => Some(StableState::Extended),
        other if other.starts_with("retract") => Some(StableState::Retracted),
        other if other.starts_with("extend") => Some(StableState::Extended),
        _ => None,
    }
}

/// Facets win whenever present; the textual hint is consulted only without them.
pub fn decode_reading(reading: &ActuatorReading) -> Decoded {
    decode_parts(reading.facets, reading.state_hint.as_deref())
}

pub fn decode_parts(facets: Option<FacetPair>, hint: Option<&str>) -> Decoded {
    if let Some(pair) = facets {
        return decode(pair.sensor_a, pair.sensor_b);
    }
    let state = hint
        .and_then(decode_hint)
        .unwrap_or(StableState::Indeterminate);
    Decoded::of(state)
}
