use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::facet::EndState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum PendingCommand {
    Extend,
    Retract,
}

impl PendingCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            PendingCommand::Extend => "EXTEND",
            PendingCommand::Retract => "RETRACT",
        }
    }

    pub fn target(self) -> EndState {
        match self {
            PendingCommand::Extend => EndState::Extended,
            PendingCommand::Retract => EndState::Retracted,
        }
    }
}

impl fmt::Display for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PendingCommand {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "extend" | "open" | "out" => Ok(PendingCommand::Extend),
            "retract" | "close" | "in" => Ok(PendingCommand::Retract),
            other => Err(format!("Unknown command: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FacetPair {
    #[serde(rename = "S1", deserialize_with = "deserialize_bit")]
    pub sensor_a: bool,
    #[serde(rename = "S2", deserialize_with = "deserialize_bit")]
    pub sensor_b: bool,
}

/// One poll observation for one actuator. Consumed by the latch and then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorReading {
    pub id: String,
    pub timestamp_ms: i64,
    pub facets: Option<FacetPair>,
    pub state_hint: Option<String>,
    pub pending_command: Option<PendingCommand>,
    pub fault_flag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LiveSystem {
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveActuator {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub facets: Option<FacetPair>,
    #[serde(default)]
    pub pending: Option<String>,
    #[serde(default)]
    pub fault: Option<String>,
    #[serde(default)]
    pub cpm: Option<f64>,
    #[serde(default)]
    pub cycles: Option<u64>,
}

impl LiveActuator {
    pub fn pending_command(&self) -> Option<PendingCommand> {
        self.pending
            .as_deref()
            .and_then(|raw| raw.parse::<PendingCommand>().ok())
    }

    pub fn to_reading(&self, timestamp_ms: i64) -> ActuatorReading {
        ActuatorReading {
            id: self.id.clone(),
            timestamp_ms,
            facets: self.facets,
            state_hint: self.state.clone(),
            pending_command: self.pending_command(),
            fault_flag: self.fault.clone().filter(|fault| !fault.trim().is_empty()),
        }
    }
}

/// Response of the live-actuators endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LiveStateResponse {
    #[serde(default, deserialize_with = "deserialize_opt_ts_ms")]
    pub ts: Option<i64>,
    #[serde(default)]
    pub system: LiveSystem,
    #[serde(default)]
    pub actuators: Vec<LiveActuator>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub started_at: Option<String>,
}

impl HealthResponse {
    pub fn started_at_ms(&self) -> Option<i64> {
        let raw = self.started_at.as_deref()?.trim();
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.timestamp_millis())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatePoint {
    #[serde(deserialize_with = "deserialize_ts_ms")]
    pub ts: i64,
    #[serde(deserialize_with = "deserialize_value_f64")]
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub actuator_id: String,
    pub facet: String,
    pub since_ms: i64,
    pub ascending: bool,
}

/// Latest sample from the secondary (vibration) sensor feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuxReading {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_opt_ts_ms")]
    pub ts: Option<i64>,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

/// Ids arrive as either strings or numbers.
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_bit<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(serde::de::Error::custom(format!("invalid facet value: {n}"))),
        },
        Value::String(s) => match s.trim() {
            "0" | "false" => Ok(false),
            "1" | "true" => Ok(true),
            other => Err(serde::de::Error::custom(format!(
                "invalid facet value: {other}"
            ))),
        },
        _ => Err(serde::de::Error::custom("expected bool or 0/1 for facet")),
    }
}

fn ts_ms_from_value(val: &Value) -> Option<i64> {
    match val {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.timestamp_millis())
            .or_else(|| s.trim().parse::<i64>().ok()),
        _ => None,
    }
}

fn deserialize_ts_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    ts_ms_from_value(&val)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {val}")))
}

fn deserialize_opt_ts_ms<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    Ok(val.as_ref().and_then(ts_ms_from_value))
}

fn deserialize_value_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("invalid number")),
        Value::String(s) => s.trim().parse::<f64>().map_err(serde::de::Error::custom),
        _ => Err(serde::de::Error::custom("expected number for value")),
    }
}
