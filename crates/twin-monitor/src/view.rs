//! Consumer-side merge of the push feed and the polled snapshot.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;
use twin_core::facet::decode_parts;
use twin_core::{
    ActuatorSnapshot, DisplayLabel, FacetPair, LiveActuator, Snapshot, StableState,
};
use twin_stream::TappedMessage;

pub const DEFAULT_PUSH_STALENESS: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSource {
    Push,
    Poll,
}

impl FeedSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedSource::Push => "push",
            FeedSource::Poll => "poll",
        }
    }
}

#[derive(Debug, Clone)]
struct PushSample {
    arrived_at_ms: i64,
    actuator: LiveActuator,
}

/// Most recent pushed reading per actuator id.
#[derive(Debug, Default)]
pub struct PushFeed {
    latest: HashMap<String, PushSample>,
}

impl PushFeed {
    /// Takes any message whose payload is one actuator or carries an
    /// `actuators` array. Other payloads are ignored. Returns how many
    /// actuator readings were taken.
    pub fn ingest(&mut self, tapped: &TappedMessage) -> usize {
        let data = &tapped.message.data;
        let candidates: Vec<&Value> = match data.get("actuators") {
            Some(Value::Array(items)) => items.iter().collect(),
            _ if data.get("id").is_some() => vec![data],
            _ => Vec::new(),
        };
        let mut taken = 0;
        for candidate in candidates {
            let Ok(actuator) = serde_json::from_value::<LiveActuator>(candidate.clone()) else {
                continue;
            };
            self.latest.insert(
                actuator.id.clone(),
                PushSample {
                    arrived_at_ms: tapped.arrived_at_ms,
                    actuator,
                },
            );
            taken += 1;
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    fn fresh(&self, id: &str, now_ms: i64, staleness: Duration) -> Option<&LiveActuator> {
        let sample = self.latest.get(id)?;
        let age = now_ms - sample.arrived_at_ms;
        (age >= 0 && (age as u128) < staleness.as_millis()).then_some(&sample.actuator)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorView {
    pub id: String,
    pub facets: Option<FacetPair>,
    pub state: StableState,
    pub label: DisplayLabel,
    pub source: FeedSource,
}

/// One view per polled actuator. A fresh push reading replaces the raw
/// facets; the debounced label still comes from the poll path, except that
/// a pushed conflict surfaces as `ERROR` at once.
pub fn reconcile(
    snapshot: &Snapshot,
    push: &PushFeed,
    now_ms: i64,
    staleness: Duration,
) -> Vec<ActuatorView> {
    snapshot
        .actuators
        .iter()
        .map(|polled| match push.fresh(&polled.id, now_ms, staleness) {
            Some(pushed) => from_push(polled, pushed),
            None => ActuatorView {
                id: polled.id.clone(),
                facets: polled.facets,
                state: polled.state,
                label: polled.label,
                source: FeedSource::Poll,
            },
        })
        .collect()
}

fn from_push(polled: &ActuatorSnapshot, pushed: &LiveActuator) -> ActuatorView {
    let decoded = decode_parts(pushed.facets, pushed.state.as_deref());
    ActuatorView {
        id: polled.id.clone(),
        facets: pushed.facets.or(polled.facets),
        state: decoded.state,
        label: if decoded.conflict {
            DisplayLabel::Error
        } else {
            polled.label
        },
        source: FeedSource::Push,
    }
}

pub fn format_uptime(ms: i64) -> String {
    let secs = ms.max(0) / 1_000;
    format!("{:02}:{:02}:{:02}", secs / 3_600, (secs / 60) % 60, secs % 60)
}

fn facet_bits(facets: Option<FacetPair>) -> String {
    match facets {
        Some(pair) => format!("S1={} S2={}", u8::from(pair.sensor_a), u8::from(pair.sensor_b)),
        None => "S1=- S2=-".to_string(),
    }
}

/// Single status line for the terminal.
pub fn render_line(snapshot: &Snapshot, views: &[ActuatorView]) -> String {
    let system = &snapshot.system;
    let status = if system.status.is_empty() {
        "—"
    } else {
        system.status.as_str()
    };
    let mut line = format!("status={status}");
    if let Some(health) = &system.health {
        let _ = write!(line, " health={health}");
    }
    if let Some(uptime) = system.uptime_ms {
        let _ = write!(line, " uptime={}", format_uptime(uptime));
    }
    for view in views {
        let label = match view.label {
            DisplayLabel::Empty => "—",
            other => other.as_str(),
        };
        let marker = if snapshot.selected_actuator.as_deref() == Some(view.id.as_str()) {
            "*"
        } else {
            ""
        };
        let source = match view.source {
            FeedSource::Push => format!("push:{}", view.state.as_str()),
            FeedSource::Poll => view.source.as_str().to_string(),
        };
        let _ = write!(
            line,
            " [{marker}{} {label} {} {source}]",
            view.id,
            facet_bits(view.facets),
        );
        if let Some(cpm) = snapshot.actuator(&view.id).and_then(|a| a.cpm) {
            let _ = write!(line, " cpm={cpm:.1}");
        }
    }
    if let Some(aux) = &snapshot.aux_sensor {
        let _ = write!(line, " aux={}", aux.id);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use twin_core::{StreamMessage, SystemView};

    fn tapped(arrived_at_ms: i64, data: Value) -> TappedMessage {
        TappedMessage {
            channel: "live".to_string(),
            arrived_at_ms,
            message: StreamMessage {
                event: "actuator".to_string(),
                data,
                ts: None,
            },
        }
    }

    fn polled() -> Snapshot {
        Snapshot {
            system: SystemView {
                status: "running".to_string(),
                uptime_ms: Some(3_725_000),
                ..SystemView::default()
            },
            actuators: vec![ActuatorSnapshot {
                id: "1".to_string(),
                facets: Some(FacetPair {
                    sensor_a: false,
                    sensor_b: true,
                }),
                state: StableState::Extended,
                label: DisplayLabel::Extended,
                pending: None,
                fault: None,
                cpm: Some(4.0),
                cycles: None,
            }],
            selected_actuator: Some("1".to_string()),
            ..Snapshot::default()
        }
    }

    #[test]
    fn fresh_push_wins_and_stale_push_falls_back_to_poll() {
        let mut push = PushFeed::default();
        let taken = push.ingest(&tapped(
            1_000,
            json!({"id": 1, "facets": {"S1": 0, "S2": 0}}),
        ));
        assert_eq!(taken, 1);

        let fresh = reconcile(&polled(), &push, 2_500, DEFAULT_PUSH_STALENESS);
        assert_eq!(fresh[0].source, FeedSource::Push);
        assert_eq!(fresh[0].state, StableState::Indeterminate);
        assert_eq!(fresh[0].label, DisplayLabel::Extended);

        let stale = reconcile(&polled(), &push, 3_000, DEFAULT_PUSH_STALENESS);
        assert_eq!(stale[0].source, FeedSource::Poll);
        assert_eq!(stale[0].state, StableState::Extended);
    }

    #[test]
    fn pushed_conflict_shows_error_immediately() {
        let mut push = PushFeed::default();
        push.ingest(&tapped(
            0,
            json!({"actuators": [{"id": "1", "facets": {"S1": 1, "S2": 1}}, {"bad": true}]}),
        ));
        assert_eq!(push.len(), 1);
        let views = reconcile(&polled(), &push, 100, DEFAULT_PUSH_STALENESS);
        assert_eq!(views[0].label, DisplayLabel::Error);
    }

    #[test]
    fn unrelated_payloads_are_ignored() {
        let mut push = PushFeed::default();
        assert_eq!(push.ingest(&tapped(0, json!({"cpu": 0.5}))), 0);
        assert_eq!(push.ingest(&tapped(0, json!("text"))), 0);
        assert!(push.is_empty());
    }

    #[test]
    fn line_shows_source_chip_and_uptime() {
        let snapshot = polled();
        let views = reconcile(&snapshot, &PushFeed::default(), 0, DEFAULT_PUSH_STALENESS);
        assert_eq!(
            render_line(&snapshot, &views),
            "status=running uptime=01:02:05 [*1 EXTENDED S1=0 S2=1 poll] cpm=4.0"
        );
        assert_eq!(
            render_line(&Snapshot::default(), &[]),
            "status=—"
        );

        let mut push = PushFeed::default();
        push.ingest(&tapped(0, json!({"id": "1", "facets": {"S1": 0, "S2": 0}})));
        let views = reconcile(&snapshot, &push, 10, DEFAULT_PUSH_STALENESS);
        assert!(render_line(&snapshot, &views).contains("[*1 EXTENDED S1=0 S2=0 push:INDETERMINATE]"));
    }
}
