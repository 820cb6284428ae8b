use serde::{Deserialize, Serialize};

use crate::facet::StableState;
use crate::latch::DisplayLabel;
use crate::model::{AuxReading, FacetPair, PendingCommand};

pub const OFFLINE_STATUS: &str = "offline";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemView {
    pub status: String,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActuatorSnapshot {
    pub id: String,
    pub facets: Option<FacetPair>,
    pub state: StableState,
    pub label: DisplayLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles: Option<u64>,
}

impl ActuatorSnapshot {
    /// Shallow comparison over the fields consumers render.
    pub fn same_as(&self, other: &ActuatorSnapshot) -> bool {
        self.id == other.id
            && self.facets == other.facets
            && self.state == other.state
            && self.label == other.label
            && self.pending == other.pending
            && self.fault == other.fault
            && self.cpm == other.cpm
            && self.cycles == other.cycles
    }
}

pub fn same_actuators(a: &[ActuatorSnapshot], b: &[ActuatorSnapshot]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(left, right)| left.same_as(right))
}

/// Immutable composed view. Published behind an `Arc`; never mutated after build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Snapshot {
    pub system: SystemView,
    pub actuators: Vec<ActuatorSnapshot>,
    #[serde(default)]
    pub aux_sensor: Option<AuxReading>,
    #[serde(default)]
    pub selected_actuator: Option<String>,
}

impl Snapshot {
    pub fn actuator(&self, id: &str) -> Option<&ActuatorSnapshot> {
        self.actuators.iter().find(|actuator| actuator.id == id)
    }

    pub fn is_offline(&self) -> bool {
        self.system.status == OFFLINE_STATUS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actuator(id: &str, label: DisplayLabel) -> ActuatorSnapshot {
        ActuatorSnapshot {
            id: id.to_string(),
            facets: Some(FacetPair {
                sensor_a: true,
                sensor_b: false,
            }),
            state: StableState::Retracted,
            label,
            pending: None,
            fault: None,
            cpm: Some(4.0),
            cycles: Some(10),
        }
    }

    #[test]
    fn shallow_comparison_tracks_rendered_fields() {
        let a = vec![actuator("1", DisplayLabel::Retracted)];
        let b = vec![actuator("1", DisplayLabel::Retracted)];
        assert!(same_actuators(&a, &b));

        let relabeled = vec![actuator("1", DisplayLabel::Opening)];
        assert!(!same_actuators(&a, &relabeled));

        let mut counted = b.clone();
        counted[0].cycles = Some(11);
        assert!(!same_actuators(&a, &counted));

        assert!(!same_actuators(&a, &[]));
    }

    #[test]
    fn snapshot_lookup_and_offline_flag() {
        let snapshot = Snapshot {
            system: SystemView {
                status: OFFLINE_STATUS.to_string(),
                ..SystemView::default()
            },
            actuators: vec![actuator("7", DisplayLabel::Retracted)],
            ..Snapshot::default()
        };
        assert!(snapshot.is_offline());
        assert!(snapshot.actuator("7").is_some());
        assert!(snapshot.actuator("8").is_none());
    }
}
