//! Cycles-per-minute derived from the extended end-stop history.

use twin_core::{AggregatePoint, HistoryQuery};

use crate::source::{LiveSource, SourceError};

/// The extended end-stop facet; one rising edge is one completed stroke.
pub const CPM_FACET: &str = "S2";
pub const CPM_WINDOW_MS: i64 = 60_000;

/// Counts low-to-high transitions. A series that starts high does not count
/// its first sample as an edge.
pub fn count_rising_edges(points: &[AggregatePoint]) -> usize {
    let mut ordered: Vec<&AggregatePoint> = points.iter().collect();
    ordered.sort_by_key(|point| point.ts);
    ordered
        .windows(2)
        .filter(|pair| pair[0].value <= 0.5 && pair[1].value > 0.5)
        .count()
}

pub async fn cycles_per_minute(
    source: &dyn LiveSource,
    actuator_id: &str,
    now_ms: i64,
) -> Result<f64, SourceError> {
    let query = HistoryQuery {
        actuator_id: actuator_id.to_string(),
        facet: CPM_FACET.to_string(),
        since_ms: now_ms - CPM_WINDOW_MS,
        ascending: true,
    };
    let points = source.history(&query).await?;
    let edges = count_rising_edges(&points) as f64;
    Ok(edges * 60_000.0 / CPM_WINDOW_MS as f64)
}
