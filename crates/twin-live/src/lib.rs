pub mod composer;
pub mod cpm;
pub mod metric_cache;
pub mod source;

pub use composer::{
    Clock, ComposerConfig, ComposerHandle, ComposerStats, LiveComposer, LoopStats, SystemClock,
    HEALTH_UNREACHABLE,
};
pub use cpm::{count_rising_edges, cycles_per_minute, CPM_FACET, CPM_WINDOW_MS};
pub use metric_cache::RateLimitedCache;
pub use source::{Endpoints, HttpSource, LiveSource, SourceError};
