pub mod facet;
pub mod frame;
pub mod latch;
pub mod model;
pub mod snapshot;

pub use facet::{decode, decode_hint, decode_reading, Decoded, EndState, StableState};
pub use frame::{decode_stream_frame, FrameError, StreamMessage};
pub use latch::{DisplayLabel, LatchRecord, LatchTable, LatchTiming, Observation};
pub use model::{
    ActuatorReading, AggregatePoint, AuxReading, FacetPair, HealthResponse, HistoryQuery,
    LiveActuator, LiveStateResponse, LiveSystem, PendingCommand,
};
pub use snapshot::{ActuatorSnapshot, Snapshot, SystemView, OFFLINE_STATUS};
