pub mod backoff;
pub mod client;
pub mod status;
pub mod tap;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{Backoff, BackoffPolicy};
pub use client::{
    stream_url, ClientConfig, ClientStats, StreamEvent, StreamHandle, StreamHandler,
    StreamTarget, StreamingClient, SubscriptionError,
};
pub use status::{ChannelStatus, ConnectionState};
pub use tap::{Tap, TapConfig, TapStats, TappedMessage, DEFAULT_MAX_BUFFERED};
pub use transport::{Connector, FrameStream, TransportError, WsConnector};
