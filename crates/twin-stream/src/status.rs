use serde::{Deserialize, Serialize};
use std::fmt;

use crate::client::StreamEvent;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_open_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_close_at_ms: Option<i64>,
}

impl ChannelStatus {
    /// Folds one client lifecycle event into the status.
    pub fn apply(&mut self, event: &StreamEvent, now_ms: i64) {
        match event {
            StreamEvent::Connecting { .. } => {
                if self.state != ConnectionState::Closing {
                    self.state = ConnectionState::Connecting;
                }
            }
            StreamEvent::Opened => {
                self.state = ConnectionState::Open;
                self.last_open_at_ms = Some(now_ms);
            }
            StreamEvent::Message(_) => {}
            StreamEvent::Error(err) => {
                self.state = ConnectionState::Error;
                self.last_error = Some(err.clone());
            }
            StreamEvent::Closed { retry_in } => {
                let was_open = self.state == ConnectionState::Open;
                // keep an error visible until the next attempt starts
                if retry_in.is_none() || self.state != ConnectionState::Error {
                    self.state = ConnectionState::Closed;
                }
                if was_open || retry_in.is_none() {
                    self.last_close_at_ms = Some(now_ms);
                }
            }
        }
    }

    pub fn mark_closing(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closing;
        }
    }

    pub fn mark_closed(&mut self, now_ms: i64) {
        self.state = ConnectionState::Closed;
        self.last_close_at_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lifecycle_walks_connecting_open_closed() {
        let mut status = ChannelStatus::default();
        assert_eq!(status.state, ConnectionState::Idle);

        status.apply(&StreamEvent::Connecting { attempt: 0 }, 1);
        assert_eq!(status.state, ConnectionState::Connecting);

        status.apply(&StreamEvent::Opened, 2);
        assert_eq!(status.state, ConnectionState::Open);
        assert_eq!(status.last_open_at_ms, Some(2));

        status.apply(
            &StreamEvent::Closed {
                retry_in: Some(Duration::from_millis(500)),
            },
            3,
        );
        assert_eq!(status.state, ConnectionState::Closed);
        assert_eq!(status.last_close_at_ms, Some(3));
    }

    #[test]
    fn error_stays_visible_while_retry_is_scheduled() {
        let mut status = ChannelStatus::default();
        status.apply(&StreamEvent::Connecting { attempt: 0 }, 1);
        status.apply(&StreamEvent::Error("refused".to_string()), 2);
        status.apply(
            &StreamEvent::Closed {
                retry_in: Some(Duration::from_millis(500)),
            },
            3,
        );
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.last_error.as_deref(), Some("refused"));
        assert_eq!(status.last_close_at_ms, None);

        status.apply(&StreamEvent::Closed { retry_in: None }, 4);
        assert_eq!(status.state, ConnectionState::Closed);
        assert_eq!(status.last_close_at_ms, Some(4));
    }

    #[test]
    fn closing_is_not_overwritten_by_late_connect() {
        let mut status = ChannelStatus::default();
        status.mark_closing();
        status.apply(&StreamEvent::Connecting { attempt: 2 }, 1);
        assert_eq!(status.state, ConnectionState::Closing);
        status.mark_closed(5);
        assert_eq!(status.state, ConnectionState::Closed);
    }
}
