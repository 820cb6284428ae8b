//! One logical subscription to a named event channel, kept alive across
//! connection failures until its owner closes it.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use twin_core::{decode_stream_frame, StreamMessage};
use url::Url;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::transport::Connector;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("subscription target is empty")]
    EmptyTarget,
    #[error("no channels requested")]
    NoChannels,
    #[error("buffer size must be positive")]
    ZeroBuffer,
    #[error("invalid stream base url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamTarget {
    Channel(String),
    All,
}

impl StreamTarget {
    pub fn label(&self) -> &str {
        match self {
            StreamTarget::Channel(name) => name,
            StreamTarget::All => "all",
        }
    }
}

/// Builds the subscription URL from the configured base address.
///
/// `http`/`https` bases are mapped onto `ws`/`wss`.
pub fn stream_url(base: &str, target: &StreamTarget) -> Result<Url, SubscriptionError> {
    let invalid = |reason: String| SubscriptionError::InvalidUrl {
        url: base.to_string(),
        reason,
    };
    if let StreamTarget::Channel(name) = target {
        if name.trim().is_empty() {
            return Err(SubscriptionError::EmptyTarget);
        }
    }
    let mut url = Url::parse(base.trim()).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(invalid(format!("cannot switch scheme to {scheme}")));
    }
    match target {
        StreamTarget::Channel(name) => {
            url.query_pairs_mut().append_pair("channel", name.trim());
        }
        StreamTarget::All => {
            url.query_pairs_mut().append_pair("all", "1");
        }
    }
    Ok(url)
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connecting { attempt: u32 },
    Opened,
    Message(StreamMessage),
    Error(String),
    /// `retry_in` is `None` once the owner closed the subscription.
    Closed { retry_in: Option<Duration> },
}

/// Receives client events synchronously, in arrival order.
pub trait StreamHandler: Send + 'static {
    fn on_event(&mut self, event: StreamEvent);
}

impl StreamHandler for mpsc::UnboundedSender<StreamEvent> {
    fn on_event(&mut self, event: StreamEvent) {
        let _ = self.send(event);
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub backoff: BackoffPolicy,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStats {
    pub opens: u64,
    pub connect_failures: u64,
    pub messages: u64,
    pub malformed_frames: u64,
}

#[derive(Default)]
struct ClientShared {
    connected: AtomicBool,
    opens: AtomicU64,
    connect_failures: AtomicU64,
    messages: AtomicU64,
    malformed_frames: AtomicU64,
}

impl ClientShared {
    fn stats(&self) -> ClientStats {
        ClientStats {
            opens: self.opens.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
        }
    }
}

pub struct StreamingClient;

impl StreamingClient {
    /// Validates the target and starts connecting immediately.
    ///
    /// Must be called inside a tokio runtime. Misconfiguration fails here;
    /// every later failure is retried with backoff.
    pub fn open<H: StreamHandler>(
        config: &ClientConfig,
        target: StreamTarget,
        connector: Arc<dyn Connector>,
        handler: H,
    ) -> Result<StreamHandle, SubscriptionError> {
        let url = stream_url(&config.base_url, &target)?;
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(ClientShared::default());
        let task = tokio::spawn(run_client(
            url,
            target.label().to_string(),
            connector,
            handler,
            Backoff::new(config.backoff),
            shared.clone(),
            closed_rx,
        ));
        Ok(StreamHandle {
            target,
            closed_tx,
            shared,
            task: Some(task),
        })
    }
}

pub struct StreamHandle {
    target: StreamTarget,
    closed_tx: watch::Sender<bool>,
    shared: Arc<ClientShared>,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    /// Idempotent. Cancels a pending reconnect timer as well as a live connection.
    pub fn close(&self) {
        self.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ClientStats {
        self.shared.stats()
    }

    /// Closes and waits for the connection task to finish.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("stream_task_join_error: {err}");
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_client<H: StreamHandler>(
    url: Url,
    label: String,
    connector: Arc<dyn Connector>,
    mut handler: H,
    mut backoff: Backoff,
    shared: Arc<ClientShared>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        if *closed.borrow() {
            break;
        }
        handler.on_event(StreamEvent::Connecting {
            attempt: backoff.attempt(),
        });
        let connect = tokio::select! {
            result = connector.connect(&url) => result,
            _ = closed.changed() => break,
        };

        match connect {
            Ok(mut frames) => {
                backoff.reset();
                shared.connected.store(true, Ordering::Release);
                shared.opens.fetch_add(1, Ordering::Relaxed);
                info!("stream_open: channel={label}");
                handler.on_event(StreamEvent::Opened);

                let failure = loop {
                    tokio::select! {
                        next = frames.next() => match next {
                            Some(Ok(text)) => match decode_stream_frame(&text) {
                                Ok(message) => {
                                    shared.messages.fetch_add(1, Ordering::Relaxed);
                                    handler.on_event(StreamEvent::Message(message));
                                }
                                Err(err) => {
                                    shared.malformed_frames.fetch_add(1, Ordering::Relaxed);
                                    debug!("stream_frame_dropped: channel={label} {err}");
                                }
                            },
                            Some(Err(err)) => break Some(err.to_string()),
                            None => break None,
                        },
                        _ = closed.changed() => {
                            shared.connected.store(false, Ordering::Release);
                            handler.on_event(StreamEvent::Closed { retry_in: None });
                            return;
                        }
                    }
                };
                shared.connected.store(false, Ordering::Release);
                if let Some(err) = failure {
                    warn!("stream_read_error: channel={label} {err}");
                    handler.on_event(StreamEvent::Error(err));
                }
            }
            Err(err) => {
                shared.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!("stream_connect_error: channel={label} {err}");
                handler.on_event(StreamEvent::Error(err.to_string()));
            }
        }

        let delay = backoff.next_delay();
        debug!(
            "stream_reconnect_scheduled: channel={label} delay_ms={}",
            delay.as_millis()
        );
        handler.on_event(StreamEvent::Closed {
            retry_in: Some(delay),
        });
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = closed.changed() => break,
        }
    }
    shared.connected.store(false, Ordering::Release);
    handler.on_event(StreamEvent::Closed { retry_in: None });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, ScriptedConnector};

    fn fast_config() -> ClientConfig {
        ClientConfig::new("ws://twin.test/stream")
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
        rx.recv().await.expect("client event")
    }

    async fn next_retry(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Duration {
        loop {
            if let StreamEvent::Closed {
                retry_in: Some(delay),
            } = next_event(rx).await
            {
                return delay;
            }
        }
    }

    #[test]
    fn url_carries_channel_or_all_flag() {
        let url = stream_url("http://host:9000/stream", &StreamTarget::Channel("live".into()))
            .expect("url");
        assert_eq!(url.as_str(), "ws://host:9000/stream?channel=live");

        let all = stream_url("wss://host/stream", &StreamTarget::All).expect("url");
        assert_eq!(all.as_str(), "wss://host/stream?all=1");
    }

    #[test]
    fn misconfigured_targets_fail_fast() {
        assert_eq!(
            stream_url("ws://host/stream", &StreamTarget::Channel("  ".into())),
            Err(SubscriptionError::EmptyTarget)
        );
        assert!(matches!(
            stream_url("not a url", &StreamTarget::All),
            Err(SubscriptionError::InvalidUrl { .. })
        ));
        assert!(matches!(
            stream_url("ftp://host/stream", &StreamTarget::All),
            Err(SubscriptionError::InvalidUrl { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn open_rejects_empty_channel_without_spawning() {
        let connector = ScriptedConnector::new(Vec::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = StreamingClient::open(
            &fast_config(),
            StreamTarget::Channel(String::new()),
            connector.clone(),
            tx,
        );
        assert!(matches!(result, Err(SubscriptionError::EmptyTarget)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_across_failures_and_resets_after_open() {
        let (frame_tx, open) = Script::open();
        let connector = ScriptedConnector::new(vec![Script::Fail, Script::Fail, Script::Fail, open]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = StreamingClient::open(
            &fast_config(),
            StreamTarget::Channel("live".into()),
            connector.clone(),
            tx,
        )
        .expect("open");

        let first = next_retry(&mut rx).await;
        let _second = next_retry(&mut rx).await;
        let third = next_retry(&mut rx).await;
        assert!(third > first);

        loop {
            if next_event(&mut rx).await == StreamEvent::Opened {
                break;
            }
        }
        assert!(handle.is_connected());
        drop(frame_tx);

        let after_open = next_retry(&mut rx).await;
        let policy = BackoffPolicy::default();
        assert!(after_open >= policy.base);
        assert!(after_open <= policy.base + policy.jitter_max);
        assert!(!handle.is_connected());
        assert_eq!(handle.stats().opens, 1);
        assert_eq!(handle.stats().connect_failures, 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect() {
        let connector = ScriptedConnector::new(Vec::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = StreamingClient::open(
            &fast_config(),
            StreamTarget::All,
            connector.clone(),
            tx,
        )
        .expect("open");

        next_retry(&mut rx).await;
        handle.close();
        handle.close();
        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::Closed { retry_in: None }
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        assert!(handle.is_closed());
        handle.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_dropped_and_order_is_kept() {
        let (frame_tx, open) = Script::open();
        let connector = ScriptedConnector::new(vec![open]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = StreamingClient::open(
            &fast_config(),
            StreamTarget::Channel("monitoring".into()),
            connector,
            tx,
        )
        .expect("open");

        for frame in ["{broken", r#"{"event":"a"}"#, "17", r#"{"event":"b"}"#] {
            frame_tx.send(Ok(frame.to_string())).expect("push frame");
        }

        let mut names = Vec::new();
        while names.len() < 2 {
            if let StreamEvent::Message(message) = next_event(&mut rx).await {
                names.push(message.event);
            }
        }
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert!(handle.is_connected());
        let stats = handle.stats();
        assert_eq!(stats.malformed_frames, 2);
        assert_eq!(stats.messages, 2);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_reports_error_then_retries() {
        let (frame_tx, open) = Script::open();
        let connector = ScriptedConnector::new(vec![open]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = StreamingClient::open(
            &fast_config(),
            StreamTarget::Channel("slow".into()),
            connector.clone(),
            tx,
        )
        .expect("open");

        frame_tx
            .send(Err(crate::transport::TransportError::Read("reset".into())))
            .expect("push error");
        loop {
            if let StreamEvent::Error(err) = next_event(&mut rx).await {
                assert!(err.contains("reset"));
                break;
            }
        }
        next_retry(&mut rx).await;
        next_retry(&mut rx).await;
        assert!(connector.attempts() >= 2);
        handle.shutdown().await;
    }
}
