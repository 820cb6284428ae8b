//! Fans several channel subscriptions into one bounded diagnostic buffer.

use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info};
use twin_core::StreamMessage;

use crate::backoff::BackoffPolicy;
use crate::client::{
    stream_url, ClientConfig, StreamEvent, StreamHandle, StreamHandler, StreamTarget,
    StreamingClient, SubscriptionError,
};
use crate::status::ChannelStatus;
use crate::transport::Connector;

pub const DEFAULT_MAX_BUFFERED: usize = 200;
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct TapConfig {
    pub base_url: String,
    pub channels: Vec<String>,
    pub max_buffered: usize,
    pub backoff: BackoffPolicy,
}

impl TapConfig {
    pub fn new(base_url: impl Into<String>, channels: &[&str]) -> Self {
        Self {
            base_url: base_url.into(),
            channels: channels.iter().map(|name| name.to_string()).collect(),
            max_buffered: DEFAULT_MAX_BUFFERED,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A message tagged with its source channel and local arrival time.
#[derive(Debug, Clone, PartialEq)]
pub struct TappedMessage {
    pub channel: String,
    pub arrived_at_ms: i64,
    pub message: StreamMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TapStats {
    pub delivered: u64,
    pub evicted: u64,
    pub dropped_after_close: u64,
}

struct TapState {
    alive: bool,
    max_buffered: usize,
    buffer: VecDeque<TappedMessage>,
    status: BTreeMap<String, ChannelStatus>,
    stats: TapStats,
}

impl TapState {
    fn new(max_buffered: usize) -> Self {
        Self {
            alive: true,
            max_buffered,
            buffer: VecDeque::with_capacity(max_buffered),
            status: BTreeMap::new(),
            stats: TapStats::default(),
        }
    }

    fn push(&mut self, message: TappedMessage) {
        while self.buffer.len() >= self.max_buffered {
            self.buffer.pop_front();
            self.stats.evicted += 1;
        }
        self.buffer.push_back(message);
        self.stats.delivered += 1;
    }
}

fn lock(state: &Mutex<TapState>) -> MutexGuard<'_, TapState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct TapHandler {
    channel: String,
    state: Arc<Mutex<TapState>>,
    fanout: broadcast::Sender<TappedMessage>,
}

impl StreamHandler for TapHandler {
    fn on_event(&mut self, event: StreamEvent) {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = lock(&self.state);
        if !state.alive {
            if matches!(event, StreamEvent::Message(_)) {
                state.stats.dropped_after_close += 1;
            }
            return;
        }
        state
            .status
            .entry(self.channel.clone())
            .or_default()
            .apply(&event, now_ms);
        if let StreamEvent::Message(message) = event {
            let tapped = TappedMessage {
                channel: self.channel.clone(),
                arrived_at_ms: now_ms,
                message,
            };
            state.push(tapped.clone());
            drop(state);
            // no subscribers is fine
            let _ = self.fanout.send(tapped);
        }
    }
}

/// Owned multiplexer over one streaming client per channel.
///
/// Constructed once by the composition root and shared behind an `Arc`;
/// consumers read the buffer and statuses or subscribe to the live fan-out.
pub struct Tap {
    client_config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: Arc<Mutex<TapState>>,
    clients: tokio::sync::Mutex<Vec<StreamHandle>>,
    fanout: broadcast::Sender<TappedMessage>,
}

impl Tap {
    pub fn attach(config: TapConfig, connector: Arc<dyn Connector>) -> Result<Self, SubscriptionError> {
        if config.max_buffered == 0 {
            return Err(SubscriptionError::ZeroBuffer);
        }
        let channels = normalize_channels(&config.channels)?;
        let client_config = ClientConfig {
            base_url: config.base_url.clone(),
            backoff: config.backoff,
        };
        stream_url(&client_config.base_url, &StreamTarget::All)?;

        let (fanout, _) = broadcast::channel(BROADCAST_CAPACITY);
        let state = Arc::new(Mutex::new(TapState::new(config.max_buffered)));
        let handles = open_clients(&client_config, &connector, &state, &fanout, &channels)?;
        info!("tap_attached: channels={}", channels.join(","));
        Ok(Self {
            client_config,
            connector,
            state,
            clients: tokio::sync::Mutex::new(handles),
            fanout,
        })
    }

    #[cfg(test)]
    fn handler_for(&self, channel: &str) -> TapHandler {
        TapHandler {
            channel: channel.to_string(),
            state: self.state.clone(),
            fanout: self.fanout.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TappedMessage> {
        self.fanout.subscribe()
    }

    /// Oldest first.
    pub fn buffer(&self) -> Vec<TappedMessage> {
        lock(&self.state).buffer.iter().cloned().collect()
    }

    pub fn status_by_channel(&self) -> BTreeMap<String, ChannelStatus> {
        lock(&self.state).status.clone()
    }

    pub fn stats(&self) -> TapStats {
        lock(&self.state).stats
    }

    pub fn clear(&self) {
        lock(&self.state).buffer.clear();
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.state).alive
    }

    /// Replaces the channel set. Every previous client is closed and joined
    /// before the new ones open.
    pub async fn resubscribe(&self, channels: &[String]) -> Result<(), SubscriptionError> {
        let channels = normalize_channels(channels)?;
        let mut clients = self.clients.lock().await;
        for handle in clients.drain(..) {
            handle.shutdown().await;
        }
        {
            let mut state = lock(&self.state);
            if !state.alive {
                return Ok(());
            }
            state.status.clear();
        }
        *clients = open_clients(
            &self.client_config,
            &self.connector,
            &self.state,
            &self.fanout,
            &channels,
        )?;
        info!("tap_resubscribed: channels={}", channels.join(","));
        Ok(())
    }

    /// Stops buffer writes immediately, then closes and joins every client once.
    pub async fn close(&self) {
        let now_ms = Utc::now().timestamp_millis();
        {
            let mut state = lock(&self.state);
            if !state.alive {
                return;
            }
            state.alive = false;
            for status in state.status.values_mut() {
                status.mark_closing();
            }
        }
        let handles: Vec<StreamHandle> = self.clients.lock().await.drain(..).collect();
        for handle in handles {
            handle.shutdown().await;
        }
        let mut state = lock(&self.state);
        for status in state.status.values_mut() {
            status.mark_closed(now_ms);
        }
        debug!("tap_closed: dropped_after_close={}", state.stats.dropped_after_close);
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        lock(&self.state).alive = false;
        if let Ok(mut clients) = self.clients.try_lock() {
            for handle in clients.iter() {
                handle.close();
            }
            clients.clear();
        }
    }
}

fn open_clients(
    config: &ClientConfig,
    connector: &Arc<dyn Connector>,
    state: &Arc<Mutex<TapState>>,
    fanout: &broadcast::Sender<TappedMessage>,
    channels: &[String],
) -> Result<Vec<StreamHandle>, SubscriptionError> {
    let mut handles = Vec::with_capacity(channels.len());
    for channel in channels {
        lock(state)
            .status
            .insert(channel.clone(), ChannelStatus::default());
        let handler = TapHandler {
            channel: channel.clone(),
            state: state.clone(),
            fanout: fanout.clone(),
        };
        handles.push(StreamingClient::open(
            config,
            StreamTarget::Channel(channel.clone()),
            connector.clone(),
            handler,
        )?);
    }
    Ok(handles)
}

fn normalize_channels(channels: &[String]) -> Result<Vec<String>, SubscriptionError> {
    if channels.is_empty() {
        return Err(SubscriptionError::NoChannels);
    }
    let mut out: Vec<String> = Vec::with_capacity(channels.len());
    for channel in channels {
        let name = channel.trim();
        if name.is_empty() {
            return Err(SubscriptionError::EmptyTarget);
        }
        if !out.iter().any(|existing| existing == name) {
            out.push(name.to_string());
        }
    }
    Ok(out)
}
