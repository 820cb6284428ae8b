use futures_util::future::BoxFuture;
use futures_util::{stream, FutureExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

use crate::transport::{Connector, FrameStream, TransportError};

pub(crate) type FrameSender = mpsc::UnboundedSender<Result<String, TransportError>>;

pub(crate) enum Script {
    Fail,
    Open(mpsc::UnboundedReceiver<Result<String, TransportError>>),
}

impl Script {
    /// A connection that stays open until the returned sender is dropped.
    pub(crate) fn open() -> (FrameSender, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Script::Open(rx))
    }
}

/// Plays back connection outcomes per channel; an exhausted script fails.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    attempts: AtomicUsize,
    attempts_by_channel: Mutex<HashMap<String, usize>>,
}

impl ScriptedConnector {
    pub(crate) fn new(scripts: Vec<Script>) -> Arc<Self> {
        Self::routed(vec![("*", scripts)])
    }

    pub(crate) fn routed(routes: Vec<(&str, Vec<Script>)>) -> Arc<Self> {
        let scripts = routes
            .into_iter()
            .map(|(channel, scripts)| (channel.to_string(), scripts.into_iter().collect()))
            .collect();
        Arc::new(Self {
            scripts: Mutex::new(scripts),
            ..Self::default()
        })
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn attempts_for(&self, channel: &str) -> usize {
        self.attempts_by_channel
            .lock()
            .expect("attempts lock")
            .get(channel)
            .copied()
            .unwrap_or(0)
    }
}

fn channel_of(url: &Url) -> String {
    url.query_pairs()
        .find(|(key, _)| key == "channel")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| "all".to_string())
}

impl Connector for ScriptedConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let channel = channel_of(url);
        *self
            .attempts_by_channel
            .lock()
            .expect("attempts lock")
            .entry(channel.clone())
            .or_default() += 1;
        let next = {
            let mut scripts = self.scripts.lock().expect("script lock");
            let key = if scripts.contains_key(&channel) {
                channel
            } else {
                "*".to_string()
            };
            scripts.get_mut(&key).and_then(VecDeque::pop_front)
        };
        async move {
            match next {
                Some(Script::Open(rx)) => {
                    let frames = stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|item| (item, rx))
                    });
                    Ok(frames.boxed())
                }
                Some(Script::Fail) | None => {
                    Err(TransportError::Connect("scripted refusal".to_string()))
                }
            }
        }
        .boxed()
    }
}
