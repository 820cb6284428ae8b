use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("read failed: {0}")]
    Read(String),
}

/// Inbound text frames of one open connection. The stream ending means the
/// peer closed the connection.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Seam between the reconnect loop and the wire, so the loop can run
/// against scripted connections.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<FrameStream, TransportError>>;
}

/// Receive-only websocket transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let url = url.clone();
        async move {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            let frames = ws.filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => {
                        Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::Read(err.to_string()))),
                }
            });
            Ok(frames.boxed())
        }
        .boxed()
    }
}
