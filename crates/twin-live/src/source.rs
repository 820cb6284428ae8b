//! Read-only access to the telemetry backend.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use twin_core::{AggregatePoint, AuxReading, HealthResponse, HistoryQuery, LiveStateResponse};
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("invalid backend base url '{url}': {reason}")]
    BaseUrl { url: String, reason: String },
    #[error("http client setup failed: {0}")]
    Client(String),
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("invalid payload from {url}: {reason}")]
    Payload { url: String, reason: String },
}

/// The backend calls the composer depends on. Every call is a suspension point.
pub trait LiveSource: Send + Sync + 'static {
    fn health(&self) -> BoxFuture<'_, Result<HealthResponse, SourceError>>;

    fn live_state(&self) -> BoxFuture<'_, Result<LiveStateResponse, SourceError>>;

    fn history<'a>(
        &'a self,
        query: &'a HistoryQuery,
    ) -> BoxFuture<'a, Result<Vec<AggregatePoint>, SourceError>>;

    fn aux_sensor_ids(&self) -> BoxFuture<'_, Result<Vec<String>, SourceError>>;

    fn aux_latest<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<AuxReading, SourceError>>;
}

/// Endpoint paths relative to the backend base url. `{id}` is substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub health: String,
    pub live: String,
    pub history: String,
    pub aux_ids: String,
    pub aux_latest: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            health: "/health".to_string(),
            live: "/api/live".to_string(),
            history: "/api/history".to_string(),
            aux_ids: "/api/aux/ids".to_string(),
            aux_latest: "/api/aux/{id}/latest".to_string(),
        }
    }
}

pub struct HttpSource {
    base: String,
    endpoints: Endpoints,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(base_url: &str, endpoints: Endpoints) -> Result<Self, SourceError> {
        Self::with_timeout(base_url, endpoints, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        endpoints: Endpoints,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let trimmed = base_url.trim();
        let parsed = Url::parse(trimmed).map_err(|err| SourceError::BaseUrl {
            url: trimmed.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SourceError::BaseUrl {
                url: trimmed.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SourceError::Client(err.to_string()))?;
        Ok(Self {
            base: trimmed.trim_end_matches('/').to_string(),
            endpoints,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|err| SourceError::Request {
                url: url.clone(),
                reason: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                url,
                status: status.as_u16(),
            });
        }
        response.json::<T>().await.map_err(|err| SourceError::Payload {
            url,
            reason: err.to_string(),
        })
    }
}

impl LiveSource for HttpSource {
    fn health(&self) -> BoxFuture<'_, Result<HealthResponse, SourceError>> {
        async move { self.get_json(&self.endpoints.health, &[]).await }.boxed()
    }

    fn live_state(&self) -> BoxFuture<'_, Result<LiveStateResponse, SourceError>> {
        async move { self.get_json(&self.endpoints.live, &[]).await }.boxed()
    }

    fn history<'a>(
        &'a self,
        query: &'a HistoryQuery,
    ) -> BoxFuture<'a, Result<Vec<AggregatePoint>, SourceError>> {
        async move {
            let params = [
                ("actuator", query.actuator_id.clone()),
                ("facet", query.facet.clone()),
                ("since", query.since_ms.to_string()),
                (
                    "order",
                    if query.ascending { "asc" } else { "desc" }.to_string(),
                ),
            ];
            self.get_json(&self.endpoints.history, &params).await
        }
        .boxed()
    }

    fn aux_sensor_ids(&self) -> BoxFuture<'_, Result<Vec<String>, SourceError>> {
        async move {
            let raw: Value = self.get_json(&self.endpoints.aux_ids, &[]).await?;
            let ids = ids_from_value(&raw);
            debug!("aux_ids_listed: count={}", ids.len());
            Ok(ids)
        }
        .boxed()
    }

    fn aux_latest<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<AuxReading, SourceError>> {
        async move {
            let encoded: String = url::form_urlencoded::byte_serialize(id.as_bytes()).collect();
            let path = self.endpoints.aux_latest.replace("{id}", &encoded);
            self.get_json(&path, &[]).await
        }
        .boxed()
    }
}

/// Accepts a bare array or an `{"ids": [...]}` wrapper; ids may be strings or numbers.
fn ids_from_value(raw: &Value) -> Vec<String> {
    let items = match raw {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("ids") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_accept_mixed_shapes() {
        assert_eq!(ids_from_value(&json!(["a", 7, "", null])), vec!["a", "7"]);
        assert_eq!(ids_from_value(&json!({"ids": [3]})), vec!["3"]);
        assert!(ids_from_value(&json!({"other": 1})).is_empty());
    }

    #[test]
    fn base_url_is_validated() {
        assert!(matches!(
            HttpSource::new("ws://twin.test", Endpoints::default()),
            Err(SourceError::BaseUrl { .. })
        ));
        assert!(matches!(
            HttpSource::new("nope", Endpoints::default()),
            Err(SourceError::BaseUrl { .. })
        ));
        let source = HttpSource::new("http://twin.test/", Endpoints::default()).expect("source");
        assert_eq!(source.base_url(), "http://twin.test");
    }
}
