pub mod http;
pub mod rate_limiter;
pub mod search;
#[cfg(test)]
pub(crate) mod testing;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::abort::AbortHandle;
use crate::error::FetchError;

pub use http::HttpTransport;
pub use rate_limiter::RateLimiter;
pub use search::SearchItem;

/// `GET <endpoint>?<query>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    /// Name used in logs and by the rate limiter
    pub name: String,
    pub endpoint: String,
    pub query: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            query: vec![],
        }
    }

    #[must_use]
    pub fn param(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// `POST <endpoint>` with a JSON body, answered by a raw text stream
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRequest {
    pub endpoint: String,
    pub body: serde_json::Value,
}

/// Body of every plain fetch
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
    #[serde(default)]
    pub total: Option<u64>,
}

impl Page {
    /// Decode items into `T`, failing on the first malformed one
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<Vec<T>, FetchError> {
        self.items
            .iter()
            .map(|item| serde_json::from_value(item.clone()).map_err(FetchError::from))
            .collect()
    }
}

/// Data returned next to a stream rather than inside it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamMeta {
    pub model: Option<String>,
    pub generated_at: Option<OffsetDateTime>,
}

/// An open streamed response
pub struct TextStream {
    pub meta: StreamMeta,
    pub chunks: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl std::fmt::Debug for TextStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextStream")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Network boundary of the orchestrator
///
/// Implementations must stop work promptly once `abort` fires; the returned
/// futures are `'static` so they can be shared between callers.
pub trait Transport: Send + Sync + 'static {
    fn get(
        &self,
        request: FetchRequest,
        abort: AbortHandle,
    ) -> BoxFuture<'static, Result<Page, FetchError>>;

    fn stream(
        &self,
        request: StreamRequest,
        abort: AbortHandle,
    ) -> BoxFuture<'static, Result<TextStream, FetchError>>;

    fn template(
        &self,
        url: String,
        abort: AbortHandle,
    ) -> BoxFuture<'static, Result<String, FetchError>>;
}
