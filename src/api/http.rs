use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::{FetchRequest, Page, RateLimiter, StreamMeta, StreamRequest, TextStream, Transport};
use crate::abort::AbortHandle;
use crate::error::FetchError;

const MAX_ERROR_BODY: usize = 512;

/// `reqwest`-backed transport talking to the dashboard API
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl HttpTransport {
    pub fn new(base_url: &str, limiter: RateLimiter) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: Arc::new(limiter),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

impl Transport for HttpTransport {
    fn get(
        &self,
        request: FetchRequest,
        abort: AbortHandle,
    ) -> BoxFuture<'static, Result<Page, FetchError>> {
        let client = self.client.clone();
        let url = self.url(&request.endpoint);
        let limiter = Arc::clone(&self.limiter);

        async move {
            let call = limiter.execute(&request.name, || {
                let client = client.clone();
                let url = url.clone();
                let query = request.query.clone();
                async move {
                    let resp = client.get(&url).query(&query).send().await?;
                    let resp = ensure_success(resp).await?;
                    Ok::<_, FetchError>(resp.json::<Page>().await?)
                }
                .boxed()
            });
            abort.abortable(call).await
        }
        .boxed()
    }

    fn stream(
        &self,
        request: StreamRequest,
        abort: AbortHandle,
    ) -> BoxFuture<'static, Result<TextStream, FetchError>> {
        let client = self.client.clone();
        let url = self.url(&request.endpoint);

        async move {
            let resp = abort
                .abortable(async {
                    Ok::<_, FetchError>(client.post(&url).json(&request.body).send().await?)
                })
                .await?;
            let resp = ensure_success(resp).await?;
            let meta = stream_meta(resp.headers());
            tracing::debug!(url = %url, model = ?meta.model, "流式响应已建立");

            let signal = abort.clone();
            let chunks = resp
                .bytes_stream()
                .map_err(FetchError::from)
                .take_until(async move { signal.cancelled().await })
                .boxed();
            Ok(TextStream { meta, chunks })
        }
        .boxed()
    }

    fn template(
        &self,
        url: String,
        abort: AbortHandle,
    ) -> BoxFuture<'static, Result<String, FetchError>> {
        let client = self.client.clone();
        let url = self.url(&url);

        async move {
            abort
                .abortable(async {
                    let resp = ensure_success(client.get(&url).send().await?).await?;
                    Ok::<_, FetchError>(resp.text().await?)
                })
                .await
        }
        .boxed()
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    Err(FetchError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Out-of-band metadata of an analysis stream
fn stream_meta(headers: &HeaderMap) -> StreamMeta {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    StreamMeta {
        model: header("x-model").map(ToString::to_string),
        generated_at: header("x-generated-at")
            .and_then(|v| OffsetDateTime::parse(v, &Rfc3339).ok()),
    }
}
