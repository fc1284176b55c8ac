//! In-memory transport for orchestrator tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::time::Instant;

use super::{FetchRequest, Page, StreamMeta, StreamRequest, TextStream, Transport};
use crate::abort::AbortHandle;
use crate::error::FetchError;

type GetHandler = dyn Fn(&FetchRequest) -> Result<Page, FetchError> + Send + Sync;

#[derive(Clone, Debug)]
pub enum StreamStep {
    Chunk(Bytes),
    Delay(Duration),
    Fail(FetchError),
}

pub fn text(chunk: &str) -> StreamStep {
    StreamStep::Chunk(Bytes::copy_from_slice(chunk.as_bytes()))
}

pub fn delay(ms: u64) -> StreamStep {
    StreamStep::Delay(Duration::from_millis(ms))
}

#[derive(Default)]
struct Log {
    gets: Vec<(Instant, FetchRequest)>,
    streams: Vec<StreamRequest>,
    templates: Vec<String>,
    scripts: VecDeque<(StreamMeta, Vec<StreamStep>)>,
}

/// Records every call and answers from scripted responses
#[derive(Clone)]
pub struct ScriptedTransport {
    log: Arc<Mutex<Log>>,
    get_handler: Arc<GetHandler>,
    get_delay: Duration,
    template_delay: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            log: Arc::default(),
            get_handler: Arc::new(|request: &FetchRequest| {
                Ok(Page {
                    items: vec![serde_json::json!({
                        "code": request.get_param("keyword").unwrap_or("ROW"),
                        "name": request.name,
                    })],
                    total: Some(1),
                })
            }),
            get_delay: Duration::from_millis(20),
            template_delay: Duration::from_millis(20),
        }
    }

    #[must_use]
    pub fn on_get(
        mut self,
        handler: impl Fn(&FetchRequest) -> Result<Page, FetchError> + Send + Sync + 'static,
    ) -> Self {
        self.get_handler = Arc::new(handler);
        self
    }

    #[must_use]
    pub fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = delay;
        self
    }

    #[must_use]
    pub fn with_template_delay(mut self, delay: Duration) -> Self {
        self.template_delay = delay;
        self
    }

    /// Queue the response for the next `stream` call
    pub fn push_stream(&self, steps: Vec<StreamStep>) {
        self.push_stream_with_meta(StreamMeta::default(), steps);
    }

    pub fn push_stream_with_meta(&self, meta: StreamMeta, steps: Vec<StreamStep>) {
        self.lock().scripts.push_back((meta, steps));
    }

    pub fn gets(&self) -> Vec<FetchRequest> {
        self.lock().gets.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn get_times(&self) -> Vec<Instant> {
        self.lock().gets.iter().map(|(at, _)| *at).collect()
    }

    pub fn gets_named(&self, name: &str) -> usize {
        self.lock().gets.iter().filter(|(_, r)| r.name == name).count()
    }

    pub fn streams(&self) -> Vec<StreamRequest> {
        self.lock().streams.clone()
    }

    pub fn templates(&self) -> Vec<String> {
        self.lock().templates.clone()
    }

    pub fn total_calls(&self) -> usize {
        let log = self.lock();
        log.gets.len() + log.streams.len() + log.templates.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Log> {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Transport for ScriptedTransport {
    fn get(
        &self,
        request: FetchRequest,
        abort: AbortHandle,
    ) -> BoxFuture<'static, Result<Page, FetchError>> {
        self.lock().gets.push((Instant::now(), request.clone()));
        let handler = Arc::clone(&self.get_handler);
        let delay = self.get_delay;
        async move {
            abort
                .abortable(async {
                    tokio::time::sleep(delay).await;
                    handler(&request)
                })
                .await
        }
        .boxed()
    }

    fn stream(
        &self,
        request: StreamRequest,
        abort: AbortHandle,
    ) -> BoxFuture<'static, Result<TextStream, FetchError>> {
        let script = {
            let mut log = self.lock();
            log.streams.push(request);
            log.scripts.pop_front()
        };
        async move {
            let (meta, steps) = script.unwrap_or_default();
            let chunks = futures::stream::unfold(
                (VecDeque::from(steps), abort),
                |(mut steps, abort)| async move {
                    loop {
                        if abort.is_cancelled() {
                            return None;
                        }
                        match steps.pop_front()? {
                            StreamStep::Delay(delay) => {
                                tokio::select! {
                                    () = tokio::time::sleep(delay) => {}
                                    () = abort.cancelled() => return None,
                                }
                            }
                            StreamStep::Chunk(bytes) => return Some((Ok(bytes), (steps, abort))),
                            StreamStep::Fail(err) => {
                                steps.clear();
                                return Some((Err(err), (steps, abort)));
                            }
                        }
                    }
                },
            )
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
        self.lock().templates.push(url.clone());
        let delay = self.template_delay;
        async move {
            abort
                .abortable(async {
                    tokio::time::sleep(delay).await;
                    Ok::<_, FetchError>(format!("<section data-template=\"{url}\"></section>"))
                })
                .await
        }
        .boxed()
    }
}
