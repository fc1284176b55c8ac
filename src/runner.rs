use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::abort::AbortHandle;
use crate::api::{StreamMeta, StreamRequest, TextStream, Transport};
use crate::cache::{CacheMeta, EntityCache};
use crate::decode::Utf8Decoder;
use crate::error::{ErrorInfo, FetchError};
use crate::events::{Event, Notifier};
use crate::key::{EntityKey, ResourceKey};
use crate::model::{AnalysisDoc, Payload, SessionState};
use crate::token::{OperationClass, RequestToken, TokenGuard};

pub const ANALYSIS_FACET: &str = "analysis";
pub const HISTORY_FACET: &str = "history";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Cancelled,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

/// Observable state of one streaming run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSnapshot {
    pub id: u64,
    pub key: ResourceKey,
    pub state: RunState,
    pub text: String,
    pub error: Option<ErrorInfo>,
}

/// Inputs of an analysis run besides the entity
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalysisParams {
    /// Lookback window in days
    pub window: Option<u32>,
    pub extras: BTreeMap<String, String>,
}

impl AnalysisParams {
    pub fn window(days: u32) -> Self {
        Self {
            window: Some(days),
            extras: BTreeMap::new(),
        }
    }

    /// Cache key the finished text is stored under
    ///
    /// Every parameter that changes the output is part of the key.
    pub fn key_for(&self, entity: &EntityKey) -> ResourceKey {
        let mut key = entity.facet(ANALYSIS_FACET);
        if let Some(days) = self.window {
            key = key.with_param("window", days);
        }
        for (name, value) in &self.extras {
            key = key.with_param(name, value);
        }
        key
    }
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub endpoint: String,
    /// Give up on a run that has not finished after this long
    pub soft_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            endpoint: "/api/analysis/generate".to_string(),
            soft_timeout: None,
        }
    }
}

struct ActiveRun {
    token: RequestToken,
    params: AnalysisParams,
    abort: AbortHandle,
    snapshot: RunSnapshot,
}

#[derive(Default)]
struct RunnerState {
    active: Option<ActiveRun>,
    /// Last run that reached a terminal state
    last: Option<RunSnapshot>,
    /// Inputs of the last failed run
    retry: Option<(ResourceKey, AnalysisParams)>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    cache: Arc<EntityCache<Payload>>,
    guard: Arc<TokenGuard>,
    notifier: Notifier,
    session: watch::Receiver<SessionState>,
    config: RunnerConfig,
    state: Mutex<RunnerState>,
}

/// Drives at most one streamed analysis at a time
///
/// Starting a run cancels whatever run is active, for any key. Text is only
/// written to the cache when the run completes and its token is still
/// current; partial text of a cancelled or superseded run is dropped.
#[derive(Clone)]
pub struct StreamingRunner {
    inner: Arc<Inner>,
}

impl StreamingRunner {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<EntityCache<Payload>>,
        guard: Arc<TokenGuard>,
        notifier: Notifier,
        session: watch::Receiver<SessionState>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                cache,
                guard,
                notifier,
                session,
                config,
                state: Mutex::default(),
            }),
        }
    }

    /// Start streaming `key`, cancelling the active run; returns the run id
    ///
    /// Starting the key that is already running restarts it.
    pub fn start(&self, key: ResourceKey, params: AnalysisParams) -> u64 {
        let inner = &self.inner;
        let mut state = inner.lock();
        if let Some(previous) = state.active.take() {
            tracing::debug!(key = %previous.snapshot.key, "新的分析开始，取消上一次分析");
            let snapshot = inner.cancel_run(&mut state, previous);
            inner.publish(snapshot);
        }
        state.retry = None;

        let token = inner.guard.begin(OperationClass::analysis());
        let abort = AbortHandle::new();
        let snapshot = RunSnapshot {
            id: token.seq(),
            key: key.clone(),
            state: RunState::Running,
            text: String::new(),
            error: None,
        };
        state.active = Some(ActiveRun {
            token: token.clone(),
            params: params.clone(),
            abort: abort.clone(),
            snapshot: snapshot.clone(),
        });
        drop(state);

        tracing::info!(key = %key, run = token.seq(), "开始生成分析");
        inner.notifier.emit(Event::Run(snapshot));
        tokio::spawn(Arc::clone(inner).drive(token.clone(), key, params, abort));
        token.seq()
    }

    /// Cancel the active run if it is streaming `key`
    pub fn cancel(&self, key: &ResourceKey) -> bool {
        let mut state = self.inner.lock();
        match state.active.take() {
            Some(run) if run.snapshot.key == *key => {
                let snapshot = self.inner.cancel_run(&mut state, run);
                drop(state);
                self.inner.publish(snapshot);
                true
            }
            other => {
                state.active = other;
                false
            }
        }
    }

    pub fn cancel_active(&self) -> bool {
        let mut state = self.inner.lock();
        let Some(run) = state.active.take() else {
            return false;
        };
        let snapshot = self.inner.cancel_run(&mut state, run);
        drop(state);
        self.inner.publish(snapshot);
        true
    }

    /// Restart the last failed run with the same inputs
    pub fn retry(&self) -> Option<u64> {
        let (key, params) = self.inner.lock().retry.take()?;
        tracing::info!(key = %key, "重试分析");
        Some(self.start(key, params))
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    /// The active run, or the last one that finished
    pub fn snapshot(&self) -> Option<RunSnapshot> {
        let state = self.inner.lock();
        state
            .active
            .as_ref()
            .map(|run| run.snapshot.clone())
            .or_else(|| state.last.clone())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn cancel_run(&self, state: &mut RunnerState, run: ActiveRun) -> RunSnapshot {
        run.abort.cancel();
        self.guard.cancel(run.token.class());
        let mut snapshot = run.snapshot;
        snapshot.state = RunState::Cancelled;
        snapshot.text.clear();
        state.last = Some(snapshot.clone());
        snapshot
    }

    /// Emit a run update if its entity is on screen
    fn publish(&self, snapshot: RunSnapshot) {
        if self.session.borrow().is_active(snapshot.key.entity()) {
            self.notifier.emit(Event::Run(snapshot));
        }
    }

    async fn drive(
        self: Arc<Self>,
        token: RequestToken,
        key: ResourceKey,
        params: AnalysisParams,
        abort: AbortHandle,
    ) {
        let request = StreamRequest {
            endpoint: self.config.endpoint.clone(),
            body: serde_json::json!({
                "key": key.entity().id(),
                "kind": key.entity().kind().as_ref(),
                "window": params.window,
                "params": params.extras,
                "runLlm": true,
            }),
        };
        let work = self.consume(&token, request, &abort);
        let outcome = match self.config.soft_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    abort.cancel();
                    Err(FetchError::Timeout(limit))
                }
            },
            None => work.await,
        };
        self.finish(&token, outcome);
    }

    async fn consume(
        &self,
        token: &RequestToken,
        request: StreamRequest,
        abort: &AbortHandle,
    ) -> Result<(String, StreamMeta), FetchError> {
        let TextStream { meta, mut chunks } = abort
            .abortable(self.transport.stream(request, abort.clone()))
            .await?;
        let mut decoder = Utf8Decoder::new();
        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                () = abort.cancelled() => return Err(FetchError::Aborted),
                next = chunks.next() => next,
            };
            let Some(chunk) = next else { break };
            let piece = decoder.push(&chunk?)?;
            if piece.is_empty() {
                continue;
            }
            text.push_str(&piece);
            if !self.progress(token, &piece) {
                return Err(FetchError::Aborted);
            }
        }
        if abort.is_cancelled() {
            return Err(FetchError::Aborted);
        }
        decoder.finish()?;
        Ok((text, meta))
    }

    /// Append to the active run; false once the run is no longer active
    fn progress(&self, token: &RequestToken, piece: &str) -> bool {
        let mut state = self.lock();
        let Some(run) = state.active.as_mut().filter(|run| run.token == *token) else {
            return false;
        };
        run.snapshot.text.push_str(piece);
        let snapshot = run.snapshot.clone();
        drop(state);
        self.publish(snapshot);
        true
    }

    fn finish(&self, token: &RequestToken, outcome: Result<(String, StreamMeta), FetchError>) {
        let mut state = self.lock();
        let run = match state.active.take() {
            Some(run) if run.token == *token => run,
            other => {
                state.active = other;
                tracing::debug!(run = token.seq(), "分析已被取消或取代，丢弃结果");
                return;
            }
        };
        let key = run.snapshot.key.clone();
        let mut snapshot = run.snapshot;
        match outcome {
            Ok((text, meta)) if self.guard.is_current(token) => {
                let cache_meta = CacheMeta {
                    generated_at: meta.generated_at.or_else(|| Some(OffsetDateTime::now_utc())),
                    model: meta.model,
                    window: key.param("window").map(ToString::to_string),
                };
                let doc = AnalysisDoc {
                    run_id: token.seq(),
                    text: text.clone(),
                };
                self.cache.set(key.clone(), Payload::Analysis(doc), cache_meta);
                self.cache.invalidate(&key.entity().facet(HISTORY_FACET));
                if self.session.borrow().is_active(key.entity()) {
                    // a history pull already in flight still carries the old list
                    self.guard.cancel(&OperationClass::history());
                }
                snapshot.text = text;
                snapshot.state = RunState::Completed;
                tracing::info!(key = %key, run = token.seq(), chars = snapshot.text.chars().count(), "分析生成完成");
            }
            Ok(_) | Err(FetchError::Aborted) => {
                snapshot.state = RunState::Cancelled;
                snapshot.text.clear();
            }
            Err(err) => {
                tracing::warn!(key = %key, run = token.seq(), error = %err, "分析生成失败");
                snapshot.state = RunState::Failed;
                snapshot.error = Some(ErrorInfo::stream(&err));
                state.retry = Some((key, run.params));
            }
        }
        state.last = Some(snapshot.clone());
        drop(state);
        self.publish(snapshot);
    }
}
