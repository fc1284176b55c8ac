use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::abort::AbortHandle;
use crate::api::search::search_request;
use crate::api::{SearchItem, Transport};
use crate::error::FetchError;
use crate::events::{Event, Notifier};
use crate::token::{OperationClass, RequestToken, TokenGuard};

const RECENT_LIMIT: usize = 20;

#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub endpoint: String,
    /// Quiet period measured from the last keystroke
    pub quiet: Duration,
    pub limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: "/api/search".to_string(),
            quiet: Duration::from_millis(250),
            limit: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchStatus {
    Idle,
    Searching,
    Ready,
    Empty,
    /// Previous results stay visible next to the message
    Failed(String),
}

impl SearchStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Clone, Debug)]
pub struct SearchSnapshot {
    pub keyword: String,
    pub status: SearchStatus,
    pub results: Arc<Vec<SearchItem>>,
    pub highlight: Option<usize>,
}

type SearchResult = Result<Arc<Vec<SearchItem>>, FetchError>;
type SharedSearch = Shared<BoxFuture<'static, SearchResult>>;

struct InFlight {
    keyword: String,
    token: RequestToken,
    abort: AbortHandle,
    result: SharedSearch,
}

struct SearchState {
    keyword: String,
    status: SearchStatus,
    results: Arc<Vec<SearchItem>>,
    /// Keyword the current `results` answer
    results_keyword: Option<String>,
    highlight: Option<usize>,
    in_flight: Option<InFlight>,
    recent: Vec<SearchItem>,
}

impl SearchState {
    fn snapshot(&self) -> SearchSnapshot {
        SearchSnapshot {
            keyword: self.keyword.clone(),
            status: self.status.clone(),
            results: Arc::clone(&self.results),
            highlight: self.highlight,
        }
    }

    /// Status the committed results stand for
    fn settled_status(&self) -> SearchStatus {
        if self.results.is_empty() {
            SearchStatus::Empty
        } else {
            SearchStatus::Ready
        }
    }

    fn pick(&self) -> Option<SearchItem> {
        self.highlight
            .and_then(|idx| self.results.get(idx))
            .or_else(|| self.results.first())
            .cloned()
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    guard: Arc<TokenGuard>,
    notifier: Notifier,
    config: SearchConfig,
    state: Mutex<SearchState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SearchState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn publish(&self, state: &SearchState) {
        self.notifier.emit(Event::Search(state.snapshot()));
    }

    /// Issue a fetch for `keyword`, superseding whatever is in flight
    fn dispatch(self: &Arc<Self>, keyword: String) -> (RequestToken, SharedSearch) {
        let mut state = self.lock();
        if let Some(previous) = state.in_flight.take() {
            tracing::debug!(keyword = %previous.keyword, "取消上一次搜索请求");
            previous.abort.cancel();
        }

        let token = self.guard.begin(OperationClass::search());
        let abort = AbortHandle::new();
        let request = search_request(&self.config.endpoint, &keyword, self.config.limit);
        let fetch = self.transport.get(request, abort.clone());
        let result = async move {
            let page = fetch.await?;
            Ok::<_, FetchError>(Arc::new(page.decode::<SearchItem>()?))
        }
        .boxed()
        .shared();

        state.in_flight = Some(InFlight {
            keyword: keyword.clone(),
            token: token.clone(),
            abort,
            result: result.clone(),
        });
        state.keyword.clone_from(&keyword);
        state.status = SearchStatus::Searching;
        drop(state);
        tracing::debug!(keyword = %keyword, seq = token.seq(), "发起搜索请求");

        tokio::spawn({
            let inner = Arc::clone(self);
            let token = token.clone();
            let result = result.clone();
            async move {
                let outcome = result.await;
                inner.commit(&token, &keyword, outcome);
            }
        });

        (token, result)
    }

    /// Apply a finished fetch; returns false when the token was superseded
    ///
    /// Safe to call more than once per token, only the first call changes state.
    fn commit(&self, token: &RequestToken, keyword: &str, outcome: SearchResult) -> bool {
        let mut state = self.lock();
        if !self.guard.is_current(token) {
            tracing::debug!(keyword, seq = token.seq(), "丢弃过期搜索结果");
            return false;
        }
        if !matches!(&state.in_flight, Some(flight) if flight.token == *token) {
            return true;
        }
        state.in_flight = None;

        match outcome {
            Ok(items) => {
                state.results = items;
                state.status = state.settled_status();
                state.results_keyword = Some(keyword.to_string());
                state.highlight = None;
            }
            Err(FetchError::Aborted) => return false,
            Err(err) => {
                tracing::warn!(keyword, error = %err, "搜索失败");
                state.status = SearchStatus::Failed(err.to_string());
            }
        }
        self.publish(&state);
        true
    }
}

/// Keystroke search with debouncing and stale-result rejection
pub struct SearchController {
    inner: Arc<Inner>,
    pending: watch::Sender<Option<String>>,
    debouncer: JoinHandle<()>,
}

impl SearchController {
    /// Must be called inside a tokio runtime
    pub fn new(
        transport: Arc<dyn Transport>,
        guard: Arc<TokenGuard>,
        notifier: Notifier,
        config: SearchConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            transport,
            guard,
            notifier,
            config,
            state: Mutex::new(SearchState {
                keyword: String::new(),
                status: SearchStatus::Idle,
                results: Arc::default(),
                results_keyword: None,
                highlight: None,
                in_flight: None,
                recent: vec![],
            }),
        });

        let (pending, mut rx) = watch::channel(None::<String>);
        let debouncer = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move {
                let quiet = inner.config.quiet;
                loop {
                    if rx.changed().await.is_err() {
                        return;
                    }
                    // wait until no keystroke arrived for a full quiet period
                    loop {
                        match tokio::time::timeout(quiet, rx.changed()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => return,
                            Err(_) => break,
                        }
                    }
                    let keyword = rx.borrow_and_update().clone();
                    if let Some(keyword) = keyword {
                        _ = inner.dispatch(keyword);
                    }
                }
            }
        });

        Self {
            inner,
            pending,
            debouncer,
        }
    }

    /// Record a keystroke; the fetch fires after the quiet period
    pub fn on_input(&self, raw: &str) {
        let keyword = raw.trim();
        if keyword.is_empty() {
            self.clear();
            return;
        }

        {
            let mut state = self.inner.lock();
            state.keyword = keyword.to_string();
            state.status = SearchStatus::Searching;
            self.inner.publish(&state);
        }
        self.pending.send_replace(Some(keyword.to_string()));
    }

    /// Search immediately and resolve with the highlighted (or first) result
    ///
    /// Reuses an in-flight or already resolved request for the same keyword.
    /// `Ok(None)` means no result, or the request was superseded meanwhile.
    pub async fn on_submit(&self, raw: &str) -> Result<Option<SearchItem>, FetchError> {
        let keyword = raw.trim().to_string();
        if keyword.is_empty() {
            return Ok(None);
        }
        self.pending.send_replace(None);

        let reuse = {
            let mut state = self.inner.lock();
            state.keyword.clone_from(&keyword);
            if let Some(flight) = state.in_flight.as_ref().filter(|f| f.keyword == keyword) {
                tracing::debug!(keyword = %keyword, "复用进行中的搜索请求");
                Some((flight.token.clone(), flight.result.clone()))
            } else if state.in_flight.is_none()
                && state.results_keyword.as_deref() == Some(keyword.as_str())
            {
                // the keystroke marked it searching, but nothing will be fetched
                state.status = state.settled_status();
                self.inner.publish(&state);
                return Ok(state.pick());
            } else {
                None
            }
        };

        let (token, result) = match reuse {
            Some(flight) => flight,
            None => self.inner.dispatch(keyword.clone()),
        };
        let outcome = result.await;
        if !self.inner.commit(&token, &keyword, outcome.clone()) {
            return Ok(None);
        }
        match outcome {
            Ok(_) => Ok(self.inner.lock().pick()),
            Err(err) => Err(err),
        }
    }

    /// Empty the input: no network call, pending and in-flight work is dropped
    pub fn clear(&self) {
        self.pending.send_replace(None);
        self.inner.guard.cancel(&OperationClass::search());

        let mut state = self.inner.lock();
        if let Some(flight) = state.in_flight.take() {
            flight.abort.cancel();
        }
        state.keyword.clear();
        state.status = SearchStatus::Idle;
        state.results = Arc::default();
        state.results_keyword = None;
        state.highlight = None;
        self.inner.publish(&state);
    }

    pub fn highlight_next(&self) -> Option<usize> {
        self.move_highlight(next_highlight)
    }

    pub fn highlight_prev(&self) -> Option<usize> {
        self.move_highlight(prev_highlight)
    }

    fn move_highlight(&self, step: fn(Option<usize>, usize) -> Option<usize>) -> Option<usize> {
        let mut state = self.inner.lock();
        state.highlight = step(state.highlight, state.results.len());
        self.inner.publish(&state);
        state.highlight
    }

    /// Take the highlighted (or first) result and remember it
    pub fn select(&self) -> Option<SearchItem> {
        let mut state = self.inner.lock();
        let selected = state.pick()?;
        state.recent.retain(|item| item != &selected);
        state.recent.insert(0, selected.clone());
        state.recent.truncate(RECENT_LIMIT);
        state.highlight = None;
        self.inner.publish(&state);
        Some(selected)
    }

    pub fn recent(&self) -> Vec<SearchItem> {
        self.inner.lock().recent.clone()
    }

    pub fn snapshot(&self) -> SearchSnapshot {
        self.inner.lock().snapshot()
    }
}

impl Drop for SearchController {
    fn drop(&mut self) {
        self.debouncer.abort();
    }
}

/// Move down; past the last result the highlight returns to the input
fn next_highlight(idx: Option<usize>, len: usize) -> Option<usize> {
    match idx {
        Some(idx) => (idx + 1 < len).then_some(idx + 1),
        None => (len > 0).then_some(0),
    }
}

/// Move up; above the first result the highlight returns to the input
fn prev_highlight(idx: Option<usize>, len: usize) -> Option<usize> {
    match idx {
        Some(idx) => idx.checked_sub(1),
        None => len.checked_sub(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedTransport;
    use crate::api::Page;
    use crate::events::drain;
    use serde_json::json;
    use tokio::time::{sleep, Instant};

    fn controller(transport: &ScriptedTransport) -> (SearchController, Notifier) {
        let notifier = Notifier::silent();
        let controller = SearchController::new(
            Arc::new(transport.clone()),
            Arc::new(TokenGuard::new()),
            notifier.clone(),
            SearchConfig::default(),
        );
        (controller, notifier)
    }

    fn three_rows(transport: ScriptedTransport) -> ScriptedTransport {
        transport.on_get(|_| {
            Ok(Page {
                items: vec![
                    json!({"code": "600519.SH", "name": "贵州茅台"}),
                    json!({"code": "000858.SZ", "name": "五粮液"}),
                    json!({"code": "000568.SZ", "name": "泸州老窖"}),
                ],
                total: Some(3),
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_keystrokes_into_one_fetch() {
        let transport = ScriptedTransport::new();
        let (search, _) = controller(&transport);
        let start = Instant::now();

        for text in ["6", "60", "600", "6001"] {
            search.on_input(text);
            sleep(Duration::from_millis(50)).await;
        }
        sleep(Duration::from_millis(600)).await;

        let gets = transport.gets();
        assert_eq!(gets.len(), 1);
        assert_eq!(gets[0].get_param("keyword"), Some("6001"));
        let fired_at = transport.get_times()[0];
        assert!(fired_at.duration_since(start) >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn enter_after_debounce_reuses_resolved_result() {
        let transport = ScriptedTransport::new();
        let (search, _) = controller(&transport);

        search.on_input("600");
        sleep(Duration::from_millis(60)).await;
        search.on_input("6001");
        sleep(Duration::from_millis(400)).await;
        assert_eq!(transport.gets().len(), 1);

        let picked = search.on_submit("6001").await.expect("search succeeds");
        assert_eq!(picked.map(|item| item.code), Some("6001".to_string()));
        assert_eq!(transport.gets().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retyping_then_enter_settles_the_status() {
        let transport = ScriptedTransport::new();
        let (search, _) = controller(&transport);

        search.on_input("6001");
        sleep(Duration::from_millis(400)).await;
        search.on_input("6001");
        assert_eq!(search.snapshot().status, SearchStatus::Searching);

        let picked = search.on_submit("6001").await.expect("search succeeds");
        assert_eq!(picked.map(|item| item.code), Some("6001".to_string()));
        sleep(Duration::from_secs(1)).await;

        assert_eq!(search.snapshot().status, SearchStatus::Ready);
        assert_eq!(transport.gets().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_clears_without_network() {
        let transport = ScriptedTransport::new();
        let (search, _) = controller(&transport);

        search.on_input("abc");
        search.on_input("   ");
        sleep(Duration::from_millis(500)).await;

        assert_eq!(transport.total_calls(), 0);
        let snapshot = search.snapshot();
        assert_eq!(snapshot.status, SearchStatus::Idle);
        assert!(snapshot.results.is_empty());
        assert!(snapshot.keyword.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_results_are_never_rendered() {
        let transport = ScriptedTransport::new().with_get_delay(Duration::from_millis(1_000));
        let (notifier, mut rx) = Notifier::channel();
        let search = SearchController::new(
            Arc::new(transport.clone()),
            Arc::new(TokenGuard::new()),
            notifier,
            SearchConfig::default(),
        );

        search.on_input("a");
        sleep(Duration::from_millis(300)).await;
        search.on_input("ab");
        sleep(Duration::from_millis(2_000)).await;

        assert_eq!(transport.gets().len(), 2);
        let rendered: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                Event::Search(snapshot) => Some(snapshot),
                _ => None,
            })
            .flat_map(|snapshot| snapshot.results.iter().map(|i| i.code.clone()).collect::<Vec<_>>())
            .collect();
        assert!(rendered.iter().all(|code| code == "ab"));
        assert_eq!(search.snapshot().results[0].code, "ab");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_previous_results() {
        let transport = ScriptedTransport::new().on_get(|request| {
            match request.get_param("keyword") {
                Some("bad") => Err(FetchError::Status {
                    status: 500,
                    body: "boom".to_string(),
                }),
                keyword => Ok(Page {
                    items: vec![json!({"code": keyword.unwrap_or_default()})],
                    total: None,
                }),
            }
        });
        let (search, _) = controller(&transport);

        search.on_submit("ok").await.expect("first search");
        let err = search.on_submit("bad").await.expect_err("second search fails");
        assert!(matches!(err, FetchError::Status { status: 500, .. }));

        let snapshot = search.snapshot();
        assert!(snapshot.status.is_failed());
        assert_eq!(snapshot.results[0].code, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_submits_share_one_request() {
        let transport = ScriptedTransport::new();
        let (search, _) = controller(&transport);

        let (a, b) = tokio::join!(search.on_submit("6001"), search.on_submit("6001"));
        assert_eq!(a.expect("a").map(|i| i.code), Some("6001".to_string()));
        assert_eq!(b.expect("b").map(|i| i.code), Some("6001".to_string()));
        assert_eq!(transport.gets().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_cancels_pending_debounce() {
        let transport = ScriptedTransport::new();
        let (search, _) = controller(&transport);

        search.on_input("6001");
        search.on_submit("6001").await.expect("submit");
        sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.gets().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn highlight_and_select_track_recent() {
        let transport = three_rows(ScriptedTransport::new());
        let (search, _) = controller(&transport);
        search.on_submit("酒").await.expect("search");

        assert_eq!(search.highlight_next(), Some(0));
        assert_eq!(search.highlight_next(), Some(1));
        let selected = search.select().expect("selected");
        assert_eq!(selected.code, "000858.SZ");
        assert_eq!(search.snapshot().highlight, None);

        search.select().expect("first row");
        let recent: Vec<String> = search.recent().into_iter().map(|i| i.code).collect();
        assert_eq!(recent, ["600519.SH", "000858.SZ"]);
    }

    #[tokio::test(start_paused = true)]
    async fn new_results_reset_highlight() {
        let transport = three_rows(ScriptedTransport::new());
        let (search, _) = controller(&transport);
        search.on_submit("a").await.expect("search");
        search.highlight_prev();
        assert_eq!(search.snapshot().highlight, Some(2));

        search.on_submit("b").await.expect("search");
        assert_eq!(search.snapshot().highlight, None);
    }

    #[test]
    fn highlight_wraps_back_to_input() {
        assert_eq!(next_highlight(None, 2), Some(0));
        assert_eq!(next_highlight(Some(1), 2), None);
        assert_eq!(prev_highlight(None, 2), Some(1));
        assert_eq!(prev_highlight(Some(0), 2), None);
        assert_eq!(next_highlight(None, 0), None);
    }
}
