use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::abort::AbortHandle;
use crate::api::{FetchRequest, SearchItem, Transport};
use crate::cache::{CacheEntry, CacheMeta, EntityCache};
use crate::error::{ErrorInfo, FetchError};
use crate::events::{Event, Notifier};
use crate::key::EntityKey;
use crate::model::{Payload, SessionState};
use crate::runner::{AnalysisParams, RunSnapshot, RunnerConfig, StreamingRunner, HISTORY_FACET};
use crate::search::{SearchConfig, SearchController, SearchSnapshot};
use crate::tabs::{Activation, TabError, TabId, TabScheduler, TabView, TabsConfig};
use crate::token::{OperationClass, TokenGuard};

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub search: SearchConfig,
    pub tabs: TabsConfig,
    pub runner: RunnerConfig,
    pub history_endpoint: String,
    /// `None` keeps every entry for the whole session
    pub cache_capacity: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            search: SearchConfig::default(),
            tabs: TabsConfig::default(),
            runner: RunnerConfig::default(),
            history_endpoint: "/api/analysis/history".to_string(),
            cache_capacity: None,
        }
    }
}

/// One browsing session: which entity is on screen and everything loaded for it
pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    guard: Arc<TokenGuard>,
    cache: Arc<EntityCache<Payload>>,
    notifier: Notifier,
    session: watch::Sender<SessionState>,
    search: SearchController,
    runner: StreamingRunner,
    tabs: TabScheduler,
    history_endpoint: String,
    history_abort: Mutex<AbortHandle>,
}

impl Orchestrator {
    /// Must be called inside a tokio runtime
    pub fn new(transport: Arc<dyn Transport>, notifier: Notifier, config: OrchestratorConfig) -> Self {
        let guard = Arc::new(TokenGuard::new());
        let cache = Arc::new(EntityCache::with_capacity(config.cache_capacity));
        let (session, session_rx) = watch::channel(SessionState::default());

        let search = SearchController::new(
            Arc::clone(&transport),
            Arc::clone(&guard),
            notifier.clone(),
            config.search,
        );
        let runner = StreamingRunner::new(
            Arc::clone(&transport),
            Arc::clone(&cache),
            Arc::clone(&guard),
            notifier.clone(),
            session_rx,
            config.runner,
        );
        let tabs = TabScheduler::new(
            Arc::clone(&transport),
            Arc::clone(&cache),
            Arc::clone(&guard),
            notifier.clone(),
            config.tabs,
        );

        Self {
            transport,
            guard,
            cache,
            notifier,
            session,
            search,
            runner,
            tabs,
            history_endpoint: config.history_endpoint,
            history_abort: Mutex::default(),
        }
    }

    pub fn session(&self) -> SessionState {
        self.session.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    pub fn cache(&self) -> &EntityCache<Payload> {
        &self.cache
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        self.tabs.tab_ids()
    }

    /// Put `entity` on screen
    ///
    /// Domain and history fetches for the previous entity are dropped. A
    /// running analysis keeps going in the background and still lands in the
    /// cache, it just stops updating the view.
    pub fn select_entity(&self, entity: EntityKey) -> SessionState {
        if self.session.borrow().is_active(&entity) {
            return self.session();
        }
        self.tabs.cancel_in_flight();
        self.guard.cancel(&OperationClass::history());
        lock(&self.history_abort).cancel();

        tracing::info!(entity = %entity, "切换实体");
        self.session.send_modify(|state| state.active_entity = Some(entity));
        let state = self.session();
        self.notifier.emit(Event::Session(state.clone()));
        state
    }

    /// Drop in-flight fetches and every cached facet of the active entity
    pub fn forget_entity(&self) -> usize {
        let Some(entity) = self.session.borrow().active_entity.clone() else {
            return 0;
        };
        self.tabs.cancel_in_flight();
        self.guard.cancel(&OperationClass::history());
        lock(&self.history_abort).cancel();
        let dropped = self.cache.invalidate_entity(&entity);
        tracing::info!(entity = %entity, dropped, "已清除实体缓存");
        dropped
    }

    pub async fn activate_tab(&self, tab: &TabId) -> Result<Activation, TabError> {
        let session = self.enter_tab(tab);
        self.tabs.activate(tab, &session).await
    }

    /// Fetch the tab's rows again even when cached
    pub async fn refresh_tab(&self, tab: &TabId) -> Result<Activation, TabError> {
        let session = self.enter_tab(tab);
        self.tabs.refresh(tab, &session).await
    }

    /// Paint the active tab again from what is already loaded
    pub fn rerender_tab(&self) -> Option<TabView> {
        let session = self.session();
        let tab = session.active_tab.clone()?;
        self.tabs.render_cached(&tab, &session)
    }

    fn enter_tab(&self, tab: &TabId) -> SessionState {
        let changed = self.session.send_if_modified(|state| {
            if state.active_tab.as_ref() == Some(tab) {
                return false;
            }
            state.active_tab = Some(tab.clone());
            true
        });
        let session = self.session();
        if changed {
            self.notifier.emit(Event::Session(session.clone()));
        }
        session
    }

    pub fn search_input(&self, raw: &str) {
        self.search.on_input(raw);
    }

    /// Search now and open the highlighted (or first) result
    pub async fn search_submit(&self, raw: &str) -> Result<Option<EntityKey>, FetchError> {
        if self.search.on_submit(raw).await?.is_none() {
            return Ok(None);
        }
        Ok(self.select_search_result())
    }

    pub fn highlight_next(&self) -> Option<usize> {
        self.search.highlight_next()
    }

    pub fn highlight_prev(&self) -> Option<usize> {
        self.search.highlight_prev()
    }

    /// Open the highlighted result and remember it in the recent list
    pub fn select_search_result(&self) -> Option<EntityKey> {
        let item = self.search.select()?;
        let entity = item.entity();
        self.select_entity(entity.clone());
        Some(entity)
    }

    pub fn search_snapshot(&self) -> SearchSnapshot {
        self.search.snapshot()
    }

    pub fn recent_searches(&self) -> Vec<SearchItem> {
        self.search.recent()
    }

    /// Stream a fresh analysis for the active entity; returns the run id
    pub fn generate_analysis(&self, params: AnalysisParams) -> Option<u64> {
        let entity = self.session.borrow().active_entity.clone()?;
        let key = params.key_for(&entity);
        Some(self.runner.start(key, params))
    }

    pub fn cancel_analysis(&self) -> bool {
        self.runner.cancel_active()
    }

    pub fn retry_analysis(&self) -> Option<u64> {
        self.runner.retry()
    }

    pub fn analysis_snapshot(&self) -> Option<RunSnapshot> {
        self.runner.snapshot()
    }

    /// Last completed analysis of the active entity for `params`
    pub fn cached_analysis(&self, params: &AnalysisParams) -> Option<Arc<CacheEntry<Payload>>> {
        let entity = self.session.borrow().active_entity.clone()?;
        self.cache.get(&params.key_for(&entity))
    }

    /// Past analyses of the active entity, read through the cache
    ///
    /// `Ok(None)` when nothing is selected or the entity changed while loading.
    pub async fn history(
        &self,
        force: bool,
    ) -> Result<Option<Arc<CacheEntry<Payload>>>, FetchError> {
        let Some(entity) = self.session.borrow().active_entity.clone() else {
            return Ok(None);
        };
        let key = entity.facet(HISTORY_FACET);
        if !force {
            if let Some(entry) = self.cache.get(&key) {
                self.notifier.emit(Event::History {
                    key,
                    result: Ok(Arc::clone(&entry)),
                });
                return Ok(Some(entry));
            }
        }

        let token = self.guard.begin(OperationClass::history());
        let abort = AbortHandle::new();
        *lock(&self.history_abort) = abort.clone();
        let request = FetchRequest::new("history", self.history_endpoint.clone())
            .param("key", entity.id())
            .param("kind", entity.kind());
        tracing::debug!(key = %key, "加载分析历史");
        let result = self.transport.get(request, abort).await;

        if !self.guard.is_current(&token) {
            tracing::debug!(key = %key, "分析历史请求已被取代");
            return Ok(None);
        }
        match result {
            Ok(page) => {
                let entry = self
                    .cache
                    .set(key.clone(), Payload::History(page), CacheMeta::default());
                self.notifier.emit(Event::History {
                    key,
                    result: Ok(Arc::clone(&entry)),
                });
                Ok(Some(entry))
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "分析历史加载失败");
                self.notifier.emit(Event::History {
                    key,
                    result: Err(ErrorInfo::network(&err)),
                });
                Err(err)
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
