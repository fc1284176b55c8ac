use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::abort::AbortHandle;
use crate::api::{FetchRequest, Transport};
use crate::cache::{CacheEntry, CacheMeta, EntityCache};
use crate::error::{ErrorInfo, FetchError};
use crate::events::{Event, Notifier, TabEvent};
use crate::key::{EntityKey, ResourceKey};
use crate::model::{Payload, SessionState};
use crate::token::{OperationClass, RequestToken, TokenGuard};

/// Data source behind a tab; several tabs may share one
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum DataDomain {
    #[strum(serialize = "trading")]
    TradingData,
    #[strum(serialize = "news")]
    News,
    #[strum(serialize = "volume")]
    VolumeAnalysis,
    #[strum(serialize = "integrated")]
    IntegratedAnalysis,
}

impl DataDomain {
    /// Cache facet the domain's rows are stored under
    pub fn facet(self) -> &'static str {
        self.into()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(String);

impl TabId {
    pub fn new(id: &str) -> Self {
        Self(id.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Clone, Debug)]
pub struct TabsConfig {
    /// Templates are fetched from `<template_base>/<tab>.html`
    pub template_base: String,
    /// Domain rows are fetched from `<data_base>/<domain>`
    pub data_base: String,
}

impl Default for TabsConfig {
    fn default() -> Self {
        Self {
            template_base: "/templates".to_string(),
            data_base: "/api".to_string(),
        }
    }
}

type SharedTemplate = Shared<BoxFuture<'static, Result<Arc<str>, FetchError>>>;
/// `Ok(None)`: the fetch was superseded and nothing was cached
type DataResult = Result<Option<Arc<CacheEntry<Payload>>>, FetchError>;
type SharedData = Shared<BoxFuture<'static, DataResult>>;

/// Per-tab bookkeeping, only touched by the scheduler
#[derive(Clone)]
pub struct TabDescriptor {
    pub id: TabId,
    pub domain: DataDomain,
    pub template_url: String,
    pub is_template_loaded: bool,
    template: Option<Arc<str>>,
    loading: Option<(u64, SharedTemplate)>,
    load_seq: u64,
}

impl std::fmt::Debug for TabDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabDescriptor")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("is_template_loaded", &self.is_template_loaded)
            .field("loading", &self.loading.is_some())
            .finish_non_exhaustive()
    }
}

/// What the view needs to paint a tab
#[derive(Clone, Debug)]
pub struct TabView {
    pub tab: TabId,
    pub entity: EntityKey,
    pub template: Arc<str>,
    pub entry: Arc<CacheEntry<Payload>>,
    pub from_cache: bool,
}

#[derive(Clone, Debug)]
pub enum Activation {
    Rendered(TabView),
    /// The entity changed while the data was loading
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TabError {
    #[error("unknown tab: {0}")]
    UnknownTab(TabId),

    #[error("no entity selected")]
    NoActiveEntity,

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

struct InFlightData {
    token: RequestToken,
    abort: AbortHandle,
    result: SharedData,
}

type InFlightMap = HashMap<ResourceKey, InFlightData>;

/// Newest activation; only it may paint the tab panel
struct Target {
    tab: TabId,
    entity: EntityKey,
    token: RequestToken,
}

/// Lazy template loading plus cache-first domain fetches per tab
pub struct TabScheduler {
    transport: Arc<dyn Transport>,
    cache: Arc<EntityCache<Payload>>,
    guard: Arc<TokenGuard>,
    notifier: Notifier,
    config: TabsConfig,
    tabs: Mutex<HashMap<TabId, TabDescriptor>>,
    in_flight: Arc<Mutex<InFlightMap>>,
    target: Mutex<Option<Target>>,
}

impl TabScheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<EntityCache<Payload>>,
        guard: Arc<TokenGuard>,
        notifier: Notifier,
        config: TabsConfig,
    ) -> Self {
        let scheduler = Self {
            transport,
            cache,
            guard,
            notifier,
            config,
            tabs: Mutex::default(),
            in_flight: Arc::default(),
            target: Mutex::default(),
        };
        for (id, domain) in [
            ("trading", DataDomain::TradingData),
            ("kline", DataDomain::TradingData),
            ("news", DataDomain::News),
            ("volume", DataDomain::VolumeAnalysis),
            ("integrated", DataDomain::IntegratedAnalysis),
        ] {
            scheduler.register(TabId::new(id), domain);
        }
        scheduler
    }

    /// Add (or replace) a tab backed by `domain`
    pub fn register(&self, id: TabId, domain: DataDomain) {
        let template_url = format!(
            "{}/{}.html",
            self.config.template_base.trim_end_matches('/'),
            id
        );
        lock(&self.tabs).insert(
            id.clone(),
            TabDescriptor {
                id,
                domain,
                template_url,
                is_template_loaded: false,
                template: None,
                loading: None,
                load_seq: 0,
            },
        );
    }

    pub fn descriptor(&self, id: &TabId) -> Option<TabDescriptor> {
        lock(&self.tabs).get(id).cloned()
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        let mut ids: Vec<TabId> = lock(&self.tabs).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Show `tab` for the session's entity, fetching only on a cache miss
    pub async fn activate(
        &self,
        tab: &TabId,
        session: &SessionState,
    ) -> Result<Activation, TabError> {
        self.show(tab, session, false).await
    }

    /// Forced sync: skip the cache read, still write the fresh rows back
    pub async fn refresh(
        &self,
        tab: &TabId,
        session: &SessionState,
    ) -> Result<Activation, TabError> {
        self.show(tab, session, true).await
    }

    /// Re-render from what is already loaded; never touches the network
    pub fn render_cached(&self, tab: &TabId, session: &SessionState) -> Option<TabView> {
        let entity = session.active_entity.clone()?;
        let (domain, template) = {
            let tabs = lock(&self.tabs);
            let desc = tabs.get(tab)?;
            (desc.domain, desc.template.clone()?)
        };
        let entry = self.cache.get(&entity.facet(domain.facet()))?;
        let view = TabView {
            tab: tab.clone(),
            entity,
            template,
            entry,
            from_cache: true,
        };
        self.notifier.emit(Event::Tab(TabEvent::Ready(view.clone())));
        Some(view)
    }

    /// Drop every in-flight domain fetch and pending activation; their
    /// results will be neither rendered nor cached
    pub fn cancel_in_flight(&self) {
        self.guard.cancel(&OperationClass::tab_activation());
        let drained: Vec<InFlightData> = {
            let mut in_flight = lock(&self.in_flight);
            in_flight.drain().map(|(_, flight)| flight).collect()
        };
        for flight in &drained {
            flight.abort.cancel();
        }
        for domain in <DataDomain as strum::IntoEnumIterator>::iter() {
            self.guard.cancel(&OperationClass::domain(domain));
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "已取消进行中的标签页数据请求");
        }
    }

    async fn show(
        &self,
        tab: &TabId,
        session: &SessionState,
        force: bool,
    ) -> Result<Activation, TabError> {
        let entity = session
            .active_entity
            .clone()
            .ok_or(TabError::NoActiveEntity)?;
        let domain = self
            .descriptor(tab)
            .map(|desc| desc.domain)
            .ok_or_else(|| TabError::UnknownTab(tab.clone()))?;
        self.claim(tab, &entity);

        let template = self.ensure_template(tab).await;
        if !self.is_target(tab, &entity) {
            tracing::debug!(tab = %tab, entity = %entity, "模板加载期间激活已被取代");
            return Ok(Activation::Superseded);
        }
        let template = match template {
            Ok(template) => template,
            Err(TabError::Fetch(err)) => {
                self.fail(tab, &entity, &err);
                return Err(err.into());
            }
            Err(err) => return Err(err),
        };

        let key = entity.facet(domain.facet());
        if !force {
            if let Some(entry) = self.cache.get(&key) {
                tracing::debug!(tab = %tab, key = %key, "命中缓存，直接渲染");
                return Ok(Activation::Rendered(self.ready(tab, entity, template, entry, true)));
            }
        }

        self.notifier.emit(Event::Tab(TabEvent::Loading {
            tab: tab.clone(),
            entity: entity.clone(),
        }));
        let loaded = self.load_domain(key.clone(), domain).await;
        if !self.is_target(tab, &entity) {
            tracing::debug!(tab = %tab, key = %key, "已切换到其他标签页，不再渲染");
            return Ok(Activation::Superseded);
        }
        match loaded {
            Ok(Some(entry)) => Ok(Activation::Rendered(
                self.ready(tab, entity, template, entry, false),
            )),
            Ok(None) => {
                tracing::debug!(tab = %tab, key = %key, "数据请求已被取代，丢弃结果");
                Ok(Activation::Superseded)
            }
            Err(err) => {
                self.fail(tab, &entity, &err);
                Err(err.into())
            }
        }
    }

    /// Mark `(tab, entity)` as the newest activation
    fn claim(&self, tab: &TabId, entity: &EntityKey) {
        let token = self.guard.begin(OperationClass::tab_activation());
        *lock(&self.target) = Some(Target {
            tab: tab.clone(),
            entity: entity.clone(),
            token,
        });
    }

    /// Concurrent activations of the same tab and entity all stay wanted
    fn is_target(&self, tab: &TabId, entity: &EntityKey) -> bool {
        matches!(
            &*lock(&self.target),
            Some(target) if target.tab == *tab
                && target.entity == *entity
                && self.guard.is_current(&target.token)
        )
    }

    fn ready(
        &self,
        tab: &TabId,
        entity: EntityKey,
        template: Arc<str>,
        entry: Arc<CacheEntry<Payload>>,
        from_cache: bool,
    ) -> TabView {
        let view = TabView {
            tab: tab.clone(),
            entity,
            template,
            entry,
            from_cache,
        };
        self.notifier.emit(Event::Tab(TabEvent::Ready(view.clone())));
        view
    }

    fn fail(&self, tab: &TabId, entity: &EntityKey, err: &FetchError) {
        tracing::warn!(tab = %tab, entity = %entity, error = %err, "标签页加载失败");
        self.notifier.emit(Event::Tab(TabEvent::Failed {
            tab: tab.clone(),
            entity: entity.clone(),
            error: ErrorInfo::network(err),
        }));
    }

    /// Fetch the tab's markup once; concurrent callers share the same load
    async fn ensure_template(&self, tab: &TabId) -> Result<Arc<str>, TabError> {
        let (seq, loading) = {
            let mut tabs = lock(&self.tabs);
            let Some(desc) = tabs.get_mut(tab) else {
                return Err(TabError::UnknownTab(tab.clone()));
            };
            if let Some(template) = &desc.template {
                return Ok(Arc::clone(template));
            }
            if let Some((seq, loading)) = &desc.loading {
                (*seq, loading.clone())
            } else {
                desc.load_seq += 1;
                tracing::debug!(tab = %tab, url = %desc.template_url, "加载标签页模板");
                let loading = self
                    .transport
                    .template(desc.template_url.clone(), AbortHandle::new())
                    .map(|result| result.map(Arc::<str>::from))
                    .boxed()
                    .shared();
                desc.loading = Some((desc.load_seq, loading.clone()));
                (desc.load_seq, loading)
            }
        };

        let result = loading.await;

        let mut tabs = lock(&self.tabs);
        if let Some(desc) = tabs.get_mut(tab) {
            if matches!(&desc.loading, Some((current, _)) if *current == seq) {
                desc.loading = None;
            }
            if let Ok(template) = &result {
                if !desc.is_template_loaded {
                    desc.template = Some(Arc::clone(template));
                    desc.is_template_loaded = true;
                }
            }
        }
        Ok(result?)
    }

    /// Read-through fetch of one `(entity, domain)`; concurrent callers join
    async fn load_domain(&self, key: ResourceKey, domain: DataDomain) -> DataResult {
        let result = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(&key) {
                Some(flight) if self.guard.is_current(&flight.token) => {
                    tracing::debug!(key = %key, "复用进行中的数据请求");
                    flight.result.clone()
                }
                _ => {
                    let flight = self.start_fetch(key.clone(), domain);
                    let result = flight.result.clone();
                    in_flight.insert(key, flight);
                    result
                }
            }
        };
        result.await
    }

    fn start_fetch(&self, key: ResourceKey, domain: DataDomain) -> InFlightData {
        let token = self.guard.begin(OperationClass::domain(domain));
        let abort = AbortHandle::new();

        let endpoint = format!(
            "{}/{}",
            self.config.data_base.trim_end_matches('/'),
            domain.facet()
        );
        let mut request = FetchRequest::new(domain.facet(), endpoint)
            .param("key", key.entity().id())
            .param("kind", key.entity().kind());
        for (name, value) in key.params() {
            request = request.param(name, value);
        }
        let fetch = self.transport.get(request, abort.clone());

        let cache = Arc::clone(&self.cache);
        let guard = Arc::clone(&self.guard);
        let in_flight = Arc::clone(&self.in_flight);
        let commit_token = token.clone();
        let result: BoxFuture<'static, DataResult> = async move {
            let result = fetch.await;
            let mut in_flight = lock(&in_flight);
            if matches!(in_flight.get(&key), Some(flight) if flight.token == commit_token) {
                in_flight.remove(&key);
            }
            if !guard.is_current(&commit_token) {
                return Ok(None);
            }
            let page = result?;
            let meta = CacheMeta {
                window: key.param("window").map(ToString::to_string),
                ..CacheMeta::default()
            };
            Ok(Some(cache.set(key, Payload::Rows(page), meta)))
        }
        .boxed();

        InFlightData {
            token,
            abort,
            result: result.shared(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
