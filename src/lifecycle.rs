//! Worker lifecycle: install, activate, and the registration that decides
//! which worker version serves requests.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::try_join_all;
use reqwest::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::network::{HttpNetwork, Network};
use crate::router::{CacheRouter, FetchOutcome};
use crate::storage::{CacheKey, CacheStorage, DiskStorage};

/// State of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl WorkerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One version of the worker: a router plus its lifecycle state.
pub struct ServiceWorker<S: CacheStorage = DiskStorage, N: Network = HttpNetwork> {
    id: Uuid,
    router: CacheRouter<S, N>,
    state: RwLock<WorkerState>,
    skip_waiting_on_install: bool,
    skip_waiting: AtomicBool,
    claimed: AtomicBool,
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
    /// Creates a worker in the `Parsed` state. By default a successful
    /// install requests immediate activation.
    #[must_use]
    pub fn new(router: CacheRouter<S, N>) -> Self {
        Self {
            id: Uuid::new_v4(),
            router,
            state: RwLock::new(WorkerState::Parsed),
            skip_waiting_on_install: true,
            skip_waiting: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
        }
    }

    /// Sets whether a successful install requests immediate activation.
    #[must_use]
    pub const fn with_skip_waiting_on_install(mut self, skip: bool) -> Self {
        self.skip_waiting_on_install = skip;
        self
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn router(&self) -> &CacheRouter<S, N> {
        &self.router
    }

    /// Returns the cache storage shared by every worker version.
    #[must_use]
    pub fn storage(&self) -> &S {
        self.router.storage()
    }

    /// Version string: the primary partition name.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.router.config().partitions.primary
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        log::info!("Worker {} ({}) is {state}", self.id, self.version());
    }

    /// Requests activation without waiting for open clients to close.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Returns true once the worker has claimed open clients.
    #[must_use]
    pub fn controls_clients(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Populates the static and dynamic partitions. Both batches must
    /// succeed; on failure the worker becomes redundant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Install`] naming the first asset that failed.
    pub async fn install(&self) -> Result<()> {
        self.set_state(WorkerState::Installing);
        let config = self.router.config();

        let result = tokio::try_join!(
            self.add_all(&config.partitions.static_assets, &config.static_assets),
            self.add_all(&config.partitions.dynamic, &config.external_urls),
        );

        match result {
            Ok(((), ())) => {
                self.set_state(WorkerState::Installed);
                if self.skip_waiting_on_install {
                    self.skip_waiting();
                }
                Ok(())
            }
            Err(e) => {
                log::error!("Install failed: {e}");
                self.set_state(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    /// Fetches every entry, then stores them all. Nothing is stored unless
    /// every fetch returned a 2xx response.
    async fn add_all(&self, partition: &str, entries: &[String]) -> Result<()> {
        log::info!("Caching {} entries into {partition}", entries.len());
        let config = self.router.config();
        let network = self.router.network();

        let fetches = entries.iter().map(|entry| async move {
            let url = config.resolve(entry)?;
            let response = network
                .fetch(&Request::get(url.clone()))
                .await
                .map_err(|e| Error::Install {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            if !response.is_ok() {
                return Err(Error::Install {
                    url: url.to_string(),
                    reason: format!("status {}", response.status),
                });
            }
            Ok::<(CacheKey, Response), Error>((CacheKey::from_url(&url), response))
        });

        let fetched = try_join_all(fetches).await?;
        self.storage().put_all(partition, &fetched).await
    }

    /// Returns the first precache entry missing from this version's
    /// partitions, or `None` if a previous install left them complete.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be resolved or storage fails.
    pub async fn missing_precache_entry(&self) -> Result<Option<String>> {
        let config = self.router.config();
        let batches = [
            (&config.partitions.static_assets, &config.static_assets),
            (&config.partitions.dynamic, &config.external_urls),
        ];
        for (partition, entries) in batches {
            for entry in entries {
                let key = CacheKey::from_url(&config.resolve(entry)?);
                if self.storage().lookup(partition, &key).await?.is_none() {
                    return Ok(Some(entry.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Deletes partitions from other versions and claims open clients.
    /// Returns the names of the deleted partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition sweep fails.
    pub async fn activate(&self) -> Result<Vec<String>> {
        self.set_state(WorkerState::Activating);
        let (deleted, ()) = tokio::try_join!(self.sweep_old_partitions(), self.claim())?;
        self.set_state(WorkerState::Activated);
        Ok(deleted)
    }

    async fn sweep_old_partitions(&self) -> Result<Vec<String>> {
        let current = &self.router.config().partitions;
        let stale: Vec<String> = self
            .storage()
            .names()
            .await?
            .into_iter()
            .filter(|name| !current.contains(name))
            .collect();

        let storage = self.storage();
        try_join_all(stale.iter().map(|name| async move {
            log::info!("Deleting old cache: {name}");
            storage.delete(name).await
        }))
        .await?;
        Ok(stale)
    }

    async fn claim(&self) -> Result<()> {
        self.claimed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Handles a fetch event through the router.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        self.router.handle_fetch(request).await
    }

    pub(crate) fn retire(&self) {
        if self.state() != WorkerState::Redundant {
            self.set_state(WorkerState::Redundant);
        }
    }
}

/// Trait for receiving registration lifecycle notifications.
///
/// All methods have default no-op implementations.
pub trait LifecycleEvents: Send + Sync {
    /// A new worker started installing.
    fn on_update_found(&self, _worker: Uuid) {}

    /// An installed worker is waiting for the active one to go away.
    fn on_waiting(&self, _worker: Uuid) {}

    /// A worker became the active worker.
    fn on_activated(&self, _worker: Uuid) {}

    /// Open clients are now controlled by a different worker.
    fn on_controller_change(&self, _worker: Uuid) {}
}

/// A lifecycle observer that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvents;

impl LifecycleEvents for NoEvents {}

type Slot<S, N> = RwLock<Option<Arc<ServiceWorker<S, N>>>>;

/// Holds the active and waiting workers for one scope.
pub struct Registration<S: CacheStorage = DiskStorage, N: Network = HttpNetwork> {
    scope: Url,
    active: Slot<S, N>,
    waiting: Slot<S, N>,
    update_lock: tokio::sync::Mutex<()>,
    events: Arc<dyn LifecycleEvents>,
}

fn read_slot<S: CacheStorage, N: Network>(slot: &Slot<S, N>) -> Option<Arc<ServiceWorker<S, N>>> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn replace_slot<S: CacheStorage, N: Network>(
    slot: &Slot<S, N>,
    worker: Option<Arc<ServiceWorker<S, N>>>,
) -> Option<Arc<ServiceWorker<S, N>>> {
    std::mem::replace(
        &mut *slot.write().unwrap_or_else(PoisonError::into_inner),
        worker,
    )
}

impl<S: CacheStorage, N: Network> Registration<S, N> {
    /// Creates an empty registration for `scope`.
    #[must_use]
    pub fn new(scope: Url, events: Arc<dyn LifecycleEvents>) -> Self {
        Self {
            scope,
            active: RwLock::new(None),
            waiting: RwLock::new(None),
            update_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    #[must_use]
    pub const fn scope(&self) -> &Url {
        &self.scope
    }

    /// Returns true if `url` is inside this registration's scope.
    #[must_use]
    pub fn controls(&self, url: &Url) -> bool {
        url.origin() == self.scope.origin() && url.path().starts_with(self.scope.path())
    }

    #[must_use]
    pub fn active(&self) -> Option<Arc<ServiceWorker<S, N>>> {
        read_slot(&self.active)
    }

    #[must_use]
    pub fn waiting(&self) -> Option<Arc<ServiceWorker<S, N>>> {
        read_slot(&self.waiting)
    }

    /// Installs `worker` and either activates it or parks it as waiting.
    ///
    /// # Errors
    ///
    /// Returns the install or activation error. The previously active
    /// worker stays in control.
    pub async fn register(&self, worker: Arc<ServiceWorker<S, N>>) -> Result<()> {
        let _guard = self.update_lock.lock().await;
        self.events.on_update_found(worker.id());

        worker.install().await?;

        if self.active().is_none() || worker.skip_waiting_requested() {
            self.promote(worker).await
        } else {
            log::info!("Worker {} installed and waiting", worker.id());
            if let Some(previous) = replace_slot(&self.waiting, Some(Arc::clone(&worker))) {
                previous.retire();
            }
            self.events.on_waiting(worker.id());
            Ok(())
        }
    }

    /// Activates `worker` over the partitions a previous run of the same
    /// version already filled, without touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Install`] naming the first missing entry if the
    /// partitions are incomplete, or the activation error.
    pub async fn restore(&self, worker: Arc<ServiceWorker<S, N>>) -> Result<()> {
        let _guard = self.update_lock.lock().await;
        if let Some(entry) = worker.missing_precache_entry().await? {
            worker.retire();
            return Err(Error::Install {
                url: entry,
                reason: "not in the cache from a previous install".to_string(),
            });
        }
        log::info!("Restoring {} from cached partitions", worker.version());
        worker.set_state(WorkerState::Installed);
        self.promote(worker).await
    }

    /// Activates the waiting worker, if any. Returns true if one was promoted.
    ///
    /// # Errors
    ///
    /// Returns an error if activation fails.
    pub async fn skip_waiting(&self) -> Result<bool> {
        let _guard = self.update_lock.lock().await;
        let Some(worker) = replace_slot(&self.waiting, None) else {
            return Ok(false);
        };
        worker.skip_waiting();
        self.promote(worker).await?;
        Ok(true)
    }

    async fn promote(&self, worker: Arc<ServiceWorker<S, N>>) -> Result<()> {
        if let Err(e) = worker.activate().await {
            worker.retire();
            return Err(e);
        }
        let previous = replace_slot(&self.active, Some(Arc::clone(&worker)));
        // A worker still waiting now belongs to an older update.
        if let Some(stale) = replace_slot(&self.waiting, None) {
            if stale.id() != worker.id() {
                log::info!("Discarding waiting worker {} ({})", stale.id(), stale.version());
                stale.retire();
            }
        }
        self.events.on_activated(worker.id());
        if let Some(previous) = previous {
            previous.retire();
            if worker.controls_clients() {
                self.events.on_controller_change(worker.id());
            }
        }
        Ok(())
    }

    /// Routes a fetch event to the active worker. Without one, or outside
    /// the scope's origin rules, the request is bypassed.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        match self.active() {
            Some(worker) => worker.handle_fetch(request).await,
            None => FetchOutcome::Bypass,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::{PartitionNames, SiteConfig};
    use crate::storage::MemoryStorage;
    use crate::testing::ScriptedNetwork;

    const ORIGIN: &str = "https://folio.test";
    const PHOTO: &str = "https://images.unsplash.com/photo-1?w=400";

    fn site(version: &str) -> SiteConfig {
        SiteConfig::new()
            .with_origin(ORIGIN)
            .with_partitions(PartitionNames::for_version("folio", version))
            .with_static_assets(vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/css/styles.css".to_string(),
            ])
            .with_external_urls(vec![PHOTO.to_string()])
    }

    fn online() -> ScriptedNetwork {
        ScriptedNetwork::new()
            .ok("https://folio.test/", "<html>root")
            .ok("https://folio.test/index.html", "<html>index")
            .ok("https://folio.test/css/styles.css", "body{}")
            .ok_cors(PHOTO, "jpeg")
    }

    fn worker(
        version: &str,
        storage: &Arc<MemoryStorage>,
        net: ScriptedNetwork,
    ) -> Arc<ServiceWorker<MemoryStorage, ScriptedNetwork>> {
        let router = CacheRouter::new(site(version), Arc::clone(storage), Arc::new(net)).unwrap();
        Arc::new(ServiceWorker::new(router))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl LifecycleEvents for Recorder {
        fn on_update_found(&self, _: Uuid) {
            self.0.lock().unwrap().push("update_found");
        }
        fn on_waiting(&self, _: Uuid) {
            self.0.lock().unwrap().push("waiting");
        }
        fn on_activated(&self, _: Uuid) {
            self.0.lock().unwrap().push("activated");
        }
        fn on_controller_change(&self, _: Uuid) {
            self.0.lock().unwrap().push("controller_change");
        }
    }

    #[tokio::test]
    async fn install_populates_both_partitions() {
        let storage = Arc::new(MemoryStorage::new());
        let w = worker("v1", &storage, online());

        w.install().await.unwrap();

        assert_eq!(w.state(), WorkerState::Installed);
        assert!(w.skip_waiting_requested());
        for path in ["/", "/index.html", "/css/styles.css"] {
            let key = CacheKey::from_url(&Url::parse(ORIGIN).unwrap().join(path).unwrap());
            assert!(
                storage.lookup("folio-static-v1", &key).await.unwrap().is_some(),
                "missing {path}"
            );
        }
        assert_eq!(storage.entry_count("folio-dynamic-v1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn install_is_all_or_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        let net = online().respond(
            "https://folio.test/css/styles.css",
            Response::new(404, "missing"),
        );
        let w = worker("v1", &storage, net);

        let err = w.install().await.unwrap_err();
        assert!(matches!(err, Error::Install { ref url, .. } if url.ends_with("/css/styles.css")));
        assert_eq!(w.state(), WorkerState::Redundant);
        assert!(!w.skip_waiting_requested());
        assert_eq!(storage.entry_count("folio-static-v1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn activate_sweeps_foreign_partitions() {
        let storage = Arc::new(MemoryStorage::new());
        storage.open("old-v0").await.unwrap();
        storage.open("folio-static-v0").await.unwrap();
        storage.open("folio-portfolio-v1").await.unwrap();
        let w = worker("v1", &storage, online());

        w.install().await.unwrap();
        let mut deleted = w.activate().await.unwrap();
        deleted.sort();

        assert_eq!(deleted, vec!["folio-static-v0", "old-v0"]);
        assert_eq!(w.state(), WorkerState::Activated);
        assert!(w.controls_clients());
        let names = storage.names().await.unwrap();
        assert!(names.iter().all(|n| PartitionNames::for_version("folio", "v1").contains(n)));
        assert!(names.contains(&"folio-portfolio-v1".to_string()));
    }

    #[tokio::test]
    async fn first_registration_activates_immediately() {
        let storage = Arc::new(MemoryStorage::new());
        let events = Arc::new(Recorder::default());
        let reg = Registration::new(Url::parse("https://folio.test/").unwrap(), events.clone());

        reg.register(worker("v1", &storage, online())).await.unwrap();

        assert_eq!(reg.active().unwrap().state(), WorkerState::Activated);
        assert!(reg.waiting().is_none());
        assert_eq!(*events.0.lock().unwrap(), vec!["update_found", "activated"]);
    }

    #[tokio::test]
    async fn update_replaces_active_worker_and_old_caches() {
        let storage = Arc::new(MemoryStorage::new());
        let events = Arc::new(Recorder::default());
        let reg = Registration::new(Url::parse("https://folio.test/").unwrap(), events.clone());

        let v1 = worker("v1", &storage, online());
        reg.register(Arc::clone(&v1)).await.unwrap();
        reg.register(worker("v2", &storage, online())).await.unwrap();

        assert_eq!(reg.active().unwrap().version(), "folio-portfolio-v2");
        assert_eq!(v1.state(), WorkerState::Redundant);
        assert!(!storage.has("folio-static-v1").await.unwrap());
        assert!(storage.has("folio-static-v2").await.unwrap());
        assert!(events.0.lock().unwrap().contains(&"controller_change"));
    }

    #[tokio::test]
    async fn failed_update_keeps_previous_worker() {
        let storage = Arc::new(MemoryStorage::new());
        let reg = Registration::new(Url::parse("https://folio.test/").unwrap(), Arc::new(NoEvents));

        reg.register(worker("v1", &storage, online())).await.unwrap();
        let broken = worker("v2", &storage, online().fail(PHOTO));
        assert!(reg.register(Arc::clone(&broken)).await.is_err());

        assert_eq!(broken.state(), WorkerState::Redundant);
        let active = reg.active().unwrap();
        assert_eq!(active.version(), "folio-portfolio-v1");
        assert_eq!(active.state(), WorkerState::Activated);
        assert!(storage.has("folio-static-v1").await.unwrap());
    }

    #[tokio::test]
    async fn waiting_worker_is_promoted_by_skip_waiting() {
        let storage = Arc::new(MemoryStorage::new());
        let events = Arc::new(Recorder::default());
        let reg = Registration::new(Url::parse("https://folio.test/").unwrap(), events.clone());

        reg.register(worker("v1", &storage, online())).await.unwrap();
        let router = CacheRouter::new(site("v2"), Arc::clone(&storage), Arc::new(online())).unwrap();
        let v2 = Arc::new(ServiceWorker::new(router).with_skip_waiting_on_install(false));
        reg.register(Arc::clone(&v2)).await.unwrap();

        assert_eq!(v2.state(), WorkerState::Installed);
        assert_eq!(reg.active().unwrap().version(), "folio-portfolio-v1");
        assert!(events.0.lock().unwrap().contains(&"waiting"));

        assert!(reg.skip_waiting().await.unwrap());
        assert!(reg.waiting().is_none());
        assert_eq!(reg.active().unwrap().id(), v2.id());
        assert!(!reg.skip_waiting().await.unwrap());
    }

    #[tokio::test]
    async fn newer_activation_discards_older_waiting_worker() {
        let storage = Arc::new(MemoryStorage::new());
        let reg = Registration::new(Url::parse("https://folio.test/").unwrap(), Arc::new(NoEvents));

        reg.register(worker("v1", &storage, online())).await.unwrap();
        let router = CacheRouter::new(site("v2"), Arc::clone(&storage), Arc::new(online())).unwrap();
        let v2 = Arc::new(ServiceWorker::new(router).with_skip_waiting_on_install(false));
        reg.register(Arc::clone(&v2)).await.unwrap();
        assert_eq!(reg.waiting().unwrap().id(), v2.id());

        let v3 = worker("v3", &storage, online());
        reg.register(Arc::clone(&v3)).await.unwrap();

        assert!(reg.waiting().is_none());
        assert_eq!(v2.state(), WorkerState::Redundant);
        assert!(!reg.skip_waiting().await.unwrap());
        assert_eq!(reg.active().unwrap().id(), v3.id());
        assert!(storage.has("folio-static-v3").await.unwrap());
        assert!(!storage.has("folio-static-v2").await.unwrap());
    }

    #[tokio::test]
    async fn offline_start_restores_previous_install_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let storage = Arc::new(DiskStorage::open_at(dir.path()).await.unwrap());
            let router = CacheRouter::new(site("v1"), storage, Arc::new(online())).unwrap();
            let reg = Registration::new(Url::parse(ORIGIN).unwrap(), Arc::new(NoEvents));
            reg.register(Arc::new(ServiceWorker::new(router))).await.unwrap();
        }

        let storage = Arc::new(DiskStorage::open_at(dir.path()).await.unwrap());
        let offline = || {
            let net = online();
            net.go_offline();
            Arc::new(net)
        };
        let reg = Registration::new(Url::parse(ORIGIN).unwrap(), Arc::new(NoEvents));

        let fresh = CacheRouter::new(site("v1"), Arc::clone(&storage), offline()).unwrap();
        assert!(reg.register(Arc::new(ServiceWorker::new(fresh))).await.is_err());
        assert!(reg.active().is_none());

        let cached = CacheRouter::new(site("v1"), Arc::clone(&storage), offline()).unwrap();
        reg.restore(Arc::new(ServiceWorker::new(cached))).await.unwrap();

        let active = reg.active().unwrap();
        assert_eq!(active.state(), WorkerState::Activated);
        let outcome = reg
            .handle_fetch(&Request::parse_get("https://folio.test/css/styles.css").unwrap())
            .await;
        assert_eq!(outcome.response().unwrap().body.as_ref(), b"body{}");
    }

    #[tokio::test]
    async fn restore_refuses_incomplete_partitions() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put(
                "folio-static-v1",
                &CacheKey::from_url(&Url::parse("https://folio.test/").unwrap()),
                &Response::new(200, "<html>"),
            )
            .await
            .unwrap();
        let reg = Registration::new(Url::parse(ORIGIN).unwrap(), Arc::new(NoEvents));
        let w = worker("v1", &storage, ScriptedNetwork::new());

        let err = reg.restore(Arc::clone(&w)).await.unwrap_err();
        assert!(matches!(err, Error::Install { ref url, .. } if url == "/index.html"));
        assert_eq!(w.state(), WorkerState::Redundant);
        assert!(reg.active().is_none());
    }

    #[tokio::test]
    async fn registration_without_active_worker_bypasses() {
        let reg: Registration<MemoryStorage, ScriptedNetwork> =
            Registration::new(Url::parse("https://folio.test/").unwrap(), Arc::new(NoEvents));
        let request = Request::parse_get("https://folio.test/index.html").unwrap();
        assert!(reg.handle_fetch(&request).await.is_bypass());
    }

    #[test]
    fn controls_checks_origin_and_path() {
        let reg: Registration<MemoryStorage, ScriptedNetwork> =
            Registration::new(Url::parse("https://folio.test/folio/").unwrap(), Arc::new(NoEvents));
        assert!(reg.controls(&Url::parse("https://folio.test/folio/index.html").unwrap()));
        assert!(!reg.controls(&Url::parse("https://folio.test/other").unwrap()));
        assert!(!reg.controls(&Url::parse("https://other.test/folio/").unwrap()));
    }
}
