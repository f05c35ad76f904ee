//! Bean directory watcher.
//!
//! Keeps an in-memory cache of every bean and turns filesystem changes into
//! typed events. Each change re-fetches only the affected bean from the store
//! and diffs it against the cache. Bursts of writes to the same file are
//! collapsed into one fetch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::beans::{Bean, BeanFilter, BeanStatus, BeanStore};
use crate::util::blocking;
use crate::{rlog, rlog_debug, rlog_trace, rlog_warn, Result};

/// Default debounce window per file.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Changes observed in the bean store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Created(Bean),
    Updated {
        old: Box<Bean>,
        new: Box<Bean>,
    },
    /// Carries the last cached state of the bean.
    Deleted(Bean),
    StatusChanged {
        id: String,
        old: BeanStatus,
        new: BeanStatus,
    },
    TagsChanged {
        id: String,
        added: Vec<String>,
        removed: Vec<String>,
    },
}

impl WatcherEvent {
    pub fn bean_id(&self) -> &str {
        match self {
            WatcherEvent::Created(bean) | WatcherEvent::Deleted(bean) => &bean.id,
            WatcherEvent::Updated { new, .. } => &new.id,
            WatcherEvent::StatusChanged { id, .. } | WatcherEvent::TagsChanged { id, .. } => id,
        }
    }
}

/// Compare two observations of the same bean.
///
/// Identical snapshots produce no events. An update is always reported as
/// `Updated` first, followed by the derived status and tag events.
pub fn diff_beans(old: Option<&Bean>, new: Option<&Bean>) -> Vec<WatcherEvent> {
    match (old, new) {
        (None, None) => Vec::new(),
        (None, Some(new)) => vec![WatcherEvent::Created(new.clone())],
        (Some(old), None) => vec![WatcherEvent::Deleted(old.clone())],
        (Some(old), Some(new)) if old == new => Vec::new(),
        (Some(old), Some(new)) => {
            let mut events = vec![WatcherEvent::Updated {
                old: Box::new(old.clone()),
                new: Box::new(new.clone()),
            }];
            if old.status != new.status {
                events.push(WatcherEvent::StatusChanged {
                    id: new.id.clone(),
                    old: old.status,
                    new: new.status,
                });
            }
            let added: Vec<String> = new.tags.difference(&old.tags).cloned().collect();
            let removed: Vec<String> = old.tags.difference(&new.tags).cloned().collect();
            if !added.is_empty() || !removed.is_empty() {
                events.push(WatcherEvent::TagsChanged {
                    id: new.id.clone(),
                    added,
                    removed,
                });
            }
            events
        }
    }
}

/// Bean id from a file name: `<id>--<slug>.md` or `<id>.md`.
pub fn bean_id_from_path(path: &Path) -> Option<String> {
    if path.extension()? != "md" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.starts_with('.') {
        return None;
    }
    let id = stem.split("--").next()?;
    (!id.is_empty()).then(|| id.to_string())
}

/// Shared read view of every known bean, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct BeanCache {
    inner: Arc<RwLock<HashMap<String, Bean>>>,
}

impl BeanCache {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Bean>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Bean>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: &str) -> Option<Bean> {
        self.read().get(id).cloned()
    }

    pub fn status_of(&self, id: &str) -> Option<BeanStatus> {
        self.read().get(id).map(|b| b.status)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Bean> {
        let mut beans: Vec<Bean> = self.read().values().cloned().collect();
        beans.sort_by(|a, b| a.id.cmp(&b.id));
        beans
    }

    fn replace_all(&self, beans: Vec<Bean>) {
        let mut map = self.write();
        map.clear();
        map.extend(beans.into_iter().map(|b| (b.id.clone(), b)));
    }

    /// Store the new observation and return the events it implies.
    fn apply(&self, id: &str, fetched: Option<Bean>) -> Vec<WatcherEvent> {
        let mut map = self.write();
        let events = diff_beans(map.get(id), fetched.as_ref());
        match fetched {
            Some(bean) => {
                map.insert(id.to_string(), bean);
            }
            None => {
                map.remove(id);
            }
        }
        events
    }
}

/// State shared between the watcher and its debounce loop.
#[derive(Clone)]
struct Refresher {
    store: Arc<dyn BeanStore>,
    cache: BeanCache,
    event_tx: mpsc::UnboundedSender<WatcherEvent>,
    /// Held from fetch to emit so a stale snapshot never overwrites a newer one.
    serial: Arc<AsyncMutex<()>>,
}

impl Refresher {
    async fn refresh(&self, id: &str) -> Result<usize> {
        let _guard = self.serial.lock().await;
        let store = self.store.clone();
        let bean_id = id.to_string();
        let fetched = blocking(move || store.get(&bean_id)).await?;
        let events = self.cache.apply(id, fetched);
        let count = events.len();
        for event in events {
            rlog_trace!("watcher event: {:?}", event);
            if self.event_tx.send(event).is_err() {
                rlog_debug!("watcher event receiver dropped");
            }
        }
        Ok(count)
    }
}

pub struct Watcher {
    refresher: Refresher,
    beans_dir: PathBuf,
    debounce: Duration,
    shutdown: Option<CancellationToken>,
    handle: Option<RecommendedWatcher>,
    task: Option<JoinHandle<()>>,
}

impl Watcher {
    pub fn new(
        store: Arc<dyn BeanStore>,
        beans_dir: PathBuf,
        event_tx: mpsc::UnboundedSender<WatcherEvent>,
    ) -> Self {
        Self {
            refresher: Refresher {
                store,
                cache: BeanCache::default(),
                event_tx,
                serial: Arc::new(AsyncMutex::new(())),
            },
            beans_dir,
            debounce: DEFAULT_DEBOUNCE,
            shutdown: None,
            handle: None,
            task: None,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn cache(&self) -> &BeanCache {
        &self.refresher.cache
    }

    pub fn beans_dir(&self) -> &Path {
        &self.beans_dir
    }

    pub fn is_watching(&self) -> bool {
        self.handle.is_some()
    }

    /// Load every bean into the cache, then start watching.
    ///
    /// The initial load emits no events.
    pub async fn start(&mut self) -> Result<()> {
        let store = self.refresher.store.clone();
        let beans = blocking(move || store.list(&BeanFilter::all())).await?;
        rlog!("Loaded {} beans from store", beans.len());
        self.refresher.cache.replace_all(beans);

        std::fs::create_dir_all(&self.beans_dir)?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut handle = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        if bean_id_from_path(&path).is_some() {
                            let _ = raw_tx.send(path);
                        }
                    }
                }
                Err(e) => rlog_warn!("watch error: {}", e),
            },
            Config::default(),
        )?;
        handle.watch(&self.beans_dir, RecursiveMode::Recursive)?;
        rlog_debug!("watching {}", self.beans_dir.display());

        let shutdown = CancellationToken::new();
        self.task = Some(tokio::spawn(debounce_loop(
            raw_rx,
            self.refresher.clone(),
            self.debounce,
            shutdown.clone(),
        )));
        self.shutdown = Some(shutdown);
        self.handle = Some(handle);
        Ok(())
    }

    /// Re-fetch one bean now, bypassing the debounce. Returns how many events were emitted.
    pub async fn refresh(&self, id: &str) -> Result<usize> {
        self.refresher.refresh(id).await
    }

    /// Stop watching and drop any pending debounced changes.
    pub async fn stop(&mut self) {
        if let Some(token) = self.shutdown.take() {
            token.cancel();
        }
        self.handle = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<PathBuf>,
    refresher: Refresher,
    debounce: Duration,
    shutdown: CancellationToken,
) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    loop {
        let next_deadline = pending.values().min().copied();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            path = raw_rx.recv() => match path {
                // Every new change pushes the deadline out again.
                Some(path) => {
                    pending.insert(path, Instant::now() + debounce);
                }
                None => break,
            },
            _ = sleep_until(next_deadline) => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    pending.remove(&path);
                    let Some(id) = bean_id_from_path(&path) else { continue };
                    if let Err(e) = refresher.refresh(&id).await {
                        rlog_warn!("failed to refresh bean {}: {}", id, e);
                    }
                }
            }
        }
    }
    rlog_debug!("watcher loop stopped");
}
