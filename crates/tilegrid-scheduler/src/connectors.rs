//! Lazily built, shared per-owner connectors.
//!
//! The first caller for an owner builds its connector; concurrent callers
//! for the same owner wait on that build and all receive the same instance.
//! A failed build is not memoized, so the next caller tries again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use tilegrid_state::{StageConnector, StateResult, StateStore};

/// Builds the connector for one owner id.
pub type ConnectorFactory =
    Arc<dyn Fn(&str) -> StateResult<Arc<dyn StageConnector>> + Send + Sync>;

/// Per-key lazy initialization with memoization.
pub struct LazyMap<V> {
    cells: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
}

impl<V: Clone> LazyMap<V> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Return the value for `key`, building it with `init` if absent.
    ///
    /// The map lock is held only to find the key's cell; the build itself
    /// runs under that cell alone, so different keys build concurrently.
    pub async fn get_or_try_init<E, F>(&self, key: &str, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            Arc::clone(cells.entry(key.to_string()).or_default())
        };
        cell.get_or_try_init(|| async move { init() }).await.cloned()
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.cells.lock().await.remove(key).is_some()
    }

    pub async fn keys(&self) -> Vec<String> {
        let cells = self.cells.lock().await;
        cells
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl<V: Clone> Default for LazyMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared cache of stage and project connectors.
pub struct ConnectorCache {
    factory: ConnectorFactory,
    connectors: LazyMap<Arc<dyn StageConnector>>,
    built: AtomicUsize,
}

impl ConnectorCache {
    /// Cache over the store's own stage tables.
    pub fn new(store: StateStore) -> Self {
        Self::with_factory(Arc::new(move |owner: &str| -> StateResult<Arc<dyn StageConnector>> {
            let table = store.stage_table(owner)?;
            Ok(Arc::new(table) as Arc<dyn StageConnector>)
        }))
    }

    pub fn with_factory(factory: ConnectorFactory) -> Self {
        Self {
            factory,
            connectors: LazyMap::new(),
            built: AtomicUsize::new(0),
        }
    }

    /// Connector for a stage or project id.
    pub async fn get(&self, owner_id: &str) -> StateResult<Arc<dyn StageConnector>> {
        self.connectors
            .get_or_try_init(owner_id, || {
                let connector = (self.factory)(owner_id)?;
                self.built.fetch_add(1, Ordering::Relaxed);
                debug!(owner = %owner_id, "connector created");
                Ok(connector)
            })
            .await
    }

    /// Forget an owner's connector (e.g. after its stage is deleted).
    pub async fn evict(&self, owner_id: &str) -> bool {
        self.connectors.remove(owner_id).await
    }

    /// Number of connectors constructed so far.
    pub fn built(&self) -> usize {
        self.built.load(Ordering::Relaxed)
    }

    pub async fn owners(&self) -> Vec<String> {
        self.connectors.keys().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tilegrid_state::{PipelineStage, StageFunction, StateError};

    fn store_with_stage(id: &str) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_stage(&PipelineStage {
                id: id.to_string(),
                project_id: "p1".to_string(),
                name: id.to_string(),
                task_id: "t".to_string(),
                function_type: StageFunction::MapTile,
                previous_stage_id: None,
                depth: 1,
                dst_path: "/out".to_string(),
                is_processing: true,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        store
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_builds_once() {
        let store = store_with_stage("s1");
        let factory = move |owner: &str| -> StateResult<Arc<dyn StageConnector>> {
            // Widen the race window.
            std::thread::sleep(Duration::from_millis(20));
            Ok(Arc::new(store.stage_table(owner)?))
        };
        let cache = Arc::new(ConnectorCache::with_factory(Arc::new(factory)));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get("s1").await.unwrap() }));
        }
        let mut connectors = Vec::new();
        for h in handles {
            connectors.push(h.await.unwrap());
        }

        assert_eq!(cache.built(), 1);
        for c in &connectors[1..] {
            assert!(Arc::ptr_eq(&connectors[0], c));
        }
    }

    #[tokio::test]
    async fn failed_build_is_retried() {
        let store = store_with_stage("s0");
        let cache = ConnectorCache::new(store.clone());

        assert!(matches!(cache.get("s1").await, Err(StateError::UnknownOwner(_))));
        assert_eq!(cache.built(), 0);

        let stage = store.get_stage("s0").unwrap().unwrap();
        store
            .put_stage(&PipelineStage {
                id: "s1".to_string(),
                ..stage
            })
            .unwrap();
        assert!(cache.get("s1").await.is_ok());
        assert_eq!(cache.built(), 1);
        assert_eq!(cache.owners().await, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn evict_forces_rebuild() {
        let cache = ConnectorCache::new(store_with_stage("s1"));
        cache.get("s1").await.unwrap();
        assert!(cache.evict("s1").await);
        cache.get("s1").await.unwrap();
        assert_eq!(cache.built(), 2);
    }
}
