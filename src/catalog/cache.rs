use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::catalog::introspect::SchemaLoader;
use crate::catalog::snapshot::{EnumIndex, SchemaSnapshot, TableIndex};
use crate::security::events;
use crate::Nl2SqlError;

/// A fully built snapshot together with its derived indexes.
///
/// Immutable once published; refreshes publish a new `Arc`.
#[derive(Debug)]
pub struct CatalogState {
    pub snapshot: SchemaSnapshot,
    pub tables: TableIndex,
    pub enums: EnumIndex,
    pub loaded_at: Instant,
}

impl CatalogState {
    pub fn new(snapshot: SchemaSnapshot) -> Self {
        let tables = TableIndex::build(&snapshot);
        let enums = EnumIndex::build(&snapshot);
        Self {
            snapshot,
            tables,
            enums,
            loaded_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }
}

/// Statistics for the catalog cache
#[derive(Debug, Default, Clone)]
pub struct CatalogStats {
    pub hits: u64,
    pub refreshes: u64,
    pub failed_refreshes: u64,
    pub stale_serves: u64,
}

/// Process-wide schema snapshot with time-based invalidation.
///
/// At most one refresh runs at a time; callers that queue behind it reuse
/// its result. Readers see either the previous or the new state, never a
/// partially built one.
pub struct SchemaCatalog {
    loader: Arc<dyn SchemaLoader>,
    ttl: Duration,
    current: RwLock<Option<Arc<CatalogState>>>,
    refresh_lock: Mutex<()>,
    stats: RwLock<CatalogStats>,
}

impl SchemaCatalog {
    pub fn new(loader: Arc<dyn SchemaLoader>, ttl: Duration) -> Self {
        Self {
            loader,
            ttl,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            stats: RwLock::new(CatalogStats::default()),
        }
    }

    /// A catalog pre-seeded with a snapshot that never expires.
    pub fn from_snapshot(snapshot: SchemaSnapshot) -> Self {
        let loader = Arc::new(crate::catalog::StaticSchemaLoader::new(snapshot.clone()));
        let catalog = Self::new(loader, Duration::MAX);
        *catalog.current.write() = Some(Arc::new(CatalogState::new(snapshot)));
        catalog
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Currently published state, regardless of age.
    pub fn peek(&self) -> Option<Arc<CatalogState>> {
        self.current.read().clone()
    }

    fn fresh(&self) -> Option<Arc<CatalogState>> {
        self.current
            .read()
            .as_ref()
            .filter(|state| state.age() < self.ttl)
            .cloned()
    }

    /// Current state, refreshing it first when older than the TTL.
    pub async fn get(&self) -> Result<Arc<CatalogState>, Nl2SqlError> {
        if let Some(state) = self.fresh() {
            self.stats.write().hits += 1;
            return Ok(state);
        }
        self.refresh_if_stale().await
    }

    async fn refresh_if_stale(&self) -> Result<Arc<CatalogState>, Nl2SqlError> {
        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(state) = self.fresh() {
            self.stats.write().hits += 1;
            return Ok(state);
        }

        self.reload().await
    }

    /// Force a reload regardless of age.
    pub async fn refresh(&self) -> Result<Arc<CatalogState>, Nl2SqlError> {
        let _guard = self.refresh_lock.lock().await;
        self.reload().await
    }

    /// Must be called with `refresh_lock` held.
    async fn reload(&self) -> Result<Arc<CatalogState>, Nl2SqlError> {
        let started = Instant::now();
        let outcome = match self.loader.load().await {
            Ok(snapshot) if snapshot.is_empty() => Err(Nl2SqlError::CatalogUnavailable(
                "schema snapshot is empty; check the schema whitelist and database permissions".to_string(),
            )),
            Ok(snapshot) => Ok(snapshot),
            Err(e @ Nl2SqlError::CatalogUnavailable(_)) => Err(e),
            Err(e) => Err(Nl2SqlError::CatalogUnavailable(e.to_string())),
        };

        match outcome {
            Ok(snapshot) => {
                let state = Arc::new(CatalogState::new(snapshot));
                *self.current.write() = Some(state.clone());
                self.stats.write().refreshes += 1;
                info!(
                    "Schema catalog refreshed in {:?}: {} tables, {} enum columns",
                    started.elapsed(),
                    state.snapshot.tables.len(),
                    state.enums.len()
                );
                Ok(state)
            }
            Err(e) => {
                self.stats.write().failed_refreshes += 1;
                events::catalog_unavailable(&e.to_string());

                match self.peek() {
                    Some(stale) => {
                        warn!("Schema refresh failed, serving snapshot aged {:?}: {}", stale.age(), e);
                        self.stats.write().stale_serves += 1;
                        Ok(stale)
                    }
                    None => {
                        error!("Schema refresh failed with no prior snapshot: {}", e);
                        Err(e)
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> CatalogStats {
        self.stats.read().clone()
    }

    /// Refresh on a fixed interval from a background task.
    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let catalog = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("Background schema refresh");
                if let Err(e) = catalog.refresh().await {
                    warn!("Background schema refresh failed: {}", e);
                }
            }
        })
    }
}
