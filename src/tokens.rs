//! Token identifier allocator
//!
//! Hands out unique sequential identifiers per collection (course) and
//! reclaims them on cancellation or expiry. The recycled pool and the
//! sequential cursor partition the id space: an identifier is either never
//! issued, recycled-and-available, or currently held, never more than one
//! at a time.
//!
//! Each `reserve` decision happens under the collection's own lock with no
//! await point inside, so concurrent callers always receive pairwise
//! distinct identifiers; the write-through snapshot persist happens after
//! the decision.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::db::store::CounterStore;
use crate::types::Result;

/// Durable snapshot of one collection's counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCounterSnapshot {
    pub collection_id: String,
    pub base_offset: u64,
    pub next_offset: u64,
    pub max_supply: u64,
    pub recycled: Vec<u64>,
}

struct CounterState {
    base_offset: u64,
    /// Next never-issued identifier; valid while under `base + supply`
    next_offset: u64,
    max_supply: u64,
    recycled: BTreeSet<u64>,
}

impl CounterState {
    fn snapshot(&self, collection_id: &str) -> TokenCounterSnapshot {
        TokenCounterSnapshot {
            collection_id: collection_id.to_string(),
            base_offset: self.base_offset,
            next_offset: self.next_offset,
            max_supply: self.max_supply,
            recycled: self.recycled.iter().copied().collect(),
        }
    }
}

/// Per-collection counter plus recycling pool
pub struct TokenIdAllocator {
    counters: DashMap<String, Mutex<CounterState>>,
    store: Arc<dyn CounterStore>,
}

impl TokenIdAllocator {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            counters: DashMap::new(),
            store,
        }
    }

    /// Restore persisted counters so cursors survive restart
    pub async fn hydrate(&self) -> Result<usize> {
        let snapshots = self.store.load_all().await?;
        let count = snapshots.len();
        for snapshot in snapshots {
            self.counters.insert(
                snapshot.collection_id.clone(),
                Mutex::new(CounterState {
                    base_offset: snapshot.base_offset,
                    next_offset: snapshot.next_offset,
                    max_supply: snapshot.max_supply,
                    recycled: snapshot.recycled.into_iter().collect(),
                }),
            );
        }
        if count > 0 {
            info!(collections = count, "Hydrated token counters from store");
        }
        Ok(count)
    }

    /// Set up a counter for a collection; idempotent, existing counters
    /// are left untouched
    pub async fn initialize(
        &self,
        collection_id: &str,
        base_offset: u64,
        max_supply: u64,
    ) -> Result<()> {
        let mut created = false;
        self.counters
            .entry(collection_id.to_string())
            .or_insert_with(|| {
                created = true;
                Mutex::new(CounterState {
                    base_offset,
                    next_offset: base_offset,
                    max_supply,
                    recycled: BTreeSet::new(),
                })
            });

        if created {
            info!(
                collection = %collection_id,
                base_offset,
                max_supply,
                "Initialized token counter"
            );
            self.persist(collection_id).await;
        }
        Ok(())
    }

    /// Reserve the next available identifier for a collection
    ///
    /// Lowest recycled id first, then the sequential cursor, `None` once
    /// the supply cap is reached with an empty pool. Supply exhaustion is
    /// an expected outcome, not an error.
    pub async fn reserve(&self, collection_id: &str) -> Option<u64> {
        let issued = {
            let entry = self.counters.get(collection_id)?;
            let mut state = lock(&entry);

            if let Some(&lowest) = state.recycled.iter().next() {
                state.recycled.remove(&lowest);
                Some(lowest)
            } else if state.next_offset < state.base_offset.saturating_add(state.max_supply) {
                let id = state.next_offset;
                state.next_offset += 1;
                Some(id)
            } else {
                None
            }
        };

        match issued {
            Some(id) => {
                debug!(collection = %collection_id, token_id = id, "Reserved token identifier");
                self.persist(collection_id).await;
                Some(id)
            }
            None => {
                debug!(collection = %collection_id, "Token supply exhausted");
                None
            }
        }
    }

    /// Return an identifier to the recycling pool
    ///
    /// Idempotent: recycling the same id twice, or an id that was never
    /// issued, leaves the pool unchanged.
    pub async fn recycle(&self, collection_id: &str, token_id: u64) {
        let recycled = {
            let Some(entry) = self.counters.get(collection_id) else {
                warn!(collection = %collection_id, token_id, "Recycle for unknown collection");
                return;
            };
            let mut state = lock(&entry);

            // Only ids inside the issued range [base, cursor) can return
            if token_id < state.base_offset || token_id >= state.next_offset {
                debug!(
                    collection = %collection_id,
                    token_id,
                    "Ignoring recycle of never-issued identifier"
                );
                false
            } else {
                // BTreeSet insert is a no-op on duplicates
                state.recycled.insert(token_id)
            }
        };

        if recycled {
            debug!(collection = %collection_id, token_id, "Recycled token identifier");
            self.persist(collection_id).await;
        }
    }

    /// Current counter snapshot for diagnostics
    pub fn snapshot(&self, collection_id: &str) -> Option<TokenCounterSnapshot> {
        let entry = self.counters.get(collection_id)?;
        let state = lock(&entry);
        Some(state.snapshot(collection_id))
    }

    /// Write-through persist of one counter; failure is logged and does
    /// not affect the in-memory decision already made
    async fn persist(&self, collection_id: &str) {
        let snapshot = {
            match self.counters.get(collection_id) {
                Some(entry) => lock(&entry).snapshot(collection_id),
                None => return,
            }
        };
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(collection = %collection_id, error = %e, "Failed to persist token counter");
        }
    }
}

fn lock(entry: &Mutex<CounterState>) -> std::sync::MutexGuard<'_, CounterState> {
    match entry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryCounterStore;

    async fn allocator() -> TokenIdAllocator {
        TokenIdAllocator::new(Arc::new(MemoryCounterStore::new()))
    }

    #[tokio::test]
    async fn test_sequential_issue_from_base() {
        let alloc = allocator().await;
        alloc.initialize("course-1", 1, 1000).await.unwrap();
        assert_eq!(alloc.reserve("course-1").await, Some(1));
        assert_eq!(alloc.reserve("course-1").await, Some(2));
        assert_eq!(alloc.reserve("course-1").await, Some(3));
    }

    #[tokio::test]
    async fn test_recycling_precedence() {
        let alloc = allocator().await;
        alloc.initialize("course-1", 1, 1000).await.unwrap();
        assert_eq!(alloc.reserve("course-1").await, Some(1));
        assert_eq!(alloc.reserve("course-1").await, Some(2));
        assert_eq!(alloc.reserve("course-1").await, Some(3));

        alloc.recycle("course-1", 2).await;
        // The recycled id comes back before any new sequential id
        assert_eq!(alloc.reserve("course-1").await, Some(2));
        assert_eq!(alloc.reserve("course-1").await, Some(4));
    }

    #[tokio::test]
    async fn test_no_double_recycling() {
        let alloc = allocator().await;
        alloc.initialize("course-1", 1, 1000).await.unwrap();
        alloc.reserve("course-1").await;
        alloc.reserve("course-1").await;

        alloc.recycle("course-1", 2).await;
        alloc.recycle("course-1", 2).await;

        // The id is available exactly once
        assert_eq!(alloc.reserve("course-1").await, Some(2));
        assert_eq!(alloc.reserve("course-1").await, Some(3));
    }

    #[tokio::test]
    async fn test_never_issued_ids_are_not_recyclable() {
        let alloc = allocator().await;
        alloc.initialize("course-1", 1, 1000).await.unwrap();
        alloc.reserve("course-1").await;

        alloc.recycle("course-1", 500).await;
        alloc.recycle("course-1", 0).await;

        assert_eq!(alloc.reserve("course-1").await, Some(2));
    }

    #[tokio::test]
    async fn test_exhaustion_with_recycling_escape_hatch() {
        let alloc = allocator().await;
        alloc.initialize("course-1", 1, 3).await.unwrap();
        assert_eq!(alloc.reserve("course-1").await, Some(1));
        assert_eq!(alloc.reserve("course-1").await, Some(2));
        assert_eq!(alloc.reserve("course-1").await, Some(3));
        assert_eq!(alloc.reserve("course-1").await, None);

        alloc.recycle("course-1", 2).await;
        assert_eq!(alloc.reserve("course-1").await, Some(2));
        assert_eq!(alloc.reserve("course-1").await, None);
    }

    #[tokio::test]
    async fn test_unknown_collection_yields_none() {
        let alloc = allocator().await;
        assert_eq!(alloc.reserve("missing").await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_uniqueness_under_concurrency() {
        let alloc = Arc::new(allocator().await);
        alloc.initialize("course-1", 1, 10_000).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..64 {
            let alloc = Arc::clone(&alloc);
            handles.push(tokio::spawn(
                async move { alloc.reserve("course-1").await },
            ));
        }

        let mut issued = Vec::new();
        for handle in handles {
            issued.push(handle.await.unwrap().expect("supply is ample"));
        }

        issued.sort_unstable();
        let expected: Vec<u64> = (1..=64).collect();
        assert_eq!(issued, expected);
    }

    #[tokio::test]
    async fn test_hydrate_restores_cursor() {
        let store = Arc::new(MemoryCounterStore::new());
        {
            let alloc = TokenIdAllocator::new(Arc::clone(&store) as Arc<dyn CounterStore>);
            alloc.initialize("course-1", 1, 1000).await.unwrap();
            alloc.reserve("course-1").await;
            alloc.reserve("course-1").await;
            alloc.recycle("course-1", 1).await;
        }

        let alloc = TokenIdAllocator::new(store as Arc<dyn CounterStore>);
        assert_eq!(alloc.hydrate().await.unwrap(), 1);
        // Recycled id first, then the restored cursor
        assert_eq!(alloc.reserve("course-1").await, Some(1));
        assert_eq!(alloc.reserve("course-1").await, Some(3));
    }
}
