//! Cache manager handling resource retrieval and invalidation.

// crates.io
use tokio::sync::{Mutex, RwLock};
// self
use crate::{
	_prelude::*,
	cache::state::{CacheState, Snapshot},
	metrics::{self, CacheMetrics, CacheStats},
	store::{Item, ResourceStore},
};

/// Reloads attempted when invalidations keep racing the list.
const MAX_LOAD_ATTEMPTS: u32 = 3;

/// Derives the id a resource is cached and invalidated under.
pub type ResourceKey<S> = Arc<dyn Fn(&Item<S>) -> String + Send + Sync>;

/// Read-through cache of every resource of one type.
///
/// Readers share one upstream list while the snapshot is invalid; only the paired
/// [`CacheInvalidator`] can invalidate it.
pub struct ResourceCache<S> {
	inner: Arc<Shared<S>>,
}
impl<S> ResourceCache<S>
where
	S: Send + Sync + 'static,
{
	/// Create an empty cache keyed by object name, and the single invalidation handle that goes
	/// with it.
	pub fn new(
		kind: &'static str,
		store: Arc<dyn ResourceStore<S>>,
	) -> (Self, CacheInvalidator<S>) {
		Self::keyed(kind, store, Arc::new(|item: &Item<S>| item.name().to_owned()))
	}

	/// Like [`Self::new`], indexing items by `key`; it must match the ids the paired watcher
	/// invalidates.
	pub fn keyed(
		kind: &'static str,
		store: Arc<dyn ResourceStore<S>>,
		key: ResourceKey<S>,
	) -> (Self, CacheInvalidator<S>) {
		let inner = Arc::new(Shared {
			kind,
			store,
			key,
			entry: RwLock::new(CacheEntry { state: CacheState::Empty, generation: 0 }),
			single_flight: Mutex::new(()),
			metrics: CacheMetrics::new(),
		});

		(Self { inner: inner.clone() }, CacheInvalidator { inner })
	}

	/// Resource type served by this cache.
	pub fn kind(&self) -> &'static str {
		self.inner.kind
	}

	/// Look up one resource; `None` means the store does not hold it.
	#[tracing::instrument(skip(self), fields(kind = self.inner.kind))]
	pub async fn get(&self, id: &str) -> Result<Option<Arc<Item<S>>>> {
		let snapshot = self.current().await?;

		Ok(snapshot.items.get(id).cloned())
	}

	/// Every resource, sorted by id.
	pub async fn list(&self) -> Result<Vec<Arc<Item<S>>>> {
		Ok(self.current().await?.sorted())
	}

	/// Reload unconditionally, e.g. to warm the cache at startup.
	#[tracing::instrument(skip(self), fields(kind = self.inner.kind))]
	pub async fn refetch(&self) -> Result<()> {
		let _guard = self.inner.single_flight.lock().await;
		let generation = self.inner.entry.read().await.generation;

		self.inner.load(generation).await?;

		Ok(())
	}

	/// Whether the next lookup is served without an upstream call.
	pub async fn is_valid(&self) -> bool {
		self.inner.entry.read().await.state.is_valid()
	}

	/// Point-in-time cache counters.
	pub fn stats(&self) -> CacheStats {
		self.inner.metrics.snapshot()
	}

	async fn current(&self) -> Result<Arc<Snapshot<S>>> {
		let shared = &self.inner;

		if let Some(snapshot) = shared.ready().await {
			shared.observe_lookup("hit");

			return Ok(snapshot);
		}

		let _guard = shared.single_flight.lock().await;
		let mut attempts = 0;

		loop {
			let (fallback, generation) = {
				let entry = shared.entry.read().await;

				if let CacheState::Ready(snapshot) = &entry.state {
					shared.observe_lookup("coalesced");

					return Ok(snapshot.clone());
				}

				(entry.state.snapshot().cloned(), entry.generation)
			};

			attempts += 1;

			match shared.load(generation).await {
				Ok(Loaded { snapshot, installed: true }) => {
					shared.observe_lookup("miss");

					return Ok(snapshot);
				},
				Ok(Loaded { snapshot, installed: false }) if attempts >= MAX_LOAD_ATTEMPTS => {
					tracing::debug!(attempts, "invalidations outpaced reloads; serving latest list");

					shared.observe_lookup("miss");

					return Ok(snapshot);
				},
				Ok(Loaded { installed: false, .. }) => continue,
				Err(err) => match fallback {
					Some(stale) => {
						tracing::warn!(error = %err, "reload failed; serving invalidated snapshot");

						shared.observe_lookup("stale");

						return Ok(stale);
					},
					None => return Err(err),
				},
			}
		}
	}
}
impl<S> Clone for ResourceCache<S> {
	fn clone(&self) -> Self {
		Self { inner: self.inner.clone() }
	}
}
impl<S> std::fmt::Debug for ResourceCache<S> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ResourceCache").field("kind", &self.inner.kind).finish_non_exhaustive()
	}
}

/// Sole handle allowed to invalidate a [`ResourceCache`]; owned by the paired watcher.
pub struct CacheInvalidator<S> {
	inner: Arc<Shared<S>>,
}
impl<S> CacheInvalidator<S> {
	/// Mark the whole cache invalid without refetching.
	pub async fn clear(&self) {
		self.inner.invalidate().await;

		tracing::debug!(kind = self.inner.kind, "cache cleared");
	}

	/// Mark the cache invalid because `id` changed.
	pub async fn invalidate(&self, id: &str) {
		self.inner.invalidate().await;

		tracing::debug!(kind = self.inner.kind, id, "cache invalidated");
	}
}
impl<S> std::fmt::Debug for CacheInvalidator<S> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CacheInvalidator").field("kind", &self.inner.kind).finish_non_exhaustive()
	}
}

struct Shared<S> {
	kind: &'static str,
	store: Arc<dyn ResourceStore<S>>,
	key: ResourceKey<S>,
	entry: RwLock<CacheEntry<S>>,
	single_flight: Mutex<()>,
	metrics: Arc<CacheMetrics>,
}
impl<S> Shared<S> {
	async fn ready(&self) -> Option<Arc<Snapshot<S>>> {
		match &self.entry.read().await.state {
			CacheState::Ready(snapshot) => Some(snapshot.clone()),
			_ => None,
		}
	}

	/// List and install the result unless the cache was invalidated meanwhile.
	async fn load(&self, generation: u64) -> Result<Loaded<S>> {
		let started = Instant::now();
		let page = match self.store.list().await {
			Ok(page) => page,
			Err(err) => {
				metrics::record_cache_refetch(self.kind, false, started.elapsed());
				self.metrics.record_refetch_error();

				return Err(err);
			},
		};
		let snapshot = Arc::new(Snapshot::new(page.items, page.resource_version, &*self.key));
		let installed = {
			let mut entry = self.entry.write().await;

			if entry.generation == generation {
				entry.state = CacheState::Ready(snapshot.clone());

				true
			} else {
				false
			}
		};

		metrics::record_cache_refetch(self.kind, true, started.elapsed());
		self.metrics.record_refetch_success(started.elapsed());

		tracing::debug!(
			kind = self.kind,
			items = snapshot.items.len(),
			installed,
			"resource list loaded"
		);

		Ok(Loaded { snapshot, installed })
	}

	async fn invalidate(&self) {
		let mut entry = self.entry.write().await;

		entry.generation = entry.generation.wrapping_add(1);
		entry.state.invalidate();
	}

	fn observe_lookup(&self, outcome: &'static str) {
		metrics::record_cache_lookup(self.kind, outcome);

		self.metrics.record_lookup(outcome);
	}
}

struct CacheEntry<S> {
	state: CacheState<S>,
	generation: u64,
}

struct Loaded<S> {
	snapshot: Arc<Snapshot<S>>,
	installed: bool,
}
