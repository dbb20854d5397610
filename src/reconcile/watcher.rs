//! Watch-driven reconciliation of one resource type against the role directory.
//!
//! Every action is idempotent, so redelivering an event (after a failed apply, a reconnect,
//! or a process restart that forces a full relist) converges to the same directory state.

// std
use std::collections::{HashMap, HashSet};
// crates.io
use futures::{StreamExt, future::BoxFuture};
use tokio::{
	sync::{Mutex, watch},
	time,
};
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	cache::manager::CacheInvalidator,
	config::Backoff,
	identity::{RoleDirectory, RoleOutcome},
	metrics,
	reconcile::{reconcilable::Reconcilable, supervisor::Supervised},
	store::{Item, ResourceStore, WatchEvent},
};

/// Lifecycle of a [`ResourceWatcher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
	/// Listing or opening the change feed.
	Connecting,
	/// Applying events from an open change feed.
	Streaming,
	/// Waiting out a backoff after a failure.
	Error,
	/// Cancelled; terminal.
	Stopped,
}

/// Keeps the role directory and the paired cache in step with one resource type.
pub struct ResourceWatcher<K>
where
	K: Reconcilable,
{
	kind: K,
	store: Arc<dyn ResourceStore<K::Spec>>,
	directory: Arc<dyn RoleDirectory>,
	invalidator: CacheInvalidator<K::Spec>,
	backoff: Backoff,
	state: watch::Sender<WatcherState>,
	marker: watch::Sender<Option<String>>,
	cursor: Mutex<Cursor<K::Spec>>,
}
impl<K> ResourceWatcher<K>
where
	K: Reconcilable,
{
	/// Create a watcher; nothing runs until [`Self::run`] is driven.
	pub fn new(
		kind: K,
		store: Arc<dyn ResourceStore<K::Spec>>,
		directory: Arc<dyn RoleDirectory>,
		invalidator: CacheInvalidator<K::Spec>,
		backoff: Backoff,
	) -> Self {
		let (state, _) = watch::channel(WatcherState::Connecting);
		let (marker, _) = watch::channel(None);

		Self {
			kind,
			store,
			directory,
			invalidator,
			backoff,
			state,
			marker,
			cursor: Mutex::new(Cursor::default()),
		}
	}

	/// Subscribe to state transitions.
	pub fn state(&self) -> watch::Receiver<WatcherState> {
		self.state.subscribe()
	}

	/// Reconciliation rules in use.
	pub fn rules(&self) -> &K {
		&self.kind
	}

	/// Marker the next watch resumes from, if any.
	pub fn marker(&self) -> Option<String> {
		self.marker.borrow().clone()
	}

	/// Drive the watcher until `cancel` fires.
	pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
		let kind = self.kind.kind();
		let mut cursor = self.cursor.lock().await;

		tracing::info!(kind, "resource watcher started");

		loop {
			self.transition(WatcherState::Connecting);

			let outcome = tokio::select! {
				_ = cancel.cancelled() => break,
				outcome = self.session(&mut cursor) => outcome,
			};

			match outcome {
				Ok(applied) => {
					metrics::record_watch_reconnect(kind, "end");

					tracing::debug!(kind, applied, "change feed ended; reconnecting");

					// An empty feed that closes at once must not turn into a busy loop.
					if applied == 0 {
						tokio::select! {
							_ = cancel.cancelled() => break,
							_ = time::sleep(self.backoff.initial) => {},
						}
					}
				},
				Err(Error::Gone) => {
					self.advance(&mut cursor, None);
					metrics::record_watch_reconnect(kind, "gone");

					tracing::info!(kind, "watch marker expired; relisting");
				},
				Err(err) => {
					let delay = self.backoff.delay(cursor.failures);

					cursor.failures = cursor.failures.saturating_add(1);
					metrics::record_watch_reconnect(kind, "error");
					self.transition(WatcherState::Error);

					tracing::warn!(
						kind,
						error = %err,
						failures = cursor.failures,
						retry_in = ?delay,
						"resource watch failed"
					);

					tokio::select! {
						_ = cancel.cancelled() => break,
						_ = time::sleep(delay) => {},
					}
				},
			}
		}

		self.transition(WatcherState::Stopped);

		tracing::info!(kind, "resource watcher stopped");
	}

	/// Run one connection; returns the number of events applied before a clean end.
	async fn session(&self, cursor: &mut Cursor<K::Spec>) -> Result<usize> {
		let marker = match cursor.marker.clone() {
			Some(marker) => marker,
			None => self.relist(cursor).await?,
		};
		let mut events = self.store.watch(&marker).await?;

		self.transition(WatcherState::Streaming);

		let mut applied = 0;

		while let Some(event) = events.next().await {
			self.apply(cursor, event?).await?;

			applied += 1;
			cursor.failures = 0;
		}

		Ok(applied)
	}

	/// Reconcile every listed item as added and every vanished one as deleted.
	#[tracing::instrument(skip_all, fields(kind = self.kind.kind()))]
	async fn relist(&self, cursor: &mut Cursor<K::Spec>) -> Result<String> {
		let page = self.store.list().await?;
		let mut listed = HashSet::with_capacity(page.items.len());

		for item in page.items {
			let id = self.kind.resource_key(&item);

			self.ensure_role(cursor, &id, &item).await?;

			listed.insert(id.clone());
			cursor.known.insert(id, item);
		}

		let vanished = cursor
			.known
			.iter()
			.filter(|(id, _)| !listed.contains(*id))
			.map(|(id, item)| (id.clone(), item.clone()))
			.collect::<Vec<_>>();

		for (id, item) in vanished {
			self.remove_roles(&item).await?;

			cursor.known.remove(&id);
			cursor.ungranted.remove(&id);
		}

		// Nothing is known before the first list, so deletions missed while down are found by name.
		if !cursor.swept {
			self.sweep_orphans(&listed).await?;

			cursor.swept = true;
		}

		self.invalidator.clear().await;

		let marker = page.resource_version.unwrap_or_default();

		tracing::debug!(items = listed.len(), %marker, "relist reconciled");

		self.advance(cursor, Some(marker.clone()));

		Ok(marker)
	}

	async fn apply(&self, cursor: &mut Cursor<K::Spec>, event: WatchEvent<K::Spec>) -> Result<()> {
		let kind = self.kind.kind();
		let label = event.label();

		match &event {
			WatchEvent::Added(item) => {
				let id = self.kind.resource_key(item);

				self.ensure_role(cursor, &id, item).await?;
				self.invalidator.invalidate(&id).await;

				cursor.known.insert(id, item.clone());
			},
			WatchEvent::Modified(item) => {
				let id = self.kind.resource_key(item);

				self.invalidator.invalidate(&id).await;

				if let Some(old) = cursor.known.get(&id)
					&& self.kind.requires_migration(old, item)
				{
					self.migrate(item).await?;
				}

				cursor.known.insert(id, item.clone());
			},
			WatchEvent::Deleted(item) => {
				let id = self.kind.resource_key(item);

				self.remove_roles(item).await?;
				self.invalidator.invalidate(&id).await;

				cursor.known.remove(&id);
				cursor.ungranted.remove(&id);
			},
			WatchEvent::Bookmark { .. } => {},
		}

		if let Some(marker) = event.resource_version() {
			self.advance(cursor, Some(marker.to_owned()));
		}

		metrics::record_watch_event(kind, label);

		tracing::trace!(kind, event = label, marker = ?cursor.marker, "watch event applied");

		Ok(())
	}

	/// Create the base role; grant defaults when this watcher created it.
	async fn ensure_role(
		&self,
		cursor: &mut Cursor<K::Spec>,
		id: &str,
		item: &Item<K::Spec>,
	) -> Result<()> {
		let kind = self.kind.kind();
		let role = self.kind.role_name(item);

		if self.directory.create_role(&role).await? == RoleOutcome::Created {
			metrics::record_role_action(kind, "create");

			tracing::info!(kind, %role, "role created");

			cursor.ungranted.insert(id.to_owned());
		}

		// A grant that failed earlier is retried on redelivery even though the role now exists.
		if cursor.ungranted.contains(id) {
			for group in self.kind.default_grants(item) {
				self.directory.add_role_to_group(&role, &group).await?;
				metrics::record_role_action(kind, "grant");

				tracing::debug!(kind, %role, %group, "default grant applied");
			}

			cursor.ungranted.remove(id);
		}

		Ok(())
	}

	async fn remove_roles(&self, item: &Item<K::Spec>) -> Result<()> {
		let kind = self.kind.kind();
		let role = self.kind.role_name(item);

		self.directory.delete_role(&role).await?;
		metrics::record_role_action(kind, "delete");

		if let Some(elevated) = self.kind.elevated_role_name(item) {
			self.directory.delete_role(&elevated).await?;
		}

		tracing::info!(kind, %role, "roles deleted");

		Ok(())
	}

	/// Delete roles of this type whose resource is no longer listed.
	async fn sweep_orphans(&self, listed: &HashSet<String>) -> Result<()> {
		let kind = self.kind.kind();
		let naming = self.kind.naming();
		let mut prefixes = vec![naming.base(self.kind.kind_prefix(), "")];

		if self.kind.supports_elevated() {
			prefixes.push(naming.elevated(self.kind.kind_prefix(), ""));
		}

		for prefix in prefixes {
			for role in self.directory.list_roles(&prefix).await? {
				let Some(id) = role.strip_prefix(prefix.as_str()) else {
					continue;
				};

				if id.is_empty() || listed.contains(id) {
					continue;
				}

				self.directory.delete_role(&role).await?;
				metrics::record_role_action(kind, "delete");

				tracing::info!(kind, %role, "orphaned role deleted");
			}
		}

		Ok(())
	}

	/// Move every elevated grant of `item` to its base role.
	#[tracing::instrument(skip_all, fields(kind = self.kind.kind(), id = %item.metadata.name))]
	async fn migrate(&self, item: &Item<K::Spec>) -> Result<()> {
		let Some(elevated) = self.kind.elevated_role_name(item) else {
			return Ok(());
		};
		let base = self.kind.role_name(item);
		let groups = self.directory.groups_with_role(&elevated).await?;

		for group in groups.iter().filter(|group| group.as_str() != self.kind.everyone_group()) {
			// Grant before revoking so a partial migration never loses access.
			self.directory.add_role_to_group(&base, group).await?;
			self.directory.remove_role_from_group(&elevated, group).await?;
			metrics::record_role_action(self.kind.kind(), "migrate");
		}

		tracing::info!(groups = groups.len(), %elevated, %base, "elevated grants migrated");

		Ok(())
	}

	fn advance(&self, cursor: &mut Cursor<K::Spec>, marker: Option<String>) {
		cursor.marker = marker.clone();
		self.marker.send_replace(marker);
	}

	fn transition(&self, state: WatcherState) {
		let previous = self.state.send_replace(state);

		if previous != state {
			tracing::debug!(kind = self.kind.kind(), from = ?previous, to = ?state, "watcher state changed");
		}
	}
}
impl<K> Supervised for ResourceWatcher<K>
where
	K: Reconcilable,
{
	fn kind(&self) -> &'static str {
		self.kind.kind()
	}

	fn run(self: Arc<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
		Box::pin(ResourceWatcher::run(self, cancel))
	}
}
impl<K> std::fmt::Debug for ResourceWatcher<K>
where
	K: Reconcilable,
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ResourceWatcher")
			.field("kind", &self.kind.kind())
			.field("state", &*self.state.borrow())
			.finish_non_exhaustive()
	}
}

struct Cursor<S> {
	marker: Option<String>,
	known: HashMap<String, Item<S>>,
	/// Ids whose role was created here but whose default grants are not yet applied.
	ungranted: HashSet<String>,
	/// Whether roles left behind before this process started were swept.
	swept: bool,
	failures: u32,
}
impl<S> Default for Cursor<S> {
	fn default() -> Self {
		Self {
			marker: None,
			known: HashMap::new(),
			ungranted: HashSet::new(),
			swept: false,
			failures: 0,
		}
	}
}
