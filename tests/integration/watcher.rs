//! Reconciliation of dataset roles through the watcher and its supervisor.

// std
use std::{sync::Arc, time::Duration};
// crates.io
use authsync::{
	Backoff, Datasets, Error, JitterStrategy, ReconciliationSupervisor, ResourceCache,
	ResourceWatcher, RoleNaming, WatchEvent, WatcherState, reconcile::supervisor::Supervised,
	store::resources::DatasetSpec,
};
use tokio_util::sync::CancellationToken;
// self
use crate::support::{self, FakeDirectory, Feed, MemoryStore, dataset};

const EVERYONE: &str = "everyone";

struct Harness {
	store: Arc<MemoryStore<DatasetSpec>>,
	directory: Arc<FakeDirectory>,
	cache: ResourceCache<DatasetSpec>,
	watcher: Arc<ResourceWatcher<Datasets>>,
	supervisor: ReconciliationSupervisor,
}
impl Harness {
	fn new(store: Arc<MemoryStore<DatasetSpec>>, directory: Arc<FakeDirectory>) -> Self {
		let (cache, invalidator) = ResourceCache::new("dataset", store.clone());
		let watcher = Arc::new(ResourceWatcher::new(
			Datasets::new(RoleNaming::default(), EVERYONE),
			store.clone(),
			directory.clone(),
			invalidator,
			Backoff::new(Duration::from_millis(10), Duration::from_millis(50), JitterStrategy::None),
		));
		let supervisor = ReconciliationSupervisor::new(
			CancellationToken::new(),
			vec![watcher.clone() as Arc<dyn Supervised>],
			Duration::from_millis(10),
		);

		supervisor.observe();

		Self { store, directory, cache, watcher, supervisor }
	}

	async fn marker_is(&self, expected: &str) {
		let watcher = self.watcher.clone();

		support::eventually(&format!("marker {expected}"), || {
			let watcher = watcher.clone();

			async move { watcher.marker().as_deref() == Some(expected) }
		})
		.await;
	}
}

#[tokio::test]
async fn relist_creates_roles_and_redelivery_is_idempotent() {
	let _ = tracing_subscriber::fmt::try_init();

	let store = MemoryStore::new(
		vec![
			dataset("d1", "5", "pv", None),
			dataset("d2", "6", "git", Some("private")),
		],
		"10",
	);

	store.push_feed(Feed::Events(vec![
		WatchEvent::Added(dataset("d1", "11", "pv", None)),
		WatchEvent::Added(dataset("d3", "12", "env", Some("admin"))),
	]));

	let h = Harness::new(store, FakeDirectory::new());

	h.marker_is("12").await;

	assert!(h.directory.has_role("ds:d1"));
	assert!(h.directory.has_role("ds:d2"));
	assert!(h.directory.has_role("ds:d3"));
	assert!(h.directory.has_grant("ds:d1", EVERYONE));
	assert!(!h.directory.has_grant("ds:d2", EVERYONE));
	assert!(h.directory.has_grant("ds:d3", EVERYONE));
	// The redelivered ADDED for d1 found the role in place and granted nothing again.
	assert_eq!(h.directory.grant_calls(), 2);
	// Elevated roles are never created by reconciliation.
	assert!(!h.directory.has_role("rw:ds:d1"));
	assert_eq!(h.store.watched_from(), vec!["10".to_owned()]);
	assert_eq!(*h.watcher.state().borrow(), WatcherState::Streaming);

	h.supervisor.shutdown().await;

	assert_eq!(*h.watcher.state().borrow(), WatcherState::Stopped);
}

#[tokio::test]
async fn expired_marker_relists_and_removes_vanished_resources() {
	let _ = tracing_subscriber::fmt::try_init();

	let store = MemoryStore::new(Vec::new(), "0");

	store.push_page(vec![dataset("d1", "1", "pv", None), dataset("d2", "2", "pv", None)], "10");
	store.push_page(vec![dataset("d1", "1", "pv", None)], "20");
	store.push_feed(Feed::Refuse(Error::Gone));

	let h = Harness::new(store, FakeDirectory::new());

	h.marker_is("20").await;

	assert_eq!(h.store.lists(), 2);
	assert!(h.directory.has_role("ds:d1"));
	assert!(!h.directory.has_role("ds:d2"));
	assert!(h.directory.deleted().contains(&"ds:d2".to_owned()));
	assert!(h.directory.deleted().contains(&"rw:ds:d2".to_owned()));
	assert_eq!(h.store.watched_from(), vec!["10".to_owned(), "20".to_owned()]);

	h.supervisor.shutdown().await;
}

#[tokio::test]
async fn volume_type_change_moves_write_grants_to_the_base_role() {
	let _ = tracing_subscriber::fmt::try_init();

	let directory = FakeDirectory::new();

	directory.seed_grant("ds:d1", EVERYONE);
	directory.seed_grant("rw:ds:d1", "group-a");
	directory.seed_grant("rw:ds:d1", EVERYONE);

	let store = MemoryStore::new(vec![dataset("d1", "1", "pv", None)], "1");

	store.push_feed(Feed::Events(vec![WatchEvent::Modified(dataset("d1", "2", "git", None))]));

	let h = Harness::new(store, directory);

	h.marker_is("2").await;

	assert!(h.directory.has_grant("ds:d1", "group-a"));
	assert!(!h.directory.has_grant("rw:ds:d1", "group-a"));
	assert!(h.directory.has_grant("rw:ds:d1", EVERYONE));

	h.supervisor.shutdown().await;
}

#[tokio::test]
async fn deletion_removes_base_and_elevated_roles() {
	let _ = tracing_subscriber::fmt::try_init();

	let directory = FakeDirectory::new();

	directory.seed_grant("rw:ds:d1", "group-a");

	let store = MemoryStore::new(vec![dataset("d1", "1", "pv", None)], "1");

	store.push_feed(Feed::Events(vec![WatchEvent::Deleted(dataset("d1", "3", "pv", None))]));

	let h = Harness::new(store, directory);

	h.marker_is("3").await;

	assert!(!h.directory.has_role("ds:d1"));
	assert!(!h.directory.has_role("rw:ds:d1"));
	assert!(!h.directory.has_grant("rw:ds:d1", "group-a"));

	h.supervisor.shutdown().await;
}

#[tokio::test]
async fn failed_default_grant_is_retried_after_reconnect() {
	let _ = tracing_subscriber::fmt::try_init();

	let directory = FakeDirectory::new();

	directory.fail_next_grants(1);

	let store = MemoryStore::new(vec![dataset("d1", "1", "pv", None)], "7");
	let h = Harness::new(store, directory);

	h.marker_is("7").await;

	assert!(h.directory.has_grant("ds:d1", EVERYONE));
	assert_eq!(h.directory.grant_calls(), 2);
	assert_eq!(h.store.lists(), 2);

	h.supervisor.shutdown().await;
}

#[tokio::test]
async fn watcher_invalidates_the_paired_cache() {
	let _ = tracing_subscriber::fmt::try_init();

	let store = MemoryStore::new(vec![dataset("d1", "1", "pv", None)], "1");
	let feed = store.live_feed();
	let h = Harness::new(store, FakeDirectory::new());

	h.marker_is("1").await;

	let before = h.cache.get("d1").await.expect("get").expect("d1 cached");

	assert_eq!(before.spec.kind.as_deref(), Some("pv"));

	let lists = h.store.lists();

	// Served from the snapshot.
	h.cache.get("d1").await.expect("get");
	assert_eq!(h.store.lists(), lists);

	let updated = dataset("d1", "2", "git", None);

	h.store.replace_items(vec![updated.clone()], "2");
	feed.unbounded_send(Ok(WatchEvent::Modified(updated))).expect("send");
	h.marker_is("2").await;

	let after = h.cache.get("d1").await.expect("get").expect("d1 cached");

	assert_eq!(after.spec.kind.as_deref(), Some("git"));
	assert!(h.cache.get("missing").await.expect("get").is_none());

	h.supervisor.shutdown().await;
}

#[tokio::test]
async fn restart_removes_roles_of_resources_deleted_while_down() {
	let _ = tracing_subscriber::fmt::try_init();

	let directory = FakeDirectory::new();
	let first = Harness::new(
		MemoryStore::new(
			vec![dataset("d1", "1", "pv", None), dataset("d2", "2", "pv", None)],
			"5",
		),
		directory.clone(),
	);

	first.marker_is("5").await;
	first.supervisor.shutdown().await;

	directory.seed_grant("rw:ds:d2", "group-a");
	directory.seed_role("img:d2");

	assert!(directory.has_role("ds:d2"));

	// A fresh process only sees d1 and has no memory of d2.
	let second = Harness::new(MemoryStore::new(vec![dataset("d1", "1", "pv", None)], "9"), directory);

	second.marker_is("9").await;

	assert!(second.directory.has_role("ds:d1"));
	assert!(!second.directory.has_role("ds:d2"));
	assert!(!second.directory.has_role("rw:ds:d2"));
	assert!(!second.directory.has_grant("rw:ds:d2", "group-a"));
	// Roles of other resource types are left alone.
	assert!(second.directory.has_role("img:d2"));

	second.supervisor.shutdown().await;
}
