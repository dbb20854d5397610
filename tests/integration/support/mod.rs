//! In-memory fakes shared by the integration tests.

// std
use std::{
	collections::{BTreeSet, VecDeque},
	future::Future,
	sync::{
		Arc, Mutex,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use async_trait::async_trait;
use authsync::{
	Error, IdentityProvider, Item, ListPage, ResourceStore, Result, RoleDirectory, RoleOutcome,
	TokenGrant, WatchEvent,
	store::{WatchStream, resources::DatasetSpec},
};
use futures::{StreamExt, channel::mpsc, stream};
use jsonwebtoken::jwk::JwkSet;

/// Base64url `k` values of the HMAC keys used to sign test tokens.
pub const KEY_ONE: (&[u8], &str) = (b"test-signing-key-one-000", "dGVzdC1zaWduaW5nLWtleS1vbmUtMDAw");
pub const KEY_TWO: (&[u8], &str) = (b"test-signing-key-two-000", "dGVzdC1zaWduaW5nLWtleS10d28tMDAw");

/// One scripted answer to [`ResourceStore::watch`].
pub enum Feed<S> {
	/// Deliver the events, then stay open without further changes.
	Events(Vec<WatchEvent<S>>),
	/// Deliver the events, then end the stream.
	Closed(Vec<WatchEvent<S>>),
	/// Refuse the watch call.
	Refuse(Error),
	/// Deliver whatever the test sends.
	Live(mpsc::UnboundedReceiver<Result<WatchEvent<S>>>),
}

/// Store whose list answers come from a mutable item set and whose feeds are scripted.
pub struct MemoryStore<S> {
	items: Mutex<Vec<Item<S>>>,
	resource_version: Mutex<String>,
	pages: Mutex<VecDeque<ListPage<S>>>,
	feeds: Mutex<VecDeque<Feed<S>>>,
	watched_from: Mutex<Vec<String>>,
	lists: AtomicUsize,
}
impl<S> MemoryStore<S>
where
	S: Clone,
{
	pub fn new(items: Vec<Item<S>>, resource_version: &str) -> Arc<Self> {
		Arc::new(Self {
			items: Mutex::new(items),
			resource_version: Mutex::new(resource_version.into()),
			pages: Mutex::new(VecDeque::new()),
			feeds: Mutex::new(VecDeque::new()),
			watched_from: Mutex::new(Vec::new()),
			lists: AtomicUsize::new(0),
		})
	}

	/// Answer the next list call with `page` instead of the current items.
	pub fn push_page(&self, items: Vec<Item<S>>, resource_version: &str) {
		self.pages
			.lock()
			.expect("lock")
			.push_back(ListPage { items, resource_version: Some(resource_version.into()) });
	}

	pub fn push_feed(&self, feed: Feed<S>) {
		self.feeds.lock().expect("lock").push_back(feed);
	}

	/// Open a live feed for the next watch call.
	pub fn live_feed(&self) -> mpsc::UnboundedSender<Result<WatchEvent<S>>> {
		let (tx, rx) = mpsc::unbounded();

		self.push_feed(Feed::Live(rx));

		tx
	}

	pub fn replace_items(&self, items: Vec<Item<S>>, resource_version: &str) {
		*self.items.lock().expect("lock") = items;
		*self.resource_version.lock().expect("lock") = resource_version.into();
	}

	pub fn lists(&self) -> usize {
		self.lists.load(Ordering::SeqCst)
	}

	pub fn watched_from(&self) -> Vec<String> {
		self.watched_from.lock().expect("lock").clone()
	}
}
#[async_trait]
impl<S> ResourceStore<S> for MemoryStore<S>
where
	S: Clone + Send + Sync + 'static,
{
	async fn list(&self) -> Result<ListPage<S>> {
		self.lists.fetch_add(1, Ordering::SeqCst);

		if let Some(page) = self.pages.lock().expect("lock").pop_front() {
			return Ok(page);
		}

		Ok(ListPage {
			items: self.items.lock().expect("lock").clone(),
			resource_version: Some(self.resource_version.lock().expect("lock").clone()),
		})
	}

	async fn watch(&self, from: &str) -> Result<WatchStream<S>> {
		self.watched_from.lock().expect("lock").push(from.to_owned());

		let feed = self.feeds.lock().expect("lock").pop_front();

		match feed {
			None => Ok(stream::pending().boxed()),
			Some(Feed::Events(events)) =>
				Ok(stream::iter(events.into_iter().map(Ok)).chain(stream::pending()).boxed()),
			Some(Feed::Closed(events)) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
			Some(Feed::Refuse(err)) => Err(err),
			Some(Feed::Live(rx)) => Ok(rx.chain(stream::pending()).boxed()),
		}
	}
}

/// Role directory recording roles and grants in memory.
#[derive(Default)]
pub struct FakeDirectory {
	roles: Mutex<BTreeSet<String>>,
	grants: Mutex<BTreeSet<(String, String)>>,
	deleted: Mutex<Vec<String>>,
	grant_calls: AtomicUsize,
	failing_grants: AtomicUsize,
}
impl FakeDirectory {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn seed_role(&self, role: &str) {
		self.roles.lock().expect("lock").insert(role.into());
	}

	pub fn seed_grant(&self, role: &str, group: &str) {
		self.seed_role(role);
		self.grants.lock().expect("lock").insert((role.into(), group.into()));
	}

	/// Fail the next `count` grant calls with a transient error.
	pub fn fail_next_grants(&self, count: usize) {
		self.failing_grants.store(count, Ordering::SeqCst);
	}

	pub fn has_role(&self, role: &str) -> bool {
		self.roles.lock().expect("lock").contains(role)
	}

	pub fn has_grant(&self, role: &str, group: &str) -> bool {
		self.grants.lock().expect("lock").contains(&(role.to_owned(), group.to_owned()))
	}

	pub fn grant_calls(&self) -> usize {
		self.grant_calls.load(Ordering::SeqCst)
	}

	pub fn deleted(&self) -> Vec<String> {
		self.deleted.lock().expect("lock").clone()
	}
}
#[async_trait]
impl RoleDirectory for FakeDirectory {
	async fn create_role(&self, name: &str) -> Result<RoleOutcome> {
		if self.roles.lock().expect("lock").insert(name.into()) {
			Ok(RoleOutcome::Created)
		} else {
			Ok(RoleOutcome::AlreadyExists)
		}
	}

	async fn delete_role(&self, name: &str) -> Result<()> {
		self.roles.lock().expect("lock").remove(name);
		self.grants.lock().expect("lock").retain(|(role, _)| role != name);
		self.deleted.lock().expect("lock").push(name.into());

		Ok(())
	}

	async fn add_role_to_group(&self, role: &str, group_id: &str) -> Result<()> {
		self.grant_calls.fetch_add(1, Ordering::SeqCst);

		let failing = self.failing_grants.load(Ordering::SeqCst);

		if failing > 0 {
			self.failing_grants.store(failing - 1, Ordering::SeqCst);

			return Err(Error::UpstreamUnavailable("directory unavailable".into()));
		}

		self.grants.lock().expect("lock").insert((role.into(), group_id.into()));

		Ok(())
	}

	async fn remove_role_from_group(&self, role: &str, group_id: &str) -> Result<()> {
		self.grants.lock().expect("lock").remove(&(role.to_owned(), group_id.to_owned()));

		Ok(())
	}

	async fn groups_with_role(&self, role: &str) -> Result<Vec<String>> {
		Ok(self
			.grants
			.lock()
			.expect("lock")
			.iter()
			.filter(|(granted, _)| granted == role)
			.map(|(_, group)| group.clone())
			.collect())
	}

	async fn list_roles(&self, prefix: &str) -> Result<Vec<String>> {
		Ok(self
			.roles
			.lock()
			.expect("lock")
			.iter()
			.filter(|role| role.starts_with(prefix))
			.cloned()
			.collect())
	}
}

/// Identity provider that answers offline exchanges slowly and counts them.
pub struct SlowExchanger {
	delay: Duration,
	exchanges: AtomicUsize,
}
impl SlowExchanger {
	pub fn new(delay: Duration) -> Arc<Self> {
		Arc::new(Self { delay, exchanges: AtomicUsize::new(0) })
	}

	pub fn exchanges(&self) -> usize {
		self.exchanges.load(Ordering::SeqCst)
	}
}
#[async_trait]
impl IdentityProvider for SlowExchanger {
	async fn grant_service_token(&self, _: &str, _: &str) -> Result<TokenGrant> {
		Ok(TokenGrant::access_only("service-token", Duration::from_secs(300)))
	}

	async fn exchange_offline_token(&self, offline_token: &str) -> Result<TokenGrant> {
		let call = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;

		tokio::time::sleep(self.delay).await;

		if offline_token.starts_with("revoked") {
			return Err(Error::AuthRejected("invalid_grant: Offline session not active".into()));
		}

		Ok(TokenGrant::access_only(format!("access-{call}"), Duration::from_secs(300)))
	}

	async fn refresh_token_pair(&self, _: &str) -> Result<TokenGrant> {
		Err(Error::AuthRejected("refresh not supported".into()))
	}

	async fn fetch_signing_keys(&self) -> Result<JwkSet> {
		Ok(JwkSet { keys: Vec::new() })
	}
}

pub fn dataset(name: &str, resource_version: &str, kind: &str, access: Option<&str>) -> Item<DatasetSpec> {
	Item::new(
		name,
		DatasetSpec {
			display_name: Some(name.to_uppercase()),
			kind: Some(kind.into()),
			access: access.map(Into::into),
			..Default::default()
		},
	)
	.with_resource_version(resource_version)
}

/// JWKS document with one HMAC key per `(kid, k)` pair.
pub fn jwks_json(keys: &[(&str, &str)]) -> serde_json::Value {
	let keys = keys
		.iter()
		.map(|(kid, k)| serde_json::json!({ "kty": "oct", "kid": kid, "alg": "HS256", "k": k }))
		.collect::<Vec<_>>();

	serde_json::json!({ "keys": keys })
}

/// HS256 token for `sub`, valid for five minutes.
pub fn sign(kid: &str, secret: &[u8], sub: &str, claims: serde_json::Value) -> String {
	let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);

	header.kid = Some(kid.into());

	let mut body = serde_json::json!({
		"sub": sub,
		"exp": chrono::Utc::now().timestamp() + 300,
		"preferred_username": format!("{sub}-name"),
	});

	if let (Some(body), Some(extra)) = (body.as_object_mut(), claims.as_object()) {
		body.extend(extra.clone());
	}

	jsonwebtoken::encode(&header, &body, &jsonwebtoken::EncodingKey::from_secret(secret))
		.expect("sign")
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..200 {
		if check().await {
			return;
		}

		tokio::time::sleep(Duration::from_millis(25)).await;
	}

	panic!("condition never held: {what}");
}
