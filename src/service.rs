//! Process bootstrap: builds every component from a [`SyncConfig`] and starts the background
//! loops in dependency order.

// crates.io
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use url::Url;
// self
use crate::{
	_prelude::*,
	auth::Authenticator,
	cache::manager::ResourceCache,
	config::{Backoff, RetryPolicy, StoreConfig, SyncConfig},
	http::client,
	identity::{IdentityProvider, RoleDirectory, admin::AdminClient, oidc::OidcClient},
	reconcile::{
		reconcilable::{Datasets, Images, InstanceTypes, Reconcilable, RoleNaming},
		supervisor::{ReconciliationSupervisor, Supervised},
		watcher::ResourceWatcher,
	},
	session::issuer::TokenPairIssuer,
	store::{
		Item, ResourceStore,
		kube::KubeStore,
		resources::{DatasetSpec, ImageSpec, InstanceTypeSpec},
	},
	token::{
		exchange::OfflineTokenExchangeCache,
		service::{ServiceTokenHandle, ServiceTokenSyncer},
	},
	verify::SigningKeyVerifier,
};

/// Every long-lived component of a running process.
pub struct Services {
	provider: Arc<dyn IdentityProvider>,
	/// Continuously refreshed service token.
	pub service_token: ServiceTokenHandle,
	/// Bearer verifier with the initial key set loaded.
	pub verifier: Arc<SigningKeyVerifier>,
	/// Offline-token exchange cache.
	pub exchange: Arc<OfflineTokenExchangeCache>,
	/// Request authenticator.
	pub authenticator: Arc<Authenticator>,
	/// Dataset cache.
	pub datasets: ResourceCache<DatasetSpec>,
	/// Image cache.
	pub images: ResourceCache<ImageSpec>,
	/// Instance-type cache.
	pub instance_types: ResourceCache<InstanceTypeSpec>,
	/// Supervisor of the resource watchers.
	pub supervisor: ReconciliationSupervisor,
	cancel: CancellationToken,
}
impl Services {
	/// Validate `config`, acquire the service token and signing keys, warm the caches, and
	/// start reconciliation.
	///
	/// Fails when the configuration is invalid or when the initial token grant or key fetch
	/// fails; the process must not serve in that case.
	#[tracing::instrument(skip_all)]
	pub async fn start(config: SyncConfig, cancel: CancellationToken) -> Result<Self> {
		config.validate()?;

		let http = client::build_client()?;
		let retry = config.retry_policy.clone();
		let identity = &config.identity;
		let provider: Arc<dyn IdentityProvider> =
			Arc::new(OidcClient::new(http.clone(), identity, retry.clone())?);
		let service_token = ServiceTokenSyncer::new(
			provider.clone(),
			identity.client_id.clone(),
			identity.client_secret.clone(),
			config.refresh.clone(),
		)
		.start(cancel.child_token())
		.await?;
		let verifier = Arc::new(SigningKeyVerifier::new(provider.clone(), identity));

		verifier.init_key_set().await?;

		let exchange =
			Arc::new(OfflineTokenExchangeCache::new(provider.clone(), config.refresh.exchange_skew));
		let authenticator = Arc::new(Authenticator::new(
			verifier.clone(),
			exchange.clone(),
			service_token.clone(),
			identity.shared_secret.clone(),
		));
		let directory: Arc<dyn RoleDirectory> = Arc::new(AdminClient::new(
			http.clone(),
			identity,
			service_token.clone(),
			retry.clone(),
		)?);
		let naming = RoleNaming::new(identity.role_prefix.clone());
		let everyone = identity.everyone_group_id.as_str();
		let wiring = Wiring {
			http: &http,
			store: &config.store,
			retry: &retry,
			directory: &directory,
			backoff: &config.refresh.watch_backoff,
		};
		let (datasets, dataset_watcher) =
			wiring.pair("datasets", Datasets::new(naming.clone(), everyone))?;
		let (images, image_watcher) = wiring.pair("images", Images::new(naming.clone(), everyone))?;
		let (instance_types, instance_type_watcher) =
			wiring.pair("instancetypes", InstanceTypes::new(naming, everyone))?;

		warm_up(&datasets).await;
		warm_up(&images).await;
		warm_up(&instance_types).await;

		let supervisor = ReconciliationSupervisor::new(
			cancel.clone(),
			vec![dataset_watcher, image_watcher, instance_type_watcher],
			config.refresh.restart_delay,
		);

		supervisor.observe();
		tracing::info!("authorization sync services started");

		Ok(Self {
			provider,
			service_token,
			verifier,
			exchange,
			authenticator,
			datasets,
			images,
			instance_types,
			supervisor,
			cancel,
		})
	}

	/// Token-pair issuer redirecting signed-out sessions to `login_url`.
	pub fn token_pair_issuer(&self, login_url: Url) -> TokenPairIssuer {
		TokenPairIssuer::new(self.provider.clone(), login_url)
	}

	/// Stop the watchers and every background loop.
	pub async fn shutdown(&self) {
		self.supervisor.shutdown().await;
		self.cancel.cancel();
	}
}
impl std::fmt::Debug for Services {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Services")
			.field("datasets", &self.datasets.kind())
			.field("images", &self.images.kind())
			.field("instance_types", &self.instance_types.kind())
			.field("watching", &self.supervisor.is_running())
			.finish_non_exhaustive()
	}
}

struct Wiring<'a> {
	http: &'a reqwest::Client,
	store: &'a StoreConfig,
	retry: &'a RetryPolicy,
	directory: &'a Arc<dyn RoleDirectory>,
	backoff: &'a Backoff,
}
impl Wiring<'_> {
	/// Cache and watcher sharing one store; the watcher owns the only invalidator.
	fn pair<K>(
		&self,
		plural: &'static str,
		rules: K,
	) -> Result<(ResourceCache<K::Spec>, Arc<dyn Supervised>)>
	where
		K: Reconcilable + Clone,
		K::Spec: DeserializeOwned + Send + Sync + 'static,
	{
		let store: Arc<dyn ResourceStore<K::Spec>> =
			Arc::new(KubeStore::new(self.http.clone(), self.store, plural, self.retry.clone())?);
		let keys = rules.clone();
		let (cache, invalidator) = ResourceCache::keyed(
			rules.kind(),
			store.clone(),
			Arc::new(move |item: &Item<K::Spec>| keys.resource_key(item)),
		);
		let watcher = ResourceWatcher::new(
			rules,
			store,
			self.directory.clone(),
			invalidator,
			self.backoff.clone(),
		);

		Ok((cache, Arc::new(watcher)))
	}
}

async fn warm_up<S>(cache: &ResourceCache<S>)
where
	S: Send + Sync + 'static,
{
	if let Err(err) = cache.refetch().await {
		tracing::warn!(kind = cache.kind(), error = %err, "cache warm-up failed; loading on first read");
	}
}
