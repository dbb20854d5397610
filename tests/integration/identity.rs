//! Token grants, offline-token exchange, and bearer verification against a mock realm.

// std
use std::{sync::Arc, time::Duration};
// crates.io
use authsync::{
	Error, IdentityConfig, IdentityProvider, RefreshConfig, RetryPolicy, SigningKeyVerifier,
	identity::oidc::OidcClient,
	token::{exchange::OfflineTokenExchangeCache, service::ServiceTokenSyncer},
};
use jsonwebtoken::Algorithm;
use tokio_util::sync::CancellationToken;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{body_string_contains, method, path},
};
// self
use crate::support::{self, KEY_ONE, KEY_TWO, SlowExchanger};

const TOKEN_PATH: &str = "/realms/hub/protocol/openid-connect/token";
const CERTS_PATH: &str = "/realms/hub/protocol/openid-connect/certs";

fn config(server: &MockServer) -> IdentityConfig {
	let mut config = IdentityConfig::new(server.uri(), "hub", "admin-ui", "s3cret", "everyone")
		.expect("config")
		.with_require_https(false);

	config.allowed_algorithms = vec![Algorithm::HS256];

	config
}

fn oidc(server: &MockServer) -> Arc<OidcClient> {
	Arc::new(
		OidcClient::new(reqwest::Client::new(), &config(server), RetryPolicy::default())
			.expect("client"),
	)
}

#[tokio::test]
async fn service_token_is_granted_with_client_credentials() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.and(body_string_contains("grant_type=client_credentials"))
		.and(body_string_contains("client_id=admin-ui"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"access_token": "service-1",
			"expires_in": 300,
			"token_type": "Bearer"
		})))
		.expect(1)
		.mount(&server)
		.await;

	let cancel = CancellationToken::new();
	let handle = ServiceTokenSyncer::new(oidc(&server), "admin-ui", "s3cret", RefreshConfig::default())
		.start(cancel.clone())
		.await
		.expect("initial grant");

	assert_eq!(handle.access_token(), "service-1");
	assert_eq!(handle.token().issued_for, "admin-ui");

	cancel.cancel();
}

#[tokio::test]
async fn rejected_client_credentials_fail_startup() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
			"error": "unauthorized_client",
			"error_description": "Invalid client secret"
		})))
		.mount(&server)
		.await;

	let result = ServiceTokenSyncer::new(oidc(&server), "admin-ui", "wrong", RefreshConfig::default())
		.start(CancellationToken::new())
		.await;

	match result {
		Err(Error::AuthRejected(reason)) => assert!(reason.contains("Invalid client secret")),
		other => panic!("unexpected result {other:?}"),
	}
}

#[tokio::test]
async fn verifier_follows_key_rotation_with_one_refetch() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path(CERTS_PATH))
		.respond_with(
			ResponseTemplate::new(200).set_body_json(support::jwks_json(&[("k1", KEY_ONE.1)])),
		)
		.up_to_n_times(1)
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path(CERTS_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(support::jwks_json(&[
			("k1", KEY_ONE.1),
			("k2", KEY_TWO.1),
		])))
		.expect(1)
		.mount(&server)
		.await;

	let verifier = Arc::new(SigningKeyVerifier::new(oidc(&server), &config(&server)));

	verifier.init_key_set().await.expect("initial keys");

	let old = support::sign("k1", KEY_ONE.0, "alice", serde_json::json!({}));
	let rotated = support::sign("k2", KEY_TWO.0, "bob", serde_json::json!({}));

	assert_eq!(verifier.verify(&old).await.expect("old key").sub, "alice");

	let tasks = (0..6)
		.map(|_| {
			let verifier = verifier.clone();
			let rotated = rotated.clone();

			tokio::spawn(async move { verifier.verify(&rotated).await })
		})
		.collect::<Vec<_>>();

	for task in tasks {
		assert_eq!(task.await.expect("join").expect("rotated key").sub, "bob");
	}

	assert!(verifier.snapshot().await.contains("k2"));
	assert_eq!(verifier.snapshot().await.generation, 2);
}

#[tokio::test]
async fn exchange_is_single_flight_per_offline_token() {
	let _ = tracing_subscriber::fmt::try_init();

	let provider = SlowExchanger::new(Duration::from_millis(100));
	let cache = Arc::new(OfflineTokenExchangeCache::new(provider.clone(), Duration::from_secs(10)));
	let tasks = (0..16)
		.map(|_| {
			let cache = cache.clone();

			tokio::spawn(async move { cache.exchange("offline-a").await })
		})
		.collect::<Vec<_>>();

	for task in tasks {
		assert_eq!(&*task.await.expect("join").expect("exchanged"), "access-1");
	}

	assert_eq!(provider.exchanges(), 1);
	assert_eq!(&*cache.exchange("offline-b").await.expect("exchanged"), "access-2");
	assert_eq!(provider.exchanges(), 2);
	assert_eq!(cache.len().await, 2);
}

#[tokio::test]
async fn rejected_offline_token_is_not_cached() {
	let _ = tracing_subscriber::fmt::try_init();

	let provider = SlowExchanger::new(Duration::from_millis(1));
	let cache = OfflineTokenExchangeCache::new(provider.clone(), Duration::from_secs(10));

	assert!(matches!(cache.exchange("revoked-1").await, Err(Error::AuthRejected(_))));
	assert!(matches!(cache.exchange("revoked-1").await, Err(Error::AuthRejected(_))));
	assert_eq!(provider.exchanges(), 2);
	assert!(cache.is_empty().await);
}

#[tokio::test]
async fn concurrent_revoked_tokens_reach_the_provider_once() {
	let _ = tracing_subscriber::fmt::try_init();

	let provider = SlowExchanger::new(Duration::from_millis(100));
	let cache = Arc::new(OfflineTokenExchangeCache::new(provider.clone(), Duration::from_secs(10)));
	let tasks = (0..16)
		.map(|_| {
			let cache = cache.clone();

			tokio::spawn(async move { cache.exchange("revoked-2").await })
		})
		.collect::<Vec<_>>();

	for task in tasks {
		assert!(matches!(task.await.expect("join"), Err(Error::AuthRejected(_))));
	}

	assert_eq!(provider.exchanges(), 1);
	assert!(cache.is_empty().await);
}

#[tokio::test]
async fn offline_exchange_goes_through_the_refresh_grant() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path(TOKEN_PATH))
		.and(body_string_contains("grant_type=refresh_token"))
		.and(body_string_contains("refresh_token=offline-xyz"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"access_token": "exchanged",
			"expires_in": 60,
			"refresh_expires_in": 0,
			"refresh_token": "offline-xyz"
		})))
		.expect(1)
		.mount(&server)
		.await;

	let grant = oidc(&server).exchange_offline_token("offline-xyz").await.expect("exchange");

	assert_eq!(grant.access_token, "exchanged");
	assert_eq!(grant.expires_in, Duration::from_secs(60));
	assert_eq!(grant.refresh_expires_in, None);
}
