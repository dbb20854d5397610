//! HTTP adapters for the role directory and the cluster resource store.

// std
use std::sync::Arc;
// crates.io
use authsync::{
	Error, IdentityConfig, RefreshConfig, ResourceStore, RetryPolicy, RoleDirectory, RoleOutcome,
	StoreConfig, WatchEvent,
	identity::{admin::AdminClient, oidc::OidcClient},
	store::{kube::KubeStore, resources::DatasetSpec},
	token::service::ServiceTokenSyncer,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{body_json, header, method, path, query_param},
};

const COLLECTION: &str = "/apis/primehub.io/v1alpha1/namespaces/hub/datasets";

async fn admin(server: &MockServer) -> AdminClient {
	Mock::given(method("POST"))
		.and(path("/realms/hub/protocol/openid-connect/token"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"access_token": "service-1",
			"expires_in": 300
		})))
		.mount(server)
		.await;

	let config = IdentityConfig::new(server.uri(), "hub", "admin-ui", "s3cret", "everyone")
		.expect("config")
		.with_require_https(false);
	let client = reqwest::Client::new();
	let oidc = OidcClient::new(client.clone(), &config, RetryPolicy::default()).expect("oidc");
	let token = ServiceTokenSyncer::new(Arc::new(oidc), "admin-ui", "s3cret", RefreshConfig::default())
		.start(CancellationToken::new())
		.await
		.expect("service token");

	AdminClient::new(client, &config, token, RetryPolicy::default()).expect("admin")
}

#[tokio::test]
async fn role_creation_treats_conflicts_as_success() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let admin = admin(&server).await;

	Mock::given(method("POST"))
		.and(path("/admin/realms/hub/roles"))
		.and(header("authorization", "Bearer service-1"))
		.and(body_json(serde_json::json!({ "name": "ds:d1" })))
		.respond_with(ResponseTemplate::new(201))
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/admin/realms/hub/roles"))
		.and(body_json(serde_json::json!({ "name": "ds:d2" })))
		.respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
			"errorMessage": "Role with name ds:d2 already exists"
		})))
		.expect(1)
		.mount(&server)
		.await;

	assert_eq!(admin.create_role("ds:d1").await.expect("create"), RoleOutcome::Created);
	assert_eq!(admin.create_role("ds:d2").await.expect("create"), RoleOutcome::AlreadyExists);
}

#[tokio::test]
async fn grants_resolve_the_role_before_mapping_it() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let admin = admin(&server).await;
	let role = serde_json::json!({ "id": "role-1", "name": "ds:d1" });

	Mock::given(method("GET"))
		.and(path("/admin/realms/hub/roles/ds:d1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(role.clone()))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/admin/realms/hub/groups/everyone/role-mappings/realm"))
		.and(body_json(serde_json::json!([role])))
		.respond_with(ResponseTemplate::new(204))
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/admin/realms/hub/roles/rw:ds:d1/groups"))
		.and(query_param("first", "0"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
			{ "id": "g1", "name": "team-a" },
			{ "id": "g2", "name": "team-b" }
		])))
		.mount(&server)
		.await;
	Mock::given(method("DELETE"))
		.and(path("/admin/realms/hub/roles/rw:ds:gone"))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;

	admin.add_role_to_group("ds:d1", "everyone").await.expect("grant");

	assert_eq!(admin.groups_with_role("rw:ds:d1").await.expect("groups"), vec!["g1", "g2"]);

	admin.delete_role("rw:ds:gone").await.expect("absent role deletion succeeds");
}

#[tokio::test]
async fn store_lists_every_page_with_the_mounted_token() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let token_path =
		std::env::temp_dir().join(format!("authsync-store-token-{}", std::process::id()));

	std::fs::write(&token_path, "cluster-token\n").expect("token file");

	Mock::given(method("GET"))
		.and(path(COLLECTION))
		.and(query_param("continue", "page-2"))
		.and(header("authorization", "Bearer cluster-token"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"metadata": { "resourceVersion": "42" },
			"items": [{ "metadata": { "name": "d2" }, "spec": { "type": "git" } }]
		})))
		.with_priority(1)
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path(COLLECTION))
		.and(header("authorization", "Bearer cluster-token"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"metadata": { "resourceVersion": "41", "continue": "page-2" },
			"items": [{ "metadata": { "name": "d1" }, "spec": { "type": "pv" } }]
		})))
		.expect(1)
		.mount(&server)
		.await;

	let mut config = StoreConfig::new(server.uri(), "hub").expect("config");

	config.token_path = Some(token_path.clone());

	let store = KubeStore::<DatasetSpec>::new(
		reqwest::Client::new(),
		&config,
		"datasets",
		RetryPolicy::default(),
	)
	.expect("store");
	let page = store.list().await.expect("list");
	let names = page.items.iter().map(|item| item.name()).collect::<Vec<_>>();

	assert_eq!(names, vec!["d1", "d2"]);
	assert_eq!(page.resource_version.as_deref(), Some("42"));

	let _ = std::fs::remove_file(&token_path);
}

#[tokio::test]
async fn store_watch_streams_events_and_reports_expired_markers() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let body = [
		r#"{"type":"ADDED","object":{"metadata":{"name":"d1","resourceVersion":"43"},"spec":{"type":"pv"}}}"#,
		r#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"44"}}}"#,
		r#"{"type":"DELETED","object":{"metadata":{"name":"d1","resourceVersion":"45"},"spec":{}}}"#,
	]
	.join("\n");

	Mock::given(method("GET"))
		.and(path(COLLECTION))
		.and(query_param("watch", "1"))
		.and(query_param("resourceVersion", "42"))
		.and(query_param("allowWatchBookmarks", "true"))
		.respond_with(ResponseTemplate::new(200).set_body_string(body))
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path(COLLECTION))
		.and(query_param("watch", "1"))
		.and(query_param("resourceVersion", "1"))
		.respond_with(ResponseTemplate::new(410))
		.mount(&server)
		.await;

	let config = StoreConfig::new(server.uri(), "hub").expect("config");
	let store = KubeStore::<DatasetSpec>::new(
		reqwest::Client::new(),
		&config,
		"datasets",
		RetryPolicy::default(),
	)
	.expect("store");
	let events = store
		.watch("42")
		.await
		.expect("watch")
		.collect::<Vec<_>>()
		.await
		.into_iter()
		.collect::<Result<Vec<_>, _>>()
		.expect("events");

	assert_eq!(events.len(), 3);
	assert!(matches!(&events[0], WatchEvent::Added(item) if item.spec.is_persistent_volume()));
	assert_eq!(events[1], WatchEvent::Bookmark { resource_version: "44".into() });
	assert!(matches!(&events[2], WatchEvent::Deleted(item) if item.name() == "d1"));
	assert!(matches!(store.watch("1").await, Err(Error::Gone)));
}

#[tokio::test]
async fn role_search_keeps_only_prefix_matches() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let admin = admin(&server).await;

	Mock::given(method("GET"))
		.and(path("/admin/realms/hub/roles"))
		.and(query_param("search", "ds:"))
		.and(query_param("first", "0"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
			{ "id": "r1", "name": "ds:d1" },
			{ "id": "r2", "name": "rw:ds:d1" },
			{ "id": "r3", "name": "ds:d2" }
		])))
		.expect(1)
		.mount(&server)
		.await;

	assert_eq!(admin.list_roles("ds:").await.expect("roles"), vec!["ds:d1", "ds:d2"]);
}
