//! Realm-role and group role-mapping operations of a Keycloak-style admin API.

// crates.io
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::{
	_prelude::*,
	config::{IdentityConfig, RetryPolicy},
	http::client::{self, send_with_retry},
	identity::{RoleDirectory, RoleOutcome, endpoint},
	token::service::ServiceTokenHandle,
};

/// Maximum number of groups fetched when listing role holders.
const MAX_GROUPS: u32 = 10_000;
/// Page size used when searching roles.
const ROLE_PAGE: usize = 100;

/// Admin API client authenticated with the continuously refreshed service token.
#[derive(Clone, Debug)]
pub struct AdminClient {
	client: Client,
	realm_url: Url,
	token: ServiceTokenHandle,
	retry_policy: RetryPolicy,
}
impl AdminClient {
	/// Build a client for `/admin/realms/{realm}`.
	pub fn new(
		client: Client,
		config: &IdentityConfig,
		token: ServiceTokenHandle,
		retry_policy: RetryPolicy,
	) -> Result<Self> {
		let realm_url = endpoint(&config.admin_base_url, ["admin", "realms", config.realm.as_str()])?;

		Ok(Self { client, realm_url, token, retry_policy })
	}

	fn url<'a, I>(&self, segments: I) -> Result<Url>
	where
		I: IntoIterator<Item = &'a str>,
	{
		endpoint(&self.realm_url, segments)
	}

	fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
		builder.bearer_auth(self.token.access_token())
	}

	async fn find_role(&self, name: &str) -> Result<Option<RoleRepresentation>> {
		let url = self.url(["roles", name])?;
		let response = send_with_retry(&self.retry_policy, "find_role", |_| {
			self.authorized(self.client.get(url.clone()))
		})
		.await?;

		if response.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}

		Ok(Some(client::read_json(response).await?))
	}

	async fn require_role(&self, name: &str) -> Result<RoleRepresentation> {
		self.find_role(name).await?.ok_or_else(|| Error::Validation {
			field: "role",
			reason: format!("Role '{name}' does not exist."),
		})
	}

	async fn mutate_mapping(&self, role: &str, group_id: &str, grant: bool) -> Result<()> {
		let representation = self.require_role(role).await?;
		let url = self.url(["groups", group_id, "role-mappings", "realm"])?;
		let body = [representation];
		let operation = if grant { "add_role_to_group" } else { "remove_role_from_group" };
		let response = send_with_retry(&self.retry_policy, operation, |_| {
			let builder =
				if grant { self.client.post(url.clone()) } else { self.client.delete(url.clone()) };

			self.authorized(builder).json(&body)
		})
		.await?;

		if !grant && response.status() == StatusCode::NOT_FOUND {
			return Ok(());
		}

		client::error_for_status(response).await?;

		Ok(())
	}
}
#[async_trait]
impl RoleDirectory for AdminClient {
	#[tracing::instrument(skip(self))]
	async fn create_role(&self, name: &str) -> Result<RoleOutcome> {
		let url = self.url(["roles"])?;
		let body = NewRole { name };
		let response = send_with_retry(&self.retry_policy, "create_role", |_| {
			self.authorized(self.client.post(url.clone())).json(&body)
		})
		.await?;

		if response.status() == StatusCode::CONFLICT {
			return Ok(RoleOutcome::AlreadyExists);
		}

		client::error_for_status(response).await?;

		Ok(RoleOutcome::Created)
	}

	#[tracing::instrument(skip(self))]
	async fn delete_role(&self, name: &str) -> Result<()> {
		let url = self.url(["roles", name])?;
		let response = send_with_retry(&self.retry_policy, "delete_role", |_| {
			self.authorized(self.client.delete(url.clone()))
		})
		.await?;

		if response.status() == StatusCode::NOT_FOUND {
			return Ok(());
		}

		client::error_for_status(response).await?;

		Ok(())
	}

	#[tracing::instrument(skip(self))]
	async fn add_role_to_group(&self, role: &str, group_id: &str) -> Result<()> {
		self.mutate_mapping(role, group_id, true).await
	}

	#[tracing::instrument(skip(self))]
	async fn remove_role_from_group(&self, role: &str, group_id: &str) -> Result<()> {
		self.mutate_mapping(role, group_id, false).await
	}

	#[tracing::instrument(skip(self))]
	async fn groups_with_role(&self, role: &str) -> Result<Vec<String>> {
		let mut url = self.url(["roles", role, "groups"])?;

		url.query_pairs_mut().append_pair("first", "0").append_pair("max", &MAX_GROUPS.to_string());

		let response = send_with_retry(&self.retry_policy, "groups_with_role", |_| {
			self.authorized(self.client.get(url.clone()))
		})
		.await?;

		if response.status() == StatusCode::NOT_FOUND {
			return Ok(Vec::new());
		}

		let groups: Vec<GroupRepresentation> = client::read_json(response).await?;

		Ok(groups.into_iter().map(|group| group.id).collect())
	}

	#[tracing::instrument(skip(self))]
	async fn list_roles(&self, prefix: &str) -> Result<Vec<String>> {
		let mut names = Vec::new();
		let mut first = 0;

		loop {
			let mut url = self.url(["roles"])?;

			url.query_pairs_mut()
				.append_pair("search", prefix)
				.append_pair("first", &first.to_string())
				.append_pair("max", &ROLE_PAGE.to_string());

			let response = send_with_retry(&self.retry_policy, "list_roles", |_| {
				self.authorized(self.client.get(url.clone()))
			})
			.await?;
			let page: Vec<RoleRepresentation> = client::read_json(response).await?;
			let fetched = page.len();

			// Search matches substrings; keep only true prefix matches.
			names.extend(
				page.into_iter().map(|role| role.name).filter(|name| name.starts_with(prefix)),
			);

			if fetched < ROLE_PAGE {
				return Ok(names);
			}

			first += fetched;
		}
	}
}

#[derive(Debug, Serialize)]
struct NewRole<'a> {
	name: &'a str,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RoleRepresentation {
	id: String,
	name: String,
}

#[derive(Debug, Deserialize)]
struct GroupRepresentation {
	id: String,
}
