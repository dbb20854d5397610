//! Kubernetes-style custom-resource store speaking list + watch over HTTP.

// std
use std::{marker::PhantomData, path::PathBuf};
// crates.io
use async_trait::async_trait;
use futures::{StreamExt, stream};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use url::Url;
// self
use crate::{
	_prelude::*,
	config::{RetryPolicy, StoreConfig},
	http::client::{self, send_with_retry},
	identity::endpoint,
	store::{Item, ListPage, ResourceStore, WatchEvent, WatchStream},
};

/// Page size requested from the list endpoint.
const LIST_PAGE_SIZE: u32 = 500;
/// Extra client-side allowance on top of the server-side watch timeout.
const WATCH_GRACE: Duration = Duration::from_secs(15);

/// Custom-resource collection of one type in one namespace.
pub struct KubeStore<S> {
	client: Client,
	collection_url: Url,
	plural: &'static str,
	token_path: Option<PathBuf>,
	watch_timeout: Duration,
	retry_policy: RetryPolicy,
	_spec: PhantomData<fn() -> S>,
}
impl<S> KubeStore<S> {
	/// Address `/apis/{group}/{version}/namespaces/{namespace}/{plural}`.
	pub fn new(
		client: Client,
		config: &StoreConfig,
		plural: &'static str,
		retry_policy: RetryPolicy,
	) -> Result<Self> {
		let collection_url = endpoint(
			&config.api_server,
			[
				"apis",
				config.group.as_str(),
				config.version.as_str(),
				"namespaces",
				config.namespace.as_str(),
				plural,
			],
		)?;

		Ok(Self {
			client,
			collection_url,
			plural,
			token_path: config.token_path.clone(),
			watch_timeout: config.watch_timeout,
			retry_policy,
			_spec: PhantomData,
		})
	}

	/// Collection URL.
	pub fn collection_url(&self) -> &Url {
		&self.collection_url
	}

	/// Read the bearer token fresh on each call; projected tokens rotate on disk.
	async fn bearer(&self) -> Result<Option<String>> {
		match &self.token_path {
			Some(path) => Ok(Some(tokio::fs::read_to_string(path).await?.trim().to_owned())),
			None => Ok(None),
		}
	}

	fn authorized(builder: RequestBuilder, bearer: Option<&str>) -> RequestBuilder {
		match bearer {
			Some(token) => builder.bearer_auth(token),
			None => builder,
		}
	}
}
#[async_trait]
impl<S> ResourceStore<S> for KubeStore<S>
where
	S: DeserializeOwned + Send + Sync + 'static,
{
	#[tracing::instrument(skip(self), fields(plural = self.plural))]
	async fn list(&self) -> Result<ListPage<S>> {
		let bearer = self.bearer().await?;
		let mut items = Vec::new();
		let mut continue_token: Option<String> = None;

		loop {
			let mut url = self.collection_url.clone();

			{
				let mut query = url.query_pairs_mut();

				query.append_pair("limit", &LIST_PAGE_SIZE.to_string());

				if let Some(token) = &continue_token {
					query.append_pair("continue", token);
				}
			}

			let response = send_with_retry(&self.retry_policy, "list_resources", |_| {
				Self::authorized(self.client.get(url.clone()), bearer.as_deref())
			})
			.await?;
			let page: ResourceList<S> = client::read_json(response).await?;

			items.extend(page.items);

			match page.metadata.continue_token.filter(|token| !token.is_empty()) {
				Some(token) => continue_token = Some(token),
				None => {
					tracing::debug!(items = items.len(), "resources listed");

					return Ok(ListPage { items, resource_version: page.metadata.resource_version });
				},
			}
		}
	}

	#[tracing::instrument(skip(self), fields(plural = self.plural))]
	async fn watch(&self, from: &str) -> Result<WatchStream<S>> {
		let bearer = self.bearer().await?;
		let mut url = self.collection_url.clone();

		url.query_pairs_mut()
			.append_pair("watch", "1")
			.append_pair("resourceVersion", from)
			.append_pair("allowWatchBookmarks", "true")
			.append_pair("timeoutSeconds", &self.watch_timeout.as_secs().to_string());

		let response = Self::authorized(self.client.get(url), bearer.as_deref())
			.timeout(self.watch_timeout + WATCH_GRACE)
			.send()
			.await?;

		if response.status() == StatusCode::GONE {
			return Err(Error::Gone);
		}

		let response = client::error_for_status(response).await?;

		Ok(decode_lines(response.bytes_stream()))
	}
}
impl<S> std::fmt::Debug for KubeStore<S> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KubeStore")
			.field("collection_url", &self.collection_url.as_str())
			.field("watch_timeout", &self.watch_timeout)
			.finish_non_exhaustive()
	}
}

/// Split a chunked body into newline-delimited watch events.
fn decode_lines<S, B, E>(body: B) -> WatchStream<S>
where
	S: DeserializeOwned + Send + 'static,
	B: futures::Stream<Item = std::result::Result<E, reqwest::Error>> + Send + 'static,
	E: AsRef<[u8]> + Send,
{
	let body = Box::pin(body.fuse());

	stream::unfold((body, Vec::<u8>::new()), |(mut body, mut buffer)| async move {
		loop {
			if let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
				let line = buffer.drain(..=newline).collect::<Vec<_>>();

				if line.iter().all(u8::is_ascii_whitespace) {
					continue;
				}

				return Some((decode_event(&line), (body, buffer)));
			}

			match body.next().await {
				Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
				Some(Err(err)) => return Some((Err(err.into()), (body, buffer))),
				None if buffer.iter().all(u8::is_ascii_whitespace) => return None,
				None => {
					let line = std::mem::take(&mut buffer);

					return Some((decode_event(&line), (body, buffer)));
				},
			}
		}
	})
	.boxed()
}

fn decode_event<S>(line: &[u8]) -> Result<WatchEvent<S>>
where
	S: DeserializeOwned,
{
	let raw: RawEvent = serde_json::from_slice(line)?;

	match raw.kind.as_str() {
		"ADDED" => Ok(WatchEvent::Added(serde_json::from_value(raw.object)?)),
		"MODIFIED" => Ok(WatchEvent::Modified(serde_json::from_value(raw.object)?)),
		"DELETED" => Ok(WatchEvent::Deleted(serde_json::from_value(raw.object)?)),
		"BOOKMARK" => {
			let marker: BookmarkObject = serde_json::from_value(raw.object)?;

			Ok(WatchEvent::Bookmark { resource_version: marker.metadata.resource_version })
		},
		"ERROR" => {
			let status: StatusObject = serde_json::from_value(raw.object)?;

			if status.code == Some(StatusCode::GONE.as_u16()) {
				Err(Error::Gone)
			} else {
				Err(Error::UpstreamUnavailable(format!(
					"watch error {}: {}",
					status.code.unwrap_or_default(),
					status.message.unwrap_or_default()
				)))
			}
		},
		other => Err(Error::Validation {
			field: "watch.type",
			reason: format!("Unknown watch event type '{other}'."),
		}),
	}
}

#[derive(Debug, Deserialize)]
#[serde(bound = "S: DeserializeOwned")]
struct ResourceList<S> {
	#[serde(default)]
	metadata: ListMeta,
	#[serde(default = "Vec::new")]
	items: Vec<Item<S>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
	#[serde(default)]
	resource_version: Option<String>,
	#[serde(default, rename = "continue")]
	continue_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
	#[serde(rename = "type")]
	kind: String,
	object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BookmarkObject {
	metadata: BookmarkMeta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookmarkMeta {
	resource_version: String,
}

#[derive(Debug, Deserialize)]
struct StatusObject {
	#[serde(default)]
	code: Option<u16>,
	#[serde(default)]
	message: Option<String>,
}
