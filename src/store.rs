//! Resource store seam: list + watch over custom resources.

pub mod kube;
pub mod resources;

// std
use std::collections::BTreeMap;
// crates.io
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Change feed returned by [`ResourceStore::watch`].
pub type WatchStream<S> = BoxStream<'static, Result<WatchEvent<S>>>;

/// Subset of object metadata the reconciler relies on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
	/// Object name; unique per resource type within the namespace.
	pub name: String,
	/// Opaque store version marker.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resource_version: Option<String>,
	/// Free-form annotations.
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub annotations: BTreeMap<String, String>,
}

/// One stored resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item<S> {
	/// Object metadata.
	pub metadata: ObjectMeta,
	/// Type-specific specification.
	pub spec: S,
}
impl<S> Item<S> {
	/// Construct an item with the given name and spec.
	pub fn new(name: impl Into<String>, spec: S) -> Self {
		Self { metadata: ObjectMeta { name: name.into(), ..Default::default() }, spec }
	}

	/// Attach a version marker.
	pub fn with_resource_version(mut self, resource_version: impl Into<String>) -> Self {
		self.metadata.resource_version = Some(resource_version.into());

		self
	}

	/// Object name.
	pub fn name(&self) -> &str {
		&self.metadata.name
	}
}

/// One change delivered by the store's change feed.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<S> {
	/// Resource created.
	Added(Item<S>),
	/// Resource updated.
	Modified(Item<S>),
	/// Resource removed; carries the last known state.
	Deleted(Item<S>),
	/// Progress marker without a resource change.
	Bookmark {
		/// Marker to resume from.
		resource_version: String,
	},
}
impl<S> WatchEvent<S> {
	/// Marker carried by the event, if any.
	pub fn resource_version(&self) -> Option<&str> {
		match self {
			Self::Added(item) | Self::Modified(item) | Self::Deleted(item) =>
				item.metadata.resource_version.as_deref(),
			Self::Bookmark { resource_version } => Some(resource_version),
		}
	}

	/// Event type label used in logs and metrics.
	pub fn label(&self) -> &'static str {
		match self {
			Self::Added(_) => "added",
			Self::Modified(_) => "modified",
			Self::Deleted(_) => "deleted",
			Self::Bookmark { .. } => "bookmark",
		}
	}
}

/// Result of a full list.
#[derive(Clone, Debug, PartialEq)]
pub struct ListPage<S> {
	/// Every item currently stored.
	pub items: Vec<Item<S>>,
	/// Marker to start watching from.
	pub resource_version: Option<String>,
}

/// Source of resources of one type.
#[async_trait]
pub trait ResourceStore<S>: Send + Sync {
	/// List every resource.
	async fn list(&self) -> Result<ListPage<S>>;

	/// Stream changes after the given marker.
	///
	/// A marker the store no longer retains fails with [`Error::Gone`], either here or as the
	/// first stream item.
	async fn watch(&self, from: &str) -> Result<WatchStream<S>>;
}
