//! Specifications of the custom resources under reconciliation.

// std
use std::collections::BTreeMap;
// crates.io
use serde::{Deserialize, Serialize};

/// Dataset type whose grants may carry write access.
pub const PERSISTENT_VOLUME_TYPE: &str = "pv";
/// Access value granting the dataset to every user.
pub const ACCESS_EVERYONE: &str = "everyone";
/// Access value treated like [`ACCESS_EVERYONE`] for default grants.
pub const ACCESS_ADMIN: &str = "admin";

/// Dataset custom resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSpec {
	/// Display name; falls back to the object name.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
	/// Free-form description.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	/// Storage type (`pv`, `git`, `env`, ...).
	#[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	/// Default access level; absent means everyone.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub access: Option<String>,
	/// Source location for URL-backed datasets.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
	/// Environment variables for `env` datasets.
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub variables: BTreeMap<String, String>,
}
impl DatasetSpec {
	/// Effective access level.
	pub fn access(&self) -> &str {
		self.access.as_deref().unwrap_or(ACCESS_EVERYONE)
	}

	/// Whether the dataset is backed by a persistent volume.
	pub fn is_persistent_volume(&self) -> bool {
		self.kind.as_deref() == Some(PERSISTENT_VOLUME_TYPE)
	}
}

/// Container image custom resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
	/// Display name.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
	/// Free-form description.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	/// Image reference.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
	/// Image reference used on GPU nodes.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url_for_gpu: Option<String>,
	/// Accelerator type (`cpu`, `gpu`, `both`).
	#[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
}

/// Instance type custom resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeSpec {
	/// Display name.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
	/// Free-form description.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	/// Resource limits keyed by resource name (`cpu`, `memory`, `nvidia.com/gpu`).
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub limits: BTreeMap<String, serde_json::Value>,
	/// Resource requests keyed by resource name.
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub requests: BTreeMap<String, serde_json::Value>,
}
