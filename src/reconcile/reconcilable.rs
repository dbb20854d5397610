//! Per-type reconciliation rules: role naming, default grants, and grant migration.

// self
use crate::store::{
	Item,
	resources::{ACCESS_ADMIN, ACCESS_EVERYONE, DatasetSpec, ImageSpec, InstanceTypeSpec},
};

/// Kind prefix of dataset roles.
pub const DATASET_PREFIX: &str = "ds";
/// Kind prefix of image roles.
pub const IMAGE_PREFIX: &str = "img";
/// Kind prefix of instance-type roles.
pub const INSTANCE_TYPE_PREFIX: &str = "it";
/// Marker inserted in front of the kind prefix of elevated roles.
pub const ELEVATED_MARKER: &str = "rw";

/// Builds role names, optionally namespaced by a deployment prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleNaming {
	prefix: Option<String>,
}
impl RoleNaming {
	/// Naming with an optional deployment prefix.
	pub fn new(prefix: Option<String>) -> Self {
		Self { prefix: prefix.filter(|prefix| !prefix.is_empty()) }
	}

	/// `[prefix:]{kind}:{id}`.
	pub fn base(&self, kind_prefix: &str, id: &str) -> String {
		self.join(&[kind_prefix, id])
	}

	/// `[prefix:]rw:{kind}:{id}`.
	pub fn elevated(&self, kind_prefix: &str, id: &str) -> String {
		self.join(&[ELEVATED_MARKER, kind_prefix, id])
	}

	fn join(&self, parts: &[&str]) -> String {
		let mut name = String::new();

		if let Some(prefix) = &self.prefix {
			name.push_str(prefix);
			name.push(':');
		}

		name.push_str(&parts.join(":"));

		name
	}
}

/// Uniform reconciliation rules for one resource type.
pub trait Reconcilable: Send + Sync + 'static {
	/// Resource specification type.
	type Spec: Clone + Send + Sync + 'static;

	/// Human-readable type name used in logs and metrics.
	fn kind(&self) -> &'static str;

	/// Role-name prefix for this type.
	fn kind_prefix(&self) -> &'static str;

	/// Role naming shared by every type in a deployment.
	fn naming(&self) -> &RoleNaming;

	/// Group that must never be touched by grant migration.
	fn everyone_group(&self) -> &str;

	/// Id of the resource; the object name unless a type overrides it.
	///
	/// The paired cache must be built with [`crate::ResourceCache::keyed`] over the same
	/// function when a type overrides it.
	fn resource_key(&self, item: &Item<Self::Spec>) -> String {
		item.metadata.name.clone()
	}

	/// Whether the type has an elevated (write) role next to the base role.
	fn supports_elevated(&self) -> bool {
		false
	}

	/// Groups that receive the base role when the role is first created.
	fn default_grants(&self, item: &Item<Self::Spec>) -> Vec<String>;

	/// Whether moving from `old` to `new` requires migrating elevated grants to the base role.
	fn requires_migration(&self, _old: &Item<Self::Spec>, _new: &Item<Self::Spec>) -> bool {
		false
	}

	/// Base role name of `item`.
	fn role_name(&self, item: &Item<Self::Spec>) -> String {
		self.naming().base(self.kind_prefix(), &self.resource_key(item))
	}

	/// Elevated role name of `item`, for types that support one.
	fn elevated_role_name(&self, item: &Item<Self::Spec>) -> Option<String> {
		self.supports_elevated()
			.then(|| self.naming().elevated(self.kind_prefix(), &self.resource_key(item)))
	}
}

/// Datasets: access-driven default grants and an elevated role for volumes.
#[derive(Clone, Debug)]
pub struct Datasets {
	naming: RoleNaming,
	everyone_group: String,
}
impl Datasets {
	/// Rules for datasets.
	pub fn new(naming: RoleNaming, everyone_group: impl Into<String>) -> Self {
		Self { naming, everyone_group: everyone_group.into() }
	}
}
impl Reconcilable for Datasets {
	type Spec = DatasetSpec;

	fn kind(&self) -> &'static str {
		"dataset"
	}

	fn kind_prefix(&self) -> &'static str {
		DATASET_PREFIX
	}

	fn naming(&self) -> &RoleNaming {
		&self.naming
	}

	fn everyone_group(&self) -> &str {
		&self.everyone_group
	}

	fn supports_elevated(&self) -> bool {
		true
	}

	fn default_grants(&self, item: &Item<DatasetSpec>) -> Vec<String> {
		match item.spec.access() {
			ACCESS_EVERYONE | ACCESS_ADMIN => vec![self.everyone_group.clone()],
			_ => Vec::new(),
		}
	}

	fn requires_migration(&self, old: &Item<DatasetSpec>, new: &Item<DatasetSpec>) -> bool {
		old.spec.is_persistent_volume() && !new.spec.is_persistent_volume()
	}
}

/// Images: always granted to everyone.
#[derive(Clone, Debug)]
pub struct Images {
	naming: RoleNaming,
	everyone_group: String,
}
impl Images {
	/// Rules for images.
	pub fn new(naming: RoleNaming, everyone_group: impl Into<String>) -> Self {
		Self { naming, everyone_group: everyone_group.into() }
	}
}
impl Reconcilable for Images {
	type Spec = ImageSpec;

	fn kind(&self) -> &'static str {
		"image"
	}

	fn kind_prefix(&self) -> &'static str {
		IMAGE_PREFIX
	}

	fn naming(&self) -> &RoleNaming {
		&self.naming
	}

	fn everyone_group(&self) -> &str {
		&self.everyone_group
	}

	fn default_grants(&self, _: &Item<ImageSpec>) -> Vec<String> {
		vec![self.everyone_group.clone()]
	}
}

/// Instance types: always granted to everyone.
#[derive(Clone, Debug)]
pub struct InstanceTypes {
	naming: RoleNaming,
	everyone_group: String,
}
impl InstanceTypes {
	/// Rules for instance types.
	pub fn new(naming: RoleNaming, everyone_group: impl Into<String>) -> Self {
		Self { naming, everyone_group: everyone_group.into() }
	}
}
impl Reconcilable for InstanceTypes {
	type Spec = InstanceTypeSpec;

	fn kind(&self) -> &'static str {
		"instance_type"
	}

	fn kind_prefix(&self) -> &'static str {
		INSTANCE_TYPE_PREFIX
	}

	fn naming(&self) -> &RoleNaming {
		&self.naming
	}

	fn everyone_group(&self) -> &str {
		&self.everyone_group
	}

	fn default_grants(&self, _: &Item<InstanceTypeSpec>) -> Vec<String> {
		vec![self.everyone_group.clone()]
	}
}
