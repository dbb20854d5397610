//! Cache state machine for one resource type.

// std
use std::collections::HashMap;
// self
use crate::{_prelude::*, store::Item};

/// Immutable result of one full list.
#[derive(Debug)]
pub struct Snapshot<S> {
	/// Items keyed by resource id.
	pub items: HashMap<String, Arc<Item<S>>>,
	/// Store marker the list was taken at.
	pub resource_version: Option<String>,
	/// Wall-clock time of the list.
	pub fetched_at: DateTime<Utc>,
}
impl<S> Snapshot<S> {
	/// Index listed items by the id `key` derives.
	pub fn new(
		items: Vec<Item<S>>,
		resource_version: Option<String>,
		key: &dyn Fn(&Item<S>) -> String,
	) -> Self {
		let items = items.into_iter().map(|item| (key(&item), Arc::new(item))).collect();

		Self { items, resource_version, fetched_at: Utc::now() }
	}

	/// Items sorted by id.
	pub fn sorted(&self) -> Vec<Arc<Item<S>>> {
		let mut items = self.items.iter().collect::<Vec<_>>();

		items.sort_by(|(a, _), (b, _)| a.cmp(b));

		items.into_iter().map(|(_, item)| item.clone()).collect()
	}
}

/// Cache lifecycle states.
#[derive(Debug)]
pub enum CacheState<S> {
	/// Nothing loaded yet.
	Empty,
	/// Snapshot is authoritative until the next invalidation.
	Ready(Arc<Snapshot<S>>),
	/// Snapshot was invalidated; it is only served when a reload fails.
	Invalid(Arc<Snapshot<S>>),
}
impl<S> CacheState<S> {
	/// Retrieve the current snapshot regardless of validity.
	pub fn snapshot(&self) -> Option<&Arc<Snapshot<S>>> {
		match self {
			Self::Ready(snapshot) | Self::Invalid(snapshot) => Some(snapshot),
			Self::Empty => None,
		}
	}

	/// Whether the snapshot may be served without consulting the store.
	pub fn is_valid(&self) -> bool {
		matches!(self, Self::Ready(_))
	}

	/// Demote a ready snapshot to invalid.
	pub fn invalidate(&mut self) {
		if let Self::Ready(snapshot) = self {
			*self = Self::Invalid(snapshot.clone());
		}
	}
}
