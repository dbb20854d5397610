//! Credential lifecycle and resource-authorization synchronization for cluster-managed
//! resources: service-token refresh, offline-token exchange, bearer verification with key
//! rotation, watcher-driven role reconciliation, and session token-pair refresh.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod http;
pub mod identity;
pub mod metrics;
pub mod reconcile;
pub mod security;
pub mod service;
pub mod session;
pub mod store;
pub mod token;
pub mod verify;

mod error;
mod _prelude {
	pub use std::{
		sync::Arc,
		time::{Duration, SystemTime},
	};

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

pub use crate::{
	auth::{Authenticator, Principal, Role},
	cache::manager::{CacheInvalidator, ResourceCache, ResourceKey},
	config::{
		Backoff, IdentityConfig, JitterStrategy, RefreshConfig, RetryPolicy, SessionConfig,
		StoreConfig, SyncConfig,
	},
	error::{Error, Result},
	identity::{IdentityProvider, RoleDirectory, RoleOutcome, TokenGrant},
	reconcile::{
		reconcilable::{Datasets, Images, InstanceTypes, Reconcilable, RoleNaming},
		supervisor::ReconciliationSupervisor,
		watcher::{ResourceWatcher, WatcherState},
	},
	service::Services,
	session::{
		issuer::TokenPairIssuer,
		refresher::{ExchangeState, SessionRefresher, TickOutcome},
	},
	store::{Item, ListPage, ObjectMeta, ResourceStore, WatchEvent},
	token::{
		exchange::OfflineTokenExchangeCache,
		service::{ServiceToken, ServiceTokenHandle, ServiceTokenSyncer},
	},
	verify::{Claims, SigningKeySet, SigningKeyVerifier},
};
#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
