//! Read-through resource caches kept consistent by watcher-driven invalidation.

pub mod manager;
pub mod state;
