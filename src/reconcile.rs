//! Resource reconciliation: per-type rules, watchers, and their supervisor.

pub mod reconcilable;
pub mod supervisor;
pub mod watcher;
