//! Integration tests driving the public API against in-memory fakes and mock HTTP servers.

mod adapters;
mod identity;
mod support;
mod watcher;
