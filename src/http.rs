//! HTTP plumbing shared by the identity-provider and resource-store adapters.

pub mod client;
pub mod retry;
