//! Service-token maintenance and offline-token exchange.

pub mod exchange;
pub mod service;
