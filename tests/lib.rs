//! Integration test support for Courier.
//!
//! Shared fixtures used by the integration and property test targets.

pub mod fixtures;
