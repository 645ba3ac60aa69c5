//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Recording lookup and sink collaborators
//! - Registry event helpers

pub mod containers;
pub mod mock_collaborators;

#[allow(unused_imports)]
pub use containers::*;
pub use mock_collaborators::*;
