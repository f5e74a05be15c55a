//! Mock implementations for testing.
//!
//! This module provides an in-memory implementation of the store capability
//! for use in unit and integration tests.

pub mod store;

pub use store::InMemoryKeyValueStore;
