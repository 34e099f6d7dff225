//! Shared test fixtures for the workspace.
//!
//! Provides single, shared instances of testcontainers across all test
//! files (PostgreSQL on 5432, Redis on 6379). Each fixture is lazily
//! initialized once per test process and cleaned up when the process exits.
//! Fixtures return `None` when Docker is unavailable so tests can skip.

mod fixtures;

pub use fixtures::*;
