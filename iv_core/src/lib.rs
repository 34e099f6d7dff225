//! Shared types for the incident visibility system.

pub mod types;
