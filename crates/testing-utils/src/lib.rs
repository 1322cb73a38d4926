//! Test helpers shared across crates
//!
//! Fluent builders for domain entities and a bounded polling helper
//! for integration tests that wait on asynchronous state changes.

pub mod builders;
pub mod helpers;

pub use builders::{JobBuilder, TaskBuilder};
pub use helpers::wait_until;
