#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ReelHub Shared Types
//!
//! Types and helpers used by every ReelHub crate: platform roles and the
//! Postgres pool/migration bootstrap.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{ParseRoleError, Role};
