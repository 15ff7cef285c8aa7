// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ReelHub API Library
//!
//! HTTP surface for creator billing: enrollment, grace period and
//! commission management, storage blocks and purchases, the video
//! lifecycle, payment webhooks and operator tooling.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, StoreBackend};
pub use error::{ApiError, ApiResult};
pub use state::AppState;
