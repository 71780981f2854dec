#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Tradepost API Library
//!
//! HTTP surface for subscription billing: the Stripe webhook receiver and
//! the operator routes around the webhook receipt log.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
