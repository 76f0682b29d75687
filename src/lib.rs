//! Quotagate - HTTP Rate Limiting Middleware
//!
//! This crate decides, for each incoming HTTP request, whether it may proceed
//! under a configurable, ordered list of per-method, per-path rate rules.
//! Requests are counted in fixed time windows in a shared store (Redis), so
//! every instance of the protected application enforces the same quota.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
