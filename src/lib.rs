//! Tollgate - Per-Client Token-Bucket Rate Limiting
//!
//! This crate keeps a bounded token count per client key in a concurrent
//! map. Callers grant and spend tokens on the request path while background
//! tasks refill quiet clients, evict idle ones and signal when the limiter
//! has nothing left to track.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{LimiterError, Result};
pub use ratelimit::{Admission, ClientKey, LimiterConfig, RateLimiter, RejectReason, TokenUse};
