//! Token-bucket state, background maintenance and lifecycle.

mod client_key;
mod clock;
mod events;
mod limiter;
mod tasks;

pub use client_key::ClientKey;
pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{
    LimiterAction, LimiterEvent, LimiterObserver, NoopObserver, RecordingObserver, TracingObserver,
};
pub use limiter::{
    Admission, LimiterConfig, LimiterState, RateLimiter, RateLimiterBuilder, RejectReason, TokenUse,
};
