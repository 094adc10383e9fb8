//! Quotaguard - Distributed Rate Limiting Decision Engine
//!
//! Decides, per request, whether a client may proceed under the most specific
//! applicable policy. Counters live in a shared store (Redis in production)
//! and are only touched through atomic primitives, so any number of engine
//! instances can enforce the same quota without coordinating with each other.

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod ratelimit;
pub mod store;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use ratelimit::{CheckRequest, CheckResponse, RateLimitChecker};
