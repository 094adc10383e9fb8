//! Admission algorithms and the decision path built on them.

mod algorithm;
mod checker;
mod fixed_window;
mod key;
mod leaky_bucket;
mod response;
mod sliding_window;
mod token_bucket;

pub use algorithm::{strategy_for, EvaluationResult, RateLimitAlgorithm};
pub use checker::RateLimitChecker;
pub use fixed_window::FixedWindow;
pub use key::CounterKey;
pub use leaky_bucket::LeakyBucket;
pub use response::{CheckRequest, CheckResponse, WarningLevel};
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;
