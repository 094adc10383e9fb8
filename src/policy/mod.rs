//! Rate limit policies: model, resolution, sources and caching.

mod cache;
mod model;
mod resolver;
mod source;

pub use cache::PolicyCache;
pub use model::{AlgorithmKind, RateLimitPolicy, Specificity};
pub use resolver::{PolicyResolver, ResolutionKey};
pub use source::{FilePolicySource, PolicyDocument, PolicySource, StaticPolicySource};
