//! Token buckets, the sharded bucket registry, and endpoint overrides.

mod bucket;
mod key;
mod registry;
mod rules;

pub use bucket::{Acquire, Limit, TokenBucket};
pub use key::BucketKey;
pub use registry::BucketRegistry;
pub use rules::{EndpointRule, EndpointRules, PathPattern};
