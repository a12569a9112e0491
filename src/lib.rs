//! Gatekeeper - Request Admission Control
//!
//! Decides, per incoming HTTP request, whether to admit or reject it. Token
//! buckets enforce global, per-IP, and per-endpoint rates; an IP reputation
//! overlay (whitelist, blacklist, temporary bans) short-circuits the buckets,
//! and repeated rate-limit violations promote an IP to a temporary ban.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod ratelimit;
pub mod security;
