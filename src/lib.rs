//! Gatekeeper - HTTP admission control
//!
//! This crate decides, per inbound request, whether the request may reach the
//! application or is rejected with a rate-limit error. Requests are counted in
//! fixed one-second windows per client identity (API token or source IP), and
//! an identity that exceeds its limit is blocked outright for a configured
//! duration. Counters and blocks live in a pluggable store, either in process
//! memory or in Redis.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod storage;
