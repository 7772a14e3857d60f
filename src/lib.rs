//! # tieba-reviewer
//!
//! tieba-reviewer is a rule-driven content review service. Scraped forum
//! content (threads, posts and comments) arrives on partitioned Redis
//! streams, one stream per forum (`fid`). Each partition is consumed by a
//! worker that evaluates the forum's review rules against every entry and
//! publishes one result per matching rule to an action stream.
//!
//! ## Architecture Overview
//!
//! ### Rules
//! - A rule is a tree of field or function conditions joined by group logic
//!   (AND, OR, NOT, XOR and their negations), plus a priority and actions.
//! - Rules are loaded from PostgreSQL and validated once, then installed as
//!   an immutable per-partition snapshot.
//!
//! ### Matching
//! - Conditions address content fields by dot path (`author.level`) or call
//!   named functions, resolved locally, remotely, or locally with remote
//!   fallback.
//! - A failing function never fails the event, it only fails its condition.
//!
//! ### Workers
//! - One worker per partition with rules: read, match, dispatch, acknowledge.
//! - Entries are acknowledged only after every result was published, so a
//!   crash leads to redelivery, never loss.
//! - Entries that keep failing are dead-lettered after a bounded number of
//!   attempts.
//!
//! ### Hot reload
//! - Rule changes are announced over Redis pub/sub and repaired by a periodic
//!   full sync, so a missed notification only delays a change.
//!
//! ## Error Handling
//!
//! All error strings use the format: `error-reviewer-<domain>-<number> <message>: <details>`
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tieba_reviewer::engine::RuleMatcher;
//! use tieba_reviewer::functions::{FunctionProvider, FunctionRegistry, LocalProvider, builtin};
//!
//! let registry = builtin::register_builtins(FunctionRegistry::new());
//! let provider = FunctionProvider::Local(LocalProvider::new(
//!     Arc::new(registry),
//!     std::time::Duration::from_secs(3),
//! ));
//! let matcher = RuleMatcher::new(Arc::new(provider));
//! let outcome = matcher.match_rules(&event, snapshot.rules()).await;
//! ```

/// Configuration loaded from environment variables.
pub mod config;

/// Normalized thread, post and comment events with dot-path field access.
pub mod content;

/// Review result payloads, dead-letter records and publication with retry.
pub mod dispatcher;

/// Rule tree evaluation and operator semantics.
pub mod engine;

pub mod errors;

/// Named predicate functions and the local, remote and hybrid providers
/// that resolve them.
pub mod functions;

/// Metrics publishing with no-op and StatsD backends.
pub mod metrics;

/// Rule storage and reload notifications.
pub mod repository;

/// Rule model, load-time validation and per-partition snapshots.
pub mod rules;

/// Wire formats of input entries and output records.
pub mod serialization;

/// Review workers, the worker manager and task spawning helpers.
pub mod tasks;

/// Consumer-group input logs and append-only output sinks.
pub mod transport;

#[cfg(test)]
pub mod test_helpers;
