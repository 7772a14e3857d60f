//! Rule matching engine.
//!
//! [`matcher::RuleMatcher`] walks rule trees against content events and
//! [`operators`] defines what each condition operator means.

pub mod matcher;
pub mod operators;

pub use matcher::{MatchOutcome, ReviewMatch, RuleMatcher, Verdict};
