//! Screen-facing behaviors. Each service takes the acting user as an
//! explicit parameter instead of reading ambient session state, so every
//! one of them is testable in isolation against the mock backend.

/// Placeholder shown when a referenced author no longer resolves.
pub(crate) const ANONYMOUS: &str = "Anonymous";

pub mod accounts;
pub mod comments;
pub mod engagement;
pub mod feed;
pub mod likers;
pub mod messaging;
pub mod posts;
