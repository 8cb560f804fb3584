//! Client-side data layer for the clovergram app: feed assembly,
//! comment threads, optimistic like/follow engagement, realtime direct
//! messages and account management, over a pluggable document store.
//!
//! [`repositories`] defines the store contracts with a MongoDB
//! implementation and an in-memory one for tests; [`usecases`] holds the
//! screen-facing behaviors on top of them.

pub mod entities;
pub mod media;
pub mod repositories;
pub mod usecases;

pub use repositories::{RepositoryError, Result};
