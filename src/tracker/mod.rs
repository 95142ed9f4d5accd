//! Repository inspection through libgit2.

pub mod git;

pub use git::{Freshness, GitTracker, STALE_THRESHOLD};
