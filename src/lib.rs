//! marge-bot - a merge bot for GitLab
//!
//! Merge requests assigned to the bot are checked against merge policy,
//! rebased (or merged) onto their target in a local working copy, pushed,
//! tested by CI and accepted through the API, one at a time or in batches
//! that share a single pipeline.
//!
//! The library is split into:
//! - [`platform`]: the hosting service (GitLab REST)
//! - [`git`]: the local working copy
//! - [`merge`]: gate, fuse, solo and batch jobs, and the cycle driver
//! - [`config`]: bot configuration

pub mod config;
pub mod error;
pub mod git;
pub mod merge;
pub mod platform;
pub mod types;

pub use error::{Error, Result};
