//! Category and reply-wording policy.
//!
//! Both policies are compiled once from configuration and shared
//! read-only across the orchestration components.

pub mod denylist;
pub mod language;
