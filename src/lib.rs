#![forbid(unsafe_code)]

//! `stay-concierge`: guest-service task lifecycle orchestration.
//!
//! Classified guest requests become tasks that are routed to staff or the
//! host, followed through their replies, and closed with a notice to the
//! guest. State lives in `SQLite`; natural-language decisions are delegated
//! to a [`oracle::DecisionOracle`] and delivery to a [`notifier::Notifier`].

pub mod config;
pub mod errors;
pub mod http;
pub mod ipc;
pub mod models;
pub mod notifier;
pub mod oracle;
pub mod orchestrator;
pub mod persistence;
pub mod policy;
pub mod state;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
