//! Outbound messaging abstraction.

pub mod webhook;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::oracle::MessageKind;
use crate::Result;

/// Context sent alongside a message for the transport's records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyMetadata {
    /// Task the message is about.
    pub task_id: String,
    /// Property the task belongs to.
    pub property_id: String,
    /// What the message is.
    pub kind: MessageKind,
}

/// Transport acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyReceipt {
    /// Transport message id; replies may reference it.
    pub transport_id: String,
}

/// Delivers messages to guests, staff and hosts.
pub trait Notifier: Send + Sync {
    /// Send `body` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`](crate::AppError::Transport) or
    /// [`AppError::Timeout`](crate::AppError::Timeout) if delivery fails.
    fn send<'a>(
        &'a self,
        to: &'a str,
        body: &'a str,
        metadata: &'a NotifyMetadata,
    ) -> Pin<Box<dyn Future<Output = Result<NotifyReceipt>> + Send + 'a>>;
}
