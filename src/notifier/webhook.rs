//! Webhook delivery transport.

use std::future::Future;
use std::pin::Pin;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::NotifierConfig;
use crate::{AppError, Result};

use super::{Notifier, NotifyMetadata, NotifyReceipt};

/// Posts `{to, from, body, metadata}` to a delivery endpoint.
pub struct WebhookNotifier {
    endpoint: String,
    sender_address: String,
    token: String,
    client: Client,
}

#[derive(Serialize)]
struct DeliveryRequest<'a> {
    to: &'a str,
    from: &'a str,
    body: &'a str,
    metadata: &'a NotifyMetadata,
}

#[derive(Deserialize)]
struct DeliveryResponse {
    #[serde(default, alias = "id", alias = "message_id")]
    transport_id: Option<String>,
}

impl WebhookNotifier {
    /// Build a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &NotifierConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|err| AppError::Config(format!("failed to build notifier client: {err}")))?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            sender_address: config.sender_address.clone(),
            token: config.token.clone(),
            client,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn send<'a>(
        &'a self,
        to: &'a str,
        body: &'a str,
        metadata: &'a NotifyMetadata,
    ) -> Pin<Box<dyn Future<Output = Result<NotifyReceipt>> + Send + 'a>> {
        Box::pin(async move {
            let request = DeliveryRequest {
                to,
                from: &self.sender_address,
                body,
                metadata,
            };

            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.token)
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(AppError::Transport(format!(
                    "delivery endpoint returned {status}"
                )));
            }

            // Some transports acknowledge without an id; synthesize one so the
            // chain still records the send.
            let transport_id = response
                .json::<DeliveryResponse>()
                .await
                .ok()
                .and_then(|r| r.transport_id)
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("local-{}", Uuid::new_v4()));

            debug!(task_id = %metadata.task_id, %transport_id, "message delivered");
            Ok(NotifyReceipt { transport_id })
        })
    }
}
