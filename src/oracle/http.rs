//! HTTP decision oracle client.

use std::future::Future;
use std::pin::Pin;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OracleConfig;
use crate::{AppError, Result};

use super::{ComposeContext, DecisionOracle, MessageKind, TriageRequest, TriageVerdict};

/// Oracle reached over JSON HTTP.
///
/// Posts to `{base_url}/triage`, `{base_url}/requirement-satisfied` and
/// `{base_url}/compose`.
pub struct HttpOracle {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Serialize)]
struct SatisfiedRequest<'a> {
    requirements: &'a str,
    thread: &'a str,
}

#[derive(Deserialize)]
struct SatisfiedResponse {
    satisfied: bool,
}

#[derive(Serialize)]
struct ComposeRequest<'a> {
    kind: MessageKind,
    context: &'a ComposeContext,
}

#[derive(Deserialize)]
struct ComposeResponse {
    message: String,
}

impl HttpOracle {
    /// Build a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|err| AppError::Config(format!("failed to build oracle client: {err}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}/{path}", self.base_url);
        debug!(%url, "oracle request");

        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(oracle_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Oracle(format!("{path} returned {status}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| AppError::Oracle(format!("{path} returned an unusable body: {err}")))
    }
}

/// Keep timeouts distinct; everything else is an oracle failure.
fn oracle_error(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::Timeout(format!("oracle: {err}"))
    } else {
        AppError::Oracle(err.to_string())
    }
}

impl DecisionOracle for HttpOracle {
    fn triage<'a>(
        &'a self,
        request: &'a TriageRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TriageVerdict>> + Send + 'a>> {
        Box::pin(async move { self.post("triage", request).await })
    }

    fn requirement_satisfied<'a>(
        &'a self,
        requirements: &'a str,
        thread: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let body = SatisfiedRequest {
                requirements,
                thread,
            };
            let response: SatisfiedResponse = self.post("requirement-satisfied", &body).await?;
            Ok(response.satisfied)
        })
    }

    fn compose_message<'a>(
        &'a self,
        kind: MessageKind,
        context: &'a ComposeContext,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let response: ComposeResponse =
                self.post("compose", &ComposeRequest { kind, context }).await?;
            let message = response.message.trim().to_owned();
            if message.is_empty() {
                return Err(AppError::Oracle(format!("compose returned an empty {kind:?} message")));
            }
            Ok(message)
        })
    }
}
