//! JSON-over-HTTP client shared by the ledger, directory and schedule
//!
//! Every request carries the service timeout. Reads are retried on
//! connectivity failures; writes are retried only when the request provably
//! never left this host (connect failure).

use crate::infra::retry::RetryPolicy;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Typed failure of an external collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("not found")]
    NotFound,
    #[error("version conflict")]
    Conflict,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// A write was sent but no answer came back; it may or may not have landed
    #[error("outcome unknown: {0}")]
    OutcomeUnknown(String),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl CollaboratorError {
    #[inline]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CollaboratorError::Unavailable(_))
    }
}

pub struct RestClient {
    service: &'static str,
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl RestClient {
    pub fn new(
        service: &'static str,
        base_url: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Unexpected(e.to_string()))?;
        Ok(Self {
            service,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET a JSON document, retrying connectivity failures
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, CollaboratorError> {
        let url = self.url(path);
        self.retry
            .retry_if(
                |attempt| {
                    let request = self.client.get(&url).query(query);
                    let url = &url;
                    async move {
                        let result = match request.send().await {
                            Ok(response) => decode(response).await,
                            Err(e) => Err(CollaboratorError::Unavailable(e.to_string())),
                        };
                        if let Err(ref e) = result {
                            if e.is_unavailable() {
                                warn!(
                                    service = %self.service,
                                    url = %url,
                                    attempt = %attempt,
                                    error = %e,
                                    "collaborator_request_failed"
                                );
                            }
                        }
                        result
                    }
                },
                CollaboratorError::is_unavailable,
            )
            .await
    }

    /// POST a JSON body. A timeout after sending is `OutcomeUnknown`.
    pub async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CollaboratorError> {
        let url = self.url(path);
        self.retry
            .retry_if(
                |attempt| {
                    let request = self.client.post(&url).json(body);
                    let url = &url;
                    async move {
                        let result = match request.send().await {
                            Ok(response) => match decode(response).await {
                                Err(CollaboratorError::Unavailable(msg)) => {
                                    Err(CollaboratorError::OutcomeUnknown(msg))
                                }
                                other => other,
                            },
                            Err(e) if e.is_connect() => {
                                Err(CollaboratorError::Unavailable(e.to_string()))
                            }
                            Err(e) => Err(CollaboratorError::OutcomeUnknown(e.to_string())),
                        };
                        if let Err(ref e) = result {
                            warn!(
                                service = %self.service,
                                url = %url,
                                attempt = %attempt,
                                error = %e,
                                "collaborator_write_failed"
                            );
                        }
                        result
                    }
                },
                CollaboratorError::is_unavailable,
            )
            .await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CollaboratorError> {
    let status = response.status();
    if !status.is_success() {
        return Err(match status {
            StatusCode::NOT_FOUND => CollaboratorError::NotFound,
            StatusCode::CONFLICT => CollaboratorError::Conflict,
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                CollaboratorError::Unavailable(format!("status {}", s.as_u16()))
            }
            s => CollaboratorError::Unexpected(format!("status {}", s.as_u16())),
        });
    }
    response.json::<T>().await.map_err(|e| CollaboratorError::Unexpected(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let client =
            RestClient::new("ledger", "http://ledger:8089/", Duration::from_secs(1), RetryPolicy::none())
                .unwrap();
        assert_eq!(client.url("/ledger_items"), "http://ledger:8089/ledger_items");
        assert_eq!(client.url("contacts"), "http://ledger:8089/contacts");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        // Port 9 (discard) is closed on CI hosts; connect fails immediately
        let client = RestClient::new(
            "directory",
            "http://127.0.0.1:9",
            Duration::from_millis(500),
            RetryPolicy::new(2, 1, 1, 0.0),
        )
        .unwrap();
        let result: Result<Vec<serde_json::Value>, _> = client.get_json("contacts", &[]).await;
        assert!(matches!(result, Err(CollaboratorError::Unavailable(_))));
    }
}
