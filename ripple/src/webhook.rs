//! Delivery of processed events to webhook endpoints.

use std::time::Duration;

use log::info;
use reqwest::StatusCode;

use crate::parser::ProcessedEvent;

/// How long one webhook request may take before it is abandoned.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client that posts events to webhook endpoints as JSON.
pub struct WebhookClient {
    client: reqwest::Client,
    api_key: Option<String>,
}

/// Errors from a single webhook delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The request never produced a response (connect, timeout, ...).
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    /// The endpoint answered with a non-success status.
    #[error("webhook rejected the event ({status}): {body}")]
    Rejected {
        status: StatusCode,
        body: String,
    },
}

impl WebhookClient {
    /// Creates a client, attaching `api_key` as an `X-API-Key` header to
    /// every request when provided.
    pub fn new(api_key: Option<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(WebhookClient { client, api_key })
    }

    /// Posts one event to `endpoint`.
    pub async fn deliver(
        &self,
        endpoint: &str,
        event: &ProcessedEvent,
    ) -> Result<(), DeliveryError> {
        let mut request = self.client.post(endpoint).json(event);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            info!("webhook called successfully: {} -> {endpoint}", event.event_type);
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected { status, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ACTION_ENTITY_UPDATE;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server failed");
        });
        format!("http://{addr}")
    }

    fn sample_event() -> ProcessedEvent {
        ProcessedEvent {
            event_type: ACTION_ENTITY_UPDATE.to_string(),
            id: "abc".to_string(),
            data: json!({"status": "0"}),
        }
    }

    #[tokio::test]
    async fn posts_the_event_as_json() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Value>();
        let app = Router::new().route(
            "/hook",
            post(move |Json(body): Json<Value>| {
                let seen_tx = seen_tx.clone();
                async move {
                    seen_tx.send(body).expect("record request body");
                    "ok"
                }
            }),
        );
        let base = spawn_server(app).await;

        let client = WebhookClient::new(None).expect("build client");
        client
            .deliver(&format!("{base}/hook"), &sample_event())
            .await
            .expect("delivery failed");

        let body = seen_rx.recv().await.expect("no request seen");
        assert_eq!(
            body,
            json!({"type": "entity.update.version", "id": "abc", "data": {"status": "0"}})
        );
    }

    #[tokio::test]
    async fn sends_the_api_key_header() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Option<String>>();
        let app = Router::new().route(
            "/hook",
            post(move |headers: HeaderMap| {
                let seen_tx = seen_tx.clone();
                async move {
                    let key = headers
                        .get("X-API-Key")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    seen_tx.send(key).expect("record api key");
                    "ok"
                }
            }),
        );
        let base = spawn_server(app).await;

        let client = WebhookClient::new(Some("s3cret".to_string())).expect("build client");
        client
            .deliver(&format!("{base}/hook"), &sample_event())
            .await
            .expect("delivery failed");

        assert_eq!(seen_rx.recv().await.flatten().as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let app = Router::new().route(
            "/hook",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = spawn_server(app).await;

        let client = WebhookClient::new(None).expect("build client");
        let err = client
            .deliver(&format!("{base}/hook"), &sample_event())
            .await
            .expect_err("delivery should fail");
        match err {
            DeliveryError::Rejected { status, body } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "boom");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }
}
