// OpenAI backend - cloud chat completions

use super::{BackendKind, CompletionRequest, ExtractionBackend, PROBE_TIMEOUT};
use crate::config::OpenAiSection;
use crate::error::BackendError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    timeout: Duration,
    verify_key: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiBackend {
    pub fn new(config: &OpenAiSection) -> Self {
        OpenAiBackend {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            verify_key: config.verify_key,
        }
    }
}

#[async_trait]
impl ExtractionBackend for OpenAiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAi
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| BackendError::MissingApiKey("OpenAI".to_string()))?;

        let mut payload = json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.json_mode {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Api {
                backend: "OpenAI".to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let completion: ChatCompletion = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::Protocol {
                backend: "OpenAI".to_string(),
                reason: "response has no choices[0].message.content".to_string(),
            })
    }

    async fn is_available(&self) -> bool {
        let api_key = match self.api_key.as_deref() {
            Some(key) => key,
            None => {
                debug!("OpenAI API key not configured (OPENAI_API_KEY)");
                return false;
            }
        };

        if !self.verify_key {
            return true;
        }

        match self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(api_key)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "OpenAI API check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ChatMessage;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::Value;

    const KEY: &str = "sk-test";

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {}", KEY))
            .unwrap_or(false)
    }

    fn fake_openai() -> Router {
        Router::new()
            .route(
                "/models",
                get(|headers: HeaderMap| async move {
                    if authorized(&headers) {
                        StatusCode::OK
                    } else {
                        StatusCode::UNAUTHORIZED
                    }
                }),
            )
            .route(
                "/chat/completions",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    if !authorized(&headers) {
                        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
                    }
                    (
                        StatusCode::OK,
                        Json(json!({"choices": [{"message": {"role": "assistant", "content": body.to_string()}}]})),
                    )
                }),
            )
    }

    fn backend(base_url: &str, api_key: Option<&str>, verify_key: bool) -> OpenAiBackend {
        OpenAiBackend::new(&OpenAiSection {
            api_key: api_key.map(str::to_string),
            base_url: base_url.to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 5,
            verify_key,
        })
    }

    #[tokio::test]
    async fn test_complete_payload() {
        let url = serve(fake_openai()).await;
        let openai = backend(&url, Some(KEY), true);

        let request = CompletionRequest::extraction("rules".to_string(), "statement".to_string());
        let echoed: Value = serde_json::from_str(&openai.complete(&request).await.unwrap()).unwrap();

        assert_eq!(echoed["model"], "gpt-4o-mini");
        assert_eq!(echoed["max_tokens"], 8192);
        assert_eq!(echoed["response_format"]["type"], "json_object");
        assert_eq!(echoed["messages"][1]["role"], "user");
    }

    #[tokio::test]
    async fn test_missing_key() {
        let openai = backend("http://127.0.0.1:1", None, true);
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);

        assert!(matches!(
            openai.complete(&request).await,
            Err(BackendError::MissingApiKey(_))
        ));
        assert!(!openai.is_available().await);
        assert!(!backend("http://127.0.0.1:1", Some("  "), true).is_available().await);
    }

    #[tokio::test]
    async fn test_availability_verifies_key() {
        let url = serve(fake_openai()).await;

        assert!(backend(&url, Some(KEY), true).is_available().await);
        assert!(!backend(&url, Some("sk-wrong"), true).is_available().await);
        // no probe when verification is off
        assert!(backend("http://127.0.0.1:1", Some("sk-wrong"), false).is_available().await);
    }

    #[tokio::test]
    async fn test_rejected_key_is_api_error() {
        let url = serve(fake_openai()).await;
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);

        match backend(&url, Some("sk-wrong"), true).complete(&request).await {
            Err(BackendError::Api { status, .. }) => assert_eq!(status, 401),
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_choices_is_protocol_error() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async { Json(json!({"choices": []})) }),
        );
        let url = serve(app).await;
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);

        assert!(matches!(
            backend(&url, Some(KEY), false).complete(&request).await,
            Err(BackendError::Protocol { .. })
        ));
    }
}
