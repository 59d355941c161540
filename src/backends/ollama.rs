// Ollama backend - local inference over HTTP

use super::{BackendKind, CompletionRequest, ExtractionBackend, PROBE_TIMEOUT};
use crate::config::OllamaSection;
use crate::error::BackendError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    #[serde(default)]
    name: String,
}

impl OllamaBackend {
    pub fn new(config: &OllamaSection) -> Self {
        OllamaBackend {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Base model name without the tag ("llama3.2:latest" → "llama3.2")
    fn base_name(model: &str) -> &str {
        model.split(':').next().unwrap_or(model)
    }

    async fn installed_models(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Api {
                backend: "Ollama".to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let tags: TagsResponse = response.json().await?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| Self::base_name(&m.name).to_string())
            .collect())
    }
}

#[async_trait]
impl ExtractionBackend for OllamaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let mut payload = json!({
            "model": self.model,
            "messages": request.messages,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        });
        if request.json_mode {
            payload["format"] = json!("json");
        }

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Api {
                backend: "Ollama".to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: ChatResponse = response.json().await?;
        Ok(body.message.map(|m| m.content).unwrap_or_default())
    }

    async fn is_available(&self) -> bool {
        match self.installed_models().await {
            Ok(models) => {
                let wanted = Self::base_name(&self.model);
                let found = models.iter().any(|m| m == wanted);
                if !found {
                    debug!(model = %self.model, available = ?models, "Model not pulled; run `ollama pull`");
                }
                found
            }
            Err(e) => {
                debug!(error = %e, "Ollama not reachable");
                false
            }
        }
    }
}
