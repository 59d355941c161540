// 🤖 Extraction backends - polymorphic text-completion services
//
// Three variants behind one trait:
// - Ollama: local inference server
// - OpenAI: cloud chat-completions API
// - Mock: deterministic, offline
//
// Adding a backend = new BackendKind variant + impl ExtractionBackend.
// Selection is a pure function over availability (see `select_backend`).

pub mod mock;
pub mod ollama;
pub mod openai;

pub use mock::MockBackend;
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

use crate::config::Config;
use crate::error::{BackendError, PipelineError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout for availability probes
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// CORE TYPES
// ============================================================================

/// BackendKind - which service produced an extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ollama,
    OpenAi,
    Mock,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Ollama, BackendKind::OpenAi, BackendKind::Mock];

    /// Human-readable name for display (also stored on documents)
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "Ollama",
            BackendKind::OpenAi => "OpenAI",
            BackendKind::Mock => "Mock",
        }
    }

    /// Short code used in config, query strings and the CLI
    pub fn code(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::OpenAi => "openai",
            BackendKind::Mock => "mock",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            BackendKind::Ollama => "Run AI locally on your machine - free, private",
            BackendKind::OpenAi => "Cloud-based AI with high accuracy",
            BackendKind::Mock => "Fake responses for testing - always available",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        matches!(self, BackendKind::OpenAi)
    }

    pub fn setup_steps(&self) -> &'static [&'static str] {
        match self {
            BackendKind::Ollama => &[
                "Install Ollama from https://ollama.ai",
                "Run: ollama pull llama3.2",
                "Ollama runs automatically after install",
            ],
            BackendKind::OpenAi => &[
                "Create account at https://platform.openai.com",
                "Generate API key",
                "Add OPENAI_API_KEY to .env",
            ],
            BackendKind::Mock => &["No setup required"],
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for BackendKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(BackendKind::Ollama),
            "openai" => Ok(BackendKind::OpenAi),
            "mock" => Ok(BackendKind::Mock),
            other => Err(PipelineError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask for JSON output where the backend supports it
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: 0.1,
            max_tokens: 4096,
            json_mode: false,
        }
    }

    /// Statement extraction: low temperature, large budget, JSON output
    pub fn extraction(system: String, user: String) -> Self {
        Self {
            max_tokens: 8192,
            json_mode: true,
            ..Self::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
        }
    }

    pub fn first_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

// ============================================================================
// BACKEND TRAIT
// ============================================================================

/// ExtractionBackend - Core trait
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &str {
        self.kind().name()
    }

    /// Model identifier recorded with each extraction
    fn model(&self) -> &str;

    /// Run a completion and return the raw text output
    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError>;

    /// Quick reachability/configuration probe
    async fn is_available(&self) -> bool;
}

/// Create a backend from config
pub fn create_backend(kind: BackendKind, config: &Config) -> Box<dyn ExtractionBackend> {
    match kind {
        BackendKind::Ollama => Box::new(OllamaBackend::new(&config.ollama)),
        BackendKind::OpenAi => Box::new(OpenAiBackend::new(&config.openai)),
        BackendKind::Mock => Box::new(MockBackend::new()),
    }
}

// ============================================================================
// SELECTION POLICY
// ============================================================================

/// Preference order: requested → configured → Ollama → OpenAI → Mock, without repeats
pub fn fallback_chain(requested: Option<BackendKind>, configured: Option<BackendKind>) -> Vec<BackendKind> {
    let mut chain = Vec::with_capacity(5);
    for kind in requested.into_iter().chain(configured).chain(BackendKind::ALL) {
        if !chain.contains(&kind) {
            chain.push(kind);
        }
    }
    chain
}

/// Pick a backend given what is available.
///
/// An explicit request is honoured or refused, never silently replaced.
pub fn select_backend<F>(
    requested: Option<BackendKind>,
    configured: Option<BackendKind>,
    is_available: F,
) -> Result<BackendKind, PipelineError>
where
    F: Fn(BackendKind) -> bool,
{
    if let Some(kind) = requested {
        return if is_available(kind) {
            Ok(kind)
        } else {
            Err(PipelineError::BackendUnavailable(kind.code().to_string()))
        };
    }

    fallback_chain(None, configured)
        .into_iter()
        .find(|kind| is_available(*kind))
        .ok_or_else(|| PipelineError::BackendUnavailable("any".to_string()))
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Catalog entry returned by `BackendRegistry::describe`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescription {
    pub id: BackendKind,
    pub name: String,
    pub description: String,
    pub model: String,
    pub available: bool,
    pub requires_api_key: bool,
    pub setup_steps: Vec<String>,
}

/// The set of constructed backends plus the configured default
#[derive(Clone)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn ExtractionBackend>>,
    default: Option<BackendKind>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<Arc<dyn ExtractionBackend>>, default: Option<BackendKind>) -> Self {
        Self { backends, default }
    }

    /// One backend of every kind, built from config
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let default = config
            .backend
            .default
            .as_deref()
            .map(str::parse::<BackendKind>)
            .transpose()?;

        let backends = BackendKind::ALL
            .iter()
            .map(|kind| Arc::from(create_backend(*kind, config)))
            .collect();

        Ok(Self::new(backends, default))
    }

    pub fn default_kind(&self) -> Option<BackendKind> {
        self.default
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn ExtractionBackend>> {
        self.backends.iter().find(|b| b.kind() == kind).cloned()
    }

    async fn probe(&self, kind: BackendKind) -> bool {
        match self.get(kind) {
            Some(backend) => backend.is_available().await,
            None => false,
        }
    }

    /// Resolve the backend for one extraction.
    ///
    /// Backends are probed in chain order and probing stops at the first
    /// available one (or right after an explicit request).
    pub async fn select(&self, requested: Option<BackendKind>) -> Result<Arc<dyn ExtractionBackend>, PipelineError> {
        let mut availability: HashMap<BackendKind, bool> = HashMap::new();

        for kind in fallback_chain(requested, self.default) {
            let available = self.probe(kind).await;
            availability.insert(kind, available);
            if available || requested == Some(kind) {
                break;
            }
            if self.default == Some(kind) {
                warn!(backend = kind.code(), "Configured backend not available, falling back");
            } else {
                debug!(backend = kind.code(), "Backend not available");
            }
        }

        let kind = select_backend(requested, self.default, |k| {
            availability.get(&k).copied().unwrap_or(false)
        })?;

        let backend = self
            .get(kind)
            .ok_or_else(|| PipelineError::BackendUnavailable(kind.code().to_string()))?;
        info!(backend = backend.name(), model = backend.model(), "Selected extraction backend");
        Ok(backend)
    }

    /// Every registered backend with live availability
    pub async fn describe(&self) -> Vec<BackendDescription> {
        let mut out = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let kind = backend.kind();
            out.push(BackendDescription {
                id: kind,
                name: backend.name().to_string(),
                description: kind.description().to_string(),
                model: backend.model().to_string(),
                available: backend.is_available().await,
                requires_api_key: kind.requires_api_key(),
                setup_steps: kind.setup_steps().iter().map(|s| s.to_string()).collect(),
            });
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Backend with fixed availability and a canned response
    pub(crate) struct StubBackend {
        pub kind: BackendKind,
        pub available: bool,
        pub response: String,
    }

    #[async_trait]
    impl ExtractionBackend for StubBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn model(&self) -> &str {
            "stub-1"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String, BackendError> {
            Ok(self.response.clone())
        }

        async fn is_available(&self) -> bool {
            self.available
        }
    }

    pub(crate) fn stub(kind: BackendKind, available: bool, response: &str) -> Arc<dyn ExtractionBackend> {
        Arc::new(StubBackend {
            kind,
            available,
            response: response.to_string(),
        })
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("OpenAI".parse::<BackendKind>().unwrap(), BackendKind::OpenAi);
        assert_eq!(" mock ".parse::<BackendKind>().unwrap(), BackendKind::Mock);
        assert!(matches!(
            "claude".parse::<BackendKind>(),
            Err(PipelineError::UnknownBackend(_))
        ));
        for kind in BackendKind::ALL {
            assert_eq!(kind.code().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_fallback_chain_order() {
        use BackendKind::*;
        assert_eq!(fallback_chain(None, None), vec![Ollama, OpenAi, Mock]);
        assert_eq!(fallback_chain(None, Some(OpenAi)), vec![OpenAi, Ollama, Mock]);
        assert_eq!(fallback_chain(Some(Mock), Some(OpenAi)), vec![Mock, OpenAi, Ollama]);
        assert_eq!(fallback_chain(Some(Mock), Some(Mock)), vec![Mock, Ollama, OpenAi]);
    }

    #[test]
    fn test_select_backend() {
        use BackendKind::*;
        let only_mock = |k: BackendKind| k == Mock;
        let everything = |_: BackendKind| true;

        assert_eq!(select_backend(None, None, only_mock).unwrap(), Mock);
        assert_eq!(select_backend(None, None, everything).unwrap(), Ollama);
        assert_eq!(select_backend(None, Some(OpenAi), everything).unwrap(), OpenAi);
        assert_eq!(select_backend(None, Some(OpenAi), only_mock).unwrap(), Mock);
        assert_eq!(select_backend(Some(Mock), Some(OpenAi), everything).unwrap(), Mock);

        let err = select_backend(Some(Ollama), None, only_mock).unwrap_err();
        assert_eq!(err.to_string(), "Provider 'ollama' is not available");
        assert!(select_backend(None, None, |_| false).is_err());
    }

    #[test]
    fn test_extraction_request_defaults() {
        let request = CompletionRequest::extraction("sys".into(), "user text".into());
        assert_eq!(request.max_tokens, 8192);
        assert!(request.json_mode);
        assert_eq!(request.temperature, 0.1);
        assert_eq!(request.first_user_message(), Some("user text"));
    }

    #[tokio::test]
    async fn test_registry_select_and_describe() {
        let registry = BackendRegistry::new(
            vec![
                stub(BackendKind::Ollama, false, ""),
                stub(BackendKind::OpenAi, true, ""),
                stub(BackendKind::Mock, true, ""),
            ],
            None,
        );

        assert_eq!(registry.select(None).await.unwrap().kind(), BackendKind::OpenAi);
        assert_eq!(registry.select(Some(BackendKind::Mock)).await.unwrap().kind(), BackendKind::Mock);
        assert!(matches!(
            registry.select(Some(BackendKind::Ollama)).await,
            Err(PipelineError::BackendUnavailable(_))
        ));

        let catalog = registry.describe().await;
        assert_eq!(catalog.len(), 3);
        assert!(!catalog[0].available);
        assert!(catalog[1].requires_api_key);
        assert_eq!(catalog[2].setup_steps, vec!["No setup required"]);
    }

    #[test]
    fn test_registry_from_config() {
        let mut config = Config::default();
        config.backend.default = Some("mock".to_string());
        let registry = BackendRegistry::from_config(&config).unwrap();
        assert_eq!(registry.default_kind(), Some(BackendKind::Mock));
        assert!(registry.get(BackendKind::Ollama).is_some());

        config.backend.default = Some("gemini".to_string());
        assert!(BackendRegistry::from_config(&config).is_err());
    }
}
