//! Backend descriptors and response types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// LLM provider backing one or more configured models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Vertex,
    Gemini,
    Groq,
    #[serde(rename = "openrouter")]
    OpenRouter,
    Ollama,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vertex => write!(f, "vertex"),
            Self::Gemini => write!(f, "gemini"),
            Self::Groq => write!(f, "groq"),
            Self::OpenRouter => write!(f, "openrouter"),
            Self::Ollama => write!(f, "ollama"),
        }
    }
}

/// One configured backend: a model on a provider, in a priority tier.
///
/// Tier is an ordinal; lower means higher priority. Models sharing a tier
/// share a provider quota pool. Immutable once the registry is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub provider: Provider,
    /// Model identifier as the provider knows it (e.g. "gemini-2.0-flash").
    pub id: String,
    pub tier: usize,
}

impl ModelDescriptor {
    pub fn new(provider: Provider, id: impl Into<String>, tier: usize) -> Self {
        Self {
            provider,
            id: id.into(),
            tier,
        }
    }

    /// Stable "provider/model" label used in logs and statistics.
    pub fn label(&self) -> String {
        format!("{}/{}", self.provider, self.id)
    }
}

/// Well-known backends for the default registry.
impl ModelDescriptor {
    pub fn vertex_gemini_pro() -> Self {
        Self::new(Provider::Vertex, "gemini-2.0-pro", 0)
    }

    pub fn gemini_flash() -> Self {
        Self::new(Provider::Gemini, "gemini-2.0-flash", 1)
    }

    pub fn groq_llama() -> Self {
        Self::new(Provider::Groq, "llama-3.3-70b-versatile", 2)
    }

    pub fn openrouter_qwen() -> Self {
        Self::new(Provider::OpenRouter, "qwen/qwen-2.5-72b-instruct", 3)
    }

    pub fn ollama_llama() -> Self {
        Self::new(Provider::Ollama, "llama3.1:8b", 4)
    }
}

/// Raw output of a single successful backend call.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    /// Model identifier that actually served the call.
    pub model: String,
    pub provider: Provider,
    /// Unparsed response text; structure is the caller's contract.
    pub content: String,
    /// Wall-clock duration of the call.
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}
