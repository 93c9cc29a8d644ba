//! Backend client trait and the HTTP implementation.
//!
//! The cascade treats "invoke backend with prompt" as opaque: it hands a
//! prompt to [`ModelClient::invoke`] and gets back either raw response text
//! or an error classified well enough to drive failover. Prompt construction
//! and output validation live with the pipeline stage, not here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

use super::types::{ModelDescriptor, ModelResponse, Provider};

/// Opaque "call this backend" operation the cascade strategies dispatch to.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send one prompt to one backend and return its raw output.
    ///
    /// Errors carry an [`ErrorKind`] so the strategies can distinguish quota
    /// signals from transient faults.
    async fn invoke(&self, model: &ModelDescriptor, prompt: &str) -> Result<ModelResponse>;
}

fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::config(format!("cannot build HTTP client: {}", e)))
}

/// HTTP client covering all supported providers.
///
/// Credentials come from the environment (`GEMINI_API_KEY`, `GROQ_API_KEY`,
/// `OPENROUTER_API_KEY`, `VERTEX_ACCESS_TOKEN`); a missing credential fails
/// only the affected backend, which the cascade then routes around.
pub struct HttpModelClient {
    http: Client,
    base_urls: HashMap<Provider, String>,
}

impl HttpModelClient {
    const GEMINI_BASE: &'static str = "https://generativelanguage.googleapis.com";
    const GROQ_BASE: &'static str = "https://api.groq.com";
    const OPENROUTER_BASE: &'static str = "https://openrouter.ai";
    const OLLAMA_BASE: &'static str = "http://localhost:11434";

    pub fn new(timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            http: build_http_client(timeout_secs)?,
            base_urls: HashMap::new(),
        })
    }

    /// Override a provider's base URL (tests, self-hosted gateways).
    pub fn with_base_url(mut self, provider: Provider, url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, url.into());
        self
    }

    fn base_url(&self, provider: Provider) -> String {
        if let Some(url) = self.base_urls.get(&provider) {
            return url.clone();
        }
        match provider {
            Provider::Gemini => Self::GEMINI_BASE.to_string(),
            Provider::Groq => Self::GROQ_BASE.to_string(),
            Provider::OpenRouter => Self::OPENROUTER_BASE.to_string(),
            Provider::Ollama => {
                std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| Self::OLLAMA_BASE.to_string())
            }
            Provider::Vertex => {
                let location =
                    std::env::var("VERTEX_LOCATION").unwrap_or_else(|_| "us-central1".to_string());
                format!("https://{}-aiplatform.googleapis.com", location)
            }
        }
    }

    fn env_key(provider: Provider, var: &str) -> Result<String> {
        std::env::var(var).map_err(|_| {
            Error::provider(provider, ErrorKind::Other, format!("{} not set", var))
        })
    }

    async fn send(
        &self,
        provider: Provider,
        request: reqwest::RequestBuilder,
    ) -> Result<String> {
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(provider, &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider(provider, ErrorKind::Transient, e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(provider, status, &body));
        }
        Ok(body)
    }

    async fn invoke_gemini_format(
        &self,
        model: &ModelDescriptor,
        url: String,
        bearer: Option<String>,
        prompt: &str,
    ) -> Result<String> {
        let api_request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
        };

        let mut request = self.http.post(&url).json(&api_request);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let body = self.send(model.provider, request).await?;

        let api_response: GeminiResponse = serde_json::from_str(&body).map_err(|e| {
            Error::provider(model.provider, ErrorKind::MalformedOutput, e.to_string())
        })?;

        let content = api_response
            .candidates
            .iter()
            .flat_map(|c| c.content.parts.iter())
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(Error::provider(
                model.provider,
                ErrorKind::MalformedOutput,
                "empty response",
            ));
        }
        Ok(content)
    }

    async fn invoke_openai_format(
        &self,
        model: &ModelDescriptor,
        url: String,
        api_key: String,
        prompt: &str,
    ) -> Result<String> {
        let api_request = OpenAiRequest {
            model: model.id.clone(),
            messages: vec![OpenAiMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let request = self.http.post(&url).bearer_auth(api_key).json(&api_request);
        let body = self.send(model.provider, request).await?;

        let api_response: OpenAiResponse = serde_json::from_str(&body).map_err(|e| {
            Error::provider(model.provider, ErrorKind::MalformedOutput, e.to_string())
        })?;

        let content = api_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        if content.is_empty() {
            return Err(Error::provider(
                model.provider,
                ErrorKind::MalformedOutput,
                "empty response",
            ));
        }
        Ok(content)
    }

    async fn invoke_ollama(&self, model: &ModelDescriptor, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url(Provider::Ollama));
        let api_request = OllamaRequest {
            model: model.id.clone(),
            prompt: prompt.to_string(),
            stream: false,
        };

        let body = self
            .send(model.provider, self.http.post(&url).json(&api_request))
            .await?;

        let api_response: OllamaResponse = serde_json::from_str(&body).map_err(|e| {
            Error::provider(model.provider, ErrorKind::MalformedOutput, e.to_string())
        })?;

        if api_response.response.is_empty() {
            return Err(Error::provider(
                model.provider,
                ErrorKind::MalformedOutput,
                "empty response",
            ));
        }
        Ok(api_response.response)
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn invoke(&self, model: &ModelDescriptor, prompt: &str) -> Result<ModelResponse> {
        let started = std::time::Instant::now();

        let content = match model.provider {
            Provider::Gemini => {
                let key = Self::env_key(Provider::Gemini, "GEMINI_API_KEY")?;
                let url = format!(
                    "{}/v1beta/models/{}:generateContent?key={}",
                    self.base_url(Provider::Gemini),
                    model.id,
                    key
                );
                self.invoke_gemini_format(model, url, None, prompt).await?
            }
            Provider::Vertex => {
                let token = Self::env_key(Provider::Vertex, "VERTEX_ACCESS_TOKEN")?;
                let project = Self::env_key(Provider::Vertex, "VERTEX_PROJECT")?;
                let location =
                    std::env::var("VERTEX_LOCATION").unwrap_or_else(|_| "us-central1".to_string());
                let url = format!(
                    "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
                    self.base_url(Provider::Vertex),
                    project,
                    location,
                    model.id
                );
                self.invoke_gemini_format(model, url, Some(token), prompt)
                    .await?
            }
            Provider::Groq => {
                let key = Self::env_key(Provider::Groq, "GROQ_API_KEY")?;
                let url = format!(
                    "{}/openai/v1/chat/completions",
                    self.base_url(Provider::Groq)
                );
                self.invoke_openai_format(model, url, key, prompt).await?
            }
            Provider::OpenRouter => {
                let key = Self::env_key(Provider::OpenRouter, "OPENROUTER_API_KEY")?;
                let url = format!(
                    "{}/api/v1/chat/completions",
                    self.base_url(Provider::OpenRouter)
                );
                self.invoke_openai_format(model, url, key, prompt).await?
            }
            Provider::Ollama => self.invoke_ollama(model, prompt).await?,
        };

        Ok(ModelResponse {
            model: model.id.clone(),
            provider: model.provider,
            content,
            duration: started.elapsed(),
            timestamp: Utc::now(),
        })
    }
}

fn classify_transport(provider: Provider, error: &reqwest::Error) -> Error {
    let kind = if error.is_timeout() || error.is_connect() {
        ErrorKind::Transient
    } else {
        ErrorKind::Other
    };
    Error::provider(provider, kind, error.to_string())
}

fn classify_status(provider: Provider, status: StatusCode, body: &str) -> Error {
    let kind = if status == StatusCode::TOO_MANY_REQUESTS
        || body.contains("RESOURCE_EXHAUSTED")
        || body.contains("rate_limit")
    {
        ErrorKind::RateLimited
    } else if status.is_server_error() {
        ErrorKind::Transient
    } else {
        ErrorKind::Other
    };

    // Bodies can be huge HTML error pages; keep the message useful.
    let message: String = format!("{}: {}", status, body).chars().take(300).collect();
    Error::provider(provider, kind, message)
}

// Gemini wire types, shared with Vertex.
#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

// OpenAI-compatible wire types, shared by Groq and OpenRouter.
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

// Ollama wire types.
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted client for exercising the cascade without a network.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use super::*;

    /// One scripted outcome for a model.
    #[derive(Debug, Clone)]
    pub(crate) enum Step {
        Succeed(String),
        Fail(ErrorKind),
    }

    /// [`ModelClient`] that replays scripted outcomes per model id.
    ///
    /// Steps are consumed in order; the last step of a script is sticky, so a
    /// one-element script means "always". Unscripted models always succeed.
    pub(crate) struct ScriptedClient {
        steps: Mutex<HashMap<String, VecDeque<Step>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        pub fn new() -> Self {
            Self {
                steps: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn script(self, model_id: &str, steps: Vec<Step>) -> Self {
            self.steps
                .lock()
                .unwrap()
                .insert(model_id.to_string(), steps.into());
            self
        }

        /// Model ids in call order, for asserting selection sequences.
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn invoke(&self, model: &ModelDescriptor, _prompt: &str) -> Result<ModelResponse> {
            self.calls.lock().unwrap().push(model.id.clone());

            let step = {
                let mut steps = self.steps.lock().unwrap();
                match steps.get_mut(&model.id) {
                    Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                    Some(queue) => queue
                        .front()
                        .cloned()
                        .unwrap_or_else(|| Step::Succeed("ok".to_string())),
                    None => Step::Succeed("ok".to_string()),
                }
            };

            match step {
                Step::Succeed(content) => Ok(ModelResponse {
                    model: model.id.clone(),
                    provider: model.provider,
                    content,
                    duration: Duration::from_millis(1),
                    timestamp: Utc::now(),
                }),
                Step::Fail(kind) => {
                    Err(Error::provider(model.provider, kind, "scripted failure"))
                }
            }
        }
    }
}
