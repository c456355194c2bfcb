use std::fmt;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::JudgeError;
use crate::config::JudgeConfig;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const GEMINI_KEY_HEADER: &str = "x-goog-api-key";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const ERROR_BODY_LIMIT: usize = 200;

/// A text-completion backend: one system instruction, one prompt, one reply.
pub trait CompletionProvider {
    fn name(&self) -> &str;

    fn complete(&self, system: Option<&str>, prompt: &str) -> Result<String, JudgeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    RateLimited,
    Auth,
    InvalidRequest,
    Server,
    Unknown,
}

impl ProviderErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ProviderErrorKind::RateLimited,
            401 | 403 => ProviderErrorKind::Auth,
            400 | 404 | 413 | 422 => ProviderErrorKind::InvalidRequest,
            500..=599 => ProviderErrorKind::Server,
            _ => ProviderErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderErrorKind::RateLimited => "rate limit",
            ProviderErrorKind::Auth => "authentication error",
            ProviderErrorKind::InvalidRequest => "invalid request",
            ProviderErrorKind::Server => "server error",
            ProviderErrorKind::Unknown => "unexpected status",
        };
        write!(f, "{}", s)
    }
}

fn build_client() -> Result<Client, JudgeError> {
    Ok(Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

fn check_status(
    provider: &str,
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, JudgeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().unwrap_or_default();
    let message: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    let kind = ProviderErrorKind::from_status(status.as_u16());
    warn!(provider, status = status.as_u16(), %kind, "provider request rejected");

    Err(JudgeError::Status {
        provider: provider.to_string(),
        kind,
        message: format!("{} {}", status.as_u16(), message),
    })
}

// Gemini generateContent

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiContent,
}

pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl GeminiProvider {
    pub fn from_config(config: &JudgeConfig) -> Result<Self, JudgeError> {
        let api_key = config
            .gemini_api_key
            .clone()
            .ok_or_else(|| JudgeError::MissingCredential("GEMINI_API_KEY".to_string()))?;

        Ok(Self {
            client: build_client()?,
            base_url: GEMINI_BASE_URL.to_string(),
            api_key,
            model: config.gemini_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    fn request(&self, system: Option<&str>, prompt: &str) -> GeminiRequest {
        GeminiRequest {
            system_instruction: system.map(|s| GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: s.to_string(),
                }],
            }),
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_tokens,
            },
        }
    }
}

fn gemini_text(response: GeminiResponse) -> Result<String, JudgeError> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .map(|c| c.content.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(JudgeError::Parse("gemini returned no text".to_string()));
    }
    Ok(text)
}

impl CompletionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn complete(&self, system: Option<&str>, prompt: &str) -> Result<String, JudgeError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        debug!(model = %self.model, "calling gemini");

        let response = self
            .client
            .post(&url)
            .header(GEMINI_KEY_HEADER, self.api_key.as_str())
            .json(&self.request(system, prompt))
            .send()?;

        let response: GeminiResponse = check_status(self.name(), response)?.json()?;
        gemini_text(response)
    }
}

// Groq speaks the OpenAI chat-completions dialect

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct GroqProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl GroqProvider {
    pub fn from_config(config: &JudgeConfig) -> Result<Self, JudgeError> {
        let api_key = config
            .groq_api_key
            .clone()
            .ok_or_else(|| JudgeError::MissingCredential("GROQ_API_KEY".to_string()))?;

        Ok(Self {
            client: build_client()?,
            base_url: GROQ_BASE_URL.to_string(),
            api_key,
            model: config.groq_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn request(&self, system: Option<&str>, prompt: &str) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(system.to_string()),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: Some(prompt.to_string()),
        });

        ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

fn chat_text(response: ChatResponse) -> Result<String, JudgeError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| JudgeError::Parse("groq returned no text".to_string()))
}

impl CompletionProvider for GroqProvider {
    fn name(&self) -> &str {
        "groq"
    }

    fn complete(&self, system: Option<&str>, prompt: &str) -> Result<String, JudgeError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, "calling groq");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request(system, prompt))
            .send()?;

        let response: ChatResponse = check_status(self.name(), response)?.json()?;
        chat_text(response)
    }
}
