use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::chat::TextGenerator;
use crate::error::ServiceError;

const SERVICE: &str = "gemini";
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

/// Gemini `generateContent` client
pub struct GeminiClient {
    http: Client,
    url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate
    fn first_text(self) -> Option<String> {
        let candidate = self.candidates.into_iter().next()?;
        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        Some(parts.into_iter().map(|p| p.text).collect())
    }
}

impl GeminiClient {
    pub fn new(http: Client, endpoint: Option<&str>, model: &str, api_key: &str) -> Self {
        let endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT).trim_end_matches('/');
        let model = model.trim_start_matches("models/");
        Self {
            http,
            url: format!("{}/v1beta/models/{}:generateContent", endpoint, model),
            api_key: api_key.to_string(),
        }
    }
}

fn parse_error(status: u16, body: &str) -> ServiceError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let error = parsed.get("error");
    ServiceError::Api {
        service: SERVICE,
        status,
        code: error
            .and_then(|e| e.get("status"))
            .and_then(Value::as_str)
            .map(str::to_string),
        message: error
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<Option<String>, ServiceError> {
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });
        // Not retried: a repeated call may produce a different, billed answer
        let response = self
            .http
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(parse_error(status.as_u16(), &text));
        }
        let parsed: GenerateContentResponse =
            serde_json::from_str(&text).map_err(|e| ServiceError::Decode {
                service: SERVICE,
                message: e.to_string(),
            })?;
        debug!("Gemini returned {} candidate(s)", parsed.candidates.len());
        Ok(parsed.first_text())
    }
}
