//! Gemini-backed classifier. Calls the `generateContent` REST endpoint and
//! parses the model's JSON analysis into a [`Classification`].

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::{Classification, ClassificationRequest, Classifier, Severity};
use crate::error::ClassificationFailure;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Temperature for classification (deterministic-ish).
const CLASSIFY_TEMPERATURE: f32 = 0.1;

/// Max output tokens; the answer is a small JSON object.
const CLASSIFY_MAX_TOKENS: u32 = 512;

/// Description characters sent to the model.
const MAX_PROMPT_DESCRIPTION: usize = 2_000;

pub struct GeminiClassifier {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl GeminiClassifier {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point at a different host (proxies, local fakes).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }

    fn failure_transport(&self, reason: impl Into<String>) -> ClassificationFailure {
        ClassificationFailure::Transport {
            classifier: self.name().to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Classifier for GeminiClassifier {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, ClassificationFailure> {
        let body = serde_json::json!({
            "systemInstruction": { "parts": [{ "text": build_system_prompt() }] },
            "contents": [{
                "role": "user",
                "parts": [{ "text": build_user_prompt(request) }]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": CLASSIFY_TEMPERATURE,
                "maxOutputTokens": CLASSIFY_MAX_TOKENS
            }
        });

        let resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.failure_transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            let reason = format!("HTTP {status}: {}", detail.chars().take(200).collect::<String>());
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                self.failure_transport(reason)
            } else {
                ClassificationFailure::Unavailable {
                    classifier: self.name().to_string(),
                    reason,
                }
            });
        }

        let data: GenerateContentResponse =
            resp.json().await.map_err(|e| ClassificationFailure::InvalidResponse {
                classifier: self.name().to_string(),
                reason: format!("undecodable body: {e}"),
            })?;

        let text = data.first_text().ok_or_else(|| ClassificationFailure::InvalidResponse {
            classifier: self.name().to_string(),
            reason: "response has no candidate text".to_string(),
        })?;
        debug!(raw_response = %text, "Gemini analysis response");

        parse_classification(&text).map_err(|reason| ClassificationFailure::InvalidResponse {
            classifier: self.name().to_string(),
            reason,
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateContentResponse {
    fn first_text(&self) -> Option<String> {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
            .find_map(|p| p.text.clone())
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    "You are an expert emergency response analyst. Analyze the emergency report \
     and provide structured information to help coordinate response efforts.\n\n\
     Determine:\n\
     1. severity: one of low, medium, high, critical\n\
     2. category: fire, structural_fire, flood, medical, accident, weather, security, \
        active_shooter, hazmat, other\n\
     3. urgency: a number from 0.0 (can wait) to 1.0 (immediate)\n\
     4. confidence: a number from 0.0 to 1.0\n\
     5. recommendations: specific actions for response teams\n\
     6. estimated_response_time: e.g. \"5-10 minutes\"\n\n\
     Respond with ONLY a JSON object:\n\
     {\"severity\": \"...\", \"category\": \"...\", \"urgency\": 0.0, \"confidence\": 0.0, \
     \"recommendations\": [\"...\"], \"estimated_response_time\": \"...\"}"
        .to_string()
}

fn build_user_prompt(request: &ClassificationRequest) -> String {
    let description: String = request
        .description
        .chars()
        .take(MAX_PROMPT_DESCRIPTION)
        .collect();
    let mut prompt = format!("Emergency Description: {description}");
    if let Some(ref location) = request.location {
        prompt.push_str(&format!("\nLocation: {location}"));
    }
    if let Some(ref image) = request.image_ref {
        prompt.push_str(&format!("\nAttached image: {image}"));
    }
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    severity: String,
    #[serde(default)]
    category: String,
    /// Number, or the older string form ("immediate", "urgent", ...).
    #[serde(default)]
    urgency: Option<serde_json::Value>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    estimated_response_time: String,
}

/// Parse the model's answer. An unknown severity is an error, never a guess.
fn parse_classification(raw: &str) -> Result<Classification, String> {
    let json_str = extract_json_object(raw);
    let response: AnalysisResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let severity: Severity = response.severity.parse()?;
    let urgency = match response.urgency {
        Some(serde_json::Value::Number(n)) => n.as_f64().map(|v| v as f32),
        Some(serde_json::Value::String(s)) => urgency_from_label(&s),
        _ => None,
    }
    .unwrap_or_else(|| severity.default_urgency());

    let estimated = if response.estimated_response_time.trim().is_empty() {
        "unknown".to_string()
    } else {
        response.estimated_response_time
    };

    Ok(Classification::new(
        severity,
        response.category,
        urgency,
        response
            .recommendations
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect(),
        estimated,
    ))
}

fn urgency_from_label(label: &str) -> Option<f32> {
    match label.trim().to_lowercase().as_str() {
        "immediate" => Some(1.0),
        "urgent" => Some(0.75),
        "moderate" => Some(0.5),
        "low" => Some(0.25),
        other => other.parse().ok(),
    }
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
