use async_trait::async_trait;
use serde_json::{json, Value};

use super::{GenError, ModelBackend};
use crate::history::ConversationRecord;
use crate::telegram::truncate_text;

const GROQ_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const GROQ_DEFAULT_MODEL: &str = "llama-3.1-70b-versatile";
const GROQ_TEMPERATURE: f64 = 0.88;
const GROQ_MAX_TOKENS: u32 = 2800;
const GROQ_TOP_P: f64 = 0.9;
const GROQ_ERROR_BODY_MAX_CHARS: usize = 256;

/// Variant labels users can select with `/model groq <label>`, mapped to the
/// concrete model ids the API expects.
pub const GROQ_VARIANTS: &[(&str, &str)] = &[
    ("llama", "llama-3.1-70b-versatile"),
    ("llama-8b", "llama-3.1-8b-instant"),
    ("mixtral", "mixtral-8x7b-32768"),
    ("gemma", "gemma2-9b-it"),
];

/// Unknown or absent labels fall back to the default model id.
pub fn resolve_model(variant: Option<&str>) -> &'static str {
    let Some(label) = variant.map(str::trim).filter(|v| !v.is_empty()) else {
        return GROQ_DEFAULT_MODEL;
    };
    let lowered = label.to_ascii_lowercase();
    GROQ_VARIANTS
        .iter()
        .find(|(name, _)| *name == lowered)
        .map(|(_, id)| *id)
        .unwrap_or(GROQ_DEFAULT_MODEL)
}

pub struct GroqBackend {
    api_key: String,
    http: reqwest::Client,
    endpoint: String,
}

impl GroqBackend {
    pub fn new(api_key: String, http: reqwest::Client, endpoint: Option<String>) -> Self {
        Self {
            api_key,
            http,
            endpoint: endpoint.unwrap_or_else(|| GROQ_API_URL.to_owned()),
        }
    }
}

#[async_trait]
impl ModelBackend for GroqBackend {
    fn provider_id(&self) -> &'static str {
        "groq"
    }

    async fn generate(
        &self,
        prompt: &str,
        record: &mut ConversationRecord,
    ) -> Result<String, GenError> {
        let model = resolve_model(record.model_name.as_deref());
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": GROQ_TEMPERATURE,
            "max_tokens": GROQ_MAX_TOKENS,
            "top_p": GROQ_TOP_P,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| GenError::Http(format!("groq request failed: {err}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| GenError::Http(format!("groq body read failed: {err}")))?;
        if !status.is_success() {
            return Err(GenError::Http(format!(
                "groq returned status {}: {}",
                status.as_u16(),
                truncate_text(&text, GROQ_ERROR_BODY_MAX_CHARS)
            )));
        }

        let payload: Value = serde_json::from_str(&text)
            .map_err(|err| GenError::BadResponse(format!("groq invalid JSON: {err}")))?;
        payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                GenError::BadResponse("groq response missing choices[0].message.content".to_owned())
            })
    }
}
