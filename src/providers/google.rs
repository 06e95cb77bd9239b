use async_trait::async_trait;
use serde_json::{json, Value};

use super::{GenError, ModelBackend};
use crate::history::ConversationRecord;
use crate::images::EncodedImage;
use crate::telegram::truncate_text;

const GOOGLE_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GOOGLE_DEFAULT_MODEL: &str = "gemini-1.5-flash-002";
const GOOGLE_TEMPERATURE: f64 = 0.66;
const GOOGLE_TOP_P: f64 = 1.0;
const GOOGLE_TOP_K: u32 = 1;
const GOOGLE_MAX_OUTPUT_TOKENS: u32 = 1024;
const GOOGLE_ERROR_BODY_MAX_CHARS: usize = 256;
const GOOGLE_VISION_INSTRUCTION: &str =
    "Describe this image in detail so the description can serve as conversation context.";

pub const GOOGLE_VARIANTS: &[(&str, &str)] = &[
    ("flash", "gemini-1.5-flash-002"),
    ("pro", "gemini-1.5-pro-002"),
];

pub fn resolve_model(variant: Option<&str>) -> &'static str {
    let Some(label) = variant.map(str::trim).filter(|v| !v.is_empty()) else {
        return GOOGLE_DEFAULT_MODEL;
    };
    let lowered = label.to_ascii_lowercase();
    GOOGLE_VARIANTS
        .iter()
        .find(|(name, _)| *name == lowered)
        .map(|(_, id)| *id)
        .unwrap_or(GOOGLE_DEFAULT_MODEL)
}

pub struct GoogleBackend {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl GoogleBackend {
    pub fn new(api_key: String, http: reqwest::Client, base_url: Option<String>) -> Self {
        Self {
            api_key,
            http,
            base_url: base_url.unwrap_or_else(|| GOOGLE_API_BASE.to_owned()),
        }
    }

    async fn generate_content(&self, model: &str, contents: &[Value]) -> Result<String, GenError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let body = json!({
            "contents": contents,
            "safetySettings": [
                {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE"}
            ],
            "generationConfig": {
                "temperature": GOOGLE_TEMPERATURE,
                "topP": GOOGLE_TOP_P,
                "topK": GOOGLE_TOP_K,
                "maxOutputTokens": GOOGLE_MAX_OUTPUT_TOKENS,
            }
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| GenError::Http(format!("google request failed: {err}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| GenError::Http(format!("google body read failed: {err}")))?;
        if !status.is_success() {
            return Err(GenError::Http(format!(
                "google returned status {}: {}",
                status.as_u16(),
                truncate_text(&text, GOOGLE_ERROR_BODY_MAX_CHARS)
            )));
        }

        let payload: Value = serde_json::from_str(&text)
            .map_err(|err| GenError::BadResponse(format!("google invalid JSON: {err}")))?;
        if payload.pointer("/promptFeedback/blockReason").is_some() {
            return Err(GenError::Blocked);
        }
        if payload
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
            .is_some_and(|reason| reason.eq_ignore_ascii_case("SAFETY"))
        {
            return Err(GenError::Blocked);
        }
        payload
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                GenError::BadResponse("google response missing candidates[0] text".to_owned())
            })
    }

    /// One-shot vision request for the image-analysis path. Does not touch
    /// the per-user chat transcript.
    pub async fn analyze_image(&self, image: &EncodedImage) -> Result<String, GenError> {
        let contents = vec![json!({
            "role": "user",
            "parts": [
                {"text": GOOGLE_VISION_INSTRUCTION},
                {"inline_data": {"mime_type": image.mime_type, "data": image.data}}
            ]
        })];
        self.generate_content(GOOGLE_DEFAULT_MODEL, &contents).await
    }
}

#[async_trait]
impl ModelBackend for GoogleBackend {
    fn provider_id(&self) -> &'static str {
        "google"
    }

    async fn generate(
        &self,
        prompt: &str,
        record: &mut ConversationRecord,
    ) -> Result<String, GenError> {
        let model = resolve_model(record.model_name.as_deref());
        let user_turn = json!({
            "role": "user",
            "parts": [{"text": prompt}]
        });
        let mut contents = record.google_chat_history.clone();
        contents.push(user_turn.clone());

        let reply = self.generate_content(model, &contents).await?;

        // Only a successful exchange extends the transcript.
        record.google_chat_history.push(user_turn);
        record.google_chat_history.push(json!({
            "role": "model",
            "parts": [{"text": reply}]
        }));
        Ok(reply)
    }
}
