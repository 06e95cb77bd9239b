use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, warn};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const TELEGRAM_REPLY_MAX_CHARS: usize = 3_500;
pub const SEND_MAX_ATTEMPTS: u32 = 3;
const SEND_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const ERROR_BODY_MAX_CHARS: usize = 256;

/// Transport failure with its retry classification: connection faults,
/// timeouts and 5xx/429 statuses are worth another attempt; Bot API
/// rejections (`ok=false`) and malformed requests are terminal.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub message: String,
    pub transient: bool,
}

impl ApiError {
    fn transient(message: String) -> Self {
        Self {
            message,
            transient: true,
        }
    }

    fn fatal(message: String) -> Self {
        Self {
            message,
            transient: false,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone)]
pub struct TelegramClient {
    token: String,
    http: reqwest::Client,
    base_url: String,
    retry_base_delay: Duration,
}

impl TelegramClient {
    pub fn new(token: String, http: reqwest::Client, base_url: Option<String>) -> Self {
        Self {
            token,
            http,
            base_url: base_url.unwrap_or_else(|| TELEGRAM_API_BASE.to_owned()),
            retry_base_delay: SEND_RETRY_BASE_DELAY,
        }
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// The underlying HTTP client, shared with non-Telegram fetches.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{file_path}", self.base_url, self.token)
    }

    pub async fn api(&self, method: &str, query: &[(&str, String)]) -> Result<Value, ApiError> {
        let response = self
            .http
            .get(self.method_url(method))
            .query(query)
            .send()
            .await
            .map_err(|err| classify_reqwest(method, err))?;
        parse_api_response(method, response).await
    }

    pub async fn api_multipart(
        &self,
        method: &str,
        fields: &[(&str, String)],
        file_field: &str,
        file_name: &str,
        mime: &str,
        file_bytes: Vec<u8>,
    ) -> Result<Value, ApiError> {
        let mut form = reqwest::multipart::Form::new();
        for (key, value) in fields {
            form = form.text((*key).to_owned(), value.clone());
        }
        let part = reqwest::multipart::Part::bytes(file_bytes)
            .file_name(file_name.to_owned())
            .mime_str(mime)
            .map_err(|err| ApiError::fatal(format!("telegram {method} invalid mime `{mime}`: {err}")))?;
        form = form.part(file_field.to_owned(), part);

        let response = self
            .http
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|err| classify_reqwest(method, err))?;
        parse_api_response(method, response).await
    }

    pub async fn get_updates(&self, offset: u64, timeout_secs: u64) -> Result<Vec<Value>, ApiError> {
        let mut query = vec![
            ("timeout", timeout_secs.to_string()),
            ("allowed_updates", "[\"message\"]".to_owned()),
        ];
        if offset > 0 {
            query.push(("offset", offset.to_string()));
        }
        let result = self.api("getUpdates", &query).await?;
        result
            .as_array()
            .cloned()
            .ok_or_else(|| ApiError::fatal("telegram getUpdates result must be an array".to_owned()))
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<(), ApiError> {
        let mut query = vec![
            ("chat_id", chat_id.to_string()),
            ("text", truncate_text(text, TELEGRAM_REPLY_MAX_CHARS)),
            ("disable_web_page_preview", "true".to_owned()),
        ];
        if let Some(value) = reply_to_message_id {
            query.push(("reply_to_message_id", value.to_string()));
        }
        let _ = self.api("sendMessage", &query).await?;
        Ok(())
    }

    /// Bounded-retry delivery: exponential backoff (base doubling per
    /// attempt) on transient failures only. Returns whether the message was
    /// delivered. No sleep follows the final failed attempt.
    pub async fn send_with_retries(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
        max_attempts: u32,
    ) -> bool {
        for attempt in 1..=max_attempts {
            match self.send_message(chat_id, text, reply_to_message_id).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!("telegram send succeeded on attempt {attempt}");
                    }
                    return true;
                }
                Err(err) if err.transient && attempt < max_attempts => {
                    let delay = self.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        "telegram send attempt {attempt}/{max_attempts} failed ({err}), retrying in {delay:?}"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    warn!("telegram send to chat {chat_id} failed: {err}");
                    return false;
                }
            }
        }
        false
    }

    pub async fn send_audio(
        &self,
        chat_id: i64,
        reply_to_message_id: Option<i64>,
        title: &str,
        mp3_bytes: Vec<u8>,
    ) -> Result<(), ApiError> {
        let mut fields = vec![
            ("chat_id", chat_id.to_string()),
            ("title", truncate_text(title, 64)),
        ];
        if let Some(value) = reply_to_message_id {
            fields.push(("reply_to_message_id", value.to_string()));
        }
        let _ = self
            .api_multipart(
                "sendAudio",
                &fields,
                "audio",
                "charla-voice.mp3",
                "audio/mpeg",
                mp3_bytes,
            )
            .await?;
        Ok(())
    }

    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ApiError> {
        let result = self
            .api("getFile", &[("file_id", file_id.to_owned())])
            .await?;
        let file_path = result
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::fatal("telegram getFile missing result.file_path".to_owned()))?;

        let response = self
            .http
            .get(self.file_url(file_path))
            .send()
            .await
            .map_err(|err| classify_reqwest("fileDownload", err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError {
                message: format!("telegram file download returned status {}", status.as_u16()),
                transient: is_transient_status(status),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ApiError::transient(format!("telegram file download read failed: {err}")))?;
        Ok(bytes.to_vec())
    }
}

async fn parse_api_response(method: &str, response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| ApiError::transient(format!("telegram {method} body read failed: {err}")))?;
    if !status.is_success() {
        return Err(ApiError {
            message: format!(
                "telegram {method} returned status {}: {}",
                status.as_u16(),
                truncate_text(&body, ERROR_BODY_MAX_CHARS)
            ),
            transient: is_transient_status(status),
        });
    }
    let payload: Value = serde_json::from_str(&body)
        .map_err(|err| ApiError::fatal(format!("telegram {method} invalid JSON: {err}")))?;
    if !payload.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        let reason = payload
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("telegram API returned ok=false");
        return Err(ApiError::fatal(format!("telegram {method} failed: {reason}")));
    }
    Ok(payload.get("result").cloned().unwrap_or(Value::Null))
}

fn classify_reqwest(method: &str, err: reqwest::Error) -> ApiError {
    // Builder faults are caller bugs; anything else is a transport fault.
    let transient = !err.is_builder();
    ApiError {
        message: format!("telegram {method} request failed: {err}"),
        transient,
    }
}

fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status.as_u16() == 429
}

pub async fn load_offset(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }
    let raw = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) => {
            warn!("failed reading offset file {}: {err}", path.display());
            return 0;
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => value.get("offset").and_then(Value::as_u64).unwrap_or(0),
        Err(err) => {
            warn!("failed parsing offset file {}: {err}", path.display());
            0
        }
    }
}

pub async fn save_offset(path: &Path, offset: u64) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| format!("failed creating offset dir {}: {err}", parent.display()))?;
    }
    let temp_path = path.with_extension("tmp");
    let payload = json!({ "offset": offset });
    fs::write(
        &temp_path,
        serde_json::to_vec(&payload)
            .map_err(|err| format!("failed serializing offset payload: {err}"))?,
    )
    .await
    .map_err(|err| format!("failed writing offset temp file {}: {err}", temp_path.display()))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|err| format!("failed replacing offset file {}: {err}", path.display()))?;
    Ok(())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    if value.chars().count() <= max_chars {
        return value.to_owned();
    }
    let mut out: String = value.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
