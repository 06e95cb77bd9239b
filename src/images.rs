use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::Value;

use crate::telegram::TelegramClient;

/// Telegram serves several pre-scaled JPEG variants per photo; the largest
/// one under this cap is used, so no local pixel decoding is needed.
const PHOTO_MAX_FILE_BYTES: u64 = 1_500_000;

/// Base64 image payload for the model dispatcher's image-analysis path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: String,
    pub data: String,
}

/// Picks the file id of the best photo variant: the largest size within the
/// byte cap, or the smallest available one when everything is oversized.
pub fn pick_photo_file_id(message: &Value) -> Option<String> {
    let sizes = message.get("photo")?.as_array()?;
    let mut chosen: Option<&Value> = None;
    for size in sizes {
        let file_size = size.get("file_size").and_then(Value::as_u64).unwrap_or(0);
        if file_size <= PHOTO_MAX_FILE_BYTES {
            chosen = Some(size);
        }
    }
    let entry = chosen.or_else(|| sizes.first())?;
    entry
        .get("file_id")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

/// Downloads and base64-encodes the photo attached to a message, if any.
pub async fn fetch_encoded_photo(
    client: &TelegramClient,
    message: &Value,
) -> Result<Option<EncodedImage>, String> {
    let Some(file_id) = pick_photo_file_id(message) else {
        return Ok(None);
    };
    let bytes = client
        .download_file(&file_id)
        .await
        .map_err(|err| format!("photo download failed: {err}"))?;
    if bytes.is_empty() {
        return Err("photo download returned empty file".to_owned());
    }
    Ok(Some(EncodedImage {
        mime_type: "image/jpeg".to_owned(),
        data: BASE64_STANDARD.encode(&bytes),
    }))
}
