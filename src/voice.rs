use tracing::debug;

/// The public endpoint gTTS wraps; returns MP3 frames per request, so the
/// chunks can be concatenated directly.
const TTS_ENDPOINT: &str = "https://translate.google.com/translate_tts";
const TTS_CLIENT: &str = "tw-ob";
/// Per-request text cap of the endpoint.
const TTS_MAX_CHUNK_CHARS: usize = 180;
pub const TTS_DEFAULT_LANG: &str = "es";

/// Converts text to MP3 audio, chunking long input at word boundaries and
/// concatenating the fetched frames.
pub async fn synthesize(
    http: &reqwest::Client,
    text: &str,
    lang: &str,
    endpoint: Option<&str>,
) -> Result<Vec<u8>, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("no text to synthesize".to_owned());
    }
    let endpoint = endpoint.unwrap_or(TTS_ENDPOINT);
    let chunks = chunk_text(trimmed, TTS_MAX_CHUNK_CHARS);
    debug!("synthesizing {} chunk(s) of speech", chunks.len());

    let mut audio = Vec::new();
    for chunk in chunks {
        let response = http
            .get(endpoint)
            .query(&[
                ("ie", "UTF-8"),
                ("client", TTS_CLIENT),
                ("tl", lang),
                ("q", chunk.as_str()),
            ])
            .send()
            .await
            .map_err(|err| format!("tts request failed: {err}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("tts endpoint returned status {}", status.as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| format!("tts body read failed: {err}"))?;
        audio.extend_from_slice(&bytes);
    }
    if audio.is_empty() {
        return Err("tts endpoint returned no audio".to_owned());
    }
    Ok(audio)
}

/// Splits text into chunks of at most `max_chars`, preferring word
/// boundaries; a single word longer than the cap is split hard.
fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        let extra = if current.is_empty() { word_len } else { word_len + 1 };
        if current_len + extra > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
