use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::warn;

use crate::providers::ModelProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
}

/// One user's full persisted state: the message log plus the settings the
/// dispatcher and prompt assembler read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
    #[serde(default = "default_record_provider")]
    pub model_provider: ModelProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default)]
    pub use_meta_prompt: bool,
    /// Opaque chat transcript owned by the Google backend. Shape is the
    /// backend's own `{role, parts}` wire format and is never inspected here.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub google_chat_history: Vec<Value>,
}

impl ConversationRecord {
    pub fn fresh(provider: ModelProvider) -> Self {
        Self {
            messages: Vec::new(),
            model_provider: provider,
            model_name: None,
            use_meta_prompt: false,
            google_chat_history: Vec::new(),
        }
    }
}

fn default_record_provider() -> ModelProvider {
    ModelProvider::Groq
}

/// Per-user JSON documents under one directory, one file per user id,
/// rewritten in full after every mutation.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
    max_messages: usize,
    default_provider: ModelProvider,
}

impl HistoryStore {
    pub fn new(dir: PathBuf, max_messages: usize, default_provider: ModelProvider) -> Self {
        Self {
            dir,
            max_messages,
            default_provider,
        }
    }

    fn user_path(&self, user_id: i64) -> PathBuf {
        self.dir.join(format!("{user_id}.json"))
    }

    /// A read failure is treated as "no history": the conversation continues
    /// with an empty record and the cause is logged, never surfaced.
    pub async fn load(&self, user_id: i64) -> ConversationRecord {
        let path = self.user_path(user_id);
        if !path.exists() {
            return ConversationRecord::fresh(self.default_provider);
        }
        let raw = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) => {
                warn!("failed reading history {}: {err}", path.display());
                return ConversationRecord::fresh(self.default_provider);
            }
        };
        match serde_json::from_str::<ConversationRecord>(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn!("failed parsing history {}: {err}", path.display());
                ConversationRecord::fresh(self.default_provider)
            }
        }
    }

    /// Appends a timestamped message and evicts the oldest entries beyond
    /// `max_messages`.
    pub fn append(
        &self,
        record: &mut ConversationRecord,
        role: MessageRole,
        content: &str,
        username: Option<&str>,
        chat_id: Option<i64>,
    ) {
        record.messages.push(StoredMessage {
            role,
            content: content.to_owned(),
            username: username.map(ToOwned::to_owned),
            timestamp: now_ms(),
            chat_id,
        });
        if record.messages.len() > self.max_messages {
            let overflow = record.messages.len() - self.max_messages;
            record.messages.drain(0..overflow);
        }
    }

    pub async fn save(&self, user_id: i64, record: &ConversationRecord) -> Result<(), String> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| format!("failed creating history dir {}: {err}", self.dir.display()))?;
        let path = self.user_path(user_id);
        let payload = serde_json::to_vec_pretty(record)
            .map_err(|err| format!("failed serializing history for {user_id}: {err}"))?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, payload).await.map_err(|err| {
            format!(
                "failed writing history temp file {}: {err}",
                temp_path.display()
            )
        })?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|err| format!("failed replacing history file {}: {err}", path.display()))?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
