use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::providers::ModelProvider;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub models: ModelsConfig,
    pub history: HistoryConfig,
    pub prompts: PromptsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Chat that receives error notifications. Disabled when absent.
    #[serde(default)]
    pub admin_chat_id: Option<i64>,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_provider")]
    pub default_provider: ModelProvider,
    #[serde(default)]
    pub groq_api_key: Option<String>,
    #[serde(default)]
    pub google_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,
    #[serde(default = "default_context_max_chars")]
    pub context_max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "default_prompts_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_system_file")]
    pub system_file: String,
    #[serde(default = "default_template_file")]
    pub template_file: String,
    #[serde(default = "default_meta_file")]
    pub meta_file: String,
    #[serde(default = "default_rebel_file")]
    pub rebel_file: String,
    #[serde(default = "default_rebel_v2_file")]
    pub rebel_v2_file: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            admin_chat_id: None,
            poll_timeout_secs: default_poll_timeout_secs(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            groq_api_key: None,
            google_api_key: None,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            dir: default_history_dir(),
            max_messages: default_max_messages(),
            context_messages: default_context_messages(),
            context_max_chars: default_context_max_chars(),
        }
    }
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            dir: default_prompts_dir(),
            system_file: default_system_file(),
            template_file: default_template_file(),
            meta_file: default_meta_file(),
            rebel_file: default_rebel_file(),
            rebel_v2_file: default_rebel_v2_file(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("CHARLA_TELEGRAM_TOKEN") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.telegram.bot_token = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("CHARLA_ADMIN_CHAT_ID") {
            self.telegram.admin_chat_id = v.trim().parse::<i64>().ok();
        }
        if let Ok(v) = env::var("CHARLA_GROQ_API_KEY") {
            self.models.groq_api_key = normalize_secret(&v);
        }
        if let Ok(v) = env::var("CHARLA_GOOGLE_API_KEY") {
            self.models.google_api_key = normalize_secret(&v);
        }
        if let Ok(v) = env::var("CHARLA_DEFAULT_PROVIDER") {
            if let Some(provider) = ModelProvider::parse(&v) {
                self.models.default_provider = provider;
            }
        }
        if let Ok(v) = env::var("CHARLA_HISTORY_DIR") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.history.dir = PathBuf::from(trimmed);
            }
        }
        if let Ok(v) = env::var("CHARLA_PROMPTS_DIR") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.prompts.dir = PathBuf::from(trimmed);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.poll_timeout_secs == 0 {
            anyhow::bail!("telegram.poll_timeout_secs must be > 0");
        }
        if self.telegram.http_timeout_secs <= self.telegram.poll_timeout_secs {
            anyhow::bail!("telegram.http_timeout_secs must exceed telegram.poll_timeout_secs");
        }
        if self.history.max_messages == 0 {
            anyhow::bail!("history.max_messages must be > 0");
        }
        if self.history.context_messages == 0 {
            anyhow::bail!("history.context_messages must be > 0");
        }
        if self.history.context_max_chars == 0 {
            anyhow::bail!("history.context_max_chars must be > 0");
        }
        Ok(())
    }

    /// Checks the secrets the poll loop cannot run without. Kept out of
    /// `validate` so `doctor` can inspect a credential-less config.
    pub fn ensure_credentials(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token or CHARLA_TELEGRAM_TOKEN must be set");
        }
        if !self.has_any_model_key() {
            anyhow::bail!(
                "at least one of models.groq_api_key / models.google_api_key \
                 (CHARLA_GROQ_API_KEY / CHARLA_GOOGLE_API_KEY) must be set"
            );
        }
        Ok(())
    }

    pub fn has_any_model_key(&self) -> bool {
        has_secret(self.models.groq_api_key.as_deref())
            || has_secret(self.models.google_api_key.as_deref())
    }
}

fn has_secret(value: Option<&str>) -> bool {
    value.map(|v| !v.trim().is_empty()).unwrap_or(false)
}

fn normalize_secret(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn default_provider() -> ModelProvider {
    ModelProvider::Groq
}

fn default_poll_timeout_secs() -> u64 {
    20
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("conversation_logs")
}

fn default_max_messages() -> usize {
    100
}

fn default_context_messages() -> usize {
    5
}

fn default_context_max_chars() -> usize {
    1000
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from("prompts")
}

fn default_system_file() -> String {
    "system.txt".to_owned()
}

fn default_template_file() -> String {
    "prompt_template.txt".to_owned()
}

fn default_meta_file() -> String {
    "meta_prompt.md".to_owned()
}

fn default_rebel_file() -> String {
    "rebel.json".to_owned()
}

fn default_rebel_v2_file() -> String {
    "rebel_v2.json".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_full_defaults() {
        let cfg: Config = toml::from_str("").expect("empty config parses");
        assert_eq!(cfg.history.max_messages, 100);
        assert_eq!(cfg.history.context_messages, 5);
        assert_eq!(cfg.history.context_max_chars, 1000);
        assert_eq!(cfg.telegram.poll_timeout_secs, 20);
        assert_eq!(cfg.models.default_provider, ModelProvider::Groq);
        assert_eq!(cfg.prompts.template_file, "prompt_template.txt");
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [history]
            max_messages = 25

            [models]
            default_provider = "google"
            google_api_key = "k"
            "#,
        )
        .expect("partial config parses");
        assert_eq!(cfg.history.max_messages, 25);
        assert_eq!(cfg.history.dir, PathBuf::from("conversation_logs"));
        assert_eq!(cfg.models.default_provider, ModelProvider::Google);
        assert!(cfg.has_any_model_key());
    }

    #[test]
    fn validate_rejects_zero_budgets() {
        let mut cfg = Config::default();
        cfg.history.context_max_chars = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.telegram.poll_timeout_secs = 40;
        assert!(
            cfg.validate().is_err(),
            "http timeout must exceed poll timeout"
        );
    }

    #[test]
    fn ensure_credentials_requires_token_and_one_model_key() {
        let mut cfg = Config::default();
        assert!(cfg.ensure_credentials().is_err());

        cfg.telegram.bot_token = "123:abc".to_owned();
        assert!(cfg.ensure_credentials().is_err());

        cfg.models.groq_api_key = Some("gsk-test".to_owned());
        assert!(cfg.ensure_credentials().is_ok());
    }
}
