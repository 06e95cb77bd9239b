pub mod google;
pub mod groq;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ModelsConfig;
use crate::history::ConversationRecord;
use crate::images::EncodedImage;

pub use google::GoogleBackend;
pub use groq::GroqBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Groq,
    Google,
}

impl ModelProvider {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Some(Self::Groq),
            "google" | "gemini" => Some(Self::Google),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Groq => "groq",
            Self::Google => "google",
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified generation-error taxonomy for both backends. User-facing wording
/// is chosen by the handler, never embedded here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenError {
    /// The selected backend has no configured credential.
    Unavailable,
    /// The backend refused the content.
    Blocked,
    /// Transport or non-success HTTP status.
    Http(String),
    /// The backend answered with a payload we could not use.
    BadResponse(String),
}

impl fmt::Display for GenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => f.write_str("no model backend available"),
            Self::Blocked => f.write_str("content blocked by the backend"),
            Self::Http(detail) => write!(f, "backend request failed: {detail}"),
            Self::BadResponse(detail) => write!(f, "backend response unusable: {detail}"),
        }
    }
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn provider_id(&self) -> &'static str;

    /// Issues one completion for an already-assembled prompt. Backends may
    /// mutate backend-specific state inside the record (the Google chat
    /// transcript); they never touch the message log.
    async fn generate(
        &self,
        prompt: &str,
        record: &mut ConversationRecord,
    ) -> Result<String, GenError>;
}

/// Routes generation requests to the backend selected in the user's record,
/// gated on which credentials were configured. No cross-provider fallback:
/// a selected-but-unconfigured backend is reported as unavailable.
pub struct ModelDispatcher {
    groq: Option<GroqBackend>,
    google: Option<GoogleBackend>,
}

impl ModelDispatcher {
    pub fn from_config(models: &ModelsConfig, http: reqwest::Client) -> Self {
        let groq = models
            .groq_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(|key| GroqBackend::new(key.to_owned(), http.clone(), None));
        let google = models
            .google_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(|key| GoogleBackend::new(key.to_owned(), http.clone(), None));
        Self { groq, google }
    }

    pub fn from_backends(groq: Option<GroqBackend>, google: Option<GoogleBackend>) -> Self {
        Self { groq, google }
    }

    pub fn is_configured(&self, provider: ModelProvider) -> bool {
        match provider {
            ModelProvider::Groq => self.groq.is_some(),
            ModelProvider::Google => self.google.is_some(),
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        record: &mut ConversationRecord,
    ) -> Result<String, GenError> {
        match record.model_provider {
            ModelProvider::Groq => match &self.groq {
                Some(backend) => {
                    debug!("dispatching generation to groq");
                    backend.generate(prompt, record).await
                }
                None => Err(GenError::Unavailable),
            },
            ModelProvider::Google => match &self.google {
                Some(backend) => {
                    debug!("dispatching generation to google");
                    backend.generate(prompt, record).await
                }
                None => Err(GenError::Unavailable),
            },
        }
    }

    /// The image-analysis path: a single vision request whose result text
    /// feeds the prompt assembler. Only the Google backend can see images.
    pub async fn analyze_image(&self, image: &EncodedImage) -> Result<String, GenError> {
        match &self.google {
            Some(backend) => backend.analyze_image(image).await,
            None => {
                debug!("image analysis skipped: google backend not configured");
                Err(GenError::Unavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelsConfig;
    use crate::history::ConversationRecord;

    fn dispatcher(groq: Option<&str>, google: Option<&str>) -> ModelDispatcher {
        let models = ModelsConfig {
            default_provider: ModelProvider::Groq,
            groq_api_key: groq.map(ToOwned::to_owned),
            google_api_key: google.map(ToOwned::to_owned),
        };
        ModelDispatcher::from_config(&models, reqwest::Client::new())
    }

    #[test]
    fn provider_parse_accepts_aliases() {
        assert_eq!(ModelProvider::parse(" Groq "), Some(ModelProvider::Groq));
        assert_eq!(ModelProvider::parse("gemini"), Some(ModelProvider::Google));
        assert_eq!(ModelProvider::parse("openai"), None);
    }

    #[test]
    fn dispatcher_tracks_configured_backends() {
        let both = dispatcher(Some("gsk"), Some("goo"));
        assert!(both.is_configured(ModelProvider::Groq));
        assert!(both.is_configured(ModelProvider::Google));

        let blank_key = dispatcher(Some("  "), None);
        assert!(!blank_key.is_configured(ModelProvider::Groq));
    }

    #[tokio::test]
    async fn selected_but_unconfigured_backend_is_unavailable() {
        let only_google = dispatcher(None, Some("goo"));
        let mut record = ConversationRecord::fresh(ModelProvider::Groq);
        let result = only_google.generate("hola", &mut record).await;
        assert_eq!(result, Err(GenError::Unavailable));
    }

    #[tokio::test]
    async fn no_backend_at_all_is_unavailable() {
        let none = dispatcher(None, None);
        let mut record = ConversationRecord::fresh(ModelProvider::Groq);
        assert_eq!(
            none.generate("hola", &mut record).await,
            Err(GenError::Unavailable)
        );
    }
}
