use std::fmt::Write as _;
use std::path::Path;
use std::sync::OnceLock;

use minijinja::{context, Environment};
use regex::Regex;
use tracing::{error, warn};

use crate::config::PromptsConfig;
use crate::history::{MessageRole, StoredMessage};

/// Fragment sources loaded once at startup. The assembler itself is a
/// stateless function of its inputs; which overlays are active is decided
/// per message by the trigger rules and the latched per-user flag.
pub struct PromptLibrary {
    system: String,
    meta: String,
    rebel: String,
    rebel_v2: String,
    template: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveFragments {
    pub meta: bool,
    pub rebel: bool,
    pub rebel_v2: bool,
}

#[derive(Debug, Clone)]
pub struct PromptContext {
    pub context_block: String,
    pub user_name: String,
    pub user_username: String,
    pub user_message: String,
    pub image_analysis: Option<String>,
}

impl PromptLibrary {
    pub fn load(cfg: &PromptsConfig) -> Self {
        let system = load_fragment(&cfg.dir.join(&cfg.system_file));
        let meta = load_fragment(&cfg.dir.join(&cfg.meta_file));
        let rebel = load_fragment(&cfg.dir.join(&cfg.rebel_file));
        let rebel_v2 = load_fragment(&cfg.dir.join(&cfg.rebel_v2_file));

        let template_path = cfg.dir.join(&cfg.template_file);
        let template = match std::fs::read_to_string(&template_path) {
            Ok(text) => Some(text),
            Err(err) => {
                error!(
                    "prompt template {} unavailable, prompt assembly disabled: {err}",
                    template_path.display()
                );
                None
            }
        };

        Self {
            system,
            meta,
            rebel,
            rebel_v2,
            template,
        }
    }

    pub fn has_template(&self) -> bool {
        self.template.is_some()
    }

    /// Renders the final prompt. Returns `None` (fail soft) when the core
    /// template is missing or does not render; the caller substitutes a safe
    /// fallback reply.
    pub fn build(&self, ctx: &PromptContext, active: &ActiveFragments) -> Option<String> {
        let Some(template) = self.template.as_deref() else {
            error!("prompt template missing, cannot assemble prompt");
            return None;
        };
        let env = Environment::new();
        let rendered = env.render_str(
            template,
            context! {
                system_message => self.system.as_str(),
                meta_prompt => if active.meta { self.meta.as_str() } else { "" },
                rebel => if active.rebel { self.rebel.as_str() } else { "" },
                rebel_v2 => if active.rebel_v2 { self.rebel_v2.as_str() } else { "" },
                summarized_context => ctx.context_block.as_str(),
                user_name => ctx.user_name.as_str(),
                user_username => ctx.user_username.as_str(),
                user_message => ctx.user_message.as_str(),
                image_analysis => ctx.image_analysis.as_deref().unwrap_or("")
            },
        );
        match rendered {
            Ok(text) => Some(text),
            Err(err) => {
                error!("prompt template render failed: {err}");
                None
            }
        }
    }
}

fn load_fragment(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) => text.trim_end().to_owned(),
        Err(err) => {
            warn!("prompt fragment {} treated as absent: {err}", path.display());
            String::new()
        }
    }
}

/// Flattens the summarized context into the plain text block the template
/// interpolates.
pub fn render_context_block(messages: &[StoredMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        let role = match message.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        match message.username.as_deref() {
            Some(username) => {
                let _ = writeln!(out, "{role} ({username}): {}", message.content);
            }
            None => {
                let _ = writeln!(out, "{role}: {}", message.content);
            }
        }
    }
    out.trim_end().to_owned()
}

/// What one inbound message does to the fragment set. `meta_latch` mutates
/// the persisted per-user flag; the overlay booleans apply to the current
/// assembly only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub meta_latch: Option<bool>,
    pub rebel: bool,
    pub rebel_v2: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerAction {
    MetaOn,
    MetaOff,
    RebelV2,
    Rebel,
}

fn trigger_rules() -> &'static [(Regex, TriggerAction)] {
    static RULES: OnceLock<Vec<(Regex, TriggerAction)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"(?i)stop\s+using\s+meta_prompt", TriggerAction::MetaOff),
            (r"(?i)\bstop\s+reasoning\b", TriggerAction::MetaOff),
            (r"(?i)\breason\s+about\s+this\b", TriggerAction::MetaOn),
            (r"(?i)\buse\s+meta_prompt\b", TriggerAction::MetaOn),
            (r"(?i)\brebel(\s*mode)?\s*v2\b", TriggerAction::RebelV2),
            (r"(?i)\brebel\b", TriggerAction::Rebel),
        ]
        .into_iter()
        .map(|(pattern, action)| {
            let regex = Regex::new(pattern).expect("valid regex");
            (regex, action)
        })
        .collect()
    })
}

/// Evaluates the keyword rule table once against a message. Deactivation
/// wins over activation; the versioned overlay suppresses the plain one.
pub fn evaluate_triggers(text: &str) -> TriggerOutcome {
    let mut outcome = TriggerOutcome::default();
    let mut meta_on = false;
    let mut meta_off = false;
    for (regex, action) in trigger_rules() {
        if !regex.is_match(text) {
            continue;
        }
        match action {
            TriggerAction::MetaOn => meta_on = true,
            TriggerAction::MetaOff => meta_off = true,
            TriggerAction::RebelV2 => outcome.rebel_v2 = true,
            TriggerAction::Rebel => outcome.rebel = true,
        }
    }
    if meta_off {
        outcome.meta_latch = Some(false);
    } else if meta_on {
        outcome.meta_latch = Some(true);
    }
    if outcome.rebel_v2 {
        outcome.rebel = false;
    }
    outcome
}
