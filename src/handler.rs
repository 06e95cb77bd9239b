use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::history::{HistoryStore, MessageRole};
use crate::images;
use crate::prompts::{self, ActiveFragments, PromptContext, PromptLibrary};
use crate::providers::{
    google, groq, GenError, ModelDispatcher, ModelProvider,
};
use crate::summarizer::summarize;
use crate::telegram::{self, TelegramClient, SEND_MAX_ATTEMPTS};
use crate::voice;

const POLL_RETRY_DELAY_SECS: u64 = 5;
const OFFSET_FILE_NAME: &str = "update-offset.json";
const ADMIN_NOTE_MAX_CHARS: usize = 350;
const UNKNOWN_USER_NAME: &str = "unknown";

const WELCOME_TEXT: &str =
    "Hola, I'm Charla. Send me a message and I'll answer. Use /help to see what I can do.";
const HELP_TEXT: &str = "Commands:\n\
    /model <groq|google> [variant] - choose who answers you\n\
    /models - list providers and variant labels\n\
    /current - show the active selection\n\
    /voice <text> - reply with a voice note\n\
    /help - this message";
const NO_MODEL_TEXT: &str = "No model is available to generate an answer right now.";
const BLOCKED_TEXT: &str =
    "I can't answer that one because of content restrictions. Ask me something else.";
const NO_ANSWER_TEXT: &str = "I don't have a clear answer right now. Try again in a moment.";
const FALLBACK_REPLY_TEXT: &str =
    "I'm not fully myself right now, but I'm still here. Try again soon.";
const APOLOGY_TEXT: &str =
    "Oops, something went wrong on my side. I'm working on it - please try again later.";
const VOICE_UNAVAILABLE_TEXT: &str = "The voice is not coming out right now. Try again later.";
const IMAGE_DEFAULT_PROMPT: &str = "Describe the image I sent.";

#[derive(Debug, Clone, PartialEq, Eq)]
enum BotCommand {
    Start,
    Help,
    Model { raw_args: String },
    Models,
    Current,
    Voice { raw_args: String },
}

fn command_token_without_mention(token: &str) -> String {
    let lowered = token.trim().to_ascii_lowercase();
    match lowered.split_once('@') {
        Some((prefix, _)) => prefix.to_owned(),
        None => lowered,
    }
}

fn parse_command(text: &str) -> Option<BotCommand> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed.split_whitespace();
    let command = command_token_without_mention(parts.next()?);
    let raw_args = parts.collect::<Vec<_>>().join(" ");
    match command.as_str() {
        "/start" => Some(BotCommand::Start),
        "/help" => Some(BotCommand::Help),
        "/model" => Some(BotCommand::Model { raw_args }),
        "/models" => Some(BotCommand::Models),
        "/current" => Some(BotCommand::Current),
        "/voice" => Some(BotCommand::Voice { raw_args }),
        _ => None,
    }
}

fn extract_message_text(message: &Value) -> Option<String> {
    let text = message
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| message.get("caption").and_then(Value::as_str))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

pub struct BotHandler {
    cfg: Config,
    client: TelegramClient,
    store: HistoryStore,
    prompts: PromptLibrary,
    dispatcher: ModelDispatcher,
    offset_path: PathBuf,
}

impl BotHandler {
    pub fn new(
        cfg: Config,
        client: TelegramClient,
        store: HistoryStore,
        prompts: PromptLibrary,
        dispatcher: ModelDispatcher,
    ) -> Self {
        let offset_path = cfg.history.dir.join(OFFSET_FILE_NAME);
        Self {
            cfg,
            client,
            store,
            prompts,
            dispatcher,
            offset_path,
        }
    }

    /// The long-poll loop. Each update is handled to completion before the
    /// next; one message's failure never takes the process down.
    pub async fn run(&self) {
        let mut offset = telegram::load_offset(&self.offset_path).await;
        info!("bot loop started (offset={offset})");
        loop {
            let updates = match self
                .client
                .get_updates(offset, self.cfg.telegram.poll_timeout_secs)
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    warn!("getUpdates failed: {err}");
                    sleep(Duration::from_secs(POLL_RETRY_DELAY_SECS)).await;
                    continue;
                }
            };

            for update in updates {
                let Some(update_id) = update.get("update_id").and_then(Value::as_u64) else {
                    continue;
                };
                if update_id >= offset {
                    offset = update_id.saturating_add(1);
                }
                if let Err(err) = telegram::save_offset(&self.offset_path, offset).await {
                    warn!("offset write failed: {err}");
                }
                if let Err(err) = self.process_update(&update).await {
                    error!("update {update_id} processing failed: {err}");
                    self.notify_admin(&err).await;
                    if let Some(chat_id) =
                        update.pointer("/message/chat/id").and_then(Value::as_i64)
                    {
                        let reply_to =
                            update.pointer("/message/message_id").and_then(Value::as_i64);
                        let _ = self
                            .client
                            .send_with_retries(chat_id, APOLOGY_TEXT, reply_to, SEND_MAX_ATTEMPTS)
                            .await;
                    }
                }
            }
        }
    }

    async fn process_update(&self, update: &Value) -> Result<(), String> {
        let Some(message) = update.get("message") else {
            return Ok(());
        };
        if !message.is_object() {
            return Ok(());
        }
        if message
            .pointer("/from/is_bot")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Ok(());
        }

        let chat_id = message
            .pointer("/chat/id")
            .and_then(Value::as_i64)
            .ok_or_else(|| "telegram message missing chat.id".to_owned())?;
        let message_id = message.get("message_id").and_then(Value::as_i64);
        let user_name = message
            .pointer("/from/first_name")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_USER_NAME)
            .to_owned();
        let username = message
            .pointer("/from/username")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);

        let text = extract_message_text(message);

        if let Some(command) = text.as_deref().and_then(parse_command) {
            return self.handle_command(chat_id, message_id, command).await;
        }

        let image_analysis = self.analyze_photo(message).await;
        let user_message = match (text, image_analysis.is_some()) {
            (Some(text), _) => text,
            (None, true) => IMAGE_DEFAULT_PROMPT.to_owned(),
            (None, false) => {
                debug!("update for chat {chat_id} carried nothing to answer");
                return Ok(());
            }
        };

        info!(
            "message from {user_name} (chat {chat_id}): {} chars",
            user_message.chars().count()
        );
        self.respond(
            chat_id,
            message_id,
            &user_name,
            username.as_deref(),
            &user_message,
            image_analysis,
        )
        .await
    }

    /// Runs the image-analysis path when the message carries a photo. Any
    /// failure degrades to "no image context" and is only logged.
    async fn analyze_photo(&self, message: &Value) -> Option<String> {
        let image = match images::fetch_encoded_photo(&self.client, message).await {
            Ok(Some(image)) => image,
            Ok(None) => return None,
            Err(err) => {
                warn!("photo fetch failed, continuing without image context: {err}");
                return None;
            }
        };
        match self.dispatcher.analyze_image(&image).await {
            Ok(description) => Some(description),
            Err(err) => {
                warn!("image analysis failed, continuing without image context: {err}");
                None
            }
        }
    }

    async fn respond(
        &self,
        chat_id: i64,
        message_id: Option<i64>,
        user_name: &str,
        username: Option<&str>,
        user_message: &str,
        image_analysis: Option<String>,
    ) -> Result<(), String> {
        let user_id = chat_id;
        let mut record = self.store.load(user_id).await;

        let triggers = prompts::evaluate_triggers(user_message);
        if let Some(flag) = triggers.meta_latch {
            if record.use_meta_prompt != flag {
                record.use_meta_prompt = flag;
                info!(
                    "meta prompt {} for user {user_id}",
                    if flag { "latched on" } else { "latched off" }
                );
            }
        }

        self.store.append(
            &mut record,
            MessageRole::User,
            user_message,
            username,
            Some(chat_id),
        );
        self.store.save(user_id, &record).await?;

        let recent_start = record
            .messages
            .len()
            .saturating_sub(self.cfg.history.context_messages);
        let summary = summarize(
            &record.messages[recent_start..],
            self.cfg.history.context_max_chars,
        );
        let context = PromptContext {
            context_block: prompts::render_context_block(&summary),
            user_name: user_name.to_owned(),
            user_username: username.unwrap_or(UNKNOWN_USER_NAME).to_owned(),
            user_message: user_message.to_owned(),
            image_analysis,
        };
        let active = ActiveFragments {
            meta: record.use_meta_prompt,
            rebel: triggers.rebel,
            rebel_v2: triggers.rebel_v2,
        };

        let Some(prompt) = self.prompts.build(&context, &active) else {
            let _ = self
                .client
                .send_with_retries(chat_id, FALLBACK_REPLY_TEXT, message_id, SEND_MAX_ATTEMPTS)
                .await;
            return Ok(());
        };

        let reply = match self.dispatcher.generate(&prompt, &mut record).await {
            Ok(text) => text,
            Err(GenError::Unavailable) => {
                warn!("no model backend available for user {user_id}");
                NO_MODEL_TEXT.to_owned()
            }
            Err(GenError::Blocked) => BLOCKED_TEXT.to_owned(),
            Err(err) => {
                error!("generation failed for user {user_id}: {err}");
                let _ = self
                    .client
                    .send_with_retries(chat_id, NO_ANSWER_TEXT, message_id, SEND_MAX_ATTEMPTS)
                    .await;
                return Ok(());
            }
        };

        self.store.append(
            &mut record,
            MessageRole::Assistant,
            &reply,
            None,
            Some(chat_id),
        );
        self.store.save(user_id, &record).await?;

        if !self
            .client
            .send_with_retries(chat_id, &reply, message_id, SEND_MAX_ATTEMPTS)
            .await
        {
            warn!("reply delivery to chat {chat_id} failed after retries");
        }
        Ok(())
    }

    async fn handle_command(
        &self,
        chat_id: i64,
        message_id: Option<i64>,
        command: BotCommand,
    ) -> Result<(), String> {
        let reply = match command {
            BotCommand::Start => WELCOME_TEXT.to_owned(),
            BotCommand::Help => HELP_TEXT.to_owned(),
            BotCommand::Models => self.format_model_list(),
            BotCommand::Current => {
                let record = self.store.load(chat_id).await;
                let resolved = match record.model_provider {
                    ModelProvider::Groq => groq::resolve_model(record.model_name.as_deref()),
                    ModelProvider::Google => google::resolve_model(record.model_name.as_deref()),
                };
                format!(
                    "You are talking to {} ({resolved}).",
                    record.model_provider
                )
            }
            BotCommand::Model { raw_args } => self.handle_model_command(chat_id, &raw_args).await?,
            BotCommand::Voice { raw_args } => {
                return self.handle_voice_command(chat_id, message_id, &raw_args).await;
            }
        };
        let _ = self
            .client
            .send_with_retries(chat_id, &reply, message_id, SEND_MAX_ATTEMPTS)
            .await;
        Ok(())
    }

    async fn handle_model_command(&self, chat_id: i64, raw_args: &str) -> Result<String, String> {
        let mut parts = raw_args.split_whitespace();
        let Some(provider_raw) = parts.next() else {
            return Ok(format!("Usage: /model <groq|google> [variant]\n\n{}", self.format_model_list()));
        };
        let Some(provider) = ModelProvider::parse(provider_raw) else {
            return Ok(format!(
                "Unknown provider `{provider_raw}`. Use `groq` or `google`."
            ));
        };
        let variant = parts.next().map(|v| v.trim().to_ascii_lowercase());

        let mut record = self.store.load(chat_id).await;
        record.model_provider = provider;
        record.model_name = variant.clone();
        self.store.save(chat_id, &record).await?;

        let resolved = match provider {
            ModelProvider::Groq => groq::resolve_model(variant.as_deref()),
            ModelProvider::Google => google::resolve_model(variant.as_deref()),
        };
        let mut reply = format!("Model switched to {provider} ({resolved}).");
        if !self.dispatcher.is_configured(provider) {
            let _ = write!(
                reply,
                "\nHeads up: no API key is configured for {provider}, so answers will be unavailable."
            );
        }
        Ok(reply)
    }

    async fn handle_voice_command(
        &self,
        chat_id: i64,
        message_id: Option<i64>,
        raw_args: &str,
    ) -> Result<(), String> {
        let text = raw_args.trim();
        if text.is_empty() {
            let _ = self
                .client
                .send_with_retries(
                    chat_id,
                    "Usage: /voice <text to speak>",
                    message_id,
                    SEND_MAX_ATTEMPTS,
                )
                .await;
            return Ok(());
        }
        match voice::synthesize(self.client.http(), text, voice::TTS_DEFAULT_LANG, None).await {
            Ok(audio) => {
                if let Err(err) = self
                    .client
                    .send_audio(chat_id, message_id, "Charla voice", audio)
                    .await
                {
                    warn!("voice note delivery failed: {err}");
                    let _ = self
                        .client
                        .send_with_retries(chat_id, VOICE_UNAVAILABLE_TEXT, message_id, SEND_MAX_ATTEMPTS)
                        .await;
                }
            }
            Err(err) => {
                warn!("voice synthesis failed: {err}");
                let _ = self
                    .client
                    .send_with_retries(chat_id, VOICE_UNAVAILABLE_TEXT, message_id, SEND_MAX_ATTEMPTS)
                    .await;
            }
        }
        Ok(())
    }

    fn format_model_list(&self) -> String {
        let mut out = String::from("Available models:\n");
        for (provider, variants) in [
            (ModelProvider::Groq, groq::GROQ_VARIANTS),
            (ModelProvider::Google, google::GOOGLE_VARIANTS),
        ] {
            let state = if self.dispatcher.is_configured(provider) {
                "configured"
            } else {
                "no API key"
            };
            let _ = writeln!(out, "{provider} ({state}):");
            for (label, id) in variants {
                let _ = writeln!(out, "  /model {provider} {label} -> {id}");
            }
        }
        out.trim_end().to_owned()
    }

    async fn notify_admin(&self, detail: &str) {
        let Some(admin_chat_id) = self.cfg.telegram.admin_chat_id else {
            return;
        };
        let note = format!(
            "charla-bot processing error: {}",
            telegram::truncate_text(detail, ADMIN_NOTE_MAX_CHARS)
        );
        if let Err(err) = self.client.send_message(admin_chat_id, &note, None).await {
            warn!("admin notification failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::providers::GroqBackend;
    use crate::testutil::spawn_http_server;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn parse_command_recognizes_the_surface() {
        assert_eq!(parse_command("/start"), Some(BotCommand::Start));
        assert_eq!(parse_command("  /help  "), Some(BotCommand::Help));
        assert_eq!(parse_command("/models"), Some(BotCommand::Models));
        assert_eq!(parse_command("/current"), Some(BotCommand::Current));
        assert_eq!(
            parse_command("/model groq llama"),
            Some(BotCommand::Model {
                raw_args: "groq llama".to_owned()
            })
        );
        assert_eq!(
            parse_command("/voice hola mundo"),
            Some(BotCommand::Voice {
                raw_args: "hola mundo".to_owned()
            })
        );
    }

    #[test]
    fn parse_command_strips_bot_mentions_and_ignores_plain_text() {
        assert_eq!(
            parse_command("/model@CharlaBot google pro"),
            Some(BotCommand::Model {
                raw_args: "google pro".to_owned()
            })
        );
        assert_eq!(parse_command("hola"), None);
        assert_eq!(parse_command("/unknown"), None);
    }

    #[test]
    fn extract_message_text_prefers_text_then_caption() {
        assert_eq!(
            extract_message_text(&json!({"text": " hola "})).as_deref(),
            Some("hola")
        );
        assert_eq!(
            extract_message_text(&json!({"caption": "pie de foto"})).as_deref(),
            Some("pie de foto")
        );
        assert_eq!(extract_message_text(&json!({"text": "   "})), None);
        assert_eq!(extract_message_text(&json!({})), None);
    }

    fn temp_dir(name: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        std::env::temp_dir().join(format!("charla-handler-{name}-{stamp}"))
    }

    fn update(chat_id: i64, text: &str) -> Value {
        json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "chat": {"id": chat_id, "type": "private"},
                "from": {"id": chat_id, "is_bot": false, "first_name": "Alice", "username": "alice"},
                "text": text
            }
        })
    }

    async fn scenario_handler(
        root: &PathBuf,
        groq_url: String,
        telegram_url: String,
    ) -> BotHandler {
        let prompts_dir = root.join("prompts");
        tokio::fs::create_dir_all(&prompts_dir)
            .await
            .expect("prompts dir");
        tokio::fs::write(
            prompts_dir.join("prompt_template.txt"),
            "{{ meta_prompt }}|{{ summarized_context }}|{{ user_message }}",
        )
        .await
        .expect("template file");
        tokio::fs::write(prompts_dir.join("meta_prompt.md"), "META-OVERLAY")
            .await
            .expect("meta file");

        let mut cfg = Config::default();
        cfg.history.dir = root.join("history");
        cfg.prompts.dir = prompts_dir;

        let http = reqwest::Client::new();
        let client = TelegramClient::new("123:abc".to_owned(), http.clone(), Some(telegram_url))
            .with_retry_base_delay(Duration::from_millis(1));
        let store = HistoryStore::new(
            cfg.history.dir.clone(),
            cfg.history.max_messages,
            ModelProvider::Groq,
        );
        let prompts = PromptLibrary::load(&cfg.prompts);
        let dispatcher = ModelDispatcher::from_backends(
            Some(GroqBackend::new("gsk-test".to_owned(), http, Some(groq_url))),
            None,
        );
        BotHandler::new(cfg, client, store, prompts, dispatcher)
    }

    fn groq_reply(text: &str) -> (u16, String) {
        (
            200,
            json!({"choices": [{"message": {"content": text}}]}).to_string(),
        )
    }

    #[tokio::test]
    async fn meta_flag_latches_across_messages_until_deactivated() {
        let root = temp_dir("meta-latch");
        let (groq_url, groq_server) = spawn_http_server(vec![
            groq_reply("first"),
            groq_reply("second"),
            groq_reply("third"),
        ])
        .await;
        // Telegram mock answers every send with the default ok envelope.
        let (telegram_url, _telegram_server) = spawn_http_server(vec![]).await;
        let handler = scenario_handler(&root, groq_url, telegram_url).await;

        handler
            .process_update(&update(7, "reason about this"))
            .await
            .expect("first update");
        let record = handler.store.load(7).await;
        assert!(record.use_meta_prompt, "activation keyword latches the flag");
        assert_eq!(record.messages.len(), 2, "user turn and reply are stored");

        handler
            .process_update(&update(7, "tell me about rivers"))
            .await
            .expect("second update");
        let requests = groq_server.requests.lock().await;
        assert!(
            requests[1].contains("META-OVERLAY"),
            "unrelated follow-up still carries the latched overlay"
        );
        drop(requests);

        handler
            .process_update(&update(7, "stop using meta_prompt"))
            .await
            .expect("third update");
        let record = handler.store.load(7).await;
        assert!(!record.use_meta_prompt);
        let requests = groq_server.requests.lock().await;
        assert!(
            !requests[2].contains("META-OVERLAY"),
            "deactivated overlay no longer reaches the prompt"
        );

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn generation_failure_sends_fixed_reply_and_keeps_reply_out_of_history() {
        let root = temp_dir("gen-failure");
        let (groq_url, _groq_server) =
            spawn_http_server(vec![(500, "{\"error\":\"boom\"}".to_owned())]).await;
        let (telegram_url, telegram_server) = spawn_http_server(vec![]).await;
        let handler = scenario_handler(&root, groq_url, telegram_url).await;

        handler
            .process_update(&update(9, "hola"))
            .await
            .expect("update handled without bubbling the backend error");

        let record = handler.store.load(9).await;
        assert_eq!(record.messages.len(), 1, "only the user turn is stored");

        let requests = telegram_server.requests.lock().await;
        assert!(
            requests
                .iter()
                .any(|r| r.contains("sendMessage")),
            "a user-facing reply was still attempted"
        );

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn model_command_persists_provider_and_variant() {
        let root = temp_dir("model-cmd");
        let (groq_url, _groq_server) = spawn_http_server(vec![]).await;
        let (telegram_url, _telegram_server) = spawn_http_server(vec![]).await;
        let handler = scenario_handler(&root, groq_url, telegram_url).await;

        handler
            .process_update(&update(11, "/model google pro"))
            .await
            .expect("command handled");

        let record = handler.store.load(11).await;
        assert_eq!(record.model_provider, ModelProvider::Google);
        assert_eq!(record.model_name.as_deref(), Some("pro"));

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn bot_messages_are_ignored() {
        let root = temp_dir("bot-ignore");
        let (groq_url, groq_server) = spawn_http_server(vec![]).await;
        let (telegram_url, _telegram_server) = spawn_http_server(vec![]).await;
        let handler = scenario_handler(&root, groq_url, telegram_url).await;

        let bot_update = json!({
            "update_id": 2,
            "message": {
                "message_id": 20,
                "chat": {"id": 13, "type": "private"},
                "from": {"id": 99, "is_bot": true, "first_name": "OtherBot"},
                "text": "hola"
            }
        });
        handler.process_update(&bot_update).await.expect("ignored");
        assert_eq!(
            groq_server.hits.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        assert!(handler.store.load(13).await.messages.is_empty());

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
