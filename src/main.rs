mod config;
mod handler;
mod history;
mod images;
mod prompts;
mod providers;
mod summarizer;
mod telegram;
#[cfg(test)]
mod testutil;
mod voice;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Telegram chat bot bridging Groq and Google Gemini")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "CHARLA_CONFIG",
        default_value = "charla-bot.toml"
    )]
    config: PathBuf,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "CHARLA_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the bot (default).
    Run,
    /// Run non-interactive environment diagnostics.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    match cli.command.clone().unwrap_or(CliCommand::Run) {
        CliCommand::Run => run_bot(cli).await,
        CliCommand::Doctor(args) => run_doctor(&cli.config, args),
    }
}

async fn run_bot(cli: Cli) -> Result<()> {
    let cfg = Config::load(&cli.config)?;
    cfg.ensure_credentials()?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.telegram.http_timeout_secs))
        .build()
        .context("failed building http client")?;

    let client = telegram::TelegramClient::new(cfg.telegram.bot_token.clone(), http.clone(), None);
    let store = history::HistoryStore::new(
        cfg.history.dir.clone(),
        cfg.history.max_messages,
        cfg.models.default_provider,
    );
    let prompt_library = prompts::PromptLibrary::load(&cfg.prompts);
    if !prompt_library.has_template() {
        warn!("core prompt template missing; replies degrade to a fixed fallback");
    }
    let dispatcher = providers::ModelDispatcher::from_config(&cfg.models, http);

    let bot = handler::BotHandler::new(cfg, client, store, prompt_library, dispatcher);

    info!("charla-bot started, press Ctrl+C to stop");
    tokio::select! {
        _ = bot.run() => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("sigterm handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn run_doctor(config_path: &Path, args: DoctorArgs) -> Result<()> {
    let config_result = Config::load(config_path).map_err(|err| err.to_string());
    let report = build_doctor_report(config_result, config_path);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
) -> DoctorReport {
    let mut checks = Vec::new();
    let mut config = None;

    match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: format!("loaded {}", config_path.display()),
            });
            config = Some(cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}: {err}", config_path.display()),
            });
        }
    }

    if let Some(cfg) = config.as_ref() {
        let token_set = !cfg.telegram.bot_token.trim().is_empty();
        checks.push(DoctorCheck {
            id: "telegram.bot_token".to_owned(),
            status: if token_set { "pass" } else { "fail" }.to_owned(),
            message: if token_set {
                "bot token is set".to_owned()
            } else {
                "bot token is missing (telegram.bot_token or CHARLA_TELEGRAM_TOKEN)".to_owned()
            },
        });

        let any_key = cfg.has_any_model_key();
        checks.push(DoctorCheck {
            id: "models.credentials".to_owned(),
            status: if any_key { "pass" } else { "fail" }.to_owned(),
            message: if any_key {
                "at least one model API key is set".to_owned()
            } else {
                "no model API key configured".to_owned()
            },
        });

        let template_path = cfg.prompts.dir.join(&cfg.prompts.template_file);
        let template_present = template_path.exists();
        checks.push(DoctorCheck {
            id: "prompts.template".to_owned(),
            status: if template_present { "pass" } else { "warn" }.to_owned(),
            message: if template_present {
                format!("template found at {}", template_path.display())
            } else {
                format!(
                    "template missing at {}; replies degrade to a fixed fallback",
                    template_path.display()
                )
            },
        });

        let history_writable = std::fs::create_dir_all(&cfg.history.dir).is_ok();
        checks.push(DoctorCheck {
            id: "history.dir".to_owned(),
            status: if history_writable { "pass" } else { "fail" }.to_owned(),
            message: format!("{}", cfg.history.dir.display()),
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        println!(
            "[{}] {}: {}",
            check.status.to_uppercase(),
            check.id,
            check.message
        );
    }
}

fn init_logging(filter: &str) {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn cli_parses_doctor_command_and_flags() {
        let cli = Cli::parse_from(["charla-bot", "doctor", "--json"]);
        match cli.command {
            Some(CliCommand::Doctor(args)) => assert!(args.json),
            _ => panic!("expected doctor command"),
        }
    }

    #[test]
    fn cli_defaults_to_run_with_default_config_path() {
        let cli = Cli::parse_from(["charla-bot"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("charla-bot.toml"));
        assert_eq!(cli.log, "info");
    }

    #[test]
    fn doctor_report_marks_config_load_failure_as_blocking() {
        let report = build_doctor_report(
            Err("invalid config".to_owned()),
            Path::new("charla-bot.toml"),
        );
        assert!(!report.ok);
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "config.load" && check.status == "fail"));
    }

    #[test]
    fn doctor_report_fails_without_credentials() {
        let report = build_doctor_report(Ok(Config::default()), Path::new("charla-bot.toml"));
        assert!(!report.ok);
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "telegram.bot_token" && check.status == "fail"));
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "models.credentials" && check.status == "fail"));
    }

    #[test]
    fn doctor_report_warns_but_passes_on_missing_template() {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("charla-doctor-{stamp}"));

        let mut cfg = Config::default();
        cfg.telegram.bot_token = "123:abc".to_owned();
        cfg.models.groq_api_key = Some("gsk-test".to_owned());
        cfg.history.dir = root.join("history");
        cfg.prompts.dir = root.join("prompts");

        let report = build_doctor_report(Ok(cfg), Path::new("charla-bot.toml"));
        assert!(report.ok, "missing template degrades but does not block");
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "prompts.template" && check.status == "warn"));

        let _ = std::fs::remove_dir_all(&root);
    }
}
