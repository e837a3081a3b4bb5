use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::{broadcast, Notify};
use tracing::info;

use crabgrass_observability::{
    default_logs_dir, emit_event, init_process_logging, ProcessKind, SyncEvent,
};
use crabgrass_sync::backend::transcript_path;
use crabgrass_sync::{
    listener, ApiClient, ChatBackend, ClientEvent, CoherenceEndpoints, DocumentEndpoints,
    EventStreamClient, FileEditingSession, HttpEventTransport, ReconnectPolicy, SendOutcome,
    SessionChatEngine, SessionUpdate, StreamFault, SyncConfig,
};
use crabgrass_types::{DocumentRef, EntityRef, EntityType, EventKind, SessionTranscript};

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "crabgrass")]
#[command(about = "Live updates and agent chat for Crabgrass ideas and objectives")]
struct Cli {
    /// JSON config file layered over the defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Backend origin, e.g. http://127.0.0.1:8000.
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[arg(long, global = true)]
    dev_user: Option<String>,
    #[arg(long, global = true, env = "CRABGRASS_LOG_DIR")]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
struct Target {
    #[arg(long)]
    idea: Option<String>,
    #[arg(long)]
    objective: Option<String>,
}

impl Target {
    fn entity(&self) -> anyhow::Result<EntityRef> {
        match (&self.idea, &self.objective) {
            (Some(id), _) => Ok(EntityRef::idea(id.clone())),
            (None, Some(id)) => Ok(EntityRef::objective(id.clone())),
            (None, None) => anyhow::bail!("one of --idea or --objective is required"),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream live events. With --document, applies them to that document
    /// and prints session updates instead of raw events.
    Watch {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        document: Option<String>,
    },
    /// Send one message to a document's agent.
    Chat {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        document: Option<String>,
        /// Talk to the idea's coherence agent instead of a document agent.
        #[arg(long, conflicts_with = "document")]
        coherence: bool,
        /// Continue this session instead of the most recent one.
        #[arg(long, conflicts_with = "new")]
        session: Option<String>,
        /// Start a fresh session.
        #[arg(long, default_value_t = false)]
        new: bool,
        message: String,
    },
    /// List a document's chat sessions.
    Sessions {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        document: Option<String>,
        #[arg(long, conflicts_with = "document")]
        coherence: bool,
    },
    /// Print one session's messages.
    Transcript {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logs_dir = cli.log_dir.clone().unwrap_or_else(default_logs_dir);
    let (_log_guard, log_info) =
        init_process_logging(ProcessKind::Cli, &logs_dir, LOG_RETENTION_DAYS)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Cli,
        SyncEvent {
            status: Some("ok"),
            detail: Some("cli jsonl logging initialized"),
            ..SyncEvent::new("logging.initialized", "cli.main")
        },
    );
    info!("cli logging initialized: {:?}", log_info);

    let overrides = build_cli_overrides(cli.api_url.clone(), cli.dev_user.clone());
    let config =
        SyncConfig::load(cli.config.as_deref(), overrides).context("failed to load config")?;

    match cli.command {
        Command::Watch { target, document } => {
            let entity = target.entity()?;
            match document {
                Some(path) => {
                    let document = resolve_document(&entity, Some(&path))?;
                    watch_document(&config, entity, document).await?
                }
                None => watch_events(&config, entity).await?,
            }
        }
        Command::Chat {
            target,
            document,
            coherence,
            session,
            new,
            message,
        } => {
            let entity = target.entity()?;
            let backend = chat_backend(&config, entity, document.as_deref(), coherence)?;
            let engine = SessionChatEngine::new(backend, config.send_timeout());

            if new {
                engine.start_new_session();
            } else if let Some(id) = session {
                engine.load_session(&id).await?;
            } else {
                engine.hydrate().await?;
            }

            match engine.send(&message).await {
                SendOutcome::Delivered { session_id } => {
                    if let Some(reply) = engine.messages().last() {
                        println!("{}", reply.content);
                    }
                    eprintln!("session: {}", session_id);
                }
                SendOutcome::Failed { error } => anyhow::bail!("send failed: {}", error),
                SendOutcome::Ignored => anyhow::bail!("message is empty"),
            }
        }
        Command::Sessions {
            target,
            document,
            coherence,
        } => {
            let entity = target.entity()?;
            let backend = chat_backend(&config, entity, document.as_deref(), coherence)?;
            for session in backend.list_sessions().await? {
                println!(
                    "{}\t{}\t{}",
                    session.id,
                    session.last_active.as_deref().unwrap_or("-"),
                    session.title.as_deref().unwrap_or("")
                );
            }
        }
        Command::Transcript { target, session } => {
            let entity = target.entity()?;
            let Some(path) = transcript_path(&entity, &session) else {
                anyhow::bail!("session transcripts are only available for ideas");
            };
            let api = ApiClient::new(&config)?;
            let transcript: SessionTranscript = api.get(&path).await?;
            for message in transcript.messages {
                let message = message.into_chat_message();
                println!(
                    "[{}] {:?}: {}",
                    message.timestamp.to_rfc3339(),
                    message.role,
                    message.content
                );
            }
        }
    }

    Ok(())
}

fn build_cli_overrides(
    api_url: Option<String>,
    dev_user: Option<String>,
) -> Option<serde_json::Value> {
    if api_url.is_none() && dev_user.is_none() {
        return None;
    }
    let mut root = serde_json::Map::new();
    if let Some(url) = api_url {
        root.insert("base_url".to_string(), serde_json::Value::String(url));
    }
    if let Some(user) = dev_user {
        root.insert("dev_user".to_string(), serde_json::Value::String(user));
    }
    Some(serde_json::Value::Object(root))
}

/// Objectives default to their own file; ideas need an explicit path.
fn resolve_document(entity: &EntityRef, path: Option<&str>) -> anyhow::Result<DocumentRef> {
    match (path, entity.kind) {
        (Some(path), kind) => {
            DocumentRef::from_canonical_path(path, kind).map_err(|e| anyhow::anyhow!(e))
        }
        (None, EntityType::Objective) => Ok(DocumentRef::Objective),
        (None, EntityType::Idea) => {
            anyhow::bail!("--document is required for ideas (e.g. kernel/summary)")
        }
    }
}

fn chat_backend(
    config: &SyncConfig,
    entity: EntityRef,
    document: Option<&str>,
    coherence: bool,
) -> anyhow::Result<Arc<dyn ChatBackend>> {
    let api = ApiClient::new(config)?;
    if coherence {
        return Ok(Arc::new(CoherenceEndpoints::new(api, entity)?));
    }
    let document = resolve_document(&entity, document)?;
    Ok(Arc::new(DocumentEndpoints::new(api, entity, document)?))
}

async fn watch_events(config: &SyncConfig, entity: EntityRef) -> anyhow::Result<()> {
    let transport = Arc::new(HttpEventTransport::new(config)?);
    let client = EventStreamClient::new(entity, transport, ReconnectPolicy::from_config(config));
    let lost = Arc::new(Notify::new());

    let lost_signal = lost.clone();
    let printer = listener(move |event| {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Could not render event: {}", e),
        }
        if matches!(event, ClientEvent::Error(StreamFault::ConnectionLost { .. })) {
            lost_signal.notify_one();
        }
    });
    for kind in EventKind::INBOUND {
        client.on(kind, printer.clone());
    }
    client.on(EventKind::Error, printer);

    client.connect().await;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            client.disconnect().await;
            Ok(())
        }
        _ = lost.notified() => {
            anyhow::bail!("live updates unavailable for {}", client.entity())
        }
    }
}

async fn watch_document(
    config: &SyncConfig,
    entity: EntityRef,
    document: DocumentRef,
) -> anyhow::Result<()> {
    let session = FileEditingSession::over_http(config, entity, document)?;
    let mut updates = session.subscribe();
    session.open().await?;
    eprintln!(
        "watching {} ({} chars loaded)",
        session.document(),
        session.content().chars().count()
    );

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            update = updates.recv() => match update {
                Ok(update) => {
                    println!("{}", serde_json::to_string(&update)?);
                    if let SessionUpdate::LiveUpdatesUnavailable { .. } = update {
                        break Err(anyhow::anyhow!("live updates unavailable for {}", session.document()));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} session updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            }
        }
    };

    session.destroy().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crabgrass_types::KernelFileType;
    use serde_json::json;

    #[test]
    fn build_cli_overrides_only_sets_given_flags() {
        assert!(build_cli_overrides(None, None).is_none());
        let overrides =
            build_cli_overrides(Some("http://10.0.0.2:8000".to_string()), None).expect("some");
        assert_eq!(overrides, json!({"base_url": "http://10.0.0.2:8000"}));
    }

    #[test]
    fn resolve_document_defaults_objective_file() {
        let objective = EntityRef::objective("o-1");
        assert_eq!(
            resolve_document(&objective, None).unwrap(),
            DocumentRef::Objective
        );
        let idea = EntityRef::idea("42");
        assert_eq!(
            resolve_document(&idea, Some("kernel/summary")).unwrap(),
            DocumentRef::kernel(KernelFileType::Summary)
        );
        assert!(resolve_document(&idea, None).is_err());
    }

    #[test]
    fn cli_requires_exactly_one_target() {
        assert!(Cli::try_parse_from(["crabgrass", "sessions", "--document", "kernel/summary"]).is_err());
        assert!(Cli::try_parse_from([
            "crabgrass", "watch", "--idea", "1", "--objective", "2"
        ])
        .is_err());
        let cli = Cli::try_parse_from(["crabgrass", "chat", "--idea", "42", "--document", "kernel/summary", "hello"])
            .expect("parse");
        assert!(matches!(cli.command, Command::Chat { new: false, coherence: false, .. }));
    }

    #[test]
    fn coherence_chat_needs_no_document() {
        let cli = Cli::try_parse_from(["crabgrass", "chat", "--idea", "42", "--coherence", "hi"])
            .expect("parse");
        assert!(matches!(cli.command, Command::Chat { coherence: true, document: None, .. }));
        assert!(Cli::try_parse_from([
            "crabgrass", "sessions", "--idea", "42", "--coherence", "--document", "kernel/summary"
        ])
        .is_err());

        let config = SyncConfig::default();
        assert!(chat_backend(&config, EntityRef::idea("42"), None, true).is_ok());
        assert!(chat_backend(&config, EntityRef::objective("o-1"), None, true).is_err());
    }
}
