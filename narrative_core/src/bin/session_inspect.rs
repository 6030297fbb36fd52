//! session-inspect - read-only view of stored sessions.
//!
//! Usage:
//!   session-inspect list                   List stored sessions, newest first
//!   session-inspect summary <id>           Scene and event counts
//!   session-inspect events <id> [filters]  Print events in chronological order
//!   session-inspect context <id>           Print the assembled narrator context

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use narrative_core::{
    ContextAssembler, EngineConfig, EventFilter, EventType, JsonFileStore, SceneId, SessionId,
    SessionLog, SessionStore,
};

#[derive(Parser)]
#[command(name = "session-inspect", about = "Inspect stored narrative sessions")]
struct Cli {
    /// Engine configuration file.
    #[arg(long, global = true, default_value = "narrative.toml")]
    config: PathBuf,

    /// Overrides the configured session directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored sessions.
    List,

    /// Show aggregate counts for a session.
    Summary { session_id: String },

    /// Print the events of a session.
    Events {
        session_id: String,

        /// Only events of this type (e.g. `dice_roll`).
        #[arg(long = "type")]
        event_type: Option<String>,

        #[arg(long)]
        actor: Option<String>,

        /// Only events of this scene number.
        #[arg(long)]
        scene: Option<u32>,
    },

    /// Print the context the narrator would receive.
    Context { session_id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::load(Some(&cli.config))
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let data_dir = cli.data_dir.unwrap_or(config.storage.data_dir.clone());
    let store = Arc::new(JsonFileStore::new(&data_dir));

    match cli.command {
        Commands::List => {
            let listings = store
                .list()
                .with_context(|| format!("listing sessions in {}", data_dir.display()))?;
            if listings.is_empty() {
                println!("No sessions in {}", data_dir.display());
            }
            for listing in listings {
                println!(
                    "{}  {}  {} scene(s)",
                    listing.session_id,
                    listing.created_at.format("%Y-%m-%d %H:%M:%S"),
                    listing.scene_count
                );
            }
        }
        Commands::Summary { session_id } => {
            let log = open(store, &session_id)?;
            let summary = log.summary();
            println!("Session {}", summary.session_id);
            println!("Created: {}", summary.created_at);
            println!(
                "Scenes: {} ({} closed)",
                summary.scene_count, summary.closed_scene_count
            );
            match (&summary.active_scene_id, &summary.active_scene_title) {
                (Some(id), Some(title)) => println!("Active: {} '{}'", id, title),
                _ => println!("Active: none"),
            }
            println!("Events: {}", summary.event_count);
            for (event_type, count) in &summary.events_by_type {
                println!("  {:<14} {}", event_type.as_str(), count);
            }
        }
        Commands::Events {
            session_id,
            event_type,
            actor,
            scene,
        } => {
            let log = open(store, &session_id)?;
            let mut filter = EventFilter::new();
            if let Some(raw) = event_type {
                let Some(parsed) = EventType::parse(&raw) else {
                    let known: Vec<_> = EventType::ALL.iter().map(|t| t.as_str()).collect();
                    bail!("unknown event type '{}' (expected one of {})", raw, known.join(", "));
                };
                filter = filter.of_type(parsed);
            }
            if let Some(actor) = actor {
                filter = filter.by_actor(actor);
            }
            if let Some(scene) = scene {
                filter = filter.in_scene(SceneId(scene));
            }

            for event in log.query_events(&filter) {
                println!(
                    "{} {} [{}] {}: {}",
                    event.id,
                    event.timestamp.format("%H:%M:%S"),
                    event.event_type,
                    event.actor,
                    event.content
                );
            }
        }
        Commands::Context { session_id } => {
            let log = open(store, &session_id)?;
            let assembler = ContextAssembler::new(
                config.context.context_config(),
                config.context.meter.build(),
            );
            let context = assembler.assemble(log.session());
            println!("{}", context.to_prompt_string(log.session()));
            eprintln!(
                "{} item(s), size {} (protected {}), {} dropped",
                context.items.len(),
                context.size,
                context.protected_size,
                context.dropped
            );
        }
    }

    Ok(())
}

fn open(store: Arc<JsonFileStore>, raw_id: &str) -> Result<SessionLog> {
    let id: SessionId = raw_id
        .parse()
        .with_context(|| format!("'{}' is not a session id", raw_id))?;
    SessionLog::load(store, id).with_context(|| format!("loading session {}", raw_id))
}
