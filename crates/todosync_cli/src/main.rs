//! Command-line front end for a local todosync database.
//!
//! # Responsibility
//! - Drive todo mutations and sync passes from a terminal.
//! - Sync against a loopback remote stored in a second SQLite file.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use todosync_core::{
    init_logging, LoopbackRemote, NetworkState, PassOutcome, SqliteKvStore, SyncConfig,
    SyncEngine, SyncError, TodoId, TodoListQuery, TodoStatus,
};

#[derive(Debug, Parser)]
#[command(name = "todosync", version, about = "Offline-first todo store with sync")]
struct Cli {
    #[command(flatten)]
    paths: Paths,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct Paths {
    /// Local database file.
    #[arg(long, global = true, default_value = "todosync.sqlite3")]
    db: PathBuf,
    /// Loopback remote database file used by `sync`.
    #[arg(long, global = true, default_value = "todosync-remote.sqlite3")]
    remote_db: PathBuf,
    /// `SyncConfig` JSON file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Absolute directory for rolling log files.
    #[arg(long, global = true)]
    log_dir: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a todo.
    Add {
        title: String,
        #[arg(long)]
        notes: Option<String>,
        /// Due time as Unix epoch milliseconds.
        #[arg(long)]
        due_at: Option<i64>,
    },
    /// List todos.
    List {
        /// Include done and cancelled todos.
        #[arg(long)]
        all: bool,
    },
    /// Mark a todo done.
    Done { id: TodoId },
    /// Show change records awaiting delivery.
    Pending,
    /// Push pending changes to the loopback remote.
    Sync,
    /// Show sync status.
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    if let Some(log_dir) = &cli.paths.log_dir {
        init_logging("info", log_dir).map_err(|err| err.to_string())?;
    }
    let engine = open_engine(&cli.paths)?;
    let show_status = matches!(cli.command, Command::Status);

    match cli.command {
        Command::Add {
            title,
            notes,
            due_at,
        } => {
            let todo = engine
                .todos()
                .create_todo(title, notes, due_at)
                .map_err(describe)?;
            println!("{}", todo.id);
        }
        Command::List { all } => {
            let query = TodoListQuery {
                status: None,
                include_closed: all,
            };
            for todo in engine.todos().list_todos(&query).map_err(describe)? {
                println!("{}  [{}]  {}", todo.id, todo.status.as_str(), todo.title);
            }
        }
        Command::Done { id } => {
            engine
                .todos()
                .set_status(id, TodoStatus::Done)
                .map_err(describe)?;
        }
        Command::Pending => {
            for record in engine.change_log().pending_records() {
                let line = serde_json::json!({
                    "id": record.id,
                    "operation": record.operation.as_str(),
                    "entity": format!("{}/{}", record.entity_type, record.entity_id),
                    "status": record.sync_status.as_str(),
                    "attempts": record.attempts,
                    "last_error": record.last_error,
                });
                println!("{line}");
            }
        }
        Command::Sync => {
            engine.report_network(NetworkState::Online);
            let outcome = engine.sync_now().map_err(describe)?;
            println!("{}", describe_outcome(&outcome));
            engine.change_log().compact_synced();
        }
        Command::Status => {}
    }

    let status = engine.status();
    let json = serde_json::to_string(&status).map_err(|err| err.to_string())?;
    if show_status {
        println!("{json}");
    } else {
        eprintln!("{}", status.summary());
    }
    Ok(())
}

fn open_engine(paths: &Paths) -> Result<SyncEngine, String> {
    let mut config = match &paths.config {
        Some(path) => SyncConfig::from_json_file(path).map_err(|err| err.to_string())?,
        None => SyncConfig::default(),
    };
    // The CLI reports connectivity itself; debounce only delays it.
    config.network_dwell_ms = 0;

    let store = SqliteKvStore::open(&paths.db).map_err(|err| err.to_string())?;
    let remote_store = SqliteKvStore::open(&paths.remote_db).map_err(|err| err.to_string())?;
    SyncEngine::builder(
        config,
        Arc::new(store),
        Arc::new(LoopbackRemote::new(Arc::new(remote_store))),
    )
    .build()
    .map_err(describe)
}

fn describe(err: SyncError) -> String {
    format!("{} ({})", err, err.kind().code())
}

fn describe_outcome(outcome: &PassOutcome) -> String {
    match outcome {
        PassOutcome::Skipped(reason) => format!("skipped: {}", reason.as_str()),
        PassOutcome::Completed(summary) => format!(
            "synced {} record(s), resolved {} conflict(s)",
            summary.synced, summary.resolved
        ),
        PassOutcome::Failed {
            summary,
            retry_at_ms,
        } => format!(
            "{} record(s) failed; retry after {retry_at_ms}",
            summary.failed
        ),
        PassOutcome::Cancelled(summary) => {
            format!("cancelled after {} record(s)", summary.synced)
        }
    }
}
