//! FFI use-case API for Flutter-facing calls.
//!
//! # Responsibility
//! - Expose todo mutations, connectivity reports and sync status to Dart.
//! - Keep error semantics simple: envelopes with `ok` + message, or an empty
//!   string on success.
//!
//! # Invariants
//! - Exported functions never panic across the FFI boundary.
//! - One engine per process, opened by `engine_open`.

use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;
use todosync_core::{
    core_version as core_version_inner, init_logging as init_logging_inner, ping as ping_inner,
    LoopbackRemote, NetworkState, SqliteKvStore, SyncConfig, SyncEngine,
    SyncStatusView, Todo, TodoId, TodoListQuery, TodoStatus,
};
use uuid::Uuid;

static ENGINE: OnceCell<OpenEngine> = OnceCell::new();

struct OpenEngine {
    db_path: PathBuf,
    engine: SyncEngine,
}

/// Minimal health-check API for FRB smoke integration.
#[flutter_rust_bridge::frb(sync)]
pub fn ping() -> String {
    ping_inner().to_owned()
}

#[flutter_rust_bridge::frb(sync)]
pub fn core_version() -> String {
    core_version_inner().to_owned()
}

/// Initializes core logging once per process.
///
/// Returns an empty string on success and the error message otherwise.
/// Repeating the call with the same `level + log_dir` is a no-op.
#[flutter_rust_bridge::frb(sync)]
pub fn init_logging(level: String, log_dir: String) -> String {
    match init_logging_inner(level.as_str(), log_dir.as_str()) {
        Ok(()) => String::new(),
        Err(err) => err.to_string(),
    }
}

/// Opens the process-wide engine.
///
/// Input semantics:
/// - `db_path`: SQLite file holding the change log and local state.
/// - `remote_db_path`: SQLite file backing the loopback remote.
/// - `config_json`: optional `SyncConfig` JSON; defaults otherwise.
///
/// # FFI contract
/// - Reopening with the same `db_path` is a no-op; another path is an error.
/// - Returns an empty string on success and the error message otherwise.
#[flutter_rust_bridge::frb(sync)]
pub fn engine_open(db_path: String, remote_db_path: String, config_json: Option<String>) -> String {
    let db_path = PathBuf::from(db_path.trim());
    let opened = ENGINE.get_or_try_init(|| {
        let config = match config_json.as_deref() {
            Some(json) if !json.trim().is_empty() => {
                SyncConfig::from_json_str(json).map_err(|err| err.to_string())?
            }
            _ => SyncConfig::default(),
        };
        let store = SqliteKvStore::open(&db_path).map_err(|err| err.to_string())?;
        let remote_store =
            SqliteKvStore::open(remote_db_path.trim()).map_err(|err| err.to_string())?;
        let engine = SyncEngine::builder(
            config,
            Arc::new(store),
            Arc::new(LoopbackRemote::new(Arc::new(remote_store))),
        )
        .build()
        .map_err(|err| err.to_string())?;
        Ok::<OpenEngine, String>(OpenEngine {
            db_path: db_path.clone(),
            engine,
        })
    });
    match opened {
        Ok(open) if open.db_path == db_path => String::new(),
        Ok(open) => format!(
            "engine already open at `{}`; refusing to switch to `{}`",
            open.db_path.display(),
            db_path.display()
        ),
        Err(err) => err,
    }
}

/// Todo row shown by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoItem {
    pub id: String,
    pub title: String,
    pub notes: Option<String>,
    /// `todo|in_progress|done|cancelled`.
    pub status: String,
    pub due_at: Option<i64>,
    pub updated_at: i64,
}

/// Result envelope for todo mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoActionResponse {
    pub ok: bool,
    pub todo_id: Option<String>,
    /// Error code (`validation_error`, ...) on failure.
    pub error_code: Option<String>,
    pub message: String,
}

impl TodoActionResponse {
    fn success(message: impl Into<String>, todo_id: TodoId) -> Self {
        Self {
            ok: true,
            todo_id: Some(todo_id.to_string()),
            error_code: None,
            message: message.into(),
        }
    }

    fn failure(error_code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            todo_id: None,
            error_code: error_code.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Sync status for the status bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatusResponse {
    /// `idle|syncing|backoff_wait`, or `closed` before `engine_open`.
    pub state: String,
    pub network: String,
    pub pending_count: u32,
    pub last_sync_at: Option<i64>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<i64>,
    /// Display text such as `3 changes pending`.
    pub summary: String,
}

#[flutter_rust_bridge::frb(sync)]
pub fn todo_create(title: String, notes: Option<String>, due_at: Option<i64>) -> TodoActionResponse {
    let Some(engine) = engine() else {
        return TodoActionResponse::failure(None, "engine is not open");
    };
    match engine.todos().create_todo(title, notes, due_at) {
        Ok(todo) => TodoActionResponse::success("Todo created.", todo.id),
        Err(err) => TodoActionResponse::failure(Some(err.kind().code()), err.to_string()),
    }
}

/// Sets the status (`todo|in_progress|done|cancelled`) of a todo.
#[flutter_rust_bridge::frb(sync)]
pub fn todo_set_status(todo_id: String, status: String) -> TodoActionResponse {
    let Some(engine) = engine() else {
        return TodoActionResponse::failure(None, "engine is not open");
    };
    let Ok(id) = Uuid::parse_str(todo_id.trim()) else {
        return TodoActionResponse::failure(Some("validation_error"), "todo_id is not a UUID");
    };
    let Some(status) = TodoStatus::parse(&status) else {
        return TodoActionResponse::failure(
            Some("validation_error"),
            format!("unsupported status `{status}`"),
        );
    };
    match engine.todos().set_status(id, status) {
        Ok(todo) => TodoActionResponse::success("Todo updated.", todo.id),
        Err(err) => TodoActionResponse::failure(Some(err.kind().code()), err.to_string()),
    }
}

/// Lists todos, newest first. Returns an empty list when the engine is closed.
#[flutter_rust_bridge::frb(sync)]
pub fn todo_list(include_closed: bool) -> Vec<TodoItem> {
    let Some(engine) = engine() else {
        return Vec::new();
    };
    let query = TodoListQuery {
        status: None,
        include_closed,
    };
    match engine.todos().list_todos(&query) {
        Ok(todos) => todos.into_iter().map(to_todo_item).collect(),
        Err(err) => {
            log::warn!(
                "event=ffi_todo_list module=ffi status=error error_code={}",
                err.kind().code()
            );
            Vec::new()
        }
    }
}

/// Reports host connectivity (`online|offline|degraded`).
///
/// Returns an empty string on success and the error message otherwise.
#[flutter_rust_bridge::frb(sync)]
pub fn network_report(state: String) -> String {
    let Some(engine) = engine() else {
        return "engine is not open".to_string();
    };
    match NetworkState::parse(&state) {
        Some(state) => {
            engine.report_network(state);
            String::new()
        }
        None => format!("unsupported network state `{state}`"),
    }
}

/// Drives the sync state machine once and returns the resulting status.
#[flutter_rust_bridge::frb(sync)]
pub fn sync_poll() -> SyncStatusResponse {
    let Some(engine) = engine() else {
        return closed_status();
    };
    match engine.poll() {
        Ok(_) => to_status_response(&engine.status()),
        Err(err) => {
            let mut response = to_status_response(&engine.status());
            response.last_error = Some(err.to_string());
            response
        }
    }
}

#[flutter_rust_bridge::frb(sync)]
pub fn sync_status() -> SyncStatusResponse {
    match engine() {
        Some(engine) => to_status_response(&engine.status()),
        None => closed_status(),
    }
}

fn engine() -> Option<&'static SyncEngine> {
    ENGINE.get().map(|open| &open.engine)
}

fn to_todo_item(todo: Todo) -> TodoItem {
    TodoItem {
        id: todo.id.to_string(),
        title: todo.title,
        notes: todo.notes,
        status: todo.status.as_str().to_string(),
        due_at: todo.due_at,
        updated_at: todo.updated_at,
    }
}

fn to_status_response(view: &SyncStatusView) -> SyncStatusResponse {
    SyncStatusResponse {
        state: view.state.as_str().to_string(),
        network: view.network.as_str().to_string(),
        pending_count: u32::try_from(view.pending_count).unwrap_or(u32::MAX),
        last_sync_at: view.last_sync_at,
        last_error: view.last_error.clone(),
        next_retry_at: view.next_retry_at,
        summary: view.summary(),
    }
}

fn closed_status() -> SyncStatusResponse {
    SyncStatusResponse {
        state: "closed".to_string(),
        network: NetworkState::Offline.as_str().to_string(),
        pending_count: 0,
        last_sync_at: None,
        last_error: None,
        next_retry_at: None,
        summary: "engine is not open".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        core_version, engine_open, init_logging, network_report, ping, sync_poll, sync_status,
        todo_create, todo_list, todo_set_status,
    };
    use uuid::Uuid;

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }

    #[test]
    fn init_logging_rejects_empty_log_dir() {
        let error = init_logging("info".to_string(), String::new());
        assert!(!error.is_empty());
    }

    // Single test for the process-wide engine so ordering is deterministic.
    #[test]
    fn engine_lifecycle_through_ffi() {
        let dir = std::env::temp_dir().join(format!("todosync-ffi-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let db = dir.join("local.sqlite3").to_string_lossy().to_string();
        let remote = dir.join("remote.sqlite3").to_string_lossy().to_string();
        let config = r#"{"device_id":"ffi-test","network_dwell_ms":0}"#.to_string();

        assert_eq!(engine_open(db.clone(), remote.clone(), Some(config.clone())), "");
        assert_eq!(engine_open(db.clone(), remote.clone(), Some(config)), "");
        assert!(!engine_open(format!("{db}.other"), remote, None).is_empty());

        let blank = todo_create("  ".to_string(), None, None);
        assert!(!blank.ok);
        assert_eq!(blank.error_code.as_deref(), Some("validation_error"));

        let created = todo_create("buy milk".to_string(), None, None);
        assert!(created.ok, "{}", created.message);
        let id = created.todo_id.expect("created todo id");
        assert!(todo_set_status(id.clone(), "done".to_string()).ok);
        assert!(!todo_set_status(id, "later".to_string()).ok);
        assert_eq!(todo_list(true).len(), 1);
        assert!(todo_list(false).is_empty());

        let offline = sync_status();
        assert_eq!(offline.network, "offline");
        assert_eq!(offline.pending_count, 2);

        assert!(!network_report("wifi".to_string()).is_empty());
        assert_eq!(network_report("online".to_string()), "");
        let synced = sync_poll();
        assert_eq!(synced.state, "idle");
        assert_eq!(synced.pending_count, 0);
        assert_eq!(synced.summary, "up to date");
    }
}
