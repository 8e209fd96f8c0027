//! Session-scoped interval log for backend client states.
//!
//! Persists contiguous `[ts_start, ts_end)` state intervals per client into
//! SQLite, isolated per run (one process lifetime = one run). A heartbeat
//! row per run lets the next startup close out intervals left dangling by a
//! crash: any run without `end_ts` whose heartbeat is older than the grace
//! window is stamped closed at its last heartbeat.
//!
//! The log is the single consumer of the client event channels; interval
//! writes never happen inside a client or manager lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::BackendClient;
use crate::events::{self, ClientEvent, EventSink, EventStream};
use crate::types::{now_ts, ClientStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS run_meta (
    run_id TEXT PRIMARY KEY,
    start_ts REAL NOT NULL,
    last_heartbeat_ts REAL,
    end_ts REAL,
    pid INTEGER,
    host TEXT
);

CREATE TABLE IF NOT EXISTS client_state_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    ts_start REAL NOT NULL,
    ts_end REAL,
    client_name TEXT NOT NULL,
    model_name TEXT,
    state TEXT NOT NULL,
    is_health_check INTEGER DEFAULT 0,
    error_code TEXT,
    error_type TEXT,
    extra_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_log_run_client_ts
    ON client_state_log(run_id, client_name, ts_start);
"#;

/// Timeline color legend, fixed so every UI run renders identically.
pub fn legend() -> serde_json::Value {
    json!({
        "RUN_SUCCESS": "#22c55e",
        "RUN_FAIL": "#ef4444",
        "RUNNING": "#f59e0b",
        "IDLE_OK": "#e5e7eb",
        "IDLE_ERROR": "#fb923c",
        "UNAVAILABLE": "#6b7280",
        "UNKNOWN": "#93c5fd",
    })
}

/// Logical state of one interval row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalState {
    Running,
    RunSuccess,
    RunFail,
    IdleOk,
    IdleError,
    Unavailable,
    Unknown,
}

impl IntervalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalState::Running => "RUNNING",
            IntervalState::RunSuccess => "RUN_SUCCESS",
            IntervalState::RunFail => "RUN_FAIL",
            IntervalState::IdleOk => "IDLE_OK",
            IntervalState::IdleError => "IDLE_ERROR",
            IntervalState::Unavailable => "UNAVAILABLE",
            IntervalState::Unknown => "UNKNOWN",
        }
    }

    /// Idle interval state mirroring a client status.
    fn idle_for(status: ClientStatus) -> Self {
        match status {
            ClientStatus::Unavailable => IntervalState::Unavailable,
            ClientStatus::Error | ClientStatus::Unknown => IntervalState::IdleError,
            ClientStatus::Available => IntervalState::IdleOk,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateLogConfig {
    pub db_path: PathBuf,
    /// Auto-generated (`yyyymmdd_hhmmss_<pid>_<uuid8>`) when absent.
    pub run_id: Option<String>,
    pub heartbeat_interval_sec: u64,
    pub heartbeat_grace_sec: u64,
}

impl Default for StateLogConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./ai_fleet_state.sqlite"),
            run_id: None,
            heartbeat_interval_sec: 30,
            heartbeat_grace_sec: 120,
        }
    }
}

/// Recent session row for the timeline UI.
#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub run_id: String,
    pub start_ts: f64,
    pub end_ts: Option<f64>,
    pub last_heartbeat_ts: Option<f64>,
    pub pid: i64,
    pub host: String,
}

/// One clipped timeline segment.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineItem {
    pub client: String,
    pub model: Option<String>,
    pub state: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineResponse {
    pub run_id: String,
    pub window: TimelineWindow,
    pub clients: Vec<String>,
    pub items: Vec<TimelineItem>,
    pub legend: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineWindow {
    pub from: f64,
    pub to: f64,
}

#[derive(Debug, Clone)]
struct OpenInterval {
    row_id: i64,
    state: IntervalState,
    model: Option<String>,
}

struct LogInner {
    conn: Connection,
    /// Open interval per client; invariant: at most one per client.
    open: HashMap<String, OpenInterval>,
}

pub struct StateLog {
    run_id: String,
    heartbeat_interval: Duration,
    heartbeat_grace: f64,
    sink: EventSink,
    stream: Mutex<Option<EventStream>>,
    inner: Mutex<LogInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StateLog {
    /// Open (and create if needed) the store, register this run and heal any
    /// runs that died without a graceful stop.
    pub fn open(config: StateLogConfig) -> Result<Self> {
        let run_id = config.run_id.unwrap_or_else(generate_run_id);
        let conn = open_connection(&config.db_path)?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize state log schema")?;

        let (sink, stream) = events::channel();
        let log = Self {
            run_id,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_sec.max(1)),
            heartbeat_grace: config.heartbeat_grace_sec as f64,
            sink,
            stream: Mutex::new(Some(stream)),
            inner: Mutex::new(LogInner {
                conn,
                open: HashMap::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        };

        log.register_run_meta()?;
        log.reconcile_stale_runs()?;
        Ok(log)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Spawn the heartbeat writer and the event consumer. Safe to call once;
    /// later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let Some(mut stream) = self.stream.lock().unwrap_or_else(|e| e.into_inner()).take()
        else {
            return;
        };

        let consumer = {
            let log = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = stream.recv().await {
                    if let Err(err) = log.handle_event(event) {
                        warn!(error = %err, "state log failed to persist event");
                    }
                }
            })
        };

        let heartbeat = {
            let log = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(log.heartbeat_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Err(err) = log.touch_heartbeat(now_ts()) {
                        warn!(error = %err, "heartbeat write failed");
                    }
                }
            })
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(consumer);
        tasks.push(heartbeat);
        info!(run_id = %self.run_id, "state log started");
    }

    /// Best-effort orderly shutdown: close every open interval and stamp the
    /// run's `end_ts`. A crash that skips this is healed by reconciliation
    /// on the next start.
    pub fn stop(&self) {
        let now = now_ts();

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let names: Vec<String> = inner.open.keys().cloned().collect();
            for name in names {
                if let Err(err) = close_interval(&mut inner, &name, now, None, None, None) {
                    warn!(error = %err, client = %name, "failed to close interval on stop");
                }
            }
            if let Err(err) = inner.conn.execute(
                "UPDATE run_meta SET end_ts = ?1 WHERE run_id = ?2 AND end_ts IS NULL",
                (now, &self.run_id),
            ) {
                warn!(error = %err, "failed to stamp run end");
            }
        }

        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        info!(run_id = %self.run_id, "state log stopped");
    }

    /// Wire a client's event channel into this log and open its baseline
    /// idle interval so the timeline starts at registration.
    pub fn attach_client(&self, client: &BackendClient) {
        client.set_event_sink(self.sink.clone());

        let ts = now_ts();
        let state = IntervalState::idle_for(client.status());
        let model = Some(client.current_model());
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.open.contains_key(client.name()) {
            let _ = close_interval(&mut inner, client.name(), ts, None, None, None);
        }
        if let Err(err) = open_interval(
            &mut inner,
            &self.run_id,
            client.name(),
            state,
            model,
            ts,
            false,
            json!({"event": "register"}),
        ) {
            warn!(error = %err, client = %client.name(), "failed to open baseline interval");
        }
    }

    /// Fold one client event into the interval store.
    pub fn handle_event(&self, event: ClientEvent) -> Result<()> {
        self.touch_heartbeat(event.ts())?;

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match event {
            ClientEvent::ChatStart {
                client,
                model,
                ts,
                is_health_check,
            } => ensure_state(
                &mut inner,
                &self.run_id,
                &client,
                IntervalState::Running,
                model,
                ts,
                is_health_check,
                json!({"event": "chat_start"}),
            ),
            ClientEvent::ChatEnd {
                client,
                model,
                ts,
                is_health_check,
                success,
                error_kind,
                error_code,
                status,
            } => {
                let final_state = if success {
                    IntervalState::RunSuccess
                } else {
                    IntervalState::RunFail
                };
                let error_type = error_kind.map(|k| k.as_str().to_string());
                close_interval(
                    &mut inner,
                    &client,
                    ts,
                    Some(final_state),
                    error_type,
                    error_code,
                )?;
                // The client settles into an idle interval matching its
                // post-chat status.
                open_interval(
                    &mut inner,
                    &self.run_id,
                    &client,
                    IntervalState::idle_for(status),
                    model,
                    ts,
                    is_health_check,
                    json!({"event": "idle_after_chat", "success": success}),
                )
            }
            ClientEvent::StatusChange {
                client,
                ts,
                old_status,
                new_status,
            } => {
                // Never interrupt an in-flight call; the chat_end event will
                // pick up the final status.
                if inner
                    .open
                    .get(&client)
                    .map(|o| o.state == IntervalState::Running)
                    .unwrap_or(false)
                {
                    return Ok(());
                }
                ensure_state(
                    &mut inner,
                    &self.run_id,
                    &client,
                    IntervalState::idle_for(new_status),
                    None,
                    ts,
                    false,
                    json!({
                        "event": "status_change",
                        "old": old_status.as_str(),
                        "new": new_status.as_str(),
                    }),
                )
            }
        }
    }

    /// Close runs that never wrote `end_ts` and whose heartbeat expired,
    /// stamping both the run and its dangling intervals at the last
    /// heartbeat. Idempotent: healed runs no longer match the filter.
    pub fn reconcile_stale_runs(&self) -> Result<()> {
        let cutoff = now_ts() - self.heartbeat_grace;
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let stale: Vec<(String, f64)> = {
            let mut stmt = inner.conn.prepare(
                "SELECT run_id, last_heartbeat_ts FROM run_meta
                 WHERE end_ts IS NULL AND last_heartbeat_ts IS NOT NULL
                   AND last_heartbeat_ts < ?1",
            )?;
            let rows = stmt.query_map([cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        for (run_id, last_heartbeat) in stale {
            info!(run_id = %run_id, last_heartbeat, "reconciling stale run");
            inner.conn.execute(
                "UPDATE run_meta SET end_ts = ?1 WHERE run_id = ?2 AND end_ts IS NULL",
                (last_heartbeat, &run_id),
            )?;
            inner.conn.execute(
                "UPDATE client_state_log SET ts_end = ?1
                 WHERE run_id = ?2 AND ts_end IS NULL AND ts_start <= ?1",
                (last_heartbeat, &run_id),
            )?;
        }
        Ok(())
    }

    /// Recent sessions, newest first.
    pub fn get_run_list(&self, limit: usize) -> Result<Vec<RunMeta>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = inner.conn.prepare(
            "SELECT run_id, start_ts, end_ts, last_heartbeat_ts, COALESCE(pid, 0),
                    COALESCE(host, '')
             FROM run_meta ORDER BY start_ts DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(RunMeta {
                run_id: row.get(0)?,
                start_ts: row.get(1)?,
                end_ts: row.get(2)?,
                last_heartbeat_ts: row.get(3)?,
                pid: row.get(4)?,
                host: row.get(5)?,
            })
        })?;
        rows.collect::<std::result::Result<_, _>>()
            .map_err(Into::into)
    }

    /// Intervals overlapping `[from_ts, to_ts]`, clipped to the window.
    /// Open intervals extend to `to_ts`.
    pub fn query_timeline(
        &self,
        run_id: &str,
        from_ts: f64,
        to_ts: f64,
        client_name: Option<&str>,
    ) -> Result<TimelineResponse> {
        let to_ts = if to_ts <= from_ts { from_ts + 1.0 } else { to_ts };

        // Cheap safety: heal before serving, so a crashed run read shortly
        // after restart is already clipped to its heartbeat.
        if let Err(err) = self.reconcile_stale_runs() {
            warn!(error = %err, "reconcile before timeline query failed");
        }

        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut sql = String::from(
            "SELECT client_name, model_name, state, ts_start, COALESCE(ts_end, ?1)
             FROM client_state_log
             WHERE run_id = ?2 AND ts_start <= ?1 AND COALESCE(ts_end, ?1) >= ?3",
        );
        if client_name.is_some() {
            sql.push_str(" AND client_name = ?4");
        }
        sql.push_str(" ORDER BY client_name, ts_start ASC");

        let mut stmt = inner.conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
            ))
        };
        let rows: Vec<(String, Option<String>, String, f64, f64)> = match client_name {
            Some(name) => stmt
                .query_map((to_ts, run_id, from_ts, name), map_row)?
                .collect::<std::result::Result<_, _>>()?,
            None => stmt
                .query_map((to_ts, run_id, from_ts), map_row)?
                .collect::<std::result::Result<_, _>>()?,
        };

        let mut items = Vec::with_capacity(rows.len());
        let mut clients = std::collections::BTreeSet::new();
        for (client, model, state, start, end) in rows {
            let clipped_start = start.max(from_ts);
            let clipped_end = end.min(to_ts);
            if clipped_end <= clipped_start {
                continue;
            }
            clients.insert(client.clone());
            items.push(TimelineItem {
                client,
                model: model.filter(|m| !m.is_empty()),
                state,
                start: clipped_start,
                end: clipped_end,
            });
        }

        Ok(TimelineResponse {
            run_id: run_id.to_string(),
            window: TimelineWindow {
                from: from_ts,
                to: to_ts,
            },
            clients: clients.into_iter().collect(),
            items,
            legend: legend(),
        })
    }

    fn register_run_meta(&self) -> Result<()> {
        let now = now_ts();
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into());
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.conn.execute(
            "INSERT OR IGNORE INTO run_meta(run_id, start_ts, last_heartbeat_ts, end_ts, pid, host)
             VALUES(?1, ?2, ?3, NULL, ?4, ?5)",
            (&self.run_id, now, now, std::process::id() as i64, host),
        )?;
        Ok(())
    }

    fn touch_heartbeat(&self, ts: f64) -> Result<()> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.conn.execute(
            "UPDATE run_meta SET last_heartbeat_ts = ?1 WHERE run_id = ?2",
            (ts, &self.run_id),
        )?;
        Ok(())
    }
}

/// Open/ensure helpers operate on the locked inner state so every caller
/// keeps the row map and the database in step.
#[allow(clippy::too_many_arguments)]
fn ensure_state(
    inner: &mut LogInner,
    run_id: &str,
    client: &str,
    desired: IntervalState,
    model: Option<String>,
    ts: f64,
    is_health_check: bool,
    extra: serde_json::Value,
) -> Result<()> {
    if let Some(open) = inner.open.get(client) {
        // Adjacent identical intervals are not split.
        if open.state == desired && open.model == model {
            return Ok(());
        }
        close_interval(inner, client, ts, None, None, None)?;
    }
    open_interval(inner, run_id, client, desired, model, ts, is_health_check, extra)
}

#[allow(clippy::too_many_arguments)]
fn open_interval(
    inner: &mut LogInner,
    run_id: &str,
    client: &str,
    state: IntervalState,
    model: Option<String>,
    ts_start: f64,
    is_health_check: bool,
    extra: serde_json::Value,
) -> Result<()> {
    inner.conn.execute(
        "INSERT INTO client_state_log
            (run_id, ts_start, ts_end, client_name, model_name, state, is_health_check, extra_json)
         VALUES(?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7)",
        (
            run_id,
            ts_start,
            client,
            &model,
            state.as_str(),
            is_health_check as i64,
            extra.to_string(),
        ),
    )?;
    let row_id = inner.conn.last_insert_rowid();
    inner.open.insert(
        client.to_string(),
        OpenInterval {
            row_id,
            state,
            model,
        },
    );
    Ok(())
}

fn close_interval(
    inner: &mut LogInner,
    client: &str,
    ts_end: f64,
    final_state: Option<IntervalState>,
    error_type: Option<String>,
    error_code: Option<String>,
) -> Result<()> {
    let Some(open) = inner.open.remove(client) else {
        return Ok(());
    };
    let state = final_state.unwrap_or(open.state);
    inner.conn.execute(
        "UPDATE client_state_log
         SET ts_end = ?1, state = ?2, error_type = ?3, error_code = ?4
         WHERE id = ?5",
        (ts_end, state.as_str(), error_type, error_code, open.row_id),
    )?;
    Ok(())
}

fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("failed to create state log directory")?;
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )
    .with_context(|| format!("failed to open state log: {}", path.display()))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

fn generate_run_id() -> String {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", stamp, std::process::id(), &suffix[..8])
}
