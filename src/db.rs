use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::*;
use crate::phase::PhaseKind;

/// Async-safe handle to the forgeflow database.
///
/// Wraps `FlowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FlowDb>>,
}

impl DbHandle {
    pub fn new(db: FlowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(FlowDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(FlowDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FlowDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct FlowDb {
    conn: Connection,
}

impl FlowDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure database")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task TEXT NOT NULL,
                current_phase TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                abort_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS phase_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                phase TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                artifact_id TEXT,
                decision TEXT,
                failure TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                UNIQUE(run_id, phase, attempt)
            );

            CREATE TABLE IF NOT EXISTS workspaces (
                name TEXT PRIMARY KEY,
                run_id INTEGER NOT NULL REFERENCES runs(id),
                branch TEXT NOT NULL,
                path TEXT NOT NULL,
                base_ref TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_phase_records_run ON phase_records(run_id, seq);
            ",
        )?;

        // Additive; only a duplicate column is expected on re-run.
        match self
            .conn
            .execute("ALTER TABLE workspaces ADD COLUMN merge_result TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add merge_result column: {}", e)),
        }
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn insert_run(&self, task: &str) -> Result<WorkflowRun> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO runs (task, current_phase, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                task,
                PhaseKind::first().as_str(),
                RunStatus::Active.as_str(),
                now.to_rfc3339()
            ],
        )?;
        let id = RunId(self.conn.last_insert_rowid());
        Ok(WorkflowRun {
            id,
            task: task.to_string(),
            records: Vec::new(),
            current_phase: PhaseKind::first(),
            status: RunStatus::Active,
            abort_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Persist a run and its records in one transaction. Records that are
    /// already concluded in the database are left untouched.
    pub fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let abort_reason = run
            .abort_reason
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let updated = tx.execute(
            "UPDATE runs SET current_phase = ?1, status = ?2, abort_reason = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                run.current_phase.as_str(),
                run.status.as_str(),
                abort_reason,
                run.updated_at.to_rfc3339(),
                run.id.0
            ],
        )?;
        if updated == 0 {
            anyhow::bail!("Run {} does not exist", run.id);
        }

        for (seq, record) in run.records.iter().enumerate() {
            let decision = record
                .decision
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO phase_records
                    (run_id, seq, phase, attempt, status, artifact_id, decision, failure, started_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(run_id, phase, attempt) DO UPDATE SET
                    status = excluded.status,
                    artifact_id = excluded.artifact_id,
                    decision = excluded.decision,
                    failure = excluded.failure,
                    ended_at = excluded.ended_at
                 WHERE phase_records.status IN ('pending', 'awaiting_approval')",
                params![
                    run.id.0,
                    seq as i64,
                    record.phase.as_str(),
                    record.attempt,
                    record.status.as_str(),
                    record.artifact_id,
                    decision,
                    record.failure,
                    record.started_at.to_rfc3339(),
                    record.ended_at.map(|t| t.to_rfc3339()),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_run(&self, id: RunId) -> Result<Option<WorkflowRun>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, task, current_phase, status, abort_reason, created_at, updated_at
                 FROM runs WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, task, phase, status, abort_reason, created_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(WorkflowRun {
            id: RunId(id),
            task,
            records: self.get_records(RunId(id))?,
            current_phase: PhaseKind::from_str(&phase)?,
            status: RunStatus::from_str(&status)?,
            abort_reason: abort_reason
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .context("Corrupt abort_reason column")?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    pub fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<WorkflowRun>> {
        let ids: Vec<i64> = match status {
            Some(status) => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT id FROM runs WHERE status = ?1 ORDER BY id")?;
                stmt.query_map(params![status.as_str()], |row| row.get(0))?
                    .collect::<rusqlite::Result<_>>()?
            }
            None => {
                let mut stmt = self.conn.prepare("SELECT id FROM runs ORDER BY id")?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<_>>()?
            }
        };

        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(run) = self.get_run(RunId(id))? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    fn get_records(&self, run_id: RunId) -> Result<Vec<PhaseRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT phase, attempt, status, artifact_id, decision, failure, started_at, ended_at
             FROM phase_records WHERE run_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![run_id.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(phase, attempt, status, artifact_id, decision, failure, started_at, ended_at)| {
                    Ok(PhaseRecord {
                        phase: PhaseKind::from_str(&phase)?,
                        attempt,
                        status: RecordStatus::from_str(&status)?,
                        artifact_id,
                        decision: decision
                            .map(|d| serde_json::from_str(&d))
                            .transpose()
                            .context("Corrupt decision column")?,
                        failure,
                        started_at: parse_ts(&started_at)?,
                        ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
                    })
                },
            )
            .collect()
    }

    // ── Workspaces ────────────────────────────────────────────────────

    pub fn upsert_workspace(&self, ws: &Workspace) -> Result<()> {
        let merge_result = ws.merge.as_ref().map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO workspaces (name, run_id, branch, path, base_ref, state, merge_result, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(name) DO UPDATE SET
                branch = excluded.branch,
                path = excluded.path,
                base_ref = excluded.base_ref,
                state = excluded.state,
                merge_result = excluded.merge_result,
                updated_at = excluded.updated_at",
            params![
                ws.name,
                ws.run_id.0,
                ws.branch,
                ws.path.to_string_lossy(),
                ws.base_ref,
                ws.state.as_str(),
                merge_result,
                ws.created_at.to_rfc3339(),
                ws.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_workspace(&self, name: &str) -> Result<Option<Workspace>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, run_id, branch, path, base_ref, state, merge_result, created_at, updated_at
             FROM workspaces WHERE name = ?1",
        )?;
        let mut rows = stmt.query_map(params![name], workspace_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row_to_workspace(row?)?)),
            None => Ok(None),
        }
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, run_id, branch, path, base_ref, state, merge_result, created_at, updated_at
             FROM workspaces ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], workspace_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(row_to_workspace).collect()
    }
}

type WorkspaceRow = (
    String,
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
);

fn workspace_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkspaceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn row_to_workspace(row: WorkspaceRow) -> Result<Workspace> {
    let (name, run_id, branch, path, base_ref, state, merge_result, created_at, updated_at) = row;
    Ok(Workspace {
        name,
        run_id: RunId(run_id),
        branch,
        path: path.into(),
        base_ref,
        state: WorkspaceState::from_str(&state)?,
        merge: merge_result
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .context("Corrupt merge_result column")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}
