use anyhow::Context;
use farmhand_protocol::{
    ActivityEntry, BuildTask, BuildingKind, ResourceKind, Severity, TaskStatus, TrainingTask,
};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

fn new_id(prefix: &str) -> String {
    let c = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{c}", now_ms())
}

/// Equality filter applied to queue reads.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub village: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBuildTask {
    #[serde(default)]
    pub village: Option<String>,
    #[serde(default)]
    pub building_type: Option<ResourceKind>,
    #[serde(default)]
    pub building_slot: Option<u32>,
    #[serde(default)]
    pub building_name: Option<String>,
    pub target_level: u32,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrainingTask {
    #[serde(default)]
    pub village: Option<String>,
    pub building_type: BuildingKind,
    #[serde(default)]
    pub building_slot: Option<u32>,
    #[serde(default)]
    pub troop_name: Option<String>,
    #[serde(default)]
    pub troop_index: Option<u32>,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub repeat_forever: bool,
    #[serde(default)]
    pub repeat_interval: u32,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    50
}

#[derive(Debug, Clone)]
pub struct Engine {
    db_path: PathBuf,
}

impl Engine {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create db dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&conn)?;
        Ok(conn)
    }

    pub fn add_build_task(&self, new: &NewBuildTask) -> anyhow::Result<BuildTask> {
        if new.building_type.is_none() && new.building_slot.is_none() && new.building_name.is_none() {
            anyhow::bail!("build task needs a resource type, a slot or a building name");
        }
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let id = new_id("build");
        let created_at = now_rfc3339();
        let ts = now_ms();
        tx.execute(
            "INSERT INTO build_queue (id, village, building_type, building_slot, building_name,
                target_level, priority, status, created_at, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?9)",
            (
                &id,
                &new.village,
                new.building_type.map(ResourceKind::as_str),
                new.building_slot,
                &new.building_name,
                new.target_level,
                new.priority,
                &created_at,
                ts,
            ),
        )?;
        append_event_tx(
            &tx,
            "build.queued",
            Some(&id),
            serde_json::json!({ "id": id, "target_level": new.target_level }),
        )?;
        tx.commit()?;
        Ok(BuildTask {
            id,
            village: new.village.clone(),
            building_type: new.building_type,
            building_slot: new.building_slot,
            building_name: new.building_name.clone(),
            target_level: new.target_level,
            priority: new.priority,
            created_at,
            status: TaskStatus::Pending,
        })
    }

    pub fn add_training_task(&self, new: &NewTrainingTask) -> anyhow::Result<TrainingTask> {
        if new.troop_name.is_none() && new.troop_index.is_none() {
            anyhow::bail!("training task needs a troop name or index");
        }
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let id = new_id("train");
        let created_at = now_rfc3339();
        let ts = now_ms();
        let quantity: i64 = new.quantity.map(i64::from).unwrap_or(-1);
        tx.execute(
            "INSERT INTO training_queue (id, village, building_type, building_slot, troop_name,
                troop_index, quantity, repeat_forever, repeat_interval, priority, status,
                created_at, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending', ?11, ?12, ?12)",
            (
                &id,
                &new.village,
                new.building_type.as_str(),
                new.building_slot,
                &new.troop_name,
                new.troop_index,
                quantity,
                new.repeat_forever,
                new.repeat_interval,
                new.priority,
                &created_at,
                ts,
            ),
        )?;
        append_event_tx(
            &tx,
            "training.queued",
            Some(&id),
            serde_json::json!({ "id": id, "building_type": new.building_type.as_str() }),
        )?;
        tx.commit()?;
        Ok(TrainingTask {
            id,
            village: new.village.clone(),
            building_type: new.building_type,
            building_slot: new.building_slot,
            troop_name: new.troop_name.clone(),
            troop_index: new.troop_index,
            quantity: new.quantity,
            repeat_forever: new.repeat_forever,
            repeat_interval: new.repeat_interval,
            priority: new.priority,
            created_at,
            status: TaskStatus::Pending,
            trained_total: 0,
            last_trained_at_ms: None,
        })
    }

    /// Pending build tasks, highest priority first, oldest first on ties.
    pub fn pending_build_tasks(
        &self,
        filter: &TaskFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<BuildTask>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, village, building_type, building_slot, building_name, target_level,
                    priority, created_at, status
             FROM build_queue
             WHERE status = 'pending' AND (?1 IS NULL OR village = ?1)
             ORDER BY priority DESC, created_at_ms ASC, rowid ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map((&filter.village, limit as i64), build_task_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn pending_training_tasks(
        &self,
        filter: &TaskFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<TrainingTask>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, village, building_type, building_slot, troop_name, troop_index, quantity,
                    repeat_forever, repeat_interval, priority, created_at, status,
                    trained_total, last_trained_at_ms
             FROM training_queue
             WHERE status = 'pending' AND (?1 IS NULL OR village = ?1)
             ORDER BY priority DESC, created_at_ms ASC, rowid ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map((&filter.village, limit as i64), training_task_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn build_task(&self, id: &str) -> anyhow::Result<Option<BuildTask>> {
        let conn = self.open()?;
        let task = conn
            .query_row(
                "SELECT id, village, building_type, building_slot, building_name, target_level,
                        priority, created_at, status
                 FROM build_queue WHERE id = ?1",
                [id],
                build_task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub fn training_task(&self, id: &str) -> anyhow::Result<Option<TrainingTask>> {
        let conn = self.open()?;
        let task = conn
            .query_row(
                "SELECT id, village, building_type, building_slot, troop_name, troop_index, quantity,
                        repeat_forever, repeat_interval, priority, created_at, status,
                        trained_total, last_trained_at_ms
                 FROM training_queue WHERE id = ?1",
                [id],
                training_task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// Single-row status write; returns whether the task existed.
    pub fn update_build_status(
        &self,
        id: &str,
        status: TaskStatus,
        note: Option<&str>,
    ) -> anyhow::Result<bool> {
        self.update_status("build_queue", "build", id, status, note)
    }

    pub fn update_training_status(
        &self,
        id: &str,
        status: TaskStatus,
        note: Option<&str>,
    ) -> anyhow::Result<bool> {
        self.update_status("training_queue", "training", id, status, note)
    }

    fn update_status(
        &self,
        table: &str,
        event_prefix: &str,
        id: &str,
        status: TaskStatus,
        note: Option<&str>,
    ) -> anyhow::Result<bool> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let ts = now_ms();
        let completed_at = (status == TaskStatus::Completed).then(now_rfc3339);
        let n = tx.execute(
            &format!(
                "UPDATE {table}
                 SET status = ?2, note = COALESCE(?3, note),
                     completed_at = COALESCE(?4, completed_at), updated_at_ms = ?5
                 WHERE id = ?1"
            ),
            (id, status.as_str(), note, completed_at, ts),
        )?;
        if n > 0 {
            append_event_tx(
                &tx,
                &format!("{event_prefix}.{}", status.as_str()),
                Some(id),
                serde_json::json!({ "id": id, "status": status.as_str(), "note": note }),
            )?;
        }
        tx.commit()?;
        Ok(n > 0)
    }

    /// Adds a verified training amount. Non-repeating tasks are completed in the same write.
    pub fn record_training(
        &self,
        id: &str,
        trained: u32,
        at_ms: i64,
        complete: bool,
    ) -> anyhow::Result<bool> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let status = if complete {
            TaskStatus::Completed
        } else {
            TaskStatus::Pending
        };
        let completed_at = complete.then(now_rfc3339);
        let n = tx.execute(
            "UPDATE training_queue
             SET trained_total = trained_total + ?2, last_trained_at_ms = ?3, status = ?4,
                 completed_at = COALESCE(?5, completed_at), updated_at_ms = ?3
             WHERE id = ?1",
            (id, i64::from(trained), at_ms, status.as_str(), completed_at),
        )?;
        if n > 0 {
            append_event_tx(
                &tx,
                "training.trained",
                Some(id),
                serde_json::json!({ "id": id, "trained": trained, "completed": complete }),
            )?;
        }
        tx.commit()?;
        Ok(n > 0)
    }

    pub fn append_log(
        &self,
        action: &str,
        severity: Severity,
        details: &serde_json::Value,
    ) -> anyhow::Result<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO bot_logs (ts_ms, action, severity, details_json) VALUES (?1, ?2, ?3, ?4)",
            (now_ms(), action, severity.as_str(), details.to_string()),
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_logs(&self, limit: usize) -> anyhow::Result<Vec<ActivityEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, ts_ms, action, severity, details_json FROM bot_logs
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let severity: String = row.get(3)?;
            let details: String = row.get(4)?;
            Ok(ActivityEntry {
                id: row.get(0)?,
                ts_ms: row.get(1)?,
                action: row.get(2)?,
                severity: parse_severity(&severity),
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    pub fn get_rev(&self) -> anyhow::Result<i64> {
        let conn = self.open()?;
        let rev: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM event_log", [], |row| row.get(0))?;
        Ok(rev.unwrap_or(0))
    }
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "debug" => Severity::Debug,
        "warn" => Severity::Warn,
        "error" => Severity::Error,
        "success" => Severity::Success,
        _ => Severity::Info,
    }
}

fn conversion_error(idx: usize, err: farmhand_protocol::UnknownName) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn build_task_from_row(row: &Row<'_>) -> rusqlite::Result<BuildTask> {
    let building_type: Option<String> = row.get(2)?;
    let building_type = building_type
        .map(|s| s.parse::<ResourceKind>())
        .transpose()
        .map_err(|e| conversion_error(2, e))?;
    let status: String = row.get(8)?;
    Ok(BuildTask {
        id: row.get(0)?,
        village: row.get(1)?,
        building_type,
        building_slot: row.get(3)?,
        building_name: row.get(4)?,
        target_level: row.get(5)?,
        priority: row.get(6)?,
        created_at: row.get(7)?,
        status: status.parse().map_err(|e| conversion_error(8, e))?,
    })
}

fn training_task_from_row(row: &Row<'_>) -> rusqlite::Result<TrainingTask> {
    let building_type: String = row.get(2)?;
    let quantity: i64 = row.get(6)?;
    let status: String = row.get(11)?;
    let trained_total: i64 = row.get(12)?;
    Ok(TrainingTask {
        id: row.get(0)?,
        village: row.get(1)?,
        building_type: building_type.parse().map_err(|e| conversion_error(2, e))?,
        building_slot: row.get(3)?,
        troop_name: row.get(4)?,
        troop_index: row.get(5)?,
        quantity: u32::try_from(quantity).ok(),
        repeat_forever: row.get(7)?,
        repeat_interval: row.get(8)?,
        priority: row.get(9)?,
        created_at: row.get(10)?,
        status: status.parse().map_err(|e| conversion_error(11, e))?,
        trained_total: u64::try_from(trained_total).unwrap_or(0),
        last_trained_at_ms: row.get(13)?,
    })
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    // `user_version` + IF NOT EXISTS + best-effort ALTERs keep older installs opening cleanly.
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
-- Monotonic revision source for the status endpoint.
CREATE TABLE IF NOT EXISTS event_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms INTEGER NOT NULL,
  kind TEXT NOT NULL,
  entity_id TEXT,
  payload_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_event_log_ts ON event_log(ts_ms);
CREATE INDEX IF NOT EXISTS idx_event_log_kind ON event_log(kind);

CREATE TABLE IF NOT EXISTS build_queue (
  id TEXT PRIMARY KEY,
  village TEXT,
  building_type TEXT,
  building_slot INTEGER,
  building_name TEXT,
  target_level INTEGER NOT NULL,
  priority INTEGER NOT NULL DEFAULT 50,
  status TEXT NOT NULL DEFAULT 'pending',
  note TEXT,
  created_at TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  completed_at TEXT,
  updated_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_build_queue_pending ON build_queue(status, priority);

CREATE TABLE IF NOT EXISTS training_queue (
  id TEXT PRIMARY KEY,
  village TEXT,
  building_type TEXT NOT NULL,
  building_slot INTEGER,
  troop_name TEXT,
  troop_index INTEGER,
  quantity INTEGER NOT NULL DEFAULT -1,
  repeat_forever INTEGER NOT NULL DEFAULT 0,
  repeat_interval INTEGER NOT NULL DEFAULT 0,
  priority INTEGER NOT NULL DEFAULT 50,
  status TEXT NOT NULL DEFAULT 'pending',
  note TEXT,
  trained_total INTEGER NOT NULL DEFAULT 0,
  last_trained_at_ms INTEGER,
  created_at TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  completed_at TEXT,
  updated_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_training_queue_pending ON training_queue(status, priority);

CREATE TABLE IF NOT EXISTS bot_logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms INTEGER NOT NULL,
  action TEXT NOT NULL,
  severity TEXT NOT NULL DEFAULT 'info',
  details_json TEXT NOT NULL DEFAULT '{}'
);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    // Columns added after the first release.
    ensure_column(conn, "build_queue", "note", "TEXT")?;
    ensure_column(conn, "training_queue", "note", "TEXT")?;

    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, col: &str, decl: &str) -> anyhow::Result<()> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {col} {decl}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(e) => {
            if e.to_string().to_lowercase().contains("duplicate column") {
                return Ok(());
            }
            Err(e).with_context(|| format!("ensure column {table}.{col}"))
        }
    }
}

fn append_event_tx(
    tx: &rusqlite::Transaction<'_>,
    kind: &str,
    entity_id: Option<&str>,
    payload: serde_json::Value,
) -> anyhow::Result<i64> {
    let ts = now_ms();
    let payload_json = payload.to_string();
    tx.execute(
        "INSERT INTO event_log (ts_ms, kind, entity_id, payload_json) VALUES (?1, ?2, ?3, ?4)",
        (ts, kind, entity_id, payload_json),
    )?;
    Ok(tx.last_insert_rowid())
}
