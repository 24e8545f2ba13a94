//! SQLite store for printers, jobs, and logs.
//!
//! Uses rusqlite with WAL mode and a versioned migration runner. The
//! connection lives behind a `Mutex` and is shared across the queue, the
//! MQTT bridge, and the HTTP surface; access is narrow CRUD only.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, Row, ToSql};
use serde_json::Value;
use tracing::info;

use crate::models::{Job, LogEntry, Printer, PrinterCreate, PrinterUpdate};

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

pub struct Db {
    conn: Mutex<Connection>,
    pub path: PathBuf,
}

impl Db {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn init(path: &Path) -> Result<Self, String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| format!("Failed to create data dir: {e}"))?;
        }
        info!("Opening database at {}", path.display());
        let conn = open_and_configure(path)?;
        run_migrations(&conn)?;
        info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| e.to_string())?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| e.to_string())?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- printers -----------------------------------------------------------

    pub fn list_printers(&self) -> Result<Vec<Printer>, String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM printers ORDER BY id ASC")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], printer_from_row)
            .map_err(|e| e.to_string())?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| e.to_string())
    }

    pub fn get_printer(&self, printer_id: i64) -> Result<Option<Printer>, String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM printers WHERE id = ?1")
            .map_err(|e| e.to_string())?;
        let mut rows = stmt
            .query_map(params![printer_id], printer_from_row)
            .map_err(|e| e.to_string())?;
        match rows.next() {
            Some(row) => row.map(Some).map_err(|e| e.to_string()),
            None => Ok(None),
        }
    }

    pub fn create_printer(&self, data: &PrinterCreate) -> Result<Printer, String> {
        let now = now_iso();
        let config_json = serde_json::to_string(&data.config).map_err(|e| e.to_string())?;
        let id = {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO printers
                 (name, model, transport, port, baudrate, data_bits, parity, stop_bits,
                  timeout_ms, ip_address, tcp_port, enabled, dry_run, config_json,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    data.name,
                    data.model,
                    data.transport,
                    data.port,
                    data.baudrate,
                    data.data_bits,
                    data.parity,
                    data.stop_bits,
                    data.timeout_ms as i64,
                    data.ip_address,
                    data.tcp_port,
                    data.enabled,
                    data.dry_run,
                    config_json,
                    now,
                    now,
                ],
            )
            .map_err(|e| e.to_string())?;
            conn.last_insert_rowid()
        };
        self.get_printer(id)?
            .ok_or_else(|| "printer vanished after insert".into())
    }

    pub fn update_printer(
        &self,
        printer_id: i64,
        patch: &PrinterUpdate,
    ) -> Result<Option<Printer>, String> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        macro_rules! set {
            ($field:expr, $column:literal) => {
                if let Some(v) = &$field {
                    sets.push(concat!($column, " = ?"));
                    values.push(Box::new(v.clone()));
                }
            };
        }
        set!(patch.name, "name");
        set!(patch.model, "model");
        set!(patch.transport, "transport");
        set!(patch.port, "port");
        set!(patch.baudrate, "baudrate");
        set!(patch.data_bits, "data_bits");
        set!(patch.parity, "parity");
        set!(patch.stop_bits, "stop_bits");
        if let Some(v) = patch.timeout_ms {
            sets.push("timeout_ms = ?");
            values.push(Box::new(v as i64));
        }
        set!(patch.ip_address, "ip_address");
        set!(patch.tcp_port, "tcp_port");
        set!(patch.enabled, "enabled");
        set!(patch.dry_run, "dry_run");
        if let Some(config) = &patch.config {
            sets.push("config_json = ?");
            values.push(Box::new(
                serde_json::to_string(config).map_err(|e| e.to_string())?,
            ));
        }

        if sets.is_empty() {
            return self.get_printer(printer_id);
        }
        sets.push("updated_at = ?");
        values.push(Box::new(now_iso()));
        values.push(Box::new(printer_id));

        let query = format!("UPDATE printers SET {} WHERE id = ?", sets.join(", "));
        {
            let conn = self.lock();
            conn.execute(&query, params_from_iter(values.iter().map(|v| v.as_ref())))
                .map_err(|e| e.to_string())?;
        }
        self.get_printer(printer_id)
    }

    pub fn delete_printer(&self, printer_id: i64) -> Result<bool, String> {
        let conn = self.lock();
        let n = conn
            .execute("DELETE FROM printers WHERE id = ?1", params![printer_id])
            .map_err(|e| e.to_string())?;
        Ok(n > 0)
    }

    // -- jobs ---------------------------------------------------------------

    pub fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?1")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![limit], job_from_row)
            .map_err(|e| e.to_string())?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| e.to_string())
    }

    /// Oldest-first, so the dispatcher observes submission order.
    pub fn list_jobs_by_status(&self, status: &str, limit: i64) -> Result<Vec<Job>, String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![status, limit], job_from_row)
            .map_err(|e| e.to_string())?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| e.to_string())
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>, String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM jobs WHERE id = ?1")
            .map_err(|e| e.to_string())?;
        let mut rows = stmt
            .query_map(params![job_id], job_from_row)
            .map_err(|e| e.to_string())?;
        match rows.next() {
            Some(row) => row.map(Some).map_err(|e| e.to_string()),
            None => Ok(None),
        }
    }

    /// Canonical job creation; both REST and MQTT go through this.
    pub fn create_job(
        &self,
        printer_id: i64,
        payload_type: &str,
        payload: &Value,
    ) -> Result<Job, String> {
        let now = now_iso();
        let payload_json = serde_json::to_string(payload).map_err(|e| e.to_string())?;
        let id = {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO jobs
                 (printer_id, payload_type, payload_json, status, retries, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5)",
                params![printer_id, payload_type, payload_json, now, now],
            )
            .map_err(|e| e.to_string())?;
            conn.last_insert_rowid()
        };
        self.get_job(id)?
            .ok_or_else(|| "job vanished after insert".into())
    }

    pub fn update_job(&self, job_id: i64, patch: &JobPatch) -> Result<Option<Job>, String> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = patch.status {
            sets.push("status = ?");
            values.push(Box::new(status.to_string()));
        }
        if let Some(retries) = patch.retries {
            sets.push("retries = ?");
            values.push(Box::new(retries));
        }
        if let Some(error) = &patch.error {
            sets.push("error = ?");
            values.push(Box::new(error.clone()));
        }
        if let Some(result) = &patch.result {
            let encoded = match result {
                Some(v) => Some(serde_json::to_string(v).map_err(|e| e.to_string())?),
                None => None,
            };
            sets.push("result_json = ?");
            values.push(Box::new(encoded));
        }
        if let Some(started_at) = &patch.started_at {
            sets.push("started_at = ?");
            values.push(Box::new(started_at.clone()));
        }
        if let Some(finished_at) = &patch.finished_at {
            sets.push("finished_at = ?");
            values.push(Box::new(finished_at.clone()));
        }
        if sets.is_empty() {
            return self.get_job(job_id);
        }
        sets.push("updated_at = ?");
        values.push(Box::new(now_iso()));
        values.push(Box::new(job_id));

        let query = format!("UPDATE jobs SET {} WHERE id = ?", sets.join(", "));
        {
            let conn = self.lock();
            conn.execute(&query, params_from_iter(values.iter().map(|v| v.as_ref())))
                .map_err(|e| e.to_string())?;
        }
        self.get_job(job_id)
    }

    // -- logs ---------------------------------------------------------------

    pub fn create_log(&self, level: &str, message: &str, context: &Value) -> Result<(), String> {
        let context_json = if context.is_null() {
            None
        } else {
            Some(serde_json::to_string(context).map_err(|e| e.to_string())?)
        };
        let conn = self.lock();
        conn.execute(
            "INSERT INTO logs (level, message, context_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![level, message, context_json, now_iso()],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn list_logs(&self, limit: i64) -> Result<Vec<LogEntry>, String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM logs ORDER BY id DESC LIMIT ?1")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![limit], log_from_row)
            .map_err(|e| e.to_string())?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| e.to_string())
    }
}

/// Partial job update. `Some(None)` clears a nullable column.
#[derive(Debug, Default)]
pub struct JobPatch {
    pub status: Option<&'static str>,
    pub retries: Option<i64>,
    pub error: Option<Option<String>>,
    pub result: Option<Option<Value>>,
    pub started_at: Option<Option<String>>,
    pub finished_at: Option<Option<String>>,
}

// ---------------------------------------------------------------------------
// Connection setup & migrations
// ---------------------------------------------------------------------------

fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS printers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            model TEXT NOT NULL,
            transport TEXT NOT NULL,
            port TEXT,
            baudrate INTEGER DEFAULT 9600,
            data_bits INTEGER DEFAULT 8,
            parity TEXT DEFAULT 'N',
            stop_bits REAL DEFAULT 1,
            timeout_ms INTEGER DEFAULT 5000,
            ip_address TEXT,
            tcp_port INTEGER DEFAULT 4999,
            enabled INTEGER DEFAULT 1,
            dry_run INTEGER DEFAULT 0,
            config_json TEXT DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            printer_id INTEGER NOT NULL,
            payload_type TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            status TEXT NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            result_json TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            FOREIGN KEY(printer_id) REFERENCES printers(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, created_at);
        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            context_json TEXT,
            created_at TEXT NOT NULL
        );
        INSERT INTO schema_version (version) VALUES (1);",
    )
    .map_err(|e| format!("migrate v1: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn json_column(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn printer_from_row(row: &Row) -> rusqlite::Result<Printer> {
    let config_raw: Option<String> = row.get("config_json")?;
    Ok(Printer {
        id: row.get("id")?,
        name: row.get("name")?,
        model: row.get("model")?,
        transport: row.get("transport")?,
        port: row.get("port")?,
        baudrate: row.get("baudrate")?,
        data_bits: row.get("data_bits")?,
        parity: row.get("parity")?,
        stop_bits: row.get("stop_bits")?,
        timeout_ms: row.get::<_, i64>("timeout_ms")? as u64,
        ip_address: row.get("ip_address")?,
        tcp_port: row.get("tcp_port")?,
        enabled: row.get("enabled")?,
        dry_run: row.get("dry_run")?,
        config: json_column(config_raw).unwrap_or_else(|| Value::Object(Default::default())),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let payload_raw: Option<String> = row.get("payload_json")?;
    let result_raw: Option<String> = row.get("result_json")?;
    Ok(Job {
        id: row.get("id")?,
        printer_id: row.get("printer_id")?,
        payload_type: row.get("payload_type")?,
        payload: json_column(payload_raw).unwrap_or_else(|| Value::Object(Default::default())),
        status: row.get("status")?,
        retries: row.get("retries")?,
        error: row.get("error")?,
        result: json_column(result_raw),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
    })
}

fn log_from_row(row: &Row) -> rusqlite::Result<LogEntry> {
    let context_raw: Option<String> = row.get("context_json")?;
    Ok(LogEntry {
        id: row.get("id")?,
        level: row.get("level")?,
        message: row.get("message")?,
        context: json_column(context_raw),
        created_at: row.get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PrinterCreate;
    use serde_json::json;

    fn sample_printer() -> PrinterCreate {
        serde_json::from_value(json!({
            "name": "Kitchen FP-700MX",
            "model": "datecs_fp700mx",
            "transport": "serial",
            "port": "COM3"
        }))
        .unwrap()
    }

    #[test]
    fn test_printer_crud_round_trip() {
        let db = Db::open_in_memory().unwrap();
        let created = db.create_printer(&sample_printer()).unwrap();
        assert_eq!(created.model, "datecs_fp700mx");
        assert_eq!(created.baudrate, 9600);
        assert!(created.enabled);

        let patch = PrinterUpdate {
            baudrate: Some(115200),
            enabled: Some(false),
            ..Default::default()
        };
        let updated = db.update_printer(created.id, &patch).unwrap().unwrap();
        assert_eq!(updated.baudrate, 115200);
        assert!(!updated.enabled);
        assert_eq!(updated.name, created.name);

        assert!(db.delete_printer(created.id).unwrap());
        assert!(db.get_printer(created.id).unwrap().is_none());
    }

    #[test]
    fn test_job_lifecycle_and_patch_semantics() {
        let db = Db::open_in_memory().unwrap();
        let printer = db.create_printer(&sample_printer()).unwrap();
        let job = db
            .create_job(printer.id, "fiscal_receipt", &json!({"items": []}))
            .unwrap();
        assert_eq!(job.status, "queued");
        assert_eq!(job.retries, 0);
        assert!(job.result.is_none());

        let job = db
            .update_job(
                job.id,
                &JobPatch {
                    status: Some("printing"),
                    started_at: Some(Some(now_iso())),
                    error: Some(None),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(job.status, "printing");
        assert!(job.started_at.is_some());

        let job = db
            .update_job(
                job.id,
                &JobPatch {
                    status: Some("success"),
                    result: Some(Some(json!({"receipt_number": "42"}))),
                    finished_at: Some(Some(now_iso())),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(job.status, "success");
        assert_eq!(job.result.unwrap()["receipt_number"], "42");
        assert!(job.error.is_none());
    }

    #[test]
    fn test_queued_jobs_listed_oldest_first() {
        let db = Db::open_in_memory().unwrap();
        let printer = db.create_printer(&sample_printer()).unwrap();
        let first = db.create_job(printer.id, "text", &json!({})).unwrap();
        let second = db.create_job(printer.id, "text", &json!({})).unwrap();
        let queued = db.list_jobs_by_status("queued", 20).unwrap();
        assert_eq!(queued[0].id, first.id);
        assert_eq!(queued[1].id, second.id);
    }

    #[test]
    fn test_logs_append_and_list() {
        let db = Db::open_in_memory().unwrap();
        db.create_log("info", "DATECS_SEND", &json!({"cmd": "0x4A"}))
            .unwrap();
        let logs = db.list_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "DATECS_SEND");
        assert_eq!(logs[0].context.as_ref().unwrap()["cmd"], "0x4A");
    }
}
