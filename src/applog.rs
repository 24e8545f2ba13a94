//! Dual-sink gateway logging.
//!
//! Every significant protocol step is logged twice: to stderr via `tracing`
//! and to the durable `logs` table with its machine-readable JSON context.
//! The table sink is installed once at startup; before that (and in tests)
//! only the tracing side fires.

use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::db::Db;

static LOG_SINK: OnceLock<Arc<Db>> = OnceLock::new();

/// Install the durable sink. Later calls are ignored.
pub fn init_sink(db: Arc<Db>) {
    let _ = LOG_SINK.set(db);
}

fn persist(level: &str, message: &str, context: &Value) {
    if let Some(db) = LOG_SINK.get() {
        if let Err(e) = db.create_log(level, message, context) {
            debug!("log table write failed: {e}");
        }
    }
}

pub fn log_info(message: &str, context: Value) {
    info!(context = %context, "{message}");
    persist("info", message, &context);
}

pub fn log_warning(message: &str, context: Value) {
    warn!(context = %context, "{message}");
    persist("warning", message, &context);
}

pub fn log_error(message: &str, context: Value) {
    error!(context = %context, "{message}");
    persist("error", message, &context);
}
