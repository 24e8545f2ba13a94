//! Persistent job queue.
//!
//! A polling dispatcher pulls the oldest `queued` jobs from the store and
//! spawns one execution task per job. Every execution takes the per-printer
//! advisory lock before touching the device, so at most one job per printer
//! is ever in flight — across the dispatcher, REST direct calls, and MQTT.
//! Failures re-queue the job until the retry limit is reached.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::applog::{log_error, log_info};
use crate::db::{now_iso, Db, JobPatch};
use crate::models::{Job, PayloadKind, Printer, JOB_FAILED, JOB_PRINTING, JOB_QUEUED, JOB_SUCCESS};
use crate::service;
use crate::settings::Settings;

const DISPATCH_BATCH: i64 = 20;

pub struct JobQueue {
    db: Arc<Db>,
    settings: Arc<Settings>,
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    active: Mutex<HashSet<i64>>,
    shutdown: CancellationToken,
}

impl JobQueue {
    pub fn new(db: Arc<Db>, settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            db,
            settings,
            locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Advisory lock for one printer. Entries are created lazily and never
    /// removed; the map is bounded by the number of configured printers.
    pub fn printer_lock(&self, printer_id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(printer_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Spawn the polling dispatcher.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs_f64(queue.settings.job_poll_interval_s.max(0.05));
            log_info(
                "JOB_QUEUE_STARTED",
                json!({"poll_interval_s": queue.settings.job_poll_interval_s}),
            );
            loop {
                tokio::select! {
                    _ = queue.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                queue.dispatch().await;
            }
            log_info("JOB_QUEUE_STOPPED", json!({}));
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn dispatch(self: &Arc<Self>) {
        let queued = match self.db.list_jobs_by_status(JOB_QUEUED, DISPATCH_BATCH) {
            Ok(jobs) => jobs,
            Err(e) => {
                log_error("JOB_DISPATCH_DB_ERROR", json!({"error": e}));
                return;
            }
        };
        for job in queued {
            {
                let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
                if !active.insert(job.id) {
                    continue;
                }
            }
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.process_job(job.clone()).await;
                let mut active = queue.active.lock().unwrap_or_else(|p| p.into_inner());
                active.remove(&job.id);
            });
        }
    }

    /// Effective execution deadline for one job. Reports carry their own
    /// long wire timeout, so the outer deadline must not undercut it.
    fn job_deadline(&self, printer: &Printer, kind: PayloadKind) -> Duration {
        let base = printer
            .config
            .get("job_timeout_s")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(self.settings.job_timeout_s);
        let base = Duration::from_secs_f64(base.max(1.0));
        match kind {
            PayloadKind::Report => base.max(Duration::from_secs(60)),
            PayloadKind::PinpadPurchase | PayloadKind::PinpadVoid | PayloadKind::PinpadTest => {
                base.max(Duration::from_secs(150))
            }
            PayloadKind::PinpadEndOfDay => base.max(Duration::from_secs(330)),
            _ => base,
        }
    }

    async fn process_job(self: &Arc<Self>, job: Job) {
        let printer = match self.db.get_printer(job.printer_id) {
            Ok(Some(printer)) if printer.enabled => printer,
            Ok(_) => {
                let _ = self.db.update_job(
                    job.id,
                    &JobPatch {
                        status: Some(JOB_FAILED),
                        error: Some(Some("Printer not found or disabled".into())),
                        finished_at: Some(Some(now_iso())),
                        ..Default::default()
                    },
                );
                log_error(
                    "JOB_FAILED_PRINTER",
                    json!({"job_id": job.id, "printer_id": job.printer_id}),
                );
                return;
            }
            Err(e) => {
                log_error("JOB_DB_ERROR", json!({"job_id": job.id, "error": e}));
                return;
            }
        };

        let Some(kind) = PayloadKind::parse(&job.payload_type) else {
            let _ = self.db.update_job(
                job.id,
                &JobPatch {
                    status: Some(JOB_FAILED),
                    error: Some(Some(format!(
                        "Unsupported payload type: {}",
                        job.payload_type
                    ))),
                    finished_at: Some(Some(now_iso())),
                    ..Default::default()
                },
            );
            return;
        };

        let lock = self.printer_lock(printer.id);
        let _guard = lock.lock().await;

        // Another path may have finished or cancelled the job while we
        // waited on the device lock.
        match self.db.get_job(job.id) {
            Ok(Some(current)) if current.status == JOB_QUEUED => {}
            _ => return,
        }

        let _ = self.db.update_job(
            job.id,
            &JobPatch {
                status: Some(JOB_PRINTING),
                started_at: Some(Some(now_iso())),
                error: Some(None),
                ..Default::default()
            },
        );
        log_info(
            "JOB_PRINTING",
            json!({"job_id": job.id, "printer_id": printer.id, "payload_type": job.payload_type}),
        );

        let deadline = self.job_deadline(&printer, kind);
        let global_dry_run = self.settings.global_dry_run;
        let payload = job.payload.clone();
        let worker_printer = printer.clone();
        let outcome = tokio::time::timeout(
            deadline,
            tokio::task::spawn_blocking(move || {
                service::execute(&worker_printer, kind, &payload, global_dry_run)
            }),
        )
        .await;

        let result = match outcome {
            Err(_) => Err(format!(
                "Job timed out after {:.0}s",
                deadline.as_secs_f64()
            )),
            Ok(Err(join_error)) => Err(format!("Job worker failed: {join_error}")),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Ok(Ok(value))) => Ok(value),
        };

        match result {
            Ok(value) => {
                let _ = self.db.update_job(
                    job.id,
                    &JobPatch {
                        status: Some(JOB_SUCCESS),
                        finished_at: Some(Some(now_iso())),
                        error: Some(None),
                        result: Some(Some(value.clone())),
                        ..Default::default()
                    },
                );
                log_info(
                    "JOB_SUCCESS",
                    json!({"job_id": job.id, "printer_id": printer.id, "result": value}),
                );
            }
            Err(error) => self.handle_failure(&job, error),
        }
    }

    fn handle_failure(&self, job: &Job, error: String) {
        if job.retries < self.settings.job_max_retries {
            let _ = self.db.update_job(
                job.id,
                &JobPatch {
                    status: Some(JOB_QUEUED),
                    retries: Some(job.retries + 1),
                    error: Some(Some(error.clone())),
                    started_at: Some(None),
                    ..Default::default()
                },
            );
            log_error("JOB_RETRY", json!({"job_id": job.id, "error": error}));
        } else {
            let _ = self.db.update_job(
                job.id,
                &JobPatch {
                    status: Some(JOB_FAILED),
                    retries: Some(job.retries + 1),
                    error: Some(Some(error.clone())),
                    finished_at: Some(Some(now_iso())),
                    ..Default::default()
                },
            );
            log_error("JOB_FAILED", json!({"job_id": job.id, "error": error}));
        }
    }

    /// Cooperative cancellation: only `queued` jobs can be cancelled.
    pub fn cancel_job(&self, job_id: i64) -> Result<Job, String> {
        let job = self
            .db
            .get_job(job_id)?
            .ok_or_else(|| "Job not found".to_string())?;
        if job.status != JOB_QUEUED {
            return Err(format!(
                "Only queued jobs can be cancelled (status is {})",
                job.status
            ));
        }
        self.db
            .update_job(
                job_id,
                &JobPatch {
                    status: Some(JOB_FAILED),
                    error: Some(Some("Cancelled by user".into())),
                    finished_at: Some(Some(now_iso())),
                    ..Default::default()
                },
            )?
            .ok_or_else(|| "Job vanished".to_string())
    }

    /// Manual retry: push a terminal or stuck job back to the queue.
    pub fn retry_job(&self, job_id: i64) -> Result<Job, String> {
        let job = self
            .db
            .get_job(job_id)?
            .ok_or_else(|| "Job not found".to_string())?;
        if job.status == JOB_PRINTING {
            return Err("Job is printing; wait for it to finish".into());
        }
        self.db
            .update_job(
                job_id,
                &JobPatch {
                    status: Some(JOB_QUEUED),
                    error: Some(None),
                    started_at: Some(None),
                    finished_at: Some(None),
                    ..Default::default()
                },
            )?
            .ok_or_else(|| "Job vanished".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> (Arc<Db>, Arc<JobQueue>, i64) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let settings = Arc::new(Settings {
            job_poll_interval_s: 0.05,
            job_timeout_s: 5.0,
            global_dry_run: false,
            ..Default::default()
        });
        let printer = db
            .create_printer(
                &serde_json::from_value(json!({
                    "name": "Test", "model": "datecs_fp700mx", "transport": "serial",
                    "port": "COM1", "dry_run": true
                }))
                .unwrap(),
            )
            .unwrap();
        let queue = JobQueue::new(Arc::clone(&db), settings);
        (db, queue, printer.id)
    }

    #[tokio::test]
    async fn test_job_success_path_records_result() {
        let (db, queue, printer_id) = fixture();
        let job = db
            .create_job(printer_id, "text", &json!({"lines": ["hello"]}))
            .unwrap();
        queue.process_job(job.clone()).await;
        let done = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(done.status, JOB_SUCCESS);
        assert!(done.result.is_some());
        assert!(done.error.is_none());
        assert!(done.started_at.is_some());
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_job_failure_requeues_then_fails() {
        let (db, queue, printer_id) = fixture();
        // Unsupported payload for a fiscal printer fails validation.
        let job = db
            .create_job(printer_id, "pinpad_purchase", &json!({"amount": 1}))
            .unwrap();
        queue.process_job(job.clone()).await;
        let after_first = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(after_first.status, JOB_QUEUED);
        assert_eq!(after_first.retries, 1);
        assert!(after_first.error.is_some());

        queue.process_job(after_first.clone()).await;
        let after_second = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(after_second.status, JOB_FAILED);
        assert_eq!(after_second.retries, 2);
    }

    #[tokio::test]
    async fn test_disabled_printer_fails_job() {
        let (db, queue, printer_id) = fixture();
        db.update_printer(
            printer_id,
            &crate::models::PrinterUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        let job = db.create_job(printer_id, "text", &json!({})).unwrap();
        queue.process_job(job.clone()).await;
        let done = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(done.status, JOB_FAILED);
        assert_eq!(done.error.as_deref(), Some("Printer not found or disabled"));
    }

    #[tokio::test]
    async fn test_cancel_only_queued_jobs() {
        let (db, queue, printer_id) = fixture();
        let job = db.create_job(printer_id, "text", &json!({})).unwrap();
        let cancelled = queue.cancel_job(job.id).unwrap();
        assert_eq!(cancelled.status, JOB_FAILED);
        assert_eq!(cancelled.error.as_deref(), Some("Cancelled by user"));
        assert!(queue.cancel_job(job.id).is_err());
    }

    #[tokio::test]
    async fn test_retry_resets_status_without_clearing_retries() {
        let (db, queue, printer_id) = fixture();
        let job = db.create_job(printer_id, "text", &json!({})).unwrap();
        db.update_job(
            job.id,
            &JobPatch {
                status: Some(JOB_FAILED),
                retries: Some(2),
                error: Some(Some("boom".into())),
                ..Default::default()
            },
        )
        .unwrap();
        let retried = queue.retry_job(job.id).unwrap();
        assert_eq!(retried.status, JOB_QUEUED);
        assert_eq!(retried.retries, 2);
        assert!(retried.error.is_none());
    }

    #[tokio::test]
    async fn test_per_printer_serialisation() {
        let (db, queue, printer_id) = fixture();
        let mut ids = Vec::new();
        for i in 0..5 {
            let job = db
                .create_job(printer_id, "text", &json!({"lines": [format!("job {i}")]}))
                .unwrap();
            ids.push(job.id);
        }
        let jobs = db.list_jobs_by_status(JOB_QUEUED, 20).unwrap();
        let mut handles = Vec::new();
        for job in jobs {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue.process_job(job).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // All terminal, none left mid-flight.
        for id in ids {
            let job = db.get_job(id).unwrap().unwrap();
            assert_eq!(job.status, JOB_SUCCESS);
        }
    }

    #[test]
    fn test_report_deadline_extended() {
        let (db, queue, printer_id) = fixture();
        let printer = db.get_printer(printer_id).unwrap().unwrap();
        assert!(queue.job_deadline(&printer, PayloadKind::Report) >= Duration::from_secs(60));
        assert!(queue.job_deadline(&printer, PayloadKind::Text) <= Duration::from_secs(15));
    }
}
