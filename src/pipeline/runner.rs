//! Periodic trigger contract.
//!
//! `PipelineRunner` owns the single-run guarantee: an atomic busy flag is
//! taken with compare-and-swap before a run starts, so a second trigger
//! while one is in flight returns [`RunOutcome::AlreadyRunning`] instead of
//! starting a parallel run. The scheduler loop and the HTTP control surface
//! both go through [`PipelineRunner::try_run`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channels::email::Mailbox;
use crate::error::{PipelineError, SinkError};
use crate::pipeline::processor::{InvoiceProcessor, SeenDocuments};
use crate::pipeline::types::MessageReport;
use crate::sink::{DocumentSink, SinkReceipt};

/// Default scheduler interval: 60 minutes.
pub const DEFAULT_INTERVAL_MINUTES: u64 = 60;

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub messages: usize,
    pub documents: usize,
    pub duplicates: usize,
    pub failed_references: usize,
    /// Documents the sink refused (message left unread for a retry).
    pub sink_failures: usize,
    pub delivered: Vec<SinkReceipt>,
    pub details: Vec<MessageReport>,
}

impl RunReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            messages: 0,
            documents: 0,
            duplicates: 0,
            failed_references: 0,
            sink_failures: 0,
            delivered: Vec::new(),
            details: Vec::new(),
        }
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        if self.messages == 0 {
            return "No matching messages".to_string();
        }
        format!(
            "Processed {} message(s): {} document(s), {} duplicate(s), {} failed reference(s)",
            self.messages, self.documents, self.duplicates, self.failed_references
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { report: RunReport },
    AlreadyRunning,
}

/// Snapshot for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    /// Scheduler loop active.
    pub scheduled: bool,
    /// A run is in flight right now.
    pub running: bool,
    pub interval_minutes: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<RunReport>,
}

#[derive(Default)]
struct RunHistory {
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_report: Option<RunReport>,
}

struct SchedulerHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

pub struct PipelineRunner {
    mailbox: Arc<dyn Mailbox>,
    processor: Arc<InvoiceProcessor>,
    sink: Arc<dyn DocumentSink>,
    interval: Duration,
    busy: AtomicBool,
    history: RwLock<RunHistory>,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

/// Clears the busy flag when the run ends, including on cancellation.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PipelineRunner {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        processor: Arc<InvoiceProcessor>,
        sink: Arc<dyn DocumentSink>,
        interval: Duration,
    ) -> Self {
        Self {
            mailbox,
            processor,
            sink,
            interval,
            busy: AtomicBool::new(false),
            history: RwLock::new(RunHistory::default()),
            scheduler: Mutex::new(None),
        }
    }

    /// True while a run is in flight.
    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run the pipeline once unless a run is already in flight.
    pub async fn try_run(&self) -> Result<RunOutcome, PipelineError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Pipeline run requested while another is in flight");
            return Ok(RunOutcome::AlreadyRunning);
        }
        let _guard = BusyGuard(&self.busy);

        let result = self.run_once().await;

        let mut history = self.history.write().await;
        history.last_run = Some(Utc::now());
        match &result {
            Ok(report) => {
                history.last_error = None;
                history.last_report = Some(report.clone());
            }
            Err(e) => history.last_error = Some(e.to_string()),
        }
        drop(history);

        result.map(|report| RunOutcome::Completed { report })
    }

    async fn run_once(&self) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::new();
        info!(run_id = %report.run_id, "Pipeline run started");

        let mails = self.mailbox.fetch_matching().await?;
        report.messages = mails.len();

        let seen = SeenDocuments::new();
        let mut handled = Vec::with_capacity(mails.len());

        for mail in &mails {
            let processed = self.processor.process_with(mail, &seen).await;
            report.duplicates += processed.report.duplicates();
            report.failed_references += processed.report.failed();

            let mut delivered_all = true;
            for document in &processed.documents {
                match self.sink.accept(document).await {
                    Ok(receipt) => {
                        report.documents += 1;
                        report.delivered.push(receipt);
                    }
                    Err(SinkError::Unavailable(reason)) => {
                        error!(reason = %reason, "Extraction collaborator unavailable, aborting run");
                        return Err(PipelineError::Extraction(SinkError::Unavailable(reason)));
                    }
                    Err(e) => {
                        warn!(
                            message_id = %document.source_message_id,
                            filename = %document.suggested_filename,
                            error = %e,
                            "Document rejected by sink"
                        );
                        report.sink_failures += 1;
                        delivered_all = false;
                    }
                }
            }

            if delivered_all {
                handled.push(mail.mailbox_id.clone());
            }
            report.details.push(processed.report);
        }

        if let Err(e) = self.mailbox.mark_processed(&handled).await {
            warn!(error = %e, "Failed to mark messages as processed");
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            messages = report.messages,
            documents = report.documents,
            duplicates = report.duplicates,
            failed = report.failed_references,
            "Pipeline run finished"
        );
        Ok(report)
    }

    /// Start the periodic loop. No-op if it is already running.
    pub async fn start_scheduler(self: &Arc<Self>) -> JobStatus {
        {
            let mut slot = self.scheduler.lock().await;
            if slot.as_ref().is_some_and(|s| !s.handle.is_finished()) {
                info!("Scheduler already running");
            } else {
                let (handle, shutdown, wake) = spawn_scheduler(Arc::clone(self), self.interval);
                *slot = Some(SchedulerHandle {
                    handle,
                    shutdown,
                    wake,
                });
            }
        }
        self.status().await
    }

    /// Stop the periodic loop. A run in flight is allowed to finish.
    pub async fn stop_scheduler(&self) -> JobStatus {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown.store(true, Ordering::Relaxed);
            scheduler.wake.notify_one();
            info!("Scheduler stop requested");
        }
        self.history.write().await.next_run = None;
        self.status().await
    }

    pub async fn status(&self) -> JobStatus {
        let scheduled = self
            .scheduler
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished());
        let history = self.history.read().await;
        JobStatus {
            scheduled,
            running: self.is_running(),
            interval_minutes: self.interval.as_secs() / 60,
            last_run: history.last_run,
            next_run: if scheduled { history.next_run } else { None },
            last_error: history.last_error.clone(),
            last_report: history.last_report.clone(),
        }
    }

    async fn set_next_run(&self) {
        let next = chrono::Duration::from_std(self.interval)
            .ok()
            .map(|d| Utc::now() + d);
        self.history.write().await.next_run = next;
    }
}

/// Spawn the periodic loop. Runs immediately, then every `interval`.
///
/// Returns a `JoinHandle`, a shutdown flag and a wake handle used to
/// interrupt the wait on shutdown.
pub fn spawn_scheduler(
    runner: Arc<PipelineRunner>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>, Arc<Notify>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let wake = Arc::new(Notify::new());
    let wake_handle = Arc::clone(&wake);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            "Invoice scheduler started"
        );

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = wake.notified() => {}
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("Invoice scheduler shutting down");
                return;
            }

            runner.set_next_run().await;
            match runner.try_run().await {
                Ok(RunOutcome::Completed { report }) => info!("{}", report.summary()),
                Ok(RunOutcome::AlreadyRunning) => {
                    info!("Skipping scheduled run, previous run still in flight")
                }
                // Retried on the next tick.
                Err(e) => error!(error = %e, "Scheduled pipeline run failed"),
            }
        }
    });

    (handle, shutdown_flag, wake_handle)
}
