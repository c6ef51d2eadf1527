//! Reconciliation loop between locally-tracked download jobs and
//! backend-reported truth.
//!
//! On a fixed interval the loop issues one batched status request for every
//! pending job, merges the whole response into the [`JobStore`] before any
//! side effect runs, fires each completion effect exactly once, and stops as
//! soon as nothing is pending. Transport errors never fail a job; only an
//! explicit terminal status from the backend does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use percent_encoding::percent_decode_str;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::{DownloadRequest, QueueResponse};
use crate::graph::basename;
use crate::jobs::{unix_now, JobRecord, JobStatus, JobStore, StatusReport, SubmitParams};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The slice of the backend contract the loop needs. Implemented by
/// `api::BackendClient`; tests substitute scripted fakes.
#[allow(async_fn_in_trait)]
pub trait DownloadBackend {
    async fn queue_downloads(&self, models: &[DownloadRequest]) -> Result<QueueResponse>;
    async fn poll_status(&self, ids: &[String]) -> Result<HashMap<String, StatusReport>>;
    async fn cancel(&self, download_id: &str) -> Result<()>;
}

/// Mutable view of the host's graph document. The host marks matched nodes
/// dirty for redraw; the core only reports how many references it touched.
pub trait GraphHost {
    fn rewrite_reference(&mut self, requested: &str, installed: &str) -> usize;
}

impl GraphHost for crate::graph::GraphDocument {
    fn rewrite_reference(&mut self, requested: &str, installed: &str) -> usize {
        crate::graph::rewrite_references(self, requested, installed)
    }
}

/// User-facing completion reporting. Always a summary of counts, never a
/// raw error trace.
pub trait Notifier {
    fn batch_finished(&mut self, summary: &BatchSummary);
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub downloaded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// filename and backend-reported error, for the failure detail view.
    pub failures: Vec<(String, String)>,
}

/// What one submission produced.
#[derive(Clone, Debug, Default)]
pub struct SubmitOutcome {
    pub queued_job_ids: Vec<String>,
    pub rejected: Vec<(String, String)>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Another tick was still in flight; nothing was done.
    pub skipped: bool,
    pub statuses_applied: usize,
    pub completions_handled: usize,
    pub evicted: usize,
    pub pending_after: usize,
}

pub struct Reconciler<B, G, N> {
    backend: B,
    graph: Mutex<G>,
    notifier: Mutex<N>,
    store: Mutex<JobStore>,
    poll_interval: Duration,
    in_flight: AtomicBool,
    shutdown: CancellationToken,
}

impl<B, G, N> Reconciler<B, G, N>
where
    B: DownloadBackend,
    G: GraphHost,
    N: Notifier,
{
    pub fn new(backend: B, graph: G, notifier: N, store: JobStore) -> Self {
        Self {
            backend,
            graph: Mutex::new(graph),
            notifier: Mutex::new(notifier),
            store: Mutex::new(store),
            poll_interval: DEFAULT_POLL_INTERVAL,
            in_flight: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Registers, submits, and binds a batch of download requests. Queued
    /// ids from the backend correlate positionally with the accepted
    /// submissions; rejected entries are discarded from tracking.
    pub async fn submit(&self, requests: Vec<DownloadRequest>) -> Result<SubmitOutcome> {
        if requests.is_empty() {
            return Ok(SubmitOutcome::default());
        }

        let now = unix_now();
        let mut local_ids = Vec::with_capacity(requests.len());
        {
            let mut store = self.store.lock().expect("job store lock poisoned");
            for request in &requests {
                let local_id = next_request_id();
                store.register(
                    &local_id,
                    SubmitParams {
                        filename: request.filename.clone(),
                        source_url: request.url.clone(),
                        target_folder: request.folder.clone(),
                    },
                    now,
                )?;
                local_ids.push(local_id);
            }
        }

        let response = match self.backend.queue_downloads(&requests).await {
            Ok(response) => response,
            Err(err) => {
                let mut store = self.store.lock().expect("job store lock poisoned");
                for local_id in &local_ids {
                    store.discard(local_id);
                }
                return Err(err);
            }
        };

        let mut outcome = SubmitOutcome::default();
        let mut rejected_names: Vec<String> = response
            .rejected
            .iter()
            .map(|entry| entry.filename.clone())
            .collect();
        for entry in &response.rejected {
            outcome
                .rejected
                .push((entry.filename.clone(), entry.error.clone()));
        }

        let mut store = self.store.lock().expect("job store lock poisoned");
        let mut queued = response.queued.iter();
        for (request, local_id) in requests.iter().zip(&local_ids) {
            if let Some(slot) = rejected_names.iter().position(|name| *name == request.filename) {
                rejected_names.remove(slot);
                store.discard(local_id);
                continue;
            }
            let Some(next) = queued.next() else {
                store.discard(local_id);
                warn!(
                    "backend queued fewer downloads than submitted; dropping {:?}",
                    request.filename
                );
                continue;
            };
            store.bind(local_id, &next.download_id)?;
            outcome.queued_job_ids.push(next.download_id.clone());
        }

        info!(
            "Submitted {} download(s), {} rejected.",
            outcome.queued_job_ids.len(),
            outcome.rejected.len()
        );
        Ok(outcome)
    }

    /// Best-effort cancel. The loop keeps polling until the backend reports
    /// a terminal status; a repeated cancel for the same job is a no-op.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let newly_requested = self
            .store
            .lock()
            .expect("job store lock poisoned")
            .request_cancel(job_id);
        if !newly_requested {
            debug!("cancel for {job_id} ignored (already requested or terminal)");
            return Ok(());
        }
        if let Err(err) = self.backend.cancel(job_id).await {
            warn!("cancel request for {job_id} failed: {err:#}");
        }
        Ok(())
    }

    pub fn pending_job_ids(&self) -> Vec<String> {
        self.store
            .lock()
            .expect("job store lock poisoned")
            .pending_job_ids()
    }

    pub fn job(&self, job_id: &str) -> Option<JobRecord> {
        self.store
            .lock()
            .expect("job store lock poisoned")
            .get_by_job_id(job_id)
            .cloned()
    }

    /// Drives ticks until every tracked job is terminal and handled, or the
    /// shutdown token fires.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if report.pending_after == 0 && !report.skipped => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!("reconciliation tick failed: {err:#}");
                        }
                    }
                }
            }
        }
    }

    /// One poll-and-apply step. Guarded against overlapping cycles: a tick
    /// arriving while another is mid-flight is skipped, not queued.
    pub async fn tick(&self) -> Result<TickReport> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Ok(TickReport {
                skipped: true,
                ..TickReport::default()
            });
        }
        let result = self.tick_inner().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn tick_inner(&self) -> Result<TickReport> {
        let pending = self.pending_job_ids();
        if pending.is_empty() {
            return Ok(TickReport::default());
        }

        let reports = match self.backend.poll_status(&pending).await {
            Ok(reports) => reports,
            Err(err) => {
                // Transient transport failure: retry next interval, leave
                // every job untouched.
                warn!("status poll failed, retrying next tick: {err:#}");
                return Ok(TickReport {
                    pending_after: pending.len(),
                    ..TickReport::default()
                });
            }
        };

        let now = unix_now();
        let mut applied = 0usize;
        {
            let mut store = self.store.lock().expect("job store lock poisoned");
            for (job_id, report) in &reports {
                match store.apply_status(job_id, report, now) {
                    Ok(_) => applied += 1,
                    Err(err) => warn!("ignoring status for {job_id}: {err}"),
                }
            }
        }

        let finished = self
            .store
            .lock()
            .expect("job store lock poisoned")
            .take_unhandled_terminal();
        if !finished.is_empty() {
            let mut summary = BatchSummary::default();
            for job in &finished {
                self.handle_completion(job, &mut summary);
            }
            self.notifier
                .lock()
                .expect("notifier lock poisoned")
                .batch_finished(&summary);
        }

        let mut store = self.store.lock().expect("job store lock poisoned");
        let evicted = store.sweep_expired(now);
        Ok(TickReport {
            skipped: false,
            statuses_applied: applied,
            completions_handled: finished.len(),
            evicted: evicted.len(),
            pending_after: store.pending_job_ids().len(),
        })
    }

    fn handle_completion(&self, job: &JobRecord, summary: &mut BatchSummary) {
        match job.status {
            JobStatus::Downloaded => {
                let installed = resolve_installed_name(job);
                let rewritten = self
                    .graph
                    .lock()
                    .expect("graph host lock poisoned")
                    .rewrite_reference(&job.filename, &installed);
                info!(
                    "{} finished as {installed:?}; {rewritten} graph reference(s) updated.",
                    job.filename
                );
                summary.downloaded += 1;
            }
            JobStatus::Failed => {
                let error = job
                    .error
                    .clone()
                    .unwrap_or_else(|| "download failed".to_string());
                summary.failures.push((job.filename.clone(), error));
                summary.failed += 1;
            }
            JobStatus::Cancelled => {
                summary.cancelled += 1;
            }
            status => {
                // take_unhandled_terminal only yields terminal records.
                debug_assert!(status.is_terminal());
            }
        }
    }
}

fn next_request_id() -> String {
    format!("req-{}", REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
}

/// Effective installed filename for a completed job. Quantized or renamed
/// variants are common, so the backend-reported path wins over what was
/// requested. Fallback priority: status path, then source URL basename,
/// then redirect-resolved URL basename, then the requested filename.
pub fn resolve_installed_name(job: &JobRecord) -> String {
    if let Some(path) = job.installed_path.as_deref() {
        let name = basename(path);
        if !name.is_empty() {
            return name.to_string();
        }
    }
    for url in [job.source_url.as_deref(), job.resolved_url.as_deref()] {
        if let Some(name) = url.and_then(url_basename) {
            return name;
        }
    }
    job.filename.clone()
}

fn url_basename(url: &str) -> Option<String> {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let segment = trimmed.trim_end_matches('/').rsplit('/').next()?;
    if segment.is_empty() || segment.contains(':') {
        return None;
    }
    let decoded = percent_decode_str(segment).decode_utf8().ok()?;
    let name = decoded.trim();
    // A repo root or owner segment is not a filename.
    if name.is_empty() || !name.contains('.') {
        return None;
    }
    Some(name.to_string())
}
