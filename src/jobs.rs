//! Correlation of locally-initiated download requests with server-issued
//! job ids, plus the per-job status state machine.
//!
//! The store is the single writer of job status. The reconciliation loop in
//! `queue` merges poll responses through [`JobStore::apply_status`] and pulls
//! newly-terminal jobs exactly once via [`JobStore::take_unhandled_terminal`].

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long a terminal record stays visible before `sweep_expired` drops it.
pub const DEFAULT_JOB_TTL_SECS: u64 = 120;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Downloading,
    Copying,
    #[serde(alias = "cleaning_cache")]
    CleaningUp,
    #[serde(alias = "verifying")]
    Finalizing,
    Cancelling,
    #[serde(alias = "completed")]
    Downloaded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Downloaded | Self::Failed | Self::Cancelled)
    }

    /// Position in the normal pipeline, if this is a pipeline stage.
    fn pipeline_rank(self) -> Option<u8> {
        match self {
            Self::Queued => Some(0),
            Self::Downloading => Some(1),
            Self::Copying => Some(2),
            Self::CleaningUp => Some(3),
            Self::Finalizing => Some(4),
            _ => None,
        }
    }

    /// Whether an observed transition is legal. A one-second poll can miss
    /// intermediate stages, so any forward pipeline move is accepted; a
    /// pipeline stage can fail or be cancelled at any point; `Cancelling`
    /// resolves only to a terminal state (completion can win the race).
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() || next == Self::Cancelling {
            return true;
        }
        match (self.pipeline_rank(), next.pipeline_rank()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("local request {0:?} was never registered")]
    UnknownRequest(String),
    #[error("local request {0:?} is already registered")]
    DuplicateRequest(String),
    #[error("local request {0:?} is already bound to a job")]
    AlreadyBound(String),
    #[error("job {0:?} is not tracked")]
    UnknownJob(String),
    #[error("illegal status transition {from:?} -> {to:?} for job {job_id}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Submission parameters, retained for post-completion reference rewriting.
#[derive(Clone, Debug)]
pub struct SubmitParams {
    pub filename: String,
    pub source_url: Option<String>,
    pub target_folder: String,
}

/// One status snapshot from the poll endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatusReport {
    pub status: JobStatus,
    #[serde(default)]
    pub downloaded_bytes: Option<u64>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub resolved_url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StatusReport {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobRecord {
    pub local_request_id: String,
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub filename: String,
    pub source_url: Option<String>,
    pub target_folder: String,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub error: Option<String>,
    /// Backend-reported installed path; preferred over the requested
    /// filename when rewriting graph references.
    pub installed_path: Option<String>,
    pub resolved_url: Option<String>,
    pub queued_at: u64,
    pub updated_at: u64,
    pub finished_at: Option<u64>,
    /// One-shot marker: completion side effects have already run.
    pub handled: bool,
    /// Set on the first cancel request; later requests are no-ops so the
    /// cancel control can be disabled while one is in flight.
    pub cancel_requested: bool,
}

impl JobRecord {
    fn new(local_request_id: String, params: SubmitParams, now: u64) -> Self {
        Self {
            local_request_id,
            job_id: None,
            status: JobStatus::Queued,
            filename: params.filename,
            source_url: params.source_url,
            target_folder: params.target_folder,
            downloaded_bytes: None,
            total_bytes: None,
            error: None,
            installed_path: None,
            resolved_url: None,
            queued_at: now,
            updated_at: now,
            finished_at: None,
            handled: false,
            cancel_requested: false,
        }
    }
}

/// Tracks every outstanding or recently-terminal download job.
#[derive(Debug)]
pub struct JobStore {
    records: HashMap<String, JobRecord>,
    by_job_id: HashMap<String, String>,
    ttl_secs: u64,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_TTL_SECS)
    }
}

impl JobStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            records: HashMap::new(),
            by_job_id: HashMap::new(),
            ttl_secs,
        }
    }

    /// Creates a pending record before submission; no server id yet.
    pub fn register(
        &mut self,
        local_request_id: &str,
        params: SubmitParams,
        now: u64,
    ) -> Result<(), CorrelationError> {
        if self.records.contains_key(local_request_id) {
            return Err(CorrelationError::DuplicateRequest(
                local_request_id.to_string(),
            ));
        }
        self.records.insert(
            local_request_id.to_string(),
            JobRecord::new(local_request_id.to_string(), params, now),
        );
        Ok(())
    }

    /// Links the server-issued id once the submission response arrives.
    pub fn bind(&mut self, local_request_id: &str, job_id: &str) -> Result<(), CorrelationError> {
        let record = self
            .records
            .get_mut(local_request_id)
            .ok_or_else(|| CorrelationError::UnknownRequest(local_request_id.to_string()))?;
        if record.job_id.is_some() {
            return Err(CorrelationError::AlreadyBound(local_request_id.to_string()));
        }
        record.job_id = Some(job_id.to_string());
        self.by_job_id
            .insert(job_id.to_string(), local_request_id.to_string());
        Ok(())
    }

    /// Drops a request that the backend rejected at submission time.
    pub fn discard(&mut self, local_request_id: &str) -> Option<JobRecord> {
        let record = self.records.remove(local_request_id)?;
        if let Some(job_id) = &record.job_id {
            self.by_job_id.remove(job_id);
        }
        Some(record)
    }

    /// Merges one status snapshot. Re-applying the current status only
    /// refreshes progress fields; a terminal job rejects any further
    /// transition. Returns whether the status itself changed.
    pub fn apply_status(
        &mut self,
        job_id: &str,
        report: &StatusReport,
        now: u64,
    ) -> Result<bool, CorrelationError> {
        let local_id = self
            .by_job_id
            .get(job_id)
            .ok_or_else(|| CorrelationError::UnknownJob(job_id.to_string()))?;
        let record = self
            .records
            .get_mut(local_id)
            .expect("job id index out of sync with records");

        let from = record.status;
        let to = report.status;
        if !from.can_transition_to(to) {
            return Err(CorrelationError::InvalidTransition {
                job_id: job_id.to_string(),
                from,
                to,
            });
        }

        if let Some(bytes) = report.downloaded_bytes {
            record.downloaded_bytes = Some(bytes);
        }
        if let Some(bytes) = report.total_bytes {
            record.total_bytes = Some(bytes);
        }
        if report.error.is_some() {
            record.error = report.error.clone();
        }
        if report.path.is_some() {
            record.installed_path = report.path.clone();
        }
        if report.resolved_url.is_some() {
            record.resolved_url = report.resolved_url.clone();
        }
        record.updated_at = now;

        if from == to {
            return Ok(false);
        }
        record.status = to;
        if to.is_terminal() {
            record.finished_at = Some(now);
        }
        Ok(true)
    }

    /// Work list for the poll driver: every bound job not yet terminal.
    pub fn pending_job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .values()
            .filter(|record| !record.status.is_terminal())
            .filter_map(|record| record.job_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Returns every terminal record whose completion side effect has not
    /// run yet, marking each as handled. A batched poll can complete several
    /// jobs in one tick; this is what keeps their effects one-shot.
    pub fn take_unhandled_terminal(&mut self) -> Vec<JobRecord> {
        let mut finished: Vec<JobRecord> = self
            .records
            .values_mut()
            .filter(|record| record.status.is_terminal() && !record.handled)
            .map(|record| {
                record.handled = true;
                record.clone()
            })
            .collect();
        finished.sort_by(|a, b| a.local_request_id.cmp(&b.local_request_id));
        finished
    }

    /// Marks a cancel as requested. Returns false when a cancel is already
    /// in flight or the job is terminal, so a double-cancel is a no-op.
    pub fn request_cancel(&mut self, job_id: &str) -> bool {
        let Some(local_id) = self.by_job_id.get(job_id) else {
            return false;
        };
        let record = self
            .records
            .get_mut(local_id)
            .expect("job id index out of sync with records");
        if record.cancel_requested || record.status.is_terminal() {
            return false;
        }
        record.cancel_requested = true;
        true
    }

    /// Garbage-collects handled terminal records older than the TTL,
    /// returning the evicted job ids for any final UI cleanup. A record
    /// whose completion effect has not run yet is never swept.
    pub fn sweep_expired(&mut self, now: u64) -> Vec<String> {
        let ttl = self.ttl_secs;
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|record| {
                record.status.is_terminal()
                    && record.handled
                    && record
                        .finished_at
                        .is_some_and(|finished| now.saturating_sub(finished) >= ttl)
            })
            .map(|record| record.local_request_id.clone())
            .collect();

        let mut evicted = Vec::new();
        for local_id in expired {
            if let Some(record) = self.records.remove(&local_id) {
                if let Some(job_id) = record.job_id {
                    self.by_job_id.remove(&job_id);
                    evicted.push(job_id);
                }
            }
        }
        evicted.sort();
        evicted
    }

    pub fn get_by_job_id(&self, job_id: &str) -> Option<&JobRecord> {
        self.by_job_id
            .get(job_id)
            .and_then(|local_id| self.records.get(local_id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(filename: &str) -> SubmitParams {
        SubmitParams {
            filename: filename.to_string(),
            source_url: Some(format!("https://huggingface.co/acme/repo/{filename}")),
            target_folder: "checkpoints".to_string(),
        }
    }

    fn store_with_job(job_id: &str) -> JobStore {
        let mut store = JobStore::default();
        store.register("req-1", params("model.safetensors"), 100).unwrap();
        store.bind("req-1", job_id).unwrap();
        store
    }

    #[test]
    fn bind_requires_registration() {
        let mut store = JobStore::default();
        assert!(matches!(
            store.bind("ghost", "dl_1"),
            Err(CorrelationError::UnknownRequest(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut store = JobStore::default();
        store.register("req-1", params("a"), 0).unwrap();
        assert!(matches!(
            store.register("req-1", params("a"), 0),
            Err(CorrelationError::DuplicateRequest(_))
        ));
    }

    #[test]
    fn reapplying_a_status_is_a_no_op() {
        let mut store = store_with_job("dl_1");
        let report = StatusReport::with_status(JobStatus::Downloading);
        assert!(store.apply_status("dl_1", &report, 101).unwrap());
        assert!(!store.apply_status("dl_1", &report, 102).unwrap());
        assert_eq!(store.get_by_job_id("dl_1").unwrap().updated_at, 102);
    }

    #[test]
    fn terminal_after_terminal_is_rejected() {
        let mut store = store_with_job("dl_1");
        store
            .apply_status("dl_1", &StatusReport::with_status(JobStatus::Downloaded), 101)
            .unwrap();
        let err = store
            .apply_status("dl_1", &StatusReport::with_status(JobStatus::Failed), 102)
            .unwrap_err();
        assert!(matches!(
            err,
            CorrelationError::InvalidTransition {
                from: JobStatus::Downloaded,
                to: JobStatus::Failed,
                ..
            }
        ));
    }

    #[test]
    fn polls_may_skip_pipeline_stages_but_never_rewind() {
        let mut store = store_with_job("dl_1");
        store
            .apply_status("dl_1", &StatusReport::with_status(JobStatus::Finalizing), 101)
            .unwrap();
        assert!(matches!(
            store.apply_status("dl_1", &StatusReport::with_status(JobStatus::Copying), 102),
            Err(CorrelationError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn cancelling_resolves_only_to_terminal() {
        assert!(JobStatus::Downloading.can_transition_to(JobStatus::Cancelling));
        assert!(JobStatus::Cancelling.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Cancelling.can_transition_to(JobStatus::Downloaded));
        assert!(!JobStatus::Cancelling.can_transition_to(JobStatus::Downloading));
    }

    #[test]
    fn take_unhandled_terminal_is_one_shot() {
        let mut store = store_with_job("dl_1");
        store
            .apply_status("dl_1", &StatusReport::with_status(JobStatus::Downloaded), 101)
            .unwrap();
        assert_eq!(store.take_unhandled_terminal().len(), 1);
        assert!(store.take_unhandled_terminal().is_empty());
    }

    #[test]
    fn double_cancel_is_idempotent() {
        let mut store = store_with_job("dl_1");
        assert!(store.request_cancel("dl_1"));
        assert!(!store.request_cancel("dl_1"));
    }

    #[test]
    fn sweep_evicts_only_aged_terminal_records() {
        let mut store = store_with_job("dl_1");
        store.register("req-2", params("other.safetensors"), 100).unwrap();
        store.bind("req-2", "dl_2").unwrap();

        store
            .apply_status("dl_1", &StatusReport::with_status(JobStatus::Downloaded), 100)
            .unwrap();
        // Not handled yet: the record must survive even past its TTL.
        assert!(store.sweep_expired(100 + DEFAULT_JOB_TTL_SECS).is_empty());
        store.take_unhandled_terminal();
        assert!(store.sweep_expired(100 + DEFAULT_JOB_TTL_SECS - 1).is_empty());
        assert_eq!(
            store.sweep_expired(100 + DEFAULT_JOB_TTL_SECS),
            vec!["dl_1".to_string()]
        );
        // The still-pending job survives.
        assert_eq!(store.pending_job_ids(), vec!["dl_2".to_string()]);
    }

    #[test]
    fn status_names_match_the_wire_including_legacy_aliases() {
        let report: StatusReport =
            serde_json::from_str(r#"{"status": "cleaning_cache"}"#).unwrap();
        assert_eq!(report.status, JobStatus::CleaningUp);
        let report: StatusReport = serde_json::from_str(r#"{"status": "completed"}"#).unwrap();
        assert_eq!(report.status, JobStatus::Downloaded);
    }
}
