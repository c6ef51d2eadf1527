//! HTTP client for the extension backend.
//!
//! The backend speaks plain JSON: a submit endpoint that echoes queued ids
//! in submission order, a batched status endpoint keyed by comma-joined ids,
//! a fire-and-forget cancel, the backup browser tree payload, and the three
//! selection-driven operations (backup, restore, delete).

use std::collections::HashMap;

use anyhow::{Context, Result};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jobs::StatusReport;
use crate::queue::DownloadBackend;
use crate::tree::TreeNode;

/// One model to submit for download.
#[derive(Clone, Debug, Serialize)]
pub struct DownloadRequest {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub folder: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub overwrite: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct QueuedDownload {
    pub download_id: String,
    pub filename: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RejectedDownload {
    #[serde(default)]
    pub filename: String,
    pub error: String,
}

/// Response of the submit endpoint. `queued` entries appear in the same
/// order as the accepted submissions, which is what positional correlation
/// relies on.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueueResponse {
    #[serde(default)]
    pub queued: Vec<QueuedDownload>,
    #[serde(default)]
    pub rejected: Vec<RejectedDownload>,
}

/// The backup browser payload: parallel local and remote forests plus
/// repository metadata, consumed read-only by the selection tree.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TreePayload {
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub total_size_bytes: u64,
    #[serde(default)]
    pub local: Vec<TreeNode>,
    #[serde(default)]
    pub backup: Vec<TreeNode>,
}

/// Outcome summary of a backup/restore/delete submission.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct OpSummary {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub restart_required: bool,
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    base_url: Url,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid backend base url {base_url:?}"))?;
        let client = Client::builder()
            .user_agent(format!(
                "{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .context("failed to construct backend HTTP client")?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid backend endpoint path {path:?}"))
    }

    pub async fn queue_downloads(&self, models: &[DownloadRequest]) -> Result<QueueResponse> {
        let url = self.endpoint("queue_download")?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "models": models }))
            .send()
            .await
            .context("failed to reach the download queue endpoint")?
            .error_for_status()
            .context("download submission was rejected by the backend")?;
        response
            .json::<QueueResponse>()
            .await
            .context("failed to parse download queue response")
    }

    pub async fn download_status(&self, ids: &[String]) -> Result<HashMap<String, StatusReport>> {
        #[derive(Deserialize)]
        struct StatusResponse {
            #[serde(default)]
            downloads: HashMap<String, StatusReport>,
        }

        let mut url = self.endpoint("download_status")?;
        url.query_pairs_mut().append_pair("ids", &ids.join(","));
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to reach the download status endpoint")?
            .error_for_status()
            .context("download status request returned error status")?;
        let parsed = response
            .json::<StatusResponse>()
            .await
            .context("failed to parse download status response")?;
        Ok(parsed.downloads)
    }

    pub async fn cancel_download(&self, download_id: &str) -> Result<()> {
        let url = self.endpoint("cancel_download")?;
        self.client
            .post(url)
            .json(&serde_json::json!({ "download_id": download_id }))
            .send()
            .await
            .context("failed to reach the cancel endpoint")?
            .error_for_status()
            .context("cancel request returned error status")?;
        Ok(())
    }

    pub async fn backup_tree(&self) -> Result<TreePayload> {
        let url = self.endpoint("backup_browser_tree")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to reach the backup tree endpoint")?
            .error_for_status()
            .context("backup tree request returned error status")?;
        response
            .json::<TreePayload>()
            .await
            .context("failed to parse backup tree payload")
    }

    pub async fn backup_selected(&self, items: &[Value], size_limit_gb: f64) -> Result<OpSummary> {
        self.submit_selection(
            "backup_selected_to_hf",
            serde_json::json!({ "items": items, "size_limit_gb": size_limit_gb }),
        )
        .await
    }

    pub async fn restore_selected(&self, items: &[Value]) -> Result<OpSummary> {
        self.submit_selection(
            "restore_selected_from_hf",
            serde_json::json!({ "items": items }),
        )
        .await
    }

    pub async fn delete_selected(&self, items: &[Value]) -> Result<OpSummary> {
        self.submit_selection("delete_from_hf_backup", serde_json::json!({ "items": items }))
            .await
    }

    async fn submit_selection(&self, path: &str, body: Value) -> Result<OpSummary> {
        let url = self.endpoint(path)?;
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach the {path} endpoint"))?;

        // Surface the server's status line for unexpected submission
        // failures; everything else is reported as a summary.
        let status = response.status();
        if !status.is_success() {
            let summary = response.json::<OpSummary>().await.unwrap_or_default();
            anyhow::bail!(
                "{path} failed ({status}): {}",
                summary.message.unwrap_or_else(|| "no details".to_string())
            );
        }
        response
            .json::<OpSummary>()
            .await
            .with_context(|| format!("failed to parse {path} response"))
    }
}

impl DownloadBackend for BackendClient {
    async fn queue_downloads(&self, models: &[DownloadRequest]) -> Result<QueueResponse> {
        BackendClient::queue_downloads(self, models).await
    }

    async fn poll_status(&self, ids: &[String]) -> Result<HashMap<String, StatusReport>> {
        self.download_status(ids).await
    }

    async fn cancel(&self, download_id: &str) -> Result<()> {
        self.cancel_download(download_id).await
    }
}
