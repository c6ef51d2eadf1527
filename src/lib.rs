//! Client-side core for a ComfyUI model acquisition extension: selection
//! trees for the backup browser, download job correlation and queue
//! reconciliation, workflow reference rewriting, and the command guard that
//! intercepts runs with missing models.

pub mod api;
pub mod config;
pub mod graph;
pub mod guard;
pub mod jobs;
pub mod queue;
pub mod retry;
pub mod tree;

pub use api::{BackendClient, DownloadRequest, OpSummary, QueueResponse, TreePayload};
pub use config::Settings;
pub use graph::{rewrite_references, EmbeddedModel, GraphDocument, GraphNode, Widget};
pub use guard::{
    AcquisitionFlow, CommandGuard, CommandHost, GuardPolicy, HostProbe, Intercepted,
    TriggerReason, WrapOutcome,
};
pub use jobs::{CorrelationError, JobRecord, JobStatus, JobStore, StatusReport, SubmitParams};
pub use queue::{
    BatchSummary, DownloadBackend, GraphHost, Notifier, Reconciler, SubmitOutcome, TickReport,
};
pub use tree::{CheckState, SelectionTree, TreeError, TreeNode};
