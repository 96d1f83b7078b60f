use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadProgress {
    pub phase: String,
    pub identities_total: Option<u64>,
    pub identities_scanned: Option<u64>,
    pub files_total: Option<u64>,
    pub files_done: Option<u64>,
    pub files_skipped: Option<u64>,
    pub files_failed: Option<u64>,
    pub checkpoint_entries: Option<u64>,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: UploadProgress);
}
