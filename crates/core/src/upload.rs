use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::checkpoint::CheckpointStore;
use crate::collab::{
    AuthenticationCache, ContentUploader, Credential, DirectoryLister, MetadataAttacher,
    MetadataFlavor,
};
use crate::identity::Identity;
use crate::partition::{Partitioned, WorkPartitioner};
use crate::progress::{ProgressSink, UploadProgress};
use crate::{Error, Result};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
pub const DEFAULT_UPLOAD_RETRIES: u32 = 3;
pub const DEFAULT_METADATA_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Metadata flavors attached to every uploaded file, in order.
    pub flavors: Vec<MetadataFlavor>,
    /// Upper bound on in-flight tasks per authentication origin. `0` and `1`
    /// both mean strictly sequential.
    pub max_parallel_per_origin: usize,
    pub upload_retries: u32,
    pub metadata_retries: u32,
    pub content_type: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            flavors: Vec::new(),
            max_parallel_per_origin: 1,
            upload_retries: DEFAULT_UPLOAD_RETRIES,
            metadata_retries: DEFAULT_METADATA_RETRIES,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.content_type.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "content_type must not be empty".to_string(),
            });
        }
        for (i, flavor) in self.flavors.iter().enumerate() {
            if self.flavors[..i].contains(flavor) {
                return Err(Error::InvalidConfig {
                    message: format!("metadata flavor listed twice: {}", flavor.as_str()),
                });
            }
        }
        Ok(())
    }
}

/// External services a seeding run talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub auth: &'a dyn AuthenticationCache,
    pub uploader: &'a dyn ContentUploader,
    pub attacher: &'a dyn MetadataAttacher,
    pub lister: &'a dyn DirectoryLister,
}

#[derive(Default)]
pub struct UploadOptions<'a> {
    pub checkpoint: Option<&'a CheckpointStore>,
    pub progress: Option<&'a dyn ProgressSink>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub identities: u64,
    pub origins: u64,
    pub planned: u64,
    pub skipped: u64,
    /// Files whose content and metadata reached the pod, even if recording
    /// them in the checkpoint then failed.
    pub uploaded: u64,
    pub failed: u64,
    pub checkpoint_entries: Option<u64>,
}

/// One file waiting to be uploaded into one pod.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub identity: Arc<Identity>,
    pub credential: Credential,
    pub source_path: PathBuf,
    /// Destination path below the pod root, `/`-separated.
    pub relative_path: String,
    pub file_name: String,
    /// Containing directory below the pod root; empty or ending in `/`.
    pub directory: String,
}

impl Partitioned for UploadTask {
    fn partition_key(&self) -> &str {
        &self.identity.issuer
    }
}

impl UploadTask {
    pub fn new(
        identity: Arc<Identity>,
        credential: Credential,
        source_path: PathBuf,
        relative_path: &str,
    ) -> Self {
        let relative_path = relative_path.trim_start_matches('/').to_string();
        let (directory, file_name) = match relative_path.rfind('/') {
            Some(idx) => (
                relative_path[..=idx].to_string(),
                relative_path[idx + 1..].to_string(),
            ),
            None => (String::new(), relative_path.clone()),
        };
        Self {
            identity,
            credential,
            source_path,
            relative_path,
            file_name,
            directory,
        }
    }

    /// Uploads the content, attaches each requested flavor and only then
    /// records the unit as complete.
    pub async fn run(self, runner: &TaskRunner<'_>) -> Result<()> {
        self.transfer(runner).await?;
        self.record(runner).await
    }

    /// Content upload followed by every metadata flavor. Nothing is recorded.
    pub async fn transfer(&self, runner: &TaskRunner<'_>) -> Result<()> {
        let identity = self.identity.as_ref();
        let resource = identity.resource_url(&self.relative_path)?;

        let content = tokio::fs::read(&self.source_path).await.map_err(|e| {
            error!(
                event = "io.source.read_failed",
                account = %identity.name,
                source_path = %self.source_path.display(),
                error = %e,
                "io.source.read_failed"
            );
            Error::Io(e)
        })?;

        runner
            .uploader
            .upload(
                &self.credential,
                identity,
                content,
                &self.relative_path,
                &runner.config.content_type,
                runner.config.upload_retries,
            )
            .await
            .map_err(|e| {
                error!(
                    event = "io.upload.failed",
                    account = %identity.name,
                    resource = %resource,
                    error = %e,
                    "io.upload.failed"
                );
                e
            })?;

        for &flavor in &runner.config.flavors {
            runner
                .attacher
                .attach(
                    &self.credential,
                    identity,
                    &self.directory,
                    &self.file_name,
                    flavor,
                    runner.config.metadata_retries,
                )
                .await
                .map_err(|e| {
                    error!(
                        event = "io.metadata.failed",
                        account = %identity.name,
                        resource = %resource,
                        flavor = flavor.as_str(),
                        error = %e,
                        "io.metadata.failed"
                    );
                    e
                })?;
        }
        Ok(())
    }

    /// Adds the unit to the checkpoint, if one is attached. May trigger a
    /// threshold flush.
    pub async fn record(&self, runner: &TaskRunner<'_>) -> Result<()> {
        if let Some(checkpoint) = runner.checkpoint {
            checkpoint
                .record_completion(self.identity.key(), &self.relative_path)
                .await?;
        }
        Ok(())
    }
}

/// Shared state every task runs against.
pub struct TaskRunner<'a> {
    uploader: &'a dyn ContentUploader,
    attacher: &'a dyn MetadataAttacher,
    config: &'a UploadConfig,
    checkpoint: Option<&'a CheckpointStore>,
}

impl<'a> TaskRunner<'a> {
    pub fn new(
        uploader: &'a dyn ContentUploader,
        attacher: &'a dyn MetadataAttacher,
        config: &'a UploadConfig,
        checkpoint: Option<&'a CheckpointStore>,
    ) -> Self {
        Self {
            uploader,
            attacher,
            config,
            checkpoint,
        }
    }
}

#[derive(Debug)]
struct TaskFailure {
    account: String,
    relative_path: Option<String>,
    error: Error,
}

struct Counters {
    identities_total: u64,
    identities_scanned: AtomicU64,
    planned: AtomicU64,
    done: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn emit(
        &self,
        sink: Option<&dyn ProgressSink>,
        phase: &str,
        checkpoint: Option<&CheckpointStore>,
    ) {
        let Some(sink) = sink else {
            return;
        };
        sink.on_progress(UploadProgress {
            phase: phase.to_string(),
            identities_total: Some(self.identities_total),
            identities_scanned: Some(self.identities_scanned.load(Ordering::Relaxed)),
            files_total: Some(self.planned.load(Ordering::Relaxed)),
            files_done: Some(self.done.load(Ordering::Relaxed)),
            files_skipped: Some(self.skipped.load(Ordering::Relaxed)),
            files_failed: Some(self.failed.load(Ordering::Relaxed)),
            checkpoint_entries: checkpoint.map(|c| c.len() as u64),
        });
    }
}

/// Seeds every identity's pod from its source directory.
///
/// Files already recorded in the checkpoint are skipped. Remaining files are
/// queued per authentication origin and dispatched with at most
/// `max_parallel_per_origin` in flight per origin. Failed tasks do not stop
/// the others; the checkpoint is always flushed once the queues drain, after
/// which any failure is reported as [`Error::TasksFailed`].
pub async fn run_upload(
    collab: Collaborators<'_>,
    identities: &[Identity],
    config: &UploadConfig,
    options: UploadOptions<'_>,
) -> Result<UploadSummary> {
    config.validate()?;

    let scan_started = Instant::now();
    debug!(event = "phase.start", phase = "scan", "phase.start");

    let counters = Counters {
        identities_total: identities.len() as u64,
        identities_scanned: AtomicU64::new(0),
        planned: AtomicU64::new(0),
        done: AtomicU64::new(0),
        skipped: AtomicU64::new(0),
        failed: AtomicU64::new(0),
    };
    let mut failures: Vec<TaskFailure> = Vec::new();
    let mut partitioner = WorkPartitioner::new();

    for identity in identities {
        let identity = Arc::new(identity.clone());

        let credential = match collab.auth.session_credential(&identity).await {
            Ok(c) => c,
            Err(e) => {
                error!(
                    event = "session.failed",
                    account = %identity.name,
                    issuer = %identity.issuer,
                    error = %e,
                    "session.failed"
                );
                failures.push(TaskFailure {
                    account: identity.name.clone(),
                    relative_path: None,
                    error: e,
                });
                continue;
            }
        };

        let listing = match collab.lister.list(&identity.source_dir, true).await {
            Ok(l) => l,
            Err(e) => {
                error!(
                    event = "scan.failed",
                    account = %identity.name,
                    source_dir = %identity.source_dir.display(),
                    error = %e,
                    "scan.failed"
                );
                failures.push(TaskFailure {
                    account: identity.name.clone(),
                    relative_path: None,
                    error: e,
                });
                continue;
            }
        };
        counters.identities_scanned.fetch_add(1, Ordering::Relaxed);

        if listing.files.is_empty() {
            info!(
                event = "scan.empty",
                account = %identity.name,
                source_dir = %identity.source_dir.display(),
                "scan.empty"
            );
            continue;
        }

        for file in listing.files {
            let task = UploadTask::new(
                identity.clone(),
                credential.clone(),
                file.full_path,
                &file.path_from_base,
            );
            if let Some(checkpoint) = options.checkpoint
                && checkpoint.contains(identity.key(), &task.relative_path)
            {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            counters.planned.fetch_add(1, Ordering::Relaxed);
            partitioner.push(task);
        }
        counters.emit(options.progress, "scan", options.checkpoint);
    }

    let identity_failures = failures.len();
    let mut summary = UploadSummary {
        identities: identities.len() as u64,
        origins: partitioner.origin_count() as u64,
        planned: partitioner.task_count() as u64,
        skipped: counters.skipped.load(Ordering::Relaxed),
        ..UploadSummary::default()
    };
    debug!(
        event = "phase.finish",
        phase = "scan",
        duration_ms = scan_started.elapsed().as_millis() as u64,
        planned = summary.planned,
        skipped = summary.skipped,
        "phase.finish"
    );
    info!(
        event = "upload.plan",
        planned = summary.planned,
        origins = summary.origins,
        skipped = summary.skipped,
        "{} files to {} servers, {} skipped",
        summary.planned,
        summary.origins,
        summary.skipped
    );
    for queue in partitioner.queues() {
        for task in &queue.tasks {
            let destination = task
                .identity
                .resource_url(&task.relative_path)
                .unwrap_or_default();
            debug!(
                event = "upload.task",
                account = %task.identity.name,
                source_path = %task.source_path.display(),
                destination = %destination,
                "upload.task"
            );
        }
    }

    let upload_started = Instant::now();
    debug!(event = "phase.start", phase = "upload", "phase.start");
    let runner = TaskRunner::new(collab.uploader, collab.attacher, config, options.checkpoint);
    let report = partitioner
        .dispatch(config.max_parallel_per_origin, |task: UploadTask| {
            let runner = &runner;
            let counters = &counters;
            let progress = options.progress;
            let checkpoint = options.checkpoint;
            async move {
                let account = task.identity.name.clone();
                let relative_path = task.relative_path.clone();
                let res = match task.transfer(runner).await {
                    Ok(()) => {
                        counters.done.fetch_add(1, Ordering::Relaxed);
                        task.record(runner).await
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        Err(e)
                    }
                };
                counters.emit(progress, "upload", checkpoint);
                res.map_err(|error| TaskFailure {
                    account,
                    relative_path: Some(relative_path),
                    error,
                })
            }
        })
        .await;
    summary.uploaded = counters.done.load(Ordering::Relaxed);
    failures.extend(report.failures);
    debug!(
        event = "phase.finish",
        phase = "upload",
        duration_ms = upload_started.elapsed().as_millis() as u64,
        uploaded = summary.uploaded,
        failed = failures.len() as u64,
        "phase.finish"
    );

    if let Some(checkpoint) = options.checkpoint {
        checkpoint.flush().await?;
        summary.checkpoint_entries = Some(checkpoint.len() as u64);
    }
    counters.emit(options.progress, "done", options.checkpoint);

    summary.failed = failures.len() as u64;
    info!(
        event = "upload.finish",
        uploaded = summary.uploaded,
        skipped = summary.skipped,
        failed = summary.failed,
        checkpoint_entries = summary.checkpoint_entries,
        "upload.finish"
    );

    if failures.is_empty() {
        return Ok(summary);
    }
    for f in &failures {
        error!(
            event = "upload.task_failed",
            account = %f.account,
            relative_path = f.relative_path.as_deref().unwrap_or(""),
            error = %f.error,
            "upload.task_failed"
        );
    }
    // A ledger write that failed mid-run means durability was not guaranteed.
    if let Some(pos) = failures
        .iter()
        .position(|f| matches!(f.error, Error::CheckpointIo { .. }))
    {
        return Err(failures.swap_remove(pos).error);
    }
    Err(Error::TasksFailed {
        failed: failures.len(),
        total: summary.planned as usize + identity_failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Arc<Identity> {
        Arc::new(Identity {
            index: 0,
            name: "alice".to_string(),
            web_id: "http://localhost:3000/alice/profile/card#me".to_string(),
            pod_root: "http://localhost:3000/alice/".to_string(),
            issuer: "http://localhost:3000".to_string(),
            source_dir: PathBuf::from("/seed/alice"),
        })
    }

    #[test]
    fn task_splits_directory_and_file_name() {
        let task = UploadTask::new(
            identity(),
            Credential::anonymous(),
            PathBuf::from("/seed/alice/sub/deeper/b.txt"),
            "sub/deeper/b.txt",
        );
        assert_eq!(task.directory, "sub/deeper/");
        assert_eq!(task.file_name, "b.txt");
        assert_eq!(task.partition_key(), "http://localhost:3000");

        let top = UploadTask::new(
            identity(),
            Credential::anonymous(),
            PathBuf::from("/seed/alice/a.txt"),
            "a.txt",
        );
        assert_eq!(top.directory, "");
        assert_eq!(top.file_name, "a.txt");
    }

    #[test]
    fn duplicate_flavors_are_rejected() {
        let config = UploadConfig {
            flavors: vec![MetadataFlavor::Acl, MetadataFlavor::Acl],
            ..UploadConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }
}
