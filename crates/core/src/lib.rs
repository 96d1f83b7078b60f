pub mod checkpoint;
mod collab;
pub mod config;
mod discovery;
mod error;
mod http;
mod identity;
mod partition;
mod progress;
pub mod run_log;
mod upload;

pub const APP_NAME: &str = "podseed";

pub use checkpoint::{
    CHECKPOINT_FLUSH_THRESHOLD, CheckpointObserver, CheckpointStorage, CheckpointStore,
    FsCheckpointStorage, FsLockProvider, InMemoryCheckpointStorage, InMemoryLockProvider,
    LockGuard, LockProvider, StorageOp,
};
pub use collab::{
    AuthenticationCache, ContentUploader, Credential, DirectoryLister, ListedFile, Listing,
    MetadataAttacher, MetadataFlavor, WalkDirLister,
};
pub use discovery::{
    ACCOUNT_EMAIL_DOMAIN, AccountDescriptor, DEFAULT_ACCOUNT_PASSWORD, discover_accounts,
};
pub use error::{Error, Result};
pub use http::{HttpContentUploader, HttpMetadataAttacher, StaticCredentialCache};
pub use identity::Identity;
pub use partition::{DispatchReport, OriginQueue, Partitioned, WorkPartitioner};
pub use progress::{ProgressSink, UploadProgress};
pub use upload::{
    Collaborators, DEFAULT_CONTENT_TYPE, DEFAULT_METADATA_RETRIES, DEFAULT_UPLOAD_RETRIES,
    TaskRunner, UploadConfig, UploadOptions, UploadSummary, UploadTask, run_upload,
};
