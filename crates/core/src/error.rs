use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("discovery failed: {message}")]
    Discovery { message: String },

    #[error("session acquisition failed for {account}: {message}")]
    Session { account: String, message: String },

    #[error("checkpoint io error ({op}) on {path:?}: {source}")]
    CheckpointIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upload failed for {resource}: {message}")]
    Upload { resource: String, message: String },

    #[error("metadata ({flavor}) failed for {resource}: {message}")]
    Metadata {
        flavor: &'static str,
        resource: String,
        message: String,
    },

    #[error("checkpoint file is malformed: {path:?}: {message}")]
    Serialization { path: PathBuf, message: String },

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },

    #[error("{failed} of {total} upload tasks failed")]
    TasksFailed { failed: usize, total: usize },
}

impl Error {
    pub(crate) fn checkpoint_io(
        op: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::CheckpointIo {
            op,
            path: path.into(),
            source,
        }
    }
}
