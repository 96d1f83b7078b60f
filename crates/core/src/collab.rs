use std::fmt;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::identity::Identity;
use crate::{Error, Result};

/// Opaque session material handed to uploaders, typically an
/// `Authorization` header value. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Option<String>);

impl Credential {
    pub fn anonymous() -> Self {
        Self(None)
    }

    pub fn authorization(value: impl Into<String>) -> Self {
        Self(Some(value.into()))
    }

    pub fn header_value(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Credential(<redacted>)"),
            None => f.write_str("Credential(anonymous)"),
        }
    }
}

/// Kinds of per-file authorization metadata that can be attached after an
/// upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataFlavor {
    Acl,
    Acr,
}

impl MetadataFlavor {
    pub const ALL: [MetadataFlavor; 2] = [MetadataFlavor::Acl, MetadataFlavor::Acr];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acl => "acl",
            Self::Acr => "acr",
        }
    }

    /// Suffix of the auxiliary resource that carries this flavor.
    pub fn resource_suffix(self) -> &'static str {
        match self {
            Self::Acl => ".acl",
            Self::Acr => ".acr",
        }
    }
}

pub trait AuthenticationCache: Send + Sync {
    fn session_credential<'a>(
        &'a self,
        identity: &'a Identity,
    ) -> BoxFuture<'a, Result<Credential>>;
}

pub trait ContentUploader: Send + Sync {
    /// Stores `content` at `relative_path` under the identity's pod root,
    /// retrying up to `retry_budget` extra times.
    fn upload<'a>(
        &'a self,
        credential: &'a Credential,
        identity: &'a Identity,
        content: Vec<u8>,
        relative_path: &'a str,
        content_type: &'a str,
        retry_budget: u32,
    ) -> BoxFuture<'a, Result<()>>;
}

pub trait MetadataAttacher: Send + Sync {
    /// `directory` is relative to the pod root and is empty or ends in `/`.
    fn attach<'a>(
        &'a self,
        credential: &'a Credential,
        identity: &'a Identity,
        directory: &'a str,
        file_name: &'a str,
        flavor: MetadataFlavor,
        retry_budget: u32,
    ) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedFile {
    pub full_path: PathBuf,
    /// Relative to the listed base, `/`-separated.
    pub path_from_base: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub files: Vec<ListedFile>,
    pub dirs: Vec<String>,
}

pub trait DirectoryLister: Send + Sync {
    fn list<'a>(&'a self, path: &'a Path, recursive: bool) -> BoxFuture<'a, Result<Listing>>;
}

/// Lists a local tree with `walkdir`, sorted by file name at each level.
/// Symlinks are not followed.
#[derive(Debug, Default, Clone, Copy)]
pub struct WalkDirLister;

impl WalkDirLister {
    pub fn new() -> Self {
        Self
    }
}

impl DirectoryLister for WalkDirLister {
    fn list<'a>(&'a self, path: &'a Path, recursive: bool) -> BoxFuture<'a, Result<Listing>> {
        let base = path.to_path_buf();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || list_blocking(&base, recursive))
                .await
                .map_err(|e| {
                    Error::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
                })?
        })
    }
}

fn list_blocking(base: &Path, recursive: bool) -> Result<Listing> {
    let mut walk = WalkDir::new(base)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1);
    if !recursive {
        walk = walk.max_depth(1);
    }

    let mut listing = Listing::default();
    for entry in walk {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(base)
            .map_err(|_| Error::InvalidConfig {
                message: "path strip_prefix failed".to_string(),
            })?;
        let rel = slash_path(rel)?;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            listing.dirs.push(rel);
        } else if file_type.is_file() {
            let name = entry
                .file_name()
                .to_str()
                .ok_or_else(|| Error::NonUtf8Path {
                    path: entry.path().to_path_buf(),
                })?
                .to_string();
            listing.files.push(ListedFile {
                full_path: entry.path().to_path_buf(),
                path_from_base: rel,
                name,
            });
        }
    }
    Ok(listing)
}

fn slash_path(rel: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| Error::NonUtf8Path {
                path: rel.to_path_buf(),
            })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}
