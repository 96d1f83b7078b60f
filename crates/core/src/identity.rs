use std::path::PathBuf;

use reqwest::Url;
use serde::Serialize;

use crate::discovery::AccountDescriptor;
use crate::{Error, Result};

/// A resolved destination: who owns the pod, where it lives and which
/// authentication origin issues its sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub index: usize,
    pub name: String,
    pub web_id: String,
    pub pod_root: String,
    pub issuer: String,
    pub source_dir: PathBuf,
}

impl Identity {
    /// Derives the pod layout used by standard pod servers:
    /// `{server}/{name}/` as root and `{root}profile/card#me` as WebID.
    pub fn from_descriptor(account: AccountDescriptor) -> Result<Self> {
        let server = Url::parse(&account.account_endpoint).map_err(|e| Error::InvalidConfig {
            message: format!(
                "invalid account endpoint {:?}: {e}",
                account.account_endpoint
            ),
        })?;
        if server.cannot_be_a_base() || !matches!(server.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig {
                message: format!(
                    "account endpoint must be an http(s) url: {}",
                    account.account_endpoint
                ),
            });
        }

        let issuer = server.origin().ascii_serialization();
        let pod_root = append_segments(server, &account.name, true)?;
        let web_id = format!("{pod_root}profile/card#me");

        Ok(Self {
            index: account.index,
            name: account.name,
            web_id,
            pod_root,
            issuer,
            source_dir: account.source_dir,
        })
    }

    /// Key under which this identity's completed uploads are checkpointed.
    pub fn key(&self) -> &str {
        &self.name
    }

    /// URL of a `/`-separated path below the pod root. Each segment is
    /// percent-encoded, so `#`, `?` and `%` in file names stay in the path.
    pub fn resource_url(&self, relative_path: &str) -> Result<String> {
        let root = Url::parse(&self.pod_root).map_err(|e| Error::InvalidConfig {
            message: format!("invalid pod root {:?}: {e}", self.pod_root),
        })?;
        append_segments(root, relative_path, false)
    }
}

fn append_segments(mut base: Url, relative_path: &str, trailing_slash: bool) -> Result<String> {
    base.set_query(None);
    base.set_fragment(None);
    let raw = base.to_string();
    {
        let mut segments = base.path_segments_mut().map_err(|()| Error::InvalidConfig {
            message: format!("url cannot carry a path: {raw}"),
        })?;
        segments.pop_if_empty();
        for seg in relative_path.split('/').filter(|s| !s.is_empty()) {
            segments.push(seg);
        }
        if trailing_slash {
            segments.push("");
        }
    }
    Ok(base.into())
}
