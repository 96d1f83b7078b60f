use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::identity::Identity;
use crate::{Error, Result};

pub const DEFAULT_ACCOUNT_PASSWORD: &str = "password";
pub const ACCOUNT_EMAIL_DOMAIN: &str = "example.org";

/// One account to be provisioned for a subdirectory of the seed root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDescriptor {
    pub index: usize,
    pub name: String,
    pub email: String,
    pub password: String,
    pub account_endpoint: String,
    pub source_dir: PathBuf,
}

impl AccountDescriptor {
    pub fn into_identity(self) -> Result<Identity> {
        Identity::from_descriptor(self)
    }
}

/// Maps each immediate subdirectory of `root` to an account, ordered by name.
///
/// `account_template` may contain `{index}` and `{name}` placeholders, which
/// are substituted per account. Regular files directly under `root` are
/// ignored and nothing below the first level is inspected.
pub fn discover_accounts(root: &Path, account_template: &str) -> Result<Vec<AccountDescriptor>> {
    if account_template.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "account template must not be empty".to_string(),
        });
    }
    if !root.is_dir() {
        return Err(Error::Discovery {
            message: format!("root must be an existing directory: {}", root.display()),
        });
    }

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|raw| Error::Discovery {
                message: format!("directory name is not UTF-8: {raw:?}"),
            })?;
        dirs.push((name, path));
    }
    dirs.sort_by(|a, b| a.0.cmp(&b.0));

    let accounts: Vec<AccountDescriptor> = dirs
        .into_iter()
        .enumerate()
        .map(|(index, (name, source_dir))| AccountDescriptor {
            index,
            email: format!("{name}@{ACCOUNT_EMAIL_DOMAIN}"),
            password: DEFAULT_ACCOUNT_PASSWORD.to_string(),
            account_endpoint: render_template(account_template, index, &name),
            name,
            source_dir,
        })
        .collect();

    debug!(
        event = "discovery.finish",
        root = %root.display(),
        accounts = accounts.len(),
        "discovery.finish"
    );
    Ok(accounts)
}

fn render_template(template: &str, index: usize, name: &str) -> String {
    template
        .replace("{index}", &index.to_string())
        .replace("{name}", name)
}
