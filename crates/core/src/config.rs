use std::collections::HashSet;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::collab::MetadataFlavor;
use crate::http::{HttpMetadataAttacher, StaticCredentialCache};
use crate::upload::{
    DEFAULT_CONTENT_TYPE, DEFAULT_METADATA_RETRIES, DEFAULT_UPLOAD_RETRIES, UploadConfig,
};
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;
pub const SETTINGS_FILE_NAME: &str = "podseed.toml";
pub const DEFAULT_ACCOUNT_TEMPLATE: &str = "http://localhost:3000/";
pub const DEFAULT_CHECKPOINT_FILE_NAME: &str = "podseed.checkpoint.json";

const MAX_RETRY_BUDGET: u32 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default = "default_account_template")]
    pub account_template: String,
    /// Relative paths resolve against the data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<String>,
    #[serde(default = "default_parallel")]
    pub max_parallel_per_origin: usize,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub metadata: MetadataSettings,
    #[serde(default)]
    pub credentials: Vec<OriginCredential>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub upload: u32,
    pub metadata: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSettings {
    #[serde(default)]
    pub acl: bool,
    #[serde(default)]
    pub acr: bool,
    /// Relative paths resolve against the config dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl_template_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acr_template_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginCredential {
    pub origin: String,
    /// Full `Authorization` header value, e.g. `Bearer ...`.
    pub authorization: String,
}

fn default_account_template() -> String {
    DEFAULT_ACCOUNT_TEMPLATE.to_string()
}

fn default_parallel() -> usize {
    1
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            upload: DEFAULT_UPLOAD_RETRIES,
            metadata: DEFAULT_METADATA_RETRIES,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            account_template: default_account_template(),
            checkpoint_path: None,
            max_parallel_per_origin: default_parallel(),
            content_type: default_content_type(),
            retry: RetrySettings::default(),
            metadata: MetadataSettings::default(),
            credentials: Vec::new(),
        }
    }
}

impl Settings {
    pub fn flavors(&self) -> Vec<MetadataFlavor> {
        let mut flavors = Vec::new();
        if self.metadata.acl {
            flavors.push(MetadataFlavor::Acl);
        }
        if self.metadata.acr {
            flavors.push(MetadataFlavor::Acr);
        }
        flavors
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            flavors: self.flavors(),
            max_parallel_per_origin: self.max_parallel_per_origin,
            upload_retries: self.retry.upload,
            metadata_retries: self.retry.metadata,
            content_type: self.content_type.clone(),
        }
    }

    pub fn checkpoint_file(&self, data_dir: &Path) -> PathBuf {
        let raw = self
            .checkpoint_path
            .as_deref()
            .unwrap_or(DEFAULT_CHECKPOINT_FILE_NAME);
        data_dir.join(raw)
    }

    pub fn credential_cache(&self) -> StaticCredentialCache {
        let mut cache = StaticCredentialCache::new();
        for c in &self.credentials {
            cache.insert(c.origin.clone(), c.authorization.clone());
        }
        cache
    }

    /// Loads the rule templates of the enabled flavors from disk.
    pub fn metadata_attacher(&self, config_dir: &Path) -> Result<HttpMetadataAttacher> {
        let mut attacher = HttpMetadataAttacher::new();
        for flavor in self.flavors() {
            let raw = match flavor {
                MetadataFlavor::Acl => self.metadata.acl_template_path.as_deref(),
                MetadataFlavor::Acr => self.metadata.acr_template_path.as_deref(),
            }
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("metadata.{}_template_path is required", flavor.as_str()),
            })?;
            let path = config_dir.join(raw);
            let template = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
                message: format!(
                    "{} template read failed ({}): {e}",
                    flavor.as_str(),
                    path.display()
                ),
            })?;
            attacher = attacher.with_template(flavor, template);
        }
        Ok(attacher)
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE_NAME)
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings schema version")),
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    let text = to_toml(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    // Placeholders are substituted per account; check a sample rendering.
    let sample = settings
        .account_template
        .replace("{index}", "0")
        .replace("{name}", "sample");
    match Url::parse(&sample) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        _ => {
            return Err(Error::InvalidConfig {
                message: format!(
                    "account_template must be an http(s) url: {:?}",
                    settings.account_template
                ),
            });
        }
    }

    if settings.content_type.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "content_type must not be empty".to_string(),
        });
    }

    if settings.retry.upload > MAX_RETRY_BUDGET || settings.retry.metadata > MAX_RETRY_BUDGET {
        return Err(Error::InvalidConfig {
            message: format!("retry budgets must be <= {MAX_RETRY_BUDGET}"),
        });
    }

    if settings.metadata.acl && settings.metadata.acl_template_path.is_none() {
        return Err(Error::InvalidConfig {
            message: "metadata.acl requires metadata.acl_template_path".to_string(),
        });
    }
    if settings.metadata.acr && settings.metadata.acr_template_path.is_none() {
        return Err(Error::InvalidConfig {
            message: "metadata.acr requires metadata.acr_template_path".to_string(),
        });
    }

    let mut origins = HashSet::<&str>::new();
    for c in &settings.credentials {
        let origin = c.origin.trim_end_matches('/');
        if origin.is_empty() {
            return Err(Error::InvalidConfig {
                message: "credentials[].origin must not be empty".to_string(),
            });
        }
        if !origins.insert(origin) {
            return Err(Error::InvalidConfig {
                message: format!("duplicate credentials for origin: {origin}"),
            });
        }
    }

    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
