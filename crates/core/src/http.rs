use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, warn};

use crate::collab::{
    AuthenticationCache, ContentUploader, Credential, MetadataAttacher, MetadataFlavor,
};
use crate::identity::Identity;
use crate::{Error, Result};

const RETRY_BASE_DELAY_MS: u64 = 250;
const METADATA_CONTENT_TYPE: &str = "text/turtle";

/// Hands out one preconfigured credential per authentication origin.
/// Origins without an entry are accessed anonymously.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialCache {
    by_origin: HashMap<String, Credential>,
}

impl StaticCredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, origin: impl Into<String>, authorization: impl Into<String>) {
        let origin: String = origin.into();
        self.by_origin.insert(
            origin.trim_end_matches('/').to_string(),
            Credential::authorization(authorization),
        );
    }
}

impl AuthenticationCache for StaticCredentialCache {
    fn session_credential<'a>(
        &'a self,
        identity: &'a Identity,
    ) -> BoxFuture<'a, Result<Credential>> {
        Box::pin(async move {
            Ok(self
                .by_origin
                .get(&identity.issuer)
                .cloned()
                .unwrap_or_else(Credential::anonymous))
        })
    }
}

/// Writes each file with a plain `PUT` to its URL below the pod root.
#[derive(Debug, Clone, Default)]
pub struct HttpContentUploader {
    client: reqwest::Client,
}

impl HttpContentUploader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl ContentUploader for HttpContentUploader {
    fn upload<'a>(
        &'a self,
        credential: &'a Credential,
        identity: &'a Identity,
        content: Vec<u8>,
        relative_path: &'a str,
        content_type: &'a str,
        retry_budget: u32,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let url = identity.resource_url(relative_path)?;
            put_with_retries(
                &self.client,
                credential,
                &url,
                content_type,
                content,
                retry_budget,
            )
            .await
            .map_err(|message| Error::Upload {
                resource: url.clone(),
                message,
            })
        })
    }
}

/// Writes a rendered rule document to the auxiliary resource of a file
/// (`<file>.acl` or `<file>.acr`).
///
/// The rule documents come from operator-supplied templates in which
/// `{resource}`, `{webId}` and `{podRoot}` are substituted.
#[derive(Debug, Clone, Default)]
pub struct HttpMetadataAttacher {
    client: reqwest::Client,
    templates: HashMap<MetadataFlavor, String>,
}

impl HttpMetadataAttacher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            templates: HashMap::new(),
        }
    }

    pub fn with_template(mut self, flavor: MetadataFlavor, template: impl Into<String>) -> Self {
        self.templates.insert(flavor, template.into());
        self
    }

    pub fn render(
        &self,
        flavor: MetadataFlavor,
        identity: &Identity,
        resource: &str,
    ) -> Option<String> {
        self.templates.get(&flavor).map(|t| {
            t.replace("{resource}", resource)
                .replace("{webId}", &identity.web_id)
                .replace("{podRoot}", &identity.pod_root)
        })
    }
}

impl MetadataAttacher for HttpMetadataAttacher {
    fn attach<'a>(
        &'a self,
        credential: &'a Credential,
        identity: &'a Identity,
        directory: &'a str,
        file_name: &'a str,
        flavor: MetadataFlavor,
        retry_budget: u32,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let resource = identity.resource_url(&format!("{directory}{file_name}"))?;
            let body = self
                .render(flavor, identity, &resource)
                .ok_or_else(|| Error::Metadata {
                    flavor: flavor.as_str(),
                    resource: resource.clone(),
                    message: "no template configured".to_string(),
                })?;
            let url = format!("{resource}{}", flavor.resource_suffix());
            put_with_retries(
                &self.client,
                credential,
                &url,
                METADATA_CONTENT_TYPE,
                body.into_bytes(),
                retry_budget,
            )
            .await
            .map_err(|message| Error::Metadata {
                flavor: flavor.as_str(),
                resource,
                message,
            })
        })
    }
}

/// Issues the `PUT` up to `retry_budget + 1` times. Client errors other than
/// 408/429 are not retried.
async fn put_with_retries(
    client: &reqwest::Client,
    credential: &Credential,
    url: &str,
    content_type: &str,
    body: Vec<u8>,
    retry_budget: u32,
) -> std::result::Result<(), String> {
    let mut attempt: u32 = 0;
    loop {
        let mut req = client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .body(body.clone());
        if let Some(auth) = credential.header_value() {
            req = req.header(AUTHORIZATION, auth);
        }

        let (message, retryable) = match req.send().await {
            Ok(res) if res.status().is_success() => {
                debug!(event = "http.put.ok", url, attempt, "http.put.ok");
                return Ok(());
            }
            Ok(res) => {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                let retryable = status.is_server_error()
                    || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || status == reqwest::StatusCode::REQUEST_TIMEOUT;
                (format!("http {status}: {body}"), retryable)
            }
            Err(e) => (format!("request failed: {e}"), true),
        };

        if !retryable || attempt >= retry_budget {
            return Err(message);
        }
        attempt += 1;
        warn!(
            event = "http.put.retry",
            url,
            attempt,
            retry_budget,
            error = %message,
            "http.put.retry"
        );
        tokio::time::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS * u64::from(attempt))).await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn identity(issuer: &str) -> Identity {
        Identity {
            index: 0,
            name: "alice".to_string(),
            web_id: format!("{issuer}/alice/profile/card#me"),
            pod_root: format!("{issuer}/alice/"),
            issuer: issuer.to_string(),
            source_dir: PathBuf::from("/seed/alice"),
        }
    }

    #[tokio::test]
    async fn credentials_are_looked_up_by_origin() {
        let mut cache = StaticCredentialCache::new();
        cache.insert("https://ss0.example.org/", "Bearer t0");

        let known = cache
            .session_credential(&identity("https://ss0.example.org"))
            .await
            .unwrap();
        let unknown = cache
            .session_credential(&identity("https://ss1.example.org"))
            .await
            .unwrap();

        assert_eq!(known.header_value(), Some("Bearer t0"));
        assert_eq!(unknown, Credential::anonymous());
    }

    #[test]
    fn metadata_template_placeholders_are_rendered() {
        let attacher = HttpMetadataAttacher::new().with_template(
            MetadataFlavor::Acl,
            "<#owner> acl:agent <{webId}>; acl:accessTo <{resource}>.",
        );
        let id = identity("http://localhost:3000");

        let body = attacher
            .render(MetadataFlavor::Acl, &id, "http://localhost:3000/alice/a.txt")
            .unwrap();

        assert_eq!(
            body,
            "<#owner> acl:agent <http://localhost:3000/alice/profile/card#me>; \
             acl:accessTo <http://localhost:3000/alice/a.txt>."
        );
        assert!(attacher.render(MetadataFlavor::Acr, &id, "x").is_none());
    }

    #[tokio::test]
    async fn missing_template_is_a_metadata_error() {
        let attacher = HttpMetadataAttacher::new();
        let id = identity("http://localhost:3000");

        let err = attacher
            .attach(
                &Credential::anonymous(),
                &id,
                "sub/",
                "b.txt",
                MetadataFlavor::Acr,
                0,
            )
            .await
            .unwrap_err();

        match err {
            Error::Metadata {
                flavor, resource, ..
            } => {
                assert_eq!(flavor, "acr");
                assert_eq!(resource, "http://localhost:3000/alice/sub/b.txt");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
