use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use podseed_core::{
    AuthenticationCache, CheckpointStore, Collaborators, ContentUploader, Credential, Error,
    Identity, MetadataAttacher, MetadataFlavor, UploadConfig, UploadOptions, WalkDirLister,
    discover_accounts, run_upload,
};
use tempfile::TempDir;

fn write_file(path: PathBuf, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

/// `alice/a.txt`, `alice/sub/b.txt`, `bob/c.txt`.
fn seed_tree() -> TempDir {
    let root = tempfile::tempdir().unwrap();
    write_file(root.path().join("alice/a.txt"), b"a");
    write_file(root.path().join("alice/sub/b.txt"), b"bb");
    write_file(root.path().join("bob/c.txt"), b"ccc");
    root
}

fn identities(root: &Path) -> Vec<Identity> {
    discover_accounts(root, "http://localhost:3000/")
        .unwrap()
        .into_iter()
        .map(|a| a.into_identity().unwrap())
        .collect()
}

#[derive(Default)]
struct AnonymousAuth {
    fail_for: Option<String>,
}

impl AuthenticationCache for AnonymousAuth {
    fn session_credential<'a>(
        &'a self,
        identity: &'a Identity,
    ) -> BoxFuture<'a, podseed_core::Result<Credential>> {
        Box::pin(async move {
            if self.fail_for.as_deref() == Some(identity.name.as_str()) {
                return Err(Error::Session {
                    account: identity.name.clone(),
                    message: "login rejected".to_string(),
                });
            }
            Ok(Credential::anonymous())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Upload { url: String, bytes: usize },
    Attach { url: String, flavor: MetadataFlavor },
}

#[derive(Default)]
struct RecordingPod {
    calls: Mutex<Vec<Call>>,
    fail_uploads: HashSet<String>,
    /// Relative paths whose `Acl` attachment is rejected.
    fail_acl: HashSet<String>,
}

impl RecordingPod {
    fn failing(paths: &[&str]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_uploads: paths.iter().map(|p| p.to_string()).collect(),
            fail_acl: HashSet::new(),
        }
    }

    fn rejecting_acl(paths: &[&str]) -> Self {
        Self {
            fail_acl: paths.iter().map(|p| p.to_string()).collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn uploaded_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Upload { url, .. } => Some(url),
                Call::Attach { .. } => None,
            })
            .collect();
        urls.sort();
        urls
    }
}

impl ContentUploader for RecordingPod {
    fn upload<'a>(
        &'a self,
        _credential: &'a Credential,
        identity: &'a Identity,
        content: Vec<u8>,
        relative_path: &'a str,
        _content_type: &'a str,
        _retry_budget: u32,
    ) -> BoxFuture<'a, podseed_core::Result<()>> {
        Box::pin(async move {
            let url = identity.resource_url(relative_path).unwrap();
            if self.fail_uploads.contains(relative_path) {
                return Err(Error::Upload {
                    resource: url,
                    message: "http 500".to_string(),
                });
            }
            self.calls.lock().unwrap().push(Call::Upload {
                url,
                bytes: content.len(),
            });
            Ok(())
        })
    }
}

impl MetadataAttacher for RecordingPod {
    fn attach<'a>(
        &'a self,
        _credential: &'a Credential,
        identity: &'a Identity,
        directory: &'a str,
        file_name: &'a str,
        flavor: MetadataFlavor,
        _retry_budget: u32,
    ) -> BoxFuture<'a, podseed_core::Result<()>> {
        Box::pin(async move {
            let relative_path = format!("{directory}{file_name}");
            let url = identity.resource_url(&relative_path).unwrap();
            if flavor == MetadataFlavor::Acl && self.fail_acl.contains(&relative_path) {
                return Err(Error::Metadata {
                    flavor: flavor.as_str(),
                    resource: url,
                    message: "http 403".to_string(),
                });
            }
            self.calls.lock().unwrap().push(Call::Attach { url, flavor });
            Ok(())
        })
    }
}

fn collaborators<'a>(
    auth: &'a AnonymousAuth,
    pod: &'a RecordingPod,
    lister: &'a WalkDirLister,
) -> Collaborators<'a> {
    Collaborators {
        auth,
        uploader: pod,
        attacher: pod,
        lister,
    }
}

#[tokio::test]
async fn seeds_every_file_into_the_owning_pod_and_checkpoints_it() {
    let root = seed_tree();
    let state = tempfile::tempdir().unwrap();
    let checkpoint_path = state.path().join("seed.json");

    let auth = AnonymousAuth::default();
    let pod = RecordingPod::default();
    let lister = WalkDirLister::new();
    let checkpoint = CheckpointStore::open_fs(&checkpoint_path).await.unwrap();

    let summary = run_upload(
        collaborators(&auth, &pod, &lister),
        &identities(root.path()),
        &UploadConfig::default(),
        UploadOptions {
            checkpoint: Some(&checkpoint),
            progress: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.identities, 2);
    assert_eq!(summary.origins, 1);
    assert_eq!(summary.planned, 3);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.uploaded, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.checkpoint_entries, Some(3));

    assert_eq!(
        pod.uploaded_urls(),
        vec![
            "http://localhost:3000/alice/a.txt",
            "http://localhost:3000/alice/sub/b.txt",
            "http://localhost:3000/bob/c.txt",
        ]
    );

    let on_disk: Vec<String> =
        serde_json::from_slice(&std::fs::read(&checkpoint_path).unwrap()).unwrap();
    assert_eq!(on_disk, vec!["alice-a.txt", "alice-sub/b.txt", "bob-c.txt"]);
}

#[tokio::test]
async fn second_run_with_same_checkpoint_uploads_nothing() {
    let root = seed_tree();
    let state = tempfile::tempdir().unwrap();
    let checkpoint_path = state.path().join("seed.json");
    let auth = AnonymousAuth::default();
    let lister = WalkDirLister::new();

    {
        let pod = RecordingPod::default();
        let checkpoint = CheckpointStore::open_fs(&checkpoint_path).await.unwrap();
        run_upload(
            collaborators(&auth, &pod, &lister),
            &identities(root.path()),
            &UploadConfig::default(),
            UploadOptions {
                checkpoint: Some(&checkpoint),
                progress: None,
            },
        )
        .await
        .unwrap();
    }

    let pod = RecordingPod::default();
    let checkpoint = CheckpointStore::open_fs(&checkpoint_path).await.unwrap();
    let summary = run_upload(
        collaborators(&auth, &pod, &lister),
        &identities(root.path()),
        &UploadConfig::default(),
        UploadOptions {
            checkpoint: Some(&checkpoint),
            progress: None,
        },
    )
    .await
    .unwrap();

    assert!(pod.calls().is_empty());
    assert_eq!(summary.planned, 0);
    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.checkpoint_entries, Some(3));
}

#[tokio::test]
async fn new_account_directory_only_uploads_its_own_files() {
    let root = seed_tree();
    let state = tempfile::tempdir().unwrap();
    let checkpoint_path = state.path().join("seed.json");
    let auth = AnonymousAuth::default();
    let lister = WalkDirLister::new();

    {
        let pod = RecordingPod::default();
        let checkpoint = CheckpointStore::open_fs(&checkpoint_path).await.unwrap();
        run_upload(
            collaborators(&auth, &pod, &lister),
            &identities(root.path()),
            &UploadConfig::default(),
            UploadOptions {
                checkpoint: Some(&checkpoint),
                progress: None,
            },
        )
        .await
        .unwrap();
    }

    // Sorts before both existing accounts, shifting their indexes.
    write_file(root.path().join("aaron/z.txt"), b"z");

    let pod = RecordingPod::default();
    let checkpoint = CheckpointStore::open_fs(&checkpoint_path).await.unwrap();
    let summary = run_upload(
        collaborators(&auth, &pod, &lister),
        &identities(root.path()),
        &UploadConfig::default(),
        UploadOptions {
            checkpoint: Some(&checkpoint),
            progress: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(pod.uploaded_urls(), vec!["http://localhost:3000/aaron/z.txt"]);
    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.checkpoint_entries, Some(4));
}

#[tokio::test]
async fn without_checkpoint_everything_is_uploaded_every_time() {
    let root = seed_tree();
    let auth = AnonymousAuth::default();
    let lister = WalkDirLister::new();

    for _ in 0..2 {
        let pod = RecordingPod::default();
        let summary = run_upload(
            collaborators(&auth, &pod, &lister),
            &identities(root.path()),
            &UploadConfig::default(),
            UploadOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.uploaded, 3);
        assert_eq!(summary.checkpoint_entries, None);
    }
}

#[tokio::test]
async fn metadata_is_attached_after_each_upload_in_flavor_order() {
    let root = tempfile::tempdir().unwrap();
    write_file(root.path().join("alice/sub/b.txt"), b"bb");

    let auth = AnonymousAuth::default();
    let pod = RecordingPod::default();
    let lister = WalkDirLister::new();
    let config = UploadConfig {
        flavors: vec![MetadataFlavor::Acr, MetadataFlavor::Acl],
        ..UploadConfig::default()
    };

    run_upload(
        collaborators(&auth, &pod, &lister),
        &identities(root.path()),
        &config,
        UploadOptions::default(),
    )
    .await
    .unwrap();

    let url = "http://localhost:3000/alice/sub/b.txt".to_string();
    assert_eq!(
        pod.calls(),
        vec![
            Call::Upload {
                url: url.clone(),
                bytes: 2
            },
            Call::Attach {
                url: url.clone(),
                flavor: MetadataFlavor::Acr
            },
            Call::Attach {
                url,
                flavor: MetadataFlavor::Acl
            },
        ]
    );
}

#[tokio::test]
async fn failed_upload_is_not_checkpointed_but_the_rest_are_flushed() {
    let root = seed_tree();
    let state = tempfile::tempdir().unwrap();
    let checkpoint_path = state.path().join("seed.json");

    let auth = AnonymousAuth::default();
    let pod = RecordingPod::failing(&["sub/b.txt"]);
    let lister = WalkDirLister::new();
    let checkpoint = CheckpointStore::open_fs(&checkpoint_path).await.unwrap();

    let err = run_upload(
        collaborators(&auth, &pod, &lister),
        &identities(root.path()),
        &UploadConfig {
            max_parallel_per_origin: 4,
            ..UploadConfig::default()
        },
        UploadOptions {
            checkpoint: Some(&checkpoint),
            progress: None,
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::TasksFailed { failed: 1, total: 3 }));
    assert!(!checkpoint.contains("alice", "sub/b.txt"));

    let restored = CheckpointStore::open_fs(&checkpoint_path).await.unwrap();
    assert_eq!(restored.len(), 2);
    assert!(restored.contains("alice", "a.txt"));
    assert!(restored.contains("bob", "c.txt"));
}

#[tokio::test]
async fn failed_metadata_attachment_keeps_the_file_out_of_the_checkpoint() {
    let root = seed_tree();
    let state = tempfile::tempdir().unwrap();
    let checkpoint_path = state.path().join("seed.json");

    let auth = AnonymousAuth::default();
    let pod = RecordingPod::rejecting_acl(&["sub/b.txt"]);
    let lister = WalkDirLister::new();
    let config = UploadConfig {
        max_parallel_per_origin: 4,
        flavors: vec![MetadataFlavor::Acr, MetadataFlavor::Acl],
        ..UploadConfig::default()
    };
    let checkpoint = CheckpointStore::open_fs(&checkpoint_path).await.unwrap();

    let err = run_upload(
        collaborators(&auth, &pod, &lister),
        &identities(root.path()),
        &config,
        UploadOptions {
            checkpoint: Some(&checkpoint),
            progress: None,
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::TasksFailed { failed: 1, total: 3 }));
    // The content itself went up and the first flavor was attached.
    let b_url = "http://localhost:3000/alice/sub/b.txt".to_string();
    assert!(pod.uploaded_urls().contains(&b_url));
    assert!(pod.calls().contains(&Call::Attach {
        url: b_url.clone(),
        flavor: MetadataFlavor::Acr
    }));
    assert!(!checkpoint.contains("alice", "sub/b.txt"));

    let restored = CheckpointStore::open_fs(&checkpoint_path).await.unwrap();
    assert_eq!(restored.len(), 2);
    assert!(restored.contains("alice", "a.txt"));
    assert!(restored.contains("bob", "c.txt"));
    assert!(!restored.contains("alice", "sub/b.txt"));

    // A rerun against a healthy pod retries only the unfinished file.
    let healthy = RecordingPod::default();
    let summary = run_upload(
        collaborators(&auth, &healthy, &lister),
        &identities(root.path()),
        &config,
        UploadOptions {
            checkpoint: Some(&restored),
            progress: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(healthy.uploaded_urls(), vec![b_url]);
}

#[tokio::test]
async fn session_failure_only_skips_that_identity() {
    let root = seed_tree();
    let auth = AnonymousAuth {
        fail_for: Some("alice".to_string()),
    };
    let pod = RecordingPod::default();
    let lister = WalkDirLister::new();

    let err = run_upload(
        collaborators(&auth, &pod, &lister),
        &identities(root.path()),
        &UploadConfig::default(),
        UploadOptions::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::TasksFailed { failed: 1, total: 2 }));
    assert_eq!(pod.uploaded_urls(), vec!["http://localhost:3000/bob/c.txt"]);
}

#[tokio::test]
async fn empty_account_directory_is_not_an_error() {
    let root = seed_tree();
    std::fs::create_dir_all(root.path().join("carol")).unwrap();

    let auth = AnonymousAuth::default();
    let pod = RecordingPod::default();
    let lister = WalkDirLister::new();

    let summary = run_upload(
        collaborators(&auth, &pod, &lister),
        &identities(root.path()),
        &UploadConfig::default(),
        UploadOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.identities, 3);
    assert_eq!(summary.uploaded, 3);
}
