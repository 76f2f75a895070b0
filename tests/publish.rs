// ABOUTME: Publishing through the tarball builder into an on-disk registry.
// ABOUTME: Same source and tag is idempotent; different content under a taken tag conflicts.

mod support;

use std::fs;
use std::sync::Arc;

use halyard::build::{SourceSpec, TarballBuilder};
use halyard::deploy::{ArtifactPublisher, DeployError};
use halyard::registry::{DirectoryRegistry, MemoryRegistry, Registry};
use support::{FakeBuilder, version};

fn source_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("app.py"), "print('hello')\n").unwrap();
    fs::create_dir_all(dir.path().join("static")).unwrap();
    fs::write(dir.path().join("static/index.html"), "<h1>shop</h1>\n").unwrap();
    dir
}

#[tokio::test]
async fn republishing_identical_source_is_idempotent() {
    let source = source_tree();
    let store = tempfile::tempdir().unwrap();
    let registry = Arc::new(DirectoryRegistry::new(store.path()));
    let publisher = ArtifactPublisher::new(Arc::new(TarballBuilder::new()), registry.clone());
    let spec = SourceSpec::new("shop", source.path());

    let first = publisher.publish(&spec, &version("v1")).await.unwrap();
    let blobs = fs::read_dir(store.path().join("shop/blobs")).unwrap().count();
    let second = publisher.publish(&spec, &version("v1")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        fs::read_dir(store.path().join("shop/blobs")).unwrap().count(),
        blobs
    );
    assert!(registry.exists("shop", &version("v1")).await.unwrap());
}

#[tokio::test]
async fn changed_source_under_taken_tag_conflicts() {
    let source = source_tree();
    let store = tempfile::tempdir().unwrap();
    let registry = Arc::new(DirectoryRegistry::new(store.path()));
    let publisher = ArtifactPublisher::new(Arc::new(TarballBuilder::new()), registry.clone());
    let spec = SourceSpec::new("shop", source.path());

    let original = publisher.publish(&spec, &version("v1")).await.unwrap();
    fs::write(source.path().join("app.py"), "print('changed')\n").unwrap();

    let err = publisher.publish(&spec, &version("v1")).await.unwrap_err();
    match err {
        DeployError::TagConflict {
            existing,
            attempted,
            ..
        } => {
            assert_eq!(&existing, original.digest());
            assert_ne!(existing, attempted);
        }
        other => panic!("expected tag conflict, got {other}"),
    }

    // The published artifact is untouched.
    let current = registry.lookup("shop", &version("v1")).await.unwrap().unwrap();
    assert_eq!(current, original);

    // A new tag takes the new content.
    let next = publisher.publish(&spec, &version("v2")).await.unwrap();
    assert_ne!(next.digest(), original.digest());
}

#[tokio::test]
async fn idempotent_publish_performs_no_second_upload() {
    let builder = Arc::new(FakeBuilder::default());
    let registry = Arc::new(MemoryRegistry::new("registry.test"));
    let publisher = ArtifactPublisher::new(builder.clone(), registry.clone());
    let spec = SourceSpec::new("shop", "/src/shop");

    let first = publisher.publish(&spec, &version("v3")).await.unwrap();
    let second = publisher.publish(&spec, &version("v3")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(builder.builds(), 2);
    assert_eq!(registry.upload_count(), 1);

    builder.change_content("-patched");
    assert!(matches!(
        publisher.publish(&spec, &version("v3")).await,
        Err(DeployError::TagConflict { .. })
    ));
    assert_eq!(registry.upload_count(), 1);
}
