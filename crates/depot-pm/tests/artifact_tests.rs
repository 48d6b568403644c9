//! Integration tests for binary artifact acquisition

mod common;

use common::{ManifestBuilder, TestWorkspace};
use depot_pm::identity::PackageIdentity;
use depot_pm::ArtifactSource;
use std::fs;

const ARCHIVE_URL: &str = "https://cdn.example.com/a.zip";
const INDEX_URL: &str = "https://cdn.example.com/a.artifactbundleindex";

fn app() -> PackageIdentity {
    PackageIdentity::plain("app")
}

fn index(file_name: &str, checksum: &str, triple: &str) -> String {
    format!(
        r#"{{"schemaVersion":"1.0","archives":[{{"fileName":"{}","checksum":"{}","supportedTriples":["{}"]}}]}}"#,
        file_name, checksum, triple
    )
}

#[test]
fn test_remote_artifact_is_installed() {
    let ws = TestWorkspace::new();
    ws.transport.serve(ARCHIVE_URL, "A.artifactbundle");
    let root = ws.add_root(
        "app",
        &ManifestBuilder::new("App").remote_binary("A", ARCHIVE_URL, "A.artifactbundle"),
    );

    ws.workspace.resolve(&[root], &[]).unwrap();

    let state = ws.workspace.state();
    let artifact = state.artifact(&app(), "A").unwrap();
    let artifacts_dir = ws.workspace.location().artifacts_dir();
    assert_eq!(artifact.path, artifacts_dir.join("app").join("A.artifactbundle"));
    assert!(artifact.path.join("payload").exists());
    assert_eq!(
        artifact.source,
        ArtifactSource::Remote {
            url: ARCHIVE_URL.to_string(),
            checksum: "A.artifactbundle".to_string(),
        }
    );
    assert!(!artifacts_dir.join("extract").exists());
    assert!(!artifacts_dir.join("app").join("a.zip").exists());
    assert_eq!(ws.delegate.count("will_download: "), 1);
    assert_eq!(ws.delegate.count("did_download: "), 1);
}

#[test]
fn test_installed_artifact_is_not_downloaded_again() {
    let ws = TestWorkspace::new();
    ws.transport.serve(ARCHIVE_URL, "A.artifactbundle");
    let root = ws.add_root(
        "app",
        &ManifestBuilder::new("App").remote_binary("A", ARCHIVE_URL, "A.artifactbundle"),
    );

    ws.workspace.resolve(&[root.clone()], &[]).unwrap();
    ws.workspace.resolve(&[root], &[]).unwrap();

    assert_eq!(ws.transport.requests(), vec![ARCHIVE_URL.to_string()]);
}

#[test]
fn test_checksum_mismatch() {
    let ws = TestWorkspace::new();
    ws.transport.serve(ARCHIVE_URL, "A.artifactbundle");
    let root = ws.add_root("app", &ManifestBuilder::new("App").remote_binary("A", ARCHIVE_URL, "wrong"));

    let err = ws.workspace.resolve(&[root], &[]).unwrap_err();

    assert_eq!(
        err.messages(),
        vec!["checksum of downloaded artifact of binary target 'A' (A.artifactbundle) does not match checksum specified by the manifest (wrong)".to_string()]
    );
    assert!(ws.workspace.state().artifact(&app(), "A").is_none());
}

#[test]
fn test_archive_without_expected_bundle() {
    let ws = TestWorkspace::new();
    ws.transport.serve(ARCHIVE_URL, "B.artifactbundle");
    let root = ws.add_root(
        "app",
        &ManifestBuilder::new("App").remote_binary("A", ARCHIVE_URL, "B.artifactbundle"),
    );

    let err = ws.workspace.resolve(&[root], &[]).unwrap_err();

    assert_eq!(
        err.to_string(),
        "downloaded archive of binary target 'A' does not contain expected binary artifact 'A'"
    );
}

#[test]
fn test_download_failure() {
    let ws = TestWorkspace::new();
    let root = ws.add_root("app", &ManifestBuilder::new("App").remote_binary("A", ARCHIVE_URL, "x"));

    let err = ws.workspace.resolve(&[root], &[]).unwrap_err();

    assert_eq!(
        err.to_string(),
        format!(
            "failed downloading '{}' which is required by binary target 'A': bad response status code 404",
            ARCHIVE_URL
        )
    );
    assert!(ws
        .delegate
        .events()
        .iter()
        .any(|e| e.starts_with("did_download: ") && e.contains("failed")));
}

#[test]
fn test_failures_are_collected_per_target() {
    let ws = TestWorkspace::new();
    ws.transport.serve(ARCHIVE_URL, "A.artifactbundle");
    let root = ws.add_root(
        "app",
        &ManifestBuilder::new("App")
            .remote_binary("A", ARCHIVE_URL, "A.artifactbundle")
            .remote_binary("B", "https://cdn.example.com/b.zip", "B.artifactbundle"),
    );

    let err = ws.workspace.resolve(&[root], &[]).unwrap_err();

    assert_eq!(err.messages().len(), 1);
    assert!(ws.workspace.state().artifact(&app(), "A").is_some());
    assert!(ws.workspace.state().artifact(&app(), "B").is_none());
}

#[test]
fn test_changed_checksum_is_rejected() {
    let ws = TestWorkspace::new();
    ws.transport.serve(ARCHIVE_URL, "A.artifactbundle");
    let root = ws.add_root(
        "app",
        &ManifestBuilder::new("App").remote_binary("A", ARCHIVE_URL, "A.artifactbundle"),
    );
    ws.workspace.resolve(&[root.clone()], &[]).unwrap();

    ManifestBuilder::new("App")
        .remote_binary("A", ARCHIVE_URL, "other")
        .write(&root);
    let err = ws.workspace.resolve(&[root], &[]).unwrap_err();

    assert_eq!(err.to_string(), "artifact of binary target 'A' has changed checksum");
    assert_eq!(ws.transport.requests().len(), 1);
}

#[test]
fn test_new_url_replaces_artifact() {
    let ws = TestWorkspace::new();
    let other_url = "https://cdn.example.com/a-2.zip";
    ws.transport.serve(ARCHIVE_URL, "A.artifactbundle");
    ws.transport.serve(other_url, "A.artifactbundle");
    let root = ws.add_root(
        "app",
        &ManifestBuilder::new("App").remote_binary("A", ARCHIVE_URL, "A.artifactbundle"),
    );
    ws.workspace.resolve(&[root.clone()], &[]).unwrap();

    ManifestBuilder::new("App")
        .remote_binary("A", other_url, "A.artifactbundle")
        .write(&root);
    ws.workspace.resolve(&[root], &[]).unwrap();

    let state = ws.workspace.state();
    let artifact = state.artifact(&app(), "A").unwrap();
    assert!(matches!(&artifact.source, ArtifactSource::Remote { url, .. } if url == other_url));
    assert!(artifact.path.exists());
}

#[test]
fn test_vanished_target_is_removed() {
    let ws = TestWorkspace::new();
    ws.transport.serve(ARCHIVE_URL, "A.artifactbundle");
    let root = ws.add_root(
        "app",
        &ManifestBuilder::new("App").remote_binary("A", ARCHIVE_URL, "A.artifactbundle"),
    );
    ws.workspace.resolve(&[root.clone()], &[]).unwrap();
    let path = ws.workspace.state().artifact(&app(), "A").unwrap().path.clone();

    ManifestBuilder::new("App").write(&root);
    ws.workspace.resolve(&[root], &[]).unwrap();

    assert_eq!(ws.workspace.state().artifacts().count(), 0);
    assert!(!path.exists());
}

#[test]
fn test_artifact_from_index() {
    let ws = TestWorkspace::new();
    let document = index("a-linux.zip", "A.artifactbundle", "x86_64-unknown-linux-gnu");
    ws.transport.serve(INDEX_URL, &document);
    ws.transport.serve("https://cdn.example.com/a-linux.zip", "A.artifactbundle");
    let root = ws.add_root("app", &ManifestBuilder::new("App").remote_binary("A", INDEX_URL, &document));

    ws.workspace.resolve(&[root], &[]).unwrap();

    assert_eq!(
        ws.transport.requests(),
        vec![INDEX_URL.to_string(), "https://cdn.example.com/a-linux.zip".to_string()]
    );
    let state = ws.workspace.state();
    let artifact = state.artifact(&app(), "A").unwrap();
    assert!(artifact.path.ends_with("A.artifactbundle"));
    assert!(matches!(&artifact.source, ArtifactSource::Remote { url, .. } if url == INDEX_URL));
}

#[test]
fn test_index_without_host_triple() {
    let ws = TestWorkspace::new();
    let document = index("a-mac.zip", "A.artifactbundle", "arm64-apple-macosx");
    ws.transport.serve(INDEX_URL, &document);
    let root = ws.add_root("app", &ManifestBuilder::new("App").remote_binary("A", INDEX_URL, &document));

    let err = ws.workspace.resolve(&[root], &[]).unwrap_err();

    assert_eq!(
        err.to_string(),
        format!(
            "failed retrieving '{}': No supported archive was found for 'x86_64-unknown-linux-gnu'",
            INDEX_URL
        )
    );
}

#[test]
fn test_index_checksum_is_verified() {
    let ws = TestWorkspace::new();
    let document = index("a-linux.zip", "A.artifactbundle", "x86_64-unknown-linux-gnu");
    ws.transport.serve(INDEX_URL, &document);
    let root = ws.add_root("app", &ManifestBuilder::new("App").remote_binary("A", INDEX_URL, "stale"));

    let err = ws.workspace.resolve(&[root], &[]).unwrap_err();

    assert!(err
        .to_string()
        .starts_with(&format!("failed retrieving '{}': checksum of downloaded artifact", INDEX_URL)));
    assert_eq!(ws.transport.requests(), vec![INDEX_URL.to_string()]);
}

#[test]
fn test_local_artifact() {
    let ws = TestWorkspace::new();
    let root = ws.add_root(
        "app",
        &ManifestBuilder::new("App").local_binary("L", "bin/L.artifactbundle"),
    );
    fs::create_dir_all(root.join("bin").join("L.artifactbundle")).unwrap();

    ws.workspace.resolve(&[root.clone()], &[]).unwrap();

    let state = ws.workspace.state();
    let artifact = state.artifact(&app(), "L").unwrap();
    assert_eq!(artifact.source, ArtifactSource::Local);
    assert_eq!(artifact.path, root.join("bin").join("L.artifactbundle"));
    assert!(ws.transport.requests().is_empty());
}

#[test]
fn test_missing_local_artifact() {
    let ws = TestWorkspace::new();
    let root = ws.add_root(
        "app",
        &ManifestBuilder::new("App").local_binary("L", "bin/L.artifactbundle"),
    );

    let err = ws.workspace.resolve(&[root], &[]).unwrap_err();

    assert!(err
        .to_string()
        .starts_with("local binary target 'L' does not exist at"));
}

#[test]
fn test_artifacts_of_dependencies() {
    let ws = TestWorkspace::new();
    ws.transport.serve(ARCHIVE_URL, "A.artifactbundle");
    ws.repositories.add_version(
        "foo",
        "1.0.0",
        &ManifestBuilder::new("Foo").remote_binary("A", ARCHIVE_URL, "A.artifactbundle"),
    );
    let root = ws.add_root("app", &ManifestBuilder::new("App").dependency("foo", "^1.0.0"));

    ws.workspace.resolve(&[root], &[]).unwrap();

    let state = ws.workspace.state();
    let artifact = state.artifact(&PackageIdentity::plain("foo"), "A").unwrap();
    assert_eq!(
        artifact.path,
        ws.workspace.location().artifacts_dir().join("foo").join("A.artifactbundle")
    );
}
