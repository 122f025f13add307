//! End-to-end lifecycle tests against the scriptable mock provider.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use sandpit::registry::InstanceRegistry;
use sandpit::{ExecOptions, LifecycleCoordinator, MockProvider, SandboxError};
use tempfile::tempdir;

fn coordinator(provider: MockProvider) -> LifecycleCoordinator {
    LifecycleCoordinator::with_registry(Arc::new(provider), Arc::new(InstanceRegistry::new()))
}

#[tokio::test]
async fn full_lifecycle_with_compose_manifest() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("compose.yaml"),
        r#"
services:
  app:
    image: python:3.12
    working_dir: /workspace
    environment:
      MODE: eval
  db:
    image: postgres:16
    mem_limit: 1g
x-sandpit:
  timeout: 3600
"#,
    )
    .unwrap();

    let provider = MockProvider::new();
    let coordinator = coordinator(provider.clone());

    let envs = coordinator.launch("task-1", dir.path(), None).await.unwrap();
    assert_eq!(envs.len(), 2);
    assert!(envs.contains_key("app"));
    assert!(envs.contains_key("db"));
    assert_eq!(provider.created_count(), 2);

    // Commands run and report output per service.
    let output = envs["app"]
        .exec(
            vec!["python".to_string(), "--version".to_string()],
            ExecOptions::default(),
        )
        .await
        .unwrap();
    assert!(output.success());

    // Files round-trip through the environment.
    envs["app"].write_file("/tmp/input.json", b"{}").await.unwrap();
    let read = envs["app"].read_file("/tmp/input.json").await.unwrap();
    assert_eq!(read, b"{}");

    coordinator.close("task-1").await.unwrap();
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test]
async fn empty_directory_falls_back_to_default_image() {
    let dir = tempdir().unwrap();
    let coordinator = coordinator(MockProvider::new());

    let envs = coordinator.launch("task-1", dir.path(), None).await.unwrap();
    assert_eq!(envs.len(), 1);
    assert!(envs.contains_key("default"));

    coordinator.close("task-1").await.unwrap();
}

#[tokio::test]
async fn instance_scoped_manifest_wins_over_generic() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("task-9-compose.yaml"),
        "services:\n  scoped:\n    image: a\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("compose.yaml"),
        "services:\n  generic:\n    image: b\n",
    )
    .unwrap();
    let coordinator = coordinator(MockProvider::new());

    let envs = coordinator.launch("task-9", dir.path(), None).await.unwrap();
    assert!(envs.contains_key("scoped"));
    assert!(!envs.contains_key("generic"));

    coordinator.close("task-9").await.unwrap();
}

#[tokio::test]
async fn explicit_dockerfile_provisions_single_default_service() {
    let dir = tempdir().unwrap();
    let dockerfile = dir.path().join("Dockerfile");
    fs::write(&dockerfile, "FROM alpine\n").unwrap();
    let coordinator = coordinator(MockProvider::new());

    let envs = coordinator
        .launch("task-1", dir.path(), Some(&dockerfile))
        .await
        .unwrap();
    assert_eq!(envs.len(), 1);
    assert!(envs.contains_key("default"));

    coordinator.close("task-1").await.unwrap();
}

#[tokio::test]
async fn partial_provisioning_failure_leaks_nothing() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("compose.yaml"),
        "services:\n  good:\n    image: a\n  bad:\n    image: b\n",
    )
    .unwrap();

    let provider = MockProvider::new().fail_creation_for("bad");
    let coordinator = coordinator(provider.clone());

    let err = coordinator.launch("task-1", dir.path(), None).await.unwrap_err();
    let SandboxError::Provision(failure) = err else {
        panic!("expected provision failure, got {err}");
    };
    assert_eq!(failure.requested, 2);
    assert_eq!(failure.succeeded, 1);
    assert_eq!(failure.failures[0].service, "bad");

    assert_eq!(provider.live_count(), 0);
    // The id is free for a retry; it fails the same way, not as a live-id clash.
    let retry = coordinator.launch("task-1", dir.path(), None).await.unwrap_err();
    assert!(matches!(retry, SandboxError::Provision(_)));
}

#[tokio::test]
async fn close_revokes_every_environment() {
    let dir = tempdir().unwrap();
    let coordinator = coordinator(MockProvider::new());

    let envs = coordinator.launch("task-1", dir.path(), None).await.unwrap();
    coordinator.close("task-1").await.unwrap();
    coordinator.close("task-1").await.unwrap();

    let err = envs["default"]
        .exec(vec!["true".to_string()], ExecOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_released());
}

#[tokio::test]
async fn exec_timeout_surfaces_as_timeout_error() {
    let dir = tempdir().unwrap();
    let provider = MockProvider::new().with_exec_delay(Duration::from_secs(60));
    let coordinator = coordinator(provider);

    let envs = coordinator.launch("task-1", dir.path(), None).await.unwrap();
    let err = envs["default"]
        .exec(
            vec!["sleep".to_string(), "600".to_string()],
            ExecOptions {
                timeout: Some(Duration::from_millis(20)),
                ..ExecOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    coordinator.close("task-1").await.unwrap();
}

#[tokio::test]
async fn concurrent_instances_do_not_interfere() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    fs::write(
        dir_b.path().join("compose.yaml"),
        "services:\n  web:\n    image: nginx\n",
    )
    .unwrap();

    let provider = MockProvider::new();
    let coordinator = coordinator(provider.clone());

    let (a, b) = tokio::join!(
        coordinator.launch("task-a", dir_a.path(), None),
        coordinator.launch("task-b", dir_b.path(), None),
    );
    let envs_a = a.unwrap();
    let envs_b = b.unwrap();
    assert!(envs_a.contains_key("default"));
    assert!(envs_b.contains_key("web"));

    // Closing one instance leaves the other fully usable.
    coordinator.close("task-a").await.unwrap();
    assert!(envs_a["default"]
        .read_file("/etc/hostname")
        .await
        .unwrap_err()
        .is_released());
    envs_b["web"].write_file("/srv/index.html", b"ok").await.unwrap();

    coordinator.close("task-b").await.unwrap();
    assert_eq!(provider.live_count(), 0);
}
