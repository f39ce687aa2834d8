//! Tests for the content-addressed image builder.

use magikube::cluster::{JobState, VolumeSource};
use magikube::constants::{BUILD_CONTAINER, BUILD_ID_LABEL, MANAGED_BY_LABEL};
use magikube::{BuildSpec, BuilderConfig, Error, ImageBuilder, MemoryCluster};
use std::sync::Arc;
use std::time::Duration;

fn config() -> BuilderConfig {
    BuilderConfig {
        poll_interval: Duration::from_millis(1),
        ..BuilderConfig::default()
    }
}

fn builder(cluster: &Arc<MemoryCluster>) -> ImageBuilder {
    ImageBuilder::new(cluster.clone(), config())
}

fn spec() -> BuildSpec {
    BuildSpec::new("python:3.12-slim")
        .with_setup("pip install --no-cache-dir requests")
        .with_file("/app/main.py", "print('hello')\n")
}

// =============================================================================
// Content Addressing
// =============================================================================

#[test]
fn test_identical_specs_share_reference() {
    let cluster = Arc::new(MemoryCluster::new());
    let builder = builder(&cluster);

    let a = builder.plan(&spec()).unwrap();
    let b = builder.plan(&spec()).unwrap();
    assert_eq!(a.tag, b.tag);
    assert_eq!(
        builder.reference_for(&a.tag),
        format!("ttl.sh/{}:1h", a.tag)
    );
}

#[test]
fn test_any_input_change_changes_tag() {
    let cluster = Arc::new(MemoryCluster::new());
    let builder = builder(&cluster);
    let base = builder.plan(&spec()).unwrap().tag;

    let variants = [
        BuildSpec {
            base_image: "python:3.11-slim".into(),
            ..spec()
        },
        spec().with_setup("echo extra"),
        BuildSpec::new("python:3.12-slim")
            .with_setup("pip install --no-cache-dir requests")
            .with_file("/app/main.py", "print('hello!')\n"),
        BuildSpec::new("python:3.12-slim")
            .with_setup("pip install --no-cache-dir requests")
            .with_file("/app/other.py", "print('hello')\n"),
    ];
    for variant in variants {
        assert_ne!(builder.plan(&variant).unwrap().tag, base, "{variant:?}");
    }
}

#[test]
fn test_from_yaml() {
    let yaml = br#"
base_image: alpine:3.20
setup:
  - apk add --no-cache curl
files:
  - path: /etc/motd
    content: "welcome\n"
"#;
    let spec = BuildSpec::from_yaml(yaml).unwrap();
    assert_eq!(spec.base_image, "alpine:3.20");
    assert_eq!(spec.setup.len(), 1);
    assert_eq!(spec.files[0].content, b"welcome\n");

    assert!(matches!(
        BuildSpec::from_yaml(b"setup: {not: a list}"),
        Err(Error::InvalidInput(_))
    ));
}

// =============================================================================
// Build Pipeline
// =============================================================================

#[tokio::test]
async fn test_successful_build() {
    let cluster = Arc::new(MemoryCluster::new());
    let builder = builder(&cluster);

    let image = builder.build(&spec()).await.unwrap();
    assert!(image.tag.starts_with("mk-"));
    assert_eq!(image.reference, format!("ttl.sh/{}:1h", image.tag));

    let history = cluster.job_history();
    assert_eq!(history.len(), 1);
    let job = &history[0];
    assert!(job.labels.contains_key(MANAGED_BY_LABEL));
    assert!(job.labels.contains_key(BUILD_ID_LABEL));
    assert_eq!(job.step.name, BUILD_CONTAINER);
    assert!(job
        .step
        .args
        .contains(&format!("--destination={}", image.reference)));
    assert_eq!(job.init_steps.len(), 1);
    assert!(job
        .volumes
        .iter()
        .any(|v| matches!(v.source, VolumeSource::Artifact { .. })));
}

#[tokio::test]
async fn test_build_cleans_up() {
    let cluster = Arc::new(MemoryCluster::new());
    let builder = builder(&cluster);

    builder.build(&spec()).await.unwrap();
    assert!(cluster.job_names().is_empty());
    assert!(cluster.artifact_names().is_empty());

    cluster.set_job_outcome(JobState::Failed {
        message: "BackoffLimitExceeded".into(),
    });
    builder.build(&spec()).await.unwrap_err();
    assert!(cluster.job_names().is_empty());
    assert!(cluster.artifact_names().is_empty());
}

#[tokio::test]
async fn test_rebuild_runs_full_pipeline_with_fresh_job() {
    let cluster = Arc::new(MemoryCluster::new());
    let builder = builder(&cluster);

    let first = builder.build(&spec()).await.unwrap();
    let second = builder.build(&spec()).await.unwrap();

    assert_eq!(first, second);
    let history = cluster.job_history();
    assert_eq!(history.len(), 2);
    assert_ne!(history[0].name, history[1].name);
}

#[tokio::test]
async fn test_failed_build_carries_logs() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.set_job_outcome(JobState::Failed {
        message: "build step exited with code 1".into(),
    });
    cluster.set_job_logs("Step 2/2 : RUN pip install nope\nERROR: No matching distribution\n");
    let builder = builder(&cluster);

    let err = builder.build(&spec()).await.unwrap_err();
    match &err {
        Error::BuildFailed { reason, logs, .. } => {
            assert!(reason.contains("exited with code 1"));
            assert!(logs.as_deref().unwrap().contains("No matching distribution"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_build_timeout() {
    let cluster = Arc::new(MemoryCluster::new());
    // A job that never finishes: every poll after the first keeps it active.
    cluster.set_job_outcome(JobState::Active);
    let builder = ImageBuilder::new(
        cluster.clone(),
        BuilderConfig {
            build_timeout: Duration::from_millis(50),
            ..config()
        },
    );

    let err = builder.build(&spec()).await.unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert!(cluster.job_names().is_empty());
}

#[tokio::test]
async fn test_invalid_spec_creates_nothing() {
    let cluster = Arc::new(MemoryCluster::new());
    let builder = builder(&cluster);

    let err = builder
        .build(&BuildSpec::new("alpine").with_setup("FROM ubuntu"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = builder
        .build(&BuildSpec::new("alpine").with_file("/big", vec![0u8; 2 * 1024 * 1024]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge { .. }));

    assert!(cluster.job_history().is_empty());
    assert!(cluster.artifact_names().is_empty());
}
