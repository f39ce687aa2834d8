//! # Content-Addressed Image Builder
//!
//! Turns a [`BuildSpec`] into a published image whose tag is derived from the
//! spec's content. The build runs inside an ephemeral cluster job:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────────── job ─────────────────────────────┐
//! │  artifact    │   │  init: materialize          step: build                      │
//! │  Dockerfile  │──▶│  cp -L /plan/* ──▶ /context ──▶ --context=dir:///context      │──▶ registry/tag:ttl
//! │  <files>     │   │                    (scratch)     --destination=<reference>    │
//! └──────────────┘   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Caching
//!
//! Identical specs produce identical references, and the registry keyed by
//! tag and ttl acts as the cache. The builder never short-circuits: every
//! call runs the full pipeline, so a cache hit looks exactly like a miss.
//!
//! ## Cleanup
//!
//! The job and the artifact are deleted on every return path.

mod plan;

pub use plan::{render_plan, BuildPlan, BuildSpec};

use crate::cluster::{
    ArtifactDescriptor, Cluster, ContainerDescriptor, JobDescriptor, JobState, LabelSelector,
    MountDescriptor, VolumeDescriptor, VolumeSource,
};
use crate::config::BuilderConfig;
use crate::constants::{
    BUILD_CONTAINER, BUILD_CONTEXT_PATH, BUILD_ID_LABEL, BUILD_INPUT_PATH, BUILD_SCRIPT_KEY,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, MATERIALIZE_CONTAINER, MAX_INJECTED_FILE_BYTES,
    WORKLOAD_NAME_PREFIX,
};
use crate::error::{Error, Result};
use crate::files::ArtifactData;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Volume holding the rendered plan.
const PLAN_VOLUME: &str = "plan";

/// Volume holding the materialized build context.
const CONTEXT_VOLUME: &str = "context";

/// Copies every plan entry (following the artifact's symlinks) into the context.
const MATERIALIZE_SCRIPT: &str = "set -e; for f in /plan/* /plan/.[!.]*; do \
     if [ -f \"$f\" ]; then cp -L \"$f\" /context/; fi; done";

/// A published image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// Full reference (`registry/tag:ttl`).
    pub reference: String,
    /// Content-addressed tag.
    pub tag: String,
}

/// Builds images in ephemeral cluster jobs.
pub struct ImageBuilder {
    cluster: Arc<dyn Cluster>,
    config: BuilderConfig,
}

impl ImageBuilder {
    /// Creates a builder.
    pub fn new(cluster: Arc<dyn Cluster>, config: BuilderConfig) -> Self {
        Self { cluster, config }
    }

    /// Builder configuration.
    #[must_use]
    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Renders the plan for `spec` without building.
    pub fn plan(&self, spec: &BuildSpec) -> Result<BuildPlan> {
        render_plan(spec, MAX_INJECTED_FILE_BYTES)
    }

    /// Full image reference for a tag.
    #[must_use]
    pub fn reference_for(&self, tag: &str) -> String {
        format!("{}/{tag}:{}", self.config.registry, self.config.ttl)
    }

    /// Builds and publishes the image for `spec`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] / [`Error::PayloadTooLarge`] before anything is created
    /// - [`Error::BuildFailed`] with the build step's recent log output
    /// - [`Error::Timeout`] after `build_timeout`
    pub async fn build(&self, spec: &BuildSpec) -> Result<BuiltImage> {
        let plan = self.plan(spec)?;
        let reference = self.reference_for(&plan.tag);
        let build_id = uuid::Uuid::new_v4().simple().to_string();
        let job_name = format!("{WORKLOAD_NAME_PREFIX}-build-{build_id}");
        let labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (BUILD_ID_LABEL.to_string(), build_id.clone()),
        ]);

        tracing::info!(
            reference = %reference,
            job = %job_name,
            files = plan.files.len(),
            steps = spec.setup.len(),
            "Starting image build"
        );

        let result = self.run_job(&plan, &reference, &job_name, &labels).await;
        self.cleanup(&job_name, &build_id).await;

        match result {
            Ok(()) => {
                tracing::info!(reference = %reference, "Image build complete");
                Ok(BuiltImage {
                    reference,
                    tag: plan.tag,
                })
            }
            Err(e) => {
                tracing::warn!(reference = %reference, error = %e, "Image build failed");
                Err(e)
            }
        }
    }

    async fn run_job(
        &self,
        plan: &BuildPlan,
        reference: &str,
        job_name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut data = ArtifactData::from_files(&plan.files);
        data.text
            .insert(BUILD_SCRIPT_KEY.to_string(), plan.script.clone());
        let artifact = ArtifactDescriptor {
            name: format!("{job_name}-plan"),
            labels: labels.clone(),
            data,
        };
        self.cluster
            .create_artifact(&self.config.namespace, &artifact)
            .await?;

        let job = self.job_descriptor(job_name, &artifact.name, reference, labels);
        self.cluster
            .create_job(&self.config.namespace, &job)
            .await?;

        self.await_job(job_name, reference).await
    }

    fn job_descriptor(
        &self,
        job_name: &str,
        artifact_name: &str,
        reference: &str,
        labels: &BTreeMap<String, String>,
    ) -> JobDescriptor {
        let context_mount = MountDescriptor {
            volume: CONTEXT_VOLUME.to_string(),
            mount_path: BUILD_CONTEXT_PATH.to_string(),
            sub_path: None,
            read_only: false,
        };
        JobDescriptor {
            name: job_name.to_string(),
            labels: labels.clone(),
            init_steps: vec![ContainerDescriptor {
                name: MATERIALIZE_CONTAINER.to_string(),
                image: self.config.materialize_image.clone(),
                command: vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    MATERIALIZE_SCRIPT.to_string(),
                ],
                mounts: vec![
                    MountDescriptor {
                        volume: PLAN_VOLUME.to_string(),
                        mount_path: BUILD_INPUT_PATH.to_string(),
                        sub_path: None,
                        read_only: true,
                    },
                    context_mount.clone(),
                ],
                ..Default::default()
            }],
            step: ContainerDescriptor {
                name: BUILD_CONTAINER.to_string(),
                image: self.config.builder_image.clone(),
                args: vec![
                    format!("--context=dir://{BUILD_CONTEXT_PATH}"),
                    format!("--dockerfile={BUILD_CONTEXT_PATH}/{BUILD_SCRIPT_KEY}"),
                    format!("--destination={reference}"),
                ],
                mounts: vec![context_mount],
                ..Default::default()
            },
            volumes: vec![
                VolumeDescriptor {
                    name: PLAN_VOLUME.to_string(),
                    source: VolumeSource::Artifact {
                        name: artifact_name.to_string(),
                    },
                },
                VolumeDescriptor {
                    name: CONTEXT_VOLUME.to_string(),
                    source: VolumeSource::Scratch,
                },
            ],
        }
    }

    async fn await_job(&self, job_name: &str, reference: &str) -> Result<()> {
        let namespace = &self.config.namespace;
        let deadline = Instant::now() + self.config.build_timeout;
        loop {
            match self.cluster.job_state(namespace, job_name).await? {
                JobState::Succeeded => return Ok(()),
                JobState::Failed { message } => {
                    let logs = match self
                        .cluster
                        .job_logs(
                            namespace,
                            job_name,
                            BUILD_CONTAINER,
                            self.config.log_tail_lines,
                        )
                        .await
                    {
                        Ok(logs) => Some(logs),
                        Err(e) => {
                            tracing::warn!(job = %job_name, error = %e, "Could not fetch build logs");
                            None
                        }
                    };
                    return Err(Error::BuildFailed {
                        reference: reference.to_string(),
                        reason: message,
                        logs,
                    });
                }
                JobState::Active => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    operation: format!("build of {reference}"),
                    duration: self.config.build_timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn cleanup(&self, job_name: &str, build_id: &str) {
        let namespace = &self.config.namespace;
        match self.cluster.delete_job(namespace, job_name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(job = %job_name, error = %e, "Failed to delete build job"),
        }
        let selector = LabelSelector::new()
            .with(MANAGED_BY_LABEL, MANAGED_BY_VALUE)
            .with(BUILD_ID_LABEL, build_id);
        if let Err(e) = self.cluster.delete_artifacts(namespace, &selector).await {
            tracing::warn!(job = %job_name, error = %e, "Failed to delete build artifact");
        }
    }
}
