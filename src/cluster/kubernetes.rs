//! Kubernetes implementation of [`Cluster`] on `kube` + `k8s-openapi`.
//!
//! # Object Mapping
//!
//! | Descriptor | Kubernetes object |
//! |------------|-------------------|
//! | [`WorkloadDescriptor`] | `Pod` with `restartPolicy: Never` |
//! | [`ArtifactDescriptor`] | `ConfigMap` (`data` + `binaryData`) |
//! | [`VolumeClaimDescriptor`] | `PersistentVolumeClaim` (`ReadWriteOnce`) |
//! | [`JobDescriptor`] | `batch/v1 Job` with `backoffLimit: 0` |
//!
//! # Output
//!
//! The log API is the only way to read a container's output from process
//! start, so [`KubeCluster::attach_output`] follows the container log. The
//! log merges stdout and stderr; the stderr source is therefore empty.
//!
//! # Watches
//!
//! The API server closes every watch after its timeout window.
//! [`KubeCluster::watch_workload`] resumes from the last seen resource version
//! and re-lists on `410 Gone`, so callers see one unbroken stream that ends
//! only after the workload is deleted.

use super::types::{
    ArtifactDescriptor, AttachedOutput, BoxedDuplex, BoxedWriter, ContainerDescriptor,
    ContainerState, ExecOutput, JobDescriptor, JobState, LabelSelector, VolumeClaimDescriptor,
    VolumeDescriptor, VolumeSource, Workload, WorkloadDescriptor, WorkloadEvent,
    WorkloadEventStream, WorkloadPhase,
};
use super::Cluster;
use crate::constants::{MAX_CONFIG_MAP_BYTES, PRIMARY_CONTAINER, UNKNOWN_EXIT_CODE};
use crate::files::ArtifactData;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{
    Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams, WatchEvent, WatchParams,
};
use kube::Client;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info};

/// Buffer between the log follower task and the attached reader.
const LOG_PIPE_CAPACITY: usize = 64 * 1024;

/// Kubernetes-backed cluster.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wraps an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects using the ambient kubeconfig or in-cluster service account.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] if no configuration can be inferred.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::api("connect", "cluster", e))?;
        info!("Connected to Kubernetes cluster");
        Ok(Self { client })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Finds the pod created for a job.
    async fn job_pod(&self, namespace: &str, job: &str) -> Result<String> {
        let params = ListParams::default().labels(&format!("job-name={job}"));
        let pods = self
            .pods(namespace)
            .list(&params)
            .await
            .map_err(|e| kube_error("list", "job pod", job, e))?;
        pods.items
            .into_iter()
            .find_map(|pod| pod.metadata.name)
            .ok_or_else(|| Error::not_found("job pod", job))
    }
}

/// Rejects data the API server would refuse, before any request is made.
fn check_config_map_size(data: &ArtifactData) -> Result<()> {
    let size = data.stored_size();
    if size > MAX_CONFIG_MAP_BYTES {
        return Err(Error::PayloadTooLarge {
            size,
            limit: MAX_CONFIG_MAP_BYTES,
        });
    }
    Ok(())
}

#[async_trait]
impl Cluster for KubeCluster {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn create_artifact(&self, namespace: &str, artifact: &ArtifactDescriptor) -> Result<()> {
        check_config_map_size(&artifact.data)?;
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(artifact.name.clone()),
                labels: Some(artifact.labels.clone()),
                ..Default::default()
            },
            data: Some(artifact.data.text.clone()),
            binary_data: Some(
                artifact
                    .data
                    .binary
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.config_maps(namespace)
            .create(&PostParams::default(), &config_map)
            .await
            .map_err(|e| kube_error("create", "artifact", &artifact.name, e))?;
        debug!(artifact = %artifact.name, namespace, "Created artifact");
        Ok(())
    }

    async fn delete_artifacts(&self, namespace: &str, selector: &LabelSelector) -> Result<()> {
        self.config_maps(namespace)
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(&selector.to_query()),
            )
            .await
            .map_err(|e| Error::api("delete", format!("artifacts {selector}"), e))?;
        Ok(())
    }

    async fn create_volume_claim(
        &self,
        namespace: &str,
        claim: &VolumeClaimDescriptor,
    ) -> Result<()> {
        let pvc: PersistentVolumeClaim = serde_json::from_value(claim_json(claim))?;
        self.claims(namespace)
            .create(&PostParams::default(), &pvc)
            .await
            .map_err(|e| kube_error("create", "volume claim", &claim.name, e))?;
        Ok(())
    }

    async fn delete_volume_claims(&self, namespace: &str, selector: &LabelSelector) -> Result<()> {
        self.claims(namespace)
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(&selector.to_query()),
            )
            .await
            .map_err(|e| Error::api("delete", format!("volume claims {selector}"), e))?;
        Ok(())
    }

    async fn create_workload(
        &self,
        namespace: &str,
        workload: &WorkloadDescriptor,
    ) -> Result<Workload> {
        let pod: Pod = serde_json::from_value(pod_json(workload))?;
        let created = self
            .pods(namespace)
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| kube_error("create", "workload", &workload.name, e))?;
        Ok(workload_from_pod(&created))
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>> {
        let pod = self
            .pods(namespace)
            .get_opt(name)
            .await
            .map_err(|e| kube_error("get", "workload", name, e))?;
        Ok(pod.as_ref().map(workload_from_pod))
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Workload>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(&selector.to_query()))
            .await
            .map_err(|e| Error::api("list", format!("workloads {selector}"), e))?;
        Ok(pods.items.iter().map(workload_from_pod).collect())
    }

    async fn delete_workload(
        &self,
        namespace: &str,
        name: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: grace_period_secs,
            ..Default::default()
        };
        self.pods(namespace)
            .delete(name, &params)
            .await
            .map_err(|e| kube_error("delete", "workload", name, e))?;
        Ok(())
    }

    async fn delete_workloads(&self, namespace: &str, selector: &LabelSelector) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        self.pods(namespace)
            .delete_collection(&params, &ListParams::default().labels(&selector.to_query()))
            .await
            .map_err(|e| Error::api("delete", format!("workloads {selector}"), e))?;
        Ok(())
    }

    async fn watch_workload(&self, namespace: &str, name: &str) -> Result<WorkloadEventStream> {
        let api = self.pods(namespace);
        let name = name.to_string();
        let params = WatchParams::default().fields(&format!("metadata.name={name}"));
        if api
            .get_opt(&name)
            .await
            .map_err(|e| kube_error("get", "workload", &name, e))?
            .is_none()
        {
            return Err(Error::not_found("workload", &name));
        }

        let stream = async_stream::stream! {
            let mut version = String::from("0");
            let mut last: Option<Workload> = None;
            loop {
                let events = match api.watch(&params, &version).await {
                    Ok(events) => events,
                    Err(err) => {
                        yield Err(kube_error("watch", "workload", &name, err));
                        return;
                    }
                };
                futures::pin_mut!(events);

                while let Some(item) = events.next().await {
                    let event = match item {
                        Ok(event) => event,
                        Err(err) => {
                            yield Err(kube_error("watch", "workload", &name, err));
                            return;
                        }
                    };
                    match event {
                        WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                            if let Some(rv) = pod.metadata.resource_version.clone() {
                                version = rv;
                            }
                            let workload = workload_from_pod(&pod);
                            last = Some(workload.clone());
                            yield Ok(WorkloadEvent::Applied(workload));
                        }
                        WatchEvent::Deleted(pod) => {
                            yield Ok(WorkloadEvent::Deleted(workload_from_pod(&pod)));
                            return;
                        }
                        WatchEvent::Bookmark(bookmark) => {
                            version = bookmark.metadata.resource_version;
                        }
                        WatchEvent::Error(err) if err.code == 410 => {
                            debug!(workload = %name, "Watch version expired, re-listing");
                            version = String::from("0");
                            break;
                        }
                        WatchEvent::Error(err) => {
                            yield Err(Error::api("watch", format!("workload {name}"), err.message));
                            return;
                        }
                    }
                }

                // Window closed: re-subscribe only while the workload exists.
                match api.get_opt(&name).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {
                        match last.take() {
                            Some(workload) => yield Ok(WorkloadEvent::Deleted(workload)),
                            None => yield Err(Error::not_found("workload", &name)),
                        }
                        return;
                    }
                    Err(err) => {
                        yield Err(kube_error("get", "workload", &name, err));
                        return;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn exec(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut process = self
            .pods(namespace)
            .exec(name, command.to_vec(), &params)
            .await
            .map_err(|e| kube_error("exec", "workload", name, e))?;

        let status = process.take_status();
        let (stdout, stderr) = tokio::join!(read_all(process.stdout()), read_all(process.stderr()));

        let exit_code = match status {
            Some(status) => match status.await {
                Some(status) if status.status.as_deref() == Some("Success") => 0,
                Some(status) => status
                    .details
                    .and_then(|details| details.causes)
                    .and_then(|causes| {
                        causes
                            .into_iter()
                            .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
                    })
                    .and_then(|cause| cause.message)
                    .and_then(|code| code.parse().ok())
                    .unwrap_or(UNKNOWN_EXIT_CODE),
                None => UNKNOWN_EXIT_CODE,
            },
            None => UNKNOWN_EXIT_CODE,
        };

        if let Err(e) = process.join().await {
            debug!(workload = %name, error = %e, "Exec channel closed with error");
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn attach_output(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
    ) -> Result<AttachedOutput> {
        let api = self.pods(namespace);
        let pod = name.to_string();
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..Default::default()
        };
        let (mut writer, reader) = tokio::io::duplex(LOG_PIPE_CAPACITY);
        let (opened_tx, opened_rx) = oneshot::channel();

        tokio::spawn(async move {
            let logs = match api.log_stream(&pod, &params).await {
                Ok(logs) => {
                    let _ = opened_tx.send(Ok(()));
                    logs
                }
                Err(err) => {
                    let _ = opened_tx.send(Err(err));
                    return;
                }
            };
            let logs = logs.compat();
            tokio::pin!(logs);
            if let Err(e) = tokio::io::copy(&mut logs, &mut writer).await {
                debug!(workload = %pod, error = %e, "Log follow ended with error");
            }
        });

        opened_rx
            .await
            .map_err(|_| Error::Internal("log follower exited before opening".to_string()))?
            .map_err(|e| kube_error("attach", "workload", name, e))?;

        Ok(AttachedOutput {
            stdout: Some(Box::new(reader)),
            stderr: None,
        })
    }

    async fn attach_stdin(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
    ) -> Result<BoxedWriter> {
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(false)
            .stderr(false);
        let mut process = self
            .pods(namespace)
            .attach(name, &params)
            .await
            .map_err(|e| kube_error("attach", "workload", name, e))?;
        let stdin = process.stdin().ok_or_else(|| Error::Api {
            operation: "attach".to_string(),
            resource: format!("workload {name}"),
            reason: "stdin channel not available".to_string(),
        })?;
        let workload = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = process.join().await {
                debug!(workload = %workload, error = %e, "Stdin attach closed with error");
            }
        });
        Ok(Box::new(stdin))
    }

    async fn logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<String> {
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines,
            ..Default::default()
        };
        self.pods(namespace)
            .logs(name, &params)
            .await
            .map_err(|e| kube_error("logs", "workload", name, e))
    }

    async fn port_forward(&self, namespace: &str, name: &str, port: u16) -> Result<BoxedDuplex> {
        let mut forwarder = self
            .pods(namespace)
            .portforward(name, &[port])
            .await
            .map_err(|e| kube_error("port-forward", "workload", name, e))?;
        let stream = forwarder.take_stream(port).ok_or_else(|| Error::Tunnel {
            port,
            reason: "port-forward returned no stream".to_string(),
        })?;
        let workload = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!(workload = %workload, port, error = %e, "Port-forward closed with error");
            }
        });
        Ok(Box::new(stream))
    }

    async fn create_job(&self, namespace: &str, job: &JobDescriptor) -> Result<()> {
        let manifest: Job = serde_json::from_value(job_json(job))?;
        self.jobs(namespace)
            .create(&PostParams::default(), &manifest)
            .await
            .map_err(|e| kube_error("create", "job", &job.name, e))?;
        Ok(())
    }

    async fn job_state(&self, namespace: &str, name: &str) -> Result<JobState> {
        let job = self
            .jobs(namespace)
            .get(name)
            .await
            .map_err(|e| kube_error("get", "job", name, e))?;
        let status = job.status.unwrap_or_default();

        if status.succeeded.unwrap_or(0) > 0 {
            return Ok(JobState::Succeeded);
        }
        let failed_condition = status.conditions.as_ref().and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
        });
        if let Some(condition) = failed_condition {
            let message = condition
                .message
                .clone()
                .or_else(|| condition.reason.clone())
                .unwrap_or_else(|| "job failed".to_string());
            return Ok(JobState::Failed { message });
        }
        if status.failed.unwrap_or(0) > 0 {
            return Ok(JobState::Failed {
                message: "job pod failed".to_string(),
            });
        }
        Ok(JobState::Active)
    }

    async fn job_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        tail_lines: i64,
    ) -> Result<String> {
        let pod = self.job_pod(namespace, name).await?;
        self.logs(namespace, &pod, container, Some(tail_lines)).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.jobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| kube_error("delete", "job", name, e))?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        self.client
            .apiserver_version()
            .await
            .map(|_| ())
            .map_err(|e| Error::api("version", "cluster", e))
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn kube_error(operation: &str, resource: &str, name: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(response) if response.code == 404 => Error::not_found(resource, name),
        kube::Error::Api(response) if response.code == 409 => Error::AlreadyExists {
            resource: resource.to_string(),
            name: name.to_string(),
        },
        _ => Error::api(operation, format!("{resource} {name}"), err),
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut out).await {
            debug!(error = %e, "Exec output read ended with error");
        }
    }
    out
}

// =============================================================================
// Descriptor → Manifest
// =============================================================================

fn container_json(container: &ContainerDescriptor) -> Value {
    let mut spec = Map::new();
    spec.insert("name".into(), json!(container.name));
    spec.insert("image".into(), json!(container.image));
    if !container.command.is_empty() {
        spec.insert("command".into(), json!(container.command));
    }
    if !container.args.is_empty() {
        spec.insert("args".into(), json!(container.args));
    }
    if let Some(dir) = &container.working_dir {
        spec.insert("workingDir".into(), json!(dir));
    }
    if !container.env.is_empty() {
        let env: Vec<Value> = container
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        spec.insert("env".into(), Value::Array(env));
    }
    if container.tty {
        spec.insert("tty".into(), json!(true));
    }
    if container.stdin {
        spec.insert("stdin".into(), json!(true));
    }

    let mut quantities = Map::new();
    if let Some(cpu) = &container.cpu {
        quantities.insert("cpu".into(), json!(cpu));
    }
    if let Some(memory) = &container.memory {
        quantities.insert("memory".into(), json!(memory));
    }
    if !quantities.is_empty() {
        let quantities = Value::Object(quantities);
        spec.insert(
            "resources".into(),
            json!({ "requests": quantities.clone(), "limits": quantities }),
        );
    }

    if !container.ports.is_empty() {
        let ports: Vec<Value> = container
            .ports
            .iter()
            .map(|port| json!({ "containerPort": port, "protocol": "TCP" }))
            .collect();
        spec.insert("ports".into(), Value::Array(ports));
    }

    if !container.mounts.is_empty() {
        let mounts: Vec<Value> = container
            .mounts
            .iter()
            .map(|mount| {
                let mut m = Map::new();
                m.insert("name".into(), json!(mount.volume));
                m.insert("mountPath".into(), json!(mount.mount_path));
                if let Some(sub_path) = &mount.sub_path {
                    m.insert("subPath".into(), json!(sub_path));
                }
                if mount.read_only {
                    m.insert("readOnly".into(), json!(true));
                }
                Value::Object(m)
            })
            .collect();
        spec.insert("volumeMounts".into(), Value::Array(mounts));
    }

    Value::Object(spec)
}

fn volume_json(volume: &VolumeDescriptor) -> Value {
    match &volume.source {
        VolumeSource::Scratch => json!({ "name": volume.name, "emptyDir": {} }),
        VolumeSource::Artifact { name } => {
            json!({ "name": volume.name, "configMap": { "name": name } })
        }
        VolumeSource::Claim { claim_name } => json!({
            "name": volume.name,
            "persistentVolumeClaim": { "claimName": claim_name }
        }),
    }
}

fn pod_spec_json(
    init_steps: &[ContainerDescriptor],
    containers: &[&ContainerDescriptor],
    volumes: &[VolumeDescriptor],
) -> Value {
    json!({
        "restartPolicy": "Never",
        "initContainers": init_steps.iter().map(container_json).collect::<Vec<_>>(),
        "containers": containers.iter().map(|c| container_json(c)).collect::<Vec<_>>(),
        "volumes": volumes.iter().map(volume_json).collect::<Vec<_>>(),
    })
}

fn pod_json(workload: &WorkloadDescriptor) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": workload.name,
            "labels": workload.labels,
            "annotations": workload.annotations,
        },
        "spec": pod_spec_json(&workload.init_steps, &[&workload.primary], &workload.volumes),
    })
}

fn job_json(job: &JobDescriptor) -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": { "name": job.name, "labels": job.labels },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": { "labels": job.labels },
                "spec": pod_spec_json(&job.init_steps, &[&job.step], &job.volumes),
            }
        }
    })
}

fn claim_json(claim: &VolumeClaimDescriptor) -> Value {
    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": { "requests": { "storage": claim.size } },
    });
    if let (Some(class), Value::Object(map)) = (&claim.storage_class, &mut spec) {
        map.insert("storageClassName".into(), json!(class));
    }
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": { "name": claim.name, "labels": claim.labels },
        "spec": spec,
    })
}

// =============================================================================
// Pod → Workload
// =============================================================================

fn workload_from_pod(pod: &Pod) -> Workload {
    let meta = &pod.metadata;
    let status = pod.status.as_ref();
    let primary_spec = pod.spec.as_ref().and_then(|spec| {
        spec.containers
            .iter()
            .find(|c| c.name == PRIMARY_CONTAINER)
            .or_else(|| spec.containers.first())
    });
    let primary = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == PRIMARY_CONTAINER))
        .and_then(|c| c.state.as_ref())
        .map(container_state);
    let message = status.and_then(|s| {
        init_failure(s)
            .or_else(|| s.message.clone())
            .or_else(|| s.reason.clone())
    });

    Workload {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        phase: WorkloadPhase::parse(status.and_then(|s| s.phase.as_deref())),
        primary,
        image: primary_spec.and_then(|c| c.image.clone()).unwrap_or_default(),
        command: primary_spec
            .and_then(|c| c.command.clone())
            .unwrap_or_default(),
        created_at: meta.creation_timestamp.as_ref().map(|t| t.0),
        deleting: meta.deletion_timestamp.is_some(),
        message,
    }
}

fn container_state(state: &k8s_openapi::api::core::v1::ContainerState) -> ContainerState {
    if let Some(terminated) = &state.terminated {
        ContainerState::Terminated {
            exit_code: terminated.exit_code,
            reason: terminated.reason.clone().unwrap_or_default(),
        }
    } else if state.running.is_some() {
        ContainerState::Running
    } else {
        ContainerState::Waiting {
            reason: state
                .waiting
                .as_ref()
                .and_then(|w| w.reason.clone())
                .unwrap_or_default(),
        }
    }
}

/// Describes the first failed init step, if any.
fn init_failure(status: &k8s_openapi::api::core::v1::PodStatus) -> Option<String> {
    status
        .init_container_statuses
        .as_ref()?
        .iter()
        .find_map(|init| {
            let terminated = init.state.as_ref()?.terminated.as_ref()?;
            (terminated.exit_code != 0).then(|| {
                format!(
                    "setup step '{}' exited with code {}",
                    init.name, terminated.exit_code
                )
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MountDescriptor;
    use std::collections::BTreeMap;

    fn descriptor() -> WorkloadDescriptor {
        WorkloadDescriptor {
            name: "mk-abc".to_string(),
            labels: BTreeMap::from([("a".to_string(), "b".to_string())]),
            annotations: BTreeMap::new(),
            init_steps: vec![ContainerDescriptor {
                name: "setup-0".to_string(),
                image: "alpine".to_string(),
                command: vec!["/bin/sh".into(), "-c".into(), "echo 1".into()],
                ..Default::default()
            }],
            primary: ContainerDescriptor {
                name: PRIMARY_CONTAINER.to_string(),
                image: "alpine".to_string(),
                command: vec!["sleep".into(), "60".into()],
                cpu: Some("500m".into()),
                memory: Some("256Mi".into()),
                ports: vec![8080],
                mounts: vec![MountDescriptor {
                    volume: "files".into(),
                    mount_path: "/etc/app.conf".into(),
                    sub_path: Some("-etc-app.conf".into()),
                    read_only: true,
                }],
                ..Default::default()
            },
            volumes: vec![
                VolumeDescriptor {
                    name: "scratch".into(),
                    source: VolumeSource::Scratch,
                },
                VolumeDescriptor {
                    name: "files".into(),
                    source: VolumeSource::Artifact {
                        name: "mk-abc-files".into(),
                    },
                },
            ],
        }
    }

    #[test]
    fn test_pod_manifest_deserializes() {
        let pod: Pod = serde_json::from_value(pod_json(&descriptor())).unwrap();
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.init_containers.unwrap().len(), 1);
        let main = &spec.containers[0];
        let resources = main.resources.clone().unwrap();
        assert_eq!(resources.requests, resources.limits);
        assert_eq!(main.ports.as_ref().unwrap()[0].container_port, 8080);
        let mount = &main.volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.sub_path.as_deref(), Some("-etc-app.conf"));
        assert_eq!(spec.volumes.unwrap().len(), 2);
    }

    #[test]
    fn test_workload_from_pod_reads_primary_exit_code() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": { "name": "mk-abc", "namespace": "default" },
            "spec": { "containers": [{ "name": "main", "image": "alpine", "command": ["true"] }] },
            "status": {
                "phase": "Failed",
                "containerStatuses": [{
                    "name": "main", "image": "alpine", "imageID": "", "ready": false,
                    "restartCount": 0,
                    "state": { "terminated": { "exitCode": 42 } }
                }]
            }
        }))
        .unwrap();
        let workload = workload_from_pod(&pod);
        assert_eq!(workload.phase, WorkloadPhase::Failed);
        assert_eq!(workload.exit_code(), Some(42));
        assert_eq!(workload.image, "alpine");
        assert!(!workload.deleting);
    }

    #[test]
    fn test_init_failure_message() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": { "name": "mk-abc" },
            "status": {
                "phase": "Failed",
                "initContainerStatuses": [{
                    "name": "setup-0", "image": "alpine", "imageID": "", "ready": false,
                    "restartCount": 0,
                    "state": { "terminated": { "exitCode": 3 } }
                }]
            }
        }))
        .unwrap();
        let workload = workload_from_pod(&pod);
        assert_eq!(
            workload.message.as_deref(),
            Some("setup step 'setup-0' exited with code 3")
        );
    }

    #[test]
    fn test_job_manifest_never_retries() {
        let job = JobDescriptor {
            name: "mk-build".into(),
            labels: BTreeMap::new(),
            init_steps: vec![],
            step: ContainerDescriptor {
                name: "build".into(),
                image: "kaniko".into(),
                ..Default::default()
            },
            volumes: vec![],
        };
        let manifest: Job = serde_json::from_value(job_json(&job)).unwrap();
        let spec = manifest.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(
            spec.template.spec.unwrap().restart_policy.as_deref(),
            Some("Never")
        );
    }

    #[test]
    fn test_config_map_size_counts_keys() {
        use crate::constants::MAX_INJECTED_FILE_BYTES;
        use crate::files::FileEntry;

        // Content exactly at the injection limit still overflows once the key is counted.
        let at_limit = ArtifactData::from_files(&[FileEntry::new(
            "/data/blob.txt",
            vec![b'a'; MAX_INJECTED_FILE_BYTES],
        )]);
        assert!(matches!(
            check_config_map_size(&at_limit),
            Err(Error::PayloadTooLarge { .. })
        ));

        let small = ArtifactData::from_files(&[FileEntry::new("/etc/app.conf", "x=1")]);
        assert!(check_config_map_size(&small).is_ok());
    }
}
