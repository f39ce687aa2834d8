//! Session spec → cluster descriptors.
//!
//! Stateless mapping. Every resource carries the managed-by marker, the
//! session id label and the user's labels, so destruction can always target
//! the full tagged set.
//!
//! | Resource | Name |
//! |----------|------|
//! | workload | `mk-<id>` |
//! | file artifact | `mk-<id>-files` |
//! | volume claim | `mk-<id>-<volume>` |

use super::handle::workload_name;
use super::spec::{is_reserved_label, SessionSpec};
use super::state::SessionId;
use crate::cluster::{
    ArtifactDescriptor, ContainerDescriptor, LabelSelector, MountDescriptor,
    VolumeClaimDescriptor, VolumeDescriptor, VolumeSource, WorkloadDescriptor,
};
use crate::constants::{
    FILES_ARTIFACT_SUFFIX, FILES_VOLUME, MANAGED_BY_LABEL, MANAGED_BY_VALUE, PRIMARY_CONTAINER,
    SCRATCH_MOUNT_PATH, SCRATCH_VOLUME, SESSION_ID_LABEL, SPEC_ANNOTATION,
};
use crate::error::Result;
use crate::files::ArtifactData;
use std::collections::BTreeMap;

/// Everything created on the cluster for one session.
#[derive(Debug, Clone)]
pub(crate) struct SessionResources {
    pub workload: WorkloadDescriptor,
    pub artifact: Option<ArtifactDescriptor>,
    pub claims: Vec<VolumeClaimDescriptor>,
}

/// Selector for every resource managed by this system.
pub(crate) fn managed_selector() -> LabelSelector {
    LabelSelector::new().with(MANAGED_BY_LABEL, MANAGED_BY_VALUE)
}

/// Selector for every resource of one session.
pub(crate) fn session_selector(id: &SessionId) -> LabelSelector {
    managed_selector().with(SESSION_ID_LABEL, id.as_str())
}

/// Labels applied to every resource of a session.
fn session_labels(id: &SessionId, user: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut labels = user.clone();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(SESSION_ID_LABEL.to_string(), id.to_string());
    labels
}

/// Strips system labels, leaving the user's.
pub(crate) fn user_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| !is_reserved_label(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Builds the descriptors for a validated spec.
pub(crate) fn build(id: &SessionId, spec: &SessionSpec) -> Result<SessionResources> {
    let name = workload_name(id);
    let labels = session_labels(id, &spec.labels);

    let mut volumes = vec![VolumeDescriptor {
        name: SCRATCH_VOLUME.to_string(),
        source: VolumeSource::Scratch,
    }];
    let mut mounts = vec![MountDescriptor {
        volume: SCRATCH_VOLUME.to_string(),
        mount_path: SCRATCH_MOUNT_PATH.to_string(),
        sub_path: None,
        read_only: false,
    }];

    let artifact = if spec.files.is_empty() {
        None
    } else {
        let artifact_name = format!("{name}-{FILES_ARTIFACT_SUFFIX}");
        volumes.push(VolumeDescriptor {
            name: FILES_VOLUME.to_string(),
            source: VolumeSource::Artifact {
                name: artifact_name.clone(),
            },
        });
        mounts.extend(spec.files.iter().map(|file| MountDescriptor {
            volume: FILES_VOLUME.to_string(),
            mount_path: file.path.clone(),
            sub_path: Some(file.key()),
            read_only: true,
        }));
        Some(ArtifactDescriptor {
            name: artifact_name,
            labels: labels.clone(),
            data: ArtifactData::from_files(&spec.files),
        })
    };

    let claims: Vec<VolumeClaimDescriptor> = spec
        .volumes
        .iter()
        .map(|volume| VolumeClaimDescriptor {
            name: format!("{name}-{}", volume.name),
            labels: labels.clone(),
            size: volume.size.clone(),
            storage_class: volume.storage_class.clone(),
        })
        .collect();
    for (volume, claim) in spec.volumes.iter().zip(&claims) {
        volumes.push(VolumeDescriptor {
            name: volume.name.clone(),
            source: VolumeSource::Claim {
                claim_name: claim.name.clone(),
            },
        });
        mounts.push(MountDescriptor {
            volume: volume.name.clone(),
            mount_path: volume.mount_path.clone(),
            sub_path: None,
            read_only: false,
        });
    }

    let init_steps = spec
        .setup
        .iter()
        .enumerate()
        .map(|(index, command)| ContainerDescriptor {
            name: format!("setup-{index}"),
            image: spec.image.clone(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), command.clone()],
            working_dir: Some(SCRATCH_MOUNT_PATH.to_string()),
            env: spec.env.clone(),
            mounts: mounts.clone(),
            ..Default::default()
        })
        .collect();

    let primary = ContainerDescriptor {
        name: PRIMARY_CONTAINER.to_string(),
        image: spec.image.clone(),
        command: spec.command.clone(),
        args: Vec::new(),
        working_dir: spec.working_dir.clone(),
        env: spec.env.clone(),
        tty: spec.tty,
        stdin: spec.stdin,
        cpu: spec.resources.cpu.clone(),
        memory: spec.resources.memory.clone(),
        ports: spec.ports.clone(),
        mounts,
    };

    let annotations = BTreeMap::from([(SPEC_ANNOTATION.to_string(), spec.to_annotation()?)]);

    Ok(SessionResources {
        workload: WorkloadDescriptor {
            name,
            labels,
            annotations,
            init_steps,
            primary,
            volumes,
        },
        artifact,
        claims,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::spec::VolumeSpec;

    #[test]
    fn test_minimal_spec_has_scratch_only() {
        let id = SessionId::from("abc");
        let resources = build(&id, &SessionSpec::new("alpine")).unwrap();
        assert_eq!(resources.workload.name, "mk-abc");
        assert!(resources.artifact.is_none());
        assert!(resources.claims.is_empty());
        assert_eq!(resources.workload.volumes.len(), 1);
        assert_eq!(
            resources.workload.labels.get(SESSION_ID_LABEL).map(String::as_str),
            Some("abc")
        );
        assert!(resources.workload.annotations.contains_key(SPEC_ANNOTATION));
    }

    #[test]
    fn test_setup_steps_are_ordered_and_share_scratch() {
        let spec = SessionSpec::new("alpine")
            .with_setup("echo one >> log")
            .with_setup("echo two >> log");
        let resources = build(&SessionId::from("abc"), &spec).unwrap();
        let steps = &resources.workload.init_steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name, "setup-0");
        assert_eq!(steps[1].command[2], "echo two >> log");
        for step in steps {
            assert!(step
                .mounts
                .iter()
                .any(|m| m.volume == SCRATCH_VOLUME && m.mount_path == SCRATCH_MOUNT_PATH));
        }
    }

    #[test]
    fn test_files_mount_by_key() {
        let spec = SessionSpec::new("alpine").with_file("/etc/app/config.toml", "x");
        let resources = build(&SessionId::from("abc"), &spec).unwrap();
        let artifact = resources.artifact.unwrap();
        assert_eq!(artifact.name, "mk-abc-files");
        assert!(artifact.data.text.contains_key("-etc-app-config.toml"));
        let mount = resources
            .workload
            .primary
            .mounts
            .iter()
            .find(|m| m.volume == FILES_VOLUME)
            .unwrap();
        assert_eq!(mount.mount_path, "/etc/app/config.toml");
        assert_eq!(mount.sub_path.as_deref(), Some("-etc-app-config.toml"));
    }

    #[test]
    fn test_volumes_become_labelled_claims() {
        let mut spec = SessionSpec::new("alpine").with_label("team", "infra");
        spec.volumes.push(VolumeSpec {
            name: "data".into(),
            mount_path: "/data".into(),
            size: "5Gi".into(),
            storage_class: Some("fast".into()),
        });
        let resources = build(&SessionId::from("abc"), &spec).unwrap();
        let claim = &resources.claims[0];
        assert_eq!(claim.name, "mk-abc-data");
        assert!(session_selector(&SessionId::from("abc")).matches(&claim.labels));
        assert_eq!(claim.labels.get("team").map(String::as_str), Some("infra"));
    }

    #[test]
    fn test_user_labels_strip_system_keys() {
        let spec = SessionSpec::new("alpine").with_label("team", "infra");
        let resources = build(&SessionId::from("abc"), &spec).unwrap();
        let user = user_labels(&resources.workload.labels);
        assert_eq!(user, spec.labels);
    }
}
