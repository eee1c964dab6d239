//! Pod volume builders and orphan cleanup. Host directories are used in
//! place; empty directories live under `<root>/<podName>/volumes/<name>`
//! and are torn down when no desired pod references them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use common::{BoundPod, Volume};
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeKind {
    HostDir,
    EmptyDir,
}

#[derive(Debug, Clone)]
pub struct PodVolume {
    pub kind: VolumeKind,
    path: PathBuf,
}

impl PodVolume {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn set_up(&self) -> anyhow::Result<()> {
        if self.kind == VolumeKind::EmptyDir {
            tokio::fs::create_dir_all(&self.path)
                .await
                .with_context(|| format!("creating {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Removes agent-owned backing storage. Host directories are left
    /// alone.
    pub async fn tear_down(&self) -> anyhow::Result<()> {
        if self.kind == VolumeKind::EmptyDir {
            tokio::fs::remove_dir_all(&self.path)
                .await
                .with_context(|| format!("removing {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// Volume name → built volume, for one pod.
pub type VolumeMap = HashMap<String, PodVolume>;

fn build_volume(volume: &Volume, pod_name: &str, root: &Path) -> Option<PodVolume> {
    let source = volume.source.as_ref()?;
    if let Some(host_dir) = &source.host_dir {
        return Some(PodVolume {
            kind: VolumeKind::HostDir,
            path: PathBuf::from(&host_dir.path),
        });
    }
    if source.empty_dir.is_some() {
        return Some(PodVolume {
            kind: VolumeKind::EmptyDir,
            path: root.join(pod_name).join("volumes").join(&volume.name),
        });
    }
    // Network-attached sources are mounted by machinery outside the agent.
    None
}

/// Builds and sets up every volume a pod declares. Unknown source kinds
/// are skipped.
pub async fn mount_external_volumes(pod: &BoundPod, root: &Path) -> anyhow::Result<VolumeMap> {
    let mut volumes = VolumeMap::new();
    for volume in &pod.spec.volumes {
        let Some(built) = build_volume(volume, &pod.metadata.name, root) else {
            continue;
        };
        built.set_up().await?;
        volumes.insert(volume.name.clone(), built);
    }
    Ok(volumes)
}

/// Identifiers (`podName/volumeName`) of every volume the desired set
/// references.
fn desired_volume_ids(pods: &[BoundPod]) -> HashMap<String, ()> {
    let mut desired = HashMap::new();
    for pod in pods {
        for volume in &pod.spec.volumes {
            desired.insert(format!("{}/{}", pod.metadata.name, volume.name), ());
        }
    }
    desired
}

/// Scans the agent root for empty-dir volumes currently on disk, keyed
/// `podName/volumeName`.
pub fn get_current_volumes(root: &Path) -> HashMap<String, PodVolume> {
    let mut current = HashMap::new();
    let Ok(pods) = std::fs::read_dir(root) else {
        return current;
    };
    for pod_entry in pods.flatten() {
        let volumes_dir = pod_entry.path().join("volumes");
        let Ok(volumes) = std::fs::read_dir(&volumes_dir) else {
            continue;
        };
        let pod_name = pod_entry.file_name().to_string_lossy().into_owned();
        for vol_entry in volumes.flatten() {
            let vol_name = vol_entry.file_name().to_string_lossy().into_owned();
            current.insert(
                format!("{pod_name}/{vol_name}"),
                PodVolume {
                    kind: VolumeKind::EmptyDir,
                    path: vol_entry.path(),
                },
            );
        }
    }
    current
}

/// Tears down any on-disk volume not referenced by a desired pod.
pub async fn reconcile_volumes(pods: &[BoundPod], root: &Path) {
    let desired = desired_volume_ids(pods);
    for (id, volume) in get_current_volumes(root) {
        if desired.contains_key(&id) {
            continue;
        }
        warn!(volume = %id, "orphaned volume found, tearing down");
        if let Err(err) = volume.tear_down().await {
            error!(volume = %id, "could not tear down volume: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{HostDir, ObjectMeta, PodSpec, VolumeSource};

    fn pod_with_volumes(name: &str, volumes: Vec<Volume>) -> BoundPod {
        BoundPod {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                volumes,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn empty_dir(name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            source: Some(VolumeSource {
                empty_dir: Some(common::EmptyDir {}),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn empty_dir_volumes_are_created_under_root() {
        let root = tempfile::tempdir().unwrap();
        let pod = pod_with_volumes("web", vec![empty_dir("scratch")]);

        let volumes = mount_external_volumes(&pod, root.path()).await.unwrap();
        let path = volumes["scratch"].path();
        assert!(path.ends_with("web/volumes/scratch"));
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn host_dir_volumes_use_the_host_path() {
        let root = tempfile::tempdir().unwrap();
        let pod = pod_with_volumes(
            "web",
            vec![Volume {
                name: "logs".to_string(),
                source: Some(VolumeSource {
                    host_dir: Some(HostDir {
                        path: "/var/log/web".to_string(),
                    }),
                    ..Default::default()
                }),
            }],
        );
        let volumes = mount_external_volumes(&pod, root.path()).await.unwrap();
        assert_eq!(volumes["logs"].path(), Path::new("/var/log/web"));
    }

    #[tokio::test]
    async fn reconcile_tears_down_only_orphans() {
        let root = tempfile::tempdir().unwrap();
        let keep = pod_with_volumes("keep", vec![empty_dir("data")]);
        let gone = pod_with_volumes("gone", vec![empty_dir("data")]);
        mount_external_volumes(&keep, root.path()).await.unwrap();
        mount_external_volumes(&gone, root.path()).await.unwrap();

        reconcile_volumes(std::slice::from_ref(&keep), root.path()).await;

        assert!(root.path().join("keep/volumes/data").is_dir());
        assert!(!root.path().join("gone/volumes/data").exists());
    }
}
