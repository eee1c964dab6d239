//! Pod admission checks run by the registry before a pod is accepted.

use std::collections::{HashMap, HashSet};

use crate::{Container, Pod};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: String },
    #[error("{field} is invalid: {detail}")]
    Invalid { field: String, detail: String },
    #[error("{field} is duplicated: {value}")]
    Duplicate { field: String, value: String },
}

#[derive(Debug, Clone, Default, thiserror::Error)]
#[error("validation failed: {}", self.join())]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    fn join(&self) -> String {
        self.0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn is_dns_label(value: &str) -> bool {
    if value.is_empty() || value.len() > 253 {
        return false;
    }
    let ok_char =
        |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.';
    value.chars().all(ok_char)
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.ends_with(|c: char| c.is_ascii_alphanumeric())
}

/// Collects duplicate non-zero HostPort declarations across `containers`
/// into `errs`, remembering every port seen in `ports`. Shared between pod
/// validation and the agent's host-port conflict filter.
pub fn accumulate_unique_ports(
    containers: &[Container],
    ports: &mut HashMap<i32, bool>,
    errs: &mut Vec<ValidationError>,
) {
    for container in containers {
        for port in &container.ports {
            if port.host_port == 0 {
                continue;
            }
            if ports.contains_key(&port.host_port) {
                errs.push(ValidationError::Duplicate {
                    field: "hostPort".to_string(),
                    value: port.host_port.to_string(),
                });
            }
            ports.insert(port.host_port, true);
        }
    }
}

/// Validates and canonicalizes a pod: fills a blank name from the UID,
/// checks identity shape, container names/images, volume references and
/// host-port uniqueness. NetworkMode and RestartPolicy arrive already
/// canonical through their enum defaults.
pub fn validate_pod(pod: &mut Pod) -> Result<(), ValidationErrors> {
    let mut errs = Vec::new();

    if pod.metadata.name.is_empty() {
        pod.metadata.name = pod.metadata.uid.clone();
    }
    if pod.metadata.name.is_empty() {
        errs.push(ValidationError::Required {
            field: "metadata.name".to_string(),
        });
    } else if !is_dns_label(&pod.metadata.name) {
        errs.push(ValidationError::Invalid {
            field: "metadata.name".to_string(),
            detail: pod.metadata.name.clone(),
        });
    }
    if pod.metadata.namespace.is_empty() {
        errs.push(ValidationError::Required {
            field: "metadata.namespace".to_string(),
        });
    } else if !is_dns_label(&pod.metadata.namespace) {
        errs.push(ValidationError::Invalid {
            field: "metadata.namespace".to_string(),
            detail: pod.metadata.namespace.clone(),
        });
    }

    let mut volumes = HashSet::new();
    for volume in &pod.spec.volumes {
        if volume.name.is_empty() {
            errs.push(ValidationError::Required {
                field: "volume.name".to_string(),
            });
        } else if !volumes.insert(volume.name.clone()) {
            errs.push(ValidationError::Duplicate {
                field: "volume.name".to_string(),
                value: volume.name.clone(),
            });
        }
    }

    let mut names = HashSet::new();
    for container in &pod.spec.containers {
        if container.name.is_empty() {
            errs.push(ValidationError::Required {
                field: "container.name".to_string(),
            });
        } else if !is_dns_label(&container.name) {
            errs.push(ValidationError::Invalid {
                field: "container.name".to_string(),
                detail: container.name.clone(),
            });
        } else if !names.insert(container.name.clone()) {
            errs.push(ValidationError::Duplicate {
                field: "container.name".to_string(),
                value: container.name.clone(),
            });
        }
        if container.image.is_empty() {
            errs.push(ValidationError::Required {
                field: "container.image".to_string(),
            });
        }
        for mount in &container.volume_mounts {
            if !volumes.contains(&mount.name) {
                errs.push(ValidationError::Invalid {
                    field: "volumeMounts.name".to_string(),
                    detail: format!("no volume named {}", mount.name),
                });
            }
        }
    }

    let mut ports = HashMap::new();
    accumulate_unique_ports(&pod.spec.containers, &mut ports, &mut errs);

    if errs.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(errs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectMeta, PodSpec, Port, Volume, VolumeMount};

    fn valid_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "web".to_string(),
                namespace: "default".to_string(),
                uid: "1234".to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    image: "busybox".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn accepts_valid_pod() {
        let mut pod = valid_pod();
        validate_pod(&mut pod).unwrap();
    }

    #[test]
    fn fills_blank_name_from_uid() {
        let mut pod = valid_pod();
        pod.metadata.name = String::new();
        validate_pod(&mut pod).unwrap();
        assert_eq!(pod.metadata.name, "1234");
    }

    #[test]
    fn rejects_duplicate_host_ports() {
        let mut pod = valid_pod();
        pod.spec.containers[0].ports = vec![
            Port {
                container_port: 80,
                host_port: 8080,
                ..Default::default()
            },
            Port {
                container_port: 81,
                host_port: 8080,
                ..Default::default()
            },
        ];
        let errs = validate_pod(&mut pod).unwrap_err();
        assert!(errs.0.iter().any(|e| matches!(
            e,
            ValidationError::Duplicate { field, .. } if field == "hostPort"
        )));
    }

    #[test]
    fn host_port_zero_never_conflicts() {
        let mut pod = valid_pod();
        pod.spec.containers[0].ports = vec![
            Port {
                container_port: 80,
                ..Default::default()
            },
            Port {
                container_port: 81,
                ..Default::default()
            },
        ];
        validate_pod(&mut pod).unwrap();
    }

    #[test]
    fn rejects_unknown_volume_mount() {
        let mut pod = valid_pod();
        pod.spec.containers[0].volume_mounts = vec![VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            read_only: false,
        }];
        assert!(validate_pod(&mut pod).is_err());

        pod.spec.volumes = vec![Volume {
            name: "data".to_string(),
            source: None,
        }];
        validate_pod(&mut pod).unwrap();
    }

    #[test]
    fn rejects_bad_names() {
        let mut pod = valid_pod();
        pod.metadata.name = "Web_Frontend".to_string();
        assert!(validate_pod(&mut pod).is_err());
    }
}
