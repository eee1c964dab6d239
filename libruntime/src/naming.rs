//! The container naming scheme that marks a runtime container as managed:
//! `k8s_<containerName>_<podFullName>_<uid>_<hashhex>`. Runtime listings
//! carry a leading `/` which parsing strips.

use std::hash::{DefaultHasher, Hash, Hasher};

use common::Container;

pub const CONTAINER_NAME_PREFIX: &str = "k8s";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub container_name: String,
    pub pod_full_name: String,
    pub uid: String,
    pub hash: u64,
}

/// Stable-within-process fingerprint of a container spec, recorded in the
/// container name so spec drift is detectable.
pub fn hash_container(container: &Container) -> u64 {
    let encoded = serde_json::to_string(container).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    encoded.hash(&mut hasher);
    hasher.finish()
}

pub fn build_container_name(uid: &str, pod_full_name: &str, container: &Container) -> String {
    format!(
        "{}_{}_{}_{}_{:08x}",
        CONTAINER_NAME_PREFIX,
        container.name,
        pod_full_name,
        uid,
        hash_container(container)
    )
}

/// Parses a managed container name. Returns `None` for containers this
/// control plane does not own.
pub fn parse_container_name(name: &str) -> Option<ParsedName> {
    let name = name.trim_start_matches('/');
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() != 5 || parts[0] != CONTAINER_NAME_PREFIX {
        return None;
    }
    let hash = u64::from_str_radix(parts[4], 16).unwrap_or(0);
    Some(ParsedName {
        container_name: parts[1].to_string(),
        pod_full_name: parts[2].to_string(),
        uid: parts[3].to_string(),
        hash,
    })
}

/// Whether the image tag forces a registry re-check on every run.
pub fn require_latest_image(image: &str) -> bool {
    let (_, _, tag) = parse_image_name(image);
    tag.is_empty() || tag == "latest"
}

/// Splits `hub.oa.com/library/tlinux1.2:latest` into
/// `("hub.oa.com", "hub.oa.com/library/tlinux1.2", "latest")`. Images
/// without a registry host get an empty registry.
pub fn parse_image_name(image: &str) -> (String, String, String) {
    let (repo, tag) = match image.rsplit_once(':') {
        // A colon inside the last path component is a tag; one before a
        // slash belongs to a registry port.
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (image.to_string(), String::new()),
    };
    let registry = match repo.split_once('/') {
        Some((host, _)) if host.contains('.') || host.contains(':') => host.to_string(),
        _ => String::new(),
    };
    (registry, repo, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: "busybox".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn name_round_trips() {
        let c = container("app");
        let built = build_container_name("uid-1234", "web.prod.etcd", &c);
        let parsed = parse_container_name(&built).unwrap();
        assert_eq!(parsed.container_name, "app");
        assert_eq!(parsed.pod_full_name, "web.prod.etcd");
        assert_eq!(parsed.uid, "uid-1234");
        assert_eq!(parsed.hash, hash_container(&c));
    }

    #[test]
    fn parse_strips_leading_slash() {
        let built = format!("/{}", build_container_name("u", "a.b.c", &container("net")));
        let parsed = parse_container_name(&built).unwrap();
        assert_eq!(parsed.container_name, "net");
    }

    #[test]
    fn parse_rejects_foreign_containers() {
        assert!(parse_container_name("/nginx").is_none());
        assert!(parse_container_name("/docker_foo_bar").is_none());
        assert!(parse_container_name("k9s_a_b_c_00000000").is_none());
    }

    #[test]
    fn image_name_parsing() {
        assert_eq!(
            parse_image_name("hub.oa.com/library/tlinux1.2:latest"),
            (
                "hub.oa.com".to_string(),
                "hub.oa.com/library/tlinux1.2".to_string(),
                "latest".to_string()
            )
        );
        assert_eq!(
            parse_image_name("busybox"),
            (String::new(), "busybox".to_string(), String::new())
        );
        assert_eq!(
            parse_image_name("localhost:5000/app:v2"),
            (
                "localhost:5000".to_string(),
                "localhost:5000/app".to_string(),
                "v2".to_string()
            )
        );
    }

    #[test]
    fn latest_detection() {
        assert!(require_latest_image("busybox"));
        assert!(require_latest_image("busybox:latest"));
        assert!(!require_latest_image("busybox:1.36"));
    }
}
