//! Names, ids and label bookkeeping.
//!
//! Containers and sandboxes are identified three ways:
//! - An opaque random *id* handed back to the kubelet.
//! - The KV key, which is the id behind a `sandbox_` / `container_` prefix.
//! - A composite *container name* that encodes the kubelet metadata
//!   (`k8s_<container>_<pod>_<namespace>_<uid>_<attempt>`), so the metadata
//!   can be recovered from the persisted record without extra lookups.
//!
//! Labels and annotations are persisted as one merged map: annotations are
//! stored behind an `annotation.` key prefix, and the shim reserves three
//! internal keys that must never leak back out over the CRI.

use std::collections::HashMap;

use tonic::Status;
use uuid::Uuid;

use crate::api::{ContainerMetadata, PodSandboxMetadata};
use crate::error::Result;

/// Identifies containers and sandboxes managed by a kubelet.
const KUBE_PREFIX: &str = "k8s";
/// Delimiter used to construct composite container names.
const NAME_DELIMITER: char = '_';

pub const SANDBOX_ID_PREFIX: &str = "sandbox";
pub const CONTAINER_ID_PREFIX: &str = "container";

const ANNOTATION_PREFIX: &str = "annotation.";

pub const CONTAINER_TYPE_LABEL_KEY: &str = "io.kubernetes.sobey.type";
pub const CONTAINER_TYPE_LABEL_SANDBOX: &str = "podsandbox";
pub const CONTAINER_TYPE_LABEL_CONTAINER: &str = "container";
pub const CONTAINER_LOG_PATH_LABEL_KEY: &str = "io.kubernetes.container.logpath";
pub const SANDBOX_ID_LABEL_KEY: &str = "io.kubernetes.sandbox.id";

pub const KUBERNETES_POD_UID_LABEL: &str = "io.kubernetes.pod.uid";
pub const KUBERNETES_CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";

/// Keys used internally by the shim, suppressed from CRI responses.
pub const INTERNAL_LABEL_KEYS: [&str; 3] = [
    CONTAINER_TYPE_LABEL_KEY,
    CONTAINER_LOG_PATH_LABEL_KEY,
    SANDBOX_ID_LABEL_KEY,
];

/// Prefix of an image id in container status.
const IMAGE_ID_PREFIX: &str = "sobey://";
/// Prefix of a pullable image id in container status.
const PULLABLE_IMAGE_ID_PREFIX: &str = "sobey-pullable://";

/// Length of the random part of sandbox and container ids.
const ID_LENGTH: usize = 12;

/// Return a fresh opaque id: 12 random lowercase hex characters.
pub fn random_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..ID_LENGTH].to_string()
}

/// Prefix an id with `sandbox_`, exactly once.
pub fn build_sandbox_id(id: &str) -> String {
    build_prefixed_id(SANDBOX_ID_PREFIX, id)
}

/// Prefix an id with `container_`, exactly once.
pub fn build_container_id(id: &str) -> String {
    build_prefixed_id(CONTAINER_ID_PREFIX, id)
}

fn build_prefixed_id(prefix: &str, id: &str) -> String {
    if id.starts_with(&format!("{prefix}{NAME_DELIMITER}")) {
        id.to_string()
    } else {
        format!("{prefix}{NAME_DELIMITER}{id}")
    }
}

/// Strip a `sandbox_` prefix, if present.
pub fn strip_sandbox_id(id: &str) -> &str {
    id.strip_prefix(&format!("{SANDBOX_ID_PREFIX}{NAME_DELIMITER}"))
        .unwrap_or(id)
}

/// Join the kubelet metadata into the composite container name.
pub fn make_container_name(
    sandbox: &PodSandboxMetadata,
    container: &ContainerMetadata,
) -> String {
    [
        KUBE_PREFIX,
        &container.name,
        &sandbox.name,
        &sandbox.namespace,
        &sandbox.uid,
        &container.attempt.to_string(),
    ]
    .join(&NAME_DELIMITER.to_string())
}

/// Recover the container metadata from a composite name.
///
/// Tolerates an optional trailing random suffix (6 or 7 parts).
pub fn parse_container_name(name: &str) -> Result<ContainerMetadata> {
    let parts = split_kube_name(name)?;
    Ok(ContainerMetadata {
        name: parts[1].to_string(),
        attempt: parse_attempt(name, parts[5])?,
    })
}

/// Recover the sandbox metadata from a composite name.
pub fn parse_sandbox_name(name: &str) -> Result<PodSandboxMetadata> {
    let parts = split_kube_name(name)?;
    Ok(PodSandboxMetadata {
        name: parts[2].to_string(),
        namespace: parts[3].to_string(),
        uid: parts[4].to_string(),
        attempt: parse_attempt(name, parts[5])?,
    })
}

fn split_kube_name(name: &str) -> Result<Vec<&str>> {
    let name = name.strip_prefix('/').unwrap_or(name);
    let parts: Vec<&str> = name.split(NAME_DELIMITER).collect();
    if parts.len() != 6 && parts.len() != 7 {
        return Err(Status::invalid_argument(format!(
            "failed to parse the container name: {name:?}"
        )));
    }
    if parts[0] != KUBE_PREFIX {
        return Err(Status::invalid_argument(format!(
            "container is not managed by kubernetes: {name:?}"
        )));
    }
    Ok(parts)
}

fn parse_attempt(name: &str, part: &str) -> Result<u32> {
    part.parse::<u32>().map_err(|err| {
        Status::invalid_argument(format!(
            "failed to parse the container name {name:?}: {err}"
        ))
    })
}

/// Merge annotations into labels under the `annotation.` prefix.
///
/// Collisions are not detected; callers are expected to keep label and
/// annotation keyspaces disjoint.
pub fn make_labels(
    labels: &HashMap<String, String>,
    annotations: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = labels.clone();
    for (key, value) in annotations {
        merged.insert(format!("{ANNOTATION_PREFIX}{key}"), value.clone());
    }
    merged
}

/// Split a merged map back into labels and annotations.
///
/// Internal keys are suppressed, and the container-name label is dropped for
/// sandbox records (it is added by the shim and must not surface over CRI).
pub fn extract_labels(
    merged: &HashMap<String, String>,
) -> (HashMap<String, String>, HashMap<String, String>) {
    let is_sandbox = merged
        .get(CONTAINER_TYPE_LABEL_KEY)
        .is_some_and(|t| t == CONTAINER_TYPE_LABEL_SANDBOX);

    let mut labels = HashMap::new();
    let mut annotations = HashMap::new();
    for (key, value) in merged {
        if INTERNAL_LABEL_KEYS.contains(&key.as_str()) {
            continue;
        }
        if is_sandbox && key == KUBERNETES_CONTAINER_NAME_LABEL {
            continue;
        }
        match key.strip_prefix(ANNOTATION_PREFIX) {
            Some(stripped) => {
                annotations.insert(stripped.to_string(), value.clone());
            }
            None => {
                labels.insert(key.clone(), value.clone());
            }
        }
    }
    (labels, annotations)
}

/// Image id as reported in container status.
pub fn to_pullable_image_id(id: &str, pullable: bool) -> String {
    if pullable {
        format!("{PULLABLE_IMAGE_ID_PREFIX}{id}")
    } else {
        format!("{IMAGE_ID_PREFIX}{id}")
    }
}

/// Normalise an image reference by stripping a trailing `:latest`.
pub fn normalize_image(image: &str) -> &str {
    image.strip_suffix(":latest").unwrap_or(image)
}
