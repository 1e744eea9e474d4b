//! Sandbox networking.
//!
//! The shim does not configure interfaces itself; it drives an external CNI
//! plugin and remembers, per sandbox, whether that wiring is in place. The
//! readiness map is process-local and deliberately not persisted: after a
//! restart every sandbox is not-ready until re-examined.
//!
//! The plugin leaves its result in an on-disk cache file; the coordinator
//! reads it back to learn the address the plugin actually assigned.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tonic::Status;

use crate::api::DnsConfig;
use crate::error::{internal, Result};

/// Runtime tag the plugin sees in `CNI_ARGS`.
const RUNTIME_NAME: &str = "sobey";
/// CNI spec version advertised in the network configuration.
const CNI_VERSION: &str = "0.4.0";
/// Name of the pod network; also the first component of cache file names.
pub const DEFAULT_NETWORK_NAME: &str = "cbr0";
/// Interface created inside each sandbox.
pub const DEFAULT_INTERFACE: &str = "eth0";
/// Where the plugin caches its results.
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/cni/cache/results";

/// Network namespace path of a sandbox process.
fn netns_path(pid: i32) -> String {
    if pid > 0 {
        format!("/proc/{pid}/ns/net")
    } else {
        // Plugins insist on a non-empty namespace path even for teardown.
        "/dev/null".to_string()
    }
}

/// Everything the plugin needs to know about one sandbox.
#[derive(Debug, Clone)]
pub struct PodNetwork {
    pub namespace: String,
    pub name: String,
    pub sandbox_id: String,
    pub sandbox_pid: i32,
    pub annotations: HashMap<String, String>,
    pub dns: Option<DnsConfig>,
}

/// The external network plugin boundary.
#[tonic::async_trait]
pub trait NetworkPlugin: Send + Sync {
    async fn set_up_pod(&self, pod: &PodNetwork) -> Result<()>;

    async fn tear_down_pod(&self, pod: &PodNetwork) -> Result<()>;

    /// The address the plugin assigned to a sandbox, from its result cache.
    async fn pod_ip(&self, sandbox_id: &str) -> Result<String>;
}

/// Drives a CNI plugin binary through the standard environment contract,
/// feeding the network configuration on stdin.
pub struct CniNetworkPlugin {
    plugin_path: String,
    config: Value,
    cache_dir: PathBuf,
}

impl CniNetworkPlugin {
    /// A bridge network backed by host-local address management.
    pub fn bridge(plugin_path: String, pod_cidr: &str) -> Self {
        let config = json!({
            "cniVersion": CNI_VERSION,
            "name": DEFAULT_NETWORK_NAME,
            "type": "bridge",
            "bridge": DEFAULT_NETWORK_NAME,
            "isGateway": true,
            "ipMasq": true,
            "ipam": {
                "type": "host-local",
                "ranges": [
                    [{"subnet": pod_cidr}],
                ],
            },
        });
        CniNetworkPlugin {
            plugin_path,
            config,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }

    async fn run_plugin_command(&self, command: &str, pod: &PodNetwork) -> Result<()> {
        let mut config = self.config.clone();
        if let Some(dns) = &pod.dns {
            // Capability args ride along inside the network configuration.
            let dns = serde_json::to_value(dns).map_err(internal("cni-dns-encode-error"))?;
            config["runtimeConfig"] = json!({ "dns": dns });
        }
        let config =
            serde_json::to_vec(&config).map_err(internal("cni-config-encode-error"))?;

        let cni_args = format!(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE={};K8S_POD_NAME={};K8S_POD_INFRA_CONTAINER_ID={};RUNTIME={}",
            pod.namespace, pod.name, pod.sandbox_id, RUNTIME_NAME,
        );
        let bin_dir = std::path::Path::new(&self.plugin_path)
            .parent()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/opt/cni/bin".to_string());

        let mut child = Command::new(&self.plugin_path)
            .env_clear()
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &pod.sandbox_id)
            .env("CNI_NETNS", netns_path(pod.sandbox_pid))
            .env("CNI_IFNAME", DEFAULT_INTERFACE)
            .env("CNI_PATH", bin_dir)
            .env("CNI_ARGS", cni_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(internal("cni-execution-error"))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Status::internal("cni-stdin-unavailable"))?;
        stdin
            .write_all(&config)
            .await
            .map_err(internal("cni-stdin-write-error"))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(internal("cni-wait-error"))?;
        if output.status.success() {
            Ok(())
        } else {
            // Plugins report errors as JSON on standard output.
            Err(internal("cni-plugin-error")(String::from_utf8_lossy(
                &output.stdout,
            )))
        }
    }
}

#[tonic::async_trait]
impl NetworkPlugin for CniNetworkPlugin {
    async fn set_up_pod(&self, pod: &PodNetwork) -> Result<()> {
        self.run_plugin_command("ADD", pod).await
    }

    async fn tear_down_pod(&self, pod: &PodNetwork) -> Result<()> {
        self.run_plugin_command("DEL", pod).await
    }

    async fn pod_ip(&self, sandbox_id: &str) -> Result<String> {
        let path = self.cache_dir.join(format!(
            "{DEFAULT_NETWORK_NAME}-{sandbox_id}-{DEFAULT_INTERFACE}"
        ));
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(internal("cni-cache-read-error"))?;
        extract_cached_ip(&raw)
    }
}

/// Used to parse the plugin's on-disk result cache.
#[derive(Deserialize)]
struct CniCacheEntry {
    result: Option<CniResult>,
}

#[derive(Deserialize)]
struct CniResult {
    #[serde(default)]
    ips: Vec<CniIpConfig>,
}

#[derive(Deserialize)]
struct CniIpConfig {
    address: String,
}

/// Pull the first assigned address out of a result cache file, dropping the
/// `/mask` suffix the plugin reports.
pub(crate) fn extract_cached_ip(raw: &str) -> Result<String> {
    let entry: CniCacheEntry =
        serde_json::from_str(raw).map_err(internal("cni-cache-decode-error"))?;
    let ips = entry.result.map(|result| result.ips).unwrap_or_default();
    let first = ips
        .first()
        .ok_or_else(|| Status::internal("cni-cache-no-addresses"))?;
    Ok(first
        .address
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string())
}

/// Tracks per-sandbox network readiness and wraps the plugin with its
/// compensating-teardown behavior.
pub struct NetworkManager {
    plugin: Arc<dyn NetworkPlugin>,
    ready: Mutex<HashMap<String, bool>>,
}

impl NetworkManager {
    pub fn new(plugin: Arc<dyn NetworkPlugin>) -> Self {
        NetworkManager {
            plugin,
            ready: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a sandbox's network is currently wired up. Unknown sandboxes
    /// are not ready.
    pub fn network_ready(&self, sandbox_id: &str) -> bool {
        let ready = self.ready.lock().unwrap();
        ready.get(sandbox_id).copied().unwrap_or(false)
    }

    pub fn set_network_ready(&self, sandbox_id: &str, is_ready: bool) {
        let mut ready = self.ready.lock().unwrap();
        ready.insert(sandbox_id.to_string(), is_ready);
    }

    pub fn clear_network_ready(&self, sandbox_id: &str) {
        let mut ready = self.ready.lock().unwrap();
        ready.remove(sandbox_id);
    }

    /// Wire up a sandbox and return the plugin-assigned address.
    ///
    /// If setup or the address extraction fails, teardown runs as a
    /// compensating action and the first error is reported.
    pub async fn set_up_pod(&self, pod: &PodNetwork) -> Result<String> {
        if let Err(err) = self.plugin.set_up_pod(pod).await {
            self.tear_down_best_effort(pod).await;
            return Err(err);
        }
        match self.plugin.pod_ip(&pod.sandbox_id).await {
            Ok(ip) => Ok(ip),
            Err(err) => {
                self.tear_down_best_effort(pod).await;
                Err(err)
            }
        }
    }

    pub async fn tear_down_pod(&self, pod: &PodNetwork) -> Result<()> {
        self.plugin.tear_down_pod(pod).await
    }

    async fn tear_down_best_effort(&self, pod: &PodNetwork) {
        if let Err(err) = self.plugin.tear_down_pod(pod).await {
            tracing::warn!(
                sandbox_id = %pod.sandbox_id,
                error = %err,
                "compensating network teardown failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CACHE_SAMPLE: &str = r#"{
        "kind": "cniCacheV1",
        "containerId": "abc123",
        "ifName": "eth0",
        "networkName": "cbr0",
        "result": {
            "cniVersion": "0.4.0",
            "ips": [
                {"version": "4", "interface": 2, "address": "10.0.0.7/24", "gateway": "10.0.0.1"}
            ]
        }
    }"#;

    #[test]
    fn cache_extraction_strips_the_mask() {
        assert_eq!(extract_cached_ip(CACHE_SAMPLE).unwrap(), "10.0.0.7");
    }

    #[test]
    fn cache_extraction_requires_an_address() {
        let empty = r#"{"result": {"ips": []}}"#;
        let no_result = r#"{"kind": "cniCacheV1"}"#;

        assert!(extract_cached_ip(empty).is_err());
        assert!(extract_cached_ip(no_result).is_err());
        assert!(extract_cached_ip("not-json").is_err());
    }

    #[test]
    fn readiness_defaults_to_not_ready() {
        let manager = NetworkManager::new(Arc::new(NeverPlugin));

        assert!(!manager.network_ready("s1"));
        manager.set_network_ready("s1", true);
        assert!(manager.network_ready("s1"));
        manager.set_network_ready("s1", false);
        assert!(!manager.network_ready("s1"));
        manager.clear_network_ready("s1");
        assert!(!manager.network_ready("s1"));
    }

    #[test]
    fn netns_paths() {
        assert_eq!(netns_path(42), "/proc/42/ns/net");
        assert_eq!(netns_path(0), "/dev/null");
    }

    struct NeverPlugin;

    #[tonic::async_trait]
    impl NetworkPlugin for NeverPlugin {
        async fn set_up_pod(&self, _pod: &PodNetwork) -> Result<()> {
            Err(Status::internal("unused"))
        }
        async fn tear_down_pod(&self, _pod: &PodNetwork) -> Result<()> {
            Ok(())
        }
        async fn pod_ip(&self, _sandbox_id: &str) -> Result<String> {
            Err(Status::internal("unused"))
        }
    }
}
