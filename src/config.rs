//! Configuration loading.
//!
//! The binary is pointed at a directory with `--config`; the directory must
//! contain a `config.yaml` with a `server` section (legacy HTTP server
//! endpoints, the sandbox IP range and the image repository) and an `etcd`
//! section (TLS material and endpoints).

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Name of the configuration file inside the `--config` directory.
const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub etcd: EtcdConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the legacy application server, e.g. `http://host:9067`.
    pub host: String,
    pub apis: ServerApis,
    /// CIDR the sandbox IP allocator hands addresses out of.
    #[serde(rename = "ipRange")]
    pub ip_range: String,
    /// Base URL of the image repository used by PullImage.
    pub repo: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerApis {
    pub run: String,
    pub stop: String,
    pub healthy: String,
    pub list: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtcdConfig {
    #[serde(rename = "root-cert-path")]
    pub root_cert_path: String,
    #[serde(rename = "client-cert-path")]
    pub client_cert_path: String,
    #[serde(rename = "client-key-cert-path")]
    pub client_key_cert_path: String,
    pub endpoints: Vec<String>,
}

impl Config {
    /// Load `config.yaml` from the given directory.
    pub fn load(dir: &Path) -> anyhow::Result<Config> {
        let path = dir.join(CONFIG_FILE);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("cannot parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  host: "http://172.16.200.112:9067"
  apis:
    run: "/v1/server/run"
    stop: "/v1/server/stop"
    healthy: "/v1/server/healthy"
    list: "/v1/server/list"
  ipRange: "10.0.0.0/24"
  repo: "http://172.16.200.112:8081/repo"
etcd:
  root-cert-path: "/opt/etcd/ssl/ca.pem"
  client-cert-path: "/opt/etcd/ssl/server.pem"
  client-key-cert-path: "/opt/etcd/ssl/server-key.pem"
  endpoints:
    - "https://172.16.166.87:2379"
"#;

    #[test]
    fn parses_sample_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();

        assert_eq!(config.server.ip_range, "10.0.0.0/24");
        assert_eq!(config.server.apis.run, "/v1/server/run");
        assert_eq!(config.etcd.endpoints.len(), 1);
        assert_eq!(config.etcd.root_cert_path, "/opt/etcd/ssl/ca.pem");
    }

    #[test]
    fn load_reads_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), SAMPLE).unwrap();

        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config.server.repo, "http://172.16.200.112:8081/repo");
    }

    #[test]
    fn load_fails_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();

        assert!(Config::load(dir.path()).is_err());
    }
}
