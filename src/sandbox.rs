//! Pod sandbox lifecycle engine.
//!
//! A sandbox is the long-lived half of a pod: a supervisor process holding
//! fresh Linux namespaces, an allocated IP, a CNI attachment and a persisted
//! record. The engine drives `RunPodSandbox` → `StopPodSandbox` →
//! `RemovePodSandbox` with a strict durable ordering: the checkpoint is
//! written before the process spawns, the process spawns before networking,
//! and the KV record is the last durable step, so a crash in the middle
//! never leaves a record pointing at work that was not done.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};
use tonic::Status;

use crate::api::{
    ListContainersRequest, ListPodSandboxRequest, ListPodSandboxResponse, NamespaceMode,
    NamespaceOption, PodSandbox, PodSandboxConfig, PodSandboxFilter, PodSandboxNetworkStatus,
    PodSandboxState, PodSandboxStatus, PodSandboxStatusRequest, PodSandboxStatusResponse,
    PortMapping, RemoveContainerRequest, RemovePodSandboxRequest, RemovePodSandboxResponse,
    RunPodSandboxRequest, RunPodSandboxResponse, StopPodSandboxRequest, StopPodSandboxResponse,
    ContainerFilter, LinuxPodSandboxStatus, Namespace,
};
use crate::error::{internal, Result};
use crate::filter::FilterChain;
use crate::naming::{self, KUBERNETES_POD_UID_LABEL};
use crate::network::PodNetwork;
use crate::os::{ExecStdio, OsInterface};
use crate::service::{now_nanos, SobeyService};
use crate::store::KvStore;

/// Where sandbox checkpoints are kept between restarts.
pub const SANDBOX_CHECKPOINT_DIR: &str = "/var/lib/sobeyshim/sandbox";

/// Annotation carrying the application parameters of a pod.
pub const CRI_PARAM_ANNOTATION: &str = "sobey.com/cri-param";

/// The sandbox supervisor command, run inside the fresh namespaces.
const PAUSE_SHELL: &str = "/bin/sh";
const PAUSE_COMMAND: &str = "pause";

/// A persisted sandbox. Stored as JSON at `sandbox_<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SobeySandbox {
    pub id: String,
    pub config: Option<PodSandboxConfig>,
    /// Pid of the sandbox supervisor process.
    pub pid: i32,
    pub ip: String,
    pub state: PodSandboxState,
    /// Node that owns this sandbox.
    pub hostname: String,
    pub create_time: i64,
}

/// Application parameters required on every pod, carried in the
/// `sobey.com/cri-param` annotation as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriParam {
    pub app_type: String,
    pub image_name: String,
    pub image_tag: String,
}

impl CriParam {
    pub fn from_annotations(annotations: &HashMap<String, String>) -> Result<CriParam> {
        let raw = annotations.get(CRI_PARAM_ANNOTATION).ok_or_else(|| {
            Status::invalid_argument(format!(
                "annotation {CRI_PARAM_ANNOTATION:?} is required"
            ))
        })?;
        let param: CriParam = serde_json::from_str(raw).map_err(|err| {
            Status::invalid_argument(format!(
                "annotation {CRI_PARAM_ANNOTATION:?} is not a valid parameter object: {err}"
            ))
        })?;
        for (field, value) in [
            ("appType", &param.app_type),
            ("imageName", &param.image_name),
            ("imageTag", &param.image_tag),
        ] {
            if value.is_empty() {
                return Err(Status::invalid_argument(format!(
                    "{field} must not be empty in the {CRI_PARAM_ANNOTATION} annotation"
                )));
            }
        }
        Ok(param)
    }
}

/// Crash-recovery record for a sandbox: enough to identify its port
/// mappings and host-network mode before the KV record exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxCheckpoint {
    pub port_mappings: Vec<PortMapping>,
    pub host_network: bool,
}

/// Writes checkpoints as one JSON file per sandbox id.
pub struct CheckpointStore {
    root: PathBuf,
    os: Arc<dyn OsInterface>,
}

impl CheckpointStore {
    pub fn new(root: PathBuf, os: Arc<dyn OsInterface>) -> Self {
        CheckpointStore { root, os }
    }

    pub async fn store(&self, id: &str, checkpoint: &SandboxCheckpoint) -> Result<()> {
        self.os
            .mkdir_all(&self.root, 0o750)
            .await
            .map_err(internal("checkpoint-dir-error"))?;
        let encoded =
            serde_json::to_vec(checkpoint).map_err(internal("checkpoint-encode-error"))?;
        self.os
            .write_file(&self.root.join(id), &encoded, 0o644)
            .await
            .map_err(internal("checkpoint-write-error"))
    }

    pub async fn remove(&self, id: &str) -> std::io::Result<()> {
        self.os.remove_file(&self.root.join(id)).await
    }
}

impl SobeyService {
    pub(crate) async fn load_sandbox(&self, id: &str) -> Result<Option<SobeySandbox>> {
        match self.db.get(&naming::build_sandbox_id(id)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(internal("sandbox-decode-error")),
            None => Ok(None),
        }
    }

    pub(crate) async fn persist_sandbox(&self, sandbox: &SobeySandbox) -> Result<()> {
        let encoded =
            serde_json::to_string(sandbox).map_err(internal("sandbox-encode-error"))?;
        self.db
            .put_with_prefix(naming::SANDBOX_ID_PREFIX, &sandbox.id, &encoded)
            .await
    }

    pub async fn run_pod_sandbox(
        &self,
        request: RunPodSandboxRequest,
    ) -> Result<RunPodSandboxResponse> {
        let config = request
            .config
            .ok_or_else(|| Status::invalid_argument("sandbox config is required"))?;
        // Reject pods without application parameters up front; StartContainer
        // depends on them later.
        CriParam::from_annotations(&config.annotations)?;

        let sandbox_id = naming::random_id();

        // Durable ordering: checkpoint, then process, then network, then the
        // KV record last.
        let checkpoint = SandboxCheckpoint {
            port_mappings: config.port_mappings.clone(),
            host_network: host_network(&config),
        };
        self.checkpoints.store(&sandbox_id, &checkpoint).await?;

        if !config.log_directory.is_empty() {
            if let Err(err) = self
                .os
                .mkdir_all(Path::new(&config.log_directory), 0o750)
                .await
            {
                tracing::warn!(error = %err, "cannot create pod log directory");
            }
        }

        let namespaces = CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWUSER;
        let pid = self
            .os
            .exec(
                PAUSE_SHELL,
                &["-c".to_string(), PAUSE_COMMAND.to_string()],
                Some(namespaces),
                &ExecStdio::inherit(),
            )
            .await
            .map_err(internal("sandbox-spawn-error"))?;

        let ip = self.ipam.new_sandbox_ip().await?;

        let metadata = config.metadata.clone().unwrap_or_default();
        let pod = PodNetwork {
            namespace: metadata.namespace.clone(),
            name: metadata.name.clone(),
            sandbox_id: sandbox_id.clone(),
            sandbox_pid: pid,
            annotations: config.annotations.clone(),
            dns: config.dns_config.clone(),
        };
        match self.network.set_up_pod(&pod).await {
            Ok(plugin_ip) => {
                if plugin_ip != ip {
                    tracing::warn!(
                        allocated = %ip,
                        plugin = %plugin_ip,
                        sandbox_id = %sandbox_id,
                        "plugin-assigned address differs from the allocator"
                    );
                }
            }
            Err(err) => {
                // The address would otherwise leak: nothing durable points
                // at it yet.
                if let Err(release_err) = self.ipam.put_released_ip(&ip).await {
                    tracing::warn!(
                        ip = %ip,
                        error = %release_err,
                        "cannot release address after failed network setup"
                    );
                }
                return Err(err);
            }
        }

        let sandbox = SobeySandbox {
            id: sandbox_id.clone(),
            config: Some(config),
            pid,
            ip,
            state: PodSandboxState::SandboxReady,
            hostname: self.hostname.clone(),
            create_time: now_nanos(),
        };
        self.persist_sandbox(&sandbox).await?;
        self.network.set_network_ready(&sandbox_id, true);

        Ok(RunPodSandboxResponse {
            pod_sandbox_id: sandbox_id,
        })
    }

    pub async fn stop_pod_sandbox(
        &self,
        request: StopPodSandboxRequest,
    ) -> Result<StopPodSandboxResponse> {
        let sandbox_id = naming::strip_sandbox_id(&request.pod_sandbox_id).to_string();
        let Some(mut sandbox) = self.load_sandbox(&sandbox_id).await? else {
            // The kubelet retries stops; an unknown sandbox is already
            // stopped.
            return Ok(StopPodSandboxResponse {});
        };

        if self.network.network_ready(&sandbox_id) {
            let config = sandbox.config.clone().unwrap_or_default();
            let metadata = config.metadata.clone().unwrap_or_default();
            let pod = PodNetwork {
                namespace: metadata.namespace,
                name: metadata.name,
                sandbox_id: sandbox_id.clone(),
                sandbox_pid: sandbox.pid,
                annotations: config.annotations,
                dns: config.dns_config,
            };
            self.network.tear_down_pod(&pod).await?;
            self.network.set_network_ready(&sandbox_id, false);
        }

        if !sandbox.ip.is_empty() {
            self.ipam.put_released_ip(&sandbox.ip).await?;
        }

        if sandbox.pid > 0 {
            self.os
                .kill(sandbox.pid)
                .await
                .map_err(internal("sandbox-kill-error"))?;
        }

        sandbox.state = PodSandboxState::SandboxNotready;
        self.persist_sandbox(&sandbox).await?;

        Ok(StopPodSandboxResponse {})
    }

    pub async fn remove_pod_sandbox(
        &self,
        request: RemovePodSandboxRequest,
    ) -> Result<RemovePodSandboxResponse> {
        let sandbox_id = naming::strip_sandbox_id(&request.pod_sandbox_id).to_string();

        // A sandbox cannot go while containers still reference it.
        let containers = self
            .list_containers(ListContainersRequest {
                filter: Some(ContainerFilter {
                    pod_sandbox_id: sandbox_id.clone(),
                    ..ContainerFilter::default()
                }),
            })
            .await?;
        for container in containers.containers {
            self.remove_container(RemoveContainerRequest {
                container_id: container.id,
            })
            .await?;
        }

        self.db.delete(&naming::build_sandbox_id(&sandbox_id)).await?;

        if let Err(err) = self.checkpoints.remove(&sandbox_id).await {
            tracing::warn!(sandbox_id = %sandbox_id, error = %err, "cannot remove sandbox checkpoint");
        }
        self.network.clear_network_ready(&sandbox_id);

        Ok(RemovePodSandboxResponse {})
    }

    pub async fn pod_sandbox_status(
        &self,
        request: PodSandboxStatusRequest,
    ) -> Result<PodSandboxStatusResponse> {
        let sandbox_id = naming::strip_sandbox_id(&request.pod_sandbox_id).to_string();
        let sandbox = self
            .load_sandbox(&sandbox_id)
            .await?
            .ok_or_else(|| Status::not_found(format!("sandbox {sandbox_id} is not found")))?;

        let config = sandbox.config.clone().unwrap_or_default();
        let status = PodSandboxStatus {
            id: sandbox.id.clone(),
            metadata: config.metadata.clone(),
            state: sandbox.state as i32,
            created_at: sandbox.create_time,
            network: Some(PodSandboxNetworkStatus {
                ip: sandbox.ip.clone(),
                additional_ips: Vec::new(),
            }),
            linux: Some(LinuxPodSandboxStatus {
                namespaces: Some(Namespace {
                    options: Some(NamespaceOption {
                        network: network_namespace_mode(&sandbox) as i32,
                        pid: pid_namespace_mode(&sandbox) as i32,
                        ipc: ipc_namespace_mode(&sandbox) as i32,
                        target_id: String::new(),
                    }),
                }),
            }),
            labels: config.labels,
            annotations: config.annotations,
        };
        Ok(PodSandboxStatusResponse {
            status: Some(status),
            info: HashMap::new(),
        })
    }

    pub async fn list_pod_sandbox(
        &self,
        request: ListPodSandboxRequest,
    ) -> Result<ListPodSandboxResponse> {
        let raw = self.db.get_by_prefix(naming::SANDBOX_ID_PREFIX).await?;
        let mut sandboxes = Vec::with_capacity(raw.len());
        for value in raw {
            let sandbox: SobeySandbox =
                serde_json::from_str(&value).map_err(internal("sandbox-decode-error"))?;
            if sandbox.hostname == self.hostname {
                sandboxes.push(sandbox);
            }
        }
        let sandboxes = sandbox_filter_chain(request.filter.as_ref()).apply(sandboxes);

        let items = sandboxes
            .into_iter()
            .map(|sandbox| {
                let config = sandbox.config.unwrap_or_default();
                PodSandbox {
                    id: sandbox.id,
                    metadata: config.metadata,
                    state: sandbox.state as i32,
                    created_at: sandbox.create_time,
                    labels: config.labels,
                    annotations: config.annotations,
                }
            })
            .collect();
        Ok(ListPodSandboxResponse { items })
    }
}

fn sandbox_filter_chain(filter: Option<&PodSandboxFilter>) -> FilterChain<SobeySandbox> {
    let Some(filter) = filter else {
        return FilterChain::new();
    };
    let id = naming::strip_sandbox_id(&filter.id).to_string();
    let uid = filter
        .label_selector
        .get(KUBERNETES_POD_UID_LABEL)
        .cloned()
        .unwrap_or_default();
    let state = filter.state.as_ref().map(|value| value.state);

    FilterChain::new()
        .when(!id.is_empty(), move |sandbox: &SobeySandbox| {
            sandbox.id.eq_ignore_ascii_case(&id)
        })
        .when(!uid.is_empty(), move |sandbox: &SobeySandbox| {
            sandbox
                .config
                .as_ref()
                .and_then(|config| config.metadata.as_ref())
                .is_some_and(|metadata| metadata.uid.eq_ignore_ascii_case(&uid))
        })
        .when(state.is_some(), move |sandbox: &SobeySandbox| {
            Some(sandbox.state as i32) == state
        })
}

fn host_network(config: &PodSandboxConfig) -> bool {
    namespace_options(config)
        .map(|options| options.network == NamespaceMode::Node as i32)
        .unwrap_or(false)
}

fn namespace_options(config: &PodSandboxConfig) -> Option<&NamespaceOption> {
    config
        .linux
        .as_ref()?
        .security_context
        .as_ref()?
        .namespace_options
        .as_ref()
}

fn sandbox_namespace_options(sandbox: &SobeySandbox) -> Option<&NamespaceOption> {
    namespace_options(sandbox.config.as_ref()?)
}

/// Network namespace mode reported in status. Supports NODE and POD.
fn network_namespace_mode(sandbox: &SobeySandbox) -> NamespaceMode {
    match sandbox_namespace_options(sandbox) {
        Some(options) if options.network == NamespaceMode::Node as i32 => NamespaceMode::Node,
        _ => NamespaceMode::Pod,
    }
}

fn pid_namespace_mode(sandbox: &SobeySandbox) -> NamespaceMode {
    match sandbox_namespace_options(sandbox) {
        Some(options) if options.pid == NamespaceMode::Node as i32 => NamespaceMode::Node,
        _ => NamespaceMode::Container,
    }
}

fn ipc_namespace_mode(sandbox: &SobeySandbox) -> NamespaceMode {
    match sandbox_namespace_options(sandbox) {
        Some(options) if options.ipc == NamespaceMode::Node as i32 => NamespaceMode::Node,
        _ => NamespaceMode::Pod,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LinuxPodSandboxConfig, LinuxSandboxSecurityContext};
    use crate::testing::{ready_fixture, sandbox_config};

    #[tokio::test]
    async fn run_pod_sandbox_persists_a_ready_record() {
        let fixture = ready_fixture().await;

        let response = fixture
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: Some(sandbox_config("web", "default", "u1")),
                runtime_handler: String::new(),
            })
            .await
            .unwrap();

        let sandbox_id = response.pod_sandbox_id;
        assert_eq!(sandbox_id.len(), 12);

        let sandbox = fixture
            .service
            .load_sandbox(&sandbox_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sandbox.state, PodSandboxState::SandboxReady);
        assert_eq!(sandbox.ip, "10.0.0.1");
        assert_eq!(sandbox.hostname, "node-1");
        assert!(sandbox.pid > 0);
        assert!(sandbox.create_time > 0);
        assert_eq!(
            fixture.db.get("latestIp").await.unwrap().as_deref(),
            Some("10.0.0.1")
        );
        assert!(fixture.service.network.network_ready(&sandbox_id));
        // The checkpoint was written before anything else happened.
        assert!(
            fixture
                .os
                .written_file(Path::new(SANDBOX_CHECKPOINT_DIR).join(&sandbox_id).as_path())
                .is_some()
        );
    }

    #[tokio::test]
    async fn run_pod_sandbox_spawns_the_pause_process_in_fresh_namespaces() {
        let fixture = ready_fixture().await;

        fixture
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: Some(sandbox_config("web", "default", "u1")),
                runtime_handler: String::new(),
            })
            .await
            .unwrap();

        let execs = fixture.os.execs();
        assert_eq!(execs.len(), 1);
        let (name, args, namespaces) = &execs[0];
        assert_eq!(name, "/bin/sh");
        assert_eq!(args, &vec!["-c".to_string(), "pause".to_string()]);
        let flags = namespaces.unwrap();
        for required in [
            CloneFlags::CLONE_NEWUTS,
            CloneFlags::CLONE_NEWIPC,
            CloneFlags::CLONE_NEWPID,
            CloneFlags::CLONE_NEWNS,
            CloneFlags::CLONE_NEWNET,
            CloneFlags::CLONE_NEWUSER,
        ] {
            assert!(flags.contains(required));
        }
    }

    #[tokio::test]
    async fn run_pod_sandbox_requires_the_cri_param_annotation() {
        let fixture = ready_fixture().await;
        let mut config = sandbox_config("web", "default", "u1");
        config.annotations.clear();

        let err = fixture
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: Some(config),
                runtime_handler: String::new(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn run_pod_sandbox_rejects_incomplete_cri_params() {
        let fixture = ready_fixture().await;
        let bad_params = vec![
            r#"{"appType":"","imageName":"nginx","imageTag":"1.25"}"#,
            r#"{"appType":"jar","imageName":"","imageTag":"1.25"}"#,
            r#"{"appType":"jar","imageName":"nginx","imageTag":""}"#,
            r#"not json"#,
        ];

        for param in bad_params {
            let mut config = sandbox_config("web", "default", "u1");
            config
                .annotations
                .insert(CRI_PARAM_ANNOTATION.to_string(), param.to_string());
            let err = fixture
                .service
                .run_pod_sandbox(RunPodSandboxRequest {
                    config: Some(config),
                    runtime_handler: String::new(),
                })
                .await
                .unwrap_err();
            assert_eq!(err.code(), tonic::Code::InvalidArgument, "accepted {param}");
        }
    }

    #[tokio::test]
    async fn failed_network_setup_rolls_the_address_back() {
        let fixture = ready_fixture().await;
        fixture.network.fail_setup();

        let err = fixture
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: Some(sandbox_config("web", "default", "u1")),
                runtime_handler: String::new(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::Internal);
        // No record was persisted and the address went back to the pool.
        assert!(fixture.db.get("releasedIp").await.unwrap().is_some());
        assert_eq!(fixture.network.teardowns(), 1);
        let listed = fixture
            .service
            .list_pod_sandbox(ListPodSandboxRequest { filter: None })
            .await
            .unwrap();
        assert!(listed.items.is_empty());
    }

    #[tokio::test]
    async fn stop_pod_sandbox_releases_the_address() {
        let fixture = ready_fixture().await;
        let sandbox_id = fixture.run_sandbox("web", "default", "u1").await;

        fixture
            .service
            .stop_pod_sandbox(StopPodSandboxRequest {
                pod_sandbox_id: sandbox_id.clone(),
            })
            .await
            .unwrap();

        let sandbox = fixture
            .service
            .load_sandbox(&sandbox_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sandbox.state, PodSandboxState::SandboxNotready);
        assert!(!fixture.service.network.network_ready(&sandbox_id));
        assert_eq!(fixture.network.teardowns(), 1);
        assert_eq!(
            fixture.db.get("releasedIp").await.unwrap().unwrap(),
            r#"["10.0.0.1"]"#
        );
        assert_eq!(fixture.os.killed(), vec![sandbox.pid]);
    }

    #[tokio::test]
    async fn stopped_address_is_reused_by_the_next_sandbox() {
        let fixture = ready_fixture().await;
        let first = fixture.run_sandbox("web", "default", "u1").await;
        fixture
            .service
            .stop_pod_sandbox(StopPodSandboxRequest {
                pod_sandbox_id: first,
            })
            .await
            .unwrap();

        let second = fixture.run_sandbox("web", "default", "u2").await;

        let sandbox = fixture.service.load_sandbox(&second).await.unwrap().unwrap();
        assert_eq!(sandbox.ip, "10.0.0.1");
        assert_eq!(fixture.db.get("releasedIp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stopping_an_unknown_sandbox_is_success() {
        let fixture = ready_fixture().await;

        fixture
            .service
            .stop_pod_sandbox(StopPodSandboxRequest {
                pod_sandbox_id: "nosuch".to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn remove_pod_sandbox_deletes_the_record_and_checkpoint() {
        let fixture = ready_fixture().await;
        let sandbox_id = fixture.run_sandbox("web", "default", "u1").await;
        fixture
            .service
            .stop_pod_sandbox(StopPodSandboxRequest {
                pod_sandbox_id: sandbox_id.clone(),
            })
            .await
            .unwrap();

        fixture
            .service
            .remove_pod_sandbox(RemovePodSandboxRequest {
                pod_sandbox_id: sandbox_id.clone(),
            })
            .await
            .unwrap();

        assert!(fixture
            .db
            .get(&naming::build_sandbox_id(&sandbox_id))
            .await
            .unwrap()
            .is_none());
        assert!(fixture
            .os
            .removed_file(Path::new(SANDBOX_CHECKPOINT_DIR).join(&sandbox_id).as_path()));
    }

    #[tokio::test]
    async fn status_echoes_the_stored_config() {
        let fixture = ready_fixture().await;
        let sandbox_id = fixture.run_sandbox("web", "default", "u1").await;

        let response = fixture
            .service
            .pod_sandbox_status(PodSandboxStatusRequest {
                pod_sandbox_id: sandbox_id.clone(),
                verbose: false,
            })
            .await
            .unwrap();

        let status = response.status.unwrap();
        assert_eq!(status.id, sandbox_id);
        assert_eq!(status.state, PodSandboxState::SandboxReady as i32);
        let metadata = status.metadata.unwrap();
        assert_eq!(metadata.name, "web");
        assert_eq!(metadata.namespace, "default");
        assert_eq!(metadata.uid, "u1");
        let network = status.network.unwrap();
        assert_eq!(network.ip, "10.0.0.1");
        assert!(network.additional_ips.is_empty());
        let options = status.linux.unwrap().namespaces.unwrap().options.unwrap();
        assert_eq!(options.network, NamespaceMode::Pod as i32);
        assert_eq!(options.pid, NamespaceMode::Container as i32);
        assert_eq!(options.ipc, NamespaceMode::Pod as i32);
    }

    #[tokio::test]
    async fn status_reports_node_modes_for_host_namespaces() {
        let fixture = ready_fixture().await;
        let mut config = sandbox_config("web", "default", "u1");
        config.linux = Some(LinuxPodSandboxConfig {
            cgroup_parent: String::new(),
            security_context: Some(LinuxSandboxSecurityContext {
                namespace_options: Some(NamespaceOption {
                    network: NamespaceMode::Node as i32,
                    pid: NamespaceMode::Node as i32,
                    ipc: NamespaceMode::Node as i32,
                    target_id: String::new(),
                }),
                run_as_user: None,
                readonly_rootfs: false,
                privileged: false,
            }),
            sysctls: HashMap::new(),
        });
        let response = fixture
            .service
            .run_pod_sandbox(RunPodSandboxRequest {
                config: Some(config),
                runtime_handler: String::new(),
            })
            .await
            .unwrap();

        let status = fixture
            .service
            .pod_sandbox_status(PodSandboxStatusRequest {
                pod_sandbox_id: response.pod_sandbox_id,
                verbose: false,
            })
            .await
            .unwrap();

        let options = status
            .status
            .unwrap()
            .linux
            .unwrap()
            .namespaces
            .unwrap()
            .options
            .unwrap();
        assert_eq!(options.network, NamespaceMode::Node as i32);
        assert_eq!(options.pid, NamespaceMode::Node as i32);
        assert_eq!(options.ipc, NamespaceMode::Node as i32);
    }

    #[tokio::test]
    async fn status_of_an_unknown_sandbox_is_not_found() {
        let fixture = ready_fixture().await;

        let err = fixture
            .service
            .pod_sandbox_status(PodSandboxStatusRequest {
                pod_sandbox_id: "nosuch".to_string(),
                verbose: false,
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn listing_is_scoped_to_the_local_node() {
        let fixture = ready_fixture().await;
        // A record owned by another node.
        let foreign = SobeySandbox {
            id: "foreign000001".to_string(),
            config: Some(sandbox_config("other", "default", "u9")),
            pid: 1,
            ip: "10.0.0.200".to_string(),
            state: PodSandboxState::SandboxReady,
            hostname: "node-2".to_string(),
            create_time: 1,
        };
        fixture.service.persist_sandbox(&foreign).await.unwrap();

        let empty = fixture
            .service
            .list_pod_sandbox(ListPodSandboxRequest { filter: None })
            .await
            .unwrap();
        assert!(empty.items.is_empty());

        // A local sandbox is independent of the foreign record.
        let local = fixture.run_sandbox("web", "default", "u1").await;
        let listed = fixture
            .service
            .list_pod_sandbox(ListPodSandboxRequest { filter: None })
            .await
            .unwrap();
        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.items[0].id, local);
    }

    #[tokio::test]
    async fn listing_filters_by_uid_state_and_id() {
        let fixture = ready_fixture().await;
        let first = fixture.run_sandbox("web", "default", "u1").await;
        let second = fixture.run_sandbox("db", "default", "u2").await;
        fixture
            .service
            .stop_pod_sandbox(StopPodSandboxRequest {
                pod_sandbox_id: second.clone(),
            })
            .await
            .unwrap();

        let by_uid = fixture
            .service
            .list_pod_sandbox(ListPodSandboxRequest {
                filter: Some(PodSandboxFilter {
                    label_selector: HashMap::from([(
                        KUBERNETES_POD_UID_LABEL.to_string(),
                        "U1".to_string(),
                    )]),
                    ..PodSandboxFilter::default()
                }),
            })
            .await
            .unwrap();
        assert_eq!(by_uid.items.len(), 1);
        assert_eq!(by_uid.items[0].id, first);

        let by_state = fixture
            .service
            .list_pod_sandbox(ListPodSandboxRequest {
                filter: Some(PodSandboxFilter {
                    state: Some(crate::api::PodSandboxStateValue {
                        state: PodSandboxState::SandboxNotready as i32,
                    }),
                    ..PodSandboxFilter::default()
                }),
            })
            .await
            .unwrap();
        assert_eq!(by_state.items.len(), 1);
        assert_eq!(by_state.items[0].id, second);

        let by_id = fixture
            .service
            .list_pod_sandbox(ListPodSandboxRequest {
                filter: Some(PodSandboxFilter {
                    id: naming::build_sandbox_id(&first),
                    ..PodSandboxFilter::default()
                }),
            })
            .await
            .unwrap();
        assert_eq!(by_id.items.len(), 1);
        assert_eq!(by_id.items[0].id, first);
    }

    #[test]
    fn cri_param_parses_the_documented_shape() {
        let annotations = HashMap::from([(
            CRI_PARAM_ANNOTATION.to_string(),
            r#"{"appType":"jar","imageName":"nginx","imageTag":"1.25"}"#.to_string(),
        )]);

        let param = CriParam::from_annotations(&annotations).unwrap();

        assert_eq!(param.app_type, "jar");
        assert_eq!(param.image_name, "nginx");
        assert_eq!(param.image_tag, "1.25");
    }

    #[test]
    fn host_network_is_derived_from_the_security_context() {
        let mut config = sandbox_config("web", "default", "u1");
        assert!(!host_network(&config));

        config.linux = Some(LinuxPodSandboxConfig {
            cgroup_parent: String::new(),
            security_context: Some(LinuxSandboxSecurityContext {
                namespace_options: Some(NamespaceOption {
                    network: NamespaceMode::Node as i32,
                    pid: NamespaceMode::Container as i32,
                    ipc: NamespaceMode::Pod as i32,
                    target_id: String::new(),
                }),
                run_as_user: None,
                readonly_rootfs: false,
                privileged: false,
            }),
            sysctls: HashMap::new(),
        });
        assert!(host_network(&config));
    }

    #[test]
    fn checkpoint_serialises_camel_case() {
        let checkpoint = SandboxCheckpoint {
            port_mappings: vec![PortMapping {
                protocol: 0,
                container_port: 443,
                host_port: 8443,
                host_ip: String::new(),
            }],
            host_network: true,
        };

        let encoded = serde_json::to_string(&checkpoint).unwrap();

        assert!(encoded.contains("\"portMappings\""));
        assert!(encoded.contains("\"hostNetwork\":true"));
    }
}
