//! Container lifecycle engine.
//!
//! Containers are bound to a sandbox through the `io.kubernetes.sandbox.id`
//! label and move `CREATED → RUNNING → EXITED`, monotonically: a RUNNING
//! container cannot be removed, only stopped and then removed.
//!
//! The workload itself is launched by an external executor chosen by the
//! pod's `appType`. Each application type carries its own strategy for
//! materialising a launch config and invoking its executor; the registry
//! keyed by type keeps the dispatch open for new kinds of workloads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tonic::Status;

use crate::api::{
    Container, ContainerConfig, ContainerFilter, ContainerState,
    ContainerStatus, ContainerStatusRequest, ContainerStatusResponse, CreateContainerRequest,
    CreateContainerResponse, ImageSpec, ListContainersRequest, ListContainersResponse, Mount,
    PodSandboxConfig, RemoveContainerRequest, RemoveContainerResponse, StartContainerRequest,
    StartContainerResponse, StopContainerRequest, StopContainerResponse,
};
use crate::error::{internal, Result};
use crate::filter::FilterChain;
use crate::naming::{
    self, CONTAINER_LOG_PATH_LABEL_KEY, CONTAINER_TYPE_LABEL_CONTAINER, CONTAINER_TYPE_LABEL_KEY,
    KUBERNETES_POD_UID_LABEL, SANDBOX_ID_LABEL_KEY,
};
use crate::os::{ExecStdio, OsInterface};
use crate::sandbox::{CriParam, SobeySandbox};
use crate::service::{now_nanos, SobeyService};
use crate::store::KvStore;

/// Raw per-container log files live here; the kubelet sees them through
/// symlinks under `/var/log/pods`.
pub const SERVER_LOG_DIR: &str = "/var/lib/sobey/servers/log";

/// Root of the executor's per-container state.
const SOCKER_CONTAINER_ROOT: &str = "/var/run/socker/containers";
/// The external executor binary.
const SOCKER_BINARY: &str = "socker";

/// Seconds to wait before each PID-file read during StartContainer.
const DEFAULT_PID_POLL_SCHEDULE: &[u64] = &[1, 1, 2, 3, 5];

/// Fixed process and CPU budgets written into every launch config.
const CONTAINER_PIDS_LIMIT: i64 = 100;
const CONTAINER_CPUS: f64 = 20.0;

/// Mounts whose container path carries this tag get unmounted on removal.
const PROJECT_PATH_TAG: &str = "sobey";

/// A persisted container. Stored as JSON at `container_<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SobeyContainer {
    pub id: String,
    /// Composite `k8s_…` name; the kubelet metadata is recovered from it.
    pub name: String,
    /// Node that owns this container.
    pub hostname: String,
    pub image: String,
    /// Pid of the supervised workload process, empty until started.
    pub pid: String,
    /// Absolute path of the raw log file.
    pub path: String,
    pub pod_sandbox_config: Option<PodSandboxConfig>,
    pub container_config: Option<ContainerConfig>,
    pub state: ContainerState,
    /// Owning pod's uid, for label-selector filtering.
    pub uid: String,
    pub labels: HashMap<String, String>,
    pub create_at: i64,
    pub started_at: i64,
    pub finished_at: i64,
}

/// Launch config handed to the executor, written to
/// `/var/run/socker/containers/<id>/conf/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConf {
    pub id: String,
    pub sandbox_pid: String,
    pub mem: i64,
    pub swap: i64,
    pub pids: i64,
    pub cpus: f64,
    pub image: ConfImage,
    pub args: Vec<String>,
    pub env: Vec<ConfKeyValue>,
    pub mount: Vec<ConfMount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfImage {
    pub name: String,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfKeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfMount {
    pub container_path: String,
    pub host_path: String,
}

/// One application type's way of launching a workload.
#[tonic::async_trait]
pub trait AppLauncher: Send + Sync {
    /// Materialise the launch config, invoke the executor and return the
    /// workload pid.
    async fn start(
        &self,
        container: &SobeyContainer,
        sandbox: &SobeySandbox,
        param: &CriParam,
    ) -> Result<String>;
}

/// Launch strategies keyed by `appType`.
pub struct LauncherRegistry {
    launchers: HashMap<String, Arc<dyn AppLauncher>>,
}

impl LauncherRegistry {
    pub fn new() -> Self {
        LauncherRegistry {
            launchers: HashMap::new(),
        }
    }

    /// The built-in strategies; currently only `jar`.
    pub fn with_defaults(os: Arc<dyn OsInterface>) -> Self {
        let mut registry = LauncherRegistry::new();
        registry.register("jar", Arc::new(SockerJarLauncher::new(os)));
        registry
    }

    pub fn register(&mut self, app_type: &str, launcher: Arc<dyn AppLauncher>) {
        self.launchers.insert(app_type.to_string(), launcher);
    }

    pub fn get(&self, app_type: &str) -> Option<Arc<dyn AppLauncher>> {
        self.launchers.get(app_type).cloned()
    }
}

impl Default for LauncherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `jar` workloads: write the launch config and hand off to `socker run`,
/// which mounts the overlay, enters the sandbox namespaces and reports the
/// workload pid through a PID file.
pub struct SockerJarLauncher {
    os: Arc<dyn OsInterface>,
    poll_schedule: Vec<u64>,
}

impl SockerJarLauncher {
    pub fn new(os: Arc<dyn OsInterface>) -> Self {
        SockerJarLauncher {
            os,
            poll_schedule: DEFAULT_PID_POLL_SCHEDULE.to_vec(),
        }
    }

    pub fn with_poll_schedule(os: Arc<dyn OsInterface>, poll_schedule: Vec<u64>) -> Self {
        SockerJarLauncher { os, poll_schedule }
    }
}

#[tonic::async_trait]
impl AppLauncher for SockerJarLauncher {
    async fn start(
        &self,
        container: &SobeyContainer,
        sandbox: &SobeySandbox,
        param: &CriParam,
    ) -> Result<String> {
        let base = PathBuf::from(SOCKER_CONTAINER_ROOT).join(&container.id);
        let conf_dir = base.join("conf");
        self.os
            .mkdir_all(&conf_dir, 0o750)
            .await
            .map_err(internal("socker-conf-dir-error"))?;

        let conf = build_container_conf(container, sandbox, param);
        let encoded = serde_json::to_vec(&conf).map_err(internal("socker-conf-encode-error"))?;
        self.os
            .write_file(&conf_dir.join("config.json"), &encoded, 0o777)
            .await
            .map_err(internal("socker-conf-write-error"))?;

        self.os
            .exec(
                SOCKER_BINARY,
                &["run".to_string(), container.id.clone()],
                None,
                &ExecStdio::inherit(),
            )
            .await
            .map_err(internal("socker-run-error"))?;

        // The executor daemonises the workload and reports its pid through
        // the PID file; the first successful read wins.
        let pid_file = base.join("pid");
        for wait in &self.poll_schedule {
            tokio::time::sleep(Duration::from_secs(*wait)).await;
            match self.os.read_to_string(&pid_file).await {
                Ok(raw) => {
                    let pid = raw.trim();
                    if !pid.is_empty() {
                        return Ok(pid.to_string());
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(internal("socker-pid-read-error")(err)),
            }
        }
        Err(Status::deadline_exceeded("get PID over time"))
    }
}

fn build_container_conf(
    container: &SobeyContainer,
    sandbox: &SobeySandbox,
    param: &CriParam,
) -> ContainerConf {
    let config = container.container_config.clone().unwrap_or_default();
    let resources = config
        .linux
        .as_ref()
        .and_then(|linux| linux.resources.clone())
        .unwrap_or_default();

    let mut args = config.command.clone();
    args.extend(config.args.iter().cloned());

    ContainerConf {
        id: container.id.clone(),
        sandbox_pid: sandbox.pid.to_string(),
        mem: resources.memory_limit_in_bytes,
        swap: resources.memory_swap_limit_in_bytes,
        pids: CONTAINER_PIDS_LIMIT,
        cpus: CONTAINER_CPUS,
        image: ConfImage {
            name: param.image_name.clone(),
            tag: param.image_tag.clone(),
        },
        args,
        env: config
            .envs
            .iter()
            .map(|env| ConfKeyValue {
                key: env.key.clone(),
                value: env.value.clone(),
            })
            .collect(),
        mount: config
            .mounts
            .iter()
            .map(|mount| ConfMount {
                container_path: mount.container_path.clone(),
                host_path: mount.host_path.clone(),
            })
            .collect(),
    }
}

impl SobeyService {
    pub(crate) async fn load_container(&self, id: &str) -> Result<Option<(String, SobeyContainer)>> {
        match self.db.get(&naming::build_container_id(id)).await? {
            Some(raw) => {
                let container =
                    serde_json::from_str(&raw).map_err(internal("container-decode-error"))?;
                Ok(Some((raw, container)))
            }
            None => Ok(None),
        }
    }

    pub(crate) async fn persist_container(&self, container: &SobeyContainer) -> Result<()> {
        let encoded =
            serde_json::to_string(container).map_err(internal("container-encode-error"))?;
        self.db
            .put_with_prefix(naming::CONTAINER_ID_PREFIX, &container.id, &encoded)
            .await
    }

    pub async fn create_container(
        &self,
        request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        let config = request
            .config
            .ok_or_else(|| Status::invalid_argument("container config is required"))?;
        let container_metadata = config.metadata.clone().unwrap_or_default();
        let sandbox_config = request.sandbox_config.ok_or_else(|| {
            Status::invalid_argument(format!(
                "sandbox config is required for container {:?}",
                container_metadata.name
            ))
        })?;

        let sandbox_id = naming::strip_sandbox_id(&request.pod_sandbox_id).to_string();

        let kubelet_log_path =
            Path::new(&sandbox_config.log_directory).join(&config.log_path);
        let mut labels = naming::make_labels(&config.labels, &config.annotations);
        labels.insert(
            CONTAINER_TYPE_LABEL_KEY.to_string(),
            CONTAINER_TYPE_LABEL_CONTAINER.to_string(),
        );
        labels.insert(
            CONTAINER_LOG_PATH_LABEL_KEY.to_string(),
            kubelet_log_path.to_string_lossy().into_owned(),
        );
        labels.insert(SANDBOX_ID_LABEL_KEY.to_string(), sandbox_id);

        if let Some(parent) = kubelet_log_path.parent() {
            if let Err(err) = self.os.mkdir_all(parent, 0o750).await {
                tracing::warn!(error = %err, "cannot create container log directory");
            }
        }
        if let Err(err) = self.os.create(&kubelet_log_path).await {
            tracing::warn!(error = %err, "cannot create container log file");
        }

        let image_ref = config.image.clone().unwrap_or_default().image;
        let image = naming::normalize_image(&image_ref).to_string();

        let sandbox_metadata = sandbox_config.metadata.clone().unwrap_or_default();
        let name = naming::make_container_name(&sandbox_metadata, &container_metadata);

        let container_id = naming::random_id();
        let raw_log_path = format!("{SERVER_LOG_DIR}/{name}_{}.log", now_nanos());
        self.os
            .create(Path::new(&raw_log_path))
            .await
            .map_err(internal("container-log-create-error"))?;

        let container = SobeyContainer {
            id: container_id.clone(),
            name,
            hostname: self.hostname.clone(),
            image,
            pid: String::new(),
            path: raw_log_path,
            pod_sandbox_config: Some(sandbox_config),
            container_config: Some(config),
            state: ContainerState::ContainerCreated,
            uid: sandbox_metadata.uid,
            labels,
            create_at: now_nanos(),
            started_at: 0,
            finished_at: 0,
        };
        self.persist_container(&container).await?;

        Ok(CreateContainerResponse { container_id })
    }

    pub async fn start_container(
        &self,
        request: StartContainerRequest,
    ) -> Result<StartContainerResponse> {
        let container_id = request.container_id;
        let Some((raw, mut container)) = self.load_container(&container_id).await? else {
            return Err(Status::not_found(format!(
                "container {container_id} is not found, create the container first"
            )));
        };
        if container.state == ContainerState::ContainerRunning {
            // Double-start is idempotent; the executor is not re-invoked.
            return Ok(StartContainerResponse {});
        }

        let sandbox_id = container
            .labels
            .get(SANDBOX_ID_LABEL_KEY)
            .cloned()
            .unwrap_or_default();
        let sandbox = self.load_sandbox(&sandbox_id).await?.ok_or_else(|| {
            Status::not_found(format!(
                "sandbox {sandbox_id} is not found for container {container_id}"
            ))
        })?;
        let sandbox_config = sandbox.config.clone().unwrap_or_default();
        let param = CriParam::from_annotations(&sandbox_config.annotations)?;

        let launcher = self.launchers.get(&param.app_type).ok_or_else(|| {
            Status::invalid_argument(format!("unsupported appType {:?}", param.app_type))
        })?;
        let pid = launcher.start(&container, &sandbox, &param).await?;

        container.pid = pid;
        container.started_at = now_nanos();
        container.finished_at = container.started_at + 1000;
        container.state = ContainerState::ContainerRunning;
        let encoded =
            serde_json::to_string(&container).map_err(internal("container-encode-error"))?;
        // Guard CREATED→RUNNING against a concurrent start on the same id:
        // only the caller still seeing the record it read gets to move it.
        let swapped = self
            .db
            .compare_and_swap(
                &naming::build_container_id(&container.id),
                Some(&raw),
                Some(&encoded),
            )
            .await?;
        if !swapped {
            return Ok(StartContainerResponse {});
        }

        let real_path = container.path.clone();
        if !real_path.is_empty() {
            let link = container
                .labels
                .get(CONTAINER_LOG_PATH_LABEL_KEY)
                .cloned()
                .unwrap_or_default();
            if self.os.remove_file(Path::new(&link)).await.is_ok() {
                tracing::info!(path = %link, "deleted previously existing symlink file");
            }
            self.os
                .symlink(Path::new(&real_path), Path::new(&link))
                .await
                .map_err(|err| {
                    Status::internal(format!(
                        "failed to create symbolic link {link:?} to the container log file \
                         {real_path:?} for container {container_id:?}: {err}"
                    ))
                })?;
        }

        Ok(StartContainerResponse {})
    }

    pub async fn stop_container(
        &self,
        request: StopContainerRequest,
    ) -> Result<StopContainerResponse> {
        let Some((_, mut container)) = self.load_container(&request.container_id).await? else {
            // Stopping an unknown container is success.
            return Ok(StopContainerResponse {});
        };

        if let Ok(pid) = container.pid.parse::<i32>() {
            if pid > 0 {
                // Read the parent before the workload disappears: the
                // executor supervises the workload and has to die with it.
                let parent = self
                    .os
                    .ppid_of(pid)
                    .await
                    .map_err(internal("process-lookup-error"))?;
                self.os
                    .kill(pid)
                    .await
                    .map_err(internal("container-kill-error"))?;
                if let Some(parent) = parent {
                    if parent > 1 {
                        self.os
                            .kill(parent)
                            .await
                            .map_err(internal("supervisor-kill-error"))?;
                    }
                }
            }
        }

        container.state = ContainerState::ContainerExited;
        self.persist_container(&container).await?;

        Ok(StopContainerResponse {})
    }

    pub async fn remove_container(
        &self,
        request: RemoveContainerRequest,
    ) -> Result<RemoveContainerResponse> {
        let Some((_, container)) = self.load_container(&request.container_id).await? else {
            return Ok(RemoveContainerResponse {});
        };
        if container.state != ContainerState::ContainerExited {
            return Err(Status::failed_precondition(format!(
                "container is not stopped, stop the container before removing it, containerID: {}",
                container.id
            )));
        }

        if let Err(err) = self.os.remove_file(Path::new(&container.path)).await {
            tracing::warn!(path = %container.path, error = %err, "cannot remove container log file");
        }
        self.db
            .delete(&naming::build_container_id(&container.id))
            .await?;

        // Everything below frees node-local state; the record is already
        // gone, so failures are logged and swallowed.
        self.cleanup_container_filesystem(&container).await;

        Ok(RemoveContainerResponse {})
    }

    async fn cleanup_container_filesystem(&self, container: &SobeyContainer) {
        let base = PathBuf::from(SOCKER_CONTAINER_ROOT).join(&container.id);
        let fs_root = base.join("fs");

        let mounts = container
            .container_config
            .as_ref()
            .map(|config| config.mounts.clone())
            .unwrap_or_default();
        for mount in mounts {
            if !mount.container_path.contains(PROJECT_PATH_TAG) {
                continue;
            }
            let target = fs_root.join(format!("mnt{}", mount.container_path));
            if let Err(err) = self.os.unmount(&target) {
                tracing::warn!(target = %target.display(), error = %err, "unmount failed");
            }
        }
        for sub in ["dev/pts", "dev", "sys", "proc", "tmp", "mnt"] {
            let target = fs_root.join(sub);
            if let Err(err) = self.os.unmount(&target) {
                tracing::warn!(target = %target.display(), error = %err, "unmount failed");
            }
        }
        if let Err(err) = self.os.remove_all(&base).await {
            tracing::warn!(path = %base.display(), error = %err, "cannot remove container state directory");
        }
    }

    pub async fn container_status(
        &self,
        request: ContainerStatusRequest,
    ) -> Result<ContainerStatusResponse> {
        let container_id = request.container_id;
        let Some((_, container)) = self.load_container(&container_id).await? else {
            return Err(Status::not_found(format!(
                "container {container_id} is not found"
            )));
        };

        let metadata = naming::parse_container_name(&container.name)?;
        let (labels, annotations) = naming::extract_labels(&container.labels);
        let mounts = vec![Mount {
            container_path: format!("/tmp/path/{}", container.image),
            host_path: PROJECT_PATH_TAG.to_string(),
            readonly: false,
        }];

        let status = ContainerStatus {
            id: container.id.clone(),
            metadata: Some(metadata),
            state: container.state as i32,
            created_at: container.create_at,
            started_at: container.started_at,
            finished_at: container.finished_at,
            exit_code: 0,
            image: Some(ImageSpec {
                image: container.image.clone(),
                annotations: HashMap::new(),
            }),
            image_ref: naming::to_pullable_image_id(&container.image, true),
            reason: String::new(),
            message: String::new(),
            labels,
            annotations,
            mounts,
            log_path: container
                .labels
                .get(CONTAINER_LOG_PATH_LABEL_KEY)
                .cloned()
                .unwrap_or_default(),
        };
        Ok(ContainerStatusResponse {
            status: Some(status),
            info: HashMap::new(),
        })
    }

    pub async fn list_containers(
        &self,
        request: ListContainersRequest,
    ) -> Result<ListContainersResponse> {
        let raw = self.db.get_by_prefix(naming::CONTAINER_ID_PREFIX).await?;
        let mut containers = Vec::with_capacity(raw.len());
        for value in raw {
            let container: SobeyContainer =
                serde_json::from_str(&value).map_err(internal("container-decode-error"))?;
            if container.hostname == self.hostname {
                containers.push(container);
            }
        }
        let containers = container_filter_chain(request.filter.as_ref()).apply(containers);

        let mut result = Vec::with_capacity(containers.len());
        for container in containers {
            let metadata = naming::parse_container_name(&container.name)?;
            let (labels, annotations) = naming::extract_labels(&container.labels);
            result.push(Container {
                id: container.id.clone(),
                pod_sandbox_id: container
                    .labels
                    .get(SANDBOX_ID_LABEL_KEY)
                    .cloned()
                    .unwrap_or_default(),
                metadata: Some(metadata),
                image: Some(ImageSpec {
                    image: container.image.clone(),
                    annotations: HashMap::new(),
                }),
                image_ref: naming::to_pullable_image_id(&container.image, true),
                state: container.state as i32,
                created_at: container.create_at,
                labels,
                annotations,
            });
        }
        Ok(ListContainersResponse { containers: result })
    }
}

fn container_filter_chain(filter: Option<&ContainerFilter>) -> FilterChain<SobeyContainer> {
    let Some(filter) = filter else {
        return FilterChain::new();
    };
    let id = filter.id.clone();
    let sandbox_id = naming::strip_sandbox_id(&filter.pod_sandbox_id).to_string();
    let uid = filter
        .label_selector
        .get(KUBERNETES_POD_UID_LABEL)
        .cloned()
        .unwrap_or_default();
    let state = filter.state.as_ref().map(|value| value.state);

    FilterChain::new()
        .when(!filter.id.is_empty(), move |container: &SobeyContainer| {
            container.id.eq_ignore_ascii_case(&id)
        })
        .when(
            !filter.pod_sandbox_id.is_empty(),
            move |container: &SobeyContainer| {
                container
                    .labels
                    .get(SANDBOX_ID_LABEL_KEY)
                    .is_some_and(|label| {
                        naming::strip_sandbox_id(label).eq_ignore_ascii_case(&sandbox_id)
                    })
            },
        )
        .when(!uid.is_empty(), move |container: &SobeyContainer| {
            container.uid.eq_ignore_ascii_case(&uid)
        })
        .when(state.is_some(), move |container: &SobeyContainer| {
            Some(container.state as i32) == state
        })
}
