//! Runtime-level surface: version, status, config updates and the
//! operations the shim deliberately does not provide.

use std::collections::HashMap;

use tonic::Status;

use crate::api::{
    AttachRequest, AttachResponse, ContainerFilter, ContainerStats, ContainerStatsRequest,
    ContainerStatsResponse, ContainerAttributes, CpuUsage, ExecRequest, ExecResponse,
    ExecSyncRequest, ExecSyncResponse, FilesystemIdentifier, FilesystemUsage,
    ListContainerStatsRequest, ListContainerStatsResponse, ListContainersRequest, MemoryUsage,
    PortForwardRequest, PortForwardResponse, ReopenContainerLogRequest,
    ReopenContainerLogResponse, RuntimeCondition, RuntimeStatus, StatusRequest, StatusResponse,
    UInt64Value, UpdateContainerResourcesRequest, UpdateContainerResourcesResponse,
    UpdateRuntimeConfigRequest, UpdateRuntimeConfigResponse, VersionRequest, VersionResponse,
    NETWORK_READY, RUNTIME_READY,
};
use crate::error::Result;
use crate::service::{now_nanos, SobeyService};

/// CRI version the kubelet expects to negotiate.
const KUBELET_API_VERSION: &str = "0.1.0";
/// Name of the underlying container runtime.
const RUNTIME_NAME: &str = "sobey";
const RUNTIME_VERSION: &str = "1.0.0";
const RUNTIME_API_VERSION: &str = "1.0.0";

impl SobeyService {
    pub async fn version(&self, _request: VersionRequest) -> Result<VersionResponse> {
        Ok(VersionResponse {
            version: KUBELET_API_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: RUNTIME_VERSION.to_string(),
            runtime_api_version: RUNTIME_API_VERSION.to_string(),
        })
    }

    pub async fn status(&self, _request: StatusRequest) -> Result<StatusResponse> {
        let conditions = vec![
            RuntimeCondition {
                r#type: RUNTIME_READY.to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
            RuntimeCondition {
                r#type: NETWORK_READY.to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
        ];
        Ok(StatusResponse {
            status: Some(RuntimeStatus { conditions }),
            info: HashMap::new(),
        })
    }

    pub async fn update_runtime_config(
        &self,
        _request: UpdateRuntimeConfigRequest,
    ) -> Result<UpdateRuntimeConfigResponse> {
        Ok(UpdateRuntimeConfigResponse {})
    }

    pub async fn reopen_container_log(
        &self,
        _request: ReopenContainerLogRequest,
    ) -> Result<ReopenContainerLogResponse> {
        Ok(ReopenContainerLogResponse {})
    }

    /// Per-container stats with placeholder usage values; real collection is
    /// a future concern.
    pub async fn list_container_stats(
        &self,
        request: ListContainerStatsRequest,
    ) -> Result<ListContainerStatsResponse> {
        let filter = request.filter.map(|filter| ContainerFilter {
            id: filter.id,
            pod_sandbox_id: filter.pod_sandbox_id,
            label_selector: filter.label_selector,
            state: None,
        });
        let containers = self.list_containers(ListContainersRequest { filter }).await?;

        let timestamp = now_nanos();
        let stats = containers
            .containers
            .into_iter()
            .map(|container| ContainerStats {
                attributes: Some(ContainerAttributes {
                    id: container.id,
                    metadata: container.metadata,
                    labels: container.labels,
                    annotations: container.annotations,
                }),
                cpu: Some(CpuUsage {
                    timestamp,
                    usage_core_nano_seconds: Some(UInt64Value { value: 0 }),
                }),
                memory: Some(MemoryUsage {
                    timestamp,
                    working_set_bytes: Some(UInt64Value { value: 0 }),
                }),
                writable_layer: Some(FilesystemUsage {
                    timestamp,
                    fs_id: Some(FilesystemIdentifier {
                        mountpoint: String::new(),
                    }),
                    used_bytes: Some(UInt64Value { value: 0 }),
                    inodes_used: Some(UInt64Value { value: 0 }),
                }),
            })
            .collect();
        Ok(ListContainerStatsResponse { stats })
    }

    pub async fn exec_sync(&self, _request: ExecSyncRequest) -> Result<ExecSyncResponse> {
        Err(Status::unimplemented("method ExecSync not implemented"))
    }

    pub async fn exec(&self, _request: ExecRequest) -> Result<ExecResponse> {
        Err(Status::unimplemented("method Exec not implemented"))
    }

    pub async fn attach(&self, _request: AttachRequest) -> Result<AttachResponse> {
        Err(Status::unimplemented("method Attach not implemented"))
    }

    pub async fn port_forward(
        &self,
        _request: PortForwardRequest,
    ) -> Result<PortForwardResponse> {
        Err(Status::unimplemented("method PortForward not implemented"))
    }

    pub async fn update_container_resources(
        &self,
        _request: UpdateContainerResourcesRequest,
    ) -> Result<UpdateContainerResourcesResponse> {
        Err(Status::unimplemented(
            "method UpdateContainerResources not implemented",
        ))
    }

    pub async fn container_stats(
        &self,
        _request: ContainerStatsRequest,
    ) -> Result<ContainerStatsResponse> {
        Err(Status::unimplemented("method ContainerStats not implemented"))
    }
}
