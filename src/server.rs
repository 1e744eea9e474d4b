//! gRPC plumbing for the CRI services.
//!
//! There is no generated service code here. Each server routes on the gRPC
//! request path and dispatches the matching unary method through
//! [`Grpc`] with a [`ProstCodec`], which is exactly the shape tonic's
//! codegen would produce, just written out, since the message types in
//! [`crate::api`] are hand-written too.
//!
//! Business logic does not belong in this file; every method body is a
//! one-line hop into [`SobeyService`].

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body::Body as HttpBody;
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::{Request as TonicRequest, Response as TonicResponse, Status};
use tower_service::Service;

use crate::api as v1;
use crate::service::SobeyService;

/// Maximum gRPC message size, both directions.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = StdResult<T, E>> + Send + 'static>>;

/// Expands to one routed unary call: a throwaway [`UnaryService`] wrapping
/// the service method, dispatched through a fresh [`Grpc`] with the shim's
/// message-size limits applied.
macro_rules! unary {
    ($server:expr, $request:expr, $method:ident, $Req:ty, $Res:ty) => {{
        struct Handler(Arc<SobeyService>);
        impl UnaryService<$Req> for Handler {
            type Response = $Res;
            type Future = BoxFuture<TonicResponse<$Res>, Status>;
            fn call(&mut self, request: TonicRequest<$Req>) -> Self::Future {
                let service = self.0.clone();
                Box::pin(async move {
                    service
                        .$method(request.into_inner())
                        .await
                        .map(TonicResponse::new)
                })
            }
        }
        let inner = $server.0.clone();
        let request = $request;
        Box::pin(async move {
            let mut grpc = Grpc::new(ProstCodec::default()).apply_max_message_size_config(
                Some(MAX_MESSAGE_SIZE),
                Some(MAX_MESSAGE_SIZE),
            );
            Ok(grpc.unary(Handler(inner), request).await)
        })
    }};
}

/// Response for methods the runtime does not route.
fn unimplemented_response() -> http::Response<BoxBody> {
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header("grpc-status", (tonic::Code::Unimplemented as i32).to_string())
        .header(http::header::CONTENT_TYPE, "application/grpc")
        .body(tonic::codegen::empty_body())
        .unwrap()
}

/// `runtime.v1alpha2.RuntimeService` over a [`SobeyService`].
#[derive(Clone)]
pub struct RuntimeServiceServer(Arc<SobeyService>);

impl RuntimeServiceServer {
    pub fn new(service: Arc<SobeyService>) -> Self {
        RuntimeServiceServer(service)
    }
}

impl<B> Service<http::Request<B>> for RuntimeServiceServer
where
    B: HttpBody + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<StdResult<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        match request.uri().path() {
            "/runtime.v1alpha2.RuntimeService/Version" => {
                unary!(self, request, version, v1::VersionRequest, v1::VersionResponse)
            }
            "/runtime.v1alpha2.RuntimeService/RunPodSandbox" => {
                unary!(
                    self,
                    request,
                    run_pod_sandbox,
                    v1::RunPodSandboxRequest,
                    v1::RunPodSandboxResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/StopPodSandbox" => {
                unary!(
                    self,
                    request,
                    stop_pod_sandbox,
                    v1::StopPodSandboxRequest,
                    v1::StopPodSandboxResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/RemovePodSandbox" => {
                unary!(
                    self,
                    request,
                    remove_pod_sandbox,
                    v1::RemovePodSandboxRequest,
                    v1::RemovePodSandboxResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/PodSandboxStatus" => {
                unary!(
                    self,
                    request,
                    pod_sandbox_status,
                    v1::PodSandboxStatusRequest,
                    v1::PodSandboxStatusResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/ListPodSandbox" => {
                unary!(
                    self,
                    request,
                    list_pod_sandbox,
                    v1::ListPodSandboxRequest,
                    v1::ListPodSandboxResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/CreateContainer" => {
                unary!(
                    self,
                    request,
                    create_container,
                    v1::CreateContainerRequest,
                    v1::CreateContainerResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/StartContainer" => {
                unary!(
                    self,
                    request,
                    start_container,
                    v1::StartContainerRequest,
                    v1::StartContainerResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/StopContainer" => {
                unary!(
                    self,
                    request,
                    stop_container,
                    v1::StopContainerRequest,
                    v1::StopContainerResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/RemoveContainer" => {
                unary!(
                    self,
                    request,
                    remove_container,
                    v1::RemoveContainerRequest,
                    v1::RemoveContainerResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/ListContainers" => {
                unary!(
                    self,
                    request,
                    list_containers,
                    v1::ListContainersRequest,
                    v1::ListContainersResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/ContainerStatus" => {
                unary!(
                    self,
                    request,
                    container_status,
                    v1::ContainerStatusRequest,
                    v1::ContainerStatusResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/UpdateContainerResources" => {
                unary!(
                    self,
                    request,
                    update_container_resources,
                    v1::UpdateContainerResourcesRequest,
                    v1::UpdateContainerResourcesResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/ReopenContainerLog" => {
                unary!(
                    self,
                    request,
                    reopen_container_log,
                    v1::ReopenContainerLogRequest,
                    v1::ReopenContainerLogResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/ExecSync" => {
                unary!(self, request, exec_sync, v1::ExecSyncRequest, v1::ExecSyncResponse)
            }
            "/runtime.v1alpha2.RuntimeService/Exec" => {
                unary!(self, request, exec, v1::ExecRequest, v1::ExecResponse)
            }
            "/runtime.v1alpha2.RuntimeService/Attach" => {
                unary!(self, request, attach, v1::AttachRequest, v1::AttachResponse)
            }
            "/runtime.v1alpha2.RuntimeService/PortForward" => {
                unary!(
                    self,
                    request,
                    port_forward,
                    v1::PortForwardRequest,
                    v1::PortForwardResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/ContainerStats" => {
                unary!(
                    self,
                    request,
                    container_stats,
                    v1::ContainerStatsRequest,
                    v1::ContainerStatsResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/ListContainerStats" => {
                unary!(
                    self,
                    request,
                    list_container_stats,
                    v1::ListContainerStatsRequest,
                    v1::ListContainerStatsResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/UpdateRuntimeConfig" => {
                unary!(
                    self,
                    request,
                    update_runtime_config,
                    v1::UpdateRuntimeConfigRequest,
                    v1::UpdateRuntimeConfigResponse
                )
            }
            "/runtime.v1alpha2.RuntimeService/Status" => {
                unary!(self, request, status, v1::StatusRequest, v1::StatusResponse)
            }
            _ => Box::pin(async move { Ok(unimplemented_response()) }),
        }
    }
}

impl NamedService for RuntimeServiceServer {
    const NAME: &'static str = "runtime.v1alpha2.RuntimeService";
}

/// `runtime.v1alpha2.ImageService` over the same [`SobeyService`].
#[derive(Clone)]
pub struct ImageServiceServer(Arc<SobeyService>);

impl ImageServiceServer {
    pub fn new(service: Arc<SobeyService>) -> Self {
        ImageServiceServer(service)
    }
}

impl<B> Service<http::Request<B>> for ImageServiceServer
where
    B: HttpBody + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<StdResult<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        match request.uri().path() {
            "/runtime.v1alpha2.ImageService/ListImages" => {
                unary!(
                    self,
                    request,
                    list_images,
                    v1::ListImagesRequest,
                    v1::ListImagesResponse
                )
            }
            "/runtime.v1alpha2.ImageService/ImageStatus" => {
                unary!(
                    self,
                    request,
                    image_status,
                    v1::ImageStatusRequest,
                    v1::ImageStatusResponse
                )
            }
            "/runtime.v1alpha2.ImageService/PullImage" => {
                unary!(self, request, pull_image, v1::PullImageRequest, v1::PullImageResponse)
            }
            "/runtime.v1alpha2.ImageService/RemoveImage" => {
                unary!(
                    self,
                    request,
                    remove_image,
                    v1::RemoveImageRequest,
                    v1::RemoveImageResponse
                )
            }
            "/runtime.v1alpha2.ImageService/ImageFsInfo" => {
                unary!(
                    self,
                    request,
                    image_fs_info,
                    v1::ImageFsInfoRequest,
                    v1::ImageFsInfoResponse
                )
            }
            _ => Box::pin(async move { Ok(unimplemented_response()) }),
        }
    }
}

impl NamedService for ImageServiceServer {
    const NAME: &'static str = "runtime.v1alpha2.ImageService";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names_match_the_cri_package() {
        assert_eq!(
            <RuntimeServiceServer as NamedService>::NAME,
            "runtime.v1alpha2.RuntimeService"
        );
        assert_eq!(
            <ImageServiceServer as NamedService>::NAME,
            "runtime.v1alpha2.ImageService"
        );
    }

    #[test]
    fn unknown_methods_answer_unimplemented() {
        let response = unimplemented_response();

        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(
            response.headers().get("grpc-status").unwrap(),
            &(tonic::Code::Unimplemented as i32).to_string()
        );
    }
}
