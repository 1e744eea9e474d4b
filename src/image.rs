//! Image service.
//!
//! Images are plain artifacts fetched over HTTP from the configured
//! repository and dropped under `/var/lib/sobey/images`; the executor takes
//! it from there. Listing and status are placeholder surfaces for now.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;
use tonic::Status;

use crate::api::{
    ImageFsInfoRequest, ImageFsInfoResponse, ImageStatusRequest, ImageStatusResponse,
    ListImagesRequest, ListImagesResponse, PullImageRequest, PullImageResponse,
    RemoveImageRequest, RemoveImageResponse,
};
use crate::error::{internal, Result};
use crate::naming;
use crate::os::OsInterface;
use crate::service::SobeyService;

/// Pulled image artifacts land here.
pub const SERVER_IMAGE_DIR: &str = "/var/lib/sobey/images";

/// File name an image reference is stored under.
fn artifact_name(image: &str) -> String {
    image.replace(['/', ':'], "_")
}

impl SobeyService {
    pub(crate) fn image_artifact_path(&self, image: &str) -> PathBuf {
        self.image_dir.join(artifact_name(image))
    }

    pub async fn pull_image(&self, request: PullImageRequest) -> Result<PullImageResponse> {
        let image = request.image.unwrap_or_default().image;
        if image.is_empty() {
            return Err(Status::invalid_argument("image reference is required"));
        }
        let normalized = naming::normalize_image(&image).to_string();

        let url = format!("{}/{}", self.repo.trim_end_matches('/'), normalized);
        let response = reqwest::get(&url)
            .await
            .map_err(internal("image-download-error"))?;
        if !response.status().is_success() {
            return Err(Status::internal(format!(
                "image download failed with status {} for {url}",
                response.status()
            )));
        }
        let payload: Bytes = response.bytes().await.map_err(internal("image-read-error"))?;

        let destination = self.image_artifact_path(&normalized);
        self.os
            .write_file(&destination, &payload, 0o644)
            .await
            .map_err(internal("image-write-error"))?;
        tracing::info!(image = %image, path = %destination.display(), "pulled image");

        Ok(PullImageResponse { image_ref: image })
    }

    pub async fn remove_image(&self, request: RemoveImageRequest) -> Result<RemoveImageResponse> {
        let image = request.image.unwrap_or_default().image;
        if image.is_empty() {
            return Ok(RemoveImageResponse {});
        }
        let normalized = naming::normalize_image(&image).to_string();
        let path = self.image_artifact_path(&normalized);
        match self.os.remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(internal("image-remove-error")(err)),
        }
        Ok(RemoveImageResponse {})
    }

    pub async fn list_images(&self, _request: ListImagesRequest) -> Result<ListImagesResponse> {
        Ok(ListImagesResponse { images: Vec::new() })
    }

    pub async fn image_status(&self, _request: ImageStatusRequest) -> Result<ImageStatusResponse> {
        Ok(ImageStatusResponse {
            image: None,
            info: HashMap::new(),
        })
    }

    pub async fn image_fs_info(
        &self,
        _request: ImageFsInfoRequest,
    ) -> Result<ImageFsInfoResponse> {
        Ok(ImageFsInfoResponse {
            image_filesystems: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ImageSpec;
    use crate::testing::ready_fixture;

    #[test]
    fn artifact_names_are_flattened() {
        assert_eq!(artifact_name("nginx"), "nginx");
        assert_eq!(artifact_name("library/nginx:1.25"), "library_nginx_1.25");
    }

    #[tokio::test]
    async fn remove_image_is_idempotent() {
        let fixture = ready_fixture().await;

        fixture
            .service
            .remove_image(RemoveImageRequest {
                image: Some(ImageSpec {
                    image: "nginx:1.25".to_string(),
                    annotations: HashMap::new(),
                }),
            })
            .await
            .unwrap();

        // And with no image at all.
        fixture
            .service
            .remove_image(RemoveImageRequest { image: None })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pull_requires_an_image_reference() {
        let fixture = ready_fixture().await;

        let err = fixture
            .service
            .pull_image(PullImageRequest {
                image: None,
                auth: None,
                sandbox_config: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
