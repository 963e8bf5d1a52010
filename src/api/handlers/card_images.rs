use crate::api::error::AppError;
use crate::utils::auth::Claims;
use axum::{
    Extension, Json,
    extract::{Multipart, State},
};
use futures::TryStreamExt;
use serde::Serialize;
use tokio_util::io::StreamReader;
use utoipa::ToSchema;

/// Multipart form accepted by the upload endpoint
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct UploadCardImageForm {
    #[schema(value_type = String, format = Binary)]
    pub image: Vec<u8>,
}

#[derive(Serialize, ToSchema)]
pub struct UploadCardImageResponse {
    pub url: String,
    pub id: i32,
    /// `true` when identical content was already stored and its file reused
    pub duplicate: bool,
}

#[utoipa::path(
    post,
    path = "/board/api/upload_card_image/",
    request_body(content = UploadCardImageForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Image stored or deduplicated", body = UploadCardImageResponse),
        (status = 400, description = "No file in the `image` field or file rejected"),
        (status = 401, description = "Authentication required"),
        (status = 413, description = "File too large")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "card_images"
)]
pub async fn upload_card_image(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    mut multipart: Multipart,
) -> Result<Json<UploadCardImageResponse>, AppError> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        let err_msg = e.to_string();
        if err_msg.contains("length limit exceeded") {
            AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
        } else {
            AppError::InvalidInput(err_msg)
        }
    })? {
        if field.name() != Some("image") {
            continue;
        }

        // A form field without a filename is not a file upload
        let filename = match field.file_name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => continue,
        };

        let body_with_io_error = field.map_err(std::io::Error::other);
        let reader = StreamReader::new(body_with_io_error);

        let outcome = state
            .card_images
            .accept_upload(Some(claims.sub.clone()), &filename, reader)
            .await?;

        return Ok(Json(UploadCardImageResponse {
            url: outcome.url,
            id: outcome.image.id,
            duplicate: outcome.duplicate,
        }));
    }

    Err(AppError::InvalidInput(
        "No file uploaded (field name should be \"image\").".to_string(),
    ))
}
