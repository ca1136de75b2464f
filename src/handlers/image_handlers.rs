//! HTTP handlers for photo upload, listing, download, deletion and access
//! control. Everything past form parsing is delegated to `EnrichmentPipeline`.

use crate::{
    errors::AppError,
    models::asset::AssetView,
    services::pipeline::{EnrichmentPipeline, ReconcileReport},
};
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Owner recorded when the form carries no `user` field.
pub const DEFAULT_USER: &str = "default";

/// Fields collected from a multipart upload form.
#[derive(Debug, Default)]
struct UploadForm {
    file_name: Option<String>,
    data: Option<Bytes>,
    user: Option<String>,
    allowed_users: Option<Vec<String>>,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, AppError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("could not read form: {}", err)))?
    {
        match field.name() {
            Some("file") => {
                form.file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::bad_request(format!("could not read file: {}", err)))?;
                form.data = Some(data);
            }
            Some("user") => {
                let user = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("could not read user: {}", err)))?;
                let user = user.trim();
                if !user.is_empty() {
                    form.user = Some(user.to_string());
                }
            }
            Some("allowed_users") => {
                let users = field.text().await.map_err(|err| {
                    AppError::bad_request(format!("could not read allowed_users: {}", err))
                })?;
                form.allowed_users
                    .get_or_insert_with(Vec::new)
                    .extend(users.split(',').map(str::to_string));
            }
            _ => {}
        }
    }
    Ok(form)
}

/// `POST /images`: store, caption and index one photo.
///
/// 201 with the receipt, or 204 when the form carried no usable file.
pub async fn upload_image(
    State(pipeline): State<EnrichmentPipeline>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let form = read_upload_form(multipart).await?;
    let user = form.user.as_deref().unwrap_or(DEFAULT_USER);
    // A blank `allowed_users` field means unrestricted, not "nobody".
    let allowed_users = form
        .allowed_users
        .filter(|users| users.iter().any(|user| !user.trim().is_empty()));

    let receipt = pipeline
        .upload(
            form.data.unwrap_or_default(),
            form.file_name.as_deref(),
            user,
            allowed_users,
        )
        .await?;

    Ok(match receipt {
        Some(receipt) => (StatusCode::CREATED, Json(receipt)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// `GET /images`
pub async fn list_images(
    State(pipeline): State<EnrichmentPipeline>,
) -> Result<Json<Vec<AssetView>>, AppError> {
    Ok(Json(pipeline.list_assets().await?))
}

/// `GET /users/{user}/images`
pub async fn list_user_images(
    State(pipeline): State<EnrichmentPipeline>,
    Path(user): Path<String>,
) -> Result<Json<Vec<AssetView>>, AppError> {
    Ok(Json(pipeline.list_assets_for(&user).await?))
}

/// `GET /images/{name}`: raw bytes with a content type derived from the extension.
pub async fn get_image(
    State(pipeline): State<EnrichmentPipeline>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let (bytes, content_type) = pipeline.get_asset(&name).await?;

    let mut response = bytes.into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    Ok(response)
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub name: String,
    pub removed: u64,
}

/// `DELETE /images/{name}`: idempotent; reports removed index entries.
pub async fn delete_image(
    State(pipeline): State<EnrichmentPipeline>,
    Path(name): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let removed = pipeline.delete(&name).await?;
    Ok(Json(DeleteResponse { name, removed }))
}

#[derive(Debug, Serialize)]
pub struct AccessResponse {
    pub name: String,
    pub allowed_users: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct AccessUpdate {
    pub allowed_users: Vec<String>,
}

/// `GET /images/{name}/access`; `allowed_users` is null when unrestricted.
pub async fn get_access(
    State(pipeline): State<EnrichmentPipeline>,
    Path(name): Path<String>,
) -> Result<Json<AccessResponse>, AppError> {
    let allowed_users = pipeline.access(&name).await?;
    Ok(Json(AccessResponse {
        name,
        allowed_users,
    }))
}

/// `PUT /images/{name}/access`: replace the reader list.
pub async fn put_access(
    State(pipeline): State<EnrichmentPipeline>,
    Path(name): Path<String>,
    Json(update): Json<AccessUpdate>,
) -> Result<Json<AccessResponse>, AppError> {
    let users = pipeline.update_access(&name, update.allowed_users).await?;
    Ok(Json(AccessResponse {
        name,
        allowed_users: Some(users),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    pub prune: Option<bool>,
}

/// `POST /admin/reconcile?prune=true|false`
pub async fn reconcile(
    State(pipeline): State<EnrichmentPipeline>,
    Query(params): Query<ReconcileQuery>,
) -> Result<Json<ReconcileReport>, AppError> {
    Ok(Json(pipeline.reconcile(params.prune.unwrap_or(false)).await?))
}
