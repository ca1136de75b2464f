//! Defines routes for photo upload, browsing and administration.
//!
//! ## Structure
//! - **Photos**
//!   - `GET    /images`: list every indexed photo with its caption
//!   - `POST   /images`: multipart upload (`file`, `user`, `allowed_users`)
//!   - `GET    /images/{name}`: download a photo
//!   - `DELETE /images/{name}`: delete a photo, its caption and index entries
//!   - `GET    /images/{name}/access`: current reader list
//!   - `PUT    /images/{name}/access`: replace the reader list
//!   - `GET    /users/{user}/images`: photos owned by one user
//!
//! - **Operations**
//!   - `GET    /healthz`, `GET /readyz`
//!   - `POST   /admin/reconcile?prune=`: find index entries without a blob

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        image_handlers::{
            delete_image, get_access, get_image, list_images, list_user_images, put_access,
            reconcile, upload_image,
        },
    },
    services::pipeline::EnrichmentPipeline,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router; handlers share the `EnrichmentPipeline` as state.
pub fn routes() -> Router<EnrichmentPipeline> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/images", get(list_images).post(upload_image))
        .route("/images/{name}", get(get_image).delete(delete_image))
        .route("/images/{name}/access", get(get_access).put(put_access))
        .route("/users/{user}/images", get(list_user_images))
        .route("/admin/reconcile", post(reconcile))
}
