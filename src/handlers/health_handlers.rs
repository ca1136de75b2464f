//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata index and blob storage

use crate::services::pipeline::EnrichmentPipeline;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Liveness probe; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Pings the metadata index and round-trips a probe file through the
/// content store. 200 when both pass, 503 otherwise. The caption service is
/// not checked: captioning failures never fail an upload.
pub async fn readyz(State(pipeline): State<EnrichmentPipeline>) -> impl IntoResponse {
    let index_check = match pipeline.metadata_index().ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(err) => CheckStatus::failed(format!("error: {}", err)),
    };
    let storage_check = match pipeline.content_store().probe().await {
        Ok(()) => CheckStatus::ok(),
        Err(err) => CheckStatus::failed(format!("error: {}", err)),
    };

    let overall_ok = index_check.ok && storage_check.ok;

    let mut checks = HashMap::new();
    checks.insert("index", index_check);
    checks.insert("storage", storage_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::caption::Caption,
        services::{
            caption_service::CaptionGenerator, content_store::DiskContentStore,
            metadata_index::SqliteMetadataIndex,
        },
    };
    use async_trait::async_trait;
    use axum::{body::to_bytes, response::Response};
    use serde_json::Value;
    use std::{sync::Arc, time::Duration};

    struct NoCaptions;

    #[async_trait]
    impl CaptionGenerator for NoCaptions {
        async fn caption(&self, _image: &[u8], filename: &str) -> Caption {
            Caption::fallback(filename)
        }
    }

    async fn pipeline_at(path: &std::path::Path) -> EnrichmentPipeline {
        EnrichmentPipeline::new(
            Arc::new(DiskContentStore::new(path)),
            Arc::new(SqliteMetadataIndex::in_memory().await),
            Arc::new(NoCaptions),
            Duration::from_secs(1),
        )
    }

    async fn json_of(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ready_when_index_and_storage_work() {
        let dir = tempfile::tempdir().unwrap();
        let response = readyz(State(pipeline_at(dir.path()).await))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_of(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["checks"]["index"]["ok"], true);
        assert_eq!(body["checks"]["storage"]["ok"], true);
    }

    #[tokio::test]
    async fn unavailable_when_storage_is_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let response = readyz(State(pipeline_at(&blocker).await))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = json_of(response).await;
        assert_eq!(body["checks"]["storage"]["ok"], false);
        assert_eq!(body["checks"]["index"]["ok"], true);
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_of(response).await["status"], "ok");
    }
}
