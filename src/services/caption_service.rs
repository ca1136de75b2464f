//! src/services/caption_service.rs
//!
//! Caption generator capability and the Gemini `generateContent` adapter.
//! The adapter owns one long-lived HTTP client; every failure inside it
//! converges to the fallback caption, so callers never see an error.

use super::{caption_parser::parse_caption, naming::image_mime_for};
use crate::models::caption::Caption;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

const CAPTION_PROMPT: &str = concat!(
    "Analyze this image and provide a detailed description.\n",
    "Return your response in the following JSON format:\n",
    "{\n",
    "    \"title\": \"A concise, catchy title for this image\",\n",
    "    \"description\": \"A detailed description of what's in the image\"\n",
    "}\n",
    "Just return the JSON with no additional text."
);

/// Produces a best-effort title/description for an image.
#[async_trait]
pub trait CaptionGenerator: Send + Sync {
    /// Never fails: implementations substitute [`Caption::fallback`].
    async fn caption(&self, image: &[u8], filename: &str) -> Caption;
}

#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("GEMINI_API key is not configured")]
    MissingApiKey,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("Gemini request failed: {status} {body}")]
    Status { status: StatusCode, body: String },
    #[error("Gemini returned an error: {0}")]
    Api(String),
    #[error("Gemini returned no text")]
    EmptyResponse,
}

#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub request_timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            endpoint: DEFAULT_GEMINI_ENDPOINT.to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<GeminiApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Option<Vec<Part>>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiApiError {
    message: Option<String>,
}

/// Caption generator backed by the Gemini REST API.
pub struct GeminiCaptioner {
    client: Client,
    config: GeminiConfig,
}

impl GeminiCaptioner {
    pub fn new(config: GeminiConfig) -> Result<Self, CaptionError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        if config.api_key.is_none() {
            info!("GEMINI_API is not set; uploads will receive fallback captions");
        }
        Ok(Self { client, config })
    }

    fn generate_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }

    /// Send the image and prompt, returning the model's raw text answer.
    async fn request_caption(&self, image: &[u8], filename: &str) -> Result<String, CaptionError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(CaptionError::MissingApiKey)?;

        let mime_type = image_mime_for(filename);
        let response = self
            .client
            .post(self.generate_url())
            .header("x-goog-api-key", api_key)
            .json(&json!({
                "contents": [
                    {
                        "role": "user",
                        "parts": [
                            {
                                "inlineData": {
                                    "mimeType": mime_type,
                                    "data": general_purpose::STANDARD.encode(image),
                                }
                            },
                            {"text": CAPTION_PROMPT}
                        ]
                    }
                ],
                "generationConfig": {
                    "temperature": 1,
                    "topP": 0.95,
                    "topK": 64,
                    "maxOutputTokens": 8192,
                    "responseMimeType": "application/json"
                }
            }))
            .send()
            .await?;
        debug!("sent {} ({}) to Gemini for captioning", filename, mime_type);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CaptionError::Status { status, body });
        }

        let payload: GenerateContentResponse = response.json().await?;
        if let Some(message) = payload.error.and_then(|err| err.message) {
            return Err(CaptionError::Api(message));
        }

        let text = payload
            .candidates
            .and_then(|candidates| candidates.into_iter().next())
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts)
            .map(|parts| {
                parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .filter(|text| !text.trim().is_empty())
            .ok_or(CaptionError::EmptyResponse)?;

        info!("Received caption response from Gemini for {}", filename);
        Ok(text)
    }
}

#[async_trait]
impl CaptionGenerator for GeminiCaptioner {
    async fn caption(&self, image: &[u8], filename: &str) -> Caption {
        match self.request_caption(image, filename).await {
            Ok(raw) => parse_caption(&raw, filename),
            Err(err) => {
                error!("Error captioning {} with Gemini: {}", filename, err);
                Caption::fallback(filename)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::caption::INCOMPLETE_DESCRIPTION;
    use axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::post,
    };
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Clone)]
    struct FakeGemini {
        status: AxumStatus,
        reply: Value,
        seen: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    }

    async fn generate(
        State(fake): State<FakeGemini>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        let key = headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        fake.seen.lock().unwrap().push((key, body));
        (fake.status, Json(fake.reply.clone()))
    }

    /// Serve a canned Gemini reply on an ephemeral port; returns the endpoint.
    async fn serve(fake: FakeGemini) -> String {
        let app = Router::new()
            .route("/v1beta/models/{call}", post(generate))
            .with_state(fake);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1beta", addr)
    }

    fn text_reply(text: &str) -> Value {
        json!({"candidates": [{"content": {"parts": [{"text": text}]}}]})
    }

    fn captioner(endpoint: String, api_key: Option<&str>) -> GeminiCaptioner {
        GeminiCaptioner::new(GeminiConfig {
            api_key: api_key.map(str::to_string),
            model: "test-model".into(),
            endpoint,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn fake(status: AxumStatus, reply: Value) -> FakeGemini {
        FakeGemini {
            status,
            reply,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[tokio::test]
    async fn parses_fenced_model_output() {
        let fake = fake(
            AxumStatus::OK,
            text_reply("```json\n{\"title\": \"Cat\", \"description\": \"A cat.\"}\n```"),
        );
        let seen = fake.seen.clone();
        let endpoint = serve(fake).await;

        let caption = captioner(endpoint, Some("secret"))
            .caption(b"\x89PNG", "cat.png")
            .await;
        assert_eq!(caption, Caption::new("Cat", "A cat."));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (key, body) = &seen[0];
        assert_eq!(key.as_deref(), Some("secret"));
        let inline = &body["contents"][0]["parts"][0]["inlineData"];
        assert_eq!(inline["mimeType"], "image/png");
        assert_eq!(inline["data"], general_purpose::STANDARD.encode(b"\x89PNG"));
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
    }

    #[tokio::test]
    async fn joins_multi_part_text() {
        let reply = json!({"candidates": [{"content": {"parts": [
            {"text": "{\"title\": \"Cat\", "},
            {"text": "\"description\": \"A cat.\"}"}
        ]}}]});
        let endpoint = serve(fake(AxumStatus::OK, reply)).await;
        let caption = captioner(endpoint, Some("k")).caption(b"x", "cat.png").await;
        assert_eq!(caption, Caption::new("Cat", "A cat."));
    }

    #[tokio::test]
    async fn missing_fields_use_generic_description() {
        let endpoint = serve(fake(AxumStatus::OK, text_reply(r#"{"title": "Cat"}"#))).await;
        let caption = captioner(endpoint, Some("k")).caption(b"x", "cat.png").await;
        assert_eq!(caption, Caption::new("Image: cat.png", INCOMPLETE_DESCRIPTION));
    }

    #[tokio::test]
    async fn http_errors_fall_back() {
        let endpoint = serve(fake(
            AxumStatus::TOO_MANY_REQUESTS,
            json!({"error": {"message": "quota exceeded"}}),
        ))
        .await;
        let caption = captioner(endpoint, Some("k")).caption(b"x", "cat.png").await;
        assert_eq!(caption, Caption::fallback("cat.png"));
    }

    #[tokio::test]
    async fn empty_candidates_fall_back() {
        let endpoint = serve(fake(AxumStatus::OK, json!({"candidates": []}))).await;
        let caption = captioner(endpoint, Some("k")).caption(b"x", "cat.png").await;
        assert_eq!(caption, Caption::fallback("cat.png"));
    }

    #[tokio::test]
    async fn missing_api_key_falls_back_without_a_request() {
        let fake = fake(AxumStatus::OK, text_reply("{}"));
        let seen = fake.seen.clone();
        let endpoint = serve(fake).await;

        for key in [None, Some("  ")] {
            let caption = captioner(endpoint.clone(), key).caption(b"x", "cat.png").await;
            assert_eq!(caption, Caption::fallback("cat.png"));
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_back() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let caption = captioner(format!("http://{}/v1beta", addr), Some("k"))
            .caption(b"x", "cat.png")
            .await;
        assert_eq!(caption, Caption::fallback("cat.png"));
    }
}
