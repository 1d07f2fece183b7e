//! Gemini REST invoker (`generateContent`)
//!
//! Two endpoint styles:
//! - API key: `generativelanguage.googleapis.com`, key in `x-goog-api-key`
//! - Regional: `<region>-aiplatform.googleapis.com` under the project, with a
//!   bearer access token

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use pixtag_common::config::ModelConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{ModelInvoker, ModelRequest};
use crate::error::ModelError;

const API_KEY_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Credentials {
    ApiKey(String),
    Bearer(String),
}

#[derive(Debug)]
pub struct GeminiInvoker {
    model: String,
    endpoint: String,
    credentials: Credentials,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig<'a>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part<'a> {
    #[serde(rename_all = "camelCase")]
    InlineData { inline_data: Blob<'a> },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_mime_type: &'static str,
    response_schema: &'a Value,
    top_k: u32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl GeminiInvoker {
    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        let (endpoint, credentials) = match (&config.region, &config.project, &config.access_token) {
            (Some(region), Some(project), Some(token)) => {
                let base = config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com/v1", region));
                (
                    format!(
                        "{}/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
                        base.trim_end_matches('/'),
                        project,
                        region,
                        config.name
                    ),
                    Credentials::Bearer(token.clone()),
                )
            }
            _ => {
                let key = config.api_key.clone().ok_or_else(|| {
                    ModelError::NotConfigured(
                        "set model.api_key, or model.region + model.project + model.access_token"
                            .to_string(),
                    )
                })?;
                let base = config.base_url.as_deref().unwrap_or(API_KEY_BASE_URL);
                (
                    format!(
                        "{}/models/{}:generateContent",
                        base.trim_end_matches('/'),
                        config.name
                    ),
                    Credentials::ApiKey(key),
                )
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ModelError::RequestFailed(e.to_string()))?;

        Ok(Self {
            model: config.name.clone(),
            endpoint,
            credentials,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn extract_json(response: GenerateResponse) -> Result<Value, ModelError> {
    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        ModelError::Parse(format!(
            "no candidates returned (prompt feedback: {})",
            response.prompt_feedback.unwrap_or(Value::Null)
        ))
    })?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(ModelError::Parse(format!(
            "empty candidate (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }

    serde_json::from_str(&text).map_err(|e| ModelError::Parse(format!("response is not JSON: {}", e)))
}

#[async_trait]
impl ModelInvoker for GeminiInvoker {
    async fn invoke(&self, request: &ModelRequest) -> Result<Value, ModelError> {
        let mut parts: Vec<Part> = request
            .images
            .iter()
            .map(|image| Part::InlineData {
                inline_data: Blob {
                    mime_type: &image.mime_type,
                    data: STANDARD.encode(&image.bytes),
                },
            })
            .collect();
        parts.push(Part::Text {
            text: &request.prompt,
        });

        let body = GenerateRequest {
            contents: vec![Content { role: "user", parts }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                response_schema: &request.response_schema,
                top_k: 1,
                top_p: 0.2,
            },
        };

        tracing::debug!(
            model = %self.model,
            images = request.images.len(),
            "Invoking model"
        );

        let builder = self.client.post(&self.endpoint).json(&body);
        let builder = match &self.credentials {
            Credentials::ApiKey(key) => builder.header("x-goog-api-key", key),
            Credentials::Bearer(token) => builder.bearer_auth(token),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| ModelError::RequestFailed(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ModelError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ModelError::RequestFailed(e.to_string()))?;

        if !(200..300).contains(&status) {
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ModelError::Api { status, message });
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| ModelError::Parse(e.to_string()))?;
        extract_json(parsed)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InlineImage;
    use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn api_key_config(base_url: &str) -> ModelConfig {
        ModelConfig {
            api_key: Some("test-key".to_string()),
            base_url: Some(base_url.to_string()),
            ..ModelConfig::default()
        }
    }

    fn request() -> ModelRequest {
        ModelRequest {
            images: vec![InlineImage {
                mime_type: "image/png".to_string(),
                bytes: vec![1, 2, 3],
            }],
            prompt: "image0\nClassify.".to_string(),
            response_schema: json!({ "type": "ARRAY" }),
        }
    }

    /// Fake generateContent endpoint; records the last request body
    async fn spawn_model(status: StatusCode, reply: Value) -> (String, Arc<Mutex<Option<(HeaderMap, Value)>>>) {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let app = Router::new().route(
            "/models/:call",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let sink = sink.clone();
                let reply = reply.clone();
                async move {
                    *sink.lock().unwrap() = Some((headers, body));
                    (status, Json(reply))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    #[test]
    fn test_endpoint_selection() {
        let invoker = GeminiInvoker::from_config(&ModelConfig {
            api_key: Some("k".to_string()),
            ..ModelConfig::default()
        })
        .unwrap();
        assert_eq!(
            invoker.endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );

        let invoker = GeminiInvoker::from_config(&ModelConfig {
            region: Some("us-central1".to_string()),
            project: Some("shop".to_string()),
            access_token: Some("t".to_string()),
            ..ModelConfig::default()
        })
        .unwrap();
        assert_eq!(
            invoker.endpoint(),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/shop/locations/us-central1/publishers/google/models/gemini-2.0-flash:generateContent"
        );

        assert!(matches!(
            GeminiInvoker::from_config(&ModelConfig::default()),
            Err(ModelError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_invoke_sends_inline_images_and_parses_json() {
        let reply = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "[{\"type\": \"silo\"}]" }] },
                "finishReason": "STOP"
            }]
        });
        let (base, seen) = spawn_model(StatusCode::OK, reply).await;
        let invoker = GeminiInvoker::from_config(&api_key_config(&base)).unwrap();

        let value = invoker.invoke(&request()).await.unwrap();
        assert_eq!(value, json!([{ "type": "silo" }]));

        let (headers, body) = seen.lock().unwrap().take().unwrap();
        assert_eq!(headers["x-goog-api-key"], "test-key");
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[0]["inlineData"]["data"], "AQID");
        assert_eq!(parts[1]["text"], "image0\nClassify.");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["topK"], 1);
        assert_eq!(body["generationConfig"]["responseSchema"], json!({ "type": "ARRAY" }));
    }

    #[tokio::test]
    async fn test_invoke_maps_api_errors() {
        let (base, _) = spawn_model(
            StatusCode::BAD_REQUEST,
            json!({ "error": { "code": 400, "message": "bad schema" } }),
        )
        .await;
        let invoker = GeminiInvoker::from_config(&api_key_config(&base)).unwrap();

        match invoker.invoke(&request()).await {
            Err(ModelError::Api { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "bad schema");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let (base, _) = spawn_model(StatusCode::TOO_MANY_REQUESTS, json!({})).await;
        let invoker = GeminiInvoker::from_config(&api_key_config(&base)).unwrap();
        assert!(matches!(
            invoker.invoke(&request()).await,
            Err(ModelError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_blocked_prompt_is_parse_error() {
        let response: GenerateResponse = serde_json::from_value(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        }))
        .unwrap();
        assert!(matches!(extract_json(response), Err(ModelError::Parse(_))));
    }
}
