use crate::http::build_client_with_timeout;
use crate::llm::{GenerateRequest, Generator, LlmError, Part};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

/// Soft deadline per model call; configuration can raise but not lower it.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(30);

impl LlmConfig {
    pub fn from_env() -> Self {
        let timeout = std::env::var("AI_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(MIN_TIMEOUT)
            .max(MIN_TIMEOUT);
        Self {
            api_url: std::env::var("GEMINI_API_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into()),
            api_key: std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            model: std::env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-1.5-flash".into()),
            timeout,
        }
    }
}

pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client_with_timeout(config.timeout + Duration::from_secs(5)),
            config,
        }
    }
}

#[async_trait]
impl Generator for LlmClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, LlmError> {
        let api_key = self.config.api_key.as_deref().ok_or(LlmError::MissingApiKey)?;
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.api_url.trim_end_matches('/'),
            self.config.model
        );

        let body = GeminiRequest {
            contents: vec![Content {
                role: "user",
                parts: request.parts.iter().map(WirePart::from).collect(),
            }],
            generation_config: GenerationConfig {
                temperature: request.sampling.temperature,
                top_p: request.sampling.top_p,
                top_k: request.sampling.top_k,
                max_output_tokens: request.sampling.max_output_tokens,
                response_mime_type: "application/json",
            },
        };

        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(target = "inventory.llm", %status, body = %detail, "model_call_rejected");
            return Err(LlmError::Http(format!("HTTP {status}")));
        }

        let payload: GeminiResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        let text = payload
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("missing text".into()))?;

        Ok(text)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<WirePart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WirePart<'a> {
    Text {
        text: &'a str,
    },
    #[serde(rename_all = "camelCase")]
    Inline {
        inline_data: WireInlineData<'a>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

impl<'a> From<&'a Part> for WirePart<'a> {
    fn from(part: &'a Part) -> Self {
        match part {
            Part::Text(text) => WirePart::Text { text },
            Part::InlineData { mime_type, data } => WirePart::Inline {
                inline_data: WireInlineData { mime_type, data },
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
    response_mime_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Sampling;
    use axum::{Json, Router, http::HeaderMap, routing::post};
    use serde_json::{Value, json};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn client(api_url: String, api_key: Option<&str>) -> LlmClient {
        LlmClient::new(LlmConfig {
            api_url,
            api_key: api_key.map(str::to_string),
            model: "test-model".into(),
            timeout: MIN_TIMEOUT,
        })
    }

    #[tokio::test]
    async fn sends_inline_parts_and_sampling() {
        let app = Router::new().route(
            "/models/test-model:generateContent",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers.get("x-goog-api-key").unwrap(), "k-1");
                let parts = &body["contents"][0]["parts"];
                assert_eq!(parts[0]["text"], json!("describe"));
                assert_eq!(parts[1]["inlineData"]["mimeType"], json!("image/jpeg"));
                assert_eq!(body["generationConfig"]["topK"], json!(40));
                assert_eq!(body["generationConfig"]["responseMimeType"], json!("application/json"));
                Json(json!({
                    "candidates": [{"content": {"parts": [{"text": "{\"ok\":"}, {"text": "true}"}]}}]
                }))
            }),
        );
        let root = serve(app).await;
        let request = GenerateRequest {
            parts: vec![
                Part::Text("describe".into()),
                Part::InlineData {
                    mime_type: "image/jpeg".into(),
                    data: "AAAA".into(),
                },
            ],
            sampling: Sampling::default(),
        };
        let text = client(root, Some("k-1")).generate(&request).await.unwrap();
        assert_eq!(text, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn missing_key_fails_before_network() {
        let request = GenerateRequest {
            parts: vec![Part::Text("hi".into())],
            sampling: Sampling::default(),
        };
        let err = client("http://127.0.0.1:9".into(), None)
            .generate(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MissingApiKey));
    }

    #[tokio::test]
    async fn empty_candidates_are_invalid() {
        let app = Router::new().route(
            "/models/test-model:generateContent",
            post(|| async { Json(json!({"candidates": []})) }),
        );
        let root = serve(app).await;
        let request = GenerateRequest {
            parts: vec![Part::Text("hi".into())],
            sampling: Sampling::default(),
        };
        let err = client(root, Some("k")).generate(&request).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }
}
