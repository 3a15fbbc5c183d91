//! Google Gemini implementation of the [`Generator`] contract.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::error::{FailureKind, GenerationFailure};
use crate::invoker::{GenerationRequest, Generator, OutputMode, PromptPart};
use crate::security::SecretValue;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone)]
pub struct GeminiGenerator {
    model_id: String,
    api_key: SecretValue,
    base_url: String,
    temperature: Option<f32>,
    client: Client,
}

impl GeminiGenerator {
    pub fn new(model_id: impl Into<String>, api_key: SecretValue) -> Self {
        Self {
            model_id: model_id.into(),
            api_key,
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            temperature: Some(0.0),
            client: Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model_id)
    }

    fn build_body(&self, request: &GenerationRequest) -> GeminiRequest {
        let engine = base64::engine::general_purpose::STANDARD;
        let parts = request
            .parts
            .iter()
            .map(|part| match part {
                PromptPart::Text(text) => GeminiPart::Text { text: text.clone() },
                PromptPart::InlineMedia { mime_type, data } => GeminiPart::InlineData {
                    inline_data: GeminiInlineData {
                        mime_type: mime_type.clone(),
                        data: engine.encode(data),
                    },
                },
            })
            .collect();

        let (response_mime_type, response_schema) = match &request.output {
            OutputMode::FreeText => (None, None),
            OutputMode::Structured(schema) => {
                (Some("application/json".to_string()), Some(schema.clone()))
            }
        };

        GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts,
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart::Text {
                    text: request.instructions.clone(),
                }],
            }),
            generation_config: Some(GeminiGenerationConfig {
                temperature: self.temperature,
                response_mime_type,
                response_schema,
            }),
        }
    }
}

fn classify_status(status: StatusCode) -> FailureKind {
    match status.as_u16() {
        401 | 403 => FailureKind::Auth,
        402 | 429 => FailureKind::Quota,
        400..=499 => FailureKind::Request,
        500..=599 => FailureKind::Server,
        _ => FailureKind::Malformed,
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    #[instrument(name = "gemini.generate", skip_all, fields(model = %self.model_id, role = %request.role))]
    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationFailure> {
        let body = self.build_body(&request);
        debug!(
            parts = request.parts.len(),
            media = request.media_count(),
            structured = request.output.schema().is_some(),
            "sending generateContent request"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                error!(error = %err, "failed to reach Gemini API");
                GenerationFailure::transport(err.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            error!(%status, error = %error_text, "Gemini API returned error status");
            return Err(GenerationFailure::new(
                classify_status(status),
                format!("HTTP {status}: {error_text}"),
            ));
        }

        let parsed: GeminiResponse = response.json().await.map_err(|err| {
            error!(error = %err, "failed to decode Gemini response");
            GenerationFailure::new(FailureKind::Malformed, err.to_string())
        })?;

        Ok(parsed.text())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        inline_data: GeminiInlineData,
    },
    Other(serde_json::Value),
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

impl GeminiResponse {
    /// Text parts of the first candidate, concatenated. Empty when the model
    /// returned nothing usable; stages apply their own fallbacks.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        GeminiPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::AgentRole;
    use mockito::Matcher;

    fn request(output: OutputMode) -> GenerationRequest {
        GenerationRequest {
            role: AgentRole::Solver,
            instructions: "be precise".into(),
            parts: vec![
                PromptPart::text("problem"),
                PromptPart::InlineMedia {
                    mime_type: "image/png".into(),
                    data: b"png".to_vec(),
                },
            ],
            output,
        }
    }

    #[test]
    fn body_carries_schema_and_inline_media() {
        let generator = GeminiGenerator::new("test-model", SecretValue::new("key"));
        let schema = serde_json::json!({"type": "ARRAY"});
        let body = generator.build_body(&request(OutputMode::Structured(schema.clone())));
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["generationConfig"]["responseSchema"], schema);
        assert_eq!(
            value["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "be precise");
        assert_eq!(value["contents"][0]["parts"][0]["text"], "problem");
        assert_eq!(
            value["contents"][0]["parts"][1]["inline_data"]["data"],
            "cG5n"
        );
    }

    #[test]
    fn debug_output_hides_api_key() {
        let generator = GeminiGenerator::new("test-model", SecretValue::new("AIza-live-key"));
        let rendered = format!("{generator:?}");
        assert!(rendered.contains("test-model"));
        assert!(!rendered.contains("AIza-live-key"));
    }

    #[test]
    fn free_text_omits_schema() {
        let generator = GeminiGenerator::new("test-model", SecretValue::new("key"));
        let body = generator.build_body(&request(OutputMode::FreeText));
        let value = serde_json::to_value(&body).unwrap();
        assert!(value["generationConfig"].get("responseSchema").is_none());
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), FailureKind::Auth);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            FailureKind::Quota
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            FailureKind::Server
        );
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), FailureKind::Request);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), FailureKind::Request);
    }

    #[tokio::test]
    async fn generate_joins_candidate_text_parts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/models/test-model:generateContent")
            .match_header("x-goog-api-key", "secret")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "generationConfig": {"temperature": 0.0}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"F = "},{"text":"6 N"}]}}]}"#,
            )
            .create_async()
            .await;

        let generator =
            GeminiGenerator::new("test-model", SecretValue::new("secret")).with_base_url(server.url());
        let text = generator
            .generate(request(OutputMode::FreeText))
            .await
            .expect("generation should succeed");

        assert_eq!(text, "F = 6 N");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_candidates_yield_empty_text() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/models/test-model:generateContent")
            .with_status(200)
            .with_body(r#"{"candidates":[]}"#)
            .create_async()
            .await;

        let generator =
            GeminiGenerator::new("test-model", SecretValue::new("k")).with_base_url(server.url());
        let text = generator.generate(request(OutputMode::FreeText)).await.unwrap();
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn quota_errors_are_classified() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/models/test-model:generateContent")
            .with_status(429)
            .with_body("RESOURCE_EXHAUSTED")
            .create_async()
            .await;

        let generator =
            GeminiGenerator::new("test-model", SecretValue::new("k")).with_base_url(server.url());
        let err = generator
            .generate(request(OutputMode::FreeText))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Quota);
        assert!(err.message.contains("RESOURCE_EXHAUSTED"));
    }
}
