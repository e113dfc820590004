use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::kie::models::VideoModel;
use crate::utils::timing::log_provider_timing;

const VEO_GENERATE_PATH: &str = "/api/v1/veo/generate";
const JOBS_CREATE_TASK_PATH: &str = "/api/v1/jobs/createTask";
const KLING_IMAGE_TO_VIDEO_MODEL: &str = "kling/v2-1-standard";
const KLING_TEXT_TO_VIDEO_MODEL: &str = "kling/v2-1-master-text-to-video";
const ERROR_BODY_PREVIEW: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model: VideoModel,
    pub prompt: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("KIE_AI_API_KEY is not configured")]
    MissingApiKey,
    #[error("request to KIE.ai failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("KIE.ai returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("KIE.ai rejected the request (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("KIE.ai response was not understood: {0}")]
    Decode(String),
    #[error("KIE.ai response did not include a task id")]
    MissingTaskId,
}

/// Submits generation jobs and returns the provider task id that later
/// callbacks will reference.
pub trait VideoProvider: Send + Sync + 'static {
    fn submit(
        &self,
        request: &GenerationRequest,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;
}

#[derive(Debug, Clone)]
pub struct KieClient {
    http: Client,
    base_url: String,
    api_key: String,
    callback_url: String,
    veo_aspect_ratio: String,
    kling_duration: String,
}

#[derive(Debug, Serialize)]
struct VeoGenerateBody<'a> {
    prompt: &'a str,
    model: &'a str,
    #[serde(rename = "aspectRatio")]
    aspect_ratio: &'a str,
    #[serde(rename = "callBackUrl")]
    callback_url: &'a str,
    #[serde(rename = "imageUrls", skip_serializing_if = "Option::is_none")]
    image_urls: Option<Vec<&'a str>>,
}

#[derive(Debug, Serialize)]
struct CreateTaskBody<'a> {
    model: &'a str,
    #[serde(rename = "callBackUrl")]
    callback_url: &'a str,
    input: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct KieEnvelope {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<KieTaskData>,
}

#[derive(Debug, Deserialize)]
struct KieTaskData {
    #[serde(rename = "taskId", default)]
    task_id: Option<String>,
}

impl KieClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        callback_url: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(KieClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            callback_url: callback_url.to_string(),
            veo_aspect_ratio: "16:9".to_string(),
            kling_duration: "5".to_string(),
        })
    }

    pub fn with_veo_aspect_ratio(mut self, aspect_ratio: &str) -> Self {
        self.veo_aspect_ratio = aspect_ratio.to_string();
        self
    }

    pub fn with_kling_duration(mut self, duration: &str) -> Self {
        self.kling_duration = duration.to_string();
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Builds the endpoint URL and JSON body for a request. Veo and Kling
    /// live behind different KIE.ai endpoints with different body layouts.
    pub fn build_submission(&self, request: &GenerationRequest) -> (String, serde_json::Value) {
        let image_url = request
            .image_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty());

        match request.model {
            VideoModel::Veo3Fast => {
                let body = VeoGenerateBody {
                    prompt: &request.prompt,
                    model: request.model.key(),
                    aspect_ratio: &self.veo_aspect_ratio,
                    callback_url: &self.callback_url,
                    image_urls: image_url.map(|url| vec![url]),
                };
                (
                    format!("{}{}", self.base_url, VEO_GENERATE_PATH),
                    serde_json::to_value(body).unwrap_or_default(),
                )
            }
            VideoModel::Kling21 => {
                let (model, input) = match image_url {
                    Some(url) => (
                        KLING_IMAGE_TO_VIDEO_MODEL,
                        json!({
                            "prompt": request.prompt,
                            "image_url": url,
                            "duration": self.kling_duration,
                        }),
                    ),
                    None => (
                        KLING_TEXT_TO_VIDEO_MODEL,
                        json!({
                            "prompt": request.prompt,
                            "duration": self.kling_duration,
                            "aspect_ratio": self.veo_aspect_ratio,
                        }),
                    ),
                };
                let body = CreateTaskBody {
                    model,
                    callback_url: &self.callback_url,
                    input,
                };
                (
                    format!("{}{}", self.base_url, JOBS_CREATE_TASK_PATH),
                    serde_json::to_value(body).unwrap_or_default(),
                )
            }
        }
    }

    async fn post_submission(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        if !self.is_configured() {
            return Err(ProviderError::MissingApiKey);
        }

        let (endpoint, body) = self.build_submission(request);
        info!(
            "Submitting {} generation to {} (image: {})",
            request.model,
            endpoint,
            request.image_url.is_some()
        );

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        parse_submit_response(status, &text)
    }
}

impl VideoProvider for KieClient {
    async fn submit(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        log_provider_timing("kie", request.model.key(), "submit", || {
            self.post_submission(request)
        })
        .await
    }
}

fn preview(text: &str) -> String {
    text.chars().take(ERROR_BODY_PREVIEW).collect()
}

pub fn parse_submit_response(status: StatusCode, body: &str) -> Result<String, ProviderError> {
    if !status.is_success() {
        warn!("KIE.ai submit failed with HTTP {}", status.as_u16());
        return Err(ProviderError::Status {
            status: status.as_u16(),
            body: preview(body),
        });
    }

    let envelope: KieEnvelope =
        serde_json::from_str(body).map_err(|err| ProviderError::Decode(err.to_string()))?;
    if envelope.code != 200 {
        return Err(ProviderError::Rejected {
            code: envelope.code,
            message: envelope.msg.unwrap_or_else(|| "no message".to_string()),
        });
    }

    envelope
        .data
        .and_then(|data| data.task_id)
        .map(|task_id| task_id.trim().to_string())
        .filter(|task_id| !task_id.is_empty())
        .ok_or(ProviderError::MissingTaskId)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> KieClient {
        KieClient::new(
            "https://api.kie.ai/",
            "secret",
            "https://bot.example/kie_callback",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn request(model: VideoModel, image_url: Option<&str>) -> GenerationRequest {
        GenerationRequest {
            model,
            prompt: "a fox in the snow".to_string(),
            image_url: image_url.map(str::to_string),
        }
    }

    #[test]
    fn veo_request_targets_veo_endpoint() {
        let (endpoint, body) = client().build_submission(&request(VideoModel::Veo3Fast, None));
        assert_eq!(endpoint, "https://api.kie.ai/api/v1/veo/generate");
        assert_eq!(body["model"], "veo3_fast");
        assert_eq!(body["prompt"], "a fox in the snow");
        assert_eq!(body["aspectRatio"], "16:9");
        assert_eq!(body["callBackUrl"], "https://bot.example/kie_callback");
        assert!(body.get("imageUrls").is_none());
    }

    #[test]
    fn veo_request_carries_image() {
        let (_, body) = client().build_submission(&request(
            VideoModel::Veo3Fast,
            Some("https://bot.example/uploads/a.jpg"),
        ));
        assert_eq!(body["imageUrls"][0], "https://bot.example/uploads/a.jpg");
    }

    #[test]
    fn kling_switches_model_on_image_presence() {
        let client = client().with_kling_duration("10");
        let (endpoint, body) = client.build_submission(&request(
            VideoModel::Kling21,
            Some("https://bot.example/uploads/a.jpg"),
        ));
        assert_eq!(endpoint, "https://api.kie.ai/api/v1/jobs/createTask");
        assert_eq!(body["model"], KLING_IMAGE_TO_VIDEO_MODEL);
        assert_eq!(body["input"]["image_url"], "https://bot.example/uploads/a.jpg");
        assert_eq!(body["input"]["duration"], "10");

        let (_, body) = client.build_submission(&request(VideoModel::Kling21, Some("  ")));
        assert_eq!(body["model"], KLING_TEXT_TO_VIDEO_MODEL);
        assert!(body["input"].get("image_url").is_none());
        assert_eq!(body["input"]["aspect_ratio"], "16:9");
    }

    #[test]
    fn submit_response_yields_task_id() {
        let task = parse_submit_response(
            StatusCode::OK,
            r#"{"code":200,"msg":"success","data":{"taskId":"veo_task_1"}}"#,
        )
        .unwrap();
        assert_eq!(task, "veo_task_1");
    }

    #[test]
    fn submit_response_errors_are_classified() {
        assert!(matches!(
            parse_submit_response(StatusCode::UNAUTHORIZED, "nope"),
            Err(ProviderError::Status { status: 401, .. })
        ));
        assert!(matches!(
            parse_submit_response(StatusCode::OK, r#"{"code":402,"msg":"Insufficient balance"}"#),
            Err(ProviderError::Rejected { code: 402, .. })
        ));
        assert!(matches!(
            parse_submit_response(StatusCode::OK, r#"{"code":200,"data":{}}"#),
            Err(ProviderError::MissingTaskId)
        ));
        assert!(matches!(
            parse_submit_response(StatusCode::OK, "<html>"),
            Err(ProviderError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_any_request() {
        let client = KieClient::new(
            "http://127.0.0.1:9",
            " ",
            "http://127.0.0.1:9/kie_callback",
            Duration::from_secs(1),
        )
        .unwrap();
        let result = client.submit(&request(VideoModel::Veo3Fast, None)).await;
        assert!(matches!(result, Err(ProviderError::MissingApiKey)));
    }
}
