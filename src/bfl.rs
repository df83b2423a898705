use std::time::Duration;

use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::job::RemoteStatus;
use crate::logging::compact;
use crate::tracker::EditApi;

/// Параметры редактирования, которые пользователь не задаёт в промпте.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOptions {
    pub aspect_ratio: String,
    pub output_format: String,
    pub seed: Option<u64>,
    pub safety_tolerance: u8,
}

impl Default for EditOptions {
    fn default() -> Self {
        Self {
            aspect_ratio: "1:1".to_string(),
            output_format: "jpeg".to_string(),
            seed: None,
            safety_tolerance: 2,
        }
    }
}

/// Тело запроса `POST /flux-kontext-pro`.
#[derive(Debug, Serialize)]
pub struct EditRequest {
    pub prompt: String,
    pub input_image: String,
    pub aspect_ratio: String,
    pub output_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub safety_tolerance: u8,
}

impl EditRequest {
    pub fn new(prompt: &str, input_image: String, options: &EditOptions) -> Self {
        Self {
            prompt: prompt.to_string(),
            input_image,
            aspect_ratio: options.aspect_ratio.clone(),
            output_format: options.output_format.clone(),
            seed: options.seed,
            safety_tolerance: options.safety_tolerance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: String,
    pub polling_url: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: Option<String>,
    polling_url: Option<String>,
}

#[derive(Debug, Deserialize)]
enum WireStatus {
    Ready,
    Pending,
    Processing,
    Error,
    Failed,
    #[serde(rename = "Request Moderated")]
    RequestModerated,
    #[serde(rename = "Content Moderated")]
    ContentModerated,
    #[serde(rename = "Task not found")]
    TaskNotFound,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    status: WireStatus,
    #[serde(default)]
    result: Option<PollResult>,
    #[serde(default)]
    details: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollResult {
    sample: Option<String>,
}

impl PollResponse {
    fn into_remote(self) -> RemoteStatus {
        let reason = |fallback: &str| {
            self.message
                .clone()
                .or_else(|| self.details.as_ref().map(|d| compact(&d.to_string(), 200)))
                .unwrap_or_else(|| fallback.to_string())
        };
        match self.status {
            WireStatus::Pending => RemoteStatus::Queued,
            WireStatus::Processing => RemoteStatus::Processing,
            WireStatus::Ready => match self.result.and_then(|r| r.sample) {
                Some(sample) => RemoteStatus::Ready { sample },
                None => RemoteStatus::Error {
                    message: "no image URL in result".to_string(),
                },
            },
            WireStatus::Error | WireStatus::Failed => RemoteStatus::Error {
                message: reason("edit failed"),
            },
            WireStatus::RequestModerated => RemoteStatus::Error {
                message: reason("request moderated"),
            },
            WireStatus::ContentModerated => RemoteStatus::Error {
                message: reason("content moderated"),
            },
            WireStatus::TaskNotFound => RemoteStatus::Error {
                message: "task not found".to_string(),
            },
            // Unknown statuses keep the job polling.
            WireStatus::Unknown => {
                warn!("bfl: unexpected status in poll response");
                RemoteStatus::Processing
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BflError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid API response: {0}")]
    InvalidResponse(String),
}

/// HTTP-клиент BFL.ai: создание задачи, опрос статуса, скачивание результата.
#[derive(Clone)]
pub struct BflClient {
    http: reqwest::Client,
    base_url: String,
    model_path: String,
    api_key: String,
}

impl BflClient {
    pub fn new(
        base_url: &str,
        model_path: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, BflError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_path: model_path.to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn submit_url(&self) -> String {
        format!("{}{}", self.base_url, self.model_path)
    }

    /// Скачивает готовое изображение по подписанной ссылке из результата.
    pub async fn download_image(&self, url: &str) -> Result<Vec<u8>, BflError> {
        debug!(url = %compact(url, 80), "bfl: downloading result");
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BflError::Status {
                status: status.as_u16(),
                body: compact(&body, 200),
            });
        }
        let bytes = resp.bytes().await?;
        info!(size = bytes.len(), "bfl: result downloaded");
        Ok(bytes.to_vec())
    }
}

impl EditApi for BflClient {
    async fn submit(&self, request: &EditRequest) -> Result<Submission, BflError> {
        info!(
            prompt = %compact(&request.prompt, 50),
            aspect_ratio = %request.aspect_ratio,
            output_format = %request.output_format,
            "bfl: creating edit request"
        );
        let resp = self
            .http
            .post(self.submit_url())
            .header("x-key", &self.api_key)
            .header(ACCEPT, "application/json")
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %compact(&body, 200), "bfl: submit rejected");
            return Err(BflError::Status {
                status: status.as_u16(),
                body: compact(&body, 200),
            });
        }

        let parsed: SubmitResponse = resp.json().await?;
        parse_submission(parsed)
    }

    async fn fetch_status(&self, polling_url: &str) -> Result<RemoteStatus, BflError> {
        let resp = self
            .http
            .get(polling_url)
            .header("x-key", &self.api_key)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BflError::Status {
                status: status.as_u16(),
                body: compact(&body, 200),
            });
        }

        let parsed: PollResponse = resp.json().await?;
        Ok(parsed.into_remote())
    }
}

fn parse_submission(resp: SubmitResponse) -> Result<Submission, BflError> {
    match (resp.id, resp.polling_url) {
        (Some(id), Some(polling_url)) if !id.is_empty() && !polling_url.is_empty() => {
            info!(job_id = %id, "bfl: edit request created");
            Ok(Submission { id, polling_url })
        }
        _ => Err(BflError::InvalidResponse(
            "missing id or polling_url".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll(json: &str) -> RemoteStatus {
        serde_json::from_str::<PollResponse>(json)
            .expect("корректный JSON ответа опроса")
            .into_remote()
    }

    #[test]
    fn maps_wire_statuses() {
        assert_eq!(poll(r#"{"id":"a","status":"Pending"}"#), RemoteStatus::Queued);
        assert_eq!(poll(r#"{"id":"a","status":"Processing"}"#), RemoteStatus::Processing);
        assert_eq!(
            poll(r#"{"id":"a","status":"Ready","result":{"sample":"https://delivery/x.jpg","prompt":"p"}}"#),
            RemoteStatus::Ready { sample: "https://delivery/x.jpg".into() }
        );
        assert_eq!(
            poll(r#"{"id":"a","status":"Error","message":"boom"}"#),
            RemoteStatus::Error { message: "boom".into() }
        );
        assert_eq!(
            poll(r#"{"id":"a","status":"Task not found"}"#),
            RemoteStatus::Error { message: "task not found".into() }
        );
    }

    #[test]
    fn ready_without_sample_is_an_error() {
        assert_eq!(
            poll(r#"{"id":"a","status":"Ready","result":{}}"#),
            RemoteStatus::Error { message: "no image URL in result".into() }
        );
        assert!(matches!(
            poll(r#"{"id":"a","status":"Ready"}"#),
            RemoteStatus::Error { .. }
        ));
    }

    #[test]
    fn moderation_uses_details_when_present() {
        let st = poll(r#"{"id":"a","status":"Content Moderated","details":{"Moderation Reasons":["Derivative Works Filter"]}}"#);
        match st {
            RemoteStatus::Error { message } => assert!(message.contains("Derivative Works Filter")),
            other => panic!("ожидалась ошибка, получено {other:?}"),
        }
        assert_eq!(
            poll(r#"{"id":"a","status":"Request Moderated"}"#),
            RemoteStatus::Error { message: "request moderated".into() }
        );
    }

    #[test]
    fn unknown_status_keeps_polling() {
        assert_eq!(poll(r#"{"id":"a","status":"Warming Up"}"#), RemoteStatus::Processing);
    }

    #[test]
    fn submission_requires_id_and_polling_url() {
        let ok = parse_submission(SubmitResponse {
            id: Some("abc".into()),
            polling_url: Some("https://api.bfl.ai/v1/get_result?id=abc".into()),
        })
        .unwrap();
        assert_eq!(ok.id, "abc");

        let missing = parse_submission(SubmitResponse { id: Some("abc".into()), polling_url: None });
        assert!(matches!(missing, Err(BflError::InvalidResponse(_))));
        let empty = parse_submission(SubmitResponse { id: Some(String::new()), polling_url: Some("u".into()) });
        assert!(empty.is_err());
    }

    #[test]
    fn request_omits_seed_when_unset() {
        let mut options = EditOptions::default();
        let body = serde_json::to_value(EditRequest::new("make it red", "AAAA".into(), &options)).unwrap();
        assert_eq!(body["prompt"], "make it red");
        assert_eq!(body["input_image"], "AAAA");
        assert_eq!(body["aspect_ratio"], "1:1");
        assert_eq!(body["safety_tolerance"], 2);
        assert!(body.get("seed").is_none());

        options.seed = Some(42);
        let body = serde_json::to_value(EditRequest::new("p", "B".into(), &options)).unwrap();
        assert_eq!(body["seed"], 42);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = BflClient::new("https://api.bfl.ai/v1/", "/flux-kontext-pro", "k", Duration::from_secs(5)).unwrap();
        assert_eq!(client.submit_url(), "https://api.bfl.ai/v1/flux-kontext-pro");
    }
}
