//! HTTP client for the interview backend.
//!
//! The backend owns question generation and answer scoring; this client
//! covers only the four session endpoints the controller drives, plus raw
//! fetches of audio assets referenced by questions.

use crate::config::BackendConfig;
use crate::error::{Result, SessionError};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// Parameters for starting a new interview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterviewSetup {
    pub profession: String,
    pub role: String,
    pub level: String,
    pub difficulty: String,
    pub language: String,
}

/// One interview question as delivered by the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    /// Display number as shown to the candidate. Follow-up questions carry
    /// fractional numbers like "3.1", so this is a string.
    #[serde(
        default = "default_display_number",
        deserialize_with = "string_or_number"
    )]
    pub display_number: String,
    /// Question text. The current-question endpoint calls this
    /// `questionText`; the submit response nests it as `text`.
    #[serde(rename = "questionText", alias = "text")]
    pub text: String,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub code_snippet: Option<String>,
    #[serde(default)]
    pub total_questions: Option<u32>,
}

impl Question {
    /// Integer prefix of the display number ("3.1" -> 3), used for progress
    /// math and the cold-start wait-window rule.
    pub fn primary_number(&self) -> u32 {
        self.display_number
            .split('.')
            .next()
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(1)
    }
}

fn default_display_number() -> String {
    "1".to_owned()
}

/// Accept the display number as either a JSON string or a bare number.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "displayNumber must be a string or number, got {other}"
        ))),
    }
}

/// A structured answer record posted after the audio asset upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSubmission {
    pub session_id: String,
    pub question_id: String,
    /// Reserved for typed answers; spoken interviews submit it empty.
    pub answer_text: String,
    pub audio_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64_snapshot: Option<String>,
}

/// Backend verdict on a submitted answer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    #[serde(rename = "isCompleted")]
    pub completed: bool,
    #[serde(default)]
    pub next_question: Option<Question>,
}

#[derive(Debug, Deserialize)]
struct StartInterviewResponse {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadAudioResponse {
    #[serde(rename = "path", alias = "Path")]
    path: String,
}

/// Interview backend HTTP client.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl BackendClient {
    /// Create a client from configuration.
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            auth_token: config.auth_token.clone(),
        }
    }

    /// Override the base URL (useful for testing with mock servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Start a new interview and return the session id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Network`] on transport or status failure.
    pub async fn start_interview(&self, setup: &InterviewSetup) -> Result<String> {
        let response = self
            .request(reqwest::Method::POST, "/api/interview/start")
            .json(setup)
            .send()
            .await
            .map_err(|e| SessionError::Network(format!("start interview: {e}")))?;
        let response = check_status(response, "start interview").await?;
        let body: StartInterviewResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Network(format!("start interview body: {e}")))?;
        Ok(body.session_id)
    }

    /// Fetch the current question, or an arbitrary one by number when
    /// `target` is set (developer-mode jump navigation).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Network`] on transport or status failure.
    pub async fn current_question(
        &self,
        session_id: &str,
        target: Option<u32>,
    ) -> Result<Question> {
        let path = format!("/api/interview/{session_id}/current-question");
        let mut builder = self.request(reqwest::Method::GET, &path);
        if let Some(target) = target {
            builder = builder.query(&[("target", target)]);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| SessionError::Network(format!("current question: {e}")))?;
        let response = check_status(response, "current question").await?;
        response
            .json()
            .await
            .map_err(|e| SessionError::Network(format!("current question body: {e}")))
    }

    /// Upload recorded answer bytes as an opaque audio asset.
    ///
    /// Returns the backend's reference path for the asset.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Network`] on transport or status failure.
    pub async fn upload_audio(&self, bytes: Vec<u8>, file_name: &str) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_owned())
            .mime_str("application/octet-stream")
            .map_err(|e| SessionError::Network(format!("upload audio part: {e}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .request(reqwest::Method::POST, "/api/interview/upload-audio")
            .multipart(form)
            .send()
            .await
            .map_err(|e| SessionError::Network(format!("upload audio: {e}")))?;
        let response = check_status(response, "upload audio").await?;
        let body: UploadAudioResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Network(format!("upload audio body: {e}")))?;
        Ok(body.path)
    }

    /// Post the structured answer record.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Network`] on transport or status failure.
    pub async fn submit_answer(&self, submission: &AnswerSubmission) -> Result<SubmitOutcome> {
        let response = self
            .request(reqwest::Method::POST, "/api/interview/submit-answer")
            .json(submission)
            .send()
            .await
            .map_err(|e| SessionError::Network(format!("submit answer: {e}")))?;
        let response = check_status(response, "submit answer").await?;
        response
            .json()
            .await
            .map_err(|e| SessionError::Network(format!("submit answer body: {e}")))
    }

    /// Fetch an audio asset referenced by a question.
    ///
    /// Relative references are resolved against the backend base URL.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Network`] on transport or status failure.
    pub async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>> {
        let full = self.resolve_url(url);
        debug!("fetching question audio: {full}");
        let response = self
            .http
            .get(&full)
            .send()
            .await
            .map_err(|e| SessionError::Network(format!("fetch audio: {e}")))?;
        let response = check_status(response, "fetch audio").await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SessionError::Network(format!("fetch audio body: {e}")))?;
        Ok(bytes.to_vec())
    }

    /// Resolve a possibly relative asset reference against the base URL.
    pub fn resolve_url(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_owned()
        } else {
            format!("{}/{}", self.base_url, path_or_url.trim_start_matches('/'))
        }
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SessionError::Network(format!(
        "{what}: HTTP {status}: {body}"
    )))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn primary_number_handles_followups() {
        let q: Question = serde_json::from_value(serde_json::json!({
            "id": "q1", "displayNumber": "3.1", "questionText": "t"
        }))
        .unwrap();
        assert_eq!(q.primary_number(), 3);
    }

    #[test]
    fn display_number_accepts_bare_numbers() {
        let q: Question = serde_json::from_value(serde_json::json!({
            "id": "q1", "displayNumber": 4, "questionText": "t"
        }))
        .unwrap();
        assert_eq!(q.display_number, "4");
        assert_eq!(q.primary_number(), 4);
    }

    #[test]
    fn display_number_defaults_to_one() {
        let q: Question = serde_json::from_value(serde_json::json!({
            "id": "q1", "questionText": "t"
        }))
        .unwrap();
        assert_eq!(q.display_number, "1");
    }

    #[test]
    fn next_question_uses_text_alias() {
        let outcome: SubmitOutcome = serde_json::from_value(serde_json::json!({
            "isCompleted": false,
            "nextQuestion": { "id": "q2", "displayNumber": "2", "text": "second" }
        }))
        .unwrap();
        assert_eq!(outcome.next_question.unwrap().text, "second");
    }

    #[test]
    fn resolve_url_passes_absolute_through() {
        let client = BackendClient::new(&BackendConfig::default())
            .with_base_url("http://backend.test");
        assert_eq!(
            client.resolve_url("https://cdn.test/a.mp3"),
            "https://cdn.test/a.mp3"
        );
        assert_eq!(
            client.resolve_url("/media/q1.mp3"),
            "http://backend.test/media/q1.mp3"
        );
        assert_eq!(
            client.resolve_url("media/q1.mp3"),
            "http://backend.test/media/q1.mp3"
        );
    }
}
