//! Answer submission: upload, snapshot, structured post.
//!
//! One submission is three round-trips worth of work, but only the network
//! steps can fail it: a missing camera frame or a failed JPEG encode just
//! means the answer ships without a snapshot.

use crate::backend::{AnswerSubmission, BackendClient, SubmitOutcome};
use crate::error::Result;
use crate::recording::RecordingBuffer;
use crate::snapshot::{FrameSource, encode_snapshot};
use std::sync::Arc;
use tracing::{info, warn};

/// Uploads a finalized answer buffer and posts the structured record.
#[derive(Clone)]
pub struct SubmissionPipeline {
    backend: BackendClient,
    frames: Option<Arc<dyn FrameSource>>,
}

impl SubmissionPipeline {
    pub fn new(backend: BackendClient, frames: Option<Arc<dyn FrameSource>>) -> Self {
        Self { backend, frames }
    }

    /// Submit one answer.
    ///
    /// Uploads the raw bytes, attaches a best-effort snapshot, posts the
    /// answer record, and returns the backend's verdict: either the
    /// interview completed or the next question.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SessionError::Network`] if the upload or the
    /// submit call fails. The caller is responsible for preserving the
    /// buffer so the user can retry.
    pub async fn submit(
        &self,
        buffer: RecordingBuffer,
        question_id: &str,
        session_id: &str,
    ) -> Result<SubmitOutcome> {
        let file_name = buffer.file_name().to_owned();
        let audio_path = self.backend.upload_audio(buffer.bytes, &file_name).await?;
        info!("answer audio uploaded: {audio_path}");

        let snapshot = self.capture_snapshot();

        let submission = AnswerSubmission {
            session_id: session_id.to_owned(),
            question_id: question_id.to_owned(),
            answer_text: String::new(),
            audio_path,
            base64_snapshot: snapshot,
        };
        self.backend.submit_answer(&submission).await
    }

    /// Grab and encode one frame from the live preview, if there is one.
    fn capture_snapshot(&self) -> Option<String> {
        let source = self.frames.as_ref()?;
        let frame = source.latest_frame()?;
        match encode_snapshot(&frame) {
            Ok(data_url) => Some(data_url),
            Err(e) => {
                warn!("snapshot capture skipped: {e}");
                None
            }
        }
    }
}
