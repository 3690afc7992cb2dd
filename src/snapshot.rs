//! Still-frame capture from the camera preview for answer submissions.
//!
//! A snapshot is best-effort evidence attached to an answer; a missing
//! camera or a failed encode must never fail the submission itself.

use crate::error::{Result, SessionError};
use base64::Engine as _;
use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;

/// JPEG quality for transported snapshots.
const SNAPSHOT_JPEG_QUALITY: u8 = 80;

/// One raw frame from the camera preview.
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    /// Tightly packed RGB8 pixel data.
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Source of camera preview frames.
///
/// The UI layer owns the actual camera; the controller only ever asks for
/// the most recent frame at submission time.
pub trait FrameSource: Send + Sync {
    /// The most recent preview frame, if the camera has produced one.
    fn latest_frame(&self) -> Option<PreviewFrame>;
}

/// Encode a preview frame as a base64 JPEG data URL for transport.
///
/// # Errors
///
/// Returns [`SessionError::Validation`] if the frame dimensions do not
/// match the pixel data, or if JPEG encoding fails.
pub fn encode_snapshot(frame: &PreviewFrame) -> Result<String> {
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.rgb.len() != expected || frame.width == 0 || frame.height == 0 {
        return Err(SessionError::Validation(format!(
            "snapshot frame geometry mismatch: {}x{} with {} bytes",
            frame.width,
            frame.height,
            frame.rgb.len()
        )));
    }

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, SNAPSHOT_JPEG_QUALITY)
        .encode(&frame.rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| SessionError::Validation(format!("snapshot encode failed: {e}")))?;

    let b64 = base64::engine::general_purpose::STANDARD.encode(&jpeg);
    Ok(format!("data:image/jpeg;base64,{b64}"))
}
