//! Decode delivered question audio (wav/mp3/aac/mp4) into mono f32 samples.
//!
//! The backend serves question speech as an encoded asset; both the avatar
//! path (after resampling to PCM16) and the local fallback path start from
//! the decoded samples this module produces.

use crate::error::{Result, SessionError};
use std::io::Cursor;

/// Decode an in-memory audio asset to mono f32 samples.
///
/// Multi-channel audio is downmixed by averaging channels. Returns the
/// samples and their native sample rate.
///
/// # Errors
///
/// Returns [`SessionError::Decode`] if the container cannot be probed, no
/// audio track exists, or decoding fails outright. Corrupt individual
/// packets are skipped.
pub fn decode_to_mono_f32(data: Vec<u8>, extension_hint: Option<&str>) -> Result<(Vec<f32>, u32)> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let mss = MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension_hint {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| SessionError::Decode(format!("failed to probe audio: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| SessionError::Decode("no default audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| SessionError::Decode("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| SessionError::Decode(format!("failed to create decoder: {e}")))?;

    let mut out: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) => {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    break;
                }
                return Err(SessionError::Decode(format!("audio read error: {e}")));
            }
            Err(e) => return Err(SessionError::Decode(format!("audio read error: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(_)) => continue,
            Err(e) => return Err(SessionError::Decode(format!("audio decode error: {e}"))),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        let frames = decoded.frames() as u64;

        let frames_usize = usize::try_from(frames).unwrap_or(usize::MAX);
        let required = frames_usize.saturating_mul(channels);
        let needs_new = match sample_buf.as_ref() {
            Some(b) => b.capacity() < required,
            None => true,
        };

        if needs_new {
            sample_buf = Some(SampleBuffer::<f32>::new(frames, spec));
        } else if let Some(b) = sample_buf.as_mut() {
            b.clear();
        }

        if let Some(b) = sample_buf.as_mut() {
            b.copy_interleaved_ref(decoded);
        }

        let data = match sample_buf.as_ref() {
            Some(b) => b.samples(),
            None => &[],
        };
        if channels <= 1 {
            out.extend_from_slice(data);
        } else {
            for frame in data.chunks_exact(channels) {
                let sum: f32 = frame.iter().sum();
                out.push(sum / channels as f32);
            }
        }
    }

    if out.is_empty() {
        return Err(SessionError::Decode("decoded audio is empty".into()));
    }

    Ok((out, sample_rate))
}

/// Best-effort extension hint from an audio URL or path.
pub fn extension_hint(url: &str) -> Option<&str> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let (_, ext) = without_query.rsplit_once('.')?;
    if ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(ext)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn wav_bytes(samples: &[f32], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut buf = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), spec).unwrap();
            for &s in samples {
                writer
                    .write_sample((s.clamp(-1.0, 1.0) * 32_767.0) as i16)
                    .unwrap();
            }
            writer.finalize().unwrap();
        }
        buf
    }

    #[test]
    fn decodes_wav_round_trip() {
        let samples: Vec<f32> = (0..1_600).map(|i| (i as f32 * 0.02).sin() * 0.5).collect();
        let bytes = wav_bytes(&samples, 16_000);

        let (decoded, rate) = decode_to_mono_f32(bytes, Some("wav")).unwrap();
        assert_eq!(rate, 16_000);
        assert_eq!(decoded.len(), samples.len());
        // 16-bit quantization error only.
        for (a, b) in decoded.iter().zip(&samples) {
            assert!((a - b).abs() < 1.0 / 16_384.0, "{a} vs {b}");
        }
    }

    #[test]
    fn garbage_bytes_fail_to_probe() {
        let result = decode_to_mono_f32(vec![0xDE, 0xAD, 0xBE, 0xEF], None);
        assert!(matches!(result, Err(SessionError::Decode(_))));
    }

    #[test]
    fn extension_hint_strips_query() {
        assert_eq!(extension_hint("audio/q1.mp3?sig=abc"), Some("mp3"));
        assert_eq!(extension_hint("http://h/a/b.wav"), Some("wav"));
        assert_eq!(extension_hint("no-extension"), None);
        assert_eq!(extension_hint("weird.verylongext"), None);
    }
}
