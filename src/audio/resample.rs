//! Sample-rate conversion and PCM16 encoding for the avatar audio sink.
//!
//! The avatar renderer consumes exactly one format: 16kHz mono 16-bit signed
//! little-endian PCM. Question audio arrives at whatever rate the backend's
//! TTS produced, so decoded samples pass through here before dispatch.

/// Sample rate the avatar channel consumes, in Hz.
pub const AVATAR_SAMPLE_RATE: u32 = 16_000;

/// Linear-interpolation resampler.
///
/// Converts mono audio from `src_rate` to `dst_rate`. For speech content
/// this is sufficient quality — no anti-alias filter needed since speech
/// energy sits below 8kHz.
pub fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

/// Encode f32 samples in [-1, 1] as 16-bit signed little-endian PCM.
///
/// Scaling is symmetric: positive excursions scale by the positive
/// full-scale value (32767), negative by the negative one (32768). Scaling
/// both sides by a single constant would either clip at -1.0 or leave a
/// one-off bias at +1.0.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let v = if s < 0.0 {
            (s * 32_768.0) as i16
        } else {
            (s * 32_767.0) as i16
        };
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Resample decoded mono audio to the avatar rate and encode it as PCM16.
pub fn to_avatar_pcm(samples: &[f32], src_rate: u32) -> Vec<u8> {
    let resampled = resample_linear(samples, src_rate, AVATAR_SAMPLE_RATE);
    encode_pcm16(&resampled)
}
