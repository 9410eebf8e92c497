//! # Sample Codec
//!
//! Converts between the pipeline's in-memory sample format (f32 in [-1, 1])
//! and the transport format (little-endian 16-bit signed PCM, base64-encoded
//! for the JSON wire). Both directions are pure functions with no side
//! effects.
//!
//! ## Scaling Convention:
//! Encode multiplies by 32767 after clamping; decode divides by 32768. The
//! asymmetry follows the wire peers on both ends of the stream and introduces
//! a bias below one quantization step per sample. Rounding is pinned to
//! nearest, ties away from zero (`f32::round`), so 0.5 encodes to 16384 and
//! -0.5 to -16384.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{AppError, AppResult};

/// A capture frame encoded for transport.
///
/// ## Ownership:
/// Owned exclusively by the producer until handed to the session's outbound
/// channel; the payload is moved into the wire message, never shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Base64 payload of little-endian 16-bit PCM
    pub data: String,

    /// MIME-style tag identifying format and sample rate
    pub mime_type: String,
}

/// Encode a frame of f32 samples into a transport chunk.
///
/// ## Steps:
/// 1. Clamp each sample to [-1, 1]
/// 2. Scale by 32767 and round to the nearest i16
/// 3. Pack little-endian
/// 4. Base64-encode the bytes
///
/// ## Parameters:
/// - **samples**: One capture frame
/// - **sample_rate**: Capture rate, recorded in the chunk's MIME tag
pub fn encode_outbound(samples: &[f32], sample_rate: u32) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    EncodedChunk {
        data: BASE64.encode(&bytes),
        mime_type: format!("audio/pcm;rate={}", sample_rate),
    }
}

/// Decode a transport payload back into f32 samples.
///
/// ## Parameters:
/// - **data**: Base64 payload of little-endian 16-bit PCM
///
/// ## Returns:
/// - **Ok(samples)**: Normalized to approximately [-1, 1)
/// - **Err(MalformedAudio)**: Payload is not valid base64, or the decoded
///   byte length is odd (a truncated 16-bit sample)
pub fn decode_inbound(data: &str) -> AppResult<Vec<f32>> {
    let bytes = BASE64.decode(data)?;

    if bytes.len() % 2 != 0 {
        return Err(AppError::MalformedAudio(format!(
            "payload length {} is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes.as_slice());
    let mut samples = Vec::with_capacity(bytes.len() / 2);

    // Read each 16-bit sample (little-endian format)
    while let Ok(value) = cursor.read_i16::<LittleEndian>() {
        samples.push(value as f32 / 32768.0);
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decode the chunk payload as raw i16 values, bypassing normalization.
    fn decode_raw_i16(chunk: &EncodedChunk) -> Vec<i16> {
        let bytes = BASE64.decode(&chunk.data).unwrap();
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    #[test]
    fn test_encode_pins_rounding_rule() {
        let chunk = encode_outbound(&[0.5, -0.5, 1.0, -1.0], 16000);
        // 0.5 * 32767 = 16383.5; ties round away from zero on both signs
        assert_eq!(decode_raw_i16(&chunk), vec![16384, -16384, 32767, -32767]);
    }

    #[test]
    fn test_encode_clamps_out_of_range_input() {
        let chunk = encode_outbound(&[1.5, -2.0], 16000);
        assert_eq!(decode_raw_i16(&chunk), vec![32767, -32767]);
    }

    #[test]
    fn test_mime_tag_carries_sample_rate() {
        let chunk = encode_outbound(&[0.0], 16000);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn test_round_trip_on_quantization_grid_within_one_step() {
        // Samples that sit exactly on the 16-bit grid round-trip within one
        // quantization step; only the 32767/32768 scale bias remains.
        let samples: Vec<f32> = (-16..=16).map(|k| (k * 2047) as f32 / 32767.0).collect();

        let chunk = encode_outbound(&samples, 16000);
        let decoded = decode_inbound(&chunk.data).unwrap();

        assert_eq!(decoded.len(), samples.len());
        let tolerance = 1.0 / 32767.0;
        for (original, restored) in samples.iter().zip(decoded.iter()) {
            assert!(
                (original - restored).abs() <= tolerance,
                "round-trip error too large: {} vs {}",
                original,
                restored
            );
        }
    }

    #[test]
    fn test_round_trip_of_arbitrary_samples_is_bounded() {
        let samples: Vec<f32> = (0..4096)
            .map(|i| ((i as f32) * 0.013).sin() * 0.9)
            .collect();

        let chunk = encode_outbound(&samples, 16000);
        let decoded = decode_inbound(&chunk.data).unwrap();

        assert_eq!(decoded.len(), samples.len());
        // Half a step of rounding plus the scale bias: |x - n/32768| is
        // bounded by (|x| + 0.5) / 32768.
        let tolerance = 1.5 / 32768.0;
        for (original, restored) in samples.iter().zip(decoded.iter()) {
            assert!(
                (original - restored).abs() <= tolerance,
                "round-trip error too large: {} vs {}",
                original,
                restored
            );
        }
    }

    #[test]
    fn test_odd_length_payload_rejected() {
        let payload = BASE64.encode([0u8, 1, 2]);
        let err = decode_inbound(&payload).unwrap_err();
        assert!(matches!(err, AppError::MalformedAudio(_)));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let err = decode_inbound("@@not-base64@@").unwrap_err();
        assert!(matches!(err, AppError::MalformedAudio(_)));
    }

    #[test]
    fn test_empty_payload_decodes_to_empty_frame() {
        assert!(decode_inbound("").unwrap().is_empty());
    }
}
