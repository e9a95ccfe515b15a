use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

// Define standard sample rates for clarity and consistency
pub const TELEPHONY_PCM16_SAMPLE_RATE: f64 = 16000.0;
pub const PROVIDER_PCM16_SAMPLE_RATE: f64 = 24000.0;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Runs a sample buffer through a fixed-input resampler, feeding full chunks
/// and flushing the remainder as a partial chunk.
pub fn resample_chunks(resampler: &mut FastFixedIn<f32>, samples: &[f32]) -> Vec<f32> {
    let chunk_size = resampler.input_frames_next();
    let mut resampled = Vec::new();
    for chunk in samples.chunks(chunk_size) {
        let result = if chunk.len() == chunk_size {
            resampler.process(&[chunk.to_vec()], None)
        } else {
            resampler.process_partial(Some(&[chunk.to_vec()]), None)
        };
        if let Ok(res) = result {
            resampled.extend_from_slice(&res[0]);
        }
    }
    resampled
}

/// Interprets little-endian PCM16 bytes as normalized f32 samples.
pub fn decode_f32_from_pcm16_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Converts normalized f32 samples back to little-endian PCM16 bytes.
pub fn encode_f32_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// Decodes a base64 string representing PCM16 audio into a vector of f32 samples.
pub fn decode_f32_from_base64_i16(base64_fragment: &str) -> Vec<f32> {
    if let Ok(pcm16_bytes) = base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        decode_f32_from_pcm16_bytes(&pcm16_bytes)
    } else {
        tracing::error!("Failed to decode base64 fragment to f32");
        Vec::new()
    }
}

/// Encodes a slice of f32 samples into a base64 string (converting to i16 PCM first).
pub fn encode_f32_to_base64_i16(pcm32: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode_f32_to_pcm16_bytes(pcm32))
}

/// Encodes raw PCM16 bytes to base64 for JSON transport.
pub fn encode_pcm16_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decodes base64 PCM16 back to raw bytes. Invalid input yields silence.
pub fn decode_pcm16_base64(fragment: &str) -> Vec<u8> {
    match base64::engine::general_purpose::STANDARD.decode(fragment) {
        Ok(bytes) => bytes,
        Err(_) => {
            tracing::error!("Failed to decode base64 PCM16 fragment");
            Vec::new()
        }
    }
}

/// Milliseconds of playback a PCM16 byte count represents at the given rate.
pub fn pcm16_bytes_to_ms(byte_count: u64, sample_rate: f64) -> u64 {
    let samples = byte_count / 2;
    ((samples as f64 / sample_rate) * 1000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(16000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(24000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(24000.0, 16000.0, 1024).is_ok());
    }

    #[test]
    fn test_pcm16_byte_round_trip() {
        // i16 value 16384 = 0x4000 little endian = [0x00, 0x40] -> 0.5
        let samples = decode_f32_from_pcm16_bytes(&[0x00, 0x40, 0x00, 0x80]);
        assert_eq!(samples.len(), 2);
        assert_abs_diff_eq!(samples[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(samples[1], -1.0, epsilon = 0.0001);

        let bytes = encode_f32_to_pcm16_bytes(&samples);
        assert_eq!(bytes, vec![0x00, 0x40, 0x00, 0x80]);

        // Odd byte counts cannot form a sample and are skipped.
        assert!(decode_f32_from_pcm16_bytes(&[0x01]).is_empty());
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let bytes = encode_f32_to_pcm16_bytes(&[2.0, -2.0]);
        let decoded = decode_f32_from_pcm16_bytes(&bytes);
        assert!(decoded[0] <= 1.0);
        assert!(decoded[1] >= -1.0);
    }

    #[test]
    fn test_base64_round_trip() {
        let original = vec![0.1f32, -0.7f32, 0.0f32, 0.99f32];
        let encoded = encode_f32_to_base64_i16(&original);
        let decoded = decode_f32_from_base64_i16(&encoded);
        assert_eq!(decoded.len(), original.len());
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 0.001);
        }

        assert!(decode_f32_from_base64_i16("invalid_base64!").is_empty());
        assert!(decode_pcm16_base64("invalid_base64!").is_empty());
    }

    #[test]
    fn test_resample_chunks_changes_length() {
        let mut down = create_resampler(
            PROVIDER_PCM16_SAMPLE_RATE,
            TELEPHONY_PCM16_SAMPLE_RATE,
            512,
        )
        .expect("resampler");
        // One second of a 440 Hz tone at 24 kHz.
        let input: Vec<f32> = (0..24000)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 24000.0).sin())
            .collect();
        let output = resample_chunks(&mut down, &input);
        // 24 kHz -> 16 kHz is a 2/3 ratio; allow for filter edges.
        let expected = input.len() * 2 / 3;
        assert!(
            (output.len() as i64 - expected as i64).unsigned_abs() < 1024,
            "expected ~{expected} samples, got {}",
            output.len()
        );
    }

    #[test]
    fn test_pcm16_bytes_to_ms() {
        // 16 kHz mono PCM16: 32 bytes per millisecond.
        assert_eq!(pcm16_bytes_to_ms(32_000, TELEPHONY_PCM16_SAMPLE_RATE), 1000);
        assert_eq!(pcm16_bytes_to_ms(16_000, TELEPHONY_PCM16_SAMPLE_RATE), 500);
        assert_eq!(pcm16_bytes_to_ms(0, TELEPHONY_PCM16_SAMPLE_RATE), 0);
        // 24 kHz: 48 bytes per millisecond.
        assert_eq!(pcm16_bytes_to_ms(48_000, PROVIDER_PCM16_SAMPLE_RATE), 1000);
    }
}
