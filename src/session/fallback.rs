//! Batch transcription fallback via OpenAI-compatible HTTP API
//!
//! When a streaming session dies mid-recording, the orchestrator keeps
//! capturing. Once the recording ends, the retained audio is submitted
//! here in one shot, so the user still gets their text. The request is
//! a multipart upload to a whisper.cpp-style `/v1/audio/transcriptions`
//! endpoint.

use std::io::Cursor;
use std::time::Duration;

use ureq::serde_json;

use crate::config::FallbackConfig;
use crate::error::SessionError;

/// One-shot batch transcriber over HTTP
#[derive(Debug)]
pub struct BatchTranscriber {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl BatchTranscriber {
    /// Build from config; returns None when no fallback endpoint is set
    pub fn from_config(config: &FallbackConfig) -> Option<Self> {
        let endpoint = config.endpoint.clone()?;

        if endpoint.starts_with("http://")
            && !endpoint.contains("localhost")
            && !endpoint.contains("127.0.0.1")
            && !endpoint.contains("[::1]")
        {
            tracing::warn!(
                "Fallback endpoint uses HTTP without TLS. Audio data will be transmitted unencrypted!"
            );
        }

        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("VOXSTREAM_FALLBACK_API_KEY").ok());

        Some(Self {
            endpoint,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "whisper-1".to_string()),
            api_key,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Transcribe a complete recording. Blocking.
    pub fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String, SessionError> {
        if samples.is_empty() {
            return Err(SessionError::Fallback("empty audio buffer".into()));
        }

        let duration_secs = samples.len() as f32 / sample_rate as f32;
        tracing::debug!(
            "Sending {:.2}s of audio to fallback server ({} samples)",
            duration_secs,
            samples.len()
        );

        let start = std::time::Instant::now();
        let wav_data = encode_wav(samples, sample_rate)?;
        let (boundary, body) = self.build_multipart_body(&wav_data);

        let url = format!(
            "{}/v1/audio/transcriptions",
            self.endpoint.trim_end_matches('/')
        );

        let mut request = ureq::post(&url).timeout(self.timeout).set(
            "Content-Type",
            &format!("multipart/form-data; boundary={}", boundary),
        );
        if let Some(ref key) = self.api_key {
            request = request.set("Authorization", &format!("Bearer {}", key));
        }

        let response = request.send_bytes(&body).map_err(|e| match e {
            ureq::Error::Status(code, resp) => {
                let body = resp.into_string().unwrap_or_default();
                SessionError::Fallback(format!("server returned {}: {}", code, body))
            }
            ureq::Error::Transport(t) => SessionError::Fallback(format!("request failed: {}", t)),
        })?;

        let json: serde_json::Value = response
            .into_json()
            .map_err(|e| SessionError::Fallback(format!("failed to parse response: {}", e)))?;

        let text = json
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SessionError::Fallback(format!("response missing 'text' field: {}", json))
            })?
            .trim()
            .to_string();

        tracing::info!(
            "Fallback transcription completed in {:.2}s ({} chars)",
            start.elapsed().as_secs_f32(),
            text.chars().count()
        );

        Ok(text)
    }

    fn build_multipart_body(&self, wav_data: &[u8]) -> (String, Vec<u8>) {
        let boundary = format!(
            "----VoxstreamBoundary{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );

        let mut body = Vec::new();

        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"audio.wav\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: audio/wav\r\n\r\n");
        body.extend_from_slice(wav_data);
        body.extend_from_slice(b"\r\n");

        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"model\"\r\n\r\n");
        body.extend_from_slice(self.model.as_bytes());
        body.extend_from_slice(b"\r\n");

        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"response_format\"\r\n\r\n");
        body.extend_from_slice(b"json\r\n");

        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        (boundary, body)
    }
}

/// Encode f32 samples to 16-bit mono WAV
fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, SessionError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut buffer = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut buffer, spec)
        .map_err(|e| SessionError::Fallback(format!("failed to create WAV writer: {}", e)))?;

    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let scaled = (clamped * i16::MAX as f32) as i16;
        writer
            .write_sample(scaled)
            .map_err(|e| SessionError::Fallback(format!("failed to write sample: {}", e)))?;
    }

    writer
        .finalize()
        .map_err(|e| SessionError::Fallback(format!("failed to finalize WAV: {}", e)))?;

    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> FallbackConfig {
        FallbackConfig {
            endpoint: Some("http://localhost:8080".to_string()),
            model: None,
            api_key: None,
            timeout_secs: 30,
        }
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let mut config = test_config();
        config.endpoint = None;
        assert!(BatchTranscriber::from_config(&config).is_none());
        assert!(BatchTranscriber::from_config(&test_config()).is_some());
    }

    #[test]
    fn test_encode_wav_header_and_length() {
        let samples = vec![0.0f32; 1600]; // 100ms at 16kHz
        let wav = encode_wav(&samples, 16000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 44-byte header plus 2 bytes per sample
        assert_eq!(wav.len(), 44 + 1600 * 2);
    }

    #[test]
    fn test_encode_wav_clamps_samples() {
        let wav = encode_wav(&[2.0, -2.0], 16000).unwrap();
        let data = &wav[44..];
        let first = i16::from_le_bytes([data[0], data[1]]);
        let second = i16::from_le_bytes([data[2], data[3]]);
        assert_eq!(first, i16::MAX);
        assert_eq!(second, -i16::MAX);
    }

    #[test]
    fn test_multipart_body_contains_fields() {
        let batch = BatchTranscriber::from_config(&test_config()).unwrap();
        let (boundary, body) = batch.build_multipart_body(b"RIFF");
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains(&format!("--{}", boundary)));
        assert!(text.contains("name=\"file\""));
        assert!(text.contains("name=\"model\""));
        assert!(text.contains("whisper-1"));
        assert!(text.ends_with(&format!("--{}--\r\n", boundary)));
    }

    #[test]
    fn test_empty_buffer_rejected() {
        let batch = BatchTranscriber::from_config(&test_config()).unwrap();
        assert!(matches!(
            batch.transcribe(&[], 16000),
            Err(SessionError::Fallback(_))
        ));
    }
}
