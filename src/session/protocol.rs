//! Wire contract for the streaming transcription transport
//!
//! Control messages are JSON text frames; audio travels as binary frames
//! of PCM s16le. This is the minimal contract the orchestrator needs:
//! `start` opens the logical stream, `finalize` asks the backend to flush
//! buffered audio and emit remaining transcripts tagged as finalize-origin,
//! and `close` requests unconditional teardown.

use serde::{Deserialize, Serialize};

/// Messages sent to the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the logical stream; must be the first frame after connect
    Start {
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        audio_format: String,
        sample_rate: u32,
        num_channels: u8,
    },
    /// Flush buffered audio and emit remaining transcripts; the backend
    /// answers with finalize_ack (or finalize-origin finals)
    Finalize,
    /// Unconditional teardown; no reply is expected
    Close,
}

impl ClientMessage {
    pub fn start(model: &str, api_key: Option<String>, sample_rate: u32) -> Self {
        ClientMessage::Start {
            model: model.to_string(),
            api_key,
            audio_format: "pcm_s16le".to_string(),
            sample_rate,
            num_channels: 1,
        }
    }
}

/// Messages received from the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// One transcript update
    Transcript {
        text: String,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        confidence: Option<f32>,
        /// True when this transcript was produced by a finalize request
        /// rather than an organic incremental result
        #[serde(default)]
        from_finalize: bool,
    },
    /// The backend has flushed everything it buffered
    FinalizeAck,
    /// Backend-reported error; only fatal ones abort the session
    Error {
        code: u16,
        message: String,
        #[serde(default)]
        fatal: bool,
    },
}

/// Kind of a transcript event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    /// May be superseded by later events, never retroactively edited
    Interim,
    Final,
}

/// One transcript update surfaced to the orchestrator. Ordering within a
/// session is append-only by arrival time.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
    pub confidence: Option<f32>,
    /// Whether this event originated from a finalize request
    pub from_finalize: bool,
}

impl TranscriptEvent {
    pub fn is_final(&self) -> bool {
        self.kind == TranscriptKind::Final
    }
}

/// Convert f32 mono samples to PCM s16le bytes for the wire
pub fn pcm_s16le_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let value = (clamped * i16::MAX as f32).round() as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_message_shape() {
        let msg = ClientMessage::start("streaming-v1", None, 16000);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"start""#));
        assert!(json.contains(r#""audio_format":"pcm_s16le""#));
        assert!(!json.contains("api_key"));
    }

    #[test]
    fn test_control_messages_are_bare_tags() {
        assert_eq!(
            serde_json::to_string(&ClientMessage::Finalize).unwrap(),
            r#"{"type":"finalize"}"#
        );
        assert_eq!(
            serde_json::to_string(&ClientMessage::Close).unwrap(),
            r#"{"type":"close"}"#
        );
    }

    #[test]
    fn test_transcript_defaults() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"transcript","text":"hello"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Transcript {
                text: "hello".to_string(),
                is_final: false,
                confidence: None,
                from_finalize: false,
            }
        );
    }

    #[test]
    fn test_finalize_origin_transcript() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"transcript","text":"hello world","is_final":true,"from_finalize":true,"confidence":0.93}"#,
        )
        .unwrap();
        let ServerMessage::Transcript {
            is_final,
            from_finalize,
            confidence,
            ..
        } = msg
        else {
            panic!("expected transcript");
        };
        assert!(is_final);
        assert!(from_finalize);
        assert_eq!(confidence, Some(0.93));
    }

    #[test]
    fn test_error_frame() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"error","code":429,"message":"rate limited"}"#,
        )
        .unwrap();
        let ServerMessage::Error { code, fatal, .. } = msg else {
            panic!("expected error");
        };
        assert_eq!(code, 429);
        assert!(!fatal);
    }

    #[test]
    fn test_pcm_encoding() {
        let bytes = pcm_s16le_bytes(&[0.0, 1.0, -1.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[0..2], &0i16.to_le_bytes());
        assert_eq!(&bytes[2..4], &i16::MAX.to_le_bytes());
        // -1.0 rounds to -i16::MAX, not i16::MIN, because of the symmetric scale
        assert_eq!(&bytes[4..6], &(-i16::MAX).to_le_bytes());
    }

    #[test]
    fn test_pcm_encoding_clamps_out_of_range() {
        let bytes = pcm_s16le_bytes(&[2.0, -3.0]);
        assert_eq!(&bytes[0..2], &i16::MAX.to_le_bytes());
        assert_eq!(&bytes[2..4], &(-i16::MAX).to_le_bytes());
    }
}
