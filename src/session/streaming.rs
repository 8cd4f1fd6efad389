//! WebSocket streaming session loop
//!
//! One task per utterance. Connects, sends the start frame, then pumps
//! audio and control messages until the orchestrator asks it to finish
//! or cancel. The finish handshake is bounded: after sending `finalize`
//! we wait at most `finalize_timeout_ms` for the acknowledgement (an
//! explicit finalize_ack frame, or a final transcript tagged as
//! finalize-origin), then send `close` and drop the connection without
//! waiting for the WebSocket close handshake.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StreamingConfig;
use crate::error::SessionError;

use super::protocol::{pcm_s16le_bytes, ClientMessage, ServerMessage, TranscriptEvent, TranscriptKind};
use super::{SessionControl, SessionEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Run one streaming session to completion. Always emits a terminal
/// event (Closed or Failed) before returning.
pub async fn run_session(
    config: StreamingConfig,
    api_key: Option<String>,
    session_id: Uuid,
    frame_rx: mpsc::Receiver<Vec<f32>>,
    control_rx: mpsc::UnboundedReceiver<SessionControl>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    let result = run_inner(&config, api_key, session_id, frame_rx, control_rx, &event_tx).await;
    let terminal = match result {
        Ok(()) => SessionEvent::Closed,
        Err(e) => SessionEvent::Failed(e),
    };
    let _ = event_tx.send(terminal).await;
}

async fn run_inner(
    config: &StreamingConfig,
    api_key: Option<String>,
    session_id: Uuid,
    mut frame_rx: mpsc::Receiver<Vec<f32>>,
    mut control_rx: mpsc::UnboundedReceiver<SessionControl>,
    event_tx: &mpsc::Sender<SessionEvent>,
) -> Result<(), SessionError> {
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    let mut ws = connect(config, connect_timeout).await?;

    let start = ClientMessage::start(&config.model, api_key, 16000);
    let start_json = serde_json::to_string(&start)
        .map_err(|e| SessionError::Protocol(format!("failed to encode start: {}", e)))?;
    ws.send(Message::Text(start_json.into()))
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    info!(%session_id, endpoint = %config.endpoint, "streaming session opened");

    loop {
        tokio::select! {
            control = control_rx.recv() => {
                match control {
                    Some(SessionControl::Finish) => {
                        return finish(config, session_id, ws, event_tx).await;
                    }
                    // Channel closure means the orchestrator dropped the
                    // handle; treat it like an explicit cancel.
                    Some(SessionControl::Cancel) | None => {
                        debug!(%session_id, "session cancelled");
                        close_and_drop(ws).await;
                        return Ok(());
                    }
                }
            }
            frame = frame_rx.recv() => {
                if let Some(samples) = frame {
                    let bytes = pcm_s16le_bytes(&samples);
                    ws.send(Message::Binary(bytes.into()))
                        .await
                        .map_err(|e| SessionError::Transport(e.to_string()))?;
                }
                // A closed frame channel is not terminal on its own; the
                // control channel decides how the session ends.
            }
            msg = ws.next() => {
                match msg {
                    Some(Ok(message)) => {
                        handle_server_message(session_id, message, event_tx).await?;
                    }
                    Some(Err(e)) => {
                        return Err(SessionError::Transport(e.to_string()));
                    }
                    None => {
                        return Err(SessionError::Transport(
                            "connection closed by server mid-stream".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

async fn connect(config: &StreamingConfig, deadline: Duration) -> Result<WsStream, SessionError> {
    match timeout(deadline, connect_async(&config.endpoint)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(SessionError::Connect {
            endpoint: config.endpoint.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Err(SessionError::ConnectTimeout(config.connect_timeout_secs)),
    }
}

/// Graceful shutdown: finalize, bounded wait for the ack while still
/// forwarding transcripts, then close unconditionally.
async fn finish(
    config: &StreamingConfig,
    session_id: Uuid,
    mut ws: WsStream,
    event_tx: &mpsc::Sender<SessionEvent>,
) -> Result<(), SessionError> {
    let finalize_json = serde_json::to_string(&ClientMessage::Finalize)
        .map_err(|e| SessionError::Protocol(format!("failed to encode finalize: {}", e)))?;
    ws.send(Message::Text(finalize_json.into()))
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;

    let deadline = Instant::now() + Duration::from_millis(config.finalize_timeout_ms);
    let mut acked = false;
    while Instant::now() < deadline {
        let remaining = deadline - Instant::now();
        match timeout(remaining, ws.next()).await {
            Ok(Some(Ok(message))) => {
                if message_acks_finalize(&message) {
                    acked = true;
                }
                handle_server_message(session_id, message, event_tx).await?;
                if acked {
                    break;
                }
            }
            Ok(Some(Err(e))) => {
                warn!(%session_id, error = %e, "transport error while awaiting finalize ack");
                break;
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    if !acked {
        warn!(
            %session_id,
            timeout_ms = config.finalize_timeout_ms,
            "finalize not acknowledged within the deadline, closing anyway"
        );
    }
    close_and_drop(ws).await;
    debug!(%session_id, "streaming session closed");
    Ok(())
}

/// Send the close frame on a best-effort basis and drop the socket. We
/// deliberately do not await the WebSocket close handshake; a stuck
/// server must not delay the next dictation.
async fn close_and_drop(mut ws: WsStream) {
    if let Ok(json) = serde_json::to_string(&ClientMessage::Close) {
        let _ = ws.send(Message::Text(json.into())).await;
    }
    drop(ws);
}

fn message_acks_finalize(message: &Message) -> bool {
    let Message::Text(text) = message else {
        return false;
    };
    match serde_json::from_str::<ServerMessage>(text.as_ref()) {
        Ok(ServerMessage::FinalizeAck) => true,
        Ok(ServerMessage::Transcript {
            is_final,
            from_finalize,
            ..
        }) => is_final && from_finalize,
        _ => false,
    }
}

async fn handle_server_message(
    session_id: Uuid,
    message: Message,
    event_tx: &mpsc::Sender<SessionEvent>,
) -> Result<(), SessionError> {
    let text = match message {
        Message::Text(text) => text,
        Message::Ping(_) | Message::Pong(_) => return Ok(()),
        Message::Close(frame) => {
            debug!(%session_id, ?frame, "server sent close frame");
            return Ok(());
        }
        other => {
            debug!(%session_id, "ignoring unexpected frame type: {:?}", other);
            return Ok(());
        }
    };
    let parsed: ServerMessage = match serde_json::from_str(text.as_ref()) {
        Ok(parsed) => parsed,
        Err(e) => {
            // Malformed frames are logged and skipped; they must not
            // take the session down.
            warn!(%session_id, error = %e, "ignoring malformed server message");
            return Ok(());
        }
    };
    match parsed {
        ServerMessage::Transcript {
            text,
            is_final,
            confidence,
            from_finalize,
        } => {
            let event = TranscriptEvent {
                kind: if is_final {
                    TranscriptKind::Final
                } else {
                    TranscriptKind::Interim
                },
                text,
                confidence,
                from_finalize,
            };
            let _ = event_tx.send(SessionEvent::Transcript(event)).await;
        }
        ServerMessage::FinalizeAck => {
            debug!(%session_id, "finalize acknowledged");
        }
        ServerMessage::Error {
            code,
            message,
            fatal,
        } => {
            if fatal {
                return Err(SessionError::Fatal { code, message });
            }
            warn!(%session_id, code, %message, "non-fatal backend error");
        }
    }
    Ok(())
}
