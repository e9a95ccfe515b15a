//! Media relay for the telephony websocket.
//!
//! The telephony platform connects one websocket per call leg: binary frames
//! are caller PCM16 audio, text frames are JSON events from its VAD. The
//! relay is deliberately dumb. It forwards both into the session's control
//! loop and pumps the session's outbound commands back onto the socket; all
//! decisions live in the session.

use crate::call::session::{RelayCommand, SessionEvent};
use crate::protocol::TelephonyEvent;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(call_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, call_id, state))
}

#[instrument(skip(socket, state), fields(call_id = %call_id))]
async fn handle_socket(socket: WebSocket, call_id: String, state: Arc<AppState>) {
    let Some(session) = state.registry.get(&call_id).await else {
        warn!("media socket for unknown call id; dropping");
        return;
    };
    let Some(mut relay_rx) = session.attach_relay().await else {
        warn!("media socket already attached for this call; dropping duplicate");
        return;
    };
    info!("media socket connected");

    let (mut sink, mut stream) = socket.split();

    // Outbound pump: session commands onto the wire.
    let outbound = tokio::spawn(async move {
        while let Some(command) = relay_rx.recv().await {
            let result = match command {
                RelayCommand::Audio(frame) => sink.send(Message::Binary(frame)).await,
                RelayCommand::Hangup => {
                    debug!("session requested hangup; closing media socket");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                debug!("media socket send failed; stopping outbound pump");
                break;
            }
        }
    });

    // The platform does not announce the media leg explicitly; the socket
    // connecting is the answer signal.
    if session
        .events
        .send(SessionEvent::Telephony(TelephonyEvent::Answered))
        .await
        .is_err()
    {
        warn!("session gone before media socket attached");
        outbound.abort();
        return;
    }

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(frame)) => {
                if session
                    .events
                    .send(SessionEvent::InboundAudio(frame))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Text(text)) => match serde_json::from_str::<TelephonyEvent>(text.as_str())
            {
                Ok(event) => {
                    if session
                        .events
                        .send(SessionEvent::Telephony(event))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, raw = %text, "unrecognized telephony event");
                }
            },
            Ok(Message::Close(_)) => {
                info!("media socket closed by peer");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "media socket error");
                break;
            }
        }
    }

    let _ = session.events.send(SessionEvent::RelayClosed).await;
    outbound.abort();
    info!("media socket finished");
}
