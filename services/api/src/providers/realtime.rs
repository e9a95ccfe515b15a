//! Realtime speech-to-speech backend over the OpenAI realtime websocket.
//!
//! One connection per call, opened lazily on the first turn. Caller audio is
//! streamed in continuously (upsampled from the 16 kHz telephony rate to the
//! backend's 24 kHz); each turn is driven explicitly with `response.create`,
//! so the gateway stays in charge of turn-taking while the backend's VAD only
//! segments the input buffer.

use crate::audio_utils;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};
use voicegate_core::{
    BrainProvider, ProviderError, ProviderEvent, ResponseId, ResponseStream, RetryPolicy,
    TurnContext,
};

// Local wire types for the realtime protocol (for encapsulation).
mod wire {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize)]
    #[serde(tag = "type")]
    pub(super) enum ClientEvent {
        #[serde(rename = "session.update")]
        SessionUpdate { session: SessionUpdate },
        #[serde(rename = "input_audio_buffer.append")]
        InputAudioBufferAppend { audio: String },
        #[serde(rename = "response.create")]
        ResponseCreate { response: ResponseCreate },
        #[serde(rename = "response.cancel")]
        ResponseCancel { response_id: String },
        #[serde(rename = "conversation.item.truncate")]
        ConversationItemTruncate {
            item_id: String,
            content_index: u32,
            audio_end_ms: u64,
        },
    }

    #[derive(Serialize)]
    pub(super) struct SessionUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub modalities: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub instructions: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub voice: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub input_audio_format: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub output_audio_format: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub turn_detection: Option<TurnDetection>,
    }

    #[derive(Serialize)]
    pub(super) struct TurnDetection {
        #[serde(rename = "type")]
        pub kind: String,
        pub threshold: f32,
        pub prefix_padding_ms: u64,
        pub silence_duration_ms: u64,
        /// The gateway drives turns itself; the backend VAD only segments
        /// the input buffer.
        pub create_response: bool,
        pub interrupt_response: bool,
    }

    #[derive(Serialize, Default)]
    pub(super) struct ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub instructions: Option<String>,
    }

    /// One flattened shape covers every server event we care about; the
    /// `type` string selects which fields are meaningful.
    #[derive(Deserialize, Debug)]
    pub(super) struct ServerEvent {
        #[serde(rename = "type")]
        pub kind: String,
        pub response_id: Option<String>,
        pub item_id: Option<String>,
        pub delta: Option<String>,
        pub response: Option<ResponsePayload>,
        pub error: Option<ErrorPayload>,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ResponsePayload {
        pub id: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ErrorPayload {
        pub message: Option<String>,
    }
}

type TurnSender = mpsc::Sender<Result<ProviderEvent, ProviderError>>;

/// State the reader task routes into.
struct Shared {
    provider: String,
    turn: StdMutex<Option<TurnState>>,
    /// response id -> conversation item id, kept for truncation after the
    /// response is already cancelled.
    items: StdMutex<HashMap<String, String>>,
}

struct TurnState {
    tx: TurnSender,
    transcript: String,
    /// Transcript text not yet attached to an audio chunk.
    pending_delta: String,
}

struct Connection {
    out_tx: mpsc::Sender<wire::ClientEvent>,
    alive: Arc<std::sync::atomic::AtomicBool>,
}

pub struct RealtimeProvider {
    name: String,
    api_key: String,
    model: String,
    vad_threshold: f32,
    vad_silence_ms: u64,
    retry: RetryPolicy,
    /// Caller audio feed, consumed by the ingress task once connected.
    ingress: StdMutex<Option<mpsc::Receiver<Bytes>>>,
    conn: Mutex<Option<Connection>>,
    shared: Arc<Shared>,
}

impl RealtimeProvider {
    pub fn new(
        api_key: String,
        model: String,
        vad_threshold: f32,
        vad_silence_ms: u64,
        ingress: mpsc::Receiver<Bytes>,
    ) -> Self {
        let name = format!("realtime/{model}");
        RealtimeProvider {
            shared: Arc::new(Shared {
                provider: name.clone(),
                turn: StdMutex::new(None),
                items: StdMutex::new(HashMap::new()),
            }),
            name,
            api_key,
            model,
            vad_threshold,
            vad_silence_ms,
            retry: RetryPolicy::default(),
            ingress: StdMutex::new(Some(ingress)),
            conn: Mutex::new(None),
        }
    }

    /// Connect lazily, reusing the live connection when there is one.
    async fn ensure_connected(&self) -> Result<mpsc::Sender<wire::ClientEvent>, ProviderError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref()
            && conn.alive.load(std::sync::atomic::Ordering::SeqCst)
        {
            return Ok(conn.out_tx.clone());
        }

        let mut attempt = 0;
        let ws_stream = loop {
            match self.open_socket().await {
                Ok(stream) => break stream,
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(ProviderError::Unavailable {
                            provider: self.name.clone(),
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    warn!(
                        provider = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "realtime connect failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };
        info!(provider = %self.name, "realtime websocket connected");

        let (mut sink, mut source) = ws_stream.split();
        let alive = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (out_tx, mut out_rx) = mpsc::channel::<wire::ClientEvent>(256);

        // Writer: serialize client events onto the wire.
        let writer_alive = alive.clone();
        let writer_provider = self.name.clone();
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(provider = %writer_provider, error = %err, "unserializable client event");
                        continue;
                    }
                };
                if let Err(err) = sink.send(WsMessage::Text(text.into())).await {
                    warn!(provider = %writer_provider, error = %err, "realtime send failed");
                    break;
                }
            }
            writer_alive.store(false, std::sync::atomic::Ordering::SeqCst);
        });

        // Reader: route server events into the current turn.
        let shared = self.shared.clone();
        let reader_alive = alive.clone();
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => route(&shared, &text).await,
                    Ok(WsMessage::Close(frame)) => {
                        warn!(provider = %shared.provider, ?frame, "realtime websocket closed by server");
                        break;
                    }
                    Err(err) => {
                        warn!(provider = %shared.provider, error = %err, "realtime websocket error");
                        break;
                    }
                    _ => {}
                }
            }
            reader_alive.store(false, std::sync::atomic::Ordering::SeqCst);
            fail_turn(&shared, "realtime connection lost").await;
        });

        // Ingress: upsample telephony audio and stream it into the input
        // buffer. The receiver can only be consumed once per call.
        if let Some(mut ingress_rx) = self.ingress.lock().expect("ingress lock").take() {
            let ingress_tx = out_tx.clone();
            let ingress_provider = self.name.clone();
            tokio::spawn(async move {
                let mut upsampler = match audio_utils::create_resampler(
                    audio_utils::TELEPHONY_PCM16_SAMPLE_RATE,
                    audio_utils::PROVIDER_PCM16_SAMPLE_RATE,
                    512,
                ) {
                    Ok(resampler) => resampler,
                    Err(err) => {
                        warn!(provider = %ingress_provider, error = %err, "failed to create upsampler");
                        return;
                    }
                };
                while let Some(frame) = ingress_rx.recv().await {
                    let samples = audio_utils::decode_f32_from_pcm16_bytes(&frame);
                    let resampled = audio_utils::resample_chunks(&mut upsampler, &samples);
                    if resampled.is_empty() {
                        continue;
                    }
                    let audio = audio_utils::encode_f32_to_base64_i16(&resampled);
                    if ingress_tx
                        .send(wire::ClientEvent::InputAudioBufferAppend { audio })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                debug!(provider = %ingress_provider, "caller audio ingress finished");
            });
        }

        // Session parameters: raw PCM16 both ways, backend VAD segments the
        // input but never starts or interrupts responses on its own.
        let session_update = wire::ClientEvent::SessionUpdate {
            session: wire::SessionUpdate {
                modalities: Some(vec!["text".to_string(), "audio".to_string()]),
                instructions: None,
                voice: None,
                input_audio_format: Some("pcm16".to_string()),
                output_audio_format: Some("pcm16".to_string()),
                turn_detection: Some(wire::TurnDetection {
                    kind: "server_vad".to_string(),
                    threshold: self.vad_threshold,
                    prefix_padding_ms: 200,
                    silence_duration_ms: self.vad_silence_ms,
                    create_response: false,
                    interrupt_response: false,
                }),
            },
        };
        out_tx
            .send(session_update)
            .await
            .map_err(|_| ProviderError::Protocol {
                provider: self.name.clone(),
                message: "realtime connection closed during setup".to_string(),
            })?;

        *guard = Some(Connection {
            out_tx: out_tx.clone(),
            alive,
        });
        Ok(out_tx)
    }

    async fn open_socket(
        &self,
    ) -> anyhow::Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let url = format!("wss://api.openai.com/v1/realtime?model={}", self.model);
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {}", self.api_key).parse()?);
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse()?);
        let (ws_stream, _) = connect_async(request).await?;
        Ok(ws_stream)
    }

    async fn send_event(&self, event: wire::ClientEvent) {
        let out_tx = {
            let guard = self.conn.lock().await;
            guard.as_ref().map(|conn| conn.out_tx.clone())
        };
        match out_tx {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    warn!(provider = %self.name, "realtime connection gone; event dropped");
                }
            }
            None => debug!(provider = %self.name, "no realtime connection; event dropped"),
        }
    }
}

#[async_trait]
impl BrainProvider for RealtimeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin_response(&self, ctx: &TurnContext) -> Result<ResponseStream, ProviderError> {
        let out_tx = self.ensure_connected().await?;

        let (tx, rx) = mpsc::channel(64);
        {
            let mut turn = self.shared.turn.lock().expect("turn lock");
            if turn.is_some() {
                debug!(provider = %self.name, "replacing unfinished turn");
            }
            *turn = Some(TurnState {
                tx,
                transcript: String::new(),
                pending_delta: String::new(),
            });
        }

        // Voice and persona ride along per turn; the connection itself stays
        // persona-free so one socket serves the whole call.
        let update = wire::ClientEvent::SessionUpdate {
            session: wire::SessionUpdate {
                modalities: None,
                instructions: Some(ctx.instructions.clone()),
                voice: Some(ctx.voice.clone()),
                input_audio_format: None,
                output_audio_format: None,
                turn_detection: None,
            },
        };
        let create = wire::ClientEvent::ResponseCreate {
            response: wire::ResponseCreate { instructions: None },
        };
        for event in [update, create] {
            out_tx.send(event).await.map_err(|_| ProviderError::Protocol {
                provider: self.name.clone(),
                message: "realtime connection closed while starting a response".to_string(),
            })?;
        }

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn cancel_response(&self, response_id: &ResponseId) {
        debug!(provider = %self.name, response_id = %response_id, "cancelling realtime response");
        // Addressed by id: a cancel racing with the next turn's
        // response.create must not kill the fresh response.
        self.send_event(wire::ClientEvent::ResponseCancel {
            response_id: response_id.as_str().to_string(),
        })
        .await;
    }

    async fn truncate_conversation(&self, response_id: &ResponseId, audio_end_ms: Option<u64>) {
        let item_id = {
            let items = self.shared.items.lock().expect("items lock");
            items.get(response_id.as_str()).cloned()
        };
        let Some(item_id) = item_id else {
            warn!(
                provider = %self.name,
                response_id = %response_id,
                "no conversation item recorded for response; cannot truncate"
            );
            return;
        };
        debug!(
            provider = %self.name,
            response_id = %response_id,
            item_id,
            audio_end_ms = ?audio_end_ms,
            "truncating conversation item"
        );
        self.send_event(wire::ClientEvent::ConversationItemTruncate {
            item_id,
            content_index: 0,
            audio_end_ms: audio_end_ms.unwrap_or(0),
        })
        .await;
    }
}

/// Route one server event into the current turn.
async fn route(shared: &Arc<Shared>, text: &str) {
    let event: wire::ServerEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            debug!(provider = %shared.provider, error = %err, "unparseable realtime event");
            return;
        }
    };
    match event.kind.as_str() {
        "response.created" => {
            let Some(id) = event.response.and_then(|r| r.id) else {
                return;
            };
            let tx = {
                let turn = shared.turn.lock().expect("turn lock");
                turn.as_ref().map(|t| t.tx.clone())
            };
            if let Some(tx) = tx {
                let _ = tx
                    .send(Ok(ProviderEvent::ResponseStarted {
                        response_id: ResponseId(id),
                    }))
                    .await;
            }
        }
        "response.audio.delta" => {
            let (Some(response_id), Some(delta)) = (event.response_id, event.delta) else {
                return;
            };
            if let Some(item_id) = event.item_id {
                shared
                    .items
                    .lock()
                    .expect("items lock")
                    .insert(response_id.clone(), item_id);
            }
            let audio = Bytes::from(audio_utils::decode_pcm16_base64(&delta));
            if audio.is_empty() {
                return;
            }
            let routed = {
                let mut turn = shared.turn.lock().expect("turn lock");
                turn.as_mut().map(|t| {
                    let pending = std::mem::take(&mut t.pending_delta);
                    (t.tx.clone(), pending)
                })
            };
            let Some((tx, pending)) = routed else {
                debug!(provider = %shared.provider, "audio delta with no active turn");
                return;
            };
            let transcript_delta = (!pending.is_empty()).then_some(pending);
            let _ = tx
                .send(Ok(ProviderEvent::AudioChunk {
                    response_id: ResponseId(response_id),
                    audio,
                    transcript_delta,
                }))
                .await;
        }
        "response.audio_transcript.delta" => {
            if let Some(delta) = event.delta {
                let mut turn = shared.turn.lock().expect("turn lock");
                if let Some(t) = turn.as_mut() {
                    t.transcript.push_str(&delta);
                    t.pending_delta.push_str(&delta);
                }
            }
        }
        "response.done" => {
            let Some(id) = event.response.and_then(|r| r.id) else {
                return;
            };
            let finished = shared.turn.lock().expect("turn lock").take();
            if let Some(t) = finished {
                let transcript = (!t.transcript.is_empty()).then_some(t.transcript);
                let _ = t
                    .tx
                    .send(Ok(ProviderEvent::ResponseDone {
                        response_id: ResponseId(id),
                        transcript,
                    }))
                    .await;
            }
        }
        "error" => {
            let message = event
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "unspecified realtime error".to_string());
            warn!(provider = %shared.provider, message, "realtime server error");
            fail_turn(shared, &message).await;
        }
        _ => {}
    }
}

/// End the current turn with a protocol error, if one is in flight.
async fn fail_turn(shared: &Arc<Shared>, message: &str) {
    let failed = shared.turn.lock().expect("turn lock").take();
    if let Some(t) = failed {
        let _ = t
            .tx
            .send(Err(ProviderError::Protocol {
                provider: shared.provider.clone(),
                message: message.to_string(),
            }))
            .await;
    }
}
