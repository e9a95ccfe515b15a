//! The per-call control loop.
//!
//! One task owns all mutable call state: the turn-taking state machine, the
//! tagged audio buffer, the active response id, and every timer. Everything
//! else talks to it over one mpsc channel, so there is no locking anywhere
//! on the hot path and event ordering is total within a call.

use crate::audio_utils;
use crate::call::registry::{SessionHandle, SessionRegistry};
use crate::config::SessionConfig;
use crate::db::Db;
use crate::models::CallStatus;
use crate::protocol::TelephonyEvent;
use crate::providers::ProviderSet;
use bytes::Bytes;
use rubato::FastFixedIn;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use voicegate_core::{
    AudioBuffer, CallState, OutboundChunk, ProviderEvent, RaceConfig, RaceEvent, RaceLap,
    ResponseId, Speaker, Transition, TurnContext, TurnEvent, TurnMessage, start_race,
};

/// Everything that can reach a session's control loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// A JSON event from the telephony media socket.
    Telephony(TelephonyEvent),
    /// One binary frame of caller audio (PCM16 at the telephony rate).
    InboundAudio(Bytes),
    /// The media socket went away.
    RelayClosed,
}

/// What the session asks the media relay to do.
#[derive(Debug)]
pub enum RelayCommand {
    /// Deliver one frame of agent audio to the caller.
    Audio(Bytes),
    /// Terminate the call leg.
    Hangup,
}

/// Summary handed back when the control loop exits, persisted best-effort.
#[derive(Debug)]
pub struct SessionReport {
    pub call_id: String,
    pub status: CallStatus,
    pub transcript: Option<String>,
    pub avg_response_ms: Option<f64>,
    pub race_history: Vec<RaceLap>,
    pub interruptions: u32,
}

enum Step {
    Control(Option<SessionEvent>),
    Race(Option<RaceEvent>),
    TimeoutTest,
    SilenceTimeout,
    Cancelled,
}

pub struct CallSession {
    call_id: String,
    cfg: SessionConfig,
    providers: Arc<ProviderSet>,
    cancel: CancellationToken,
    relay_tx: mpsc::Sender<RelayCommand>,
    /// Pre-rendered utterance for the response-timeout test monitor.
    timeout_audio: Option<Bytes>,

    state: CallState,
    buffer: AudioBuffer,
    active_response: Option<ResponseId>,
    winner_name: Option<String>,
    race_rx: Option<mpsc::Receiver<RaceEvent>>,
    suppress_until: Option<Instant>,
    /// Id cancelled at the last barge-in. A late chunk still carrying it
    /// must never open a new generation, however long the network sat on it.
    recently_cancelled: Option<ResponseId>,
    /// Bytes of the active generation actually handed to the relay, at the
    /// telephony rate. Basis for the truncation offset on barge-in.
    played_bytes: u64,
    downsampler: FastFixedIn<f32>,

    history: Vec<TurnMessage>,
    transcript_partial: String,
    race_history: Vec<RaceLap>,
    response_times: Vec<std::time::Duration>,
    speech_stopped_at: Option<Instant>,
    last_caller_activity: Instant,
    interruptions: u32,
    timeout_test_at: Option<Instant>,
}

impl CallSession {
    pub fn new(
        call_id: String,
        cfg: SessionConfig,
        providers: Arc<ProviderSet>,
        cancel: CancellationToken,
        relay_tx: mpsc::Sender<RelayCommand>,
        timeout_audio: Option<Bytes>,
    ) -> anyhow::Result<Self> {
        let downsampler = audio_utils::create_resampler(
            audio_utils::PROVIDER_PCM16_SAMPLE_RATE,
            audio_utils::TELEPHONY_PCM16_SAMPLE_RATE,
            512,
        )?;
        Ok(CallSession {
            call_id,
            cfg,
            providers,
            cancel,
            relay_tx,
            timeout_audio,
            state: CallState::Idle,
            buffer: AudioBuffer::new(),
            active_response: None,
            winner_name: None,
            race_rx: None,
            suppress_until: None,
            recently_cancelled: None,
            played_bytes: 0,
            downsampler,
            history: Vec::new(),
            transcript_partial: String::new(),
            race_history: Vec::new(),
            response_times: Vec::new(),
            speech_stopped_at: None,
            last_caller_activity: Instant::now(),
            interruptions: 0,
            timeout_test_at: None,
        })
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) -> SessionReport {
        info!("session started");
        let status = loop {
            let silence_at = self.last_caller_activity + self.cfg.silence_hangup;
            let timeout_at = self.timeout_test_at;
            let mut race_rx = self.race_rx.take();
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancelled,
                maybe = events.recv() => Step::Control(maybe),
                maybe = race_recv(&mut race_rx) => Step::Race(maybe),
                _ = sleep_until(timeout_at.unwrap_or_else(Instant::now)), if timeout_at.is_some() => {
                    Step::TimeoutTest
                }
                _ = sleep_until(silence_at) => Step::SilenceTimeout,
            };
            self.race_rx = race_rx;
            match step {
                Step::Cancelled => {
                    info!("session cancelled");
                    break CallStatus::Completed;
                }
                Step::Control(None) => break CallStatus::Completed,
                Step::Control(Some(event)) => {
                    if let Some(status) = self.handle_control(event).await {
                        break status;
                    }
                }
                Step::Race(Some(event)) => self.handle_race_event(event).await,
                Step::Race(None) => {
                    self.race_rx = None;
                }
                Step::TimeoutTest => self.fire_timeout_test().await,
                Step::SilenceTimeout => {
                    warn!(
                        idle_secs = self.cfg.silence_hangup.as_secs(),
                        "no caller speech; hanging up"
                    );
                    let _ = self.relay_tx.send(RelayCommand::Hangup).await;
                    break CallStatus::Completed;
                }
            }
        };

        // Drop any in-flight race so the racer cancels its winner.
        self.race_rx = None;
        let avg_response_ms = if self.response_times.is_empty() {
            None
        } else {
            let total: f64 = self
                .response_times
                .iter()
                .map(|d| d.as_secs_f64() * 1000.0)
                .sum();
            Some(total / self.response_times.len() as f64)
        };
        let transcript = if self.history.is_empty() {
            None
        } else {
            Some(
                self.history
                    .iter()
                    .map(|m| {
                        let who = match m.role {
                            Speaker::Caller => "caller",
                            Speaker::Agent => "agent",
                        };
                        format!("{who}: {}", m.text)
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        };
        info!(
            status = %status,
            turns = self.response_times.len(),
            interruptions = self.interruptions,
            stale_chunks = self.buffer.stale_dropped(),
            "session finished"
        );
        SessionReport {
            call_id: self.call_id,
            status,
            transcript,
            avg_response_ms,
            race_history: self.race_history,
            interruptions: self.interruptions,
        }
    }

    /// Apply a turn event, logging and swallowing out-of-order arrivals.
    fn apply_event(&mut self, event: TurnEvent) -> bool {
        match self.state.apply(event) {
            Transition::To(next) => {
                debug!(from = ?self.state, to = ?next, event = ?event, "state transition");
                self.state = next;
                true
            }
            Transition::Ignored => {
                warn!(state = ?self.state, event = ?event, "ignoring out-of-order event");
                false
            }
        }
    }

    async fn handle_control(&mut self, event: SessionEvent) -> Option<CallStatus> {
        match event {
            SessionEvent::Telephony(TelephonyEvent::Answered) => {
                if self.apply_event(TurnEvent::CallAnswered) {
                    self.last_caller_activity = Instant::now();
                    if !self.cfg.greeting_instructions.is_empty()
                        && self.apply_event(TurnEvent::SpeechStopped)
                    {
                        // Greet without waiting for the caller to speak.
                        self.start_turn(true);
                    }
                }
                None
            }
            SessionEvent::Telephony(TelephonyEvent::SpeechStarted) => {
                self.last_caller_activity = Instant::now();
                match self.state {
                    CallState::Speaking => self.handle_barge_in().await,
                    CallState::Thinking => {
                        debug!("caller resumed before any audio; abandoning pending generation");
                        self.abandon_turn();
                        self.apply_event(TurnEvent::SpeechStarted);
                    }
                    _ => {
                        self.apply_event(TurnEvent::SpeechStarted);
                    }
                }
                None
            }
            SessionEvent::Telephony(TelephonyEvent::SpeechStopped { transcript }) => {
                self.last_caller_activity = Instant::now();
                if self.apply_event(TurnEvent::SpeechStopped) {
                    if let Some(text) = transcript.filter(|t| !t.is_empty()) {
                        self.history.push(TurnMessage {
                            role: Speaker::Caller,
                            text,
                        });
                    }
                    self.speech_stopped_at = Some(Instant::now());
                    self.start_turn(false);
                }
                None
            }
            SessionEvent::Telephony(TelephonyEvent::Hangup) => {
                info!("caller hung up");
                Some(CallStatus::Completed)
            }
            SessionEvent::InboundAudio(frame) => {
                if let Some(ingress) = &self.providers.ingress {
                    // Drop frames rather than stall the control loop.
                    let _ = ingress.try_send(frame);
                }
                None
            }
            SessionEvent::RelayClosed => {
                info!("media socket closed");
                Some(CallStatus::Completed)
            }
        }
    }

    /// Kick off one generation race for the current turn.
    fn start_turn(&mut self, greeting: bool) {
        let instructions = if greeting {
            format!(
                "{}\n\n{}",
                self.cfg.instructions, self.cfg.greeting_instructions
            )
        } else {
            self.cfg.instructions.clone()
        };
        let ctx = TurnContext {
            instructions,
            voice: self.cfg.voice.clone(),
            history: self.history.clone(),
        };
        let rx = start_race(
            self.providers.candidates.clone(),
            self.providers.fallback.clone(),
            ctx,
            RaceConfig {
                fallback_after: self.cfg.fallback_after,
            },
            &self.cancel,
        );
        self.race_rx = Some(rx);
        if self.cfg.timeout_test_enabled && self.timeout_audio.is_some() {
            self.timeout_test_at = Some(Instant::now() + self.cfg.timeout_test_after);
        }
    }

    /// Forget the in-flight generation without a barge-in (e.g. the caller
    /// resumed while we were still thinking).
    fn abandon_turn(&mut self) {
        self.race_rx = None;
        self.active_response = None;
        self.winner_name = None;
        self.timeout_test_at = None;
        self.speech_stopped_at = None;
        self.buffer.clear();
    }

    /// Barge-in while the agent is speaking: cancel remotely, truncate the
    /// backend history to what was actually heard, flush local audio, open
    /// the suppression window, and go back to listening.
    async fn handle_barge_in(&mut self) {
        self.interruptions += 1;
        self.apply_event(TurnEvent::SpeechStarted);
        let played_ms = (self.played_bytes > 0).then(|| {
            audio_utils::pcm16_bytes_to_ms(
                self.played_bytes,
                audio_utils::TELEPHONY_PCM16_SAMPLE_RATE,
            )
        });
        let response_id = self.active_response.take();
        let winner = self.winner_name.take();
        self.recently_cancelled = response_id.clone();
        if let (Some(id), Some(name)) = (response_id, winner)
            && let Some(provider) = self.providers.provider_named(&name)
        {
            // Remote cancel and truncate are best-effort and must not block
            // the control loop.
            tokio::spawn(async move {
                provider.cancel_response(&id).await;
                provider.truncate_conversation(&id, played_ms).await;
            });
        }
        let dropped = self.buffer.clear();
        self.suppress_until = Some(Instant::now() + self.cfg.suppression_window);
        self.race_rx = None;
        self.timeout_test_at = None;
        if !self.transcript_partial.is_empty() {
            // Keep what the agent managed to say before being cut off.
            let text = std::mem::take(&mut self.transcript_partial);
            self.history.push(TurnMessage {
                role: Speaker::Agent,
                text,
            });
        }
        self.apply_event(TurnEvent::InterruptionHandled);
        info!(
            dropped_chunks = dropped,
            played_ms = ?played_ms,
            "barge-in: cancelled active response"
        );
    }

    async fn handle_race_event(&mut self, event: RaceEvent) {
        match event {
            RaceEvent::Lap(lap) => {
                if lap.won {
                    self.winner_name = Some(lap.provider.clone());
                }
                self.race_history.push(lap);
            }
            RaceEvent::FallbackStarted { provider } => {
                info!(provider, "emergency fallback request started");
            }
            RaceEvent::Provider(ProviderEvent::ResponseStarted { .. }) => {}
            RaceEvent::Provider(ProviderEvent::AudioChunk {
                response_id,
                audio,
                transcript_delta,
            }) => {
                self.on_audio_chunk(response_id, audio, transcript_delta)
                    .await;
            }
            RaceEvent::Provider(ProviderEvent::ResponseDone {
                response_id,
                transcript,
            }) => {
                if self.active_response.as_ref() == Some(&response_id) {
                    let text = match transcript {
                        Some(text) if !text.is_empty() => text,
                        _ => std::mem::take(&mut self.transcript_partial),
                    };
                    if !text.is_empty() {
                        self.history.push(TurnMessage {
                            role: Speaker::Agent,
                            text,
                        });
                    }
                    self.transcript_partial.clear();
                    self.active_response = None;
                    self.winner_name = None;
                    self.apply_event(TurnEvent::GenerationDone);
                } else {
                    debug!(response_id = %response_id, "done event for a non-active response");
                }
            }
            RaceEvent::Aborted { provider, error } => {
                warn!(provider, error = %error, "active generation aborted");
                self.active_response = None;
                self.winner_name = None;
                self.buffer.clear();
                self.timeout_test_at = None;
                self.apply_event(TurnEvent::GenerationDone);
            }
            RaceEvent::Exhausted => {
                warn!("no provider produced audio for this turn");
                self.active_response = None;
                self.winner_name = None;
                self.apply_event(TurnEvent::GenerationDone);
                // The timeout-test monitor, if armed, stays armed and will
                // cover the silence with the canned utterance.
            }
        }
    }

    async fn on_audio_chunk(
        &mut self,
        response_id: ResponseId,
        audio: Bytes,
        transcript_delta: Option<String>,
    ) {
        let now = Instant::now();
        if self.active_response.is_none() {
            if self.recently_cancelled.as_ref() == Some(&response_id) {
                debug!(response_id = %response_id, "dropping late chunk from the cancelled response");
                return;
            }
            if !self.apply_event(TurnEvent::FirstToken) {
                debug!(response_id = %response_id, "dropping audio outside an active turn");
                return;
            }
            if let Some(asked) = self.speech_stopped_at.take() {
                let latency = asked.elapsed();
                info!(latency_ms = latency.as_millis() as u64, "first token");
                self.response_times.push(latency);
            }
            self.timeout_test_at = None;
            self.active_response = Some(response_id.clone());
            self.recently_cancelled = None;
            self.buffer.begin_generation(response_id.clone());
            self.played_bytes = 0;
        } else if self.active_response.as_ref() != Some(&response_id) {
            // Only the active generation may speak; anything else is either
            // inside the post-interruption suppression window or plain stale.
            if self.suppress_until.is_some_and(|until| now < until) {
                debug!(response_id = %response_id, "dropping suppressed audio chunk");
            } else {
                warn!(response_id = %response_id, "dropping stale audio chunk");
            }
            return;
        }
        if let Some(delta) = transcript_delta {
            self.transcript_partial.push_str(&delta);
        }
        // Providers synthesize at 24 kHz; the telephony leg runs at 16 kHz.
        let samples = audio_utils::decode_f32_from_pcm16_bytes(&audio);
        let resampled = audio_utils::resample_chunks(&mut self.downsampler, &samples);
        let frame = Bytes::from(audio_utils::encode_f32_to_pcm16_bytes(&resampled));
        if frame.is_empty() {
            return;
        }
        if self.buffer.push(OutboundChunk {
            response_id,
            audio: frame,
        }) {
            self.flush_buffer().await;
        }
    }

    async fn flush_buffer(&mut self) {
        while let Some(chunk) = self.buffer.pop_next() {
            self.played_bytes += chunk.audio.len() as u64;
            if self
                .relay_tx
                .send(RelayCommand::Audio(chunk.audio))
                .await
                .is_err()
            {
                debug!("relay channel closed; dropping outbound audio");
                return;
            }
        }
    }

    async fn fire_timeout_test(&mut self) {
        self.timeout_test_at = None;
        warn!(
            threshold_ms = self.cfg.timeout_test_after.as_millis() as u64,
            "no audio before the response-timeout threshold; playing canned utterance"
        );
        if let Some(audio) = self.timeout_audio.clone() {
            let _ = self.relay_tx.send(RelayCommand::Audio(audio)).await;
        }
    }
}

async fn race_recv(rx: &mut Option<mpsc::Receiver<RaceEvent>>) -> Option<RaceEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Create a session's channels and spawn its control loop. The returned
/// handle is what the registry stores; when the loop exits the record is
/// persisted best-effort and the handle deregisters itself.
pub fn spawn_session(
    registry: Arc<SessionRegistry>,
    db: Option<Arc<Db>>,
    providers: Arc<ProviderSet>,
    cfg: SessionConfig,
    timeout_audio: Option<Bytes>,
    call_id: String,
) -> anyhow::Result<Arc<SessionHandle>> {
    let (events_tx, events_rx) = mpsc::channel(256);
    let (relay_tx, relay_rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    let handle = Arc::new(SessionHandle::new(
        call_id.clone(),
        events_tx,
        cancel.clone(),
        relay_rx,
    ));
    let session = CallSession::new(
        call_id.clone(),
        cfg,
        providers,
        cancel,
        relay_tx,
        timeout_audio,
    )?;
    let task_handle = handle.clone();
    tokio::spawn(
        async move {
            let report = session.run(events_rx).await;
            if let Some(db) = db
                && let Err(err) = db
                    .log_call_end(
                        &report.call_id,
                        report.status,
                        report.transcript.as_deref(),
                        report.avg_response_ms,
                        &report.race_history,
                    )
                    .await
            {
                // Persistence is observability only; the call is already over.
                error!(error = %err, "failed to persist call record");
            }
            task_handle.release_resources().await;
            registry.remove_if_current(&task_handle).await;
        }
        .instrument(info_span!("call_session", call_id = %call_id)),
    );
    Ok(handle)
}
