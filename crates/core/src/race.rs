//! Racing one turn across several brain providers.
//!
//! Every candidate gets its own probe task that waits for the provider's
//! first audio. The first provider to produce audio wins the turn; everyone
//! else is cancelled remotely and their output never leaves this module. An
//! emergency fallback timer bounds worst-case time-to-first-token: if no
//! candidate is audible within the deadline, exactly one extra request goes
//! to the designated fallback provider, joining under the same
//! single-winner rule.

use crate::provider::{
    BrainProvider, ProviderError, ProviderEvent, ResponseId, ResponseStream, TurnContext,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// First tokens landing within this window count as simultaneous; candidate
/// list order decides the winner instead of arrival timestamps.
const TIE_BREAK_WINDOW: Duration = Duration::from_millis(1);

/// Probe index reserved for the fallback request. Highest index, so an
/// original candidate always beats the fallback in a tie.
const FALLBACK_INDEX: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Emergency fallback deadline, measured from race start on the
    /// monotonic clock.
    pub fallback_after: Duration,
}

/// One provider's result in a race, kept for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceLap {
    pub provider: String,
    pub elapsed_ms: u64,
    pub won: bool,
}

/// What the session's control loop receives from a running race.
#[derive(Debug)]
pub enum RaceEvent {
    /// An event from the winning provider's stream.
    Provider(ProviderEvent),
    /// A provider reached first audio; exactly one lap has `won == true`.
    Lap(RaceLap),
    /// The fallback timer fired (or every candidate failed early) and the
    /// one permitted fallback request was issued.
    FallbackStarted { provider: String },
    /// The winning stream failed mid-response.
    Aborted {
        provider: String,
        error: ProviderError,
    },
    /// Every candidate, and the fallback if one was started, failed before
    /// producing audio.
    Exhausted,
}

struct FirstAudio {
    response_id: ResponseId,
    first_chunk: ProviderEvent,
    stream: ResponseStream,
}

struct Probe {
    index: usize,
    provider: Arc<dyn BrainProvider>,
    elapsed: Duration,
    outcome: Result<FirstAudio, ProviderError>,
}

/// Start a race for one turn. Events arrive on the returned channel; the
/// race task is a child of `cancel` and stops generating the moment the
/// token is cancelled (issuing a best-effort remote cancel to the winner).
pub fn start_race(
    candidates: Vec<Arc<dyn BrainProvider>>,
    fallback: Option<Arc<dyn BrainProvider>>,
    ctx: TurnContext,
    config: RaceConfig,
    cancel: &CancellationToken,
) -> mpsc::Receiver<RaceEvent> {
    let (tx, rx) = mpsc::channel(64);
    let token = cancel.child_token();
    tokio::spawn(run_race(candidates, fallback, ctx, config, token, tx));
    rx
}

async fn run_race(
    candidates: Vec<Arc<dyn BrainProvider>>,
    mut fallback: Option<Arc<dyn BrainProvider>>,
    ctx: TurnContext,
    config: RaceConfig,
    token: CancellationToken,
    tx: mpsc::Sender<RaceEvent>,
) {
    let started = Instant::now();
    let fallback_deadline = started + config.fallback_after;
    let (probe_tx, mut probe_rx) = mpsc::channel::<Probe>(candidates.len() + 1);

    let mut outstanding = 0usize;
    for (index, provider) in candidates.into_iter().enumerate() {
        spawn_probe(
            index,
            provider,
            ctx.clone(),
            started,
            token.clone(),
            probe_tx.clone(),
        );
        outstanding += 1;
    }

    // Phase one: wait for the first audible provider.
    let mut winner: Option<Probe> = None;
    while winner.is_none() {
        if outstanding == 0 {
            match fallback.take() {
                Some(fb) => {
                    // Everyone failed before the timer; no point waiting it out.
                    info!(
                        provider = fb.name(),
                        "all racing providers failed, starting fallback immediately"
                    );
                    let _ = tx
                        .send(RaceEvent::FallbackStarted {
                            provider: fb.name().to_string(),
                        })
                        .await;
                    spawn_probe(
                        FALLBACK_INDEX,
                        fb,
                        ctx.clone(),
                        started,
                        token.clone(),
                        probe_tx.clone(),
                    );
                    outstanding = 1;
                    continue;
                }
                None => break,
            }
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = sleep_until(fallback_deadline), if fallback.is_some() => {
                if let Some(fb) = fallback.take() {
                    warn!(
                        provider = fb.name(),
                        deadline_ms = config.fallback_after.as_millis() as u64,
                        "no first token before the fallback deadline"
                    );
                    let _ = tx
                        .send(RaceEvent::FallbackStarted { provider: fb.name().to_string() })
                        .await;
                    spawn_probe(
                        FALLBACK_INDEX,
                        fb,
                        ctx.clone(),
                        started,
                        token.clone(),
                        probe_tx.clone(),
                    );
                    outstanding += 1;
                }
            }
            Some(probe) = probe_rx.recv() => {
                outstanding -= 1;
                if let Err(err) = &probe.outcome {
                    warn!(
                        provider = probe.provider.name(),
                        error = %err,
                        "racing provider failed before first audio"
                    );
                    continue;
                }
                // Give simultaneous arrivals one tick to land, then resolve
                // the tie by list order.
                let mut contenders = vec![probe];
                sleep(TIE_BREAK_WINDOW).await;
                while let Ok(late) = probe_rx.try_recv() {
                    outstanding -= 1;
                    contenders.push(late);
                }
                contenders.sort_by_key(|p| p.index);
                for probe in contenders {
                    if winner.is_none() && probe.outcome.is_ok() {
                        winner = Some(probe);
                    } else {
                        retire(&tx, probe).await;
                    }
                }
            }
        }
    }

    let Some(win) = winner else {
        info!("race exhausted without any audible provider");
        let _ = tx.send(RaceEvent::Exhausted).await;
        return;
    };
    let Probe {
        provider, elapsed, outcome, ..
    } = win;
    let Ok(FirstAudio {
        response_id,
        first_chunk,
        mut stream,
    }) = outcome
    else {
        // Winners are only ever selected from Ok probes.
        return;
    };

    info!(
        provider = provider.name(),
        response_id = %response_id,
        elapsed_ms = elapsed.as_millis() as u64,
        "race won"
    );
    let _ = tx
        .send(RaceEvent::Lap(RaceLap {
            provider: provider.name().to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
            won: true,
        }))
        .await;
    if tx.send(RaceEvent::Provider(first_chunk)).await.is_err() {
        provider.cancel_response(&response_id).await;
        return;
    }

    // Phase two: pump the winning stream, retiring late losers as they show.
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                provider.cancel_response(&response_id).await;
                return;
            }
            Some(probe) = probe_rx.recv(), if outstanding > 0 => {
                outstanding -= 1;
                retire(&tx, probe).await;
            }
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    let done = matches!(event, ProviderEvent::ResponseDone { .. });
                    if tx.send(RaceEvent::Provider(event)).await.is_err() {
                        provider.cancel_response(&response_id).await;
                        return;
                    }
                    if done {
                        break;
                    }
                }
                Some(Err(error)) => {
                    warn!(
                        provider = provider.name(),
                        error = %error,
                        "winning stream failed mid-response"
                    );
                    let _ = tx
                        .send(RaceEvent::Aborted {
                            provider: provider.name().to_string(),
                            error,
                        })
                        .await;
                    break;
                }
                None => break,
            }
        }
    }

    // Losers that are still generating get cancelled on arrival, even after
    // the winner has finished.
    while outstanding > 0 {
        tokio::select! {
            _ = token.cancelled() => return,
            probe = probe_rx.recv() => match probe {
                Some(probe) => {
                    outstanding -= 1;
                    retire(&tx, probe).await;
                }
                None => break,
            }
        }
    }
}

fn spawn_probe(
    index: usize,
    provider: Arc<dyn BrainProvider>,
    ctx: TurnContext,
    started: Instant,
    token: CancellationToken,
    probe_tx: mpsc::Sender<Probe>,
) {
    tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = token.cancelled() => return,
            outcome = first_audio(&provider, &ctx) => outcome,
        };
        let probe = Probe {
            index,
            elapsed: started.elapsed(),
            provider,
            outcome,
        };
        let _ = probe_tx.send(probe).await;
    });
}

/// Drive a provider's stream until its first audio chunk, handing back the
/// still-open stream alongside it.
async fn first_audio(
    provider: &Arc<dyn BrainProvider>,
    ctx: &TurnContext,
) -> Result<FirstAudio, ProviderError> {
    let mut stream = provider.begin_response(ctx).await?;
    while let Some(event) = stream.next().await {
        match event? {
            ProviderEvent::ResponseStarted { .. } => {}
            event @ ProviderEvent::AudioChunk { .. } => {
                let response_id = event.response_id().clone();
                return Ok(FirstAudio {
                    response_id,
                    first_chunk: event,
                    stream,
                });
            }
            ProviderEvent::ResponseDone { response_id, .. } => {
                return Err(ProviderError::Protocol {
                    provider: provider.name().to_string(),
                    message: format!("response {response_id} finished without audio"),
                });
            }
        }
    }
    Err(ProviderError::Protocol {
        provider: provider.name().to_string(),
        message: "stream ended before first audio".to_string(),
    })
}

/// A probe that lost (or failed): record the lap, cancel remotely, and drop
/// its stream so nothing it produced can reach the caller.
async fn retire(tx: &mpsc::Sender<RaceEvent>, probe: Probe) {
    match probe.outcome {
        Ok(first) => {
            debug!(
                provider = probe.provider.name(),
                response_id = %first.response_id,
                elapsed_ms = probe.elapsed.as_millis() as u64,
                "cancelling losing provider"
            );
            let _ = tx
                .send(RaceEvent::Lap(RaceLap {
                    provider: probe.provider.name().to_string(),
                    elapsed_ms: probe.elapsed.as_millis() as u64,
                    won: false,
                }))
                .await;
            probe.provider.cancel_response(&first.response_id).await;
        }
        Err(error) => {
            warn!(
                provider = probe.provider.name(),
                error = %error,
                "racing provider failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TurnMessage;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::wrappers::ReceiverStream;

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        /// First audio after the delay, then `chunks` more chunks and a done.
        Audio { first_after: Duration, chunks: usize },
        /// Fails after the delay.
        Fail { after: Duration },
        /// Connects but never produces anything.
        Silent,
    }

    struct SimProvider {
        name: String,
        behavior: Behavior,
        began: AtomicUsize,
        cancelled: Mutex<Vec<String>>,
    }

    fn sim(name: &str, behavior: Behavior) -> Arc<SimProvider> {
        Arc::new(SimProvider {
            name: name.to_string(),
            behavior,
            began: AtomicUsize::new(0),
            cancelled: Mutex::new(Vec::new()),
        })
    }

    #[async_trait]
    impl BrainProvider for SimProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn begin_response(
            &self,
            _ctx: &TurnContext,
        ) -> Result<ResponseStream, ProviderError> {
            self.began.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(8);
            let behavior = self.behavior;
            let name = self.name.clone();
            let response_id = ResponseId(format!("{name}-r1"));
            tokio::spawn(async move {
                match behavior {
                    Behavior::Audio { first_after, chunks } => {
                        sleep(first_after).await;
                        let _ = tx
                            .send(Ok(ProviderEvent::ResponseStarted {
                                response_id: response_id.clone(),
                            }))
                            .await;
                        for i in 0..=chunks {
                            let _ = tx
                                .send(Ok(ProviderEvent::AudioChunk {
                                    response_id: response_id.clone(),
                                    audio: Bytes::from(vec![i as u8]),
                                    transcript_delta: None,
                                }))
                                .await;
                            sleep(Duration::from_millis(10)).await;
                        }
                        let _ = tx
                            .send(Ok(ProviderEvent::ResponseDone {
                                response_id,
                                transcript: Some(format!("{name} transcript")),
                            }))
                            .await;
                    }
                    Behavior::Fail { after } => {
                        sleep(after).await;
                        let _ = tx
                            .send(Err(ProviderError::Unavailable {
                                provider: name,
                                attempts: 1,
                                source: anyhow!("connection refused"),
                            }))
                            .await;
                    }
                    Behavior::Silent => {
                        std::future::pending::<()>().await;
                    }
                }
            });
            Ok(Box::pin(ReceiverStream::new(rx)))
        }

        async fn cancel_response(&self, response_id: &ResponseId) {
            self.cancelled
                .lock()
                .expect("lock")
                .push(response_id.as_str().to_string());
        }

        async fn truncate_conversation(&self, _response_id: &ResponseId, _audio_end_ms: Option<u64>) {
        }
    }

    fn ctx() -> TurnContext {
        TurnContext {
            instructions: "be brief".to_string(),
            voice: "shimmer".to_string(),
            history: vec![TurnMessage {
                role: crate::provider::Speaker::Caller,
                text: "hello".to_string(),
            }],
        }
    }

    async fn collect(mut rx: mpsc::Receiver<RaceEvent>) -> Vec<RaceEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn laps(events: &[RaceEvent]) -> Vec<&RaceLap> {
        events
            .iter()
            .filter_map(|e| match e {
                RaceEvent::Lap(lap) => Some(lap),
                _ => None,
            })
            .collect()
    }

    fn audio_sources(events: &[RaceEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                RaceEvent::Provider(ProviderEvent::AudioChunk { response_id, .. }) => {
                    Some(response_id.as_str().to_string())
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn fastest_provider_wins_and_losers_are_cancelled() {
        let fast = sim("fast", Behavior::Audio { first_after: Duration::from_millis(900), chunks: 2 });
        let mid = sim("mid", Behavior::Audio { first_after: Duration::from_millis(950), chunks: 2 });
        let slow = sim("slow", Behavior::Audio { first_after: Duration::from_millis(1000), chunks: 2 });
        let fb = sim("fallback", Behavior::Audio { first_after: Duration::from_millis(100), chunks: 0 });

        let cancel = CancellationToken::new();
        let rx = start_race(
            vec![fast.clone(), mid.clone(), slow.clone()],
            Some(fb.clone()),
            ctx(),
            RaceConfig { fallback_after: Duration::from_millis(1500) },
            &cancel,
        );
        let events = collect(rx).await;

        assert!(
            !events.iter().any(|e| matches!(e, RaceEvent::FallbackStarted { .. })),
            "fallback must not start when a racer wins in time"
        );
        assert_eq!(fb.began.load(Ordering::SeqCst), 0);

        let laps = laps(&events);
        assert_eq!(laps.len(), 3);
        let winner = laps.iter().find(|l| l.won).expect("winning lap");
        assert_eq!(winner.provider, "fast");
        assert!(laps.iter().filter(|l| !l.won).count() == 2);

        // Only the winner's audio is visible.
        let sources = audio_sources(&events);
        assert!(!sources.is_empty());
        assert!(sources.iter().all(|id| id == "fast-r1"));

        assert_eq!(mid.cancelled.lock().expect("lock").as_slice(), ["mid-r1"]);
        assert_eq!(slow.cancelled.lock().expect("lock").as_slice(), ["slow-r1"]);
        assert!(fast.cancelled.lock().expect("lock").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_first_tokens_resolve_by_list_order() {
        let a = sim("a", Behavior::Audio { first_after: Duration::from_millis(500), chunks: 1 });
        let b = sim("b", Behavior::Audio { first_after: Duration::from_millis(500), chunks: 1 });

        let cancel = CancellationToken::new();
        let rx = start_race(
            vec![a.clone(), b.clone()],
            None,
            ctx(),
            RaceConfig { fallback_after: Duration::from_millis(1500) },
            &cancel,
        );
        let events = collect(rx).await;

        let winner = laps(&events).into_iter().find(|l| l.won).expect("winning lap");
        assert_eq!(winner.provider, "a");
        assert!(audio_sources(&events).iter().all(|id| id == "a-r1"));
        assert_eq!(b.cancelled.lock().expect("lock").as_slice(), ["b-r1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_timer_starts_exactly_one_extra_request() {
        let slow_a = sim("slow-a", Behavior::Audio { first_after: Duration::from_millis(5000), chunks: 1 });
        let slow_b = sim("slow-b", Behavior::Audio { first_after: Duration::from_millis(5000), chunks: 1 });
        let fb = sim("fallback", Behavior::Audio { first_after: Duration::from_millis(300), chunks: 1 });

        let cancel = CancellationToken::new();
        let rx = start_race(
            vec![slow_a.clone(), slow_b.clone()],
            Some(fb.clone()),
            ctx(),
            RaceConfig { fallback_after: Duration::from_millis(1500) },
            &cancel,
        );
        let events = collect(rx).await;

        let starts: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, RaceEvent::FallbackStarted { .. }))
            .collect();
        assert_eq!(starts.len(), 1, "exactly one fallback request");
        assert_eq!(fb.began.load(Ordering::SeqCst), 1);

        let winner = laps(&events).into_iter().find(|l| l.won).expect("winning lap");
        assert_eq!(winner.provider, "fallback");
        assert!(audio_sources(&events).iter().all(|id| id == "fallback-r1"));

        // Slow originals are still cancelled when their tokens finally land.
        assert_eq!(slow_a.cancelled.lock().expect("lock").as_slice(), ["slow-a-r1"]);
        assert_eq!(slow_b.cancelled.lock().expect("lock").as_slice(), ["slow-b-r1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_fallback_when_a_racer_beats_the_deadline() {
        let racer = sim("racer", Behavior::Audio { first_after: Duration::from_millis(1200), chunks: 1 });
        let fb = sim("fallback", Behavior::Audio { first_after: Duration::from_millis(50), chunks: 1 });

        let cancel = CancellationToken::new();
        let rx = start_race(
            vec![racer.clone()],
            Some(fb.clone()),
            ctx(),
            RaceConfig { fallback_after: Duration::from_millis(1500) },
            &cancel,
        );
        let events = collect(rx).await;

        assert!(!events.iter().any(|e| matches!(e, RaceEvent::FallbackStarted { .. })));
        assert_eq!(fb.began.load(Ordering::SeqCst), 0);
        let winner = laps(&events).into_iter().find(|l| l.won).expect("winning lap");
        assert_eq!(winner.provider, "racer");
    }

    #[tokio::test(start_paused = true)]
    async fn early_failures_start_the_fallback_before_the_deadline() {
        let bad_a = sim("bad-a", Behavior::Fail { after: Duration::from_millis(100) });
        let bad_b = sim("bad-b", Behavior::Fail { after: Duration::from_millis(120) });
        let fb = sim("fallback", Behavior::Audio { first_after: Duration::from_millis(100), chunks: 0 });

        let start = Instant::now();
        let cancel = CancellationToken::new();
        let rx = start_race(
            vec![bad_a, bad_b],
            Some(fb.clone()),
            ctx(),
            RaceConfig { fallback_after: Duration::from_millis(1500) },
            &cancel,
        );
        let events = collect(rx).await;

        assert!(events.iter().any(|e| matches!(e, RaceEvent::FallbackStarted { .. })));
        let winner = laps(&events).into_iter().find(|l| l.won).expect("winning lap");
        assert_eq!(winner.provider, "fallback");
        assert!(
            start.elapsed() < Duration::from_millis(1500),
            "fallback must not wait for the timer once every racer has failed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn everything_failing_reports_exhausted() {
        let bad_a = sim("bad-a", Behavior::Fail { after: Duration::from_millis(50) });
        let bad_b = sim("bad-b", Behavior::Fail { after: Duration::from_millis(60) });

        let cancel = CancellationToken::new();
        let rx = start_race(
            vec![bad_a, bad_b],
            None,
            ctx(),
            RaceConfig { fallback_after: Duration::from_millis(1500) },
            &cancel,
        );
        let events = collect(rx).await;

        assert!(matches!(events.last(), Some(RaceEvent::Exhausted)));
        assert!(laps(&events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_race() {
        let silent = sim("silent", Behavior::Silent);
        let cancel = CancellationToken::new();
        let mut rx = start_race(
            vec![silent],
            None,
            ctx(),
            RaceConfig { fallback_after: Duration::from_millis(60_000) },
            &cancel,
        );
        cancel.cancel();
        // The race task exits and the channel closes without an event.
        assert!(rx.recv().await.is_none());
    }
}
