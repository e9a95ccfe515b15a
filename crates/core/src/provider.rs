//! The uniform streaming interface every AI backend is wrapped behind.
//!
//! A [`BrainProvider`] turns one conversational turn into a stream of
//! [`ProviderEvent`]s. The gateway never talks to a backend directly; the
//! racer and the session loop only see this vocabulary, so swapping or
//! racing backends never touches call logic.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Backend-assigned identifier for one generated response.
///
/// Every audio chunk carries the id of the generation that produced it, which
/// is what lets the buffer and the session drop stale audio after an
/// interruption instead of playing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseId(pub String);

impl ResponseId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResponseId {
    fn from(s: &str) -> Self {
        ResponseId(s.to_string())
    }
}

/// Who said a line of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Caller,
    Agent,
}

/// One line of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessage {
    pub role: Speaker,
    pub text: String,
}

/// Immutable snapshot of everything a provider needs to generate one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    /// System instructions for the agent persona.
    pub instructions: String,
    /// Voice name for speech synthesis.
    pub voice: String,
    /// Conversation so far, oldest first.
    pub history: Vec<TurnMessage>,
}

/// Events a provider emits while generating one response.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The backend accepted the request and assigned a response id.
    ResponseStarted { response_id: ResponseId },
    /// One chunk of synthesized speech, tagged with its generation.
    AudioChunk {
        response_id: ResponseId,
        audio: Bytes,
        /// Text covered by this chunk, when the backend interleaves it.
        transcript_delta: Option<String>,
    },
    /// The generation finished (or was cancelled server-side).
    ResponseDone {
        response_id: ResponseId,
        transcript: Option<String>,
    },
}

impl ProviderEvent {
    pub fn response_id(&self) -> &ResponseId {
        match self {
            ProviderEvent::ResponseStarted { response_id }
            | ProviderEvent::AudioChunk { response_id, .. }
            | ProviderEvent::ResponseDone { response_id, .. } => response_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend could not be reached; retries inside the adapter are
    /// already exhausted by the time this surfaces.
    #[error("provider '{provider}' unavailable after {attempts} attempt(s): {source}")]
    Unavailable {
        provider: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    /// The backend answered with something we could not interpret.
    #[error("provider '{provider}' protocol error: {message}")]
    Protocol { provider: String, message: String },
    /// The response was cancelled before it finished.
    #[error("response cancelled")]
    Cancelled,
}

/// Lazy stream of generation events for one turn.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send>>;

/// A speech-generating AI backend.
///
/// `cancel_response` and `truncate_conversation` are best-effort: the caller
/// stops consuming locally regardless of whether the remote side honours
/// them, so they return nothing and log their own failures.
#[async_trait]
pub trait BrainProvider: Send + Sync {
    /// Stable identity, also used as the tie-break priority key by list order.
    fn name(&self) -> &str;

    /// Open a generation request for the given turn.
    async fn begin_response(&self, ctx: &TurnContext) -> Result<ResponseStream, ProviderError>;

    /// Ask the backend to stop generating the given response.
    async fn cancel_response(&self, response_id: &ResponseId);

    /// Rewrite backend conversation history so the cancelled response ends at
    /// the audio offset the caller actually heard. `None` truncates to zero.
    async fn truncate_conversation(&self, response_id: &ResponseId, audio_end_ms: Option<u64>);
}

/// Bounded exponential backoff for transient connection failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (0-based). Doubles each attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_double() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn speaker_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Speaker::Caller).expect("serialize"),
            "\"caller\""
        );
        let msg: TurnMessage =
            serde_json::from_str(r#"{"role":"agent","text":"hello"}"#).expect("deserialize");
        assert_eq!(msg.role, Speaker::Agent);
    }

    #[test]
    fn events_expose_their_response_id() {
        let event = ProviderEvent::AudioChunk {
            response_id: ResponseId::from("resp_1"),
            audio: Bytes::from_static(&[0, 1]),
            transcript_delta: None,
        };
        assert_eq!(event.response_id().as_str(), "resp_1");
    }
}
