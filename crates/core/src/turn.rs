//! Turn-taking state machine for one call.
//!
//! The transition table is a pure function so it can be tested exhaustively
//! without any I/O. The session control loop owns the current state and is
//! the only writer; it applies events here and acts on the result.

use serde::Serialize;

/// Where a call currently sits in the turn-taking cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Answered webhook received, media socket not yet live.
    Idle,
    /// Waiting for the caller to speak.
    Listening,
    /// Caller finished a turn; a generation is in flight, no audio yet.
    Thinking,
    /// Agent audio is being delivered to the caller.
    Speaking,
    /// Barge-in detected; interruption cleanup in progress.
    Interrupted,
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// Media socket attached and the call is live.
    CallAnswered,
    /// Voice activity detection: the caller started speaking.
    SpeechStarted,
    /// The caller stopped speaking; their turn is complete.
    SpeechStopped,
    /// First audio chunk of a generation reached the buffer.
    FirstToken,
    /// The active generation finished.
    GenerationDone,
    /// Interruption cleanup (cancel, truncate, flush) completed.
    InterruptionHandled,
    /// The call ended, for any reason.
    CallEnded,
}

/// Outcome of applying an event to a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(CallState),
    /// The event does not apply in this state. Out-of-order delivery is
    /// normal under barge-in; callers log it and move on.
    Ignored,
}

impl CallState {
    /// The transition table. Never panics; unknown combinations are ignored.
    pub fn apply(self, event: TurnEvent) -> Transition {
        use CallState::*;
        use TurnEvent::*;
        match (self, event) {
            (_, CallEnded) => Transition::To(Idle),
            (Idle, CallAnswered) => Transition::To(Listening),
            // A fresh speech burst while already listening is benign.
            (Listening, SpeechStarted) => Transition::To(Listening),
            (Listening, SpeechStopped) => Transition::To(Thinking),
            (Thinking, FirstToken) => Transition::To(Speaking),
            // Caller resumed before any audio arrived: abandon the pending
            // generation and listen again.
            (Thinking, SpeechStarted) => Transition::To(Listening),
            // A generation can finish without ever producing audio.
            (Thinking, GenerationDone) => Transition::To(Listening),
            (Speaking, SpeechStarted) => Transition::To(Interrupted),
            (Speaking, GenerationDone) => Transition::To(Listening),
            (Interrupted, InterruptionHandled) => Transition::To(Listening),
            _ => Transition::Ignored,
        }
    }

    /// True once the caller's audio should be treated as a barge-in.
    pub fn is_agent_turn(self) -> bool {
        matches!(self, CallState::Thinking | CallState::Speaking)
    }
}
