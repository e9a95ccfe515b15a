//! Provider-agnostic engine for real-time voice calls: the turn-taking
//! state machine, the tagged outbound audio buffer, the brain-provider
//! trait, and the racer with its emergency fallback timer.
//!
//! Nothing in this crate knows about HTTP, websockets, or any concrete AI
//! backend; the gateway service wires those in.

pub mod audio;
pub mod provider;
pub mod race;
pub mod turn;

pub use audio::{AudioBuffer, OutboundChunk};
pub use provider::{
    BrainProvider, ProviderError, ProviderEvent, ResponseId, ResponseStream, RetryPolicy, Speaker,
    TurnContext, TurnMessage,
};
pub use race::{RaceConfig, RaceEvent, RaceLap, start_race};
pub use turn::{CallState, Transition, TurnEvent};
