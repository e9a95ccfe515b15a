//! Voicegate API service: the telephony-facing edge of the voice gateway.
//!
//! Answers inbound calls via webhooks, relays call media over a websocket,
//! and runs one session control loop per call on top of `voicegate-core`.

pub mod audio_utils;
pub mod call;
pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod protocol;
pub mod providers;
pub mod router;
pub mod state;
