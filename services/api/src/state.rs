//! Shared Application State

use crate::{call::registry::SessionRegistry, config::Config, db::Db};
use bytes::Bytes;
use std::sync::Arc;

/// State shared by every handler and the media relay.
pub struct AppState {
    pub config: Config,
    pub db: Db,
    pub registry: Arc<SessionRegistry>,
    /// Canned 16 kHz PCM16 utterance for the response-timeout test monitor,
    /// loaded once at startup.
    pub timeout_audio: Option<Bytes>,
}
