//! Backend adapters behind the [`BrainProvider`] interface.
//!
//! Two families: the realtime adapter holds one long-lived websocket per
//! call and listens to caller audio continuously; chat adapters open one
//! streaming completion per turn and synthesize speech sentence by sentence.

pub mod chat;
pub mod realtime;

use crate::config::{Brain, Config};
use anyhow::Context;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use voicegate_core::BrainProvider;

/// The backends one call races, built fresh per call.
pub struct ProviderSet {
    /// Candidates in priority order; list order breaks first-token ties.
    pub candidates: Vec<Arc<dyn BrainProvider>>,
    /// Emergency fallback, only ever started by the racer's deadline.
    pub fallback: Option<Arc<dyn BrainProvider>>,
    /// Caller audio ingress, present when a backend listens continuously.
    pub ingress: Option<mpsc::Sender<Bytes>>,
}

impl ProviderSet {
    /// Look a provider up by name, fallback included. Used to route cancel
    /// and truncate calls back to whichever backend won the turn.
    pub fn provider_named(&self, name: &str) -> Option<Arc<dyn BrainProvider>> {
        self.candidates
            .iter()
            .chain(self.fallback.iter())
            .find(|p| p.name() == name)
            .cloned()
    }
}

/// Assemble the provider set for one call from the configured brain.
pub fn build_provider_set(config: &Config) -> anyhow::Result<ProviderSet> {
    let openai_key = config
        .openai_api_key
        .clone()
        .context("OPENAI_API_KEY not configured")?;

    match config.brain {
        Brain::Realtime => {
            let (ingress_tx, ingress_rx) = mpsc::channel(1024);
            let realtime = realtime::RealtimeProvider::new(
                openai_key.clone(),
                config.realtime_model.clone(),
                config.vad_threshold,
                config.vad_silence_ms,
                ingress_rx,
            );
            let fallback = chat::ChatProvider::direct(&openai_key, config.chat_model.clone());
            Ok(ProviderSet {
                candidates: vec![Arc::new(realtime)],
                fallback: Some(Arc::new(fallback)),
                ingress: Some(ingress_tx),
            })
        }
        Brain::Chat if config.racing_models.is_empty() => {
            let direct = chat::ChatProvider::direct(&openai_key, config.chat_model.clone());
            Ok(ProviderSet {
                candidates: vec![Arc::new(direct)],
                fallback: None,
                ingress: None,
            })
        }
        Brain::Chat => {
            let openrouter_key = config
                .openrouter_api_key
                .clone()
                .context("OPENROUTER_API_KEY required when racing models")?;
            let candidates = config
                .racing_models
                .iter()
                .map(|model| {
                    Arc::new(chat::ChatProvider::openrouter(
                        &openrouter_key,
                        &config.openrouter_api_base,
                        model.clone(),
                        &openai_key,
                    )) as Arc<dyn BrainProvider>
                })
                .collect();
            let fallback = chat::ChatProvider::direct(&openai_key, config.chat_model.clone());
            Ok(ProviderSet {
                candidates,
                fallback: Some(Arc::new(fallback)),
                ingress: None,
            })
        }
    }
}
