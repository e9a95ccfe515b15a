//! Session lifecycle management.
//!
//! The registry is the only state shared across calls. It guarantees at most
//! one live session per call id: creating a session for an id that is
//! already live force-closes the old one first, and closing an absent id is
//! a logged no-op.

use crate::call::session::{RelayCommand, SessionEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Something a session owns that must be let go when the session closes:
/// the telephony socket, a backend connection, an audio channel.
///
/// Releases are isolated: one resource failing to release never prevents
/// the others from being attempted.
#[async_trait]
pub trait SessionResource: Send + Sync {
    fn name(&self) -> &str;
    async fn release(&self) -> anyhow::Result<()>;
}

/// Shared handle to one live session.
pub struct SessionHandle {
    pub call_id: String,
    /// The single control channel into the session's event loop.
    pub events: mpsc::Sender<SessionEvent>,
    /// Root token for everything the session spawned.
    pub cancel: CancellationToken,
    relay_rx: Mutex<Option<mpsc::Receiver<RelayCommand>>>,
    resources: Mutex<Vec<Arc<dyn SessionResource>>>,
}

impl SessionHandle {
    pub fn new(
        call_id: String,
        events: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
        relay_rx: mpsc::Receiver<RelayCommand>,
    ) -> Self {
        SessionHandle {
            call_id,
            events,
            cancel,
            relay_rx: Mutex::new(Some(relay_rx)),
            resources: Mutex::new(Vec::new()),
        }
    }

    /// Hand the outbound command channel to the media relay. Only the first
    /// attached socket gets it.
    pub async fn attach_relay(&self) -> Option<mpsc::Receiver<RelayCommand>> {
        self.relay_rx.lock().await.take()
    }

    pub async fn add_resource(&self, resource: Arc<dyn SessionResource>) {
        self.resources.lock().await.push(resource);
    }

    /// Release every owned resource, logging failures without aborting the
    /// rest.
    pub async fn release_resources(&self) {
        let resources: Vec<_> = self.resources.lock().await.drain(..).collect();
        for resource in resources {
            if let Err(err) = resource.release().await {
                error!(
                    call_id = %self.call_id,
                    resource = resource.name(),
                    error = %err,
                    "failed to release session resource"
                );
            } else {
                debug!(
                    call_id = %self.call_id,
                    resource = resource.name(),
                    "released session resource"
                );
            }
        }
    }

    /// Full teardown: stop every task the session owns, then release
    /// resources.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.release_resources().await;
    }
}

/// All live sessions, keyed by call id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session, force-closing any live session already
    /// holding the same call id.
    pub async fn register(&self, handle: Arc<SessionHandle>) {
        let displaced = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(handle.call_id.clone(), handle.clone())
        };
        if let Some(old) = displaced {
            warn!(call_id = %old.call_id, "force-closing existing session for reused call id");
            old.close().await;
        }
        info!(call_id = %handle.call_id, "session registered");
    }

    pub async fn get(&self, call_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().await.get(call_id).cloned()
    }

    /// Close and remove a session. Returns false (and logs) when no session
    /// holds the id.
    pub async fn close_session(&self, call_id: &str) -> bool {
        let handle = self.sessions.lock().await.remove(call_id);
        match handle {
            Some(handle) => {
                info!(call_id, "closing session");
                handle.close().await;
                true
            }
            None => {
                debug!(call_id, "close requested for unknown session; nothing to do");
                false
            }
        }
    }

    /// Deregister a session that ended on its own, but only if this exact
    /// handle is still the registered one (a replacement may have displaced
    /// it already).
    pub async fn remove_if_current(&self, handle: &Arc<SessionHandle>) {
        let mut sessions = self.sessions.lock().await;
        if let Some(current) = sessions.get(&handle.call_id)
            && Arc::ptr_eq(current, handle)
        {
            sessions.remove(&handle.call_id);
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Shutdown path: close every live session.
    pub async fn close_all(&self) {
        let all: Vec<_> = self.sessions.lock().await.drain().collect();
        for (_, handle) in all {
            handle.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn handle(call_id: &str) -> Arc<SessionHandle> {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (_relay_tx, relay_rx) = mpsc::channel(8);
        Arc::new(SessionHandle::new(
            call_id.to_string(),
            events_tx,
            CancellationToken::new(),
            relay_rx,
        ))
    }

    struct TrackedResource {
        name: String,
        released: AtomicBool,
        fail: bool,
    }

    impl TrackedResource {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(TrackedResource {
                name: name.to_string(),
                released: AtomicBool::new(false),
                fail,
            })
        }
    }

    #[async_trait]
    impl SessionResource for TrackedResource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn release(&self) -> anyhow::Result<()> {
            self.released.store(true, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("release failed"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn register_force_closes_the_displaced_session() {
        let registry = SessionRegistry::new();
        let first = handle("call-1");
        let second = handle("call-1");

        registry.register(first.clone()).await;
        registry.register(second.clone()).await;

        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        assert_eq!(registry.active_count().await, 1);
        let current = registry.get("call-1").await.expect("session");
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.register(handle("call-1")).await;

        assert!(registry.close_session("call-1").await);
        assert!(!registry.close_session("call-1").await);
        assert!(!registry.close_session("never-existed").await);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn one_failing_resource_does_not_block_the_rest() {
        let registry = SessionRegistry::new();
        let session = handle("call-1");
        let bad = TrackedResource::new("backend-socket", true);
        let good = TrackedResource::new("telephony-socket", false);
        session.add_resource(bad.clone()).await;
        session.add_resource(good.clone()).await;
        registry.register(session).await;

        registry.close_session("call-1").await;

        assert!(bad.released.load(Ordering::SeqCst));
        assert!(good.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn concurrent_registration_for_one_id_leaves_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let a = handle("call-1");
        let b = handle("call-1");

        let ra = registry.clone();
        let rb = registry.clone();
        let (ha, hb) = (a.clone(), b.clone());
        let ta = tokio::spawn(async move { ra.register(ha).await });
        let tb = tokio::spawn(async move { rb.register(hb).await });
        ta.await.expect("join");
        tb.await.expect("join");

        assert_eq!(registry.active_count().await, 1);
        // Exactly one of the two was displaced and closed.
        let cancelled = [&a, &b]
            .iter()
            .filter(|h| h.cancel.is_cancelled())
            .count();
        assert_eq!(cancelled, 1);
    }

    #[tokio::test]
    async fn relay_channel_attaches_once() {
        let session = handle("call-1");
        assert!(session.attach_relay().await.is_some());
        assert!(session.attach_relay().await.is_none());
    }

    #[tokio::test]
    async fn close_all_empties_the_registry() {
        let registry = SessionRegistry::new();
        let a = handle("call-1");
        let b = handle("call-2");
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        registry.close_all().await;

        assert_eq!(registry.active_count().await, 0);
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
    }
}
