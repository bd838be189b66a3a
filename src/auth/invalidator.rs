//! Session invalidation on authentication failure.
//!
//! Many in-flight requests can come back 401 at once. The latch is flipped
//! with a single compare-and-swap before any clearing starts, so exactly one
//! caller clears state and broadcasts [`SessionTerminated`]; the rest return
//! immediately. The latch stays set until [`SessionInvalidator::rearm`] is
//! called for a new session.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::session::SessionStore;

/// Buffered termination events per subscriber.
const EVENT_CAPACITY: usize = 16;

/// Reason used when the backend rejects the session token.
pub const REASON_UNAUTHORIZED: &str = "unauthorized";

/// Emitted once when the local session is torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionTerminated {
    pub reason: String,
    pub message: String,
    /// Always true; tells the sign-in surface to show the expiry notice.
    pub expired: bool,
}

impl SessionTerminated {
    fn for_reason(reason: &str) -> Self {
        let message = match reason {
            REASON_UNAUTHORIZED => "Your session has expired. Please sign in again.",
            _ => "You have been signed out. Please sign in again.",
        };
        Self {
            reason: reason.to_string(),
            message: message.to_string(),
            expired: true,
        }
    }

    /// Query string for navigating to the sign-in surface.
    pub fn sign_in_query(&self) -> String {
        format!(
            "expired={}&message={}",
            self.expired,
            urlencoding::encode(&self.message)
        )
    }
}

pub struct SessionInvalidator {
    session: Arc<SessionStore>,
    latch: AtomicBool,
    invalidations: AtomicUsize,
    events: broadcast::Sender<SessionTerminated>,
}

impl SessionInvalidator {
    pub fn new(session: Arc<SessionStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session,
            latch: AtomicBool::new(false),
            invalidations: AtomicUsize::new(0),
            events,
        }
    }

    /// Receive [`SessionTerminated`] events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionTerminated> {
        self.events.subscribe()
    }

    /// Clear the session and signal termination. Returns `true` only for the
    /// call that actually performed the invalidation.
    pub fn invalidate(&self, reason: &str) -> bool {
        if self
            .latch
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(reason, "Session already invalidated");
            return false;
        }

        let report = self.session.clear();
        for error in &report.errors {
            tracing::warn!(error = %error, "Session clear incomplete");
        }
        self.invalidations.fetch_add(1, Ordering::SeqCst);

        let event = SessionTerminated::for_reason(reason);
        tracing::info!(
            reason,
            removed = report.removed,
            "Session invalidated"
        );
        // No subscribers is fine.
        let _ = self.events.send(event);
        true
    }

    /// Reset the latch for a newly established session.
    pub fn rearm(&self) {
        self.latch.store(false, Ordering::SeqCst);
    }

    pub fn is_invalidated(&self) -> bool {
        self.latch.load(Ordering::SeqCst)
    }

    /// Total invalidations performed over this invalidator's lifetime.
    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KeyValueStore, MemoryStore, ACCESS_TOKEN_KEY};
    use tokio::sync::broadcast::error::TryRecvError;

    fn setup() -> (Arc<dyn KeyValueStore>, Arc<SessionStore>, Arc<SessionInvalidator>) {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let session = Arc::new(SessionStore::new(durable.clone()));
        session.establish("tok", None, None).unwrap();
        let invalidator = Arc::new(SessionInvalidator::new(session.clone()));
        (durable, session, invalidator)
    }

    #[test]
    fn invalidate_clears_and_signals_once() {
        let (durable, _, inv) = setup();
        let mut rx = inv.subscribe();

        assert!(inv.invalidate(REASON_UNAUTHORIZED));
        assert!(!inv.invalidate(REASON_UNAUTHORIZED));

        assert_eq!(durable.get(ACCESS_TOKEN_KEY).unwrap(), None);
        let event = rx.try_recv().unwrap();
        assert!(event.expired);
        assert_eq!(event.reason, REASON_UNAUTHORIZED);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(inv.invalidation_count(), 1);
    }

    #[test]
    fn rearm_allows_next_session_to_invalidate() {
        let (_, session, inv) = setup();
        inv.invalidate(REASON_UNAUTHORIZED);

        session.establish("tok-2", None, None).unwrap();
        inv.rearm();
        assert!(!inv.is_invalidated());
        assert!(inv.invalidate(REASON_UNAUTHORIZED));
        assert_eq!(inv.invalidation_count(), 2);
        assert!(session.access_token().is_none());
    }

    #[test]
    fn invalidate_without_subscribers_still_clears() {
        let (_, session, inv) = setup();
        assert!(inv.invalidate("logout"));
        assert!(session.access_token().is_none());
    }

    #[test]
    fn sign_in_query_is_encoded() {
        let event = SessionTerminated::for_reason(REASON_UNAUTHORIZED);
        assert_eq!(
            event.sign_in_query(),
            "expired=true&message=Your%20session%20has%20expired.%20Please%20sign%20in%20again."
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_invalidations_run_once() {
        let (_, _, inv) = setup();
        let mut rx = inv.subscribe();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let inv = inv.clone();
                tokio::spawn(async move { inv.invalidate(REASON_UNAUTHORIZED) })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(inv.invalidation_count(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
