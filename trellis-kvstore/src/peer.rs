//! Per-peer lifecycle: state machine, backoff, and sync bookkeeping.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use trellis_model::constants::{INITIAL_BACKOFF, MAX_BACKOFF};
use trellis_model::{PeerSpec, PeerState};

use crate::net::PeerClient;

/// Events that drive the peer state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStateEvent {
    PeerAdd,
    SyncScheduled,
    SyncRespRcvd,
    ApiError,
}

/// Pure transition function. `None` current state means the peer is new.
pub fn next_state(current: Option<PeerState>, event: PeerStateEvent) -> PeerState {
    use PeerState::*;
    use PeerStateEvent::*;
    match (current, event) {
        (None, PeerAdd) => Idle,
        // Re-add of a known peer goes straight back to syncing.
        (Some(_), PeerAdd) => Idle,
        (Some(Idle), SyncScheduled) => Syncing,
        (Some(Syncing), SyncRespRcvd) => Initialized,
        (Some(Syncing), ApiError) | (Some(Initialized), ApiError) => Idle,
        // Everything else keeps its state; events can race with removal.
        (Some(state), _) => state,
        (None, _) => Idle,
    }
}

/// Exponential retry backoff: 8 ms doubling to an 8 s cap.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    init: Duration,
    max: Duration,
    current: Duration,
    last_error: Option<Instant>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl ExponentialBackoff {
    pub fn new(init: Duration, max: Duration) -> Self {
        Self {
            init,
            max,
            current: init,
            last_error: None,
        }
    }

    pub fn report_error(&mut self, now: Instant) {
        if self.last_error.is_some() {
            self.current = (self.current * 2).min(self.max);
        }
        self.last_error = Some(now);
    }

    pub fn report_success(&mut self) {
        self.current = self.init;
        self.last_error = None;
    }

    pub fn can_try_now(&self, now: Instant) -> bool {
        self.time_until_retry(now).is_zero()
    }

    pub fn time_until_retry(&self, now: Instant) -> Duration {
        match self.last_error {
            None => Duration::ZERO,
            Some(at) => (at + self.current).saturating_duration_since(now),
        }
    }
}

/// One peer of a `KvStoreDb`. Holds only the peer's name and spec, never
/// a reference back to the owning store.
pub struct KvStorePeer {
    pub node_name: String,
    pub spec: PeerSpec,
    pub state: PeerState,
    pub backoff: ExponentialBackoff,
    /// Keys that changed locally while this peer was syncing; flushed to
    /// it when the full sync finalizes.
    pub pending_keys_during_initialization: BTreeSet<String>,
    pub client: Option<Arc<dyn PeerClient>>,
}

impl KvStorePeer {
    pub fn new(node_name: String, spec: PeerSpec) -> Self {
        Self {
            node_name,
            spec,
            state: next_state(None, PeerStateEvent::PeerAdd),
            backoff: ExponentialBackoff::default(),
            pending_keys_during_initialization: BTreeSet::new(),
            client: None,
        }
    }

    /// Apply an event, logging the transition.
    pub fn transition(&mut self, event: PeerStateEvent) -> PeerState {
        let old = self.state;
        self.state = next_state(Some(old), event);
        if old != self.state {
            tracing::info!(
                peer = %self.node_name,
                from = ?old,
                to = ?self.state,
                event = ?event,
                "peer state transition"
            );
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use PeerState::*;
        use PeerStateEvent::*;
        assert_eq!(next_state(None, PeerAdd), Idle);
        assert_eq!(next_state(Some(Idle), PeerAdd), Idle);
        assert_eq!(next_state(Some(Idle), SyncScheduled), Syncing);
        assert_eq!(next_state(Some(Syncing), SyncRespRcvd), Initialized);
        assert_eq!(next_state(Some(Syncing), ApiError), Idle);
        assert_eq!(next_state(Some(Initialized), ApiError), Idle);
        // Stale events do not regress established peers.
        assert_eq!(next_state(Some(Initialized), SyncRespRcvd), Initialized);
        assert_eq!(next_state(Some(Idle), ApiError), Idle);
    }

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(8), Duration::from_millis(30));
        let t0 = Instant::now();
        assert!(b.can_try_now(t0));

        b.report_error(t0);
        assert_eq!(b.time_until_retry(t0), Duration::from_millis(8));
        b.report_error(t0);
        assert_eq!(b.time_until_retry(t0), Duration::from_millis(16));
        b.report_error(t0);
        // Capped.
        assert_eq!(b.time_until_retry(t0), Duration::from_millis(30));
        b.report_error(t0);
        assert_eq!(b.time_until_retry(t0), Duration::from_millis(30));

        assert!(b.can_try_now(t0 + Duration::from_millis(31)));
        b.report_success();
        assert!(b.can_try_now(t0));
        b.report_error(t0);
        assert_eq!(b.time_until_retry(t0), Duration::from_millis(8));
    }
}
