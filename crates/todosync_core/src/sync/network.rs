//! Network status monitor.
//!
//! # Responsibility
//! - Track connectivity reported by the host and expose the committed state.
//! - Debounce flapping: a change is committed only after it has been
//!   observed continuously for the configured dwell time.
//! - Notify subscribers of committed transitions.
//!
//! # Invariants
//! - Only this monitor mutates its `NetworkState`.
//! - Listeners run on the reporting thread, outside internal locks, and
//!   must not block.

use crate::clock::Clock;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Online,
    Offline,
    /// Reachable but unreliable; sync waits for `Online`.
    Degraded,
}

impl NetworkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Degraded => "degraded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "degraded" => Some(Self::Degraded),
            _ => None,
        }
    }
}

/// A committed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkTransition {
    pub from: NetworkState,
    pub to: NetworkState,
    pub at_ms: i64,
}

/// Handle returned by `on_change`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Listener = Arc<dyn Fn(NetworkTransition) + Send + Sync>;

struct MonitorState {
    current: NetworkState,
    /// Observed state that differs from `current`, and when it was first seen.
    candidate: Option<(NetworkState, i64)>,
}

pub struct NetworkMonitor {
    clock: Arc<dyn Clock>,
    dwell_ms: i64,
    state: Mutex<MonitorState>,
    listeners: Mutex<Vec<(Subscription, Listener)>>,
    next_subscription: AtomicU64,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkState, dwell_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            dwell_ms: i64::try_from(dwell_ms).unwrap_or(i64::MAX),
            state: Mutex::new(MonitorState {
                current: initial,
                candidate: None,
            }),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn current_state(&self) -> NetworkState {
        self.state().current
    }

    /// Registers a listener for committed transitions.
    pub fn on_change(
        &self,
        listener: impl Fn(NetworkTransition) + Send + Sync + 'static,
    ) -> Subscription {
        let subscription = Subscription(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let listener: Listener = Arc::new(listener);
        self.listeners().push((subscription, listener));
        subscription
    }

    /// Removes a listener. Returns `false` when it was not registered.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != subscription);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Host connectivity event.
    ///
    /// Returns the committed transition, if the observation completed one
    /// (always the case with a zero dwell time).
    pub fn report(&self, observed: NetworkState) -> Option<NetworkTransition> {
        let now = self.clock.now_ms();
        {
            let mut state = self.state();
            if observed == state.current {
                if state.candidate.take().is_some() {
                    debug!(
                        "event=network_flap module=network status=ignored state={}",
                        observed.as_str()
                    );
                }
            } else {
                match state.candidate {
                    Some((candidate, _)) if candidate == observed => {}
                    _ => state.candidate = Some((observed, now)),
                }
            }
        }
        self.tick()
    }

    /// Commits a pending candidate whose dwell time has elapsed.
    pub fn tick(&self) -> Option<NetworkTransition> {
        let now = self.clock.now_ms();
        let transition = {
            let mut state = self.state();
            match state.candidate {
                Some((candidate, since)) if now.saturating_sub(since) >= self.dwell_ms => {
                    let transition = NetworkTransition {
                        from: state.current,
                        to: candidate,
                        at_ms: now,
                    };
                    state.current = candidate;
                    state.candidate = None;
                    Some(transition)
                }
                _ => None,
            }
        }?;

        info!(
            "event=network_transition module=network status=ok from={} to={}",
            transition.from.as_str(),
            transition.to.as_str()
        );
        let listeners: Vec<Listener> = self
            .listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(transition);
        }
        Some(transition)
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(Subscription, Listener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
