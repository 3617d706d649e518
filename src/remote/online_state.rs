use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::EngineError;
use crate::util::runtime;

/// Whether the client should trust its watch stream to deliver events.
///
/// `Unknown` is the initial and the post-disconnect state; listeners treat it
/// like `Online` until the tracker decides otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    Unknown,
    Online,
    Offline,
}

/// Consecutive watch stream failures tolerated before giving up and
/// reporting `Offline`.
pub const MAX_WATCH_STREAM_FAILURES: u32 = 2;

/// How long a connecting stream may stay silent before `Unknown` degrades to
/// `Offline` anyway.
pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

pub type OnlineStateCallback = dyn Fn(OnlineState) + Send + Sync;

/// Debounces watch stream health into [`OnlineState`] transitions.
///
/// A healthy stream goes `Online` on its first message. A failing stream
/// first falls back to `Unknown` and only reaches `Offline` after the retry
/// budget is spent or the grace timer fires, so a single blip never flips
/// `Online` straight to `Offline`.
pub struct OnlineStateTracker {
    state: Mutex<TrackerState>,
    callback: Arc<OnlineStateCallback>,
    timeout: Duration,
}

struct TrackerState {
    current: OnlineState,
    failure_count: u32,
    timer_generation: u64,
}

impl OnlineStateTracker {
    pub fn new(callback: Arc<OnlineStateCallback>) -> Arc<Self> {
        Self::with_timeout(callback, DEFAULT_ONLINE_STATE_TIMEOUT)
    }

    pub fn with_timeout(callback: Arc<OnlineStateCallback>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState {
                current: OnlineState::Unknown,
                failure_count: 0,
                timer_generation: 0,
            }),
            callback,
            timeout,
        })
    }

    pub fn current(&self) -> OnlineState {
        self.state.lock().unwrap().current
    }

    /// Arms the grace timer when the watch stream starts connecting.
    pub fn handle_watch_stream_start(self: &Arc<Self>) {
        let generation = {
            let mut guard = self.state.lock().unwrap();
            if guard.current != OnlineState::Unknown {
                return;
            }
            guard.timer_generation += 1;
            guard.timer_generation
        };

        let tracker = Arc::clone(self);
        let timeout = self.timeout;
        runtime::spawn_detached(async move {
            runtime::sleep(timeout).await;
            let notify = {
                let mut guard = tracker.state.lock().unwrap();
                if guard.timer_generation != generation || guard.current != OnlineState::Unknown {
                    false
                } else {
                    log::debug!(
                        "watch stream did not connect within {timeout:?}, reporting offline"
                    );
                    guard.current = OnlineState::Offline;
                    true
                }
            };
            if notify {
                (tracker.callback)(OnlineState::Offline);
            }
        });
    }

    /// Call for every message the watch stream delivers.
    pub fn handle_watch_stream_message(&self) {
        self.set(OnlineState::Online);
    }

    pub fn handle_watch_stream_failure(&self, error: &EngineError) {
        let transition = {
            let mut guard = self.state.lock().unwrap();
            match guard.current {
                OnlineState::Online => {
                    // One blip after a healthy stream only costs certainty.
                    guard.current = OnlineState::Unknown;
                    guard.failure_count = 0;
                    guard.timer_generation += 1;
                    Some(OnlineState::Unknown)
                }
                OnlineState::Unknown => {
                    guard.failure_count += 1;
                    if guard.failure_count >= MAX_WATCH_STREAM_FAILURES {
                        log::debug!(
                            "watch stream failed {} times, reporting offline: {error}",
                            guard.failure_count
                        );
                        guard.current = OnlineState::Offline;
                        guard.timer_generation += 1;
                        Some(OnlineState::Offline)
                    } else {
                        None
                    }
                }
                OnlineState::Offline => None,
            }
        };
        if let Some(state) = transition {
            (self.callback)(state);
        }
    }

    /// Forces a state, resetting failure accounting. Used when the network is
    /// explicitly enabled or disabled.
    pub fn set(&self, state: OnlineState) {
        let changed = {
            let mut guard = self.state.lock().unwrap();
            guard.failure_count = 0;
            guard.timer_generation += 1;
            if guard.current == state {
                false
            } else {
                guard.current = state;
                true
            }
        };
        if changed {
            (self.callback)(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::unavailable;
    use std::sync::Mutex as StdMutex;

    fn tracker_with_log() -> (Arc<OnlineStateTracker>, Arc<StdMutex<Vec<OnlineState>>>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let callback: Arc<OnlineStateCallback> = Arc::new(move |state| {
            sink.lock().unwrap().push(state);
        });
        (OnlineStateTracker::with_timeout(callback, Duration::from_millis(50)), log)
    }

    #[tokio::test]
    async fn first_message_reports_online() {
        let (tracker, log) = tracker_with_log();
        tracker.handle_watch_stream_message();
        assert_eq!(tracker.current(), OnlineState::Online);
        assert_eq!(log.lock().unwrap().as_slice(), &[OnlineState::Online]);
    }

    #[tokio::test]
    async fn offline_needs_repeated_failures() {
        let (tracker, _log) = tracker_with_log();
        tracker.handle_watch_stream_failure(&unavailable("down"));
        assert_eq!(tracker.current(), OnlineState::Unknown);
        tracker.handle_watch_stream_failure(&unavailable("down"));
        assert_eq!(tracker.current(), OnlineState::Offline);
    }

    #[tokio::test]
    async fn online_degrades_to_unknown_first() {
        let (tracker, log) = tracker_with_log();
        tracker.handle_watch_stream_message();
        tracker.handle_watch_stream_failure(&unavailable("blip"));
        assert_eq!(tracker.current(), OnlineState::Unknown);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[OnlineState::Online, OnlineState::Unknown]
        );
    }

    #[tokio::test]
    async fn grace_timeout_reports_offline() {
        let (tracker, _log) = tracker_with_log();
        tracker.handle_watch_stream_start();
        runtime::sleep(Duration::from_millis(120)).await;
        assert_eq!(tracker.current(), OnlineState::Offline);
    }
}
