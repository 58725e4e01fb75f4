//! Session-wide gate that pauses every outbound call while a global rate limit is in force.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default)]
struct GateState {
    closers: usize,
    /// When the longest outstanding close is due to end.
    reopen_at: Option<Instant>,
}

/// Open unless at least one [`GateGuard`] is alive.
///
/// Closing is counted, so overlapping global limits keep the gate shut until the last one
/// ends. Waiting is cancel-safe.
#[derive(Debug, Clone)]
pub struct GlobalGate {
    state: Arc<watch::Sender<GateState>>,
}

impl Default for GlobalGate {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(GateState::default());
        Self { state: Arc::new(tx) }
    }
}

impl GlobalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().closers == 0
    }

    /// Time left until the gate is expected to reopen, if it is closed.
    pub fn reopens_in(&self) -> Option<Duration> {
        let state = *self.state.borrow();
        if state.closers == 0 {
            return None;
        }
        let now = Instant::now();
        Some(state.reopen_at.map_or(Duration::ZERO, |at| at.saturating_duration_since(now)))
    }

    /// Resolve once the gate is open. Returns immediately when it already is.
    pub async fn wait_open(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|state| state.closers == 0).await;
    }

    /// Like [`wait_open`](Self::wait_open), but give up once `ceiling` would be exceeded.
    ///
    /// A gate known to stay closed longer than `ceiling` fails immediately. The error carries
    /// the expected wait.
    pub async fn wait_open_within(&self, ceiling: Option<Duration>) -> Result<(), Duration> {
        let Some(ceiling) = ceiling else {
            self.wait_open().await;
            return Ok(());
        };
        if let Some(left) = self.reopens_in().filter(|left| *left > ceiling) {
            return Err(left);
        }
        tokio::time::timeout(ceiling, self.wait_open())
            .await
            .map_err(|_| self.reopens_in().unwrap_or(ceiling))
    }

    /// Close the gate for `retry_after`, until the returned guard is dropped.
    pub fn close(&self, retry_after: Duration) -> GateGuard {
        let until = Instant::now() + retry_after;
        self.state.send_modify(|state| {
            state.closers += 1;
            state.reopen_at = Some(state.reopen_at.map_or(until, |at| at.max(until)));
        });
        GateGuard { state: Arc::clone(&self.state) }
    }
}

/// Keeps the [`GlobalGate`] closed while alive.
#[derive(Debug)]
#[must_use = "the gate reopens as soon as the guard is dropped"]
pub struct GateGuard {
    state: Arc<watch::Sender<GateState>>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.state.send_modify(|state| {
            state.closers = state.closers.saturating_sub(1);
            if state.closers == 0 {
                state.reopen_at = None;
            }
        });
    }
}
