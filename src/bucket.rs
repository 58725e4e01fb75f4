//! Per-bucket rate-limit state machine.
//!
//! A [`Bucket`] behaves like a semaphore whose size and refill schedule are learned from the
//! server. Callers [`Bucket::acquire`] a [`Permit`] before sending, feed the response's headers
//! into [`Bucket::update`], and drop the permit afterwards.
//!
//! States:
//! - **has capacity**: `remaining > 0`, acquirers take a slot immediately.
//! - **saturated**: `remaining <= 0`, acquirers join a FIFO queue and suspend.
//! - **reset pending**: one task sleeps until the window ends, then resets the counters and
//!   wakes up to `remaining` waiters.
//!
//! Counters live behind a synchronous mutex that is never held across an `.await`. The single
//! refresher is elected through an async mutex; whoever holds it owns the sleep.
//!
//! Cancellation: dropping a queued acquire removes its queue entry. If a wake had already been
//! handed to it, the wake is forwarded to the next waiter so no slot is lost. Dropping a
//! [`Permit`] releases its slot exactly once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, OwnedMutexGuard};

use crate::clock::Clock;
use crate::error::HttpError;
use crate::headers::{secs, RateLimitHeaders};
use crate::sleeper::Sleeper;

/// Upper bound on a single wait when the bucket has no known expiry.
pub const UNKNOWN_EXPIRY_WAIT: Duration = Duration::from_secs(30);

/// Static knobs shared by every bucket in a session.
#[derive(Debug, Clone)]
pub struct BucketSettings {
    pub default_limit: i64,
    /// Longest reset a bucket will sleep through before failing its waiters instead.
    pub ceiling: Option<Duration>,
    pub idle_after: Duration,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self { default_limit: 1, ceiling: None, idle_after: Duration::from_secs(300) }
    }
}

/// What a queued waiter receives: go ahead, or fail with the given retry delay.
type Wake = Result<(), Duration>;

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Wake>,
    /// The caller's own ceiling, and the clock reading it runs out at.
    ceiling: Option<Duration>,
    deadline: Option<Duration>,
}

impl Waiter {
    fn outlasted_by(&self, expires_at: Duration) -> bool {
        self.deadline.is_some_and(|d| expires_at > d)
    }
}

#[derive(Debug)]
struct BucketState {
    limit: i64,
    remaining: i64,
    outgoing: i64,
    reset_after: Duration,
    expires_at: Option<Duration>,
    dirty: bool,
    last_activity: Duration,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

impl BucketState {
    fn reset(&mut self) {
        self.remaining = self.limit - self.outgoing;
        self.expires_at = None;
        self.reset_after = Duration::ZERO;
        self.dirty = false;
    }

    /// Hand `wake` to up to `count` live waiters in FIFO order.
    fn wake(&mut self, count: i64, wake: Wake) -> usize {
        self.wake_each(count, |_| wake)
    }

    fn wake_each(&mut self, count: i64, wake: impl Fn(&Waiter) -> Wake) -> usize {
        let mut woken = 0usize;
        while (woken as i64) < count {
            let Some(waiter) = self.waiters.pop_front() else { break };
            let wake = wake(&waiter);
            if waiter.tx.send(wake).is_ok() {
                woken += 1;
            }
        }
        woken
    }

    /// Fail every waiter whose deadline falls before `expires_at`. The rest keep their place.
    fn fail_outlasted(&mut self, expires_at: Duration, now: Duration) -> usize {
        let retry_after = expires_at.saturating_sub(now);
        let mut failed = 0usize;
        for waiter in std::mem::take(&mut self.waiters) {
            if !waiter.outlasted_by(expires_at) {
                self.waiters.push_back(waiter);
            } else if waiter.tx.send(Err(retry_after)).is_ok() {
                failed += 1;
            }
        }
        failed
    }

    fn wake_all(&mut self, wake: Wake) -> usize {
        let count = self.waiters.len() as i64;
        self.wake(count, wake)
    }
}

/// Point-in-time view of a bucket, for introspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub limit: i64,
    pub remaining: i64,
    pub outgoing: i64,
    pub reset_after: Duration,
    /// Time left until the current window ends, if known.
    pub expires_in: Option<Duration>,
    pub dirty: bool,
    pub waiters: usize,
}

/// Rate-limit state for one bucket key.
#[derive(Debug)]
pub struct Bucket {
    state: Mutex<BucketState>,
    refreshing: Arc<tokio::sync::Mutex<()>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    settings: BucketSettings,
}

impl Bucket {
    pub fn new(settings: BucketSettings, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        let limit = settings.default_limit.max(1);
        let state = BucketState {
            limit,
            remaining: limit,
            outgoing: 0,
            reset_after: Duration::ZERO,
            expires_at: None,
            dirty: false,
            last_activity: clock.now(),
            waiters: VecDeque::new(),
            next_waiter: 0,
        };
        Self {
            state: Mutex::new(state),
            refreshing: Arc::new(tokio::sync::Mutex::new(())),
            clock,
            sleeper,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for a slot.
    ///
    /// Fails with [`HttpError::RateLimited`] as soon as the window is known to end after
    /// `ceiling` has run out, whether that is known on entry or learned while queued. Also fails
    /// when a refresh decides the reset is too long to wait out.
    pub async fn acquire(self: &Arc<Self>, ceiling: Option<Duration>) -> Result<Permit, HttpError> {
        let deadline = {
            let mut st = self.lock();
            let now = self.clock.now();
            st.last_activity = now;
            if st.expires_at.is_some_and(|e| now > e) {
                st.reset();
            }
            if let (Some(ceiling), Some(expires_at)) = (ceiling, st.expires_at) {
                let left = expires_at.saturating_sub(now);
                if left > ceiling {
                    tracing::warn!(
                        wait_secs = left.as_secs_f64(),
                        ceiling_secs = ceiling.as_secs_f64(),
                        "bucket reset exceeds ceiling; failing fast"
                    );
                    return Err(HttpError::RateLimited { retry_after: left, edge: false });
                }
            }
            ceiling.map(|c| now + c)
        };

        loop {
            let (id, mut rx) = {
                let mut st = self.lock();
                if st.remaining > 0 {
                    st.remaining -= 1;
                    st.outgoing += 1;
                    return Ok(Permit { bucket: Arc::clone(self) });
                }
                let id = st.next_waiter;
                st.next_waiter += 1;
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(Waiter { id, tx, ceiling, deadline });
                tracing::debug!(
                    waiters = st.waiters.len(),
                    outgoing = st.outgoing,
                    "bucket exhausted; queueing request"
                );
                (id, rx)
            };

            let mut guard = WaitGuard { bucket: self, id, armed: true };
            loop {
                let max_wait = {
                    let st = self.lock();
                    let now = self.clock.now();
                    match st.expires_at {
                        Some(e) if deadline.is_some_and(|d| e > d) => Err(e.saturating_sub(now)),
                        Some(e) => Ok(e.saturating_sub(now)),
                        None => Ok(UNKNOWN_EXPIRY_WAIT),
                    }
                };
                let max_wait = match max_wait {
                    Ok(wait) => wait,
                    Err(retry_after) => {
                        tracing::debug!(
                            wait_secs = retry_after.as_secs_f64(),
                            "queued request would outlast its ceiling; failing"
                        );
                        return Err(HttpError::RateLimited { retry_after, edge: false });
                    }
                };
                tokio::select! {
                    woke = &mut rx => {
                        guard.armed = false;
                        match woke {
                            Ok(Err(retry_after)) => {
                                return Err(HttpError::RateLimited { retry_after, edge: false });
                            }
                            Ok(Ok(())) | Err(_) => break,
                        }
                    }
                    _ = self.sleeper.sleep(max_wait) => {
                        let permit = Arc::clone(&self.refreshing).lock_owned().await;
                        self.refresh(permit).await;
                    }
                }
            }
        }
    }

    /// Return a slot. Invoked from [`Permit`]'s `Drop`.
    fn release(self: &Arc<Self>) {
        let mut st = self.lock();
        st.outgoing = (st.outgoing - 1).max(0);
        st.last_activity = self.clock.now();
        let tokens = st.remaining - st.outgoing;

        // A held refresh lock means someone is already sleeping on this bucket and will wake
        // the queue when the window ends.
        let Ok(refresh) = Arc::clone(&self.refreshing).try_lock_owned() else { return };

        if tokens <= 0 {
            drop(st);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let bucket = Arc::clone(self);
                    handle.spawn(async move { bucket.refresh(refresh).await });
                }
                Err(_) => tracing::debug!("no runtime to refresh bucket; next acquire resets it"),
            }
        } else if !st.waiters.is_empty() {
            let reset_after = st.reset_after;
            st.wake_each(tokens, |waiter| match waiter.ceiling {
                Some(ceiling) if reset_after > ceiling => Err(reset_after),
                _ => Ok(()),
            });
        }
    }

    /// Sleep out the current window, reset, and wake the queue. `_permit` is the refresh lock.
    async fn refresh(&self, _permit: OwnedMutexGuard<()>) {
        let wait = {
            let st = self.lock();
            match st.expires_at {
                Some(e) => e.saturating_sub(self.clock.now()),
                None => st.reset_after,
            }
        };
        let too_long = self.settings.ceiling.is_some_and(|c| wait > c);
        if !too_long && !wait.is_zero() {
            {
                let mut st = self.lock();
                let now = self.clock.now();
                st.fail_outlasted(now + wait, now);
            }
            self.sleeper.sleep(wait).await;
        }

        let mut st = self.lock();
        st.reset();
        if too_long {
            let failed = st.wake_all(Err(wait));
            tracing::warn!(
                failed,
                wait_secs = wait.as_secs_f64(),
                "bucket reset exceeds ceiling; failing queued requests"
            );
        } else {
            let remaining = st.remaining;
            st.wake(remaining, Ok(()));
        }
    }

    /// Absorb the rate-limit headers of a response received while holding a permit.
    ///
    /// The first response after a reset is trusted as-is; later ones can only lower
    /// `remaining`, since responses to concurrent requests arrive out of order.
    pub fn update(&self, headers: &RateLimitHeaders, use_clock: bool) {
        let mut st = self.lock();
        st.limit = headers.limit.unwrap_or(self.settings.default_limit);
        let reported = headers.remaining.unwrap_or(0);
        if st.dirty {
            st.remaining = reported.min(st.limit - st.outgoing);
        } else {
            st.remaining = reported;
            st.dirty = true;
        }

        let reset_after = match (headers.reset_after, headers.reset) {
            (Some(delta), _) if !use_clock => delta,
            (_, Some(reset)) => reset - self.clock.unix_now().as_secs_f64(),
            (Some(delta), None) => delta,
            (None, None) => 0.0,
        };
        st.reset_after = secs(reset_after);
        let now = self.clock.now();
        let expires_at = now + st.reset_after;
        st.expires_at = Some(expires_at);

        let failed = st.fail_outlasted(expires_at, now);
        if failed > 0 {
            tracing::debug!(
                failed,
                wait_secs = st.reset_after.as_secs_f64(),
                "new window outlasts queued ceilings; failing those requests"
            );
        }
    }

    /// Whether the current window has ended.
    pub fn is_expired(&self) -> bool {
        let now = self.clock.now();
        self.lock().expires_at.is_some_and(|e| now > e)
    }

    /// Whether the bucket can be evicted: untouched for the idle threshold, nothing in flight,
    /// nobody queued.
    pub fn is_idle(&self) -> bool {
        let now = self.clock.now();
        let st = self.lock();
        now.saturating_sub(st.last_activity) >= self.settings.idle_after
            && st.outgoing == 0
            && st.waiters.is_empty()
    }

    pub fn remaining(&self) -> i64 {
        self.lock().remaining
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let now = self.clock.now();
        let st = self.lock();
        BucketSnapshot {
            limit: st.limit,
            remaining: st.remaining,
            outgoing: st.outgoing,
            reset_after: st.reset_after,
            expires_in: st.expires_at.map(|e| e.saturating_sub(now)),
            dirty: st.dirty,
            waiters: st.waiters.len(),
        }
    }
}

/// Removes a queued waiter when its acquire is dropped mid-wait.
struct WaitGuard<'a> {
    bucket: &'a Arc<Bucket>,
    id: u64,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = self.bucket.lock();
        if let Some(pos) = st.waiters.iter().position(|w| w.id == self.id) {
            st.waiters.remove(pos);
        } else if st.remaining > 0 {
            // Our entry was already popped, so a wake was handed to us. Pass it on.
            st.wake(1, Ok(()));
        }
    }
}

/// One acquired slot. Dropping it returns the slot to the bucket.
#[must_use = "dropping a permit releases its slot immediately"]
#[derive(Debug)]
pub struct Permit {
    bucket: Arc<Bucket>,
}

impl Permit {
    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.bucket.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MonotonicClock};
    use crate::sleeper::TokioSleeper;

    fn bucket_with(settings: BucketSettings) -> Arc<Bucket> {
        let clock = Arc::new(MonotonicClock::default());
        Arc::new(Bucket::new(settings, clock, Arc::new(TokioSleeper)))
    }

    fn headers(limit: i64, remaining: i64, reset_after: f64) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: Some(limit),
            remaining: Some(remaining),
            reset_after: Some(reset_after),
            ..RateLimitHeaders::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_bucket_uses_default_limit() {
        let bucket = bucket_with(BucketSettings::default());
        let snap = bucket.snapshot();
        assert_eq!((snap.limit, snap.remaining, snap.outgoing), (1, 1, 0));

        let permit = bucket.acquire(None).await.unwrap();
        assert_eq!(bucket.snapshot().outgoing, 1);
        assert_eq!(bucket.remaining(), 0);
        drop(permit);
        assert_eq!(bucket.snapshot().outgoing, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_trusts_first_response_then_takes_minimum() {
        let bucket = bucket_with(BucketSettings::default());
        let _a = bucket.acquire(None).await.unwrap();

        bucket.update(&headers(5, 4, 1.0), false);
        let snap = bucket.snapshot();
        assert_eq!((snap.limit, snap.remaining), (5, 4));
        assert!(snap.dirty);
        assert!(snap.remaining + snap.outgoing <= snap.limit);

        // Stale response claims more capacity than limit - outgoing allows.
        bucket.update(&headers(5, 5, 1.0), false);
        assert_eq!(bucket.remaining(), 4);

        bucket.update(&headers(5, 2, 1.0), false);
        assert_eq!(bucket.remaining(), 2);
    }

    #[test]
    fn update_uses_absolute_reset_with_clock_or_missing_delta() {
        let clock = ManualClock::starting_at(Duration::from_secs(1_000));
        let bucket = Bucket::new(
            BucketSettings::default(),
            Arc::new(clock.clone()),
            Arc::new(TokioSleeper),
        );
        let mut hdrs = headers(1, 0, 9.0);
        hdrs.reset = Some(1_002.5);

        bucket.update(&hdrs, true);
        assert_eq!(bucket.snapshot().reset_after, Duration::from_millis(2500));

        bucket.update(&hdrs, false);
        assert_eq!(bucket.snapshot().reset_after, Duration::from_secs(9));

        hdrs.reset_after = None;
        bucket.update(&hdrs, false);
        assert_eq!(bucket.snapshot().reset_after, Duration::from_millis(2500));

        clock.advance(Duration::from_secs(3));
        assert!(bucket.is_expired());
    }

    #[test]
    fn idle_requires_quiet_time_and_no_traffic() {
        let clock = ManualClock::default();
        let bucket =
            Bucket::new(BucketSettings::default(), Arc::new(clock.clone()), Arc::new(TokioSleeper));
        assert!(!bucket.is_idle());
        clock.advance(Duration::from_secs(299));
        assert!(!bucket.is_idle());
        clock.advance(Duration::from_secs(1));
        assert!(bucket.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_suspends_until_reset() {
        let bucket = bucket_with(BucketSettings::default());
        bucket.update(&headers(1, 0, 2.0), false);

        let start = tokio::time::Instant::now();
        let permit = bucket.acquire(None).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(2100), "waited {:?}", waited);
        drop(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn one_release_wakes_exactly_one_waiter() {
        let bucket = bucket_with(BucketSettings::default());
        let holder = bucket.acquire(None).await.unwrap();
        bucket.update(&headers(5, 0, 60.0), false);

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                tokio::spawn(async move { bucket.acquire(None).await.map(std::mem::forget) })
            })
            .collect();
        settle().await;
        assert_eq!(bucket.snapshot().waiters, 5);

        // One slot comes back: a later response frees one, then the holder finishes.
        bucket.update(&headers(5, 1, 60.0), false);
        drop(holder);
        settle().await;

        let finished: Vec<bool> = waiters.iter().map(|w| w.is_finished()).collect();
        assert_eq!(finished, vec![true, false, false, false, false]);
        let snap = bucket.snapshot();
        assert_eq!((snap.waiters, snap.remaining, snap.outgoing), (4, 0, 1));
        for waiter in waiters {
            waiter.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_waiter_fails_once_window_outlasts_its_ceiling() {
        let bucket = bucket_with(BucketSettings::default());
        let holder = bucket.acquire(None).await.unwrap();

        let start = tokio::time::Instant::now();
        let strict = tokio::spawn({
            let bucket = Arc::clone(&bucket);
            async move { bucket.acquire(Some(Duration::from_secs(5))).await.map(drop) }
        });
        let patient = tokio::spawn({
            let bucket = Arc::clone(&bucket);
            async move { bucket.acquire(Some(Duration::from_secs(60))).await.map(drop) }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bucket.snapshot().waiters, 2);

        bucket.update(&headers(1, 0, 30.0), false);
        let err = strict.await.unwrap().unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_millis(1100));
        assert_eq!(bucket.snapshot().waiters, 1);

        drop(holder);
        patient.await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_forwards_its_wake() {
        let bucket = bucket_with(BucketSettings::default());
        let holder = bucket.acquire(None).await.unwrap();
        bucket.update(&headers(2, 0, 60.0), false);

        let mut first = Box::pin(bucket.acquire(None));
        assert!(futures::poll!(first.as_mut()).is_pending());
        let second = tokio::spawn({
            let bucket = Arc::clone(&bucket);
            async move { bucket.acquire(None).await.map(drop) }
        });
        settle().await;
        assert_eq!(bucket.snapshot().waiters, 2);

        bucket.update(&headers(2, 2, 60.0), false);
        drop(holder); // wakes `first`, which never observes it
        drop(first);
        settle().await;

        assert!(second.is_finished());
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_waiter_leaves_queue() {
        let bucket = bucket_with(BucketSettings::default());
        let holder = bucket.acquire(None).await.unwrap();
        bucket.update(&headers(1, 0, 60.0), false);

        let waiter = tokio::spawn({
            let bucket = Arc::clone(&bucket);
            async move { bucket.acquire(None).await.map(drop) }
        });
        settle().await;
        assert_eq!(bucket.snapshot().waiters, 1);
        waiter.abort();
        settle().await;
        assert_eq!(bucket.snapshot().waiters, 0);
        drop(holder);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_beyond_ceiling_fails_fast() {
        let bucket = bucket_with(BucketSettings {
            ceiling: Some(Duration::from_secs(5)),
            ..BucketSettings::default()
        });
        bucket.update(&headers(1, 0, 30.0), false);

        let start = tokio::time::Instant::now();
        let err = bucket.acquire(Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_millis(1));
        assert!(err.is_rate_limited());
        assert!(err.retry_after().unwrap() > Duration::from_secs(29));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_waiters_fail_when_refresh_exceeds_ceiling() {
        let bucket = bucket_with(BucketSettings {
            ceiling: Some(Duration::from_secs(5)),
            ..BucketSettings::default()
        });
        let holder = bucket.acquire(None).await.unwrap();
        let waiter = tokio::spawn({
            let bucket = Arc::clone(&bucket);
            async move { bucket.acquire(None).await.map(drop) }
        });
        settle().await;

        bucket.update(&headers(1, 0, 30.0), false);
        drop(holder);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(bucket.snapshot().waiters, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_never_exceeds_limit() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let bucket = bucket_with(BucketSettings::default());
        {
            let _p = bucket.acquire(None).await.unwrap();
            bucket.update(&headers(3, 2, 1.0), false);
        }
        let in_flight = Arc::new(AtomicI64::new(0));
        let peak = Arc::new(AtomicI64::new(0));
        let mut tasks = Vec::new();
        for _ in 0..12 {
            let bucket = Arc::clone(&bucket);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let permit = bucket.acquire(None).await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                let snap = bucket.snapshot();
                assert!(snap.outgoing >= 0 && snap.outgoing <= snap.limit);
                in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(bucket.snapshot().outgoing, 0);
    }
}
