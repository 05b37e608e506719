//! Concurrent lanes racing for one result.
//!
//! Each [`Lane`] runs its attempts in order on its own task. Lanes share a
//! [`RaceSlot`]: the first attempt to produce a value flips the slot's
//! `completed` flag, stores the value and cancels every other lane. A
//! cancelled attempt is dropped, which closes its socket; it never reports
//! an error.
//!
//! A lane may start late: it waits for its start delay, or until every
//! earlier lane has run out of attempts, whichever comes first.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hs_core::{ErrorKind, HandleError, HandleResult};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One attempt: given the race's cancellation token, produce a value.
pub type Attempt<T> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, HandleResult<T>> + Send>;

/// A sequence of attempts run on one task.
pub struct Lane<T> {
    /// Name used in logs and in the [`Winner`].
    pub name: String,
    /// How long to wait before the first attempt.
    pub start_delay: Duration,
    /// Attempts, tried in order until one succeeds.
    pub attempts: Vec<Attempt<T>>,
}

impl<T> Lane<T> {
    /// A lane starting immediately.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_delay: Duration::ZERO,
            attempts: Vec::new(),
        }
    }

    /// Sets the start delay.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Appends an attempt.
    pub fn attempt<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = HandleResult<T>> + Send + 'static,
    {
        self.attempts.push(Box::new(move |token| Box::pin(f(token))));
        self
    }

    /// Number of attempts.
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// True if the lane has nothing to try.
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

/// The value that won and the lane it came from.
#[derive(Debug)]
pub struct Winner<T> {
    /// Winning lane.
    pub lane: String,
    /// Its value.
    pub value: T,
}

/// Shared completion state of one race.
pub struct RaceSlot<T> {
    completed: AtomicBool,
    winner: Mutex<Option<Winner<T>>>,
    cancel: CancellationToken,
    exhausted: Mutex<Vec<bool>>,
    lane_done: Notify,
}

impl<T> RaceSlot<T> {
    fn new(lanes: usize) -> Self {
        Self {
            completed: AtomicBool::new(false),
            winner: Mutex::new(None),
            cancel: CancellationToken::new(),
            exhausted: Mutex::new(vec![false; lanes]),
            lane_done: Notify::new(),
        }
    }

    /// Commits `value` if no lane has yet. Marks completion before
    /// cancelling the other lanes.
    pub fn try_complete(&self, lane: &str, value: T) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.winner.lock() = Some(Winner {
            lane: lane.to_string(),
            value,
        });
        self.cancel.cancel();
        true
    }

    /// True once a lane has won.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<Winner<T>> {
        self.winner.lock().take()
    }

    fn mark_exhausted(&self, index: usize) {
        if let Some(flag) = self.exhausted.lock().get_mut(index) {
            *flag = true;
        }
        self.lane_done.notify_waiters();
    }

    fn earlier_exhausted(&self, index: usize) -> bool {
        self.exhausted.lock()[..index].iter().all(|done| *done)
    }

    async fn wait_earlier_exhausted(&self, index: usize) {
        if index == 0 {
            return std::future::pending().await;
        }
        loop {
            let notified = self.lane_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.earlier_exhausted(index) {
                return;
            }
            notified.await;
        }
    }
}

async fn run_lane<T: Send + 'static>(
    index: usize,
    lane: Lane<T>,
    slot: Arc<RaceSlot<T>>,
) -> Vec<HandleError> {
    let mut errors = Vec::new();
    if !lane.start_delay.is_zero() {
        tokio::select! {
            biased;
            _ = slot.cancel.cancelled() => {
                trace!(lane = %lane.name, "cancelled before start");
                return errors;
            }
            _ = tokio::time::sleep(lane.start_delay) => {}
            _ = slot.wait_earlier_exhausted(index) => {
                trace!(lane = %lane.name, "earlier lanes exhausted, starting early");
            }
        }
    }

    debug!(lane = %lane.name, attempts = lane.attempts.len(), "lane started");
    for attempt in lane.attempts {
        if slot.is_completed() {
            break;
        }
        let result = tokio::select! {
            biased;
            _ = slot.cancel.cancelled() => None,
            result = attempt(slot.cancel.clone()) => Some(result),
        };
        match result {
            None => {
                trace!(lane = %lane.name, "cancelled");
                break;
            }
            Some(Ok(value)) => {
                if slot.try_complete(&lane.name, value) {
                    debug!(lane = %lane.name, "lane won");
                } else {
                    trace!(lane = %lane.name, "late result discarded");
                }
                break;
            }
            Some(Err(err)) => {
                debug!(lane = %lane.name, error = %err, "attempt failed");
                errors.push(err);
            }
        }
    }
    slot.mark_exhausted(index);
    errors
}

/// Picks the error to report when every attempt failed: the last one that
/// is not a plain connection failure, else the last one.
pub fn most_relevant_error(errors: Vec<HandleError>) -> HandleError {
    let fallback = errors.last().cloned();
    errors
        .into_iter()
        .rev()
        .find(|e| e.kind() != ErrorKind::CannotConnectToServer)
        .or(fallback)
        .unwrap_or_else(|| {
            HandleError::new(ErrorKind::CannotConnectToServer, "no server could be reached")
        })
}

/// Runs the lanes and returns the first value produced.
pub async fn race<T: Send + 'static>(lanes: Vec<Lane<T>>) -> HandleResult<Winner<T>> {
    let slot = Arc::new(RaceSlot::new(lanes.len()));
    let tasks: Vec<_> = lanes
        .into_iter()
        .enumerate()
        .map(|(index, lane)| tokio::spawn(run_lane(index, lane, slot.clone())))
        .collect();

    let mut errors = Vec::new();
    for task in tasks {
        match task.await {
            Ok(mut lane_errors) => errors.append(&mut lane_errors),
            Err(e) => errors.push(HandleError::internal(format!("race lane failed: {e}"))),
        }
    }
    match slot.take() {
        Some(winner) => Ok(winner),
        None => Err(most_relevant_error(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn connect_failure() -> HandleError {
        HandleError::new(ErrorKind::CannotConnectToServer, "refused")
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_fastest_lane_wins_and_cancels_other() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let slow = Lane::new("slow").attempt(move |_| async move {
            let _guard = DropFlag(flag);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(1)
        });
        let fast = Lane::new("fast").attempt(|_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(2)
        });
        let winner = race(vec![slow, fast]).await.unwrap();
        assert_eq!(winner.lane, "fast");
        assert_eq!(winner.value, 2);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lane_falls_through_attempts() {
        let lane = Lane::new("one")
            .attempt(|_| async { Err::<u8, _>(connect_failure()) })
            .attempt(|_| async { Ok(7) });
        assert_eq!(race(vec![lane]).await.unwrap().value, 7);
    }

    #[tokio::test]
    async fn test_all_fail_reports_relevant_error() {
        let a = Lane::new("a").attempt(|_| async {
            Err::<u8, _>(HandleError::new(ErrorKind::MessageFormatError, "garbage"))
        });
        let b = Lane::new("b").attempt(|_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<u8, _>(connect_failure())
        });
        let err = race(vec![a, b]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MessageFormatError);

        let err = race(Vec::<Lane<u8>>::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CannotConnectToServer);
    }

    #[tokio::test]
    async fn test_delayed_lane_starts_when_earlier_lanes_exhausted() {
        let started = std::time::Instant::now();
        let preferred = Lane::new("preferred").attempt(|_| async { Err::<u8, _>(connect_failure()) });
        let general = Lane::new("general")
            .delayed(Duration::from_secs(30))
            .attempt(|_| async { Ok(3) });
        let winner = race(vec![preferred, general]).await.unwrap();
        assert_eq!(winner.lane, "general");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_delayed_lane_never_runs_after_win() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let preferred = Lane::new("preferred").attempt(|_| async { Ok(1) });
        let general = Lane::new("general")
            .delayed(Duration::from_millis(200))
            .attempt(move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            });
        assert_eq!(race(vec![preferred, general]).await.unwrap().value, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_slot_completes_once() {
        let slot = RaceSlot::new(2);
        assert!(slot.try_complete("a", 1));
        assert!(!slot.try_complete("b", 2));
        assert!(slot.cancel.is_cancelled());
        let winner = slot.take().unwrap();
        assert_eq!((winner.lane.as_str(), winner.value), ("a", 1));
    }
}
