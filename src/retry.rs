//! Retry/backoff loop shared by prepare and step.
//!
//! Each native attempt is classified into an [`Attempt`]; [`RetryState::advance`] decides
//! whether to finish, loop immediately (schema change), sleep and loop (contention), or
//! fail. A state watching a [`CancelHandle`] gives up with [`Error::Cancelled`] as soon as a
//! new request arrives, before and after each backoff. Cancellation is settled afterwards by
//! [`settle_cancellation`], which lets a pending cancel override any result.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::RetryPolicy;
use crate::errors::{Error, Result};
use crate::handle::CancelHandle;
use crate::types::ResultCode;

/// Outcome of one native attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    /// The schema changed under the attempt; try again at once.
    RetrySchema,
    /// Busy/Locked; back off and try again while the time budget lasts.
    RetryLock(ResultCode),
    Fail(Error),
}

impl<T> Attempt<T> {
    /// Classify a failed native result code.
    pub fn from_failure(code: ResultCode, error: Error) -> Self {
        match code {
            ResultCode::Schema => Attempt::RetrySchema,
            code if code.is_contention() => Attempt::RetryLock(code),
            _ => Attempt::Fail(error),
        }
    }
}

/// What the caller should do after [`RetryState::advance`].
#[derive(Debug)]
pub enum Next<T> {
    Done(T),
    Again,
}

/// Sleeps between contention retries.
pub trait Backoff {
    fn pause(&mut self, duration: Duration);
}

/// Blocks the calling thread; not interruptible mid-sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl Backoff for ThreadSleep {
    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Per-call retry bookkeeping; never persisted across calls.
#[derive(Debug)]
pub struct RetryState {
    pub(crate) cancel_snapshot: u64,
    cancel: Option<CancelHandle>,
    schema_retries: u32,
    lock_retries: u32,
    started: Instant,
    budget: Duration,
}

impl RetryState {
    pub fn new(cancel_snapshot: u64, budget: Duration) -> Self {
        Self {
            cancel_snapshot,
            cancel: None,
            schema_retries: 0,
            lock_retries: 0,
            started: Instant::now(),
            budget,
        }
    }

    /// Stop retrying once `cancel` has been requested past the snapshot.
    pub fn watch(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancel_requested(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|cancel| cancel.requested() != self.cancel_snapshot)
    }

    pub fn schema_retries(&self) -> u32 {
        self.schema_retries
    }

    pub fn lock_retries(&self) -> u32 {
        self.lock_retries
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn advance<T>(
        &mut self,
        policy: &RetryPolicy,
        backoff: &mut dyn Backoff,
        attempt: Attempt<T>,
    ) -> Result<Next<T>> {
        match attempt {
            Attempt::Success(value) => Ok(Next::Done(value)),
            Attempt::Fail(error) => Err(error),
            Attempt::RetrySchema | Attempt::RetryLock(_) if self.cancel_requested() => {
                Err(Error::Cancelled)
            }
            Attempt::RetrySchema => {
                if self.schema_retries >= policy.max_schema_retries {
                    return Err(Error::SchemaChanged {
                        retries: self.schema_retries,
                    });
                }
                self.schema_retries += 1;
                trace!(retries = self.schema_retries, "schema changed, retrying");
                Ok(Next::Again)
            }
            Attempt::RetryLock(code) => {
                let elapsed = self.elapsed();
                if elapsed >= self.budget {
                    return Err(Error::Timeout { code, elapsed });
                }
                self.lock_retries += 1;
                let pause = policy.jitter();
                trace!(%code, retries = self.lock_retries, ?pause, "contention, backing off");
                backoff.pause(pause);
                if self.cancel_requested() {
                    return Err(Error::Cancelled);
                }
                Ok(Next::Again)
            }
        }
    }
}

/// Drive `attempt` until it succeeds or the policy gives up.
pub fn run<T>(
    policy: &RetryPolicy,
    state: &mut RetryState,
    backoff: &mut dyn Backoff,
    mut attempt: impl FnMut() -> Attempt<T>,
) -> Result<T> {
    loop {
        if let Next::Done(value) = state.advance(policy, backoff, attempt())? {
            return Ok(value);
        }
    }
}

/// Apply cancellation precedence to the outcome of a call.
///
/// With a cancel pending, success and failure alike become [`Error::Cancelled`]; the value,
/// if any, is dropped so RAII handles release their native resources.
pub fn settle_cancellation<T>(cancel_pending: bool, outcome: Result<T>) -> Result<T> {
    if cancel_pending {
        drop(outcome);
        Err(Error::Cancelled)
    } else {
        outcome
    }
}

/// The code a caller observes for a native result when a cancel may be pending.
pub fn effective_code(code: ResultCode, cancel_pending: bool) -> ResultCode {
    if cancel_pending && (code.is_success() || code == ResultCode::Interrupt) {
        ResultCode::Interrupt
    } else {
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Recorder(Vec<Duration>);

    impl Backoff for Recorder {
        fn pause(&mut self, duration: Duration) {
            self.0.push(duration);
        }
    }

    fn scripted(codes: &[ResultCode]) -> impl FnMut() -> Attempt<u32> {
        let mut queue: VecDeque<ResultCode> = codes.iter().copied().collect();
        let mut attempts = 0;
        move || {
            attempts += 1;
            match queue.pop_front().unwrap_or(ResultCode::Ok) {
                ResultCode::Ok => Attempt::Success(attempts),
                code => Attempt::from_failure(code, Error::from_code(code.as_raw(), "scripted")),
            }
        }
    }

    fn policy(max_schema_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_schema_retries,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_schema_changes_within_limit_succeed() {
        for n in 0..=3 {
            let codes = vec![ResultCode::Schema; n];
            let mut state = RetryState::new(0, Duration::from_secs(1));
            let mut backoff = Recorder::default();
            let attempts = run(&policy(3), &mut state, &mut backoff, scripted(&codes)).unwrap();
            assert_eq!(attempts as usize, n + 1);
            assert_eq!(state.schema_retries() as usize, n);
            assert!(backoff.0.is_empty(), "schema retries never sleep");
        }
    }

    #[test]
    fn test_schema_changes_beyond_limit_fail() {
        let codes = vec![ResultCode::Schema; 4];
        let mut state = RetryState::new(0, Duration::from_secs(1));
        let err = run(&policy(3), &mut state, &mut ThreadSleep, scripted(&codes)).unwrap_err();
        assert!(matches!(err, Error::SchemaChanged { retries: 3 }));
    }

    #[test]
    fn test_contention_backs_off_with_jitter() {
        let codes = [ResultCode::Busy, ResultCode::Locked, ResultCode::Busy];
        let mut state = RetryState::new(0, Duration::from_secs(60));
        let mut backoff = Recorder::default();
        let attempts = run(&policy(3), &mut state, &mut backoff, scripted(&codes)).unwrap();
        assert_eq!(attempts, 4);
        assert_eq!(state.lock_retries(), 3);
        assert_eq!(backoff.0.len(), 3);
        for pause in &backoff.0 {
            assert!(*pause >= Duration::from_millis(1) && *pause <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_contention_with_zero_budget_times_out_without_sleeping() {
        let mut state = RetryState::new(0, Duration::ZERO);
        let mut backoff = Recorder::default();
        let err = run(&policy(3), &mut state, &mut backoff, scripted(&[ResultCode::Locked]))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { code: ResultCode::Locked, .. }));
        assert!(backoff.0.is_empty());
    }

    struct CancelOnPause(CancelHandle);

    impl Backoff for CancelOnPause {
        fn pause(&mut self, _duration: Duration) {
            self.0.cancel();
        }
    }

    #[test]
    fn test_cancel_during_backoff_stops_retrying() {
        let cancel = CancelHandle::new();
        let mut state = RetryState::new(cancel.requested(), Duration::from_secs(60))
            .watch(cancel.clone());
        let mut backoff = CancelOnPause(cancel);
        let codes = [ResultCode::Busy, ResultCode::Busy, ResultCode::Busy];
        let err = run(&policy(3), &mut state, &mut backoff, scripted(&codes)).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(state.lock_retries(), 1);
    }

    #[test]
    fn test_pending_cancel_skips_schema_retry() {
        let cancel = CancelHandle::new();
        let mut state = RetryState::new(cancel.requested(), Duration::from_secs(1))
            .watch(cancel.clone());
        cancel.cancel();
        let mut backoff = Recorder::default();
        let err = run(&policy(3), &mut state, &mut backoff, scripted(&[ResultCode::Schema]))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(state.schema_retries(), 0);
        assert!(backoff.0.is_empty());
    }

    #[test]
    fn test_unwatched_state_ignores_cancel_counter() {
        let mut state = RetryState::new(7, Duration::from_secs(60));
        let mut backoff = Recorder::default();
        let attempts = run(&policy(3), &mut state, &mut backoff, scripted(&[ResultCode::Busy]))
            .unwrap();
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_other_failures_are_terminal() {
        let mut state = RetryState::new(0, Duration::from_secs(1));
        let err = run(
            &policy(3),
            &mut state,
            &mut ThreadSleep,
            scripted(&[ResultCode::Constraint, ResultCode::Schema]),
        )
        .unwrap_err();
        assert_eq!(err.code(), ResultCode::Constraint);
        assert_eq!(state.schema_retries(), 0);
    }

    #[test]
    fn test_cancellation_wins_over_every_outcome() {
        assert!(matches!(settle_cancellation(true, Ok(1)), Err(Error::Cancelled)));
        let busy: Result<u32> = Err(Error::from_code(5, "database is locked"));
        assert!(matches!(settle_cancellation(true, busy), Err(Error::Cancelled)));
        assert_eq!(settle_cancellation(false, Ok(1)).unwrap(), 1);

        for code in [ResultCode::Ok, ResultCode::Row, ResultCode::Done] {
            assert_eq!(effective_code(code, true), ResultCode::Interrupt);
            assert_eq!(effective_code(code, false), code);
        }
        assert_eq!(effective_code(ResultCode::Constraint, true), ResultCode::Constraint);
    }
}
