//! Retry with backoff on top of a task manager and a wakeup manager.
//!
//! A [`RetryTask`] wraps a [`RetryPolicy`]. Each run makes one attempt; when
//! the attempt fails the task asks the wakeup manager to put it back on the
//! task manager at `retry_time(attempt)`.

use super::task_manager::TaskManager;
use super::wakeup::{Ticket, WakeupManager};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::borrow::Cow;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use weft_core::error::{ConcurrencyError, Result};
use weft_core::traits::{Task, TaskRef};

/// Delay before the retry following each failed attempt; the last entry
/// repeats.
const BACKOFF: [Duration; 6] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(60),
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
];

/// Delay after failed attempt number `attempt` (zero-based).
///
/// ```
/// use std::time::Duration;
/// use weft_concurrency::scheduler::retry::default_backoff;
///
/// assert_eq!(default_backoff(0), Duration::from_secs(1));
/// assert_eq!(default_backoff(5), Duration::from_secs(300));
/// assert_eq!(default_backoff(42), Duration::from_secs(300));
/// ```
pub fn default_backoff(attempt: u32) -> Duration {
    let index = (attempt as usize).min(BACKOFF.len() - 1);
    BACKOFF[index]
}

/// The operation retried by a [`RetryTask`]
pub trait RetryPolicy: Send + Sync + 'static {
    /// Make one attempt
    fn try_once(&self) -> Result<()>;

    /// When to retry after failed attempt number `attempt`
    fn retry_time(&self, attempt: u32) -> Instant {
        Instant::now() + default_backoff(attempt)
    }

    /// Ordering constraint forwarded to the task manager
    fn run_after(&self, _preceding: &[TaskRef]) -> bool {
        false
    }

    /// Name used in log messages
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }
}

struct RetryState {
    attempt: u32,
    start_time: Instant,
    cancelled: bool,
    complete: bool,
    /// `try_once` is executing
    running: bool,
    /// submitted and neither finished nor cancelled
    in_flight: bool,
    /// Pending retry
    ticket: Option<Ticket>,
    /// Bumped whenever a scheduled retry becomes stale
    epoch: u64,
}

/// Task that retries its policy until it succeeds or is cancelled.
pub struct RetryTask<P> {
    policy: P,
    manager: Arc<TaskManager>,
    wakeup: Arc<WakeupManager>,
    state: Mutex<RetryState>,
    /// Signalled on completion and cancellation
    done: Condvar,
    this: Weak<Self>,
}

impl<P: RetryPolicy> RetryTask<P> {
    /// Create a retry task running on `manager` and rescheduled through
    /// `wakeup`
    pub fn new(policy: P, manager: Arc<TaskManager>, wakeup: Arc<WakeupManager>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            policy,
            manager,
            wakeup,
            state: Mutex::new(RetryState {
                attempt: 0,
                start_time: Instant::now(),
                cancelled: false,
                complete: false,
                running: false,
                in_flight: false,
                ticket: None,
                epoch: 0,
            }),
            done: Condvar::new(),
            this: this.clone(),
        })
    }

    /// The wrapped policy
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Add this task to its task manager.
    ///
    /// Fails with `InFlight` while an earlier submission has neither
    /// finished nor been cancelled, or while an attempt is still executing,
    /// and with `Cancelled` after `cancel` until the task is reset.
    pub fn submit(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.in_flight || state.running {
                return Err(ConcurrencyError::InFlight.into());
            }
            if state.cancelled {
                return Err(ConcurrencyError::Cancelled.into());
            }
            state.complete = false;
            state.in_flight = true;
        }

        let task: TaskRef = Arc::clone(self) as TaskRef;
        if let Err(e) = self.manager.add(task) {
            self.state.lock().in_flight = false;
            return Err(e);
        }
        trace!("Submitted retry task '{}'", self.policy.name());
        Ok(())
    }

    fn attempt_once(&self) {
        {
            let mut state = self.state.lock();
            // cancelled or reset after this run was queued
            if state.cancelled || !state.in_flight {
                state.in_flight = false;
                return;
            }
            state.running = true;
        }

        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.policy.try_once()));

        let mut state = self.state.lock();
        state.running = false;
        let err = match outcome {
            Ok(Ok(())) => {
                debug!(
                    "Retry task '{}' succeeded after {} failed attempts",
                    self.policy.name(),
                    state.attempt
                );
                state.complete = true;
                state.in_flight = false;
                self.done.notify_all();
                return;
            }
            Ok(Err(err)) => err,
            Err(payload) => {
                // a panicking policy is not retried; the task manager
                // reports the panic
                state.cancelled = true;
                state.in_flight = false;
                state.epoch += 1;
                self.done.notify_all();
                drop(state);
                std::panic::resume_unwind(payload);
            }
        };
        if state.cancelled {
            return;
        }

        let attempt = state.attempt;
        state.attempt += 1;
        state.epoch += 1;
        let epoch = state.epoch;
        drop(state);

        let when = self.policy.retry_time(attempt);
        debug!(
            "Retry task '{}' attempt {} failed: {}; retrying in {:?}",
            self.policy.name(),
            attempt,
            err,
            when.saturating_duration_since(Instant::now())
        );

        let this = self.this.clone();
        let scheduled = self.wakeup.schedule(when, move || {
            if let Some(task) = this.upgrade() {
                task.resubmit(epoch);
            }
        });

        match scheduled {
            Ok(ticket) => {
                let mut state = self.state.lock();
                if state.epoch == epoch && !state.cancelled {
                    state.ticket = Some(ticket);
                } else {
                    drop(state);
                    self.wakeup.cancel(&ticket);
                }
            }
            Err(e) => {
                warn!(
                    "Retry task '{}' cannot schedule a retry: {}",
                    self.policy.name(),
                    e
                );
                self.give_up();
            }
        }
    }

    /// Called from the wakeup manager when a retry is due
    fn resubmit(self: Arc<Self>, epoch: u64) {
        {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.cancelled {
                return;
            }
            state.epoch += 1;
            state.ticket = None;
        }

        let name = self.policy.name().into_owned();
        let manager = Arc::clone(&self.manager);
        if let Err(e) = manager.add(self.clone() as TaskRef) {
            warn!("Retry task '{}' cannot be resubmitted: {}", name, e);
            self.give_up();
        }
    }

    fn give_up(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.in_flight = false;
        self.done.notify_all();
    }

    /// Stop retrying. Safe to call any number of times.
    pub fn cancel(&self) {
        let ticket = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.in_flight = false;
            state.epoch += 1;
            self.done.notify_all();
            state.ticket.take()
        };

        if let Some(ticket) = ticket {
            self.wakeup.cancel(&ticket);
        }
        if let Some(this) = self.this.upgrade() {
            self.manager.remove_if_pending(&(this as TaskRef));
        }
        debug!("Cancelled retry task '{}'", self.policy.name());
    }

    /// Return to the initial state so the task can be submitted again.
    ///
    /// Fails with `InFlight` while an attempt is executing.
    pub fn reset(&self) -> Result<()> {
        let ticket = {
            let mut state = self.state.lock();
            if state.running {
                return Err(ConcurrencyError::InFlight.into());
            }
            state.attempt = 0;
            state.start_time = Instant::now();
            state.cancelled = false;
            state.complete = false;
            state.in_flight = false;
            state.epoch += 1;
            state.ticket.take()
        };

        if let Some(ticket) = ticket {
            self.wakeup.cancel(&ticket);
        }
        if let Some(this) = self.this.upgrade() {
            self.manager.remove_if_pending(&(this as TaskRef));
        }
        Ok(())
    }

    /// Block until the task completes (`true`) or is cancelled (`false`).
    ///
    /// A task whose policy panicked, or that could not schedule a retry,
    /// counts as cancelled.
    pub fn wait_for(&self) -> bool {
        let mut state = self.state.lock();
        while !state.complete && !state.cancelled {
            self.done.wait(&mut state);
        }
        state.complete
    }

    /// Like [`wait_for`](Self::wait_for), giving up after `timeout`
    pub fn wait_for_timeout(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.complete && !state.cancelled {
            if self.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        (state.complete || state.cancelled).then_some(state.complete)
    }

    /// Number of failed attempts so far
    pub fn attempt(&self) -> u32 {
        self.state.lock().attempt
    }

    /// When the task was created or last reset
    pub fn start_time(&self) -> Instant {
        self.state.lock().start_time
    }

    /// Whether an attempt has succeeded
    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// Whether the task was cancelled or gave up
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Whether a submission is outstanding
    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Whether an attempt is executing
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

impl<P: RetryPolicy> Task for RetryTask<P> {
    fn run(&self) {
        self.attempt_once();
    }

    fn run_after(&self, preceding: &[TaskRef]) -> bool {
        self.policy.run_after(preceding)
    }

    fn name(&self) -> Cow<'_, str> {
        self.policy.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task_manager::TaskManagerConfig;
    use crossbeam_channel::{bounded, Receiver};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use weft_core::Error;

    /// Fails a fixed number of times, backing off by the default schedule
    /// scaled from seconds to milliseconds
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        requested: Mutex<Vec<u32>>,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    impl RetryPolicy for Flaky {
        fn try_once(&self) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Error::Runtime(format!("failure {}", call)))
            } else {
                Ok(())
            }
        }

        fn retry_time(&self, attempt: u32) -> Instant {
            self.requested.lock().push(attempt);
            let scaled = default_backoff(attempt).as_secs();
            Instant::now() + Duration::from_millis(scaled)
        }
    }

    /// Never succeeds and retries far in the future
    struct Hopeless;

    impl RetryPolicy for Hopeless {
        fn try_once(&self) -> Result<()> {
            Err(Error::Runtime("unavailable".to_string()))
        }

        fn retry_time(&self, _attempt: u32) -> Instant {
            Instant::now() + Duration::from_secs(60)
        }
    }

    /// Blocks each attempt until released
    struct Gated {
        gate: Receiver<()>,
    }

    impl RetryPolicy for Gated {
        fn try_once(&self) -> Result<()> {
            let _ = self.gate.recv();
            Ok(())
        }
    }

    fn managers() -> (Arc<TaskManager>, Arc<WakeupManager>) {
        let manager = TaskManager::with_config(TaskManagerConfig {
            name: "test-retry".to_string(),
            max_threads: 2,
            ..TaskManagerConfig::default()
        });
        (Arc::new(manager), Arc::new(WakeupManager::new()))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let mut offset = Duration::ZERO;
        let offsets: Vec<u64> = (0..7)
            .map(|attempt| {
                offset += default_backoff(attempt);
                offset.as_secs()
            })
            .collect();
        assert_eq!(offsets, [1, 6, 16, 76, 136, 436, 736]);
        assert_eq!(default_backoff(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_retries_until_success() {
        let (manager, wakeup) = managers();
        let task = RetryTask::new(Flaky::new(3), manager, wakeup);
        let started = Instant::now();

        task.submit().unwrap();
        assert_eq!(task.wait_for_timeout(Duration::from_secs(5)), Some(true));

        assert!(task.is_complete());
        assert!(!task.is_cancelled());
        assert!(!task.is_in_flight());
        assert_eq!(task.attempt(), 3);
        assert_eq!(task.policy().calls.load(Ordering::SeqCst), 4);
        assert_eq!(*task.policy().requested.lock(), [0, 1, 2]);
        // 1 + 5 + 10 scaled milliseconds of backoff
        assert!(started.elapsed() >= Duration::from_millis(16));
    }

    #[test]
    fn test_cancel_while_waiting_for_retry() {
        let (manager, wakeup) = managers();
        let task = RetryTask::new(Hopeless, Arc::clone(&manager), Arc::clone(&wakeup));

        task.submit().unwrap();
        wait_until(|| wakeup.len() == 1 && manager.active_count() == 0);
        assert_eq!(task.attempt(), 1);
        assert!(matches!(
            task.submit(),
            Err(Error::Concurrency(ConcurrencyError::InFlight))
        ));

        task.cancel();
        assert!(wakeup.is_empty());
        assert!(task.is_cancelled());
        assert!(!task.wait_for());

        task.cancel();
        assert!(task.is_cancelled());
        assert_eq!(task.wait_for_timeout(Duration::from_millis(10)), Some(false));
    }

    #[test]
    fn test_reset_allows_resubmission() {
        let (manager, wakeup) = managers();
        let task = RetryTask::new(Hopeless, Arc::clone(&manager), Arc::clone(&wakeup));
        let created = task.start_time();

        task.submit().unwrap();
        wait_until(|| wakeup.len() == 1 && manager.active_count() == 0);

        task.reset().unwrap();
        assert!(wakeup.is_empty());
        assert_eq!(task.attempt(), 0);
        assert!(!task.is_cancelled());
        assert!(!task.is_complete());
        assert!(task.start_time() >= created);

        task.submit().unwrap();
        wait_until(|| task.attempt() == 1);
        task.cancel();
    }

    #[test]
    fn test_in_flight_while_running() {
        let (manager, wakeup) = managers();
        let (release, gate) = bounded(0);
        let task = RetryTask::new(Gated { gate }, manager, wakeup);

        task.submit().unwrap();
        wait_until(|| task.is_running());

        assert!(matches!(
            task.submit(),
            Err(Error::Concurrency(ConcurrencyError::InFlight))
        ));
        assert!(matches!(
            task.reset(),
            Err(Error::Concurrency(ConcurrencyError::InFlight))
        ));

        release.send(()).unwrap();
        assert!(task.wait_for());

        // finished tasks may be submitted again
        task.submit().unwrap();
        release.send(()).unwrap();
        wait_until(|| !task.is_in_flight());
    }

    #[test]
    fn test_wait_for_timeout_expires() {
        let (manager, wakeup) = managers();
        let task = RetryTask::new(Hopeless, manager, wakeup);

        task.submit().unwrap();
        assert_eq!(task.wait_for_timeout(Duration::from_millis(20)), None);
        task.cancel();
    }

    #[test]
    fn test_gives_up_when_wakeup_manager_stopped() {
        let (manager, wakeup) = managers();
        wakeup.stop();
        let task = RetryTask::new(Hopeless, manager, wakeup);

        task.submit().unwrap();
        assert_eq!(task.wait_for_timeout(Duration::from_secs(5)), Some(false));
        assert!(task.is_cancelled());
    }

    #[test]
    fn test_submit_to_terminated_manager() {
        let (manager, wakeup) = managers();
        manager.terminate();
        let task = RetryTask::new(Flaky::new(0), manager, wakeup);

        assert!(matches!(
            task.submit(),
            Err(Error::Concurrency(ConcurrencyError::Terminated))
        ));
        assert!(!task.is_in_flight());
    }

    #[test]
    fn test_submit_after_cancel_requires_reset() {
        let (manager, wakeup) = managers();
        let task = RetryTask::new(Hopeless, Arc::clone(&manager), Arc::clone(&wakeup));

        task.submit().unwrap();
        wait_until(|| wakeup.len() == 1 && manager.active_count() == 0);
        task.cancel();

        assert!(matches!(
            task.submit(),
            Err(Error::Concurrency(ConcurrencyError::Cancelled))
        ));
        assert!(!task.is_in_flight());
        assert!(manager.pending().is_empty());

        task.reset().unwrap();
        task.submit().unwrap();
        wait_until(|| task.attempt() == 1 && manager.active_count() == 0);
        assert!(task.is_in_flight());
        task.cancel();
        assert!(!task.is_in_flight());
    }

    #[test]
    fn test_cancel_during_attempt_blocks_resubmission() {
        let (manager, wakeup) = managers();
        let (release, gate) = bounded(0);
        let task = RetryTask::new(Gated { gate }, manager, wakeup);

        task.submit().unwrap();
        wait_until(|| task.is_running());
        task.cancel();
        assert!(!task.is_in_flight());

        // the attempt is still executing
        assert!(matches!(
            task.submit(),
            Err(Error::Concurrency(ConcurrencyError::InFlight))
        ));

        release.send(()).unwrap();
        wait_until(|| !task.is_running());
        assert!(matches!(
            task.submit(),
            Err(Error::Concurrency(ConcurrencyError::Cancelled))
        ));
        assert!(!task.is_in_flight());
    }

    #[test]
    fn test_panicking_policy_wakes_waiters() {
        struct Broken;

        impl RetryPolicy for Broken {
            fn try_once(&self) -> Result<()> {
                panic!("policy bug")
            }
        }

        let (manager, wakeup) = managers();
        let task = RetryTask::new(Broken, manager, Arc::clone(&wakeup));

        task.submit().unwrap();
        assert_eq!(task.wait_for_timeout(Duration::from_secs(5)), Some(false));
        assert!(task.is_cancelled());
        assert!(!task.is_in_flight());
        assert!(wakeup.is_empty());
    }
}
