//! Deferred execution on a single timer thread.
//!
//! A `WakeupManager` keeps a sorted set of tickets, each naming a time and a
//! unit of work. One dedicated thread, the kicker, sleeps until the earliest
//! ticket is due and fires it, either inline or on a freshly spawned thread
//! described by the ticket's [`ThreadDesc`]. The kicker is started on demand
//! and exits after sitting idle for the configured queue-thread timeout.

use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use weft_core::error::{panic_message, ConcurrencyError, Result};
use weft_core::traits::Runnable;
use weft_core::utils::duration_ms;

/// Lowest thread priority a descriptor accepts
pub const MIN_PRIORITY: i32 = 1;

/// Default thread priority
pub const NORM_PRIORITY: i32 = 5;

/// Highest thread priority a descriptor accepts
pub const MAX_PRIORITY: i32 = 10;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(0);

/// How a fired ticket's work is run when it should not run on the kicker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadDesc {
    group: Option<String>,
    daemon: bool,
    priority: i32,
}

impl ThreadDesc {
    /// Describe a thread in `group` (used as the thread name prefix).
    ///
    /// Non-daemon threads are joined by [`WakeupManager::stop`]. The priority
    /// is advisory: it is validated and reported but the platform scheduler
    /// is not asked to honor it.
    pub fn new(group: Option<String>, daemon: bool, priority: i32) -> Result<Self> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(ConcurrencyError::InvalidPriority(priority).into());
        }
        Ok(Self {
            group,
            daemon,
            priority,
        })
    }

    /// Thread group, if any
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Whether the thread is left detached
    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Requested priority
    pub fn priority(&self) -> i32 {
        self.priority
    }

    fn thread_name(&self, seq: u64) -> String {
        format!("{}-ticket-{}", self.group.as_deref().unwrap_or("weft-wakeup"), seq)
    }
}

impl Default for ThreadDesc {
    fn default() -> Self {
        Self {
            group: None,
            daemon: true,
            priority: NORM_PRIORITY,
        }
    }
}

/// Handle to a scheduled, cancellable execution.
///
/// Tickets order by their time and then by the order in which they were
/// scheduled, so tickets for the same instant fire first-in first-out.
#[derive(Clone)]
pub struct Ticket {
    when: Instant,
    seq: u64,
    manager: u64,
    task: Arc<dyn Runnable>,
    desc: Option<ThreadDesc>,
}

impl Ticket {
    /// When the ticket is due
    pub fn when(&self) -> Instant {
        self.when
    }

    /// Scheduling sequence number, unique per manager
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Thread description, if the work does not run on the kicker
    pub fn desc(&self) -> Option<&ThreadDesc> {
        self.desc.as_ref()
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("when", &self.when)
            .field("seq", &self.seq)
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq && self.manager == other.manager
    }
}

impl Eq for Ticket {}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.when
            .cmp(&other.when)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.manager.cmp(&other.manager))
    }
}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Configuration for a wakeup manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeupConfig {
    /// Name of the kicker thread
    pub name: String,

    /// How long the kicker lingers with no tickets before exiting
    #[serde(with = "duration_ms")]
    pub queue_thread_timeout: Duration,
}

impl Default for WakeupConfig {
    fn default() -> Self {
        Self {
            name: "weft-wakeup".to_string(),
            queue_thread_timeout: Duration::from_secs(30),
        }
    }
}

/// Ticket set and kicker bookkeeping, guarded by the manager's lock
struct WakeupState {
    tickets: BTreeSet<Ticket>,
    next_seq: u64,
    dead: bool,
    kicker_running: bool,
    /// Non-daemon threads started for described tickets
    spawned: Vec<JoinHandle<()>>,
}

struct WakeupShared {
    state: Mutex<WakeupState>,
    /// Signals the kicker that the head of the set may have changed
    wake: Condvar,
    config: WakeupConfig,
    /// Distinguishes this manager's tickets from another manager's
    id: u64,
}

/// Timer queue with a lazily started kicker thread.
pub struct WakeupManager {
    shared: Arc<WakeupShared>,
}

impl WakeupManager {
    /// Create a new wakeup manager with the default configuration
    pub fn new() -> Self {
        Self::with_config(WakeupConfig::default())
    }

    /// Create a new wakeup manager with the specified configuration
    pub fn with_config(config: WakeupConfig) -> Self {
        info!(
            "Creating wakeup manager '{}' (queue thread timeout {:?})",
            config.name, config.queue_thread_timeout
        );
        Self {
            shared: Arc::new(WakeupShared {
                state: Mutex::new(WakeupState {
                    tickets: BTreeSet::new(),
                    next_seq: 0,
                    dead: false,
                    kicker_running: false,
                    spawned: Vec::new(),
                }),
                wake: Condvar::new(),
                config,
                id: NEXT_MANAGER_ID.fetch_add(1, AtomicOrdering::Relaxed),
            }),
        }
    }

    /// Run `task` on the kicker thread at `when`
    pub fn schedule<R>(&self, when: Instant, task: R) -> Result<Ticket>
    where
        R: Runnable + 'static,
    {
        self.schedule_ticket(when, Arc::new(task), None)
    }

    /// Run `task` on a new thread described by `desc` at `when`
    pub fn schedule_with<R>(&self, when: Instant, task: R, desc: ThreadDesc) -> Result<Ticket>
    where
        R: Runnable + 'static,
    {
        self.schedule_ticket(when, Arc::new(task), Some(desc))
    }

    /// Schedule already shared work
    pub fn schedule_ticket(
        &self,
        when: Instant,
        task: Arc<dyn Runnable>,
        desc: Option<ThreadDesc>,
    ) -> Result<Ticket> {
        let mut state = self.shared.state.lock();
        if state.dead {
            return Err(ConcurrencyError::Stopped.into());
        }

        let ticket = Ticket {
            when,
            seq: state.next_seq,
            manager: self.shared.id,
            task,
            desc,
        };
        state.next_seq += 1;
        state.tickets.insert(ticket.clone());
        trace!("Scheduled ticket {}", ticket.seq);

        if state.kicker_running {
            self.shared.wake.notify_one();
        } else {
            self.start_kicker(&mut state);
        }
        Ok(ticket)
    }

    /// Start the kicker; the caller holds the lock
    fn start_kicker(&self, state: &mut MutexGuard<'_, WakeupState>) {
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.config.name.clone())
            .spawn(move || Self::kicker_loop(shared));

        match spawned {
            Ok(_) => state.kicker_running = true,
            // the ticket stays queued; the next schedule call tries again
            Err(e) => error!(
                "Failed to start wakeup thread '{}': {}",
                self.shared.config.name, e
            ),
        }
    }

    /// Kicker thread main loop
    fn kicker_loop(shared: Arc<WakeupShared>) {
        debug!("Wakeup thread '{}': Starting", shared.config.name);

        let mut exit_time: Option<Instant> = None;
        let mut state = shared.state.lock();
        loop {
            if state.dead {
                break;
            }

            let now = Instant::now();
            let Some(head) = state.tickets.first() else {
                let deadline =
                    *exit_time.get_or_insert(now + shared.config.queue_thread_timeout);
                if now >= deadline {
                    break;
                }
                shared.wake.wait_for(&mut state, deadline - now);
                continue;
            };
            exit_time = None;

            if head.when > now {
                // never trust the wait: loop around and recompute
                let time_to_next_event = head.when - now;
                shared.wake.wait_for(&mut state, time_to_next_event);
                continue;
            }

            if let Some(ticket) = state.tickets.pop_first() {
                let handle = MutexGuard::unlocked(&mut state, || Self::fire(&shared, ticket));
                if let Some(handle) = handle {
                    state.spawned.retain(|h| !h.is_finished());
                    state.spawned.push(handle);
                }
            }
        }

        state.kicker_running = false;
        debug!("Wakeup thread '{}': Exiting", shared.config.name);
    }

    /// Run a due ticket. Returns the handle of a spawned non-daemon thread.
    fn fire(shared: &WakeupShared, ticket: Ticket) -> Option<JoinHandle<()>> {
        trace!("Firing ticket {}", ticket.seq);

        let Some(desc) = ticket.desc else {
            let task = ticket.task;
            if let Err(payload) =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run()))
            {
                warn!(
                    "Wakeup thread '{}': Ticket {} panicked: {}",
                    shared.config.name,
                    ticket.seq,
                    panic_message(payload.as_ref())
                );
            }
            return None;
        };

        let task = ticket.task;
        let seq = ticket.seq;
        trace!(
            "Ticket {} runs on its own thread (priority {})",
            seq,
            desc.priority
        );
        let spawned = thread::Builder::new()
            .name(desc.thread_name(seq))
            .spawn(move || {
                if let Err(payload) =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run()))
                {
                    warn!("Ticket {} panicked: {}", seq, panic_message(payload.as_ref()));
                }
            });

        match spawned {
            Ok(handle) if desc.daemon => {
                drop(handle);
                None
            }
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(
                    "Wakeup thread '{}': Failed to start thread for ticket {}: {}",
                    shared.config.name, seq, e
                );
                None
            }
        }
    }

    /// Cancel a ticket. Does nothing if it already fired or was cancelled.
    pub fn cancel(&self, ticket: &Ticket) {
        if ticket.manager != self.shared.id {
            debug!("Ignoring cancel of ticket {} from another manager", ticket.seq);
            return;
        }
        let mut state = self.shared.state.lock();
        if state.tickets.remove(ticket) {
            trace!("Cancelled ticket {}", ticket.seq);
            self.shared.wake.notify_one();
        }
    }

    /// Cancel every outstanding ticket
    pub fn cancel_all(&self) {
        let mut state = self.shared.state.lock();
        state.tickets.clear();
        self.shared.wake.notify_one();
    }

    /// Whether no tickets are outstanding
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().tickets.is_empty()
    }

    /// Number of outstanding tickets
    pub fn len(&self) -> usize {
        self.shared.state.lock().tickets.len()
    }

    /// Whether the kicker thread is alive
    pub fn is_kicker_running(&self) -> bool {
        self.shared.state.lock().kicker_running
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().dead
    }

    /// Discard all tickets and refuse further scheduling.
    ///
    /// Waits for non-daemon ticket threads that are still running.
    pub fn stop(&self) {
        let spawned = {
            let mut state = self.shared.state.lock();
            if state.dead {
                return;
            }
            info!("Stopping wakeup manager '{}'", self.shared.config.name);
            state.dead = true;
            state.tickets.clear();
            self.shared.wake.notify_all();
            std::mem::take(&mut state.spawned)
        };

        let current = thread::current().id();
        for handle in spawned {
            if handle.thread().id() != current {
                // panics inside the thread were already logged
                let _ = handle.join();
            }
        }
    }
}

impl Default for WakeupManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WakeupManager {
    fn drop(&mut self) {
        self.stop();
    }
}
