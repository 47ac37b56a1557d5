//! Reader/writer locks with writer preference.
//!
//! `ReadersWriter` admits many concurrent readers or one writer. A new reader
//! is refused while any writer is active or waiting, so a steady stream of
//! readers cannot starve writers. `ReadersPriorityWriter` adds a third class,
//! the priority writer, which is never held back by waiting regular writers
//! and is serviced ahead of them.
//!
//! These locks guard no data of their own; they order access to state kept
//! elsewhere. Acquiring the same kind of lock twice from one thread
//! deadlocks and is not detected.

use log::trace;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Counters shared by both lock flavors.
#[derive(Debug, Default)]
struct RwState {
    /// Number of readers holding the lock
    active_readers: usize,

    /// Whether a writer (of either class) holds the lock
    active_writer: bool,

    /// Number of regular writers blocked in `write_lock`
    waiting_writers: usize,

    /// Number of priority writers blocked in `priority_write_lock`
    waiting_priority_writers: usize,
}

impl RwState {
    fn reader_blocked(&self) -> bool {
        self.active_writer || self.waiting_writers > 0 || self.waiting_priority_writers > 0
    }

    fn writer_blocked(&self) -> bool {
        self.active_writer || self.active_readers > 0 || self.waiting_priority_writers > 0
    }

    fn priority_writer_blocked(&self) -> bool {
        self.active_writer || self.active_readers > 0
    }
}

/// Lock state plus the condition variable all waiters park on.
#[derive(Debug, Default)]
struct RwCore {
    state: Mutex<RwState>,
    changed: Condvar,
}

impl RwCore {
    fn read_lock(&self) {
        let mut state = self.state.lock();
        while state.reader_blocked() {
            self.changed.wait(&mut state);
        }
        state.active_readers += 1;
        trace!("Read lock acquired ({} readers)", state.active_readers);
    }

    fn read_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.active_readers > 0, "read_unlock without read_lock");
        state.active_readers = state.active_readers.saturating_sub(1);
        if state.active_readers == 0 {
            self.changed.notify_all();
        }
    }

    fn write_lock(&self) {
        let mut state = self.state.lock();
        while state.writer_blocked() {
            state.waiting_writers += 1;
            self.changed.wait(&mut state);
            state.waiting_writers -= 1;
        }
        state.active_writer = true;
        trace!("Write lock acquired");
    }

    fn priority_write_lock(&self) {
        let mut state = self.state.lock();
        while state.priority_writer_blocked() {
            state.waiting_priority_writers += 1;
            self.changed.wait(&mut state);
            state.waiting_priority_writers -= 1;
        }
        state.active_writer = true;
        trace!("Priority write lock acquired");
    }

    fn write_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.active_writer, "write_unlock without write_lock");
        state.active_writer = false;
        self.changed.notify_all();
    }

    /// Release via `release`, park on `notifier`, then reacquire via `acquire`.
    ///
    /// The notifier's mutex is taken before the release so a notification
    /// sent after the release cannot be missed.
    fn wait_on(
        &self,
        notifier: &Notifier,
        timeout: Option<Duration>,
        release: fn(&Self),
        acquire: fn(&Self),
    ) {
        {
            let mut generation = notifier.generation.lock();
            release(self);
            match timeout {
                Some(timeout) => {
                    notifier.cond.wait_for(&mut generation, timeout);
                }
                None => notifier.cond.wait(&mut generation),
            }
        }
        acquire(self);
    }
}

/// Condition a lock holder can wait on with `reader_wait` / `writer_wait`.
///
/// Wakeups may be spurious; waiters recheck their own condition.
#[derive(Debug, Default)]
pub struct Notifier {
    /// Bumped on every notification
    generation: Mutex<u64>,

    /// Threads parked in `reader_wait` / `writer_wait`
    cond: Condvar,
}

impl Notifier {
    /// Create a new notifier
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every thread waiting on this notifier
    pub fn notify_all(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Wake one thread waiting on this notifier
    pub fn notify_one(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_one();
    }
}

/// Readers/writer lock with writer preference.
#[derive(Debug, Default)]
pub struct ReadersWriter {
    core: RwCore,
}

impl ReadersWriter {
    /// Create a new, idle lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a read lock, blocking while a writer is active or waiting
    pub fn read_lock(&self) {
        self.core.read_lock();
    }

    /// Release a read lock
    pub fn read_unlock(&self) {
        self.core.read_unlock();
    }

    /// Acquire the write lock, blocking while readers or a writer are active
    pub fn write_lock(&self) {
        self.core.write_lock();
    }

    /// Release the write lock
    pub fn write_unlock(&self) {
        self.core.write_unlock();
    }

    /// Acquire a read lock released when the guard is dropped
    pub fn read(&self) -> ReadGuard<'_> {
        self.core.read_lock();
        ReadGuard { core: &self.core }
    }

    /// Acquire the write lock released when the guard is dropped
    pub fn write(&self) -> WriteGuard<'_> {
        self.core.write_lock();
        WriteGuard {
            core: &self.core,
            priority: false,
        }
    }

    /// Release a held read lock, wait on `notifier` for up to `timeout`
    /// (forever if `None`), then reacquire a read lock.
    pub fn reader_wait(&self, notifier: &Notifier, timeout: Option<Duration>) {
        self.core
            .wait_on(notifier, timeout, RwCore::read_unlock, RwCore::read_lock);
    }

    /// Release the held write lock, wait on `notifier` for up to `timeout`
    /// (forever if `None`), then reacquire the write lock.
    pub fn writer_wait(&self, notifier: &Notifier, timeout: Option<Duration>) {
        self.core
            .wait_on(notifier, timeout, RwCore::write_unlock, RwCore::write_lock);
    }

    /// Number of readers holding the lock
    pub fn active_readers(&self) -> usize {
        self.core.state.lock().active_readers
    }

    /// Whether a writer holds the lock
    pub fn is_writing(&self) -> bool {
        self.core.state.lock().active_writer
    }

    /// Number of writers blocked waiting for the lock
    pub fn waiting_writers(&self) -> usize {
        self.core.state.lock().waiting_writers
    }
}

/// Readers/writer lock with an additional priority-writer class.
///
/// Priority writers are serviced before regular writers, which are serviced
/// before new readers.
#[derive(Debug, Default)]
pub struct ReadersPriorityWriter {
    core: RwCore,
}

impl ReadersPriorityWriter {
    /// Create a new, idle lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a read lock, blocking while any writer is active or waiting
    pub fn read_lock(&self) {
        self.core.read_lock();
    }

    /// Release a read lock
    pub fn read_unlock(&self) {
        self.core.read_unlock();
    }

    /// Acquire the write lock as a regular writer; also yields to waiting
    /// priority writers
    pub fn write_lock(&self) {
        self.core.write_lock();
    }

    /// Acquire the write lock as a priority writer, ignoring waiting regular
    /// writers
    pub fn priority_write_lock(&self) {
        self.core.priority_write_lock();
    }

    /// Release the write lock, whichever class acquired it
    pub fn write_unlock(&self) {
        self.core.write_unlock();
    }

    /// Release the priority write lock
    pub fn priority_write_unlock(&self) {
        self.core.write_unlock();
    }

    /// Acquire a read lock released when the guard is dropped
    pub fn read(&self) -> ReadGuard<'_> {
        self.core.read_lock();
        ReadGuard { core: &self.core }
    }

    /// Acquire the write lock released when the guard is dropped
    pub fn write(&self) -> WriteGuard<'_> {
        self.core.write_lock();
        WriteGuard {
            core: &self.core,
            priority: false,
        }
    }

    /// Acquire the write lock as a priority writer, released when the guard
    /// is dropped
    pub fn priority_write(&self) -> WriteGuard<'_> {
        self.core.priority_write_lock();
        WriteGuard {
            core: &self.core,
            priority: true,
        }
    }

    /// See [`ReadersWriter::reader_wait`]
    pub fn reader_wait(&self, notifier: &Notifier, timeout: Option<Duration>) {
        self.core
            .wait_on(notifier, timeout, RwCore::read_unlock, RwCore::read_lock);
    }

    /// See [`ReadersWriter::writer_wait`]; reacquires as a regular writer
    pub fn writer_wait(&self, notifier: &Notifier, timeout: Option<Duration>) {
        self.core
            .wait_on(notifier, timeout, RwCore::write_unlock, RwCore::write_lock);
    }

    /// Like `writer_wait`, but reacquires as a priority writer
    pub fn priority_writer_wait(&self, notifier: &Notifier, timeout: Option<Duration>) {
        self.core.wait_on(
            notifier,
            timeout,
            RwCore::write_unlock,
            RwCore::priority_write_lock,
        );
    }

    /// Number of readers holding the lock
    pub fn active_readers(&self) -> usize {
        self.core.state.lock().active_readers
    }

    /// Whether a writer holds the lock
    pub fn is_writing(&self) -> bool {
        self.core.state.lock().active_writer
    }

    /// Number of regular writers blocked waiting for the lock
    pub fn waiting_writers(&self) -> usize {
        self.core.state.lock().waiting_writers
    }

    /// Number of priority writers blocked waiting for the lock
    pub fn waiting_priority_writers(&self) -> usize {
        self.core.state.lock().waiting_priority_writers
    }
}

/// A held read lock
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    core: &'a RwCore,
}

impl ReadGuard<'_> {
    /// Release the read lock, wait on `notifier`, then reacquire it
    pub fn wait(&mut self, notifier: &Notifier, timeout: Option<Duration>) {
        self.core
            .wait_on(notifier, timeout, RwCore::read_unlock, RwCore::read_lock);
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.core.read_unlock();
    }
}

/// A held write lock
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    core: &'a RwCore,
    priority: bool,
}

impl WriteGuard<'_> {
    /// Release the write lock, wait on `notifier`, then reacquire it with the
    /// same writer class
    pub fn wait(&mut self, notifier: &Notifier, timeout: Option<Duration>) {
        let acquire = if self.priority {
            RwCore::priority_write_lock
        } else {
            RwCore::write_lock
        };
        self.core
            .wait_on(notifier, timeout, RwCore::write_unlock, acquire);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.core.write_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_multiple_readers() {
        let lock = Arc::new(ReadersWriter::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(thread::spawn(move || {
                let _guard = lock.read();
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) > 1);
        assert_eq!(lock.active_readers(), 0);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Arc::new(ReadersWriter::new());
        let writing = Arc::new(AtomicBool::new(false));

        lock.write_lock();
        writing.store(true, Ordering::SeqCst);

        let reader = {
            let lock = Arc::clone(&lock);
            let writing = Arc::clone(&writing);
            thread::spawn(move || {
                let _guard = lock.read();
                assert!(!writing.load(Ordering::SeqCst));
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(lock.active_readers(), 0);

        writing.store(false, Ordering::SeqCst);
        lock.write_unlock();
        reader.join().unwrap();
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let lock = Arc::new(ReadersWriter::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // one active reader
        lock.read_lock();

        let writer = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _guard = lock.write();
                order.lock().push("writer");
                thread::sleep(Duration::from_millis(20));
            })
        };
        wait_until(|| lock.waiting_writers() == 1);

        let reader = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _guard = lock.read();
                order.lock().push("reader");
            })
        };

        // the second reader must not slip past the waiting writer
        thread::sleep(Duration::from_millis(50));
        assert_eq!(lock.active_readers(), 1);
        assert!(order.lock().is_empty());

        lock.read_unlock();
        writer.join().unwrap();
        reader.join().unwrap();

        assert_eq!(*order.lock(), vec!["writer", "reader"]);
    }

    #[test]
    fn test_priority_writer_goes_first() {
        let lock = Arc::new(ReadersPriorityWriter::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        lock.read_lock();

        let writer = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _guard = lock.write();
                order.lock().push("writer");
            })
        };
        wait_until(|| lock.waiting_writers() == 1);

        let priority = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _guard = lock.priority_write();
                order.lock().push("priority");
                thread::sleep(Duration::from_millis(20));
            })
        };
        wait_until(|| lock.waiting_priority_writers() == 1);

        let reader = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _guard = lock.read();
                order.lock().push("reader");
            })
        };
        thread::sleep(Duration::from_millis(20));

        lock.read_unlock();
        writer.join().unwrap();
        priority.join().unwrap();
        reader.join().unwrap();

        assert_eq!(*order.lock(), vec!["priority", "writer", "reader"]);
    }

    #[test]
    fn test_reader_wait_releases_lock() {
        let lock = Arc::new(ReadersWriter::new());
        let notifier = Arc::new(Notifier::new());
        let value = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let lock = Arc::clone(&lock);
            let notifier = Arc::clone(&notifier);
            let value = Arc::clone(&value);
            thread::spawn(move || {
                let mut guard = lock.read();
                while value.load(Ordering::SeqCst) == 0 {
                    guard.wait(&notifier, Some(Duration::from_millis(500)));
                }
                value.load(Ordering::SeqCst)
            })
        };

        wait_until(|| lock.active_readers() == 1);

        // the writer can only get in if the waiting reader released its lock
        {
            let _guard = lock.write();
            value.store(7, Ordering::SeqCst);
            notifier.notify_all();
        }

        assert_eq!(waiter.join().unwrap(), 7);
        assert_eq!(lock.active_readers(), 0);
    }

    #[test]
    fn test_writer_wait_times_out_and_reacquires() {
        let lock = ReadersWriter::new();
        let notifier = Notifier::new();

        lock.write_lock();
        let start = Instant::now();
        lock.writer_wait(&notifier, Some(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert!(lock.is_writing());
        lock.write_unlock();
        assert!(!lock.is_writing());
    }
}
