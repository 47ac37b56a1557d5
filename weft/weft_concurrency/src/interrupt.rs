//! Cooperative interruption of worker threads.
//!
//! Threads managed by a `TaskManager` carry an interrupt flag. Removing an
//! executing task or terminating the manager raises the flag of the worker
//! running it; the task observes the request by polling [`is_interrupted`]
//! or [`interrupted`]. Nothing stops a task that does not poll.
//!
//! Threads that were not started by a task manager have no flag and are
//! never interrupted.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<InterruptFlag>> = const { RefCell::new(None) };
}

/// Shared interrupt flag of one worker thread.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    /// Create a new, clear flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request interruption.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether interruption has been requested.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn clear(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }

    /// Install this flag as the calling thread's interrupt flag.
    pub(crate) fn install(&self) {
        let flag = self.clone();
        CURRENT.with(|current| *current.borrow_mut() = Some(flag));
    }
}

/// Whether the calling thread has been asked to stop its current task.
pub fn is_interrupted() -> bool {
    CURRENT.with(|current| current.borrow().as_ref().is_some_and(InterruptFlag::is_set))
}

/// Like [`is_interrupted`], but also clears the request.
pub fn interrupted() -> bool {
    CURRENT.with(|current| current.borrow().as_ref().is_some_and(InterruptFlag::clear))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_unmanaged_thread_is_never_interrupted() {
        thread::spawn(|| {
            assert!(!is_interrupted());
            assert!(!interrupted());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_installed_flag() {
        let flag = InterruptFlag::new();
        let remote = flag.clone();

        let handle = thread::spawn(move || {
            flag.install();
            while !is_interrupted() {
                thread::yield_now();
            }
            // interrupted() consumes the request
            assert!(interrupted());
            assert!(!is_interrupted());
        });

        remote.interrupt();
        handle.join().unwrap();
        assert!(!remote.is_set());
    }
}
