//! Task trait definitions.
//!
//! A `Task` is the unit of work queued on a task manager. Besides doing its
//! work it can declare ordering constraints against the tasks queued ahead of
//! it, which lets a single manager run independent work concurrently while
//! keeping dependent work in order.

use std::any::type_name;
use std::borrow::Cow;
use std::sync::Arc;

/// Shared handle to a queued task.
///
/// Task identity is the identity of the allocation behind the `Arc`.
pub type TaskRef = Arc<dyn Task>;

/// A unit of work with ordering constraints.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use weft_core::traits::{Task, TaskRef};
///
/// /// Writes for one key must not overlap or reorder.
/// struct Write {
///     key: String,
/// }
///
/// impl Task for Write {
///     fn run(&self) {
///         // perform the write
///     }
///
///     fn run_after(&self, preceding: &[TaskRef]) -> bool {
///         preceding.iter().any(|t| t.name() == self.name())
///     }
///
///     fn name(&self) -> std::borrow::Cow<'_, str> {
///         format!("write:{}", self.key).into()
///     }
/// }
///
/// let a: TaskRef = Arc::new(Write { key: "a".into() });
/// let b = Write { key: "a".into() };
/// assert!(b.run_after(&[a]));
/// ```
pub trait Task: Send + Sync {
    /// Perform the work.
    fn run(&self);

    /// Whether this task must not run before or concurrently with any of the
    /// `preceding` tasks.
    ///
    /// `preceding` holds, in queue order, every task queued ahead of this
    /// one, whether it is already executing or still waiting. The manager
    /// calls this with its queue lock held, so it must be cheap and must not
    /// call back into the manager.
    fn run_after(&self, preceding: &[TaskRef]) -> bool;

    /// Whether `other` should be treated as a duplicate of this task by
    /// `add_if_new`. Identical tasks are always duplicates.
    fn equivalent(&self, _other: &dyn Task) -> bool {
        false
    }

    /// Name used in log output.
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed(type_name::<Self>())
    }
}

/// A plain unit of work.
///
/// Implemented for every `Fn() + Send + Sync` closure.
pub trait Runnable: Send + Sync {
    /// Perform the work.
    fn run(&self);
}

impl<F> Runnable for F
where
    F: Fn() + Send + Sync,
{
    fn run(&self) {
        self()
    }
}

/// Check whether two task handles refer to the same task.
pub fn same_task(a: &TaskRef, b: &TaskRef) -> bool {
    Arc::ptr_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: AtomicUsize,
    }

    impl Task for Counting {
        fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        fn run_after(&self, _preceding: &[TaskRef]) -> bool {
            false
        }
    }

    #[test]
    fn test_default_name_is_type_name() {
        let task = Counting {
            runs: AtomicUsize::new(0),
        };
        assert!(task.name().ends_with("Counting"));
    }

    #[test]
    fn test_identity() {
        let a: TaskRef = Arc::new(Counting {
            runs: AtomicUsize::new(0),
        });
        let b: TaskRef = Arc::new(Counting {
            runs: AtomicUsize::new(0),
        });
        let a2 = Arc::clone(&a);

        assert!(same_task(&a, &a2));
        assert!(!same_task(&a, &b));
        assert!(!a.equivalent(b.as_ref()));
    }

    #[test]
    fn test_closure_is_runnable() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let runnable: Arc<dyn Runnable> = Arc::new(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        runnable.run();
        runnable.run();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
