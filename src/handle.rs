//! Reference-counted handles to shared resources whose teardown must run exactly once, when
//! the last handle is released.

use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Cleanup run when the last [`RefCounted`] handle to a value is released.
pub(crate) trait Teardown: Send + Sync {
    fn teardown(&self);
}

struct Shared<T> {
    value: T,
    references: AtomicUsize,
}

/// A handle to a shared value. [`RefCounted::fork`] produces another handle to the same value;
/// dropping or [releasing](RefCounted::release) a handle gives up its reference. The value's
/// [`Teardown`] runs when the count reaches zero.
///
/// This differs from a bare `Arc` in that teardown is tied to the explicit handle count, not to
/// the lifetime of the allocation: internal clones of the `Arc` (e.g. in spawned tasks) do not
/// keep the resource alive.
pub(crate) struct RefCounted<T: Teardown> {
    shared: Arc<Shared<T>>,
}

impl<T: Teardown> RefCounted<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                value,
                references: AtomicUsize::new(1),
            }),
        }
    }

    /// Returns a new handle to the same value.
    pub(crate) fn fork(&self) -> Self {
        self.shared.references.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
        }
    }

    /// Gives up this handle's reference.
    pub(crate) fn release(self) {
        drop(self)
    }

    pub(crate) fn reference_count(&self) -> usize {
        self.shared.references.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same value.
    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T: Teardown> Deref for RefCounted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.shared.value
    }
}

impl<T: Teardown> Drop for RefCounted<T> {
    fn drop(&mut self) {
        if self.shared.references.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.value.teardown();
        }
    }
}

impl<T: Teardown + fmt::Debug> fmt::Debug for RefCounted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCounted")
            .field("value", &self.shared.value)
            .field("references", &self.reference_count())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{RefCounted, Teardown};

    struct Counter(Arc<AtomicUsize>);

    impl Teardown for Counter {
        fn teardown(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fork_and_release_restore_count() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let handle = RefCounted::new(Counter(teardowns.clone()));
        assert_eq!(handle.reference_count(), 1);

        let forks: Vec<_> = (0..5).map(|_| handle.fork()).collect();
        assert_eq!(handle.reference_count(), 6);
        assert!(forks[0].ptr_eq(&handle));

        for fork in forks {
            fork.release();
        }
        assert_eq!(handle.reference_count(), 1);
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);

        handle.release();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_runs_once_when_last_fork_outlives_original() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let handle = RefCounted::new(Counter(teardowns.clone()));
        let fork = handle.fork();

        drop(handle);
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
        assert_eq!(fork.reference_count(), 1);

        drop(fork);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }
}
