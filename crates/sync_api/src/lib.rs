//! Blocking-primitive traits.
//!
//! Driver logic that must block (waiting for a ring slot, waiting for a
//! completion interrupt) is written against these traits so the same
//! code runs under a kernel's sleeping locks and, in tests, under
//! host implementations (see the [`host`] module, `std` feature).

#![no_std]

#[cfg(feature = "std")]
extern crate std;

use core::ops::DerefMut;

/// A mutex.
pub trait Mutex {
    /// The type of the data that the mutex protects.
    type Data;

    /// The type of the guard that the `lock` method returns.
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a new mutex.
    fn new(data: Self::Data) -> Self;

    /// Locks the mutex.
    fn lock(&self) -> Self::Guard<'_>;
}

/// Why an interruptible wait returned without being notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The waiting thread had a signal delivered to it.
    #[error("waiting thread was interrupted by a signal")]
    Interrupted,
}

/// A condition variable.
///
/// Works with any [`Mutex`] implementation: `wait` consumes the guard,
/// sleeps, and re-acquires through the `lock` reference. Spurious
/// wakeups are permitted, so callers always re-check their predicate.
pub trait Condvar: Send + Sync {
    /// Creates a new condition variable.
    fn new() -> Self;

    /// Atomically releases `guard` and sleeps until notified.
    fn wait<'a, M: Mutex>(&self, lock: &'a M, guard: M::Guard<'a>) -> M::Guard<'a>;

    /// Like [`Condvar::wait`], but a pending signal breaks the sleep.
    ///
    /// On [`WaitError::Interrupted`] the lock is *not* held; callers
    /// that need to unwind shared state must re-acquire it themselves.
    fn wait_interruptible<'a, M: Mutex>(
        &self,
        lock: &'a M,
        guard: M::Guard<'a>,
    ) -> Result<M::Guard<'a>, WaitError>;

    /// Wakes every thread blocked on this condition variable.
    fn notify_all(&self);
}

#[cfg(feature = "std")]
pub mod host {
    //! Host (std) implementations, for tests.
    //!
    //! [`HostCondvar`] follows the generation-counter scheme used by
    //! kernel condition variables built over sleep/wakeup channels:
    //! `notify_all` bumps a counter, waiters poll it with the lock
    //! released. Signals are modelled by a per-thread [`SignalToken`]
    //! that a test raises to break an interruptible wait.

    use core::{
        ops::{Deref, DerefMut},
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
        time::Duration,
    };
    use std::{cell::RefCell, sync::Arc, thread};

    use super::{Condvar, Mutex, WaitError};

    /// How long a waiter sleeps between generation-counter polls.
    const POLL_INTERVAL: Duration = Duration::from_micros(100);

    pub struct HostMutex<T>(std::sync::Mutex<T>);

    pub struct HostMutexGuard<'a, T>(std::sync::MutexGuard<'a, T>);

    impl<T> Mutex for HostMutex<T> {
        type Data = T;

        type Guard<'a>
            = HostMutexGuard<'a, T>
        where
            Self: 'a;

        fn new(data: Self::Data) -> Self {
            Self(std::sync::Mutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            HostMutexGuard(self.0.lock().unwrap())
        }
    }

    impl<T> Deref for HostMutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl<T> DerefMut for HostMutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }

    std::thread_local! {
        static SIGNAL: RefCell<Option<SignalToken>> = const { RefCell::new(None) };
    }

    /// A simulated signal-delivery flag for one thread.
    #[derive(Clone, Default)]
    pub struct SignalToken(Arc<AtomicBool>);

    impl SignalToken {
        /// Marks the owning thread as having a signal pending.
        pub fn raise(&self) {
            self.0.store(true, Ordering::SeqCst);
        }

        pub fn clear(&self) {
            self.0.store(false, Ordering::SeqCst);
        }

        fn pending(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Installs a [`SignalToken`] for the calling thread and returns a
    /// handle other threads may `raise`.
    pub fn install_signal_token() -> SignalToken {
        let token = SignalToken::default();
        SIGNAL.with(|slot| *slot.borrow_mut() = Some(token.clone()));
        token
    }

    fn signal_pending() -> bool {
        SIGNAL.with(|slot| slot.borrow().as_ref().is_some_and(SignalToken::pending))
    }

    pub struct HostCondvar {
        generation: AtomicU64,
    }

    impl Condvar for HostCondvar {
        fn new() -> Self {
            Self {
                generation: AtomicU64::new(0),
            }
        }

        fn wait<'a, M: Mutex>(&self, lock: &'a M, guard: M::Guard<'a>) -> M::Guard<'a> {
            let generation = self.generation.load(Ordering::SeqCst);
            drop(guard);
            while self.generation.load(Ordering::SeqCst) == generation {
                thread::sleep(POLL_INTERVAL);
            }
            lock.lock()
        }

        fn wait_interruptible<'a, M: Mutex>(
            &self,
            lock: &'a M,
            guard: M::Guard<'a>,
        ) -> Result<M::Guard<'a>, WaitError> {
            let generation = self.generation.load(Ordering::SeqCst);
            drop(guard);
            while self.generation.load(Ordering::SeqCst) == generation {
                if signal_pending() {
                    return Err(WaitError::Interrupted);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Ok(lock.lock())
        }

        fn notify_all(&self) {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }
}
