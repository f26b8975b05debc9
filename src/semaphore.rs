//! A counting semaphore.

use core::fmt::{self, Debug, Formatter};
use core::time::Duration;

use crate::cfg::cell::{UnsafeCell, UnsafeCellWith};
use crate::lock_core::LockCore;
use crate::port::{Hardware, Port};
use crate::relax::{Relax, Spin};
use crate::spin::SpinToken;
use crate::time::Deadline;

#[derive(Clone, Copy, Debug)]
struct Permits {
    available: i16,
    max: i16,
}

/// A semaphore holding up to `max` permits.
///
/// Acquiring with no permit available suspends the caller through the
/// unlock-and-wait protocol until another context releases one.
pub struct Semaphore<P, R = Spin> {
    core: LockCore<P, R>,
    permits: UnsafeCell<Permits>,
}

// The permit count is only accessed with the spinlock held.
unsafe impl<P: Send, R> Send for Semaphore<P, R> {}
unsafe impl<P: Sync, R> Sync for Semaphore<P, R> {}

impl<P, R> Semaphore<P, R> {
    /// Creates a semaphore with `initial` of `max` permits available.
    ///
    /// `initial` must not be negative nor exceed `max`, and `max` must be
    /// positive.
    pub fn new(initial: i16, max: i16, port: P) -> Self {
        debug_assert!(max > 0, "semaphore with no permits");
        debug_assert!((0..=max).contains(&initial), "initial permits out of range");
        let permits = UnsafeCell::new(Permits { available: initial, max });
        Self { core: LockCore::new(port), permits }
    }

    /// Runs `f` against the permit count.
    ///
    /// The caller must hold the spinlock, as `_held` proves.
    fn with_permits<F, Ret>(&self, _held: &SpinToken, f: F) -> Ret
    where
        F: FnOnce(&mut Permits) -> Ret,
    {
        // SAFETY: The permits are only accessed with the spinlock held.
        unsafe { self.permits.with_mut_unchecked(f) }
    }

    fn take(permits: &mut Permits) -> bool {
        let available = permits.available > 0;
        if available {
            permits.available -= 1;
        }
        available
    }
}

impl<P: Port, R: Relax> Semaphore<P, R> {
    /// Returns the number of permits currently available.
    pub fn available(&self) -> i16 {
        let token = self.core.lock();
        let available = self.with_permits(&token, |permits| permits.available);
        self.core.unlock(token);
        available
    }

    /// Takes a permit if one is available, without suspending.
    pub fn try_acquire(&self) -> bool {
        let token = self.core.lock();
        let taken = self.with_permits(&token, Self::take);
        self.core.unlock(token);
        taken
    }

    /// Takes a permit, suspending the caller until one is available.
    pub fn acquire(&self) {
        loop {
            let token = self.core.lock();
            if self.with_permits(&token, Self::take) {
                self.core.unlock(token);
                return;
            }
            self.core.unlock_with_wait(token);
        }
    }

    /// Takes a permit, giving up once `deadline` has passed.
    ///
    /// Returns `false` on timeout.
    pub fn acquire_until(&self, deadline: Deadline) -> bool {
        loop {
            let token = self.core.lock();
            if self.with_permits(&token, Self::take) {
                self.core.unlock(token);
                return true;
            }
            if self.core.unlock_with_wait_until(token, deadline) {
                return false;
            }
        }
    }

    /// Takes a permit, giving up after `timeout`.
    pub fn acquire_for(&self, timeout: Duration) -> bool {
        let deadline = self.core.port().hardware().now() + timeout;
        self.acquire_until(deadline)
    }

    /// Returns a permit and wakes the waiters.
    ///
    /// Returns `false`, without notifying, if all permits were already
    /// available.
    pub fn release(&self) -> bool {
        let token = self.core.lock();
        let released = self.with_permits(&token, |permits| {
            let room = permits.available < permits.max;
            if room {
                permits.available += 1;
            }
            room
        });
        if released {
            self.core.unlock_with_notify(token);
        } else {
            self.core.unlock(token);
        }
        released
    }

    /// Sets the number of available permits, waking the waiters if any
    /// became available.
    pub fn reset(&self, available: i16) {
        let token = self.core.lock();
        let available = self.with_permits(&token, |permits| {
            debug_assert!((0..=permits.max).contains(&available), "permits out of range");
            permits.available = available;
            available
        });
        if available > 0 {
            self.core.unlock_with_notify(token);
        } else {
            self.core.unlock(token);
        }
    }
}

impl<P: Port, R: Relax> Debug for Semaphore<P, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let token = self.core.lock();
        let permits = self.with_permits(&token, |permits| *permits);
        self.core.unlock(token);
        f.debug_struct("Semaphore")
            .field("available", &permits.available)
            .field("max", &permits.max)
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Semaphore;
    use crate::relax::Yield;
    use crate::test::{Forbidden, Immediate, StubHardware, TestPort, WATCHDOG};
    use crate::time::Instant;

    type Sem<P> = Semaphore<P, Yield>;

    fn degraded() -> Arc<TestPort<StubHardware, Forbidden>> {
        Arc::new(TestPort::new(StubHardware::on_core(0), Forbidden))
    }

    #[test]
    fn counts_permits() {
        let sem = Sem::new(2, 2, degraded());
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        assert_eq!(sem.available(), 0);
        assert!(sem.release());
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn release_is_capped() {
        let port = degraded();
        let sem = Sem::new(1, 1, Arc::clone(&port));
        assert!(!sem.release());
        assert_eq!(port.hardware.events(), 0);
        sem.acquire();
        assert!(sem.release());
        assert_eq!(port.hardware.events(), 1);
    }

    #[test]
    fn reset_notifies_when_permits_appear() {
        let port = degraded();
        let sem = Sem::new(0, 4, Arc::clone(&port));
        sem.reset(0);
        assert_eq!(port.hardware.events(), 0);
        sem.reset(3);
        assert_eq!(port.hardware.events(), 1);
        assert_eq!(sem.available(), 3);
    }

    #[test]
    fn acquire_until_times_out() {
        let port = degraded();
        port.hardware.set_step(3);
        let sem = Sem::new(0, 1, Arc::clone(&port));
        let deadline = Instant::from_micros(60);
        assert!(!sem.acquire_until(deadline));
        assert!(deadline.is_reached(port.hardware.peek()));
    }

    #[test]
    fn acquire_for_takes_available_permit() {
        let sem = Sem::new(1, 1, degraded());
        assert!(sem.acquire_for(Duration::ZERO));
        assert!(!sem.acquire_for(Duration::ZERO));
    }

    #[test]
    fn release_wakes_blocked_acquirer() {
        let port = Arc::new(TestPort::new(StubHardware::on_core(0), Immediate));
        port.presence.activate();
        let sem = Arc::new(Sem::new(0, 1, port));
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                sem.acquire();
                tx.send(()).unwrap();
            })
        };
        assert!(sem.release());
        rx.recv_timeout(WATCHDOG).expect("acquirer never woke");
        waiter.join().unwrap();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn debug() {
        let sem = Sem::new(1, 3, degraded());
        assert_eq!(format!("{sem:?}"), "Semaphore { available: 1, max: 3 }");
    }
}

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
mod model {
    use crate::loom::models;

    #[test]
    fn release_wakes_acquirer_degraded() {
        models::release_wakes_acquirer(false);
    }

    #[test]
    fn release_wakes_acquirer_active() {
        models::release_wakes_acquirer(true);
    }
}
