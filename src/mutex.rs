//! An owner-tracked blocking mutex.
//!
//! The mutex records the [`OwnerId`] of its holder under its spinlock, and
//! contenders suspend through the unlock-and-wait protocol instead of
//! spinning. With an active scheduler a contending task gives the processor
//! to other tasks until the holder releases the mutex. Without one the
//! contending core sleeps on wait-for-event.

use core::fmt::{self, Debug, Display, Formatter};
use core::marker::PhantomData;
use core::time::Duration;

use crate::cfg::cell::{UnsafeCell, UnsafeCellWith};
use crate::lock_core::LockCore;
use crate::owner::OwnerId;
use crate::port::{Hardware, Port};
use crate::relax::{Relax, Spin};
use crate::spin::SpinToken;
use crate::time::Deadline;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// # Examples
///
/// ```
/// # #[cfg(feature = "std")] {
/// use std::sync::Arc;
/// use std::thread;
///
/// use coopwait::host::HostPort;
/// use coopwait::mutex::Mutex;
///
/// let port = Arc::new(HostPort::dual_core());
/// let mutex = Arc::new(Mutex::<_, _>::new(0, Arc::clone(&port)));
///
/// let handles: Vec<_> = (0..2)
///     .map(|core| {
///         let (port, mutex) = (Arc::clone(&port), Arc::clone(&mutex));
///         thread::spawn(move || {
///             port.hardware.enter_core(core);
///             *mutex.lock() += 1;
///         })
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert_eq!(*mutex.lock(), 2);
/// # }
/// ```
pub struct Mutex<T: ?Sized, P, R = Spin> {
    core: LockCore<P, R>,
    /// The holder, `None` while the mutex is free. A holder running outside
    /// of any task with the scheduler active is recorded as `INVALID`.
    owner: UnsafeCell<Option<OwnerId>>,
    data: UnsafeCell<T>,
}

// Same unsafe impls as `std::sync::Mutex`, the port is shared by every caller.
unsafe impl<T: ?Sized + Send, P: Send, R> Send for Mutex<T, P, R> {}
unsafe impl<T: ?Sized + Send, P: Sync, R> Sync for Mutex<T, P, R> {}

impl<T, P, R> Mutex<T, P, R> {
    /// Creates a new, unlocked mutex running on `port`.
    pub fn new(value: T, port: P) -> Self {
        let owner = UnsafeCell::new(None);
        Self { core: LockCore::new(port), owner, data: UnsafeCell::new(value) }
    }

    /// Consumes this mutex, returning the underlying data.
    #[cfg(not(all(loom, test)))]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, P, R> Mutex<T, P, R> {
    /// Returns a mutable reference to the underlying data.
    ///
    /// The mutable borrow statically guarantees no guard exists.
    #[cfg(not(all(loom, test)))]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Takes the mutex for `caller` if it is free.
    fn try_claim(&self, _held: &SpinToken, caller: OwnerId) -> bool {
        // SAFETY: The owner is only accessed with the spinlock held, which
        // `_held` proves.
        unsafe {
            self.owner.with_mut_unchecked(|owner| {
                let free = owner.is_none();
                if free {
                    *owner = Some(caller);
                }
                free
            })
        }
    }
}

impl<T: ?Sized, P: Port, R: Relax> Mutex<T, P, R> {
    /// Acquires this mutex, suspending the caller until it is able to do so.
    ///
    /// Locking a mutex the caller already holds never returns.
    pub fn lock(&self) -> MutexGuard<'_, T, P, R> {
        let caller = self.core.caller_owner_id();
        loop {
            let token = self.core.lock();
            if self.try_claim(&token, caller) {
                self.core.unlock(token);
                return MutexGuard::new(self);
            }
            self.core.unlock_with_wait(token);
        }
    }

    /// Attempts to acquire this mutex without suspending.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, P, R>> {
        let caller = self.core.caller_owner_id();
        let token = self.core.lock();
        let claimed = self.try_claim(&token, caller);
        self.core.unlock(token);
        claimed.then(|| MutexGuard::new(self))
    }

    /// Acquires this mutex, giving up once `deadline` has passed.
    ///
    /// A free mutex is taken even if the deadline is already in the past.
    pub fn lock_until(&self, deadline: Deadline) -> Option<MutexGuard<'_, T, P, R>> {
        let caller = self.core.caller_owner_id();
        loop {
            let token = self.core.lock();
            if self.try_claim(&token, caller) {
                self.core.unlock(token);
                return Some(MutexGuard::new(self));
            }
            if self.core.unlock_with_wait_until(token, deadline) {
                return None;
            }
        }
    }

    /// Acquires this mutex, giving up after `timeout`.
    pub fn lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T, P, R>> {
        let deadline = self.core.port().hardware().now() + timeout;
        self.lock_until(deadline)
    }

    /// Returns the current holder, if any.
    pub fn owner(&self) -> Option<OwnerId> {
        let token = self.core.lock();
        // SAFETY: The spinlock is held.
        let owner = unsafe { self.owner.with_unchecked(|owner| *owner) };
        self.core.unlock(token);
        owner.filter(|owner| owner.is_valid())
    }

    /// Returns `true` if the mutex is held, whether or not its holder has
    /// an owner id.
    pub fn is_locked(&self) -> bool {
        let token = self.core.lock();
        // SAFETY: The spinlock is held.
        let held = unsafe { self.owner.with_unchecked(|owner| owner.is_some()) };
        self.core.unlock(token);
        held
    }

    /// Releases the mutex and wakes its waiters.
    fn release(&self) {
        let token = self.core.lock();
        // SAFETY: The spinlock is held.
        unsafe { self.owner.with_mut_unchecked(|owner| *owner = None) };
        self.core.unlock_with_notify(token);
    }
}

impl<T: ?Sized + Debug, P: Port, R: Relax> Debug for Mutex<T, P, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => guard.with(|data| {
                d.field("data", &data);
            }),
            None => {
                d.field("owner", &self.owner());
            }
        }
        d.finish_non_exhaustive()
    }
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure is
/// dropped (falls out of scope), the mutex is released and its waiters are
/// notified.
///
/// A guard belongs to the owner that took it, so it is not `Send`.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized, P: Port, R: Relax> {
    lock: &'a Mutex<T, P, R>,
    marker: PhantomData<*const ()>,
}

// Same unsafe Sync impl as `std::sync::MutexGuard`.
unsafe impl<T: ?Sized + Sync, P: Port + Sync, R: Relax> Sync for MutexGuard<'_, T, P, R> {}

impl<'a, T: ?Sized, P: Port, R: Relax> MutexGuard<'a, T, P, R> {
    const fn new(lock: &'a Mutex<T, P, R>) -> Self {
        Self { lock, marker: PhantomData }
    }

    /// Runs `f` against a shared reference pointing to the underlying data.
    pub(crate) fn with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&T) -> Ret,
    {
        // SAFETY: A guard instance holds the mutex locked.
        unsafe { self.lock.data.with_unchecked(f) }
    }

    /// Runs `f` against a mutable reference pointing to the underlying data.
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub(crate) fn with_mut<F, Ret>(&mut self, f: F) -> Ret
    where
        F: FnOnce(&mut T) -> Ret,
    {
        // SAFETY: A guard instance holds the mutex locked, and we borrow the
        // guard exclusively.
        unsafe { self.lock.data.with_mut_unchecked(f) }
    }
}

impl<T: ?Sized, P: Port, R: Relax> Drop for MutexGuard<'_, T, P, R> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<T: ?Sized + Debug, P: Port, R: Relax> Debug for MutexGuard<'_, T, P, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|data| data.fmt(f))
    }
}

impl<T: ?Sized + Display, P: Port, R: Relax> Display for MutexGuard<'_, T, P, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|data| data.fmt(f))
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, P: Port, R: Relax> core::ops::Deref for MutexGuard<'_, T, P, R> {
    type Target = T;

    /// Dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: A guard instance holds the mutex locked.
        unsafe { &*self.lock.data.get() }
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, P: Port, R: Relax> core::ops::DerefMut for MutexGuard<'_, T, P, R> {
    /// Mutably dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: A guard instance holds the mutex locked.
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Mutex;
    use crate::owner::OwnerId;
    use crate::relax::Yield;
    use crate::test::tests::lots_and_lots;
    use crate::test::{FixedTask, Forbidden, Immediate, Int, StubHardware, TestPort};
    use crate::time::Instant;

    type StubPort<S> = Arc<TestPort<StubHardware, S>>;

    fn degraded() -> StubPort<Forbidden> {
        Arc::new(TestPort::new(StubHardware::on_core(0), Forbidden))
    }

    #[test]
    fn smoke() {
        let mutex = Mutex::<Int, _, Yield>::new(1, degraded());
        drop(mutex.lock());
        *mutex.lock() += 1;
        assert_eq!(mutex.into_inner(), 2);
    }

    #[test]
    fn owner_is_recorded() {
        let port = Arc::new(TestPort::new(StubHardware::on_core(1), Immediate));
        let mutex = Mutex::<Int, _, Yield>::new(0, Arc::clone(&port));
        assert_eq!(mutex.owner(), None);
        {
            let _guard = mutex.lock();
            assert_eq!(mutex.owner(), Some(OwnerId::from_core(1)));
        }
        assert!(!mutex.is_locked());
        port.presence.activate();
        let guard = mutex.lock();
        assert!(mutex.is_locked());
        assert_ne!(mutex.owner(), None);
        drop(guard);
    }

    #[test]
    fn try_lock_contended() {
        let mutex = Mutex::<Int, _, Yield>::new(0, degraded());
        let guard = mutex.try_lock().expect("free mutex");
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn release_notifies() {
        let port = degraded();
        let mutex = Mutex::<Int, _, Yield>::new(0, Arc::clone(&port));
        drop(mutex.lock());
        assert_eq!(port.hardware.events(), 1);
    }

    #[test]
    fn lock_until_times_out_after_deadline() {
        let port = degraded();
        port.hardware.set_step(7);
        let mutex = Mutex::<Int, _, Yield>::new(0, Arc::clone(&port));
        let _held = mutex.lock();
        let deadline = Instant::from_micros(100);
        assert!(mutex.lock_until(deadline).is_none());
        assert!(deadline.is_reached(port.hardware.peek()));
    }

    #[test]
    fn lock_until_past_deadline_takes_free_mutex() {
        let port = degraded();
        port.hardware.set_now(Instant::from_micros(1_000));
        let mutex = Mutex::<Int, _, Yield>::new(5, port);
        let guard = mutex.lock_until(Instant::from_micros(1)).expect("free mutex");
        assert_eq!(*guard, 5);
    }

    #[test]
    fn lock_for_times_out() {
        let port = degraded();
        port.hardware.set_step(1_000);
        let mutex = Mutex::<Int, _, Yield>::new(0, port);
        let _held = mutex.lock();
        assert!(mutex.lock_for(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn degraded_mode_never_reaches_scheduler() {
        let count = lots_and_lots(degraded(), 2, 1_000, |_| ());
        assert_eq!(count, 2_000);
    }

    #[test]
    fn spurious_wakeups_keep_exclusion() {
        let port = Arc::new(TestPort::new(StubHardware::on_core(0), Immediate));
        port.presence.activate();
        let count = lots_and_lots(port, 3, 1_000, |_| ());
        assert_eq!(count, 3_000);
    }

    #[test]
    fn callers_outside_tasks_exclude_each_other() {
        let port = Arc::new(TestPort::new(StubHardware::on_core(0), FixedTask(-1)));
        port.presence.activate();
        let mutex = Mutex::<Int, _, Yield>::new(0, Arc::clone(&port));
        let guard = mutex.try_lock().expect("free mutex");
        assert!(mutex.try_lock().is_none());
        assert!(mutex.is_locked());
        assert_eq!(mutex.owner(), None);
        drop(guard);
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn get_mut() {
        let mut mutex = Mutex::<Int, _, Yield>::new(10, degraded());
        *mutex.get_mut() = 20;
        assert_eq!(*mutex.lock(), 20);
    }

    #[test]
    fn guard_debug_display() {
        let value = 42;
        let mutex = Mutex::<Int, _, Yield>::new(value, degraded());
        let guard = mutex.lock();
        assert_eq!(format!("{value:?}"), format!("{guard:?}"));
        assert_eq!(format!("{value}"), format!("{guard}"));
    }

    #[test]
    fn mutex_debug() {
        let mutex = Mutex::<Int, _, Yield>::new(42, degraded());
        assert_eq!(format!("{mutex:?}"), "Mutex { data: 42, .. }");
        let _guard = mutex.lock();
        assert_eq!(format!("{mutex:?}"), "Mutex { owner: Some(OwnerId(0)), .. }");
    }

    #[test]
    fn unsized_data() {
        let mutex: Arc<Mutex<[Int], _, Yield>> = Arc::new(Mutex::new([1, 2, 3], degraded()));
        {
            let mut guard = mutex.lock();
            guard[0] = 4;
            guard[2] = 5;
        }
        assert_eq!(&*mutex.lock(), &[4, 2, 5]);
    }

    #[test]
    fn access_in_unwind() {
        let mutex = Arc::new(Mutex::<Int, _, Yield>::new(1, degraded()));
        let c_mutex = Arc::clone(&mutex);
        let _ = thread::spawn(move || {
            struct Unwinder<P: crate::port::Port> {
                mutex: Arc<Mutex<Int, P, Yield>>,
            }
            impl<P: crate::port::Port> Drop for Unwinder<P> {
                fn drop(&mut self) {
                    *self.mutex.lock() += 1;
                }
            }
            let _u = Unwinder { mutex: c_mutex };
            panic!();
        })
        .join();
        assert_eq!(*mutex.lock(), 2);
    }
}

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
mod model {
    use crate::loom::models;

    #[test]
    fn lock_join_degraded() {
        models::lock_join(false);
    }

    #[test]
    fn lock_join_active() {
        models::lock_join(true);
    }
}
