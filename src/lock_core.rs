//! The atomic unlock-and-wait protocol.
//!
//! A blocking primitive keeps its state behind a [`LockCore`] and loops: take
//! the spinlock, inspect or mutate its state, and if it cannot proceed, call
//! [`unlock_with_wait`] (or [`unlock_with_wait_until`]) and try again. The
//! mutating side changes the state under the same spinlock and releases it
//! with [`unlock_with_notify`].
//!
//! The protocol guarantees that a notify that begins after a wait has begun
//! wakes that waiter, even though releasing the spinlock and suspending are
//! two separate steps:
//!
//! - With an active scheduler the waiter records its task id in the lock's
//!   wait set *before* releasing the spinlock. A notifier holding the same
//!   spinlock afterwards necessarily sees the record and wakes the task. If
//!   the wake lands before the task actually blocks, the scheduler keeps it
//!   as a wake permit and the block returns immediately.
//! - Without a scheduler the waiter releases the spinlock and executes a
//!   wait-for-event. Every notify ends with a send-event, which either wakes
//!   the waiter or leaves the event latched so its wait returns at once.
//!
//! A notify always performs both steps, so a waiter is never stranded by the
//! presence switch flipping between its wait and the notify.
//!
//! All waits may return spuriously. Callers must re-check their condition
//! after every return.
//!
//! [`unlock_with_wait`]: LockCore::unlock_with_wait
//! [`unlock_with_wait_until`]: LockCore::unlock_with_wait_until
//! [`unlock_with_notify`]: LockCore::unlock_with_notify

use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::Ordering::Relaxed;

use crate::cfg::atomic::AtomicU64;
use crate::owner::{resolve_owner, OwnerId};
use crate::port::{Hardware, Port, Scheduler};
use crate::relax::{Relax, Spin};
use crate::spin::{SpinLock, SpinToken};
use crate::time::Deadline;

/// The set of tasks blocked on one lock.
///
/// Task ids `0..=62` map to one bit each. Every other id shares the overflow
/// bit, which makes the notifier wake all blocked tasks instead. Only ever
/// touched with the owning spinlock held.
struct WaitSet {
    bits: AtomicU64,
}

impl WaitSet {
    const OVERFLOW: u64 = 1 << 63;

    fn new() -> Self {
        Self { bits: AtomicU64::new(0) }
    }

    fn slot(task: OwnerId) -> u64 {
        match task.get() {
            id @ 0..=62 => 1 << id,
            _ => Self::OVERFLOW,
        }
    }

    fn insert(&self, task: OwnerId) {
        self.bits.fetch_or(Self::slot(task), Relaxed);
    }

    fn take(&self) -> u64 {
        self.bits.swap(0, Relaxed)
    }

    /// Wakes every task recorded in `bits`.
    fn wake<S: Scheduler + ?Sized>(scheduler: &S, mut bits: u64) {
        if bits & Self::OVERFLOW != 0 {
            scheduler.wake_all();
            return;
        }
        while bits != 0 {
            let id = bits.trailing_zeros();
            bits &= bits - 1;
            // Cast: `id` is at most 62.
            scheduler.wake_task(OwnerId::new(id as i16));
        }
    }
}

/// The spinlock and waiter bookkeeping shared by every blocking primitive.
///
/// `LockCore` never looks at the state it protects. It brackets access to
/// it and performs the block and notify dance around it.
pub struct LockCore<P, R = Spin> {
    spin: SpinLock<R>,
    waiters: WaitSet,
    port: P,
}

impl<P, R> LockCore<P, R> {
    /// Creates a new core for a primitive running on `port`.
    pub fn new(port: P) -> Self {
        Self { spin: SpinLock::new(), waiters: WaitSet::new(), port }
    }

    /// Returns the port this core runs on.
    pub const fn port(&self) -> &P {
        &self.port
    }
}

impl<P: Port, R> LockCore<P, R> {
    /// Returns the owner id of the caller, see [`resolve_owner`].
    #[inline]
    pub fn caller_owner_id(&self) -> OwnerId {
        resolve_owner(&self.port)
    }

    /// Releases the spinlock without notifying anyone.
    #[inline]
    pub fn unlock(&self, token: SpinToken) {
        self.spin.unlock(self.port.hardware(), token);
    }

    /// Atomically releases the spinlock and waits for a notification.
    ///
    /// Any [`unlock_with_notify`] on this core that completes after this call
    /// starts wakes the caller. The call may also return earlier, for no
    /// reason at all.
    ///
    /// The caller must hold the spinlock `token` was obtained from, and must
    /// not be running in interrupt context.
    ///
    /// [`unlock_with_notify`]: LockCore::unlock_with_notify
    pub fn unlock_with_wait(&self, token: SpinToken) {
        let hw = self.port.hardware();
        match self.blocking_task() {
            Some(task) => {
                self.waiters.insert(task);
                self.spin.unlock(hw, token);
                self.port.scheduler().block_current_task();
            }
            None => {
                self.spin.unlock(hw, token);
                hw.wait_for_event();
            }
        }
    }

    /// Atomically releases the spinlock and waits for a notification or for
    /// `deadline` to pass.
    ///
    /// Returns `true` if the deadline has been reached. A `false` return only
    /// means the caller should re-check its condition. A deadline already in
    /// the past releases the spinlock and returns `true` without suspending.
    ///
    /// Same preconditions as [`unlock_with_wait`](LockCore::unlock_with_wait).
    pub fn unlock_with_wait_until(&self, token: SpinToken, deadline: Deadline) -> bool {
        let hw = self.port.hardware();
        if deadline.is_reached(hw.now()) {
            self.spin.unlock(hw, token);
            return true;
        }
        let expired = match self.blocking_task() {
            Some(task) => {
                // A stale record left behind by a timeout only causes a
                // spurious wakeup of this task later on.
                self.waiters.insert(task);
                self.spin.unlock(hw, token);
                self.port.scheduler().block_current_task_until(deadline)
            }
            None => {
                self.spin.unlock(hw, token);
                hw.wait_for_event_until(deadline)
            }
        };
        let timed_out = expired && deadline.is_reached(hw.now());
        if timed_out {
            log::trace!("wait timed out at {deadline}");
        }
        timed_out
    }

    /// Releases the spinlock and wakes everything waiting on this core.
    ///
    /// Call after mutating the protected state in a way that may let a
    /// waiter proceed.
    pub fn unlock_with_notify(&self, token: SpinToken) {
        let hw = self.port.hardware();
        let waiters = self.waiters.take();
        self.spin.unlock(hw, token);
        if waiters != 0 {
            WaitSet::wake(self.port.scheduler(), waiters);
        }
        hw.send_event();
    }

    /// Returns the task to block if the caller can be suspended through the
    /// scheduler.
    ///
    /// Callers outside of any task, such as a core the scheduler does not
    /// run on, keep using hardware waits.
    fn blocking_task(&self) -> Option<OwnerId> {
        if !self.port.presence().is_active() {
            return None;
        }
        Some(self.port.scheduler().current_task_id()).filter(|task| task.is_valid())
    }
}

impl<P: Port, R: Relax> LockCore<P, R> {
    /// Masks interrupts and takes the spinlock.
    #[inline]
    pub fn lock(&self) -> SpinToken {
        self.spin.lock(self.port.hardware())
    }

    /// Masks interrupts and takes the spinlock if it is free.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinToken> {
        self.spin.try_lock(self.port.hardware())
    }
}

impl<P, R> Debug for LockCore<P, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockCore")
            .field("spin", &self.spin)
            .field("waiters", &format_args!("{:#x}", self.waiters.bits.load(Relaxed)))
            .finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{LockCore, WaitSet};
    use crate::owner::OwnerId;
    use crate::relax::Yield;
    use crate::test::{Call, Forbidden, Recording, StubHardware, TestPort};
    use crate::time::Instant;

    type Core<P> = LockCore<P, Yield>;

    fn recording(task: i16) -> TestPort<StubHardware, Recording> {
        let port = TestPort::new(StubHardware::on_core(0), Recording::new(task));
        port.presence.activate();
        port
    }

    #[test]
    fn slots() {
        assert_eq!(WaitSet::slot(OwnerId::new(0)), 1);
        assert_eq!(WaitSet::slot(OwnerId::new(62)), 1 << 62);
        assert_eq!(WaitSet::slot(OwnerId::new(63)), WaitSet::OVERFLOW);
        assert_eq!(WaitSet::slot(OwnerId::INVALID), WaitSet::OVERFLOW);
    }

    #[test]
    fn degraded_wait_uses_hardware_only() {
        let core = Core::new(TestPort::new(StubHardware::on_core(0), Forbidden));
        let token = core.lock();
        core.unlock_with_wait(token);
        assert_eq!(core.port().hardware.waits(), 1);
        assert!(core.port().hardware.interrupts_enabled());
        let token = core.try_lock().expect("spinlock released by wait");
        core.unlock_with_notify(token);
        assert_eq!(core.port().hardware.events(), 1);
    }

    #[test]
    fn active_wait_registers_before_blocking() {
        let core = Core::new(recording(5));
        let token = core.lock();
        core.unlock_with_wait(token);
        assert_eq!(core.port().scheduler.calls(), [Call::Block]);
        assert_eq!(core.port().hardware.waits(), 0);

        let token = core.lock();
        core.unlock_with_notify(token);
        assert_eq!(core.port().scheduler.calls(), [Call::Block, Call::Wake(5)]);
        assert_eq!(core.port().hardware.events(), 1);
    }

    #[test]
    fn notify_drains_waiters_once() {
        let core = Core::new(recording(3));
        for _ in 0..2 {
            let token = core.lock();
            core.unlock_with_wait(token);
        }
        let token = core.lock();
        core.unlock_with_notify(token);
        let token = core.lock();
        core.unlock_with_notify(token);
        let calls = core.port().scheduler.calls();
        assert_eq!(calls, [Call::Block, Call::Block, Call::Wake(3)]);
    }

    #[test]
    fn notify_without_waiters_skips_scheduler() {
        let port = TestPort::new(StubHardware::on_core(0), Forbidden);
        port.presence.activate();
        let core = Core::new(&port);
        let token = core.lock();
        core.unlock_with_notify(token);
        assert_eq!(port.hardware.events(), 1);
    }

    #[test]
    fn overflow_ids_broadcast() {
        let core = Core::new(recording(100));
        let token = core.lock();
        core.unlock_with_wait(token);
        let token = core.lock();
        core.unlock_with_notify(token);
        assert_eq!(core.port().scheduler.calls(), [Call::Block, Call::WakeAll]);
    }

    #[test]
    fn active_without_task_uses_hardware() {
        let core = Core::new(recording(-1));
        let token = core.lock();
        core.unlock_with_wait(token);
        assert!(core.port().scheduler.calls().is_empty());
        assert_eq!(core.port().hardware.waits(), 1);
    }

    #[test]
    fn past_deadline_returns_without_waiting() {
        let port = TestPort::new(StubHardware::on_core(0), Forbidden);
        port.presence.activate();
        port.hardware.set_now(Instant::from_micros(500));
        let core = Core::new(&port);
        let token = core.lock();
        assert!(core.unlock_with_wait_until(token, Instant::from_micros(499)));
        assert_eq!(port.hardware.waits(), 0);
        assert!(core.try_lock().map(|token| core.unlock(token)).is_some());
    }

    #[test]
    fn active_timed_wait_reports_scheduler_timeout() {
        let core = Core::new(recording(2));
        core.port().scheduler.set_timeout_result(true);
        let deadline = Instant::from_micros(10);
        core.port().hardware.set_now(Instant::from_micros(0));
        // The clock reads 0 before blocking and 20 after.
        core.port().hardware.set_step(20);
        let token = core.lock();
        assert!(core.unlock_with_wait_until(token, deadline));
        assert_eq!(core.port().scheduler.calls(), [Call::BlockUntil(deadline)]);
    }

    #[test]
    fn early_timeout_is_not_reported() {
        let core = Core::new(recording(2));
        core.port().scheduler.set_timeout_result(true);
        core.port().hardware.set_now(Instant::from_micros(0));
        let token = core.lock();
        assert!(!core.unlock_with_wait_until(token, Instant::from_micros(10)));
    }

    #[test]
    fn degraded_timed_wait_polls_hardware() {
        let port = TestPort::new(StubHardware::on_core(1), Forbidden);
        port.hardware.set_now(Instant::from_micros(0));
        let core = Core::new(&port);
        let token = core.lock();
        assert!(!core.unlock_with_wait_until(token, Instant::from_micros(50)));
        assert_eq!(port.hardware.waits(), 1);
    }

    #[test]
    fn debug() {
        let core = Core::new(recording(1));
        let token = core.lock();
        core.unlock_with_wait(token);
        assert_eq!(
            format!("{core:?}"),
            "LockCore { spin: SpinLock { locked: false }, waiters: 0x2, .. }"
        );
    }
}
