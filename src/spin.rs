//! Interrupt-masking spinlocks guarding the internal state of a primitive.

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicBool;
use crate::port::{Hardware, IrqState};
use crate::relax::{Relax, Spin};

/// A hardware-style spinlock: an atomic flag taken with interrupts masked on
/// the calling core.
///
/// Hold times must be a handful of instructions. Nothing that can block,
/// allocate or log may run while the lock is held.
pub struct SpinLock<R = Spin> {
    locked: AtomicBool,
    relax: PhantomData<R>,
}

/// Proof that a [`SpinLock`] is held, carrying the interrupt mask state to
/// restore when it is released.
///
/// A token is consumed by exactly one release operation. It is not `Send`,
/// since the saved mask belongs to the core that took the lock.
#[must_use = "a spinlock stays locked until its token is released"]
pub struct SpinToken {
    irq: IrqState,
    lock: *const (),
}

impl SpinToken {
    /// Returns the interrupt mask state saved on acquisition.
    pub const fn saved_irq(&self) -> IrqState {
        self.irq
    }
}

impl Debug for SpinToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinToken").field("irq", &self.irq).finish_non_exhaustive()
    }
}

impl<R> SpinLock<R> {
    /// Creates a new, unlocked spinlock (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        Self { locked: AtomicBool::new(false), relax: PhantomData }
    }

    /// Creates a new, unlocked spinlock (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        Self { locked: AtomicBool::new(false), relax: PhantomData }
    }

    /// Returns `true` if some core holds the lock.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }

    /// Releases the lock and restores the interrupt mask saved in `token`.
    pub fn unlock<H: Hardware + ?Sized>(&self, hw: &H, token: SpinToken) {
        debug_assert!(self.owns(&token), "token released on a foreign spinlock");
        debug_assert!(self.is_locked(), "spinlock released while not held");
        self.locked.store(false, Release);
        hw.restore_interrupts(token.irq);
    }

    fn owns(&self, token: &SpinToken) -> bool {
        core::ptr::eq(token.lock, self.addr())
    }

    fn addr(&self) -> *const () {
        (self as *const Self).cast()
    }

    fn token(&self, irq: IrqState) -> SpinToken {
        SpinToken { irq, lock: self.addr() }
    }

    fn try_acquire(&self) -> bool {
        self.locked.compare_exchange_weak(false, true, Acquire, Relaxed).is_ok()
    }
}

impl<R: Relax> SpinLock<R> {
    /// Masks interrupts and spins until the lock is taken.
    pub fn lock<H: Hardware + ?Sized>(&self, hw: &H) -> SpinToken {
        let irq = hw.save_and_disable_interrupts();
        let mut relax = R::new();
        while !self.try_acquire() {
            while self.is_locked() {
                relax.relax();
            }
        }
        self.token(irq)
    }

    /// Masks interrupts and takes the lock if it is free, restoring the mask
    /// otherwise.
    pub fn try_lock<H: Hardware + ?Sized>(&self, hw: &H) -> Option<SpinToken> {
        let irq = hw.save_and_disable_interrupts();
        if self.locked.compare_exchange(false, true, Acquire, Relaxed).is_ok() {
            Some(self.token(irq))
        } else {
            hw.restore_interrupts(irq);
            None
        }
    }
}

#[cfg(not(tarpaulin_include))]
impl<R> Default for SpinLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for SpinLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock").field("locked", &self.is_locked()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    use super::SpinLock;
    use crate::port::IrqState;
    use crate::relax::{SpinBackoff, Yield};
    use crate::test::StubHardware;

    #[test]
    fn masks_and_restores_interrupts() {
        let hw = StubHardware::on_core(0);
        let lock = SpinLock::<Yield>::new();
        assert!(hw.interrupts_enabled());
        let token = lock.lock(&hw);
        assert!(!hw.interrupts_enabled());
        assert_eq!(token.saved_irq(), IrqState(1));
        lock.unlock(&hw, token);
        assert!(hw.interrupts_enabled());
    }

    #[test]
    fn nested_masks_restore_in_order() {
        let hw = StubHardware::on_core(0);
        let outer = SpinLock::<Yield>::new();
        let inner = SpinLock::<Yield>::new();
        let t1 = outer.lock(&hw);
        let t2 = inner.lock(&hw);
        inner.unlock(&hw, t2);
        assert!(!hw.interrupts_enabled());
        outer.unlock(&hw, t1);
        assert!(hw.interrupts_enabled());
    }

    #[test]
    fn try_lock_contended() {
        let hw = StubHardware::on_core(0);
        let lock = SpinLock::<Yield>::new();
        let token = lock.try_lock(&hw).unwrap();
        assert!(lock.try_lock(&hw).is_none());
        assert!(!hw.interrupts_enabled());
        lock.unlock(&hw, token);
        let token = lock.try_lock(&hw).unwrap();
        lock.unlock(&hw, token);
        assert!(hw.interrupts_enabled());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "foreign spinlock")]
    fn foreign_token_is_rejected() {
        let hw = StubHardware::on_core(0);
        let a = SpinLock::<Yield>::new();
        let b = SpinLock::<Yield>::new();
        let token = a.lock(&hw);
        let _other = b.lock(&hw);
        b.unlock(&hw, token);
    }

    #[test]
    fn excludes_across_threads() {
        const ITERS: usize = 2_000;
        let lock = Arc::new(SpinLock::<SpinBackoff>::new());
        let count = Arc::new(core::sync::atomic::AtomicUsize::new(0));
        let handles: Vec<_> = (0..2u8)
            .map(|core| {
                let (lock, count) = (Arc::clone(&lock), Arc::clone(&count));
                thread::spawn(move || {
                    let hw = StubHardware::on_core(core);
                    for _ in 0..ITERS {
                        let token = lock.lock(&hw);
                        let seen = count.load(core::sync::atomic::Ordering::Relaxed);
                        count.store(seen + 1, core::sync::atomic::Ordering::Relaxed);
                        lock.unlock(&hw, token);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(count.load(core::sync::atomic::Ordering::Relaxed), 2 * ITERS);
    }

    #[test]
    fn debug() {
        let lock = SpinLock::<Yield>::new();
        assert_eq!(format!("{lock:?}"), "SpinLock { locked: false }");
    }
}
