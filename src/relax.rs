// Modified version of relax.rs from spin-rs, with Loom yielding and
// exponential backoff, adapted to relax cores contending for a hardware
// spinlock.
//
// Original file at its most recent change (at the time of writing):
// https://github.com/mvdnes/spin-rs/blob/5860ee114094cf200b97348ff332155fbd7159b4/src/relax.rs
//
// Copyright (c) 2014 Mathijs van de Nes
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Strategies that determine how a core behaves while it busy-waits.
//!
//! Relax policies are used in two places: while contending for a
//! [`SpinLock`], and by the host emulation while polling a simulated event
//! register. They are never used to wait for a protected primitive to become
//! available, that is the job of the unlock-and-wait protocol in
//! [`lock_core`].
//!
//! [`SpinLock`]: crate::spin::SpinLock
//! [`lock_core`]: crate::lock_core

use crate::cfg::hint;

#[cfg(any(feature = "std", test))]
use crate::cfg::thread;

/// A trait implemented by spinning relax strategies.
///
/// # Example
///
/// ```
/// use coopwait::relax::Relax;
///
/// struct Nop;
///
/// impl Relax for Nop {
///     #[inline(always)]
///     fn new() -> Self {
///         Self
///     }
///
///     #[inline(always)]
///     fn relax(&mut self) {}
/// }
/// ```
pub trait Relax {
    /// Returns the initial value for this relaxing strategy.
    fn new() -> Self;

    /// Performs the relaxing operation during a period of contention.
    fn relax(&mut self);
}

/// A strategy that rapidly spins while informing the CPU that it should power
/// down non-essential components via [`core::hint::spin_loop`].
///
/// This is the right choice for hardware spinlocks, which are only ever held
/// for a handful of instructions with interrupts masked.
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        hint::spin_loop();
    }
}

/// A strategy that yields the current time slice to the OS scheduler.
///
/// Only meaningful when simulating cores with OS threads, where a pure
/// spin would starve the thread that holds the lock.
#[cfg(any(feature = "std", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub struct Yield;

#[cfg(any(feature = "std", test))]
impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        thread::yield_now();
    }
}

// Exponential backoff is based on the crossbeam-utils implementation.
// link to most recent change (as the time of writing):
// https://github.com/crossbeam-rs/crossbeam/blob/371de8c2d304db07662450995848f3dc9598ac99/crossbeam-utils/src/backoff.rs
//
// Copyright (c) 2019 The Crossbeam Project Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

/// An unsigned integer type use as the inner type for [`SpinBackoff`].
type Uint = u32;

/// A strategy that, as [`Spin`], will run a busy-wait spin-loop, except this
/// implementation will perform exponential backoff.
///
/// Backing off reduces traffic on the spinlock register when both cores
/// hammer the same lock.
pub struct SpinBackoff {
    shifts: Uint,
}

impl SpinBackoff {
    /// The largest value the shift counter can reach.
    const MAX: Uint = 6;
}

// The maximum shift **must** be smaller than Uint::BITS, or else the bitshift
// operation will overflow.
const _: () = assert!(SpinBackoff::MAX < Uint::BITS);

impl Relax for SpinBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { shifts: 0 }
    }

    #[inline(always)]
    fn relax(&mut self) {
        for _ in 0..(1 << self.shifts.min(Self::MAX)) {
            hint::spin_loop();
        }
        (self.shifts < Self::MAX).then(|| self.shifts += 1);
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Relax, SpinBackoff, Uint};

    fn returns<R: Relax, const MAX: Uint>() {
        let mut relax = R::new();
        for _ in 0..=MAX.saturating_mul(10) {
            relax.relax();
        }
    }

    #[test]
    fn spins() {
        returns::<super::Spin, 10>();
    }

    #[test]
    fn spins_backoff() {
        returns::<SpinBackoff, { SpinBackoff::MAX }>();
    }

    #[test]
    fn backoff_saturates() {
        let mut relax = SpinBackoff::new();
        for _ in 0..SpinBackoff::MAX * 4 {
            relax.relax();
        }
        assert_eq!(relax.shifts, SpinBackoff::MAX);
    }

    #[test]
    fn yields() {
        returns::<super::Yield, 10>();
    }
}
