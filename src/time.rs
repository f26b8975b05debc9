//! Absolute monotonic time, as seen by the lock layer.
//!
//! Time is expressed as microseconds since boot, which is what the timer
//! peripheral of the target exposes. The clock itself is provided by the
//! [`Hardware`] implementation.
//!
//! [`Hardware`]: crate::port::Hardware

use core::fmt::{self, Display, Formatter};
use core::ops::Add;
use core::time::Duration;

use crate::port::{Hardware, Port};
use crate::yielding::yield_until_before;

/// An absolute point in monotonic time, in microseconds since boot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Instant(u64);

/// An absolute bound after which a bounded wait must have returned.
pub type Deadline = Instant;

impl Instant {
    /// The boot instant.
    pub const NIL: Self = Self(0);

    /// A deadline that is never reached.
    pub const AT_THE_END_OF_TIME: Self = Self(u64::MAX);

    /// Creates an instant from microseconds since boot.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Returns the number of microseconds since boot.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Returns `true` if this instant is at or before `now`.
    #[must_use]
    #[inline(always)]
    pub const fn is_reached(self, now: Self) -> bool {
        now.0 >= self.0
    }

    /// Returns the amount of time elapsed from `earlier` to `self`, or zero
    /// if `earlier` is later than `self`.
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// Adds `duration` to this instant, saturating at
    /// [`AT_THE_END_OF_TIME`](Self::AT_THE_END_OF_TIME).
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(micros))
    }
}

impl Add<Duration> for Instant {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Duration) -> Self {
        self.saturating_add(rhs)
    }
}

impl Display for Instant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Sleeps until the hardware clock reaches `deadline`.
///
/// Between polls of the clock the caller issues [`yield_until_before`], so
/// other tasks run while a scheduler is active. Without a scheduler this
/// busy-waits. Returns immediately for a deadline in the past.
pub fn sleep_until<P: Port + ?Sized>(port: &P, deadline: Deadline) {
    while !deadline.is_reached(port.hardware().now()) {
        yield_until_before(port, deadline);
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::time::Duration;

    use super::Instant;

    #[test]
    fn deadline_ordering() {
        let early = Instant::from_micros(10);
        let late = Instant::from_micros(20);
        assert!(early < late);
        assert!(early.is_reached(late));
        assert!(early.is_reached(early));
        assert!(!late.is_reached(early));
    }

    #[test]
    fn addition_saturates() {
        let near_end = Instant::from_micros(u64::MAX - 1);
        assert_eq!(near_end + Duration::from_secs(1), Instant::AT_THE_END_OF_TIME);
        assert_eq!(Instant::NIL + Duration::from_millis(3), Instant::from_micros(3_000));
    }

    #[test]
    fn duration_since_is_saturating() {
        let a = Instant::from_micros(5);
        let b = Instant::from_micros(12);
        assert_eq!(b.saturating_duration_since(a), Duration::from_micros(7));
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
    }

    #[test]
    fn end_of_time_is_never_reached() {
        assert!(!Instant::AT_THE_END_OF_TIME.is_reached(Instant::from_micros(u64::MAX - 1)));
    }
}
