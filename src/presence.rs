//! Whether a cooperative scheduler is running.
//!
//! Every operation in this crate reads the presence switch of its port on
//! each call. The value is never cached, since the scheduler may start or
//! stop on another core at any time.

use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::Ordering::{AcqRel, Acquire};

use crate::cfg::atomic::AtomicU8;

/// Lifecycle states of a [`SchedulerPresence`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// No scheduler has run yet.
    Boot = 0,
    /// The scheduler is running tasks.
    Running = 1,
    /// The scheduler ran and has been torn down.
    Stopped = 2,
}

impl State {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::Boot,
        }
    }
}

/// A process-wide switch telling the lock layer whether task-level blocking
/// is available.
///
/// [`activate`] and [`deactivate`] are the only two mutation points, and are
/// meant to be called by the scheduler's own startup and shutdown sequence.
/// Reads are plain atomic loads, safe from interrupt-masked sections on any
/// core.
///
/// [`activate`]: SchedulerPresence::activate
/// [`deactivate`]: SchedulerPresence::deactivate
pub struct SchedulerPresence {
    state: AtomicU8,
}

impl SchedulerPresence {
    /// Creates a new switch in the [`State::Boot`] state (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        Self { state: AtomicU8::new(State::Boot as u8) }
    }

    /// Creates a new switch in the [`State::Boot`] state (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        Self { state: AtomicU8::new(State::Boot as u8) }
    }

    /// Returns `true` if a scheduler is currently running tasks.
    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.state() == State::Running
    }

    /// Returns the current lifecycle state.
    #[inline]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Acquire))
    }

    /// Marks the scheduler as running.
    ///
    /// Returns `false` if it was already running.
    pub fn activate(&self) -> bool {
        let prev = State::from_u8(self.state.swap(State::Running as u8, AcqRel));
        let changed = prev != State::Running;
        if changed {
            log::debug!("scheduler presence: {prev:?} -> Running");
        }
        changed
    }

    /// Marks the scheduler as torn down, every primitive falls back to bare
    /// hardware waits.
    ///
    /// Returns `false` if it was not running.
    pub fn deactivate(&self) -> bool {
        let changed = self
            .state
            .compare_exchange(State::Running as u8, State::Stopped as u8, AcqRel, Acquire)
            .is_ok();
        if changed {
            log::debug!("scheduler presence: Running -> Stopped");
        }
        changed
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for SchedulerPresence {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SchedulerPresence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerPresence").field("state", &self.state()).finish()
    }
}

/// The process-wide presence switch, for ports that do not carry their own.
#[cfg(not(all(loom, test)))]
pub static PRESENCE: SchedulerPresence = SchedulerPresence::new();

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::{SchedulerPresence, State};

    #[test]
    fn lifecycle() {
        let presence = SchedulerPresence::new();
        assert_eq!(presence.state(), State::Boot);
        assert!(!presence.is_active());

        assert!(!presence.deactivate());
        assert_eq!(presence.state(), State::Boot);

        assert!(presence.activate());
        assert!(!presence.activate());
        assert!(presence.is_active());

        assert!(presence.deactivate());
        assert_eq!(presence.state(), State::Stopped);
        assert!(!presence.is_active());

        assert!(presence.activate());
        assert!(presence.is_active());
    }

    #[test]
    fn concurrent_readers_see_activation() {
        let presence = Arc::new(SchedulerPresence::new());
        let reader = {
            let presence = Arc::clone(&presence);
            thread::spawn(move || while !presence.is_active() { thread::yield_now() })
        };
        presence.activate();
        reader.join().unwrap();
    }

    #[test]
    fn debug() {
        let presence = SchedulerPresence::new();
        assert_eq!(format!("{presence:?}"), "SchedulerPresence { state: Boot }");
    }
}
