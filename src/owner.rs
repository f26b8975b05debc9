//! Identity of whoever holds a primitive.

use core::fmt::{self, Display, Formatter};

use crate::port::{Hardware, Port, Scheduler};

/// A small signed integer naming either a hardware core or a scheduler task.
///
/// Which of the two interpretations applies is decided by the
/// [`SchedulerPresence`] of the port at the time the id was resolved.
///
/// [`SchedulerPresence`]: crate::presence::SchedulerPresence
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct OwnerId(i16);

impl OwnerId {
    /// Marker value for "no valid owner".
    pub const INVALID: Self = Self(-1);

    /// Creates an owner id from its raw value.
    #[must_use]
    pub const fn new(raw: i16) -> Self {
        Self(raw)
    }

    /// Creates the owner id of hardware core `core`.
    #[must_use]
    pub const fn from_core(core: u8) -> Self {
        Self(core as i16)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> i16 {
        self.0
    }

    /// Returns `false` for [`OwnerId::INVALID`] and any other negative id.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("<none>")
        }
    }
}

/// Returns the owner id of the caller.
///
/// With an active scheduler this is the id of the running task, otherwise
/// it is the number of the executing core. Never blocks and takes no locks,
/// so it may be called while a spinlock is held.
#[inline]
pub fn resolve_owner<P: Port + ?Sized>(port: &P) -> OwnerId {
    if port.presence().is_active() {
        port.scheduler().current_task_id()
    } else {
        OwnerId::from_core(port.hardware().core_num())
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{resolve_owner, OwnerId};
    use crate::test::{FixedTask, StubHardware, TestPort};

    #[test]
    fn invalid_is_not_valid() {
        assert!(!OwnerId::INVALID.is_valid());
        assert!(OwnerId::from_core(0).is_valid());
        assert_eq!(OwnerId::default(), OwnerId::INVALID);
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", OwnerId::new(7)), "7");
        assert_eq!(format!("{}", OwnerId::INVALID), "<none>");
    }

    #[test]
    fn core_before_activation_task_after() {
        let port = TestPort::new(StubHardware::on_core(0), FixedTask(7));
        assert_eq!(resolve_owner(&port), OwnerId::new(0));
        port.presence.activate();
        assert_eq!(resolve_owner(&port), OwnerId::new(7));
        port.presence.deactivate();
        assert_eq!(resolve_owner(&port), OwnerId::new(0));
    }

    #[test]
    fn second_core() {
        let port = TestPort::new(StubHardware::on_core(1), FixedTask(3));
        assert_eq!(resolve_owner(&port), OwnerId::from_core(1));
    }
}
