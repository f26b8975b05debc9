//! The capabilities the lock layer needs from its environment.
//!
//! A [`Port`] bundles the bare hardware ([`Hardware`]), the cooperative
//! scheduler ([`Scheduler`]) and the presence switch that selects between
//! them. Primitives are generic over their port, so a firmware build can
//! plug in zero-sized ports backed by registers while tests plug in
//! simulated ones.

use crate::owner::OwnerId;
use crate::presence::SchedulerPresence;
use crate::time::{Deadline, Instant};

#[cfg(not(all(loom, test)))]
use crate::presence::PRESENCE;

/// The interrupt mask state saved when a spinlock was acquired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct IrqState(pub u32);

/// Bare hardware operations of one processor.
pub trait Hardware {
    /// Returns the number of the core executing the caller.
    fn core_num(&self) -> u8;

    /// Masks interrupts on the calling core and returns the previous state.
    fn save_and_disable_interrupts(&self) -> IrqState;

    /// Restores an interrupt mask state returned by
    /// [`save_and_disable_interrupts`](Hardware::save_and_disable_interrupts).
    fn restore_interrupts(&self, state: IrqState);

    /// Waits for an event, as the `WFE` instruction does.
    ///
    /// May return spuriously at any time. Returns immediately if an event was
    /// signaled since the last call on this core.
    fn wait_for_event(&self);

    /// Signals an event to every core, as the `SEV` instruction does.
    fn send_event(&self);

    /// Returns the current time.
    fn now(&self) -> Instant;

    /// Waits for an event, but no longer than until `deadline`.
    ///
    /// Returns `true` if the deadline has been reached. The default relies
    /// on [`wait_for_event`](Hardware::wait_for_event) being woken by a
    /// periodic timer event, implementations with an alarm peripheral should
    /// arm it for `deadline` instead.
    fn wait_for_event_until(&self, deadline: Deadline) -> bool {
        if deadline.is_reached(self.now()) {
            return true;
        }
        self.wait_for_event();
        deadline.is_reached(self.now())
    }
}

/// The wait, notify, timeout and yield interface of a cooperative scheduler.
///
/// Blocking follows a wake-permit contract: a [`wake_task`] issued for a task
/// that is not blocked yet is remembered, and the next [`block_current_task`]
/// or [`block_current_task_until`] of that task returns immediately. This is
/// what lets the lock layer release its spinlock before blocking without
/// losing a notification.
///
/// [`wake_task`]: Scheduler::wake_task
/// [`block_current_task`]: Scheduler::block_current_task
/// [`block_current_task_until`]: Scheduler::block_current_task_until
pub trait Scheduler {
    /// Returns the id of the running task, or [`OwnerId::INVALID`] when
    /// called outside of any task.
    fn current_task_id(&self) -> OwnerId;

    /// Suspends the running task until it is woken.
    ///
    /// May return spuriously.
    fn block_current_task(&self);

    /// Suspends the running task until it is woken or `deadline` passes.
    ///
    /// Returns `true` only if the deadline has passed.
    fn block_current_task_until(&self, deadline: Deadline) -> bool;

    /// Wakes `task`, or grants it a wake permit if it is not blocked.
    fn wake_task(&self, task: OwnerId);

    /// Wakes every blocked task.
    fn wake_all(&self);

    /// Gives up the processor until the scheduler picks this task again.
    fn yield_current_task(&self);

    /// Gives up the processor, expecting to resume before `deadline`.
    ///
    /// By default this is a single yield.
    fn yield_until_before(&self, deadline: Deadline) {
        let _ = deadline;
        self.yield_current_task();
    }
}

/// The environment a primitive runs in.
pub trait Port {
    /// The hardware of the processor.
    type Hardware: Hardware + ?Sized;

    /// The cooperative scheduler that may run on top of it.
    type Scheduler: Scheduler + ?Sized;

    /// Returns the hardware operations.
    fn hardware(&self) -> &Self::Hardware;

    /// Returns the scheduler operations.
    fn scheduler(&self) -> &Self::Scheduler;

    /// Returns the switch selecting between bare hardware and task-level
    /// behavior.
    ///
    /// By default this is the process-wide [`PRESENCE`].
    #[cfg(not(all(loom, test)))]
    fn presence(&self) -> &SchedulerPresence {
        &PRESENCE
    }

    /// Returns the switch selecting between bare hardware and task-level
    /// behavior.
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    fn presence(&self) -> &SchedulerPresence;
}

impl<P: Port + ?Sized> Port for &P {
    type Hardware = P::Hardware;
    type Scheduler = P::Scheduler;

    #[inline(always)]
    fn hardware(&self) -> &Self::Hardware {
        (**self).hardware()
    }

    #[inline(always)]
    fn scheduler(&self) -> &Self::Scheduler {
        (**self).scheduler()
    }

    #[inline(always)]
    fn presence(&self) -> &SchedulerPresence {
        (**self).presence()
    }
}

#[cfg(any(feature = "std", test))]
impl<P: Port + ?Sized> Port for std::sync::Arc<P> {
    type Hardware = P::Hardware;
    type Scheduler = P::Scheduler;

    #[inline(always)]
    fn hardware(&self) -> &Self::Hardware {
        (**self).hardware()
    }

    #[inline(always)]
    fn scheduler(&self) -> &Self::Scheduler {
        (**self).scheduler()
    }

    #[inline(always)]
    fn presence(&self) -> &SchedulerPresence {
        (**self).presence()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Hardware, Port};
    use crate::presence::PRESENCE;
    use crate::test::{Forbidden, StubHardware};
    use crate::time::Instant;

    struct GlobalPort(StubHardware);

    impl Port for GlobalPort {
        type Hardware = StubHardware;
        type Scheduler = Forbidden;

        fn hardware(&self) -> &StubHardware {
            &self.0
        }

        fn scheduler(&self) -> &Forbidden {
            &Forbidden
        }
    }

    #[test]
    fn default_presence_is_process_wide() {
        let port = GlobalPort(StubHardware::on_core(0));
        assert!(core::ptr::eq(port.presence(), &PRESENCE));
        assert!(core::ptr::eq((&port).presence(), &PRESENCE));
    }

    #[test]
    fn wait_for_event_until_past_deadline() {
        let hw = StubHardware::on_core(0);
        hw.set_now(Instant::from_micros(100));
        assert!(hw.wait_for_event_until(Instant::from_micros(100)));
        assert_eq!(hw.waits(), 0);
    }

    #[test]
    fn wait_for_event_until_future_deadline() {
        let hw = StubHardware::on_core(0);
        hw.set_now(Instant::from_micros(100));
        assert!(!hw.wait_for_event_until(Instant::from_micros(200)));
        assert_eq!(hw.waits(), 1);
    }
}
