use std::boxed::Box;
use std::cell::Cell;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{AcqRel, Release};

use crate::port::{Hardware, IrqState};
use crate::relax::{Relax, Yield};
use crate::time::{Deadline, Instant};

use super::clock;

/// How many times an idle core checks its event register before it reports
/// a spurious wakeup.
const WFE_POLLS: u32 = 64;

std::thread_local! {
    static CORE: Cell<u8> = const { Cell::new(0) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Simulated processors with one event register per core.
///
/// Every OS thread runs on core 0 until it calls [`enter_core`]. Interrupt
/// masking only toggles a per-thread flag, since there are no interrupts to
/// mask.
///
/// [`enter_core`]: HostHardware::enter_core
pub struct HostHardware {
    events: Box<[AtomicBool]>,
}

impl HostHardware {
    /// Creates `cores` simulated cores.
    ///
    /// # Panics
    ///
    /// Panics if `cores` is zero.
    pub fn new(cores: u8) -> Self {
        assert!(cores > 0, "a machine needs at least one core");
        let events = (0..cores).map(|_| AtomicBool::new(false)).collect();
        Self { events }
    }

    /// Returns the number of simulated cores.
    pub fn cores(&self) -> u8 {
        // The length came from a `u8`.
        self.events.len() as u8
    }

    /// Pins the calling thread to `core`.
    ///
    /// # Panics
    ///
    /// Panics if `core` does not exist.
    pub fn enter_core(&self, core: u8) {
        assert!(core < self.cores(), "core {core} out of {}", self.cores());
        CORE.with(|current| current.set(core));
    }

    /// Returns `true` if interrupts are enabled on the calling thread.
    pub fn interrupts_enabled(&self) -> bool {
        IRQ_ENABLED.with(Cell::get)
    }

    /// Clears the event register of the calling core, returning whether an
    /// event was pending.
    fn take_event(&self) -> bool {
        let core = usize::from(self.core_num());
        self.events[core].swap(false, AcqRel)
    }
}

impl Hardware for HostHardware {
    fn core_num(&self) -> u8 {
        CORE.with(Cell::get)
    }

    fn save_and_disable_interrupts(&self) -> IrqState {
        IrqState(u32::from(IRQ_ENABLED.with(|irq| irq.replace(false))))
    }

    fn restore_interrupts(&self, state: IrqState) {
        IRQ_ENABLED.with(|irq| irq.set(state.0 != 0));
    }

    fn wait_for_event(&self) {
        let mut relax = Yield::new();
        for _ in 0..WFE_POLLS {
            if self.take_event() {
                return;
            }
            relax.relax();
        }
    }

    fn send_event(&self) {
        for event in self.events.iter() {
            event.store(true, Release);
        }
    }

    fn now(&self) -> Instant {
        clock()
    }

    fn wait_for_event_until(&self, deadline: Deadline) -> bool {
        let mut relax = Yield::new();
        loop {
            if deadline.is_reached(self.now()) {
                return true;
            }
            if self.take_event() {
                return deadline.is_reached(self.now());
            }
            relax.relax();
        }
    }
}

impl core::fmt::Debug for HostHardware {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostHardware").field("cores", &self.cores()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::HostHardware;
    use crate::port::Hardware;

    #[test]
    fn cores_are_per_thread() {
        let hw = Arc::new(HostHardware::new(2));
        assert_eq!(hw.core_num(), 0);
        let other = Arc::clone(&hw);
        let core = thread::spawn(move || {
            other.enter_core(1);
            other.core_num()
        });
        assert_eq!(core.join().unwrap(), 1);
        assert_eq!(hw.core_num(), 0);
    }

    #[test]
    #[should_panic(expected = "core 2 out of 2")]
    fn enter_missing_core() {
        HostHardware::new(2).enter_core(2);
    }

    #[test]
    fn irq_mask_nests() {
        let hw = HostHardware::new(1);
        let outer = hw.save_and_disable_interrupts();
        let inner = hw.save_and_disable_interrupts();
        assert!(!hw.interrupts_enabled());
        hw.restore_interrupts(inner);
        assert!(!hw.interrupts_enabled());
        hw.restore_interrupts(outer);
        assert!(hw.interrupts_enabled());
    }

    #[test]
    fn pending_event_is_latched() {
        let hw = HostHardware::new(2);
        hw.send_event();
        assert!(hw.take_event());
        assert!(!hw.take_event());
        // The other core still has its own copy.
        hw.enter_core(1);
        assert!(hw.take_event());
        hw.enter_core(0);
    }

    #[test]
    fn wait_until_deadline() {
        let hw = HostHardware::new(1);
        let deadline = hw.now() + Duration::from_millis(5);
        assert!(hw.wait_for_event_until(deadline));
        assert!(deadline.is_reached(hw.now()));
        hw.send_event();
        let far = hw.now() + Duration::from_secs(30);
        assert!(!hw.wait_for_event_until(far));
    }

    #[test]
    fn debug() {
        assert_eq!(format!("{:?}", HostHardware::new(4)), "HostHardware { cores: 4 }");
    }
}
