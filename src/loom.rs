//! A Loom port and the models exercising the unlock-and-wait protocol.
//!
//! Waits in this port never return spuriously: a core only leaves
//! wait-for-event once its event register is set, and a task only leaves a
//! block once it holds a wake permit. A lost notification therefore shows up
//! as a deadlock in some interleaving.

use core::cell::Cell;

use loom::sync::atomic::AtomicBool;
use loom::sync::atomic::Ordering::{AcqRel, Release};
use loom::thread;

use crate::owner::OwnerId;
use crate::port::{Hardware, IrqState, Port, Scheduler};
use crate::presence::SchedulerPresence;
use crate::time::{Deadline, Instant};

/// Cores, and tasks, of the modeled machine.
const SLOTS: usize = 2;

loom::thread_local! {
    static SLOT: Cell<Option<u8>> = Cell::new(None);
}

/// Binds the calling Loom thread to core `slot`, which also runs task
/// `slot`.
fn enter(slot: u8) {
    SLOT.with(|current| current.set(Some(slot)));
}

fn slot() -> Option<usize> {
    SLOT.with(Cell::get).map(usize::from)
}

fn latches() -> [AtomicBool; SLOTS] {
    core::array::from_fn(|_| AtomicBool::new(false))
}

/// Cores whose wait-for-event spins on a per-core event register.
pub struct LoomHardware {
    events: [AtomicBool; SLOTS],
}

impl Hardware for LoomHardware {
    fn core_num(&self) -> u8 {
        SLOT.with(Cell::get).unwrap_or(0)
    }

    fn save_and_disable_interrupts(&self) -> IrqState {
        IrqState(1)
    }

    fn restore_interrupts(&self, _: IrqState) {}

    fn wait_for_event(&self) {
        let core = usize::from(self.core_num());
        while !self.events[core].swap(false, AcqRel) {
            thread::yield_now();
        }
    }

    fn send_event(&self) {
        for event in &self.events {
            event.store(true, Release);
        }
    }

    fn now(&self) -> Instant {
        Instant::NIL
    }
}

/// A scheduler whose blocked tasks spin on their wake permit.
pub struct SpinPark {
    permits: [AtomicBool; SLOTS],
}

impl SpinPark {
    fn park(&self, id: usize) {
        while !self.permits[id].swap(false, AcqRel) {
            thread::yield_now();
        }
    }
}

impl Scheduler for SpinPark {
    fn current_task_id(&self) -> OwnerId {
        // Bounded by `SLOTS`.
        slot().map_or(OwnerId::INVALID, |id| OwnerId::new(id as i16))
    }

    fn block_current_task(&self) {
        if let Some(id) = slot() {
            self.park(id);
        }
    }

    fn block_current_task_until(&self, _: Deadline) -> bool {
        self.block_current_task();
        false
    }

    fn wake_task(&self, task: OwnerId) {
        if let Some(permit) = usize::try_from(task.get()).ok().and_then(|id| self.permits.get(id)) {
            permit.store(true, Release);
        }
    }

    fn wake_all(&self) {
        for permit in &self.permits {
            permit.store(true, Release);
        }
    }

    fn yield_current_task(&self) {
        thread::yield_now();
    }
}

/// The modeled machine.
pub struct LoomPort {
    hardware: LoomHardware,
    scheduler: SpinPark,
    presence: SchedulerPresence,
}

impl LoomPort {
    /// Creates a machine, with its scheduler running if `active`.
    pub fn new(active: bool) -> Self {
        let hardware = LoomHardware { events: latches() };
        let scheduler = SpinPark { permits: latches() };
        let port = Self { hardware, scheduler, presence: SchedulerPresence::new() };
        if active {
            port.presence.activate();
        }
        port
    }
}

impl Port for LoomPort {
    type Hardware = LoomHardware;
    type Scheduler = SpinPark;

    fn hardware(&self) -> &LoomHardware {
        &self.hardware
    }

    fn scheduler(&self) -> &SpinPark {
        &self.scheduler
    }

    fn presence(&self) -> &SchedulerPresence {
        &self.presence
    }
}

pub mod models {
    use loom::sync::Arc;
    use loom::{model, thread};

    use super::{enter, LoomPort, SLOTS};
    use crate::mutex::Mutex;
    use crate::semaphore::Semaphore;

    type Int = usize;
    type SharedPort = std::sync::Arc<LoomPort>;

    /// Evaluates that contending `lock` calls serialize every mutation of
    /// the shared data, and that no contender is left waiting.
    pub fn lock_join(active: bool) {
        model(move || {
            let port = SharedPort::new(LoomPort::new(active));
            let mutex = Arc::new(Mutex::<Int, _>::new(0, port));
            let handles: [_; SLOTS] = core::array::from_fn(|slot| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    // Cast: bounded by `SLOTS`.
                    enter(slot as u8);
                    mutex.lock().with_mut(|data| *data += 1);
                })
            });
            for handle in handles {
                handle.join().unwrap();
            }
            enter(0);
            let data = mutex.lock().with(|data| *data);
            assert_eq!(SLOTS, data);
        });
    }

    /// Evaluates that a release racing with a blocking acquire always wakes
    /// the acquirer.
    pub fn release_wakes_acquirer(active: bool) {
        model(move || {
            let port = SharedPort::new(LoomPort::new(active));
            let sem = Arc::new(Semaphore::<_>::new(0, 1, port));
            let acquirer = {
                let sem = Arc::clone(&sem);
                thread::spawn(move || {
                    enter(0);
                    sem.acquire();
                })
            };
            let releaser = {
                let sem = Arc::clone(&sem);
                thread::spawn(move || {
                    enter(1);
                    assert!(sem.release());
                })
            };
            acquirer.join().unwrap();
            releaser.join().unwrap();
            assert!(!sem.try_acquire());
        });
    }
}
