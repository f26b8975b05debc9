//! Stub ports and shared test suites.
//!
//! The stubs are deliberately hostile: hardware waits return immediately, so
//! every wait is a spurious wakeup, and a forbidden scheduler panics if the
//! lock layer ever reaches for it in degraded mode.

use core::cell::Cell;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::{Relaxed, SeqCst};
use core::time::Duration;

use crate::owner::OwnerId;
use crate::port::{Hardware, IrqState, Port, Scheduler};
use crate::presence::SchedulerPresence;
use crate::time::{Deadline, Instant};

std::thread_local! {
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static TASK: Cell<Option<i16>> = const { Cell::new(None) };
}

static NEXT_TASK: core::sync::atomic::AtomicI16 = core::sync::atomic::AtomicI16::new(0);

/// Hardware whose waits return immediately and whose clock only moves when
/// told to.
pub struct StubHardware {
    core: u8,
    now: AtomicU64,
    step: AtomicU64,
    waits: AtomicU64,
    events: AtomicU64,
}

impl StubHardware {
    pub fn on_core(core: u8) -> Self {
        let zero = || AtomicU64::new(0);
        Self { core, now: zero(), step: zero(), waits: zero(), events: zero() }
    }

    pub fn set_now(&self, now: Instant) {
        self.now.store(now.as_micros(), SeqCst);
    }

    /// Advances the clock by `micros` after every read.
    pub fn set_step(&self, micros: u64) {
        self.step.store(micros, SeqCst);
    }

    /// Reads the clock without advancing it.
    pub fn peek(&self) -> Instant {
        Instant::from_micros(self.now.load(SeqCst))
    }

    pub fn waits(&self) -> u64 {
        self.waits.load(SeqCst)
    }

    pub fn events(&self) -> u64 {
        self.events.load(SeqCst)
    }

    pub fn interrupts_enabled(&self) -> bool {
        IRQ_ENABLED.with(Cell::get)
    }
}

impl Hardware for StubHardware {
    fn core_num(&self) -> u8 {
        self.core
    }

    fn save_and_disable_interrupts(&self) -> IrqState {
        IrqState(u32::from(IRQ_ENABLED.with(|irq| irq.replace(false))))
    }

    fn restore_interrupts(&self, state: IrqState) {
        IRQ_ENABLED.with(|irq| irq.set(state.0 != 0));
    }

    fn wait_for_event(&self) {
        self.waits.fetch_add(1, SeqCst);
        std::thread::yield_now();
    }

    fn send_event(&self) {
        self.events.fetch_add(1, SeqCst);
    }

    fn now(&self) -> Instant {
        let step = self.step.load(SeqCst);
        Instant::from_micros(self.now.fetch_add(step, SeqCst))
    }
}

/// A scheduler that must never be called.
pub struct Forbidden;

impl Scheduler for Forbidden {
    fn current_task_id(&self) -> OwnerId {
        panic!("scheduler reached: current_task_id")
    }

    fn block_current_task(&self) {
        panic!("scheduler reached: block_current_task")
    }

    fn block_current_task_until(&self, _: Deadline) -> bool {
        panic!("scheduler reached: block_current_task_until")
    }

    fn wake_task(&self, _: OwnerId) {
        panic!("scheduler reached: wake_task")
    }

    fn wake_all(&self) {
        panic!("scheduler reached: wake_all")
    }

    fn yield_current_task(&self) {
        panic!("scheduler reached: yield_current_task")
    }
}

/// A scheduler whose only task is `.0`, and whose blocks never block.
pub struct FixedTask(pub i16);

impl Scheduler for FixedTask {
    fn current_task_id(&self) -> OwnerId {
        OwnerId::new(self.0)
    }

    fn block_current_task(&self) {}

    fn block_current_task_until(&self, _: Deadline) -> bool {
        false
    }

    fn wake_task(&self, _: OwnerId) {}

    fn wake_all(&self) {}

    fn yield_current_task(&self) {}
}

/// A scheduler where every OS thread is a task and every block returns at
/// once: the maximal spurious wakeup scheduler.
pub struct Immediate;

impl Scheduler for Immediate {
    fn current_task_id(&self) -> OwnerId {
        let id = TASK.with(|task| match task.get() {
            Some(id) => id,
            None => {
                let id = NEXT_TASK.fetch_add(1, Relaxed);
                task.set(Some(id));
                id
            }
        });
        OwnerId::new(id)
    }

    fn block_current_task(&self) {
        std::thread::yield_now();
    }

    fn block_current_task_until(&self, _: Deadline) -> bool {
        std::thread::yield_now();
        false
    }

    fn wake_task(&self, _: OwnerId) {}

    fn wake_all(&self) {}

    fn yield_current_task(&self) {
        std::thread::yield_now();
    }
}

/// A scheduler call, as seen by [`Recording`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Call {
    Block,
    BlockUntil(Deadline),
    Wake(i16),
    WakeAll,
    Yield,
}

/// A single-task scheduler that records the calls it receives.
pub struct Recording {
    task: i16,
    timeout: std::sync::atomic::AtomicBool,
    calls: std::sync::Mutex<std::vec::Vec<Call>>,
}

impl Recording {
    pub fn new(task: i16) -> Self {
        let timeout = std::sync::atomic::AtomicBool::new(false);
        Self { task, timeout, calls: Default::default() }
    }

    /// Sets what `block_current_task_until` reports.
    pub fn set_timeout_result(&self, timed_out: bool) {
        self.timeout.store(timed_out, SeqCst);
    }

    pub fn calls(&self) -> std::vec::Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Scheduler for Recording {
    fn current_task_id(&self) -> OwnerId {
        OwnerId::new(self.task)
    }

    fn block_current_task(&self) {
        self.record(Call::Block);
    }

    fn block_current_task_until(&self, deadline: Deadline) -> bool {
        self.record(Call::BlockUntil(deadline));
        self.timeout.load(SeqCst)
    }

    fn wake_task(&self, task: OwnerId) {
        self.record(Call::Wake(task.get()));
    }

    fn wake_all(&self) {
        self.record(Call::WakeAll);
    }

    fn yield_current_task(&self) {
        self.record(Call::Yield);
    }
}

/// A port assembled from stub parts, with its own presence switch.
pub struct TestPort<H, S> {
    pub hardware: H,
    pub scheduler: S,
    pub presence: SchedulerPresence,
}

impl<H, S> TestPort<H, S> {
    pub fn new(hardware: H, scheduler: S) -> Self {
        Self { hardware, scheduler, presence: SchedulerPresence::new() }
    }
}

impl<H: Hardware, S: Scheduler> Port for TestPort<H, S> {
    type Hardware = H;
    type Scheduler = S;

    fn hardware(&self) -> &H {
        &self.hardware
    }

    fn scheduler(&self) -> &S {
        &self.scheduler
    }

    fn presence(&self) -> &SchedulerPresence {
        &self.presence
    }
}

/// An arbitrary unsigned integer type.
pub type Int = u32;

/// A watchdog bound for tests that must not stall.
pub const WATCHDOG: Duration = Duration::from_secs(30);

pub mod tests {
    //! Suites shared by every port flavor.

    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;

    use super::{Int, WATCHDOG};
    use crate::mutex::Mutex;
    use crate::port::Port;
    use crate::relax::Yield;

    /// Runs `threads` OS threads, each incrementing a shared counter
    /// `iters` times, and returns the final count. `enter` runs first on
    /// every thread, with its index.
    pub fn lots_and_lots<P, F>(port: P, threads: u8, iters: Int, enter: F) -> Int
    where
        P: Port + Send + Sync + 'static,
        F: Fn(u8) + Send + Sync + Clone + 'static,
    {
        let mutex = Arc::new(Mutex::<Int, P, Yield>::new(0, port));
        let (tx, rx) = channel();
        for index in 0..threads {
            let (mutex, tx, enter) = (Arc::clone(&mutex), tx.clone(), enter.clone());
            thread::spawn(move || {
                enter(index);
                for _ in 0..iters {
                    *mutex.lock() += 1;
                }
                tx.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..threads {
            rx.recv_timeout(WATCHDOG).expect("lock stalled past the watchdog");
        }
        let count = *mutex.lock();
        count
    }
}
