//! A simulated multi-core machine for running the lock layer on a host OS.
//!
//! OS threads stand in for cores and for tasks. [`HostHardware`] emulates
//! the per-core event registers behind wait-for-event and send-event, the
//! interrupt mask and the boot-relative clock. [`TaskScheduler`] is a
//! cooperative scheduler in which only one task runs at a time, handing the
//! processor over when it yields or blocks. [`HostPort`] ties both to a
//! presence switch with explicit [`start`] and [`stop`] hooks.
//!
//! [`start`]: HostPort::start
//! [`stop`]: HostPort::stop

mod hardware;
mod scheduler;

use std::sync::OnceLock;
use std::time::Instant as StdInstant;

pub use hardware::HostHardware;
pub use scheduler::{Config, SchedulerError, TaskHandle, TaskScheduler};

use crate::port::Port;
use crate::presence::SchedulerPresence;
use crate::time::Instant;

/// The instant the simulated machine booted.
fn boot() -> StdInstant {
    static BOOT: OnceLock<StdInstant> = OnceLock::new();
    *BOOT.get_or_init(StdInstant::now)
}

/// Returns the time since boot.
pub(crate) fn clock() -> Instant {
    let micros = boot().elapsed().as_micros();
    Instant::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
}

/// Converts `instant` to a host instant.
///
/// Returns `None` for [`Instant::AT_THE_END_OF_TIME`], and for any instant
/// the host clock cannot represent.
pub(crate) fn to_host(instant: Instant) -> Option<StdInstant> {
    if instant == Instant::AT_THE_END_OF_TIME {
        return None;
    }
    boot().checked_add(std::time::Duration::from_micros(instant.as_micros()))
}

/// A simulated machine running a cooperative scheduler.
pub struct HostPort {
    /// The simulated cores.
    pub hardware: HostHardware,
    /// The scheduler multiplexing tasks on top of them.
    pub scheduler: TaskScheduler,
    presence: SchedulerPresence,
}

impl HostPort {
    /// Creates a machine with `cores` cores, whose scheduler is not started.
    pub fn new(cores: u8, config: Config) -> Self {
        let hardware = HostHardware::new(cores);
        let scheduler = TaskScheduler::new(config);
        Self { hardware, scheduler, presence: SchedulerPresence::new() }
    }

    /// Creates a dual-core machine with the default scheduler configuration.
    pub fn dual_core() -> Self {
        Self::new(2, Config::default())
    }

    /// Startup hook of the scheduler: primitives begin blocking tasks.
    ///
    /// Returns `false` if it was already started.
    pub fn start(&self) -> bool {
        log::debug!("{}: starting", self.scheduler.name());
        self.presence.activate()
    }

    /// Shutdown hook of the scheduler: primitives fall back to hardware
    /// waits.
    ///
    /// Returns `false` if it was not started.
    pub fn stop(&self) -> bool {
        log::debug!("{}: stopping", self.scheduler.name());
        self.presence.deactivate()
    }
}

impl Port for HostPort {
    type Hardware = HostHardware;
    type Scheduler = TaskScheduler;

    #[inline(always)]
    fn hardware(&self) -> &HostHardware {
        &self.hardware
    }

    #[inline(always)]
    fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    #[inline(always)]
    fn presence(&self) -> &SchedulerPresence {
        &self.presence
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use std::vec::Vec;

    use super::{clock, to_host, Config, HostPort, TaskHandle};
    use crate::mutex::Mutex;
    use crate::owner::{resolve_owner, OwnerId};
    use crate::port::{Hardware, Port, Scheduler};
    use crate::semaphore::Semaphore;
    use crate::test::tests::lots_and_lots;
    use crate::test::Int;
    use crate::time::{sleep_until, Instant};
    use crate::yielding::yield_until_before;

    const ITERS: Int = 10_000;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn clock_round_trips_through_host_instants() {
        let now = clock();
        let host = to_host(now).unwrap();
        assert!(host <= std::time::Instant::now());
        assert!(to_host(Instant::AT_THE_END_OF_TIME).is_none());
        assert!(to_host(now + std::time::Duration::from_secs(3_600)).is_some());
    }

    #[test]
    fn lifecycle_hooks() {
        let port = HostPort::dual_core();
        assert!(!port.presence().is_active());
        assert!(port.start());
        assert!(!port.start());
        assert!(port.presence().is_active());
        assert!(port.stop());
        assert!(!port.stop());
    }

    #[test]
    fn owner_follows_presence() {
        init_logger();
        let port = Arc::new(HostPort::dual_core());
        assert_eq!(resolve_owner(&port), OwnerId::from_core(0));
        port.start();
        let task_port = Arc::clone(&port);
        let task = port.scheduler.spawn(move || resolve_owner(&task_port)).unwrap();
        let id = task.id();
        assert_eq!(task.join().unwrap(), id);
        assert_eq!(resolve_owner(&port), OwnerId::INVALID);
    }

    #[test]
    fn two_cores_degraded_stress() {
        init_logger();
        let port = Arc::new(HostPort::dual_core());
        let hw = Arc::clone(&port);
        let count = lots_and_lots(port, 2, ITERS, move |core| hw.hardware.enter_core(core));
        assert_eq!(count, 2 * ITERS);
    }

    #[test]
    fn callers_outside_tasks_keep_exclusion() {
        init_logger();
        let port = Arc::new(HostPort::dual_core());
        port.start();
        let mutex = Arc::new(Mutex::<Int, _>::new(0, Arc::clone(&port)));
        let first = mutex.try_lock();
        assert!(first.is_some());
        assert!(mutex.try_lock().is_none());
        drop(first);
        let threads: Vec<_> = (0..2)
            .map(|core| {
                let (port, mutex) = (Arc::clone(&port), Arc::clone(&mutex));
                thread::spawn(move || {
                    port.hardware.enter_core(core);
                    for _ in 0..ITERS {
                        let mut guard = mutex.lock();
                        let read = *guard;
                        thread::yield_now();
                        *guard = read + 1;
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 2 * ITERS);
        assert!(port.presence().is_active());
    }

    #[test]
    fn tasks_active_stress() {
        init_logger();
        let port = Arc::new(HostPort::dual_core());
        port.start();
        let mutex = Arc::new(Mutex::<Int, _>::new(0, Arc::clone(&port)));
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let (task_port, mutex) = (Arc::clone(&port), Arc::clone(&mutex));
                let spawned = port.scheduler.spawn(move || {
                    for i in 0..ITERS {
                        let mut guard = mutex.lock();
                        *guard += 1;
                        if i % 64 == 0 {
                            // Hand the processor over while holding the
                            // mutex, so the other task contends.
                            task_port.scheduler().yield_current_task();
                        }
                    }
                });
                spawned.unwrap()
            })
            .collect();
        for task in tasks {
            task.join().unwrap();
        }
        port.stop();
        assert_eq!(*mutex.lock(), 2 * ITERS);
    }

    #[test]
    fn semaphore_ping_pong_never_stalls() {
        init_logger();
        const ROUNDS: usize = 2_000;
        let port = Arc::new(HostPort::dual_core());
        port.start();
        let ping = Arc::new(Semaphore::<_>::new(0, 1, Arc::clone(&port)));
        let pong = Arc::new(Semaphore::<_>::new(0, 1, Arc::clone(&port)));
        let a = {
            let (ping, pong) = (Arc::clone(&ping), Arc::clone(&pong));
            port.scheduler
                .spawn(move || {
                    for _ in 0..ROUNDS {
                        assert!(ping.release());
                        pong.acquire();
                    }
                })
                .unwrap()
        };
        let b = {
            let (ping, pong) = (Arc::clone(&ping), Arc::clone(&pong));
            port.scheduler
                .spawn(move || {
                    for _ in 0..ROUNDS {
                        ping.acquire();
                        assert!(pong.release());
                    }
                })
                .unwrap()
        };
        a.join().unwrap();
        b.join().unwrap();
    }

    /// Spawns a task holding `mutex` until `release` returns, which starts
    /// running once a contender has announced itself through `arrived`.
    fn spawn_holder<F>(
        port: &Arc<HostPort>,
        mutex: &Arc<Mutex<Int, Arc<HostPort>>>,
        arrived: &Arc<AtomicBool>,
        release: F,
    ) -> TaskHandle<()>
    where
        F: FnOnce(&Arc<HostPort>, &mut Int) + Send + 'static,
    {
        let (task_port, mutex, arrived) = (Arc::clone(port), Arc::clone(mutex), Arc::clone(arrived));
        let spawned = port.scheduler.spawn(move || {
            let mut guard = mutex.lock();
            while !arrived.load(SeqCst) {
                task_port.scheduler().yield_current_task();
            }
            release(&task_port, &mut *guard);
        });
        spawned.unwrap()
    }

    #[test]
    fn lock_until_reports_timeout_only_after_deadline() {
        init_logger();
        let port = Arc::new(HostPort::dual_core());
        port.start();
        let mutex = Arc::new(Mutex::new(0, Arc::clone(&port)));
        let arrived = Arc::new(AtomicBool::new(false));
        let holder = spawn_holder(&port, &mutex, &arrived, |port, _| {
            sleep_until(port, port.hardware.now() + Duration::from_millis(80));
        });
        let contender = {
            let (task_port, mutex, arrived) = (Arc::clone(&port), Arc::clone(&mutex), Arc::clone(&arrived));
            port.scheduler.spawn(move || {
                while !mutex.is_locked() {
                    task_port.scheduler().yield_current_task();
                }
                arrived.store(true, SeqCst);
                let deadline = task_port.hardware.now() + Duration::from_millis(20);
                let got = mutex.lock_until(deadline).is_some();
                (got, deadline, task_port.hardware.now())
            })
        };
        let (got, deadline, resumed) = contender.unwrap().join().unwrap();
        holder.join().unwrap();
        assert!(!got);
        assert!(deadline.is_reached(resumed));
    }

    #[test]
    fn lock_until_wakes_on_release_before_deadline() {
        let port = Arc::new(HostPort::dual_core());
        port.start();
        let mutex = Arc::new(Mutex::new(0, Arc::clone(&port)));
        let arrived = Arc::new(AtomicBool::new(false));
        let holder = spawn_holder(&port, &mutex, &arrived, |port, data| {
            for _ in 0..8 {
                port.scheduler().yield_current_task();
            }
            *data = 7;
        });
        let contender = {
            let (task_port, mutex, arrived) = (Arc::clone(&port), Arc::clone(&mutex), Arc::clone(&arrived));
            port.scheduler.spawn(move || {
                while !mutex.is_locked() {
                    task_port.scheduler().yield_current_task();
                }
                arrived.store(true, SeqCst);
                let deadline = task_port.hardware.now() + Duration::from_secs(30);
                mutex.lock_until(deadline).map(|guard| *guard)
            })
        };
        holder.join().unwrap();
        assert_eq!(contender.unwrap().join().unwrap(), Some(7));
    }

    #[test]
    fn yield_hint_resumes_within_a_tick() {
        let tick = Duration::from_millis(5);
        let port = Arc::new(HostPort::new(2, Config { tick, ..Config::default() }));
        port.start();
        let done = Arc::new(AtomicBool::new(false));
        let turns = Arc::new(AtomicUsize::new(0));
        let busy = {
            let (task_port, done, turns) = (Arc::clone(&port), Arc::clone(&done), Arc::clone(&turns));
            port.scheduler.spawn(move || {
                while !done.load(SeqCst) {
                    turns.fetch_add(1, SeqCst);
                    task_port.scheduler().yield_current_task();
                }
            })
        };
        let sleeper = {
            let (task_port, done, turns) = (Arc::clone(&port), Arc::clone(&done), Arc::clone(&turns));
            port.scheduler.spawn(move || {
                // A past deadline keeps the processor.
                let before = turns.load(SeqCst);
                yield_until_before(&task_port, task_port.hardware.now());
                assert_eq!(turns.load(SeqCst), before);
                let deadline = task_port.hardware.now() + Duration::from_millis(50);
                sleep_until(&task_port, deadline);
                let resumed = task_port.hardware.now();
                done.store(true, SeqCst);
                (deadline, resumed, turns.load(SeqCst) - before)
            })
        };
        let (deadline, resumed, handed_over) = sleeper.unwrap().join().unwrap();
        busy.unwrap().join().unwrap();
        assert!(handed_over > 0);
        assert!(deadline.is_reached(resumed));
        assert!(resumed.saturating_duration_since(deadline) <= tick);
    }
}
