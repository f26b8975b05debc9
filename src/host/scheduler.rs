use std::cell::Cell;
use std::collections::VecDeque;
use std::format;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::vec::Vec;

use crate::owner::OwnerId;
use crate::port::Scheduler;
use crate::time::Deadline;

use super::{clock, to_host};

std::thread_local! {
    /// The scheduler key and task index of the calling thread, if it is a
    /// task.
    static CURRENT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// Distinguishes the tasks of different schedulers living in one process.
static NEXT_KEY: AtomicUsize = AtomicUsize::new(0);

/// Tuning of a [`TaskScheduler`].
#[derive(Clone, Debug)]
pub struct Config {
    /// The scheduling granularity. A yield hint for a deadline closer than
    /// this returns without yielding.
    pub tick: Duration,
    /// The number of tasks that may be spawned over the scheduler lifetime.
    pub max_tasks: usize,
    /// Prefix of the task thread names, also used in log records.
    pub name: &'static str,
}

impl Default for Config {
    fn default() -> Self {
        Self { tick: Duration::from_millis(1), max_tasks: 32, name: "task" }
    }
}

/// Errors returned when spawning a task.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Every task slot is taken.
    #[error("too many tasks (max {max})")]
    TooManyTasks {
        /// The configured `max_tasks`.
        max: usize,
    },
    /// The host refused to create the task thread.
    #[error("failed to spawn task thread")]
    Spawn(#[from] std::io::Error),
}

#[derive(Default)]
struct Task {
    /// A wake arrived that no block consumed yet.
    permit: bool,
    blocked: bool,
    done: bool,
}

#[derive(Default)]
struct State {
    /// The task allowed to run.
    baton: Option<usize>,
    ready: VecDeque<usize>,
    tasks: Vec<Task>,
}

impl State {
    /// Hands the baton to the next ready task, if nobody holds it.
    fn dispatch(&mut self) {
        if self.baton.is_none() {
            self.baton = self.ready.pop_front();
        }
    }
}

struct Shared {
    config: Config,
    key: usize,
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.changed.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues task `id` and waits until it holds the baton.
    fn run<'a>(&self, mut state: MutexGuard<'a, State>, id: usize) -> MutexGuard<'a, State> {
        state.ready.push_back(id);
        state.dispatch();
        self.changed.notify_all();
        while state.baton != Some(id) {
            state = self.wait(state);
        }
        state
    }

    /// Gives up the baton held by task `id`.
    fn release(&self, state: &mut State, id: usize) {
        if state.baton == Some(id) {
            state.baton = None;
            state.dispatch();
            self.changed.notify_all();
        }
    }

    /// Waits for a permit of task `id`, or until `until` if given.
    ///
    /// Returns `true` if a permit was consumed.
    fn await_permit<'a>(
        &self,
        mut state: MutexGuard<'a, State>,
        id: usize,
        until: Option<std::time::Instant>,
    ) -> (MutexGuard<'a, State>, bool) {
        while !state.tasks[id].permit {
            state = match until {
                None => self.wait(state),
                Some(until) => {
                    let now = std::time::Instant::now();
                    if now >= until {
                        return (state, false);
                    }
                    let wait = self.changed.wait_timeout(state, until - now);
                    wait.unwrap_or_else(PoisonError::into_inner).0
                }
            };
        }
        state.tasks[id].permit = false;
        (state, true)
    }

    /// Suspends task `id` until woken, or until `deadline` if given.
    ///
    /// Returns `true` if woken.
    fn block(&self, id: usize, deadline: Option<Deadline>) -> bool {
        let mut state = self.lock();
        if state.tasks[id].permit {
            state.tasks[id].permit = false;
            return true;
        }
        state.tasks[id].blocked = true;
        self.release(&mut state, id);
        log::trace!("{}-{id}: blocked", self.config.name);
        // `AT_THE_END_OF_TIME` has no host instant and is never reached.
        let until = deadline.and_then(to_host);
        let (mut state, woken) = self.await_permit(state, id, until);
        state.tasks[id].blocked = false;
        log::trace!("{}-{id}: resumed (woken: {woken})", self.config.name);
        drop(self.run(state, id));
        woken
    }

    fn wake(&self, task: &mut Task) {
        if !task.done {
            task.permit = true;
        }
    }
}

/// Releases the baton when a task returns or unwinds.
struct Exit<'a> {
    shared: &'a Shared,
    id: usize,
}

impl Drop for Exit<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.tasks[self.id].done = true;
        self.shared.release(&mut state, self.id);
        CURRENT.with(|current| current.set(None));
        log::trace!("{}-{}: exited", self.shared.config.name, self.id);
    }
}

/// A cooperative scheduler running each task on its own OS thread.
///
/// Only the task holding the baton runs. It keeps it until it yields, blocks
/// or returns, after which the longest waiting ready task takes over. Waking
/// follows the wake-permit contract of [`Scheduler`].
#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<Shared>,
}

impl TaskScheduler {
    /// Creates a scheduler with no tasks.
    ///
    /// # Panics
    ///
    /// Panics if `config.max_tasks` does not fit in a task id.
    pub fn new(config: Config) -> Self {
        let max = usize::try_from(i16::MAX).unwrap_or(usize::MAX);
        assert!(config.max_tasks <= max, "max_tasks exceeds the task id range");
        let key = NEXT_KEY.fetch_add(1, Relaxed);
        let state = Mutex::new(State::default());
        let shared = Shared { config, key, state, changed: Condvar::new() };
        Self { shared: Arc::new(shared) }
    }

    /// Returns the configured name of this scheduler.
    pub fn name(&self) -> &'static str {
        self.shared.config.name
    }

    /// Spawns a task running `f`.
    ///
    /// The task starts running once it is handed the baton.
    pub fn spawn<F, T>(&self, f: F) -> Result<TaskHandle<T>, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = {
            let mut state = self.shared.lock();
            let max = self.shared.config.max_tasks;
            if state.tasks.len() >= max {
                return Err(SchedulerError::TooManyTasks { max });
            }
            state.tasks.push(Task::default());
            state.tasks.len() - 1
        };
        let shared = Arc::clone(&self.shared);
        let builder = thread::Builder::new().name(format!("{}-{id}", self.name()));
        let thread = builder
            .spawn(move || {
                CURRENT.with(|current| current.set(Some((shared.key, id))));
                let exit = Exit { shared: &shared, id };
                drop(shared.run(shared.lock(), id));
                let out = f();
                drop(exit);
                out
            })
            .inspect_err(|_| self.shared.lock().tasks[id].done = true)?;
        log::debug!("{}-{id}: spawned", self.name());
        // Bounded by `max_tasks`.
        let owner = OwnerId::new(id as i16);
        Ok(TaskHandle { id: owner, thread })
    }

    /// Returns the index of the calling task, if it belongs to this
    /// scheduler.
    fn current(&self) -> Option<usize> {
        match CURRENT.with(Cell::get) {
            Some((key, id)) if key == self.shared.key => Some(id),
            _ => None,
        }
    }
}

impl Scheduler for TaskScheduler {
    fn current_task_id(&self) -> OwnerId {
        // Bounded by `max_tasks`.
        self.current().map_or(OwnerId::INVALID, |id| OwnerId::new(id as i16))
    }

    fn block_current_task(&self) {
        if let Some(id) = self.current() {
            self.shared.block(id, None);
        }
    }

    fn block_current_task_until(&self, deadline: Deadline) -> bool {
        let woken = match self.current() {
            Some(id) => self.shared.block(id, Some(deadline)),
            None => false,
        };
        !woken && deadline.is_reached(clock())
    }

    fn wake_task(&self, task: OwnerId) {
        let Ok(id) = usize::try_from(task.get()) else { return };
        let mut state = self.shared.lock();
        if let Some(task) = state.tasks.get_mut(id) {
            self.shared.wake(task);
            self.shared.changed.notify_all();
        }
    }

    fn wake_all(&self) {
        let mut state = self.shared.lock();
        for task in state.tasks.iter_mut() {
            self.shared.wake(task);
        }
        self.shared.changed.notify_all();
    }

    fn yield_current_task(&self) {
        let Some(id) = self.current() else {
            thread::yield_now();
            return;
        };
        let mut state = self.shared.lock();
        if state.ready.is_empty() {
            return;
        }
        self.shared.release(&mut state, id);
        drop(self.shared.run(state, id));
    }

    fn yield_until_before(&self, deadline: Deadline) {
        if deadline.saturating_duration_since(clock()) > self.shared.config.tick {
            self.yield_current_task();
        }
    }
}

impl core::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.shared.lock();
        let blocked = state.tasks.iter().filter(|task| task.blocked).count();
        f.debug_struct("TaskScheduler")
            .field("name", &self.shared.config.name)
            .field("tasks", &state.tasks.len())
            .field("blocked", &blocked)
            .field("running", &state.baton)
            .finish()
    }
}

/// An owned permission to join a task.
pub struct TaskHandle<T> {
    id: OwnerId,
    thread: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    /// Returns the id of the task.
    pub fn id(&self) -> OwnerId {
        self.id
    }

    /// Waits for the task to return.
    pub fn join(self) -> thread::Result<T> {
        self.thread.join()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::string::ToString;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Config, SchedulerError, TaskScheduler};
    use crate::host::clock;
    use crate::owner::OwnerId;
    use crate::port::Scheduler;

    #[test]
    fn outside_any_task() {
        let scheduler = TaskScheduler::new(Config::default());
        assert_eq!(scheduler.current_task_id(), OwnerId::INVALID);
        scheduler.yield_current_task();
        scheduler.block_current_task();
    }

    #[test]
    fn permit_before_block() {
        let scheduler = TaskScheduler::new(Config::default());
        let inner = scheduler.clone();
        let task = scheduler
            .spawn(move || {
                inner.wake_task(inner.current_task_id());
                inner.block_current_task();
                inner.current_task_id()
            })
            .unwrap();
        let id = task.id();
        assert_eq!(task.join().unwrap(), id);
    }

    #[test]
    fn wake_from_outside() {
        let scheduler = TaskScheduler::new(Config::default());
        let inner = scheduler.clone();
        let task = scheduler
            .spawn(move || {
                inner.block_current_task();
                5
            })
            .unwrap();
        scheduler.wake_task(task.id());
        assert_eq!(task.join().unwrap(), 5);
    }

    #[test]
    fn block_until_times_out() {
        let scheduler = TaskScheduler::new(Config::default());
        let inner = scheduler.clone();
        let task = scheduler
            .spawn(move || {
                let deadline = clock() + Duration::from_millis(5);
                let timed_out = inner.block_current_task_until(deadline);
                (timed_out, deadline, clock())
            })
            .unwrap();
        let (timed_out, deadline, resumed) = task.join().unwrap();
        assert!(timed_out);
        assert!(deadline.is_reached(resumed));
    }

    #[test]
    fn one_task_runs_at_a_time() {
        let scheduler = TaskScheduler::new(Config::default());
        let running = Arc::new(AtomicUsize::new(0));
        let tasks: std::vec::Vec<_> = (0..3)
            .map(|_| {
                let (inner, running) = (scheduler.clone(), Arc::clone(&running));
                let spawned = scheduler.spawn(move || {
                    for _ in 0..100 {
                        assert_eq!(running.fetch_add(1, SeqCst), 0);
                        std::thread::yield_now();
                        running.fetch_sub(1, SeqCst);
                        inner.yield_current_task();
                    }
                });
                spawned.unwrap()
            })
            .collect();
        for task in tasks {
            task.join().unwrap();
        }
    }

    #[test]
    fn task_slots_are_bounded() {
        let config = Config { max_tasks: 1, ..Config::default() };
        let scheduler = TaskScheduler::new(config);
        scheduler.spawn(|| ()).unwrap().join().unwrap();
        let err = scheduler.spawn(|| ()).err().unwrap();
        assert!(matches!(err, SchedulerError::TooManyTasks { max: 1 }));
        assert_eq!(err.to_string(), "too many tasks (max 1)");
    }

    #[test]
    fn panicking_task_releases_the_baton() {
        let scheduler = TaskScheduler::new(Config::default());
        let failed = scheduler.spawn(|| panic!("task failed")).unwrap();
        assert!(failed.join().is_err());
        let next = scheduler.spawn(|| 3).unwrap();
        assert_eq!(next.join().unwrap(), 3);
    }

    #[test]
    fn debug() {
        let scheduler = TaskScheduler::new(Config::default());
        let debug = format!("{scheduler:?}");
        assert_eq!(debug, "TaskScheduler { name: \"task\", tasks: 0, blocked: 0, running: None }");
    }
}
