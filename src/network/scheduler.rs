use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use rayon::{Scope, ThreadPool, ThreadPoolBuilder};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

/// Number of unmet dependencies of a task.
#[derive(Debug)]
pub(crate) struct Countdown(AtomicUsize);

impl Countdown {
    pub(crate) fn new(count: usize) -> Self {
        Self(AtomicUsize::new(count))
    }
    /// Marks one dependency as met, returns true for the last one.
    ///
    /// The last caller observes every write made by the previous callers before they arrived.
    pub(crate) fn arrive(&self) -> bool {
        self.0.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// A value built by the first of `users` tasks and dropped when the last one is done.
pub(crate) struct Shared<T> {
    value: Mutex<Option<Arc<T>>>,
    users: Countdown,
}

impl<T> Shared<T> {
    pub(crate) fn new(users: usize) -> Self {
        Self {
            value: Mutex::new(None),
            users: Countdown::new(users),
        }
    }
    /// The value, built with `init` on first use.
    ///
    /// Concurrent callers wait for the first one to finish building.
    pub(crate) fn get_or_try_init(&self, init: impl FnOnce() -> Result<T>) -> Result<Arc<T>> {
        let mut value = self.value.lock();
        if let Some(value) = value.as_ref() {
            return Ok(value.clone());
        }
        let new = Arc::new(init()?);
        *value = Some(new.clone());
        Ok(new)
    }
    /// Marks one user as done, the last one drops the value.
    pub(crate) fn release(&self) {
        if self.users.arrive() {
            self.value.lock().take();
        }
    }
}

/// Fixed size worker pool executing dependency counted tasks.
#[derive(Debug)]
pub(crate) struct Scheduler {
    pool: ThreadPool,
}

struct Context<'a, F> {
    exec: &'a F,
    aborted: AtomicBool,
    error: Mutex<Option<anyhow::Error>>,
}

impl<F> Context<'_, F> {
    fn abort(&self, error: anyhow::Error) {
        let mut first = self.error.lock();
        if first.is_none() {
            *first = Some(error);
        }
        self.aborted.store(true, Ordering::Release);
    }
}

/// Runs `task` and its successors, keeping one on this worker and spawning the rest.
fn execute<'scope, T, F>(scope: &Scope<'scope>, context: &'scope Context<'scope, F>, mut task: T)
where
    T: Send + 'scope,
    F: Fn(T, &mut Vec<T>) -> Result<()> + Sync,
{
    let mut ready = Vec::new();
    loop {
        if context.aborted.load(Ordering::Acquire) {
            return;
        }
        if let Err(error) = (context.exec)(task, &mut ready) {
            context.abort(error);
            return;
        }
        let Some(next) = ready.pop() else {
            return;
        };
        for task in ready.drain(..) {
            scope.spawn(move |scope| execute(scope, context, task));
        }
        task = next;
    }
}

impl Scheduler {
    pub(crate) fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("cubenet-worker-{index}"))
            .build()
            .context("Failed to build thread pool!")?;
        Ok(Self { pool })
    }
    pub(crate) fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
    /// Executes `seeds` and every task they release, blocking until all finished.
    ///
    /// `exec` runs one task and pushes the tasks it made ready. The first error stops
    /// the pass, tasks not yet started are skipped, and the error is returned.
    pub(crate) fn run<T, F>(&self, seeds: Vec<T>, exec: F) -> Result<()>
    where
        T: Send,
        F: Fn(T, &mut Vec<T>) -> Result<()> + Sync,
    {
        let context = Context {
            exec: &exec,
            aborted: AtomicBool::new(false),
            error: Mutex::new(None),
        };
        self.pool.in_place_scope(|scope| {
            for task in seeds {
                let context = &context;
                scope.spawn(move |scope| execute(scope, context, task));
            }
        });
        match context.error.into_inner() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[test]
    fn countdown_last_arrival() {
        let countdown = Countdown::new(3);
        assert!(!countdown.arrive());
        assert!(!countdown.arrive());
        assert!(countdown.arrive());
    }

    #[test]
    fn shared_value_is_built_once() -> Result<()> {
        let scheduler = Scheduler::new(4)?;
        let shared = Shared::new(64);
        let builds = AtomicUsize::new(0);
        scheduler.run((0..64).collect(), |x: usize, _| {
            let value = shared.get_or_try_init(|| {
                builds.fetch_add(1, Ordering::Relaxed);
                Ok(vec![7usize; 16])
            })?;
            assert_eq!(value[x % 16], 7);
            drop(value);
            shared.release();
            Ok(())
        })?;
        assert_eq!(builds.into_inner(), 1);
        assert!(shared.value.lock().is_none());
        Ok(())
    }

    #[test]
    fn runs_dependent_tasks() -> Result<()> {
        // A binary tree of depth 10, each node pushes its children.
        let scheduler = Scheduler::new(4)?;
        assert_eq!(scheduler.threads(), 4);
        let count = AtomicUsize::new(0);
        scheduler.run(vec![1usize], |node, ready| {
            count.fetch_add(1, Ordering::Relaxed);
            if node < 1 << 10 {
                ready.extend([2 * node, 2 * node + 1]);
            }
            Ok(())
        })?;
        assert_eq!(count.into_inner(), (1 << 11) - 1);
        Ok(())
    }

    #[test]
    fn join_waits_for_all_predecessors() -> Result<()> {
        let scheduler = Scheduler::new(3)?;
        let join = Countdown::new(100);
        let sum = AtomicUsize::new(0);
        let joined = AtomicUsize::new(0);
        scheduler.run((0..100).map(Some).collect(), |task: Option<usize>, ready| {
            match task {
                Some(x) => {
                    sum.fetch_add(x, Ordering::Relaxed);
                    if join.arrive() {
                        ready.push(None);
                    }
                }
                None => {
                    assert_eq!(sum.load(Ordering::Relaxed), 4950);
                    joined.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(())
        })?;
        assert_eq!(joined.into_inner(), 1);
        Ok(())
    }

    #[test]
    fn first_error_aborts() {
        let scheduler = Scheduler::new(2).unwrap();
        let err = scheduler
            .run(vec![0usize], |x, ready| {
                if x == 5 {
                    bail!("Expected task {x} to fail!");
                }
                ready.push(x + 1);
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Expected task 5 to fail!");
    }
}
