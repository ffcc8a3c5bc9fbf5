//! Thread-affinity scheduler: every engine call runs on one bound thread.

mod queue;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Select, SendTimeoutError, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use queue::CallQueue;

use crate::completion::{completion, Pending, Resolver};
use crate::config::Config;
use crate::engine::{panic_message, GatewayError, NativeGateway, Word, Words};

const ENGINE_THREAD_NAME: &str = "blink-engine";
const SEND_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Native(#[from] GatewayError),
    #[error("scheduler has shut down")]
    ShutDown,
    #[error("scheduler is already bound to {0:?}")]
    AlreadyBound(ThreadId),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("job panicked: {0}")]
    JobPanicked(String),
}

pub type CallResult = Result<Words, SchedulerError>;

/// Which thread, if any, owns the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Unbound,
    BoundTo(ThreadId),
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub job_capacity: usize,
    pub wake_capacity: usize,
    pub loop_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SchedulerOptions {
    fn from(config: &Config) -> Self {
        Self {
            job_capacity: config.job_capacity.max(1),
            wake_capacity: config.wake_capacity.max(1),
            loop_interval: config.loop_interval(),
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;
type LoopTask = Box<dyn FnMut() + Send>;

struct QueuedJob {
    run: Job,
    done: Resolver<Result<(), SchedulerError>>,
}

struct PendingCall {
    name: String,
    args: Vec<Word>,
    result: Resolver<CallResult>,
}

enum Placement {
    Back,
    Front,
}

struct Shared {
    gateway: Arc<dyn NativeGateway>,
    bound: OnceLock<ThreadId>,
    queue: CallQueue<PendingCall>,
    jobs_tx: Sender<QueuedJob>,
    jobs_rx: Receiver<QueuedJob>,
    loops: Mutex<Vec<LoopTask>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    stopping: AtomicBool,
    loop_interval: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn invoke(&self, name: &str, args: &[Word]) -> CallResult {
        match panic::catch_unwind(AssertUnwindSafe(|| self.gateway.invoke(name, args))) {
            Ok(result) => result.map_err(SchedulerError::from),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(target: "scheduler", %name, %message, "native call panicked");
                Err(SchedulerError::Native(GatewayError::Fault {
                    name: name.to_string(),
                    message,
                }))
            }
        }
    }

    fn run_job(&self, job: QueuedJob) {
        let QueuedJob { run, done } = job;
        match panic::catch_unwind(AssertUnwindSafe(run)) {
            Ok(()) => {
                done.resolve(Ok(()));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(target: "scheduler", %message, "job panicked");
                done.resolve(Err(SchedulerError::JobPanicked(message)));
            }
        }
    }

    /// Run every loop task once. Returns whether any are registered.
    fn run_loops(&self) -> bool {
        let mut tasks = std::mem::take(&mut *self.loops.lock().unwrap_or_else(PoisonError::into_inner));
        if tasks.is_empty() {
            return false;
        }

        for task in tasks.iter_mut() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task())) {
                error!(
                    target: "scheduler",
                    message = %panic_message(payload.as_ref()),
                    "loop task panicked"
                );
            }
        }

        // Tasks registered while these ran go after them.
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        let added = std::mem::take(&mut *loops);
        tasks.extend(added);
        *loops = tasks;
        true
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn drain_jobs(&self) {
        while let Ok(job) = self.jobs_rx.try_recv() {
            job.done.resolve(Err(SchedulerError::ShutDown));
        }
    }

    /// Fail everything still waiting once the loop has stopped.
    fn finish(&self) {
        let abandoned = self.queue.close();
        if !abandoned.is_empty() {
            warn!(
                target: "scheduler",
                count = abandoned.len(),
                "failing queued calls at shutdown"
            );
        }
        for call in abandoned {
            call.result.resolve(Err(SchedulerError::ShutDown));
        }
        self.drain_jobs();
        // Loop tasks may hold scheduler clones; dropping them breaks the cycle.
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn wait_for_work(&self, has_loops: bool) {
        // Stale wakes were for calls that are already handled.
        while self.queue.wake_signal().try_recv().is_ok() {}
        if !self.queue.is_empty() || !self.jobs_rx.is_empty() || self.is_stopping() {
            return;
        }

        let mut select = Select::new();
        select.recv(&self.shutdown_rx);
        select.recv(&self.jobs_rx);
        select.recv(self.queue.wake_signal());
        if has_loops {
            let _ = select.ready_timeout(self.loop_interval);
        } else {
            select.ready();
        }
    }

    fn run_bound(&self) {
        info!(target: "scheduler", thread = ?thread::current().id(), "engine thread bound");
        loop {
            if self.is_stopping() {
                break;
            }
            if let Ok(job) = self.jobs_rx.try_recv() {
                self.run_job(job);
                continue;
            }
            if let Some(call) = self.queue.pop_first() {
                let PendingCall { name, args, result } = call;
                result.resolve(self.invoke(&name, &args));
                continue;
            }
            let has_loops = self.run_loops();
            self.wait_for_work(has_loops);
        }
        self.finish();
        info!(target: "scheduler", "engine thread stopped");
    }
}

/// Handle to a queued call submitted with one of the `*_async` methods.
pub struct CallHandle {
    pending: Pending<CallResult>,
}

impl CallHandle {
    fn ready(result: CallResult) -> Self {
        let (resolver, pending) = completion();
        resolver.resolve(result);
        Self { pending }
    }

    pub fn wait(self) -> CallResult {
        self.pending.wait().unwrap_or(Err(SchedulerError::ShutDown))
    }

    /// `None` when the call is still queued after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CallResult> {
        self.pending
            .wait_timeout(timeout)
            .map(|result| result.unwrap_or(Err(SchedulerError::ShutDown)))
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_resolved()
    }
}

/// Completion signal of a one-shot job.
pub struct JobHandle {
    pending: Pending<Result<(), SchedulerError>>,
}

impl JobHandle {
    pub fn wait(self) -> Result<(), SchedulerError> {
        self.pending.wait().unwrap_or(Err(SchedulerError::ShutDown))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), SchedulerError>> {
        self.pending
            .wait_timeout(timeout)
            .map(|result| result.unwrap_or(Err(SchedulerError::ShutDown)))
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_resolved()
    }
}

/// Routes engine calls from any thread onto the single bound thread.
///
/// Calls made on the bound thread itself run immediately; everything else
/// is queued and executed by the run loop in order, with priority calls
/// jumping ahead of already-queued ones. The run loop services, in order:
/// shutdown, one-shot jobs, queued calls, and finally the repeating loop
/// tasks.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(gateway: Arc<dyn NativeGateway>, options: SchedulerOptions) -> Self {
        let (jobs_tx, jobs_rx) = bounded(options.job_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = bounded(1);
        Self {
            shared: Arc::new(Shared {
                gateway,
                bound: OnceLock::new(),
                queue: CallQueue::new(options.wake_capacity),
                jobs_tx,
                jobs_rx,
                loops: Mutex::new(Vec::new()),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx,
                stopping: AtomicBool::new(false),
                loop_interval: options.loop_interval,
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn affinity(&self) -> Affinity {
        match self.shared.bound.get() {
            Some(id) => Affinity::BoundTo(*id),
            None => Affinity::Unbound,
        }
    }

    pub fn is_on_bound_thread(&self) -> bool {
        self.affinity() == Affinity::BoundTo(thread::current().id())
    }

    fn bind_current(&self) -> Result<(), SchedulerError> {
        let current = thread::current().id();
        self.shared
            .bound
            .set(current)
            .map_err(|_| match self.affinity() {
                Affinity::BoundTo(existing) => SchedulerError::AlreadyBound(existing),
                Affinity::Unbound => SchedulerError::AlreadyBound(current),
            })
    }

    /// Bind a new dedicated thread and run the loop there.
    pub fn spawn(&self) -> Result<(), SchedulerError> {
        let scheduler = self.clone();
        let (bound, ready) = completion::<Result<(), SchedulerError>>();
        let handle = thread::Builder::new()
            .name(ENGINE_THREAD_NAME.to_string())
            .spawn(move || match scheduler.bind_current() {
                Ok(()) => {
                    bound.resolve(Ok(()));
                    scheduler.shared.run_bound();
                }
                Err(err) => {
                    bound.resolve(Err(err));
                }
            })?;

        match ready.wait() {
            Ok(Ok(())) => {
                *self
                    .shared
                    .thread
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => Err(SchedulerError::ShutDown),
        }
    }

    /// Bind the current thread and run the loop until shutdown.
    pub fn run(&self) -> Result<(), SchedulerError> {
        self.bind_current()?;
        self.shared.run_bound();
        Ok(())
    }

    /// Execute `name` on the bound thread and wait for the result.
    pub fn call(&self, name: &str, args: &[Word]) -> CallResult {
        if self.is_on_bound_thread() {
            return self.shared.invoke(name, args);
        }
        self.enqueue(name, args, Placement::Back).wait()
    }

    /// Like [`Scheduler::call`], but ahead of every already-queued call.
    pub fn call_priority(&self, name: &str, args: &[Word]) -> CallResult {
        if self.is_on_bound_thread() {
            return self.shared.invoke(name, args);
        }
        self.enqueue(name, args, Placement::Front).wait()
    }

    pub fn call_async(&self, name: &str, args: &[Word]) -> CallHandle {
        if self.is_on_bound_thread() {
            return CallHandle::ready(self.shared.invoke(name, args));
        }
        self.enqueue(name, args, Placement::Back)
    }

    pub fn call_priority_async(&self, name: &str, args: &[Word]) -> CallHandle {
        if self.is_on_bound_thread() {
            return CallHandle::ready(self.shared.invoke(name, args));
        }
        self.enqueue(name, args, Placement::Front)
    }

    fn enqueue(&self, name: &str, args: &[Word], placement: Placement) -> CallHandle {
        let (result, pending) = completion();
        let call = PendingCall {
            name: name.to_string(),
            args: args.to_vec(),
            result,
        };
        let queued = match placement {
            Placement::Back => self.shared.queue.add_last(call),
            Placement::Front => self.shared.queue.add_first(call),
        };
        if let Err(rejected) = queued {
            debug!(target: "scheduler", name = %rejected.name, "call rejected after shutdown");
            rejected.result.resolve(Err(SchedulerError::ShutDown));
        }
        CallHandle { pending }
    }

    /// Queue a one-shot job for the bound thread.
    pub fn add_job<F>(&self, job: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (done, pending) = completion();
        let handle = JobHandle { pending };
        if self.shared.is_stopping() {
            done.resolve(Err(SchedulerError::ShutDown));
            return handle;
        }

        let mut queued = QueuedJob {
            run: Box::new(job),
            done,
        };

        if self.is_on_bound_thread() {
            match self.shared.jobs_tx.try_send(queued) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    // Blocking here would wait on ourselves.
                    warn!(target: "scheduler", "job channel full on engine thread; running job inline");
                    self.shared.run_job(job);
                }
                Err(TrySendError::Disconnected(job)) => {
                    job.done.resolve(Err(SchedulerError::ShutDown));
                }
            }
            return handle;
        }

        loop {
            match self.shared.jobs_tx.send_timeout(queued, SEND_RETRY) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(job)) if !self.shared.is_stopping() => queued = job,
                Err(SendTimeoutError::Timeout(job)) | Err(SendTimeoutError::Disconnected(job)) => {
                    job.done.resolve(Err(SchedulerError::ShutDown));
                    return handle;
                }
            }
        }

        if self.shared.is_stopping() {
            self.shared.drain_jobs();
        }
        handle
    }

    /// Run `task` on the bound thread and wait for its value. Runs inline
    /// when already there.
    pub fn run_blocking<T, F>(&self, task: F) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_on_bound_thread() {
            return Ok(task());
        }
        let (resolver, pending) = completion();
        self.add_job(move || {
            resolver.resolve(task());
        })
        .wait()?;
        pending.wait().map_err(|_| SchedulerError::ShutDown)
    }

    /// Register a task the loop runs whenever no job or call is pending.
    pub fn add_loop<F>(&self, task: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.shared
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(task));
        self.shared.queue.notify();
    }

    pub fn queued_calls(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Stop the run loop. Calls still queued fail with
    /// [`SchedulerError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if self.affinity() == Affinity::Unbound {
            self.shared.finish();
        }
    }

    /// Wait for a thread started by [`Scheduler::spawn`] to exit.
    pub fn join(&self) {
        if self.is_on_bound_thread() {
            return;
        }
        let handle = self
            .shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingGateway {
        calls: AtomicUsize,
    }

    impl NativeGateway for CountingGateway {
        fn invoke(&self, name: &str, args: &[Word]) -> Result<Words, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match name {
                "sum" => Ok((args.iter().sum(), args.len())),
                "boom" => panic!("engine crashed"),
                _ => Err(GatewayError::Fault {
                    name: name.to_string(),
                    message: "unsupported".into(),
                }),
            }
        }
    }

    fn scheduler() -> (Scheduler, Arc<CountingGateway>) {
        let gateway = Arc::new(CountingGateway {
            calls: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(gateway.clone(), SchedulerOptions::default());
        (scheduler, gateway)
    }

    #[test]
    fn calls_from_other_threads_return_results() {
        let (scheduler, gateway) = scheduler();
        scheduler.spawn().unwrap();
        assert_eq!(scheduler.call("sum", &[1, 2, 3]).unwrap(), (6, 3));
        assert!(!scheduler.is_on_bound_thread());
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
        scheduler.join();
    }

    #[test]
    fn native_panics_surface_as_errors_and_loop_survives() {
        let (scheduler, _) = scheduler();
        scheduler.spawn().unwrap();
        let err = scheduler.call("boom", &[]).unwrap_err();
        assert!(matches!(err, SchedulerError::Native(GatewayError::Fault { .. })));
        assert_eq!(scheduler.call("sum", &[4]).unwrap(), (4, 1));
        scheduler.shutdown();
        scheduler.join();
    }

    #[test]
    fn binding_twice_is_rejected() {
        let (scheduler, _) = scheduler();
        scheduler.spawn().unwrap();
        assert!(matches!(
            scheduler.spawn(),
            Err(SchedulerError::AlreadyBound(_))
        ));
        scheduler.shutdown();
        scheduler.join();
    }

    #[test]
    fn shutdown_fails_queued_calls() {
        let (scheduler, gateway) = scheduler();
        let first = scheduler.call_async("sum", &[1]);
        let second = scheduler.call_priority_async("sum", &[2]);
        scheduler.shutdown();

        assert!(matches!(first.wait(), Err(SchedulerError::ShutDown)));
        assert!(matches!(second.wait(), Err(SchedulerError::ShutDown)));
        assert!(matches!(
            scheduler.call("sum", &[3]),
            Err(SchedulerError::ShutDown)
        ));
        assert!(matches!(
            scheduler.add_job(|| {}).wait(),
            Err(SchedulerError::ShutDown)
        ));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn run_blocking_returns_values_from_the_engine_thread() {
        let (scheduler, _) = scheduler();
        scheduler.spawn().unwrap();
        let inner = scheduler.clone();
        let (on_engine, sum) = scheduler
            .run_blocking(move || (inner.is_on_bound_thread(), inner.call("sum", &[5, 6])))
            .unwrap();
        assert!(on_engine);
        assert_eq!(sum.unwrap(), (11, 2));
        scheduler.shutdown();
        scheduler.join();
        assert!(matches!(
            scheduler.run_blocking(|| ()),
            Err(SchedulerError::ShutDown)
        ));
    }

    #[test]
    fn panicking_job_reports_and_loop_continues() {
        let (scheduler, _) = scheduler();
        scheduler.spawn().unwrap();
        let result = scheduler.add_job(|| panic!("bad job")).wait();
        assert!(matches!(result, Err(SchedulerError::JobPanicked(message)) if message == "bad job"));
        assert!(scheduler.add_job(|| {}).wait().is_ok());
        scheduler.shutdown();
        scheduler.join();
    }
}
