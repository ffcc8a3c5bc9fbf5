use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use blink_host::scheduler::Affinity;
use blink_host::{GatewayError, NativeGateway, Scheduler, SchedulerError, SchedulerOptions, Word, Words};
use crossbeam_channel::{bounded, Receiver, Sender};

/// Records every call with the thread it ran on. `block` parks until the
/// test releases it; `outer` re-enters the scheduler.
struct RecordingGateway {
    calls: Mutex<Vec<(String, ThreadId)>>,
    entered: Sender<()>,
    release: Receiver<()>,
    scheduler: OnceLock<Scheduler>,
}

impl RecordingGateway {
    fn new() -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let gateway = Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            entered: entered_tx,
            release: release_rx,
            scheduler: OnceLock::new(),
        });
        (gateway, entered_rx, release_tx)
    }

    fn names(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn threads(&self) -> Vec<ThreadId> {
        self.calls.lock().unwrap().iter().map(|(_, id)| *id).collect()
    }
}

impl NativeGateway for RecordingGateway {
    fn invoke(&self, name: &str, args: &[Word]) -> Result<Words, GatewayError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), thread::current().id()));
        match name {
            "block" => {
                self.entered.send(()).unwrap();
                self.release.recv().unwrap();
                Ok((0, 0))
            }
            "outer" => {
                let scheduler = self.scheduler.get().expect("scheduler installed");
                let (inner, _) = scheduler
                    .call_priority("inner", args)
                    .map_err(|err| GatewayError::Fault {
                        name: name.to_string(),
                        message: err.to_string(),
                    })?;
                Ok((inner + 1, 0))
            }
            "inner" => Ok((args.first().copied().unwrap_or_default() * 10, 0)),
            _ => Ok((args.len(), 0)),
        }
    }
}

fn spawned() -> (Scheduler, Arc<RecordingGateway>, Receiver<()>, Sender<()>) {
    let (gateway, entered, release) = RecordingGateway::new();
    let scheduler = Scheduler::new(gateway.clone(), SchedulerOptions::default());
    gateway.scheduler.set(scheduler.clone()).ok();
    scheduler.spawn().expect("engine thread");
    (scheduler, gateway, entered, release)
}

#[test]
fn every_call_runs_on_the_bound_thread() {
    let (scheduler, gateway, _entered, _release) = spawned();
    let Affinity::BoundTo(engine_thread) = scheduler.affinity() else {
        panic!("scheduler should be bound after spawn");
    };

    let callers: Vec<_> = (0..8)
        .map(|worker| {
            let scheduler = scheduler.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let (count, _) = scheduler.call("touch", &[worker, i]).unwrap();
                    assert_eq!(count, 2);
                }
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }

    let threads = gateway.threads();
    assert_eq!(threads.len(), 200);
    assert!(threads.iter().all(|id| *id == engine_thread));

    scheduler.shutdown();
    scheduler.join();
}

#[test]
fn priority_calls_jump_the_queue() {
    let (scheduler, gateway, entered, release) = spawned();

    let blocker = {
        let scheduler = scheduler.clone();
        thread::spawn(move || scheduler.call("block", &[]))
    };
    entered.recv_timeout(Duration::from_secs(5)).unwrap();

    let a = scheduler.call_async("A", &[]);
    let b = scheduler.call_async("B", &[]);
    let c = scheduler.call_priority_async("C", &[]);
    assert_eq!(scheduler.queued_calls(), 3);

    release.send(()).unwrap();
    blocker.join().unwrap().unwrap();
    a.wait().unwrap();
    b.wait().unwrap();
    c.wait().unwrap();

    assert_eq!(gateway.names(), vec!["block", "C", "A", "B"]);

    scheduler.shutdown();
    scheduler.join();
}

#[test]
fn calls_made_from_the_engine_thread_run_inline() {
    let (scheduler, gateway, _entered, _release) = spawned();

    let (value, _) = scheduler.call("outer", &[4]).unwrap();
    assert_eq!(value, 41);
    assert_eq!(gateway.names(), vec!["outer", "inner"]);

    // Jobs see the same thread and can call straight through.
    let seen = Arc::new(Mutex::new(None));
    let job_seen = seen.clone();
    let job_scheduler = scheduler.clone();
    scheduler
        .add_job(move || {
            let on_engine = job_scheduler.is_on_bound_thread();
            let result = job_scheduler.call("touch", &[1, 2, 3]).unwrap();
            *job_seen.lock().unwrap() = Some((on_engine, result.0));
        })
        .wait()
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), Some((true, 3)));

    scheduler.shutdown();
    scheduler.join();
}

#[test]
fn shutdown_fails_calls_still_queued() {
    let (scheduler, gateway, entered, release) = spawned();

    let blocker = {
        let scheduler = scheduler.clone();
        thread::spawn(move || scheduler.call("block", &[]))
    };
    entered.recv_timeout(Duration::from_secs(5)).unwrap();

    let queued = scheduler.call_async("never", &[]);
    scheduler.shutdown();
    release.send(()).unwrap();

    blocker.join().unwrap().unwrap();
    assert!(matches!(queued.wait(), Err(SchedulerError::ShutDown)));
    scheduler.join();

    assert!(matches!(
        scheduler.call("late", &[]),
        Err(SchedulerError::ShutDown)
    ));
    assert!(matches!(
        scheduler.add_job(|| {}).wait(),
        Err(SchedulerError::ShutDown)
    ));
    assert_eq!(gateway.names(), vec!["block"]);
}

#[test]
fn jobs_run_before_calls_already_queued() {
    let (scheduler, gateway, entered, release) = spawned();

    let blocker = {
        let scheduler = scheduler.clone();
        thread::spawn(move || scheduler.call("block", &[]))
    };
    entered.recv_timeout(Duration::from_secs(5)).unwrap();

    let call = scheduler.call_async("A", &[]);
    let job_scheduler = scheduler.clone();
    let job = scheduler.add_job(move || {
        job_scheduler.call("JOB", &[]).unwrap();
    });

    release.send(()).unwrap();
    blocker.join().unwrap().unwrap();
    job.wait().unwrap();
    call.wait().unwrap();
    assert_eq!(gateway.names(), vec!["block", "JOB", "A"]);

    scheduler.shutdown();
    scheduler.join();
}

#[test]
fn loop_tasks_run_after_queued_work() {
    let (scheduler, gateway, entered, release) = spawned();

    let blocker = {
        let scheduler = scheduler.clone();
        thread::spawn(move || scheduler.call("block", &[]))
    };
    entered.recv_timeout(Duration::from_secs(5)).unwrap();

    let call = scheduler.call_async("A", &[]);
    let loop_scheduler = scheduler.clone();
    scheduler.add_loop(move || {
        let _ = loop_scheduler.call("L", &[]);
    });

    release.send(()).unwrap();
    blocker.join().unwrap().unwrap();
    call.wait().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while gateway.names().len() < 3 {
        assert!(Instant::now() < deadline, "loop task never ran");
        thread::sleep(Duration::from_millis(5));
    }
    scheduler.shutdown();
    scheduler.join();

    let names = gateway.names();
    assert_eq!(&names[..3], &["block", "A", "L"]);
    assert!(names[3..].iter().all(|name| name == "L"));
}

#[test]
fn loop_tasks_repeat_in_order_and_survive_panics() {
    let (gateway, _entered, _release) = RecordingGateway::new();
    let scheduler = Scheduler::new(gateway, SchedulerOptions::default());
    let log = Arc::new(Mutex::new(Vec::new()));

    // Registered before the thread starts, so every pass sees all three.
    let first = log.clone();
    scheduler.add_loop(move || first.lock().unwrap().push("L1"));
    let second = log.clone();
    scheduler.add_loop(move || {
        second.lock().unwrap().push("L2");
        panic!("loop task failed");
    });
    let third = log.clone();
    scheduler.add_loop(move || third.lock().unwrap().push("L3"));
    scheduler.spawn().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while log.lock().unwrap().len() < 9 {
        assert!(Instant::now() < deadline, "loop tasks stalled");
        thread::sleep(Duration::from_millis(5));
    }
    scheduler.shutdown();
    scheduler.join();

    let log = log.lock().unwrap();
    assert_eq!(log.len() % 3, 0);
    for round in log.chunks(3) {
        assert_eq!(round, ["L1", "L2", "L3"].as_slice());
    }
}

#[test]
fn full_job_channel_on_the_engine_thread_runs_inline() {
    let (gateway, _entered, _release) = RecordingGateway::new();
    let options = SchedulerOptions {
        job_capacity: 1,
        ..SchedulerOptions::default()
    };
    let scheduler = Scheduler::new(gateway, options);
    scheduler.spawn().unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let outer_log = log.clone();
    let inner = scheduler.clone();
    scheduler
        .add_job(move || {
            outer_log.lock().unwrap().push("outer-start");
            let queued = outer_log.clone();
            inner.add_job(move || queued.lock().unwrap().push("queued"));
            let inline = outer_log.clone();
            inner.add_job(move || inline.lock().unwrap().push("inline"));
            outer_log.lock().unwrap().push("outer-end");
        })
        .wait()
        .unwrap();
    // Jobs are FIFO, so this one runs after the queued job.
    scheduler.run_blocking(|| ()).unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["outer-start", "inline", "outer-end", "queued"]
    );
    scheduler.shutdown();
    scheduler.join();
}
