//! Job dispatcher: a small thread pool with delayed scheduling.
//!
//! Island workers are jobs. A job runs to completion on whichever pool
//! thread dequeues it and reschedules itself when it wants to run again —
//! either immediately or after a delay (when the next fixed step is not due
//! yet). Nothing here knows about islands; a job is just a callable.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A schedulable unit of work.
pub type Job = Arc<dyn Fn() + Send + Sync + 'static>;

struct TimedJob {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimedJob {}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest due first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queues {
    ready: VecDeque<Job>,
    delayed: BinaryHeap<TimedJob>,
}

struct Inner {
    queues: Mutex<Queues>,
    available: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

/// Shared handle to the thread pool. Cloning is cheap.
#[derive(Clone)]
pub struct JobDispatcher {
    inner: Arc<Inner>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl JobDispatcher {
    /// Spawn a pool with `num_threads` workers (at least one).
    #[must_use]
    pub fn new(num_threads: usize) -> Self {
        let inner = Arc::new(Inner {
            queues: Mutex::new(Queues::default()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });

        let threads = (0..num_threads.max(1))
            .map(|i| {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("island-worker-{i}"))
                    .spawn(move || worker_loop(&inner))
                    .unwrap_or_else(|e| panic!("failed to spawn pool thread: {e}"))
            })
            .collect();

        Self {
            inner,
            threads: Arc::new(Mutex::new(threads)),
        }
    }

    /// Enqueue a job for immediate execution.
    pub fn dispatch(&self, job: Job) {
        let Ok(mut queues) = self.inner.queues.lock() else {
            return;
        };
        queues.ready.push_back(job);
        drop(queues);
        self.inner.available.notify_one();
    }

    /// Enqueue a job to run after `delay` seconds. Non-positive delays run
    /// immediately.
    pub fn dispatch_after(&self, delay_secs: f64, job: Job) {
        if delay_secs <= 0.0 {
            self.dispatch(job);
            return;
        }
        let due = Instant::now() + Duration::from_secs_f64(delay_secs);
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let Ok(mut queues) = self.inner.queues.lock() else {
            return;
        };
        queues.delayed.push(TimedJob { due, seq, job });
        drop(queues);
        // Wake a thread so it can shorten its sleep to the new deadline.
        self.inner.available.notify_one();
    }

    /// Stop accepting work, drop pending jobs and join every pool thread.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        self.inner.available.notify_all();
        let Ok(mut threads) = self.threads.lock() else {
            return;
        };
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let job = {
            let Ok(mut queues) = inner.queues.lock() else {
                return;
            };
            loop {
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }

                let now = Instant::now();
                while queues
                    .delayed
                    .peek()
                    .is_some_and(|timed| timed.due <= now)
                {
                    if let Some(timed) = queues.delayed.pop() {
                        queues.ready.push_back(timed.job);
                    }
                }

                if let Some(job) = queues.ready.pop_front() {
                    break job;
                }

                match queues.delayed.peek().map(|timed| timed.due) {
                    Some(due) => {
                        let wait = due.saturating_duration_since(Instant::now());
                        let (guard, _) = match inner.available.wait_timeout(queues, wait) {
                            Ok(r) => r,
                            Err(_) => return,
                        };
                        queues = guard;
                    }
                    None => {
                        queues = match inner.available.wait(queues) {
                            Ok(guard) => guard,
                            Err(_) => return,
                        };
                    }
                }
            }
        };

        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_dispatch_runs_jobs() {
        let dispatcher = JobDispatcher::new(2);
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let count = Arc::clone(&count);
            dispatcher.dispatch(Arc::new(move || {
                count.fetch_add(1, AtomicOrdering::SeqCst);
            }));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(AtomicOrdering::SeqCst) < 16 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count.load(AtomicOrdering::SeqCst), 16);
        dispatcher.shutdown();
    }

    #[test]
    fn test_dispatch_after_respects_delay() {
        let dispatcher = JobDispatcher::new(1);
        let ran_at = Arc::new(Mutex::new(None));

        let start = Instant::now();
        let ran = Arc::clone(&ran_at);
        dispatcher.dispatch_after(0.05, Arc::new(move || {
            if let Ok(mut slot) = ran.lock() {
                *slot = Some(Instant::now());
            }
        }));

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Ok(slot) = ran_at.lock() {
                if let Some(at) = *slot {
                    assert!(at.duration_since(start) >= Duration::from_millis(45));
                    break;
                }
            }
            assert!(Instant::now() < deadline, "delayed job never ran");
            std::thread::sleep(Duration::from_millis(1));
        }
        dispatcher.shutdown();
    }

    #[test]
    fn test_jobs_can_reschedule_themselves() {
        let dispatcher = JobDispatcher::new(1);
        let count = Arc::new(AtomicUsize::new(0));

        struct SelfJob {
            dispatcher: JobDispatcher,
            count: Arc<AtomicUsize>,
        }
        fn schedule(job: &Arc<SelfJob>) {
            let this = Arc::clone(job);
            job.dispatcher.dispatch(Arc::new(move || run(&this)));
        }
        fn run(job: &Arc<SelfJob>) {
            if job.count.fetch_add(1, AtomicOrdering::SeqCst) + 1 < 5 {
                schedule(job);
            }
        }

        let job = Arc::new(SelfJob {
            dispatcher: dispatcher.clone(),
            count: Arc::clone(&count),
        });
        schedule(&job);

        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(AtomicOrdering::SeqCst) < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count.load(AtomicOrdering::SeqCst), 5);
        dispatcher.shutdown();
    }
}
