//! Fixed worker pool draining per-worker job queues.
//!
//! Each worker owns one [`JobQueue`] so a sticky binding maps a client to
//! exactly one drain thread, which is what guarantees per-client order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::error::SendError;
use crate::dispatch::queue::JobQueue;

/// What a send job needs from a session.
pub trait SendTarget: Send + Sync {
    fn forward(&self, frame: Bytes) -> Result<(), SendError>;
    /// Stable label for logs: the bound client id or a session tag.
    fn label(&self) -> String;
}

/// Runs a closure once the last of `count` parties has completed.
pub struct Countdown {
    remaining: AtomicUsize,
    on_zero: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Countdown {
    pub fn new(count: usize, on_zero: impl FnOnce() + Send + 'static) -> Arc<Self> {
        let countdown = Arc::new(Self {
            remaining: AtomicUsize::new(count),
            on_zero: Mutex::new(Some(Box::new(on_zero))),
        });
        if count == 0 {
            countdown.fire();
        }
        countdown
    }

    pub fn complete(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        if let Some(f) = self.on_zero.lock().take() {
            f();
        }
    }
}

impl std::fmt::Debug for Countdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Countdown")
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .finish()
    }
}

/// One pre-framed payload bound for one session.
pub struct SendJob {
    pub frame: Bytes,
    pub target: Arc<dyn SendTarget>,
    /// Resolved with the terminal outcome; `None` for fire-and-forget.
    pub completion: Option<oneshot::Sender<Result<(), SendError>>>,
    /// Shared per-publish completion counter.
    pub countdown: Option<Arc<Countdown>>,
}

impl SendJob {
    fn finish(mut self, result: Result<(), SendError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
        if let Some(countdown) = self.countdown.take() {
            countdown.complete();
        }
    }
}

impl std::fmt::Debug for SendJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendJob")
            .field("target", &self.target.label())
            .field("frame_len", &self.frame.len())
            .finish()
    }
}

pub type ExhaustedCallback = Arc<dyn Fn(&SendJob, &SendError) + Send + Sync>;

struct PauseGate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

pub struct WorkerPool {
    queues: Vec<Arc<JobQueue<SendJob>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    gate: Arc<PauseGate>,
    next: AtomicUsize,
    stopping: Arc<AtomicBool>,
    retry_count: u32,
    retry_interval: Duration,
}

impl WorkerPool {
    /// Spawn `workers` drain threads, each with its own bounded queue.
    /// A failed forward is retried up to `retry_count` times with
    /// `retry_interval` pauses; exhaustion invokes `on_exhausted`.
    pub fn new(
        workers: usize,
        queue_capacity: usize,
        retry_count: u32,
        retry_interval: Duration,
        on_exhausted: Option<ExhaustedCallback>,
    ) -> Arc<Self> {
        let workers = workers.max(1);
        let queues: Vec<Arc<JobQueue<SendJob>>> = (0..workers)
            .map(|_| Arc::new(JobQueue::new(queue_capacity)))
            .collect();
        let gate = Arc::new(PauseGate {
            paused: Mutex::new(false),
            resumed: Condvar::new(),
        });
        let stopping = Arc::new(AtomicBool::new(false));

        let pool = Arc::new(Self {
            queues: queues.clone(),
            handles: Mutex::new(Vec::with_capacity(workers)),
            gate: gate.clone(),
            next: AtomicUsize::new(0),
            stopping: stopping.clone(),
            retry_count,
            retry_interval,
        });

        let mut handles = pool.handles.lock();
        for (index, queue) in queues.into_iter().enumerate() {
            let gate = gate.clone();
            let stopping = stopping.clone();
            let on_exhausted = on_exhausted.clone();
            let handle = thread::Builder::new()
                .name(format!("hub-send-{index}"))
                .spawn(move || {
                    worker_loop(
                        index,
                        queue,
                        gate,
                        stopping,
                        retry_count,
                        retry_interval,
                        on_exhausted,
                    )
                })
                .expect("failed to spawn send worker");
            handles.push(handle);
        }
        drop(handles);
        pool
    }

    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Round-robin submission; blocks while the chosen queue is full.
    pub fn submit(&self, job: SendJob) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[index].push(job);
    }

    /// Submission to a specific worker, used by sticky routing.
    pub fn submit_to(&self, index: usize, job: SendJob) {
        self.queues[index % self.queues.len()].push(job);
    }

    pub fn queue_depth(&self, index: usize) -> usize {
        self.queues[index % self.queues.len()].len()
    }

    pub fn queue_depths(&self) -> Vec<usize> {
        self.queues.iter().map(|q| q.len()).collect()
    }

    /// Stop all workers from taking new jobs; queued jobs stay put.
    pub fn pause(&self) {
        *self.gate.paused.lock() = true;
    }

    pub fn resume(&self) {
        *self.gate.paused.lock() = false;
        self.gate.resumed.notify_all();
    }

    /// Release the queues and join the workers. Idempotent.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        for queue in &self.queues {
            queue.release();
        }
        self.resume();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.queues.len())
            .field("depths", &self.queue_depths())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    index: usize,
    queue: Arc<JobQueue<SendJob>>,
    gate: Arc<PauseGate>,
    stopping: Arc<AtomicBool>,
    retry_count: u32,
    retry_interval: Duration,
    on_exhausted: Option<ExhaustedCallback>,
) {
    debug!(worker = index, "send worker started");
    loop {
        if stopping.load(Ordering::Relaxed) {
            break;
        }

        let Some(job) = queue.get(Duration::from_millis(100)) else {
            continue;
        };

        // Hold the job in hand while the pool is paused.
        {
            let mut paused = gate.paused.lock();
            while *paused && !stopping.load(Ordering::Relaxed) {
                gate.resumed.wait(&mut paused);
            }
        }
        if stopping.load(Ordering::Relaxed) {
            job.finish(Err(SendError::SessionClosed));
            break;
        }

        let mut attempts = 0u32;
        let result = loop {
            match job.target.forward(job.frame.clone()) {
                Ok(()) => break Ok(()),
                Err(err) => {
                    if attempts >= retry_count {
                        break Err(err);
                    }
                    attempts += 1;
                    thread::sleep(retry_interval);
                }
            }
        };

        if let Err(err) = &result {
            match &on_exhausted {
                Some(callback) => callback(&job, err),
                None => warn!(
                    worker = index,
                    client = %job.target.label(),
                    error = %err,
                    "delivery retries exhausted"
                ),
            }
        }
        job.finish(result);
    }
    debug!(worker = index, "send worker stopped");
}
