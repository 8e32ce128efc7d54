//! A timer driven task queue.
//!
//! Tasks are scheduled with a delay and picked up by a background driver on
//! a fixed tick. A task stays queued, flagged as running, until its worker
//! completes; at most `concurrency` tasks run at once across the queue.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle, time::Instant};

use crate::internal;

/// Processes one queued payload.
#[async_trait]
pub trait Worker<T>: Send + Sync + 'static {
    async fn run(&self, payload: T) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub interval: Duration,
    pub concurrency: usize,
}

struct Task<T> {
    id: u64,
    time: Instant,
    payload: T,
    running: bool,
}

struct Inner<T> {
    tasks: Mutex<Vec<Task<T>>>,
    running: AtomicUsize,
    next_id: AtomicU64,
    killed: AtomicBool,
    stop: Notify,
    config: QueueConfig,
    worker: Arc<dyn Worker<T>>,
}

pub struct TaskQueue<T> {
    inner: Arc<Inner<T>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> TaskQueue<T> {
    pub fn new<W: Worker<T>>(config: QueueConfig, worker: W) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                killed: AtomicBool::new(false),
                stop: Notify::new(),
                config: QueueConfig {
                    interval: config.interval.max(Duration::from_millis(1)),
                    concurrency: config.concurrency.max(1),
                },
                worker: Arc::new(worker),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Starts the background driver. Calling this again while it is running
    /// has no effect.
    pub fn start(&self) {
        let mut driver = self.driver.lock();
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        self.inner.killed.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);

        *driver = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => Inner::tick(&inner),
                    () = inner.stop.notified() => break,
                }
            }

            internal!("Task queue driver stopped");
        }));
    }

    /// Enqueues `payload` to run no earlier than `delay` from now.
    pub fn schedule(&self, delay: Duration, payload: T) {
        if self.inner.killed.load(Ordering::SeqCst) {
            internal!(level = WARN, "Discarding task scheduled on a stopped queue");
            return;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.tasks.lock().push(Task {
            id,
            time: Instant::now() + delay,
            payload,
            running: false,
        });
    }

    /// Stops the driver and drops every queued task. Tasks already running
    /// are left to finish.
    pub fn kill(&self) {
        self.inner.killed.store(true, Ordering::SeqCst);
        self.inner.stop.notify_one();
        self.inner.tasks.lock().clear();
    }

    /// Queued tasks, including those currently running.
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    fn tick(inner: &Arc<Self>) {
        let now = Instant::now();
        let mut tasks = inner.tasks.lock();

        for task in tasks.iter_mut() {
            if inner.running.load(Ordering::SeqCst) >= inner.config.concurrency {
                break;
            }

            if task.running || task.time > now {
                continue;
            }

            task.running = true;
            inner.running.fetch_add(1, Ordering::SeqCst);

            let id = task.id;
            let payload = task.payload.clone();
            let inner = Arc::clone(inner);

            tokio::spawn(async move {
                if let Err(err) = inner.worker.run(payload).await {
                    internal!(level = ERROR, "Queued task {id} failed: {err:#}");
                }

                inner.tasks.lock().retain(|task| task.id != id);
                inner.running.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

impl<T> Drop for TaskQueue<T> {
    fn drop(&mut self) {
        self.inner.killed.store(true, Ordering::SeqCst);
        self.inner.stop.notify_one();
    }
}
