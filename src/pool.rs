// src/pool.rs
//! Bounded task pool whose worker count floats between a minimum and a maximum.
//!
//! Workers are tokio tasks pulling from a shared FIFO. A monitor samples system
//! load every few seconds and asks a [`ScalingPolicy`] whether to add or retire
//! a worker. A handler panic resolves that task with [`PoolError::WorkerCrashed`],
//! ends the worker and spawns a replacement.
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::PoolConfig;

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    async fn handle(&self, request: Self::Request) -> anyhow::Result<Self::Response>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("task failed: {0}")]
    Task(String),
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
    #[error("pool closed")]
    Closed,
}

/// What the scaling policy gets to look at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolMetrics {
    pub load_per_core: f64,
    pub free_mem_ratio: f64,
    pub queue_depth: usize,
    pub workers: usize,
    pub idle_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}

pub trait ScalingPolicy: Send + Sync + 'static {
    fn should_grow(&self, m: &PoolMetrics) -> bool;
    fn should_shrink(&self, m: &PoolMetrics) -> bool;
}

/// Grow while the box is quiet and there is queued work; shed idle workers when
/// load runs 20% over the threshold or free memory drops 20% under it.
#[derive(Debug, Clone, Copy)]
pub struct LoadScalingPolicy {
    pub load_per_core_threshold: f64,
    pub free_mem_threshold: f64,
}

impl LoadScalingPolicy {
    pub fn from_config(cfg: &PoolConfig) -> Self {
        Self { load_per_core_threshold: cfg.load_per_core_threshold, free_mem_threshold: cfg.free_mem_threshold }
    }
}

impl ScalingPolicy for LoadScalingPolicy {
    fn should_grow(&self, m: &PoolMetrics) -> bool {
        m.queue_depth > 0
            && m.workers < m.max_workers
            && m.load_per_core < self.load_per_core_threshold
            && m.free_mem_ratio >= self.free_mem_threshold
    }

    fn should_shrink(&self, m: &PoolMetrics) -> bool {
        let stressed = m.load_per_core > 1.2 * self.load_per_core_threshold
            || m.free_mem_ratio < 0.8 * self.free_mem_threshold;
        stressed && m.idle_workers > 0 && m.workers > m.min_workers
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemLoad {
    pub load_per_core: f64,
    pub free_mem_ratio: f64,
}

pub trait LoadProbe: Send + Sync + 'static {
    fn sample(&self) -> SystemLoad;
}

/// 1-minute load average and free memory from the OS. Outside Linux it reports
/// an idle machine, which leaves queue depth as the only growth signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLoadProbe;

impl LoadProbe for OsLoadProbe {
    #[cfg(target_os = "linux")]
    fn sample(&self) -> SystemLoad {
        let mut loads = [0f64; 3];
        // SAFETY: getloadavg writes at most `nelem` doubles into the buffer.
        let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
        let cores = std::thread::available_parallelism().map(|c| c.get()).unwrap_or(1) as f64;
        let load_per_core = if n >= 1 { loads[0] / cores } else { 0.0 };

        // SAFETY: sysconf has no memory-safety preconditions.
        let (total, avail) = unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_AVPHYS_PAGES)) };
        let free_mem_ratio = if total > 0 && avail >= 0 { avail as f64 / total as f64 } else { 1.0 };
        SystemLoad { load_per_core, free_mem_ratio }
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> SystemLoad {
        SystemLoad { load_per_core: 0.0, free_mem_ratio: 1.0 }
    }
}

/// Probe returning whatever was last stored; for tests and manual control.
#[derive(Debug)]
pub struct FixedLoadProbe(Mutex<SystemLoad>);

impl FixedLoadProbe {
    pub fn new(load_per_core: f64, free_mem_ratio: f64) -> Self {
        Self(Mutex::new(SystemLoad { load_per_core, free_mem_ratio }))
    }

    pub fn set(&self, load_per_core: f64, free_mem_ratio: f64) {
        if let Ok(mut g) = self.0.lock() {
            *g = SystemLoad { load_per_core, free_mem_ratio };
        }
    }
}

impl LoadProbe for FixedLoadProbe {
    fn sample(&self) -> SystemLoad {
        self.0.lock().map(|g| *g).unwrap_or(SystemLoad { load_per_core: 0.0, free_mem_ratio: 1.0 })
    }
}

struct Envelope<H: TaskHandler> {
    request: H::Request,
    reply: oneshot::Sender<Result<H::Response, PoolError>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub idle_workers: usize,
    pub queue_depth: usize,
    pub completed: u64,
    pub failed: u64,
    pub crashed: u64,
}

struct Shared<H: TaskHandler> {
    handler: Arc<H>,
    queue: Mutex<VecDeque<Envelope<H>>>,
    tasks: Mutex<JoinSet<()>>,
    notify: Notify,
    workers: AtomicUsize,
    idle: AtomicUsize,
    retire: AtomicUsize,
    closed: AtomicBool,
    next_worker_id: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    crashed: AtomicU64,
    min_workers: usize,
    max_workers: usize,
}

impl<H: TaskHandler> Shared<H> {
    fn queue_depth(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn pop(&self) -> Option<Envelope<H>> {
        self.queue.lock().ok()?.pop_front()
    }

    fn take_retire_ticket(&self) -> bool {
        self.retire
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn spawn_worker(self: &Arc<Self>) {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        self.workers.fetch_add(1, Ordering::AcqRel);
        #[cfg(feature = "metrics")]
        crate::metrics::POOL_WORKERS.inc();
        match self.tasks.lock() {
            Ok(mut tasks) => {
                // reap workers that already retired or crashed
                while tasks.try_join_next().is_some() {}
                tasks.spawn(worker_loop(Arc::clone(self), id));
            }
            Err(_) => {
                tokio::spawn(worker_loop(Arc::clone(self), id));
            }
        }
    }

    /// Next job, or `None` when this worker should exit.
    async fn next_job(&self) -> Option<Envelope<H>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.take_retire_ticket() {
                return None;
            }
            if let Some(job) = self.pop() {
                return Some(job);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            self.idle.fetch_add(1, Ordering::AcqRel);
            notified.await;
            self.idle.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn worker_loop<H: TaskHandler>(shared: Arc<Shared<H>>, id: usize) {
    tracing::debug!(worker = id, "worker started");
    while let Some(job) = shared.next_job().await {
        let outcome = AssertUnwindSafe(shared.handler.handle(job.request)).catch_unwind().await;
        match outcome {
            Ok(Ok(resp)) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
                let _ = job.reply.send(Ok(resp));
            }
            Ok(Err(e)) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                let _ = job.reply.send(Err(PoolError::Task(format!("{e:#}"))));
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                shared.crashed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = id, panic = %msg, "worker crashed, replacing");
                let _ = job.reply.send(Err(PoolError::WorkerCrashed(msg)));
                exit_worker(&shared, id);
                if !shared.closed.load(Ordering::Acquire) || shared.queue_depth() > 0 {
                    shared.spawn_worker();
                }
                return;
            }
        }
    }
    exit_worker(&shared, id);
}

fn exit_worker<H: TaskHandler>(shared: &Shared<H>, id: usize) {
    shared.workers.fetch_sub(1, Ordering::AcqRel);
    #[cfg(feature = "metrics")]
    crate::metrics::POOL_WORKERS.dec();
    tracing::debug!(worker = id, "worker stopped");
}

/// Future for one submitted task.
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<Result<R, PoolError>>,
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a dropped sender means the job was discarded with the pool
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(Err(PoolError::Closed)))
    }
}

pub struct WorkerPool<H: TaskHandler> {
    shared: Arc<Shared<H>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    policy: Arc<dyn ScalingPolicy>,
    probe: Arc<dyn LoadProbe>,
}

impl<H: TaskHandler> WorkerPool<H> {
    /// Start `min_workers` workers plus the periodic scaling monitor.
    pub fn new(handler: H, cfg: &PoolConfig) -> Self {
        Self::with_policy(
            handler,
            cfg,
            Arc::new(LoadScalingPolicy::from_config(cfg)),
            Arc::new(OsLoadProbe),
        )
    }

    pub fn with_policy(handler: H, cfg: &PoolConfig, policy: Arc<dyn ScalingPolicy>, probe: Arc<dyn LoadProbe>) -> Self {
        let min_workers = cfg.min_workers.max(1);
        let shared = Arc::new(Shared {
            handler: Arc::new(handler),
            queue: Mutex::new(VecDeque::new()),
            tasks: Mutex::new(JoinSet::new()),
            notify: Notify::new(),
            workers: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            retire: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            next_worker_id: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            crashed: AtomicU64::new(0),
            min_workers,
            max_workers: cfg.max_workers.max(min_workers),
        });
        for _ in 0..min_workers {
            shared.spawn_worker();
        }

        let pool = Self { shared, monitor: Mutex::new(None), policy, probe };
        if cfg.monitor_interval_ms > 0 {
            let handle = tokio::spawn(monitor_loop(
                Arc::downgrade(&pool.shared),
                Arc::clone(&pool.policy),
                Arc::clone(&pool.probe),
                Duration::from_millis(cfg.monitor_interval_ms),
            ));
            if let Ok(mut g) = pool.monitor.lock() {
                *g = Some(handle);
            }
        }
        pool
    }

    /// Queue a task without waiting for a worker.
    pub fn submit(&self, request: H::Request) -> TaskHandle<H::Response> {
        let (tx, rx) = oneshot::channel();
        if self.shared.closed.load(Ordering::Acquire) {
            let _ = tx.send(Err(PoolError::Closed));
            return TaskHandle { rx };
        }
        match self.shared.queue.lock() {
            Ok(mut q) => q.push_back(Envelope { request, reply: tx }),
            Err(_) => {
                let _ = tx.send(Err(PoolError::Closed));
                return TaskHandle { rx };
            }
        }
        self.shared.notify.notify_one();
        TaskHandle { rx }
    }

    pub fn stats(&self) -> PoolStats {
        let s = &self.shared;
        PoolStats {
            workers: s.workers.load(Ordering::Acquire),
            idle_workers: s.idle.load(Ordering::Acquire),
            queue_depth: s.queue_depth(),
            completed: s.completed.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            crashed: s.crashed.load(Ordering::Relaxed),
        }
    }

    /// One scaling decision; the monitor calls this every interval.
    pub fn evaluate_scaling(&self) -> ScalingDecision {
        evaluate(&self.shared, self.policy.as_ref(), self.probe.as_ref())
    }

    /// Stop accepting work, let workers drain the queue and exit.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        let monitor = self.monitor.lock().ok().and_then(|mut g| g.take());
        if let Some(h) = monitor {
            h.abort();
        }
        // a crash while draining can add a replacement, so repeat until empty
        loop {
            let mut tasks = match self.shared.tasks.lock() {
                Ok(mut g) => std::mem::take(&mut *g),
                Err(_) => break,
            };
            if tasks.is_empty() {
                break;
            }
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    tracing::warn!("worker task ended abnormally: {e}");
                }
            }
        }
    }
}

impl<H: TaskHandler> Drop for WorkerPool<H> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        if let Ok(mut g) = self.monitor.lock() {
            if let Some(h) = g.take() {
                h.abort();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Grow,
    Shrink,
    Hold,
}

fn evaluate<H: TaskHandler>(shared: &Arc<Shared<H>>, policy: &dyn ScalingPolicy, probe: &dyn LoadProbe) -> ScalingDecision {
    if shared.closed.load(Ordering::Acquire) {
        return ScalingDecision::Hold;
    }
    let load = probe.sample();
    let pending_retire = shared.retire.load(Ordering::Acquire);
    let m = PoolMetrics {
        load_per_core: load.load_per_core,
        free_mem_ratio: load.free_mem_ratio,
        queue_depth: shared.queue_depth(),
        workers: shared.workers.load(Ordering::Acquire).saturating_sub(pending_retire),
        idle_workers: shared.idle.load(Ordering::Acquire).saturating_sub(pending_retire),
        min_workers: shared.min_workers,
        max_workers: shared.max_workers,
    };

    if m.workers < m.max_workers && policy.should_grow(&m) {
        shared.spawn_worker();
        tracing::debug!(workers = m.workers + 1, queue = m.queue_depth, load = m.load_per_core, "pool grew");
        ScalingDecision::Grow
    } else if m.workers > m.min_workers && m.idle_workers > 0 && policy.should_shrink(&m) {
        shared.retire.fetch_add(1, Ordering::AcqRel);
        shared.notify.notify_one();
        tracing::debug!(workers = m.workers - 1, load = m.load_per_core, mem = m.free_mem_ratio, "pool shrank");
        ScalingDecision::Shrink
    } else {
        ScalingDecision::Hold
    }
}

async fn monitor_loop<H: TaskHandler>(
    shared: Weak<Shared<H>>,
    policy: Arc<dyn ScalingPolicy>,
    probe: Arc<dyn LoadProbe>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else { break };
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        evaluate(&shared, policy.as_ref(), probe.as_ref());
    }
}
