//! The task runner: buffering, batching, dispatch, retries, shrinking.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn, Instrument};

use crate::bound_queue::BoundQueue;
use crate::error::{BufferError, ShrinkError};
use crate::memory::{MemoryMonitor, Shrinkable};
use crate::task::{BufferedTask, Emitter, EntrySink, RunResult};

/// How often `close` re-checks the in-flight set while draining.
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

type WorkerId = u64;

/// Batches are shared between the in-flight table (the crash-recovery copy)
/// and the worker executing them.
type Batch<E> = Arc<Vec<E>>;

/// Pending-work estimate returned by [`Runner::debug_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugCount {
    /// Upper bound on entries waiting in the buffer and the queue.
    pub buffer: usize,
    /// Number of batches currently executing.
    pub tasks: usize,
}

/// Builder for configuring a [`Runner`].
#[must_use = "builders do nothing unless you call .build()"]
pub struct RunnerBuilder<T: BufferedTask> {
    task: T,
    state: T::State,
    flush_interval: Duration,
    poll_interval: Duration,
    max_batch_size: usize,
    max_concurrency: usize,
    poll: bool,
    dedup_entries: bool,
    metadata: Option<String>,
    memory_monitor: Option<Arc<dyn MemoryMonitor>>,
}

impl<T: BufferedTask> RunnerBuilder<T> {
    pub(crate) fn new(task: T, state: T::State) -> Self {
        Self {
            task,
            state,
            flush_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(3),
            max_batch_size: 100,
            max_concurrency: 5,
            poll: false,
            dedup_entries: false,
            metadata: None,
            memory_monitor: None,
        }
    }

    /// Set how often buffered entries are promoted into batches.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the delay before an idle-queue rerun of the initial walk.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum entries per batch (minimum 1).
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set the maximum number of concurrently running batches (minimum 1).
    pub fn max_concurrency(mut self, concurrency: usize) -> Self {
        self.max_concurrency = concurrency;
        self
    }

    /// Rerun the initial walk whenever the queue is idle at flush time.
    pub fn poll(mut self, enabled: bool) -> Self {
        self.poll = enabled;
        self
    }

    /// Drop pushed entries that are already queued or in flight.
    pub fn dedup_entries(mut self, enabled: bool) -> Self {
        self.dedup_entries = enabled;
        self
    }

    /// Set an opaque label attached to worker logging spans.
    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Register the runner with a memory monitor at build time.
    ///
    /// Without a monitor nothing ever asks the runner to shrink, though
    /// [`Runner::shrink`] still answers direct calls.
    pub fn memory_monitor(mut self, monitor: Arc<dyn MemoryMonitor>) -> Self {
        self.memory_monitor = Some(monitor);
        self
    }

    /// Build the runner, spawn the flush timer, and start the initial walk.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Runner<T> {
        let runner = Runner {
            inner: Arc::new(Inner {
                task: self.task,
                user_state: self.state,
                config: RunnerConfig {
                    flush_interval: self.flush_interval,
                    poll_interval: self.poll_interval,
                    max_batch_size: self.max_batch_size.max(1),
                    max_concurrency: self.max_concurrency.max(1),
                    poll: self.poll,
                    dedup_entries: self.dedup_entries,
                    metadata: self.metadata,
                },
                state: Mutex::new(RunnerState {
                    current_buffer: Vec::new(),
                    queue: BoundQueue::new(),
                    in_flight: HashMap::new(),
                    init_status: InitStatus::Running,
                    closed: false,
                    poll_scheduled: false,
                }),
                next_worker_id: AtomicU64::new(0),
            }),
        };

        if let Some(monitor) = &self.memory_monitor {
            monitor.register_shrinkable(Arc::new(runner.clone()));
        }

        runner.spawn_init();

        let flush_runner = runner.clone();
        tokio::spawn(async move {
            flush_runner.flush_loop().await;
        });

        runner
    }
}

struct RunnerConfig {
    flush_interval: Duration,
    poll_interval: Duration,
    max_batch_size: usize,
    max_concurrency: usize,
    poll: bool,
    dedup_entries: bool,
    metadata: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStatus {
    Running,
    Complete,
}

struct RunnerState<E> {
    /// Unstructured accumulator for [`Runner::buffer`] entries awaiting the
    /// next flush tick.
    current_buffer: Vec<E>,
    queue: BoundQueue<Batch<E>>,
    in_flight: HashMap<WorkerId, Batch<E>>,
    init_status: InitStatus,
    closed: bool,
    /// At most one pending poll wake at a time.
    poll_scheduled: bool,
}

struct Inner<T: BufferedTask> {
    task: T,
    user_state: T::State,
    config: RunnerConfig,
    state: Mutex<RunnerState<T::Entry>>,
    next_worker_id: AtomicU64,
}

/// Handle to a running buffered task.
///
/// Cloneable; all clones share the same state. Every mutation is serialized
/// through one internal lock (the single-writer owner), and worker tasks hand
/// their results back through that same lock, so results are applied in
/// arrival order rather than dispatch order.
pub struct Runner<T: BufferedTask> {
    inner: Arc<Inner<T>>,
}

impl<T: BufferedTask> Clone for Runner<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: BufferedTask> Runner<T> {
    /// Start configuring a runner for `task` with the given callback state.
    pub fn builder(task: T, state: T::State) -> RunnerBuilder<T> {
        RunnerBuilder::new(task, state)
    }

    /// Queue entries for processing.
    ///
    /// The entries land in an unstructured accumulator and are promoted into
    /// batches on the next flush tick. `timeout` bounds only the admission
    /// handshake (the wait for the runner's serialization point), never the
    /// work itself; on timeout the runner state is unchanged.
    pub fn buffer(&self, entries: Vec<T::Entry>, timeout: Duration) -> Result<(), BufferError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self
            .inner
            .state
            .try_lock_for(timeout)
            .ok_or(BufferError::Timeout)?;
        if state.closed {
            return Err(BufferError::Closed);
        }
        state.current_buffer.extend(entries);
        Ok(())
    }

    /// Upper-bound estimate of pending entries and currently running batches.
    pub fn debug_count(&self) -> DebugCount {
        let state = self.inner.state.lock();
        DebugCount {
            buffer: state.current_buffer.len()
                + state.queue.len() * self.inner.config.max_batch_size,
            tasks: state.in_flight.len(),
        }
    }

    /// Contract the queue in response to memory pressure.
    ///
    /// Halves the queue's maximum size (capping an unbounded queue at half
    /// its current length) and drops overflow batches with a warning. Work
    /// dropped here is rehydrated by an initial-walk rerun once the shrunken
    /// queue drains. Errors when the queue is already at minimum size.
    pub fn shrink(&self) -> Result<(), ShrinkError> {
        let mut state = self.inner.state.lock();
        let dropped = state.queue.shrink()?;
        if !dropped.is_empty() {
            let entries: usize = dropped.iter().map(|batch| batch.len()).sum();
            warn!(
                dropped = entries,
                batches = dropped.len(),
                "shrink dropped queued work"
            );
        }
        Ok(())
    }

    /// Whether the queue has ever shrunk below its initial size.
    pub fn is_shrunk(&self) -> bool {
        self.inner.state.lock().queue.is_shrunk()
    }

    /// Shut down gracefully.
    ///
    /// Stops the flush timer, refuses further [`buffer`](Runner::buffer)
    /// calls, and waits up to `grace` for in-flight batches to finish before
    /// abandoning them. The initial walk, if still running, is abandoned; its
    /// late pushes are ignored.
    pub async fn close(&self, grace: Duration) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
        }
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let in_flight = self.inner.state.lock().in_flight.len();
            if in_flight == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(abandoned = in_flight, "grace elapsed; abandoning in-flight batches");
                return;
            }
            sleep(DRAIN_CHECK_INTERVAL).await;
        }
    }

    /// Periodic driver: promotes buffered entries each tick and, in poll
    /// mode, schedules an initial-walk rerun when the queue is idle.
    async fn flush_loop(&self) {
        let interval = self.inner.config.flush_interval;
        loop {
            sleep(interval).await;

            let schedule_poll = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return;
                }
                if state.current_buffer.is_empty() {
                    self.dispatch(&mut state);
                } else {
                    let entries = mem::take(&mut state.current_buffer);
                    self.enqueue(&mut state, entries);
                }
                let idle = self.inner.config.poll
                    && state.queue.is_empty()
                    && state.init_status == InitStatus::Complete
                    && !state.poll_scheduled;
                if idle {
                    state.poll_scheduled = true;
                }
                idle
            };

            if schedule_poll {
                self.schedule_poll_wake();
            }
        }
    }

    /// Arm a one-shot wake that reruns the initial walk if the runner is
    /// still idle when it fires.
    fn schedule_poll_wake(&self) {
        let runner = self.clone();
        tokio::spawn(async move {
            sleep(runner.inner.config.poll_interval).await;
            let mut state = runner.inner.state.lock();
            state.poll_scheduled = false;
            if !state.closed
                && state.queue.is_empty()
                && state.init_status == InitStatus::Complete
            {
                state.init_status = InitStatus::Running;
                runner.spawn_init();
            }
        });
    }

    /// Start the initial walk in a background task.
    ///
    /// Both successful and failed walks count as complete; a failed walk only
    /// loses whatever it had not yet emitted.
    fn spawn_init(&self) {
        let runner = self.clone();
        tokio::spawn(async move {
            let sink = runner.clone();
            let mut emitter = Emitter::new(&sink, runner.inner.config.max_batch_size);
            let result = AssertUnwindSafe(
                runner.inner.task.init(&mut emitter, &runner.inner.user_state),
            )
            .catch_unwind()
            .await;
            match result {
                Ok(Ok(())) => emitter.finish(),
                Ok(Err(error)) => warn!(%error, "initial stream failed"),
                Err(_) => warn!("initial stream panicked"),
            }
            let mut state = runner.inner.state.lock();
            state.init_status = InitStatus::Complete;
            runner.dispatch(&mut state);
        });
    }

    /// Filter, batch, and push entries onto the queue, then dispatch.
    fn enqueue(&self, state: &mut RunnerState<T::Entry>, mut entries: Vec<T::Entry>) {
        if state.closed {
            return;
        }
        if self.inner.config.dedup_entries {
            dedup_filter(&mut entries, &state.queue, &state.in_flight);
        }
        if entries.is_empty() {
            return;
        }

        let mut entries = entries.into_iter();
        let mut batches: Vec<Batch<T::Entry>> = Vec::new();
        loop {
            let chunk: Vec<_> = entries
                .by_ref()
                .take(self.inner.config.max_batch_size)
                .collect();
            if chunk.is_empty() {
                break;
            }
            batches.push(Arc::new(chunk));
        }

        let rejected = state.queue.push_back(batches);
        if !rejected.is_empty() {
            let dropped: usize = rejected.iter().map(|batch| batch.len()).sum();
            warn!(dropped, "queue full; dropping overflow entries");
        }
        self.dispatch(state);
    }

    /// Dispatcher: launch queued batches while concurrency slots are free.
    ///
    /// Invoked under the state lock after every change that could free a slot
    /// or add work. If this call drains a shrunken queue, the initial walk is
    /// restarted immediately to rehydrate whatever the shrink dropped.
    fn dispatch(&self, state: &mut RunnerState<T::Entry>) {
        if state.closed {
            return;
        }
        let mut popped = false;
        while state.in_flight.len() < self.inner.config.max_concurrency {
            let Some(batch) = state.queue.pop_front() else {
                break;
            };
            popped = true;
            let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
            state.in_flight.insert(id, batch.clone());
            self.spawn_worker(id, batch);
        }
        if popped
            && state.queue.is_empty()
            && state.queue.is_shrunk()
            && state.init_status == InitStatus::Complete
        {
            state.init_status = InitStatus::Running;
            self.spawn_init();
        }
    }

    fn spawn_worker(&self, id: WorkerId, batch: Batch<T::Entry>) {
        let runner = self.clone();
        let span = tracing::debug_span!(
            "batch_worker",
            worker = id,
            task = self.inner.config.metadata.as_deref().unwrap_or("")
        );
        tokio::spawn(
            async move {
                let result = AssertUnwindSafe(
                    runner.inner.task.run(batch.as_slice(), &runner.inner.user_state),
                )
                .catch_unwind()
                .await;
                runner.complete_worker(id, batch, result);
            }
            .instrument(span),
        );
    }

    /// Route a finished worker's result.
    fn complete_worker(
        &self,
        id: WorkerId,
        batch: Batch<T::Entry>,
        result: Result<RunResult<T::Entry>, Box<dyn std::any::Any + Send>>,
    ) {
        let mut state = self.inner.state.lock();
        state.in_flight.remove(&id);
        match result {
            Ok(RunResult::Done) => {}
            Ok(RunResult::Retry) => self.requeue(&mut state, batch),
            Ok(RunResult::RetryWith(mut entries)) => {
                if self.inner.config.dedup_entries {
                    dedup_filter(&mut entries, &state.queue, &state.in_flight);
                }
                if entries.is_empty() {
                    debug!("retry produced no new entries");
                } else {
                    self.requeue(&mut state, Arc::new(entries));
                }
            }
            Err(_) => {
                warn!(entries = batch.len(), "batch worker panicked; requeueing batch");
                self.requeue(&mut state, batch);
            }
        }
        self.dispatch(&mut state);
    }

    /// Push a retried batch to the back of the queue as a single batch, even
    /// when it exceeds the batch size.
    fn requeue(&self, state: &mut RunnerState<T::Entry>, batch: Batch<T::Entry>) {
        let rejected = state.queue.push_back([batch]);
        if !rejected.is_empty() {
            let dropped: usize = rejected.iter().map(|batch| batch.len()).sum();
            warn!(dropped, "queue full; dropping retried entries");
        }
    }
}

impl<T: BufferedTask> EntrySink<T::Entry> for Runner<T> {
    fn accept(&self, batch: Vec<T::Entry>) {
        let mut state = self.inner.state.lock();
        self.enqueue(&mut state, batch);
    }
}

impl<T: BufferedTask> Shrinkable for Runner<T> {
    fn shrink(&self) -> Result<(), ShrinkError> {
        Runner::shrink(self)
    }

    fn is_shrunk(&self) -> bool {
        Runner::is_shrunk(self)
    }
}

/// Remove entries already queued or in flight, plus duplicates within the
/// incoming list itself (first occurrence wins).
fn dedup_filter<E: Eq + Hash>(
    entries: &mut Vec<E>,
    queue: &BoundQueue<Batch<E>>,
    in_flight: &HashMap<WorkerId, Batch<E>>,
) {
    let mut keep = Vec::with_capacity(entries.len());
    {
        let mut seen: HashSet<&E> = queue
            .iter()
            .flat_map(|batch| batch.iter())
            .chain(in_flight.values().flat_map(|batch| batch.iter()))
            .collect();
        for entry in entries.iter() {
            keep.push(seen.insert(entry));
        }
    }
    let mut index = 0;
    entries.retain(|_| {
        let keep_this = keep[index];
        index += 1;
        keep_this
    });
}
