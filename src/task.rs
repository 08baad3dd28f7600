//! Callback contract and the entry emitter used by the initial stream.

use std::fmt;
use std::hash::Hash;
use std::mem;

use async_trait::async_trait;

/// Outcome of running one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult<E> {
    /// The batch was fully handled.
    Done,
    /// Re-queue the same batch (same entries, same order) at the back of the
    /// queue.
    Retry,
    /// Re-queue the given entries in place of the original batch.
    ///
    /// The list must be non-empty. It is queued as a single batch even when
    /// longer than `max_batch_size`; callers that rewrite batches are
    /// responsible for respecting the batch size themselves.
    RetryWith(Vec<E>),
}

/// A buffered stream of work, processed in batches.
///
/// Implementors supply two operations: [`init`](BufferedTask::init) walks an
/// initial corpus (for example, every address known to an indexer) and emits
/// entries, and [`run`](BufferedTask::run) processes one batch of entries.
///
/// `init` may be invoked again after the first walk completes: in poll mode
/// whenever the queue is idle, and immediately after a shrunken queue drains,
/// to rehydrate work dropped under memory pressure. It must therefore be able
/// to re-enumerate its corpus. Emitting an entry more than once is safe;
/// delivery is at-least-once and idempotency is the callback's concern.
#[async_trait]
pub trait BufferedTask: Send + Sync + 'static {
    /// Unit of work. Opaque to the runner apart from equality and hashing,
    /// which feed the optional dedup filter.
    type Entry: Send + Sync + Eq + Hash + 'static;

    /// Caller-supplied state handed unchanged to every callback invocation.
    type State: Send + Sync + 'static;

    /// Failure reported when the initial walk aborts.
    type Error: fmt::Display + Send + 'static;

    /// Walk the initial corpus, emitting each entry.
    ///
    /// Each full batch is pushed synchronously through the runner's
    /// serialization point, tying the walk's throughput to the consumption
    /// rate. An error terminates the walk; whatever was already emitted stays
    /// queued.
    async fn init(
        &self,
        emitter: &mut Emitter<'_, Self::Entry>,
        state: &Self::State,
    ) -> Result<(), Self::Error>;

    /// Process one batch of entries.
    ///
    /// The runner never cancels a running batch; enforce timeouts inside if
    /// needed. Retries are unbounded, so rate limiting is also this method's
    /// responsibility.
    async fn run(&self, batch: &[Self::Entry], state: &Self::State) -> RunResult<Self::Entry>;
}

/// Accumulates entries produced by [`BufferedTask::init`] and hands complete
/// batches to the runner.
pub struct Emitter<'a, E> {
    sink: &'a dyn EntrySink<E>,
    batch: Vec<E>,
    max_batch_size: usize,
}

impl<'a, E> Emitter<'a, E> {
    pub(crate) fn new(sink: &'a dyn EntrySink<E>, max_batch_size: usize) -> Self {
        Self {
            sink,
            batch: Vec::with_capacity(max_batch_size),
            max_batch_size,
        }
    }

    /// Emit one entry, pushing the accumulated batch once it is full.
    pub fn emit(&mut self, entry: E) {
        self.batch.push(entry);
        if self.batch.len() >= self.max_batch_size {
            let batch = mem::replace(&mut self.batch, Vec::with_capacity(self.max_batch_size));
            self.sink.accept(batch);
        }
    }

    /// Flush the residual partial batch, if any.
    pub(crate) fn finish(mut self) {
        if !self.batch.is_empty() {
            self.sink.accept(mem::take(&mut self.batch));
        }
    }
}

/// Receiving end of the emitter, implemented by the runner.
pub(crate) trait EntrySink<E>: Send + Sync {
    fn accept(&self, batch: Vec<E>);
}
