//! Buffered, batched, retrying task runner.
//!
//! A [`Runner`] fans out long-running stream work for an indexer: a
//! user-supplied [`BufferedTask`] walks an initial corpus and emits entries,
//! on-demand entries arrive through [`Runner::buffer`], and the runner
//! coalesces both into bounded batches, executes them with bounded
//! concurrency, retries transient failures, and gives memory back when a
//! [`MemoryMonitor`] signals pressure.
//!
//! Delivery is at-least-once: entries may be re-run after retries, panics, or
//! a rehydrating rerun of the initial walk, so batch processing must be
//! idempotent. The only loss path is queue overflow after a shrink, which is
//! logged with a `dropped` count.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use buffered_task::{BufferedTask, Emitter, RunResult, Runner};
//! use std::time::Duration;
//!
//! struct BalanceFetcher;
//!
//! #[async_trait]
//! impl BufferedTask for BalanceFetcher {
//!     type Entry = String;
//!     type State = ();
//!     type Error = std::io::Error;
//!
//!     async fn init(
//!         &self,
//!         emitter: &mut Emitter<'_, String>,
//!         _state: &(),
//!     ) -> Result<(), Self::Error> {
//!         // enumerate every address already known to the indexer
//!         for address in ["0xabc".to_string(), "0xdef".to_string()] {
//!             emitter.emit(address);
//!         }
//!         Ok(())
//!     }
//!
//!     async fn run(&self, batch: &[String], _state: &()) -> RunResult<String> {
//!         tracing::debug!(count = batch.len(), "fetching balances");
//!         RunResult::Done
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let runner = Runner::builder(BalanceFetcher, ())
//!         .flush_interval(Duration::from_millis(100))
//!         .max_batch_size(10)
//!         .max_concurrency(4)
//!         .build();
//!
//!     // addresses discovered later are buffered on demand
//!     runner
//!         .buffer(vec!["0x123".to_string()], Duration::from_secs(5))
//!         .unwrap();
//! }
//! ```

mod bound_queue;
mod error;
mod memory;
mod runner;
mod task;

pub use bound_queue::BoundQueue;
pub use error::{BufferError, ShrinkError};
pub use memory::{MemoryMonitor, Shrinkable};
pub use runner::{DebugCount, Runner, RunnerBuilder};
pub use task::{BufferedTask, Emitter, RunResult};
