//! Bounded worker pools for reads and writes, with backpressure and
//! completion streams.
//!
//! The original scheduling model is OS threads bounded by a counting
//! semaphore; here each pool owns a small `tokio` runtime (the teacher's own
//! async stack) and exposes a synchronous facade: [`Pool::submit`] blocks the
//! calling thread on the backpressure semaphore, and [`Pool::next_completed`]
//! blocks draining completed jobs in completion order. Callers never interact
//! with the runtime directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use silo_util::error::{Error, Result};

/// The outcome of one completed job: its return value, or the error it
/// failed with. Never dropped — every submitted job's outcome reaches a
/// [`Pool::next_completed`] caller.
pub type JobOutcome<T> = Result<T>;

struct CompletedItem<T> {
	outcome: JobOutcome<T>,
	/// For the read pool this is `Some`, and is held until the consumer
	/// pulls this item via [`Pool::next_completed`], so a slow consumer
	/// throttles new read admissions. The write pool releases its permit as
	/// soon as the worker finishes, so this is always `None` there.
	_held_permit: Option<OwnedSemaphorePermit>,
}

/// One bounded worker pool. `Storage` owns two: one for reads, one for
/// writes, fully independent of each other.
pub struct Pool<T> {
	runtime: Runtime,
	semaphore: Arc<Semaphore>,
	release_on_drain: bool,
	tx: mpsc::UnboundedSender<CompletedItem<T>>,
	rx: std::sync::Mutex<mpsc::UnboundedReceiver<CompletedItem<T>>>,
	outstanding: AtomicUsize,
}

impl<T: Send + 'static> Pool<T> {
	/// `workers` sizes the pool's runtime; the backpressure semaphore is
	/// sized `workers + queue_depth`. `release_on_drain` should be `true`
	/// for a read pool (permit held until the consumer drains the
	/// completion stream) and `false` for a write pool (permit released the
	/// instant the worker finishes).
	pub fn new(workers: usize, queue_depth: usize, release_on_drain: bool) -> Result<Self> {
		let runtime = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(workers.max(1))
			.enable_time()
			.build()
			.map_err(Error::from)?;
		let (tx, rx) = mpsc::unbounded_channel();
		Ok(Pool {
			runtime,
			semaphore: Arc::new(Semaphore::new(workers + queue_depth)),
			release_on_drain,
			tx,
			rx: std::sync::Mutex::new(rx),
			outstanding: AtomicUsize::new(0),
		})
	}

	/// Submit `job` for background execution, blocking the caller while the
	/// pool's backpressure semaphore is saturated.
	pub fn submit<F>(&self, job: F) -> Result<()>
	where
		F: FnOnce() -> JobOutcome<T> + Send + 'static,
	{
		let permit = self
			.runtime
			.block_on(self.semaphore.clone().acquire_owned())
			.map_err(|e| Error::InternalError(format!("pool semaphore closed: {}", e)))?;

		self.outstanding.fetch_add(1, Ordering::SeqCst);
		let tx = self.tx.clone();
		let release_on_drain = self.release_on_drain;

		self.runtime.spawn_blocking(move || {
			let outcome = job();
			let held_permit = if release_on_drain {
				Some(permit)
			} else {
				drop(permit);
				None
			};
			let _ = tx.send(CompletedItem {
				outcome,
				_held_permit: held_permit,
			});
		});
		Ok(())
	}

	/// Run `job` inline on the calling thread, bypassing the pool entirely.
	pub fn run_sync<F>(&self, job: F) -> JobOutcome<T>
	where
		F: FnOnce() -> JobOutcome<T>,
	{
		job()
	}

	/// Pull the next completed job, in completion order, waiting up to
	/// `timeout` (or indefinitely when `None`). Returns `None` on timeout
	/// expiry or once the pool is closed with nothing left to drain.
	pub fn next_completed(&self, timeout: Option<Duration>) -> Option<JobOutcome<T>> {
		let mut rx = self.rx.lock().unwrap();
		let item = match timeout {
			Some(t) => self.runtime.block_on(async { tokio::time::timeout(t, rx.recv()).await }).ok()?,
			None => self.runtime.block_on(rx.recv()),
		}?;
		self.outstanding.fetch_sub(1, Ordering::SeqCst);
		Some(item.outcome)
	}

	/// Block until every job submitted so far has completed, without
	/// draining or interpreting results.
	pub fn wait_finished(&self) {
		while self.outstanding.load(Ordering::SeqCst) > 0 {
			if self.next_completed(None).is_none() {
				break;
			}
		}
	}

	/// Cancel-and-drain: jobs already spawned onto the runtime run to
	/// completion (they cannot be preempted mid-flight), so this waits them
	/// out and warns if any were still outstanding.
	pub fn close(&self) {
		let outstanding = self.outstanding.load(Ordering::SeqCst);
		if outstanding > 0 {
			tracing::warn!(outstanding, "closing pool with jobs still outstanding");
		}
		self.wait_finished();
	}
}
