//! # Queue Dispatcher
//!
//! Each queue owns one worker thread. `dispatch` validates, snapshots the
//! command buffer and hands a submission to the worker over an unbounded
//! channel; it never blocks on execution.
//!
//! ```text
//!   dispatch ──┐
//!   dispatch ──┼──> [crossbeam channel] ──> [worker thread]
//!   dispatch ──┘       (FIFO)                wait semaphores
//!                                            execute waves
//!                                            signal semaphores
//!                                            signal fence
//!                                            completion callback
//! ```
//!
//! One worker per queue means dispatches on the same queue start in
//! submission order. Dispatches on different queues are only ordered by
//! semaphores.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anvil_core::{ExecutorConfig, HalError, HalResult, ObjectId, QueueType, ResultCode};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::command::{check_owner, ExecContext};
use crate::command_buffer::{CommandBuffer, DispatchSnapshot};
use crate::executor;
use crate::fence::{Fence, FenceShared, FenceStatus};
use crate::query::{encode_results, QueryPool, QueryResult, QueueCounters};
use crate::semaphore::{Semaphore, SemaphoreShared};

/// Called once with the final result of a dispatch.
pub type CompletionCallback = Box<dyn FnOnce(ResultCode) + Send>;

/// Queue statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Dispatches accepted.
    pub submitted: u64,
    /// Dispatches finished, successfully or not.
    pub completed: u64,
    /// Dispatches that finished with an error code.
    pub failed: u64,
    /// Commands executed, excluding query bookkeeping.
    pub commands_executed: u64,
}

struct Submission {
    snapshot: DispatchSnapshot,
    fence: Option<Arc<FenceShared>>,
    wait_semaphores: Vec<Arc<SemaphoreShared>>,
    signal_semaphores: Vec<Arc<SemaphoreShared>>,
    callback: Option<CompletionCallback>,
}

enum WorkerMessage {
    Run(Box<Submission>),
    Shutdown,
}

#[derive(Debug, Default)]
struct Tracker {
    submitted: u64,
    completed: u64,
    failed: u64,
}

#[derive(Debug)]
struct QueueShared {
    id: ObjectId,
    executor: ExecutorConfig,
    tracker: Mutex<Tracker>,
    idle: Condvar,
    counters: QueueCounters,
}

/// A device queue.
pub struct Queue {
    id: ObjectId,
    device: ObjectId,
    queue_type: QueueType,
    index: u32,
    shared: Arc<QueueShared>,
    sender: Sender<WorkerMessage>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("queue_type", &self.queue_type)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Queue {
    pub(crate) fn spawn(
        id: ObjectId,
        device: ObjectId,
        queue_type: QueueType,
        index: u32,
        executor: ExecutorConfig,
    ) -> HalResult<Self> {
        let shared = Arc::new(QueueShared {
            id,
            executor,
            tracker: Mutex::new(Tracker::default()),
            idle: Condvar::new(),
            counters: QueueCounters::default(),
        });
        let (sender, receiver) = unbounded();

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("anvil-queue-{}", id.serial()))
            .spawn(move || Self::worker_loop(&worker_shared, &receiver))
            .map_err(|e| HalError::Failure(format!("failed to start queue worker: {e}")))?;

        tracing::info!("Queue {} ({:?} #{}) started", id, queue_type, index);
        Ok(Self {
            id,
            device,
            queue_type,
            index,
            shared,
            sender,
            worker: Some(worker),
        })
    }

    /// Object id.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Id of the owning device.
    #[must_use]
    pub fn device_id(&self) -> ObjectId {
        self.device
    }

    /// Queue type.
    #[must_use]
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Index among the device's queues of the same type.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Submits a finalized command buffer.
    ///
    /// The dispatch waits for every `wait_semaphores` entry, executes the
    /// buffer, signals every `signal_semaphores` entry, signals `fence` and
    /// finally calls `callback` with the result. Semaphores and the fence are
    /// signaled even when execution fails.
    ///
    /// # Errors
    ///
    /// [`HalError::InvalidValue`] if the buffer is not finalized, any object
    /// belongs to another device, or `fence` already has a pending dispatch.
    /// Nothing is submitted on error.
    pub fn dispatch(
        &self,
        command_buffer: &mut CommandBuffer,
        fence: Option<&Fence>,
        wait_semaphores: &[&Semaphore],
        signal_semaphores: &[&Semaphore],
        callback: Option<CompletionCallback>,
    ) -> HalResult<()> {
        check_owner(self.device, command_buffer.device_id(), "command buffer")?;
        command_buffer.check_dispatchable()?;
        for semaphore in wait_semaphores.iter().chain(signal_semaphores) {
            check_owner(self.device, semaphore.device_id(), "semaphore")?;
        }
        if let Some(fence) = fence {
            check_owner(self.device, fence.device_id(), "fence")?;
            fence.shared().attach(self.id)?;
        }

        let snapshot = command_buffer.mark_dispatched();
        let wait_semaphores: Vec<_> = wait_semaphores.iter().map(|s| Arc::clone(s.shared())).collect();
        let signal_semaphores: Vec<_> = signal_semaphores.iter().map(|s| Arc::clone(s.shared())).collect();
        for semaphore in wait_semaphores.iter().chain(&signal_semaphores) {
            semaphore.acquire_use();
        }
        let submission = Submission {
            snapshot,
            fence: fence.map(|fence| Arc::clone(fence.shared())),
            wait_semaphores,
            signal_semaphores,
            callback,
        };

        let serial = {
            let mut tracker = self.shared.tracker.lock();
            tracker.submitted += 1;
            tracker.submitted
        };
        tracing::debug!(
            "Dispatch #{} of {} on queue {} (fence: {:?}, waits: {}, signals: {})",
            serial,
            submission.snapshot.command_buffer,
            self.id,
            submission.fence.as_ref().map(|fence| fence.id()),
            submission.wait_semaphores.len(),
            submission.signal_semaphores.len()
        );

        if let Err(returned) = self.sender.send(WorkerMessage::Run(Box::new(submission))) {
            if let WorkerMessage::Run(submission) = returned.into_inner() {
                Self::complete(&self.shared, *submission, ResultCode::Internal);
            }
            return Err(HalError::Internal(format!("queue {} worker has stopped", self.id)));
        }
        Ok(())
    }

    /// Waits up to `timeout_ns` for the dispatch owning `fence`.
    ///
    /// `u64::MAX` waits forever. A fence that was never dispatched reports
    /// [`FenceStatus::NotReady`] immediately.
    ///
    /// # Errors
    ///
    /// - [`HalError::FenceFailure`] carrying the code of a failed dispatch
    /// - [`HalError::InvalidValue`] for a fence dispatched on another queue
    pub fn try_wait(&self, fence: &Fence, timeout_ns: u64) -> HalResult<FenceStatus> {
        check_owner(self.device, fence.device_id(), "fence")?;
        let timeout = (timeout_ns != u64::MAX).then(|| Duration::from_nanos(timeout_ns));
        fence.shared().wait(self.id, timeout)
    }

    /// Blocks until every dispatch submitted before the call has completed.
    pub fn wait_all(&self) {
        let mut tracker = self.shared.tracker.lock();
        let target = tracker.submitted;
        while tracker.completed < target {
            self.shared.idle.wait(&mut tracker);
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let tracker = self.shared.tracker.lock();
        QueueStats {
            submitted: tracker.submitted,
            completed: tracker.completed,
            failed: tracker.failed,
            commands_executed: self.shared.counters.commands(),
        }
    }

    /// Reads results `start..start + count` of `pool`.
    ///
    /// # Errors
    ///
    /// [`HalError::InvalidValue`] for a pool created on another device or
    /// queue, or a range outside the pool.
    pub fn get_query_results(&self, pool: &QueryPool, start: u32, count: u32) -> HalResult<Vec<QueryResult>> {
        check_owner(self.device, pool.device_id(), "query pool")?;
        pool.shared().results(self.id, start, count)
    }

    /// Encodes results `start..start + count` of `pool` into `out`, one
    /// 16-byte record every `stride` bytes.
    pub fn get_query_results_into(
        &self,
        pool: &QueryPool,
        start: u32,
        count: u32,
        stride: usize,
        out: &mut [u8],
    ) -> HalResult<()> {
        let results = self.get_query_results(pool, start, count)?;
        encode_results(&results, stride, out)
    }

    fn worker_loop(shared: &Arc<QueueShared>, receiver: &Receiver<WorkerMessage>) {
        while let Ok(message) = receiver.recv() {
            match message {
                WorkerMessage::Run(submission) => Self::run(shared, *submission),
                WorkerMessage::Shutdown => break,
            }
        }
    }

    fn run(shared: &QueueShared, submission: Submission) {
        for semaphore in &submission.wait_semaphores {
            semaphore.wait();
        }
        let ctx = ExecContext {
            queue: shared.id,
            command_buffer: submission.snapshot.command_buffer,
            counters: &shared.counters,
        };
        let code = executor::execute(&shared.executor, &ctx, &submission.snapshot);
        Self::complete(shared, submission, code);
    }

    fn complete(shared: &QueueShared, submission: Submission, code: ResultCode) {
        let Submission {
            snapshot,
            fence,
            wait_semaphores,
            signal_semaphores,
            callback,
        } = submission;

        for semaphore in &signal_semaphores {
            semaphore.signal();
        }
        for semaphore in wait_semaphores.iter().chain(&signal_semaphores) {
            semaphore.release_use();
        }
        snapshot.in_flight.fetch_sub(1, Ordering::AcqRel);
        if let Some(fence) = fence {
            fence.signal(code);
        }
        if let Some(callback) = callback {
            callback(code);
        }

        tracing::debug!(
            "Dispatch of {} on queue {} completed: {}",
            snapshot.command_buffer,
            shared.id,
            code
        );
        let mut tracker = shared.tracker.lock();
        tracker.completed += 1;
        if code.is_error() {
            tracker.failed += 1;
        }
        shared.idle.notify_all();
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // queued dispatches drain before the shutdown message is seen
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        tracing::info!("Queue {} stopped", self.id);
    }
}
