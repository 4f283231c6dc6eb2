//! FIFO admission queue with a runtime-adjustable concurrency ceiling.
//!
//! A single dispatcher task starts jobs while fewer than `max_concurrent` are running.
//! Each started job wakes the dispatcher again when it settles, so the queue drains
//! itself without any external polling.

use crate::utils::lock;
use crate::RenderError;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Executes one admitted job.
pub type JobRunner<J, T> =
    Arc<dyn Fn(J) -> BoxFuture<'static, Result<T, RenderError>> + Send + Sync>;

type Reply<T> = oneshot::Sender<Result<T, RenderError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub processing_count: usize,
    pub queue_length: usize,
    pub max_concurrent: usize,
    pub is_processing: bool,
}

struct Pending<J, T> {
    job: J,
    reply: Reply<T>,
}

struct QueueState<J, T> {
    pending: VecDeque<Pending<J, T>>,
    processing: usize,
    max_concurrent: usize,
    paused: bool,
    closed: bool,
}

struct Shared<J, T> {
    state: Mutex<QueueState<J, T>>,
    wake: Notify,
    processing_tx: watch::Sender<usize>,
    runner: JobRunner<J, T>,
}

impl<J, T> Shared<J, T> {
    /// Called with the state lock held so watchers never see a stale count.
    fn publish(&self, processing: usize) {
        self.processing_tx.send_replace(processing);
    }
}

/// Decrements the processing count when a started job settles, even on panic.
struct SettleGuard<J, T> {
    shared: Arc<Shared<J, T>>,
}

impl<J, T> Drop for SettleGuard<J, T> {
    fn drop(&mut self) {
        {
            let mut state = lock(&self.shared.state);
            state.processing = state.processing.saturating_sub(1);
            self.shared.publish(state.processing);
        }
        self.shared.wake.notify_one();
    }
}

pub struct AdmissionQueue<J, T> {
    shared: Arc<Shared<J, T>>,
    dispatcher: JoinHandle<()>,
}

impl<J, T> AdmissionQueue<J, T>
where
    J: Send + 'static,
    T: Send + 'static,
{
    /// Creates the queue and spawns its dispatcher. Must be called inside a Tokio runtime.
    pub fn new(max_concurrent: usize, runner: JobRunner<J, T>) -> Self {
        let (processing_tx, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                processing: 0,
                max_concurrent: max_concurrent.max(1),
                paused: false,
                closed: false,
            }),
            wake: Notify::new(),
            processing_tx,
            runner,
        });

        let dispatcher = tokio::spawn(dispatch_loop(shared.clone()));

        Self { shared, dispatcher }
    }

    /// Appends a job and returns the receiver its result will be delivered on.
    pub fn enqueue(
        &self,
        job: J,
    ) -> Result<oneshot::Receiver<Result<T, RenderError>>, RenderError> {
        let (reply, receiver) = oneshot::channel();
        {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return Err(RenderError::EngineClosed);
            }
            state.pending.push_back(Pending { job, reply });
        }
        self.shared.wake.notify_one();
        Ok(receiver)
    }

    /// Enqueues a job and waits for its result.
    pub async fn submit(&self, job: J) -> Result<T, RenderError> {
        let receiver = self.enqueue(job)?;
        settle(receiver).await
    }

    pub fn stats(&self) -> QueueStats {
        let state = lock(&self.shared.state);
        QueueStats {
            processing_count: state.processing,
            queue_length: state.pending.len(),
            max_concurrent: state.max_concurrent,
            is_processing: state.processing > 0,
        }
    }

    /// Changes the ceiling; values below one are raised to one.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let max_concurrent = max_concurrent.max(1);
        {
            let mut state = lock(&self.shared.state);
            if state.max_concurrent == max_concurrent {
                return;
            }
            debug!(
                "Queue concurrency changed {} -> {}",
                state.max_concurrent, max_concurrent
            );
            state.max_concurrent = max_concurrent;
        }
        self.shared.wake.notify_one();
    }

    /// Stops starting new jobs. Running jobs are unaffected.
    pub fn pause(&self) {
        lock(&self.shared.state).paused = true;
    }

    pub fn resume(&self) {
        lock(&self.shared.state).paused = false;
        self.shared.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.state).paused
    }

    /// Fails every job that has not started yet with `err`. Returns how many were rejected.
    pub fn reject_pending(&self, err: RenderError) -> usize {
        let drained: Vec<Pending<J, T>> = lock(&self.shared.state).pending.drain(..).collect();
        let count = drained.len();

        for pending in drained {
            let _ = pending.reply.send(Err(err.clone()));
        }

        if count > 0 {
            warn!("Rejected {} queued jobs: {}", count, err);
        }
        count
    }

    /// Refuses new jobs and rejects queued ones with [`RenderError::EngineClosed`].
    pub fn close(&self) -> usize {
        lock(&self.shared.state).closed = true;
        let rejected = self.reject_pending(RenderError::EngineClosed);
        self.shared.wake.notify_one();
        rejected
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    /// Resolves once no job is running.
    pub async fn wait_idle(&self) {
        let mut processing = self.shared.processing_tx.subscribe();
        let _ = processing.wait_for(|count| *count == 0).await;
    }
}

impl<J, T> Drop for AdmissionQueue<J, T> {
    fn drop(&mut self) {
        lock(&self.shared.state).closed = true;
        self.dispatcher.abort();
    }
}

/// Waits on a job's reply channel.
pub async fn settle<T>(
    receiver: oneshot::Receiver<Result<T, RenderError>>,
) -> Result<T, RenderError> {
    receiver
        .await
        .unwrap_or_else(|_| Err(RenderError::Browser("render job aborted".to_string())))
}

async fn dispatch_loop<J, T>(shared: Arc<Shared<J, T>>)
where
    J: Send + 'static,
    T: Send + 'static,
{
    loop {
        let ready = {
            let mut state = lock(&shared.state);
            if state.closed && state.pending.is_empty() {
                break;
            }

            let mut ready = Vec::new();
            while !state.paused
                && !state.closed
                && state.processing < state.max_concurrent
            {
                match state.pending.pop_front() {
                    Some(pending) => {
                        state.processing += 1;
                        ready.push(pending);
                    }
                    None => break,
                }
            }
            if !ready.is_empty() {
                shared.publish(state.processing);
            }
            ready
        };

        for Pending { job, reply } in ready {
            let guard = SettleGuard {
                shared: shared.clone(),
            };
            let run = (shared.runner)(job);

            tokio::spawn(async move {
                let _guard = guard;
                let result = run.await;
                let _ = reply.send(result);
            });
        }

        shared.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn gated_runner(
        gate: Arc<Semaphore>,
        started: Arc<AtomicUsize>,
    ) -> JobRunner<usize, usize> {
        Arc::new(move |job: usize| {
            let gate = gate.clone();
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                let _permit = gate.acquire().await.map_err(|_| RenderError::EngineClosed)?;
                Ok(job * 2)
            }
            .boxed()
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_bounded_dispatch_drains_fifo() {
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(AdmissionQueue::new(
            5,
            gated_runner(gate.clone(), started.clone()),
        ));

        let receivers: Vec<_> = (0..20).map(|i| queue.enqueue(i).unwrap()).collect();

        wait_until(|| started.load(Ordering::SeqCst) == 5).await;
        let stats = queue.stats();
        assert_eq!(stats.processing_count, 5);
        assert_eq!(stats.queue_length, 15);
        assert!(stats.is_processing);

        let mut last_length = stats.queue_length;
        gate.add_permits(20);
        for (i, receiver) in receivers.into_iter().enumerate() {
            assert_eq!(settle(receiver).await.unwrap(), i * 2);
            let length = queue.stats().queue_length;
            assert!(length <= last_length);
            last_length = length;
        }

        queue.wait_idle().await;
        assert_eq!(queue.stats().processing_count, 0);
        assert_eq!(queue.stats().queue_length, 0);
        assert_eq!(started.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_below_ceiling_starts_without_queueing() {
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let queue = AdmissionQueue::new(3, gated_runner(gate.clone(), started.clone()));

        let _a = queue.enqueue(1).unwrap();
        let _b = queue.enqueue(2).unwrap();
        wait_until(|| started.load(Ordering::SeqCst) == 2).await;
        assert_eq!(queue.stats().queue_length, 0);
        gate.add_permits(2);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let gate = Arc::new(Semaphore::new(10));
        let started = Arc::new(AtomicUsize::new(0));
        let queue = AdmissionQueue::new(2, gated_runner(gate, started.clone()));

        queue.pause();
        let receiver = queue.enqueue(21).unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().queue_length, 1);

        queue.resume();
        assert_eq!(settle(receiver).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_set_max_concurrent_coerces_and_widens() {
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let queue = AdmissionQueue::new(1, gated_runner(gate.clone(), started.clone()));

        queue.set_max_concurrent(0);
        assert_eq!(queue.stats().max_concurrent, 1);

        let _receivers: Vec<_> = (0..4).map(|i| queue.enqueue(i).unwrap()).collect();
        wait_until(|| started.load(Ordering::SeqCst) == 1).await;

        queue.set_max_concurrent(3);
        wait_until(|| started.load(Ordering::SeqCst) == 3).await;
        assert_eq!(queue.stats().queue_length, 1);
        gate.add_permits(4);
    }

    #[tokio::test]
    async fn test_close_rejects_queued_jobs() {
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let queue = AdmissionQueue::new(1, gated_runner(gate.clone(), started.clone()));

        let running = queue.enqueue(1).unwrap();
        let queued = queue.enqueue(2).unwrap();
        wait_until(|| started.load(Ordering::SeqCst) == 1).await;

        assert_eq!(queue.close(), 1);
        assert_eq!(settle(queued).await, Err(RenderError::EngineClosed));
        assert_eq!(queue.enqueue(3).unwrap_err(), RenderError::EngineClosed);

        gate.add_permits(1);
        assert_eq!(settle(running).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failures_release_capacity() {
        let runner: JobRunner<usize, usize> = Arc::new(|job: usize| {
            async move {
                if job % 2 == 0 {
                    Err(RenderError::PageLost("detached".to_string()))
                } else {
                    Ok(job)
                }
            }
            .boxed()
        });
        let queue = AdmissionQueue::new(1, runner);

        for i in 0..6 {
            let result = tokio::time::timeout(Duration::from_secs(5), queue.submit(i))
                .await
                .unwrap();
            assert_eq!(result.is_ok(), i % 2 == 1);
        }
        assert_eq!(queue.stats().processing_count, 0);
    }
}
