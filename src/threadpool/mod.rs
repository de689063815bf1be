// 有界工作线程池：所有阻塞的网络操作都在这里执行，不占用调用方的任务线程
use crate::utils::error::{Result, SessionError};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, warn};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};

const QUEUE_CAPACITY: usize = 256;

pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<Sender<Job>>,
    // 每个排队或运行中的任务占用一个名额，队列因此永远不会满
    slots: Arc<Semaphore>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

impl ThreadPool {
    pub fn new(size: usize) -> ThreadPool {
        assert!(size > 0);

        let (sender, receiver) = bounded(QUEUE_CAPACITY);
        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            workers.push(Worker::new(id, receiver.clone()));
        }

        ThreadPool {
            workers,
            sender: Some(sender),
            slots: Arc::new(Semaphore::new(QUEUE_CAPACITY)),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `f` without waiting. Fails with `PoolBusy` when every queue
    /// slot is taken.
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => SessionError::PoolBusy,
                TryAcquireError::Closed => SessionError::PoolClosed,
            })?;
        let sender = self.sender.as_ref().ok_or(SessionError::PoolClosed)?;
        enqueue(sender, permit, f)
    }

    /// Queues `f` and returns a future resolving to its result.
    ///
    /// The future waits asynchronously for a queue slot, so a saturated pool
    /// never blocks the calling task's thread. Once queued, dropping the
    /// future does not cancel the job; cancellation goes through the token
    /// the job itself observes.
    pub fn spawn<F, T>(&self, f: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let sender = self.sender.clone();

        async move {
            let sender = sender.ok_or(SessionError::PoolClosed)?;
            let permit = slots
                .acquire_owned()
                .await
                .map_err(|_| SessionError::PoolClosed)?;

            let (tx, rx) = oneshot::channel();
            enqueue(&sender, permit, move || {
                // 接收方可能已放弃等待（例如超时），忽略发送失败
                let _ = tx.send(f());
            })?;
            drop(sender);

            match rx.await {
                Ok(result) => result,
                Err(_) => Err(SessionError::TaskAborted),
            }
        }
    }
}

fn enqueue<F>(sender: &Sender<Job>, permit: OwnedSemaphorePermit, f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let job: Job = Box::new(move || {
        let _permit = permit;
        f();
    });
    // 持有名额时队列必有空位
    sender.try_send(job).map_err(|e| match e {
        TrySendError::Full(_) => SessionError::PoolBusy,
        TrySendError::Disconnected(_) => SessionError::PoolClosed,
    })
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // 等待名额的任务立即失败；关闭发送端，工作线程在队列清空后退出
        self.slots.close();
        drop(self.sender.take());

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!("Worker {} exited abnormally", worker.id);
                }
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: Receiver<Job>) -> Worker {
        let thread = thread::Builder::new()
            .name(format!("ssh-worker-{}", id))
            .spawn(move || loop {
                match receiver.recv() {
                    Ok(job) => {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            warn!("Job panicked on worker {}", id);
                        }
                    }
                    Err(_) => {
                        debug!("Worker {} shutting down", id);
                        break;
                    }
                }
            })
            .ok();

        if thread.is_none() {
            warn!("Failed to spawn worker {}", id);
        }

        Worker { id, thread }
    }
}
