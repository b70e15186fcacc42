use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, TrackerError};
use crate::model::{AlbumId, Listing, UserId};

/// Host label matching every worker.
pub const ANY_HOST: &str = "*";

/// "List this directory" work item. A job without a parent lists a scan root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub user_id: UserId,
    pub parent: Option<AlbumId>,
    pub path: PathBuf,
}

impl Job {
    pub fn root(user_id: UserId, path: PathBuf) -> Self {
        Self {
            user_id,
            parent: None,
            path,
        }
    }

    pub fn child(user_id: UserId, parent: AlbumId, path: PathBuf) -> Self {
        Self {
            user_id,
            parent: Some(parent),
            path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub host: Option<String>,
    pub job: Job,
}

impl QueuedJob {
    fn runs_on(&self, worker_host: &str) -> bool {
        worker_host == ANY_HOST
            || match self.host.as_deref() {
                None | Some(ANY_HOST) => true,
                Some(host) => host == worker_host,
            }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Waiting(QueuedJob),
    Active(QueuedJob),
    Completed { entry: QueuedJob, listing: Listing },
    /// No job is pending or running.
    Drained,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Listing;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn add(&self, host: Option<&str>, job: Job) -> Result<()>;
    async fn process(
        &self,
        host: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()>;
    /// Pending plus running jobs.
    async fn count(&self) -> Result<usize>;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedJob>,
    active: usize,
    paused: bool,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl Shared {
    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    async fn next_entry(&self, host: &str) -> Option<QueuedJob> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if !state.paused {
                    let found = state.pending.iter().position(|entry| entry.runs_on(host));
                    if let Some(entry) = found.and_then(|pos| state.pending.remove(pos)) {
                        state.active += 1;
                        return Some(entry);
                    }
                }
            }
            notified.await;
        }
    }
}

/// In-process job queue. Workers are tokio tasks; lifecycle events are delivered
/// in order on the channel returned by [`LocalQueue::new`].
pub struct LocalQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let queue = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                events,
            }),
            workers: Mutex::new(Vec::new()),
        };
        (queue, rx)
    }
}

async fn run_worker(shared: Arc<Shared>, host: String, handler: Arc<dyn JobHandler>) {
    while let Some(entry) = shared.next_entry(&host).await {
        shared.emit(QueueEvent::Active(entry.clone()));
        let listing = handler.handle(&entry.job).await;
        shared.emit(QueueEvent::Completed { entry, listing });

        let drained = {
            let mut state = shared.state.lock();
            state.active -= 1;
            state.active == 0 && state.pending.is_empty()
        };
        if drained {
            shared.emit(QueueEvent::Drained);
        }
    }
    debug!(host = %host, "queue worker stopped");
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn add(&self, host: Option<&str>, job: Job) -> Result<()> {
        let entry = QueuedJob {
            host: host.map(str::to_owned),
            job,
        };
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(TrackerError::Queue("queue is closed".into()));
            }
            state.pending.push_back(entry.clone());
        }
        self.shared.emit(QueueEvent::Waiting(entry));
        self.shared.wake.notify_waiters();
        Ok(())
    }

    async fn process(
        &self,
        host: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        if concurrency == 0 {
            return Err(TrackerError::Queue("worker concurrency must be at least 1".into()));
        }
        if self.shared.state.lock().closed {
            return Err(TrackerError::Queue("queue is closed".into()));
        }
        let mut workers = self.workers.lock();
        for _ in 0..concurrency {
            workers.push(tokio::spawn(run_worker(
                self.shared.clone(),
                host.to_owned(),
                handler.clone(),
            )));
        }
        debug!(host, concurrency, "queue workers started");
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let state = self.shared.state.lock();
        Ok(state.pending.len() + state.active)
    }

    async fn pause(&self) -> Result<()> {
        self.shared.state.lock().paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.shared.state.lock().paused = false;
        self.shared.wake.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shared.state.lock().closed = true;
        self.shared.wake.notify_waiters();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "queue worker ended abnormally");
            }
        }
        Ok(())
    }
}
