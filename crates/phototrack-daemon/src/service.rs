use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{error, info};

use phototrack_core::prelude::*;

/// The tracker operations the service drives at boot and shutdown.
#[async_trait]
pub trait TrackerControl: Send + Sync {
    async fn watch(&self, user_id: &str, root: &Path) -> Result<()>;
    async fn scan(&self, user_id: &str, root: &Path) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

#[async_trait]
impl TrackerControl for Tracker {
    async fn watch(&self, user_id: &str, root: &Path) -> Result<()> {
        Tracker::watch(self, user_id, root).await
    }

    async fn scan(&self, user_id: &str, root: &Path) -> Result<()> {
        Tracker::scan(self, user_id, root).await
    }

    async fn stop(&self) -> Result<()> {
        Tracker::stop(self).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Faulted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Started,
    Stopped,
    Fault(String),
}

pub struct TrackerService<C: TrackerControl> {
    control: Arc<C>,
    status: RwLock<ServiceStatus>,
    signal: broadcast::Sender<ServiceEvent>,
}

impl<C: TrackerControl> TrackerService<C> {
    pub fn new(control: Arc<C>) -> Self {
        let (signal, _) = broadcast::channel(4);
        Self {
            control,
            status: RwLock::new(ServiceStatus::Stopped),
            signal,
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.signal.subscribe()
    }

    /// Watches and then scans every configured root, as enabled by the config.
    pub async fn start(&self, config: &TrackerConfig) -> Result<()> {
        self.transition_to_starting()?;

        for root in &config.roots {
            if config.watch {
                if let Err(err) = self.control.watch(&root.user_id, &root.path).await {
                    return Err(self.handle_fault(err));
                }
            }
            if config.startup {
                if let Err(err) = self.control.scan(&root.user_id, &root.path).await {
                    return Err(self.handle_fault(err));
                }
            }
        }

        self.set_status(ServiceStatus::Running);
        self.emit(ServiceEvent::Started);
        info!(
            roots = config.roots.len(),
            scan = config.startup,
            watch = config.watch,
            "tracker service running"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.transition_to_stopping()? {
            return Ok(());
        }
        if let Err(err) = self.control.stop().await {
            return Err(self.handle_fault(err));
        }
        self.set_status(ServiceStatus::Stopped);
        self.emit(ServiceEvent::Stopped);
        Ok(())
    }

    fn transition_to_starting(&self) -> Result<()> {
        let mut status = self.status.write();
        match &*status {
            ServiceStatus::Stopped | ServiceStatus::Faulted(_) => {
                *status = ServiceStatus::Starting;
                Ok(())
            }
            ServiceStatus::Starting => Err(TrackerError::Service("start already in progress".into())),
            ServiceStatus::Running => Err(TrackerError::Service("already running".into())),
            ServiceStatus::Stopping => Err(TrackerError::Service("stop currently in progress".into())),
        }
    }

    /// Returns false when there is nothing to stop.
    fn transition_to_stopping(&self) -> Result<bool> {
        let mut status = self.status.write();
        match &*status {
            ServiceStatus::Running | ServiceStatus::Faulted(_) => {
                *status = ServiceStatus::Stopping;
                Ok(true)
            }
            ServiceStatus::Stopped => Ok(false),
            ServiceStatus::Starting => Err(TrackerError::Service("cannot stop while starting".into())),
            ServiceStatus::Stopping => Err(TrackerError::Service("stop already in progress".into())),
        }
    }

    fn set_status(&self, status: ServiceStatus) {
        *self.status.write() = status;
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.signal.send(event);
    }

    fn handle_fault(&self, err: TrackerError) -> TrackerError {
        let reason = err.to_string();
        error!(reason = %reason, "tracker service faulted");
        self.set_status(ServiceStatus::Faulted(reason.clone()));
        self.emit(ServiceEvent::Fault(reason));
        err
    }
}
