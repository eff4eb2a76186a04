//! Cancellable background jobs
//!
//! Every component that needs periodic work (heartbeat checks, cleanup,
//! expiry sweeps, dead-agent detection) owns a [`JobGroup`]. Jobs start when
//! spawned and stop together when the group shuts down. A failing tick is
//! logged and the job keeps running.

use crate::error::Result;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

struct JobHandle {
    name: String,
    handle: JoinHandle<()>,
}

/// A set of background jobs stopped as a unit
///
/// Spawning requires a running Tokio runtime.
pub struct JobGroup {
    owner: String,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JobHandle>>,
}

impl JobGroup {
    pub fn new(owner: impl Into<String>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            owner: owner.into(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Run `tick` every `period`, first tick one period from now
    pub fn spawn_periodic<F, Fut>(&self, name: &str, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.is_shut_down() {
            warn!("Not starting job {}/{}: group is shut down", self.owner, name);
            return;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let job = format!("{}/{}", self.owner, name);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Job {} started (period: {:?})", job, period);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!("Job {} stopping", job);
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = tick().await {
                            error!("Job {} tick failed: {}", job, e);
                        }
                    }
                }
            }
        });

        self.push(name, handle);
    }

    /// Run `work` once after `delay` unless the group shuts down first
    pub fn spawn_once<Fut>(&self, name: &str, delay: Duration, work: Fut)
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.is_shut_down() {
            warn!("Not scheduling job {}/{}: group is shut down", self.owner, name);
            return;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let job = format!("{}/{}", self.owner, name);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!("One-shot job {} cancelled", job);
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = work.await {
                        error!("One-shot job {} failed: {}", job, e);
                    }
                }
            }
        });

        self.push(name, handle);
    }

    /// Run `work` until it returns or the group shuts down
    pub fn spawn_until_shutdown<Fut>(&self, name: &str, work: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            warn!("Not starting job {}/{}: group is shut down", self.owner, name);
            return;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let job = format!("{}/{}", self.owner, name);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.changed() => debug!("Job {} stopping", job),
                _ = work => debug!("Job {} finished", job),
            }
        });

        self.push(name, handle);
    }

    fn push(&self, name: &str, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.handle.is_finished());
        handles.push(JobHandle {
            name: name.to_string(),
            handle,
        });
    }

    /// Names of jobs that have not finished
    pub fn active_jobs(&self) -> Vec<String> {
        self.handles
            .lock()
            .iter()
            .filter(|h| !h.handle.is_finished())
            .map(|h| h.name.clone())
            .collect()
    }

    /// Signal every job to stop and wait for them
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        let count = handles.len();
        for job in handles {
            if let Err(e) = job.handle.await {
                if !e.is_cancelled() {
                    warn!("Job {}/{} ended abnormally: {}", self.owner, job.name, e);
                }
            }
        }
        info!("Stopped {} job(s) for {}", count, self.owner);
    }
}

impl Drop for JobGroup {
    fn drop(&mut self) {
        for job in self.handles.get_mut().drain(..) {
            job.handle.abort();
        }
    }
}
