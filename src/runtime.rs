//! Bounded worker pool for resolutions.
//!
//! Resolution is synchronous and holds the store's transaction lock while it
//! runs. This runtime moves that work onto dedicated threads behind a bounded
//! queue so callers (the gRPC service, batch jobs) can shed load instead of
//! piling up blocked threads.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, IdentityError, IdentityResult};
use crate::request::IdentifyRequest;
use crate::resolver::{IdentityResolver, Resolution};

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum queued resolutions.
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

enum Job {
    Resolve {
        request: IdentifyRequest,
        reply: Sender<IdentityResult<Resolution>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

fn worker_loop(rx: &Receiver<Job>, resolver: &IdentityResolver) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Resolve { request, reply } => {
                // The caller may have given up waiting; that is not an error here.
                let _ = reply.send(resolver.resolve_detailed(&request));
            }

            #[cfg(test)]
            Job::Sleep { duration, reply } => {
                thread::sleep(duration);
                let _ = reply.send(());
            }
        }
    }
}

/// Handle returned by [`ResolverRuntime::submit`].
#[derive(Debug)]
pub struct ResolutionHandle {
    rx: Receiver<IdentityResult<Resolution>>,
}

impl ResolutionHandle {
    /// Waits for the resolution to complete.
    pub fn join(self) -> IdentityResult<Resolution> {
        self.rx
            .recv()
            .map_err(|_| IdentityError::Execution(ExecutionError::Disconnected))?
    }

    /// Waits for the resolution to complete with a timeout.
    ///
    /// A timed-out resolution still runs to completion on its worker.
    pub fn join_timeout(self, timeout: Duration) -> IdentityResult<Resolution> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => IdentityError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => IdentityError::Execution(ExecutionError::Disconnected),
        })?
    }
}

/// A fixed pool of resolver threads fed by a bounded queue.
pub struct ResolverRuntime {
    resolver: IdentityResolver,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl ResolverRuntime {
    /// Start the worker threads.
    ///
    /// # Errors
    /// Returns `Internal` if a worker thread cannot be spawned.
    pub fn new(resolver: IdentityResolver, config: &RuntimeConfig) -> IdentityResult<Self> {
        let workers = config.workers.max(1);
        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut runtime = Self {
            resolver,
            tx: Some(tx),
            workers: Vec::with_capacity(workers),
            queue_capacity,
        };
        for idx in 0..workers {
            let rx = rx.clone();
            let resolver = runtime.resolver.clone();
            let handle = thread::Builder::new()
                .name(format!("identity-resolver-{idx}"))
                .spawn(move || worker_loop(&rx, &resolver))
                // Dropping `runtime` here joins the workers already started.
                .map_err(|e| IdentityError::internal(format!("failed to spawn resolver worker: {e}")))?;
            runtime.workers.push(handle);
        }

        tracing::debug!(workers, queue_capacity, "resolver runtime started");
        Ok(runtime)
    }

    /// Queue a resolution. Fails fast when the queue is full.
    ///
    /// # Errors
    /// - `QueueFull` if `queue_capacity` resolutions are already waiting
    /// - `Disconnected` if the workers are gone
    pub fn submit(&self, request: IdentifyRequest) -> IdentityResult<ResolutionHandle> {
        let (reply, rx) = bounded(1);
        self.try_submit(Job::Resolve { request, reply })?;
        Ok(ResolutionHandle { rx })
    }

    /// Queue a resolution and wait for it.
    ///
    /// # Errors
    /// Same as [`ResolverRuntime::submit`] plus any resolution error.
    pub fn resolve(&self, request: IdentifyRequest) -> IdentityResult<Resolution> {
        self.submit(request)?.join()
    }

    /// The resolver the workers run.
    #[must_use]
    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Maximum number of queued resolutions.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    fn try_submit(&self, job: Job) -> IdentityResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(IdentityError::Execution(ExecutionError::Disconnected))?;
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(capacity = self.queue_capacity, "resolver queue full; rejecting request");
                Err(IdentityError::Execution(ExecutionError::QueueFull {
                    capacity: self.queue_capacity,
                }))
            }
            Err(TrySendError::Disconnected(_)) => Err(IdentityError::Execution(ExecutionError::Disconnected)),
        }
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> IdentityResult<Receiver<()>> {
        let (reply, rx) = bounded::<()>(1);
        self.try_submit(Job::Sleep { duration, reply })?;
        Ok(rx)
    }
}

impl Drop for ResolverRuntime {
    fn drop(&mut self) {
        // Closing the channel lets workers drain queued jobs, then exit.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("resolver worker panicked");
            }
        }
    }
}
