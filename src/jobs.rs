// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Single-writer queue for mutations of durable request state.
// Author: Lukas Bower

//! Persistent job runners.
//!
//! Every change to forever-persisted requests runs as a job on one worker
//! thread, in submission order. A job returns `true` when it changed durable
//! state; the runner then calls its checkpoint hook before taking the next job.

use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};
use thiserror::Error;

use crate::lock;

/// A unit of durable work.
pub type Job = Box<dyn FnOnce() -> bool + Send + 'static>;

/// Hook run after each job that reported a durable change.
pub type Checkpoint = Box<dyn FnMut() + Send + 'static>;

/// The runner is not accepting durable work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("persistence is disabled")]
pub struct PersistenceDisabled;

/// Queue for strictly ordered durable mutations.
pub trait JobRunner: Send + Sync {
    /// Enqueue `job`; fails when persistence is unavailable.
    fn queue(&self, job: Job) -> Result<(), PersistenceDisabled>;

    /// Whether [`JobRunner::queue`] can currently succeed.
    fn is_enabled(&self) -> bool;
}

/// Run `work` on the job thread and wait for its result.
///
/// Must not be called from inside a job.
pub fn run_blocking<T, F>(runner: &dyn JobRunner, work: F) -> Result<T, PersistenceDisabled>
where
    T: Send + 'static,
    F: FnOnce() -> (T, bool) + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    runner.queue(Box::new(move || {
        let (value, changed) = work();
        let _ = tx.send(value);
        changed
    }))?;
    rx.recv().map_err(|_| PersistenceDisabled)
}

/// Runner backed by one worker thread draining an ordered channel.
pub struct SerialJobRunner {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialJobRunner {
    /// Start the worker. `checkpoint` runs after every job that changed state.
    pub fn start(mut checkpoint: Option<Checkpoint>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name("fcp-jobs".into())
            .spawn(move || {
                for job in rx {
                    let changed = job();
                    if changed {
                        if let Some(hook) = checkpoint.as_mut() {
                            hook();
                        }
                    }
                }
                debug!("persistent job runner stopped");
            })?;
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop accepting jobs, finish queued ones and join the worker.
    pub fn shutdown(&self) {
        lock(&self.sender).take();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                error!("persistent job runner panicked");
            }
        }
    }
}

impl JobRunner for SerialJobRunner {
    fn queue(&self, job: Job) -> Result<(), PersistenceDisabled> {
        let sender = lock(&self.sender);
        match sender.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| {
                warn!("persistent job runner is gone");
                PersistenceDisabled
            }),
            None => Err(PersistenceDisabled),
        }
    }

    fn is_enabled(&self) -> bool {
        lock(&self.sender).is_some()
    }
}

impl Drop for SerialJobRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runner used when no durable store is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledJobRunner;

impl JobRunner for DisabledJobRunner {
    fn queue(&self, _job: Job) -> Result<(), PersistenceDisabled> {
        Err(PersistenceDisabled)
    }

    fn is_enabled(&self) -> bool {
        false
    }
}
