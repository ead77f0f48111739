//! Fixed pool of worker threads fed through a rendezvous queue.
//!
//! The queue has no depth: a submission succeeds only by handing the task to
//! a worker directly. `add` blocks until a worker is free; `try_add` refuses
//! instead, returning the task so the caller can retry it later.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use tracing::{error, trace};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(nb_workers: usize) -> Self {
        let (sender, receiver) = bounded::<Task>(0);
        let workers = (0..nb_workers.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("cascade-worker-{id}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                        }
                        trace!(worker = id, "worker exiting");
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn nb_workers(&self) -> usize {
        self.workers.len()
    }

    /// Hands `task` to a worker, blocking until one is free.
    pub fn add(&self, task: Task) {
        let Some(sender) = &self.sender else { return };
        if sender.send(task).is_err() {
            error!("worker pool disconnected; task dropped");
        }
    }

    /// Hands `task` to a worker only if one is parked right now; otherwise
    /// the task comes back to the caller.
    pub fn try_add(&self, task: Task) -> std::result::Result<(), Task> {
        let Some(sender) = &self.sender else {
            return Err(task);
        };
        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => Err(task),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.sender.take(); // close the queue, workers drain and exit
        for handle in self.workers.drain(..) {
            if let Err(payload) = handle.join() {
                let details = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                error!(%details, "worker thread panicked");
            }
        }
    }
}
