//! Worker Pool
//!
//! Fixed-width pool of named OS threads fed by an mpsc channel. The
//! controller submits jobs without blocking; `stop` drains in-flight jobs
//! and joins every thread.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

/// Fixed-width thread pool
pub struct WorkerPool {
    name: String,
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    /// Spawn `width` worker threads named `<name>-<n>`
    pub fn start(name: &str, width: usize) -> Result<Self> {
        if width == 0 {
            return Err(Error::Internal(format!(
                "worker pool {} needs a positive width",
                name
            )));
        }

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(width);
        for n in 0..width {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, n))
                .spawn(move || worker_loop(receiver))
                .map_err(|e| {
                    Error::Internal(format!("failed to start worker pool {}: {}", name, e))
                })?;
            handles.push(handle);
        }

        tracing::debug!(pool = name, width, "worker pool started");
        Ok(Self {
            name: name.to_string(),
            inner: Mutex::new(PoolInner {
                sender: Some(sender),
                handles,
            }),
        })
    }

    /// Submit a job; silently dropped after `stop`
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = self.inner.lock();
        if let Some(sender) = &inner.sender {
            let _ = sender.send(Box::new(job));
        }
    }

    /// Drain queued jobs and join every worker thread
    pub fn stop(&self) {
        let (sender, handles) = {
            let mut inner = self.inner.lock();
            (inner.sender.take(), std::mem::take(&mut inner.handles))
        };
        drop(sender);
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!(pool = %self.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        // the guard is released as soon as recv returns
        let job = match receiver.lock().recv() {
            Ok(job) => job,
            Err(_) => break,
        };
        job();
    }
}
