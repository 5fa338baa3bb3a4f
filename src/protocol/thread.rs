use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, error};

/// Fixed set of named worker threads running the same loop body.
///
/// Each worker is given its index; the body is expected to return once the
/// resource it drains (usually a completion queue) has been shut down.
/// Dropping the pool joins every worker.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn spawn<F>(name: &str, size: usize, body: F) -> io::Result<Self>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        assert!(size > 0);

        let body = Arc::new(body);
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            workers.push(Worker::new(name, id, Arc::clone(&body))?);
        }

        Ok(Self {
            name: name.to_string(),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn join(&mut self) {
        for worker in self.workers.drain(..) {
            debug!("shutting down {} worker {}", self.name, worker.id);

            if worker.thread.join().is_err() {
                error!("{} worker {} panicked", self.name, worker.id);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: JoinHandle<()>,
}

impl Worker {
    fn new<F>(name: &str, id: usize, body: Arc<F>) -> io::Result<Self>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let thread = thread::Builder::new()
            .name(format!("{name}-{id}"))
            .spawn(move || {
                debug!("worker {id} started");
                body(id);
                debug!("worker {id} stopped");
            })?;

        Ok(Self { id, thread })
    }
}
