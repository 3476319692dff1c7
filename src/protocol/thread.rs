use std::{
    any::Any,
    fmt::Display,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, mpsc},
    thread,
};

use log::{debug, error, warn};
use parking_lot::Mutex;
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
#[error("worker pool '{0}' is shut down")]
pub struct PoolClosed(pub String);

/// Fixed set of worker threads draining a shared job queue.
///
/// A panicking job is logged and the worker keeps serving; it never takes the pool or the
/// process down with it.
#[derive(Debug)]
pub struct ThreadPool {
    name: String,
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        let size = size.max(1);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::new(name, i, Arc::clone(&receiver))?);
        }

        Ok(Self {
            name: name.to_string(),
            workers,
            sender,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        self.sender
            .as_ref()
            .ok_or_else(|| PoolClosed(self.name.clone()))?
            .send(job)
            .map_err(|_| PoolClosed(self.name.clone()))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}-{}", self.name, worker.id);

            // The last handle can be released by one of our own jobs.
            if worker.thread.thread().id() == current {
                continue;
            }
            if worker.thread.join().is_err() {
                warn!("worker {}-{} exited abnormally", self.name, worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(pool: &str, id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> io::Result<Self> {
        let name = format!("{pool}-{id}");
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            loop {
                let msg = receiver.lock().recv();
                match msg {
                    Ok(job) => {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                            error!("job on {name} panicked: {}", panic_message(&*payload));
                        }
                    }
                    Err(_) => {
                        debug!("worker {name} disconnected!");
                        break;
                    }
                }
            }
        })?;

        Ok(Self { id, thread })
    }
}

/// Spawns a named thread whose failures stay local: an `Err` is logged as a warning and a
/// panic is caught and logged as an error.
pub fn spawn_supervised<F, E>(name: String, f: F) -> io::Result<thread::JoinHandle<()>>
where
    F: FnOnce() -> Result<(), E> + Send + 'static,
    E: Display,
{
    thread::Builder::new().name(name.clone()).spawn(move || {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => debug!("{name} finished"),
            Ok(Err(e)) => warn!("{name} failed: {e}"),
            Err(payload) => error!("{name} panicked: {}", panic_message(&*payload)),
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
