//! Container that creates [`Worker`] instances and owns the async runtime driving them.

use crate::worker::{Worker, WorkerSettings};
use async_executor::Executor;
use event_listener_primitives::{Bag, HandlerId};
use futures_lite::future;
use log::*;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Default)]
struct Handlers {
    new_worker: Bag<Box<dyn Fn(&Worker) + Send + Sync>>,
}

struct Inner {
    executor: Arc<Executor<'static>>,
    worker_binary: PathBuf,
    handlers: Handlers,
    /// Dropping the sender stops the executor thread.
    _stop_sender: async_oneshot::Sender<()>,
}

/// Container that creates [`Worker`] instances and owns the thread driving their I/O.
///
/// The manager must be kept alive for as long as any of the workers created through it (workers
/// hold a reference to it themselves, so this happens naturally).
#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl WorkerManager {
    /// Create a new worker manager that will spawn the given worker binary.
    pub fn new(worker_binary: PathBuf) -> Self {
        let executor = Arc::new(Executor::new());
        let (stop_sender, stop_receiver) = async_oneshot::oneshot::<()>();
        {
            let executor = Arc::clone(&executor);
            thread::Builder::new()
                .name("worker-manager".to_string())
                .spawn(move || {
                    let _ = future::block_on(executor.run(stop_receiver));
                })
                .expect("Failed to spawn worker manager thread");
        }

        let inner = Arc::new(Inner {
            executor,
            worker_binary,
            handlers: Handlers::default(),
            _stop_sender: stop_sender,
        });

        Self { inner }
    }

    /// Create a worker: spawn the subprocess and wait for its readiness handshake.
    pub async fn create_worker(&self, worker_settings: WorkerSettings) -> io::Result<Worker> {
        debug!("create_worker()");

        let worker = Worker::new(
            Arc::clone(&self.inner.executor),
            self.inner.worker_binary.clone(),
            worker_settings,
            self.clone(),
        )
        .await?;

        self.inner.handlers.new_worker.call(|callback| {
            callback(&worker);
        });

        Ok(worker)
    }

    /// Callback is called when a new worker is created.
    pub fn on_new_worker<F: Fn(&Worker) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.new_worker.add(Box::new(callback))
    }
}
