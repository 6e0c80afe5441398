//! Background job pool for network retrieval.
//!
//! Retrieval must not block the caller: `retrieve()` returns immediately and
//! the result lands later via observer callbacks. Jobs run on a small thread
//! pool fed from a single injector queue. Staleness of results is the
//! caller's concern; the pool runs everything it is handed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool.
pub struct Workers {
    injector: Option<Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Workers {
    /// Spawn `num_threads` workers.
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let (tx, rx) = unbounded::<Job>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(num_threads);

        for worker_id in 0..num_threads {
            let rx: Receiver<Job> = rx.clone();
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("telesync-worker-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);
                    loop {
                        match rx.recv_timeout(Duration::from_millis(50)) {
                            Ok(job) => job(),
                            Err(RecvTimeoutError::Timeout) => {
                                if shutdown.load(Ordering::Relaxed) {
                                    break;
                                }
                            }
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    trace!("Worker {} stopped", worker_id);
                })
                .expect("Failed to spawn worker thread");
            handles.push(handle);
        }

        trace!("Workers initialized: {} threads", num_threads);

        Self { injector: Some(tx), handles, shutdown }
    }

    /// Run closure on a worker thread. No return value; use callbacks or
    /// channels for results.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(tx) = &self.injector {
            let _ = tx.send(Box::new(f));
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        use std::time::Instant;

        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);
        // Closing the injector wakes idle workers immediately
        self.injector.take();

        // Wait with timeout; threads still running at the deadline die with
        // the process
        let deadline = Instant::now() + Duration::from_millis(500);
        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, exiting anyway");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} workers stopped gracefully", num_threads);
    }
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers")
            .field("threads", &self.handles.len())
            .finish()
    }
}
