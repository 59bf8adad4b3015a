//! Background flush worker
//!
//! Durability is decoupled from the append path: appends only hit the page
//! cache, and a single dedicated thread issues the actual `fdatasync` calls.
//! The partition log enqueues `(data, index)` descriptor pairs whenever a
//! soft flush trigger fires; the worker drains the mailbox and syncs both
//! files of each pair. Flush jobs are not cancellable.
//!
//! The mailbox is a mutex-guarded queue with a condvar; shutdown is a
//! sentinel job so the worker never has to poll.

use crate::segment::FdHandle;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

enum FlushJob {
    Sync { data: FdHandle, index: FdHandle },
    Shutdown,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<FlushJob>>,
    available: Condvar,
}

/// Producer handle for the flush mailbox. Clonable and cheap; one per
/// partition log.
#[derive(Clone)]
pub struct Flusher {
    mailbox: Arc<Mailbox>,
}

impl Flusher {
    /// Enqueue a durable flush of a segment's data and index files.
    ///
    /// The handles are cloned into the job, so the files stay open until the
    /// sync has been issued even if the segment is dropped meanwhile.
    pub fn schedule(&self, data: FdHandle, index: FdHandle) {
        let mut queue = self.mailbox.queue.lock();
        queue.push_back(FlushJob::Sync { data, index });
        drop(queue);
        self.mailbox.available.notify_one();
    }

    /// A no-op flusher for contexts that do not want durability scheduling
    /// (tests, offline tooling).
    pub fn disconnected() -> Self {
        Self {
            mailbox: Arc::new(Mailbox::default()),
        }
    }
}

/// The worker thread around the flush mailbox.
pub struct FlushWorker {
    mailbox: Arc<Mailbox>,
    handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    /// Spawn the worker thread.
    pub fn spawn() -> Self {
        let mailbox = Arc::new(Mailbox::default());
        let thread_mailbox = Arc::clone(&mailbox);
        let handle = std::thread::Builder::new()
            .name("tank-flush".to_string())
            .spawn(move || run(thread_mailbox))
            .expect("failed to spawn flush worker thread");

        Self {
            mailbox,
            handle: Some(handle),
        }
    }

    /// Producer handle feeding this worker.
    pub fn flusher(&self) -> Flusher {
        Flusher {
            mailbox: Arc::clone(&self.mailbox),
        }
    }

    /// Drain outstanding jobs and stop the thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            {
                let mut queue = self.mailbox.queue.lock();
                queue.push_back(FlushJob::Shutdown);
            }
            self.mailbox.available.notify_one();
            if handle.join().is_err() {
                warn!("flush worker thread panicked");
            }
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(mailbox: Arc<Mailbox>) {
    loop {
        let job = {
            let mut queue = mailbox.queue.lock();
            loop {
                match queue.pop_front() {
                    Some(job) => break job,
                    None => mailbox.available.wait(&mut queue),
                }
            }
        };

        match job {
            FlushJob::Shutdown => {
                debug!("flush worker stopping");
                return;
            }
            FlushJob::Sync { data, index } => {
                if let Err(e) = data.sync_data() {
                    warn!(error = %e, "segment data fsync failed");
                }
                if let Err(e) = index.sync_data() {
                    warn!(error = %e, "segment index fsync failed");
                }
            }
        }
    }
}
