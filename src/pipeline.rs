//! Asynchronous processor pipeline
//!
//! Completed trees are queued here and drained by a single background worker
//! that hands each tree, sequentially, to every registered processor. The
//! worker is started lazily on the first enqueue and terminates once the
//! queue runs dry, so no thread idles while the traced program is quiet.
//!
//! Two locks, deliberately separate: the queue lock guards the FIFO and is
//! never held while starting a thread; the running lock guards the
//! worker-exists flag. A worker is only spawned inside the running-lock
//! critical section after the push made the queue non-empty, and the worker
//! re-checks the queue under the running lock before clearing the flag —
//! together this rules out both double-starts and stranded trees.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::processor::TreeProcessor;
use crate::tree::CallTree;

struct PipelineShared {
    queue: Mutex<VecDeque<Arc<CallTree>>>,
    running: Mutex<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    processors: Vec<Box<dyn TreeProcessor>>,
}

/// Single-worker pipeline feeding completed trees to processors.
pub struct ProcessorPipeline {
    shared: Arc<PipelineShared>,
}

impl ProcessorPipeline {
    pub fn new(processors: Vec<Box<dyn TreeProcessor>>) -> Self {
        ProcessorPipeline {
            shared: Arc::new(PipelineShared {
                queue: Mutex::new(VecDeque::new()),
                running: Mutex::new(false),
                handle: Mutex::new(None),
                processors,
            }),
        }
    }

    pub fn has_processors(&self) -> bool {
        !self.shared.processors.is_empty()
    }

    /// Appends a completed tree to the FIFO and starts a worker if none is
    /// running.
    ///
    /// This is the only synchronous cost a completed tree imposes on the
    /// traced thread: one queue push and, at most, one thread spawn.
    pub fn enqueue(&self, tree: Arc<CallTree>) {
        if !self.has_processors() {
            return;
        }
        match self.shared.queue.lock() {
            Ok(mut queue) => queue.push_back(tree),
            Err(_) => {
                error!("pipeline queue lock poisoned, dropping tree");
                return;
            }
        }
        let Ok(mut running) = self.shared.running.lock() else {
            error!("pipeline running lock poisoned, tree left queued");
            return;
        };
        if *running && self.worker_died() {
            // A processor panicked and took the worker with it. Collect the
            // corpse and start over.
            *running = false;
        }
        if !*running {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name("trazar-pipeline".into())
                .spawn(move || worker_loop(&shared));
            match spawned {
                Ok(handle) => {
                    *running = true;
                    if let Ok(mut slot) = self.shared.handle.lock() {
                        *slot = Some(handle);
                    }
                }
                Err(err) => error!(error = %err, "failed to spawn pipeline worker"),
            }
        }
    }

    /// Trees queued but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    /// Blocks until the queue has drained and the worker has terminated.
    ///
    /// Called at shutdown: the pipeline must outlive the traced program's
    /// own threads to finish shutdown-time work, and unlike a JVM non-daemon
    /// thread, a Rust thread does not keep the process alive on its own.
    pub fn wait_idle(&self) {
        loop {
            let handle = match self.shared.handle.lock() {
                Ok(mut slot) => slot.take(),
                Err(_) => return,
            };
            match handle {
                Some(handle) => {
                    if handle.join().is_err() {
                        error!("pipeline worker panicked inside a processor");
                        if let Ok(mut running) = self.shared.running.lock() {
                            *running = false;
                        }
                    }
                }
                None => return,
            }
        }
    }

    /// True when the running flag is set but the worker thread has already
    /// terminated — only possible if a processor panicked, since a clean
    /// exit clears the flag before the thread ends.
    fn worker_died(&self) -> bool {
        self.shared
            .handle
            .lock()
            .map(|slot| slot.as_ref().is_some_and(JoinHandle::is_finished))
            .unwrap_or(false)
    }
}

fn worker_loop(shared: &PipelineShared) {
    loop {
        let tree = shared
            .queue
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        match tree {
            Some(tree) => {
                debug!(events = tree.event_count(), "processing call sequence");
                for processor in &shared.processors {
                    processor.process_sequence(&tree);
                }
            }
            None => {
                let Ok(mut running) = shared.running.lock() else {
                    return;
                };
                let refilled = shared
                    .queue
                    .lock()
                    .map(|queue| !queue.is_empty())
                    .unwrap_or(false);
                if refilled {
                    continue;
                }
                *running = false;
                return;
            }
        }
    }
}
