//! Asynchronous processor contract

use crate::tree::CallTree;

/// Batch consumer of completed call-sequence trees.
///
/// Processors run on the pipeline's single background worker, one tree at a
/// time, in registration order — no two trees are ever handed to processors
/// concurrently. The received tree is logically immutable and may be read
/// concurrently by other processors holding the same tree.
///
/// The pipeline does not isolate processor failures; a well-behaved processor
/// isolates its own so one broken processor does not starve the others.
/// Shutdown-flushed trees may arrive non-final, with an open root.
pub trait TreeProcessor: Send + Sync {
    fn process_sequence(&self, tree: &CallTree);
}

impl<T: TreeProcessor + ?Sized> TreeProcessor for std::sync::Arc<T> {
    fn process_sequence(&self, tree: &CallTree) {
        (**self).process_sequence(tree);
    }
}
