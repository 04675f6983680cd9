//! Process-wide event dispatcher
//!
//! The dispatcher is the single entry point for the instrumentation source.
//! For every before/after/exception call it resolves the current thread's
//! tree (creating a fresh one if the last generation completed), does the
//! identity bookkeeping, forwards the event to the tree, fires observers
//! synchronously, and — once a tree is final — hands it to the processor
//! pipeline.
//!
//! All shared state (thread→tree registry, identity registry, pipeline) is
//! owned by one dispatcher instance, not globals, so construction and
//! teardown order stay explicit. The registry lock and the identity lock are
//! separate and every critical section is O(1).

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tracing::{debug, error, warn};

use crate::config::TraceConfig;
use crate::event::Value;
use crate::identity::{ClassName, IdentityRegistry, ObjRef, TaggedRef};
use crate::observer::TraceObserver;
use crate::pipeline::ProcessorPipeline;
use crate::processor::TreeProcessor;
use crate::signature;
use crate::tree::CallTree;

/// Coordinates trees, identities, observers and the pipeline.
///
/// Constructed through [`EventDispatcher::builder`]; observers and
/// processors are registered up front and fire in registration order.
pub struct EventDispatcher {
    config: TraceConfig,
    identity: IdentityRegistry,
    trees: Mutex<HashMap<ThreadId, Arc<Mutex<CallTree>>>>,
    observers: Vec<Box<dyn TraceObserver>>,
    pipeline: ProcessorPipeline,
}

/// Builder for [`EventDispatcher`].
#[derive(Default)]
pub struct DispatcherBuilder {
    config: TraceConfig,
    observers: Vec<Box<dyn TraceObserver>>,
    processors: Vec<Box<dyn TreeProcessor>>,
}

impl DispatcherBuilder {
    pub fn config(mut self, config: TraceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Box<dyn TraceObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn processor(mut self, processor: Box<dyn TreeProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn build(self) -> EventDispatcher {
        let identify = self.config.identify;
        EventDispatcher {
            config: self.config,
            identity: IdentityRegistry::new(identify),
            trees: Mutex::new(HashMap::new()),
            observers: self.observers,
            pipeline: ProcessorPipeline::new(self.processors),
        }
    }
}

impl EventDispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn identity(&self) -> &IdentityRegistry {
        &self.identity
    }

    pub fn pipeline(&self) -> &ProcessorPipeline {
        &self.pipeline
    }

    /// Notifies observers that instrumented code from `class` was loaded.
    pub fn class_transformed(&self, class: &ClassName, signatures: &[&str]) {
        debug!(class = %class, methods = signatures.len(), "class transformed");
        self.fire(|obs| obs.on_class_transformed(class));
        for sig in signatures {
            self.fire(|obs| obs.on_method_transformed(class, sig));
        }
    }

    pub fn before_constructor(
        &self,
        class: ClassName,
        sig: &str,
        mut params: Vec<Value>,
        has_params: bool,
    ) {
        debug!(class = %class, "constructor started");
        if has_params {
            self.tag_params(&mut params);
        } else {
            params.clear();
        }
        let tree = self.current_tree();
        let Ok(mut guard) = tree.lock() else { return };
        match guard.before_constructor(class, sig, params) {
            Ok(id) => {
                let event = guard.event(id);
                self.fire(|obs| obs.on_constructor_start(event));
            }
            Err(err) => error!(sig, error = %err, "before_constructor rejected"),
        }
    }

    pub fn after_constructor(&self, object: ObjRef) {
        debug!(class = %object.class(), "constructor ended");
        let tree = self.current_tree();
        let mut completed = false;
        {
            let Ok(mut guard) = tree.lock() else { return };
            match guard.after_constructor(object.clone()) {
                Ok(id) => {
                    let delegated = guard
                        .event(id)
                        .as_constructor()
                        .is_some_and(|call| call.is_delegated());
                    if !delegated {
                        // Only the outermost constructor establishes the
                        // object's identity; delegated ancestors are
                        // retrofitted from here.
                        let object_id = self.identity.identify(&object);
                        guard.assign_constructed_identity(id, object_id);
                    }
                    let event = guard.event(id);
                    self.fire(|obs| obs.on_constructor_end(event));
                    completed = guard.is_final();
                }
                Err(err) => error!(error = %err, "after_constructor rejected"),
            }
        }
        if completed {
            self.hand_off(tree);
        }
    }

    pub fn before_static_method(
        &self,
        class: ClassName,
        sig: &str,
        mut params: Vec<Value>,
        has_params: bool,
    ) {
        debug!(method = signature::without_parameters(sig), "static method started");
        if has_params {
            self.tag_params(&mut params);
        } else {
            params.clear();
        }
        let tree = self.current_tree();
        let Ok(mut guard) = tree.lock() else { return };
        match guard.before_static_method(class, sig, params) {
            Ok(id) => {
                let event = guard.event(id);
                self.fire(|obs| obs.on_static_method_start(event));
            }
            Err(err) => error!(sig, error = %err, "before_static_method rejected"),
        }
    }

    pub fn after_static_method(
        &self,
        class: &ClassName,
        sig: &str,
        returned: Option<Value>,
        has_return: bool,
    ) {
        debug!(class = %class, method = signature::without_parameters(sig), "static method ended");
        let returned = self.tag_return(returned, has_return);
        let tree = self.current_tree();
        let mut completed = false;
        {
            let Ok(mut guard) = tree.lock() else { return };
            match guard.after_static_method(returned) {
                Ok(id) => {
                    let event = guard.event(id);
                    self.fire(|obs| obs.on_static_method_end(event));
                    completed = guard.is_final();
                }
                Err(err) => error!(sig, error = %err, "after_static_method rejected"),
            }
        }
        if completed {
            self.hand_off(tree);
        }
    }

    pub fn before_method(
        &self,
        receiver: ObjRef,
        sig: &str,
        mut params: Vec<Value>,
        has_params: bool,
    ) {
        debug!(method = signature::without_parameters(sig), "method started");
        if has_params {
            self.tag_params(&mut params);
        } else {
            params.clear();
        }
        let receiver_id = self.identity.identify(&receiver);
        let tree = self.current_tree();
        let Ok(mut guard) = tree.lock() else { return };
        match guard.before_method(TaggedRef::new(receiver, receiver_id), sig, params) {
            Ok(id) => {
                let event = guard.event(id);
                self.fire(|obs| obs.on_method_start(event));
            }
            Err(err) => error!(sig, error = %err, "before_method rejected"),
        }
    }

    pub fn after_method(
        &self,
        receiver: &ObjRef,
        sig: &str,
        returned: Option<Value>,
        has_return: bool,
    ) {
        debug!(class = %receiver.class(), method = signature::without_parameters(sig), "method ended");
        let returned = self.tag_return(returned, has_return);
        let tree = self.current_tree();
        let mut completed = false;
        {
            let Ok(mut guard) = tree.lock() else { return };
            match guard.after_method(returned) {
                Ok(id) => {
                    let event = guard.event(id);
                    self.fire(|obs| obs.on_method_end(event));
                    completed = guard.is_final();
                }
                Err(err) => error!(sig, error = %err, "after_method rejected"),
            }
        }
        if completed {
            self.hand_off(tree);
        }
    }

    /// Records a thrown exception in the current thread's tree.
    ///
    /// Exceptions are identified like constructed objects: an exception seen
    /// again (rethrown, unwound further) keeps its id.
    pub fn exception(&self, exception: ObjRef) {
        debug!(class = %exception.class(), "exception thrown");
        let exception_id = self.identity.identify(&exception);
        let tree = self.current_tree();
        let mut completed = false;
        {
            let Ok(mut guard) = tree.lock() else { return };
            match guard.exception(TaggedRef::new(exception, exception_id)) {
                Ok(id) => {
                    let event = guard.event(id);
                    self.fire(|obs| obs.on_exception(event));
                    completed = guard.is_final();
                }
                Err(err) => error!(error = %err, "exception event rejected"),
            }
        }
        if completed {
            self.hand_off(tree);
        }
    }

    /// Snapshot of every thread's live tree.
    pub fn sequences(&self) -> Vec<Arc<Mutex<CallTree>>> {
        match self.trees.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Best-effort drain: flushes every thread's non-final tree into the
    /// pipeline exactly as built (the safety net for frames the
    /// instrumentation layer never closed), fires each observer's
    /// `on_shut_down` once, then blocks until the pipeline worker is done.
    pub fn shutdown(&self) {
        debug!("dispatcher shutting down");
        let drained: Vec<Arc<Mutex<CallTree>>> = match self.trees.lock() {
            Ok(mut map) => map.drain().map(|(_, tree)| tree).collect(),
            Err(_) => Vec::new(),
        };
        if self.config.flush_on_shutdown {
            for tree in drained {
                let snapshot = match Arc::try_unwrap(tree) {
                    Ok(mutex) => mutex.into_inner().unwrap_or_else(|poison| poison.into_inner()),
                    Err(shared) => match shared.lock() {
                        Ok(guard) => guard.clone(),
                        Err(_) => continue,
                    },
                };
                // Final trees were already handed off when they completed;
                // trees that never saw an event carry nothing worth flushing.
                if !snapshot.is_final() && snapshot.root().is_some() {
                    warn!(
                        events = snapshot.event_count(),
                        "flushing incomplete call sequence at shutdown"
                    );
                    self.pipeline.enqueue(Arc::new(snapshot));
                }
            }
        }
        self.fire(|obs| obs.on_shut_down());
        self.pipeline.wait_idle();
    }

    /// Opportunistically tags object-valued parameters with already-known
    /// identities. First sight of an object as an argument never assigns.
    fn tag_params(&self, params: &mut [Value]) {
        for value in params {
            let known = value.obj().and_then(|obj| self.identity.probe(obj));
            if let Some(id) = known {
                value.tag(id);
            }
        }
    }

    fn tag_return(&self, returned: Option<Value>, has_return: bool) -> Option<Value> {
        if !has_return {
            return None;
        }
        returned.map(|mut value| {
            let known = value.obj().and_then(|obj| self.identity.probe(obj));
            if let Some(id) = known {
                value.tag(id);
            }
            value
        })
    }

    /// Resolves the calling thread's live tree, replacing a finalized (or
    /// missing) entry with a fresh generation.
    fn current_tree(&self) -> Arc<Mutex<CallTree>> {
        let thread_id = thread::current().id();
        match self.trees.lock() {
            Ok(mut map) => {
                let replace = match map.get(&thread_id) {
                    None => true,
                    Some(tree) => tree.lock().map(|guard| guard.is_final()).unwrap_or(true),
                };
                if replace {
                    let tree = Arc::new(Mutex::new(CallTree::for_current_thread()));
                    map.insert(thread_id, Arc::clone(&tree));
                    tree
                } else {
                    Arc::clone(&map[&thread_id])
                }
            }
            Err(_) => {
                // Registry poisoned: trace into an unregistered tree rather
                // than disturb the instrumented thread. It will not be
                // flushed at shutdown.
                warn!("thread registry poisoned, using unregistered tree");
                Arc::new(Mutex::new(CallTree::for_current_thread()))
            }
        }
    }

    /// Moves a completed tree out of the registry and into the pipeline.
    fn hand_off(&self, tree: Arc<Mutex<CallTree>>) {
        if let Ok(mut map) = self.trees.lock() {
            let thread_id = thread::current().id();
            if map
                .get(&thread_id)
                .is_some_and(|entry| Arc::ptr_eq(entry, &tree))
            {
                map.remove(&thread_id);
            }
        }
        match Arc::try_unwrap(tree) {
            Ok(mutex) => {
                let tree = mutex.into_inner().unwrap_or_else(|poison| poison.into_inner());
                self.pipeline.enqueue(Arc::new(tree));
            }
            // Shutdown is holding a snapshot handle; clone so the pipeline
            // still sees exactly one finished tree per completion.
            Err(shared) => {
                if let Ok(guard) = shared.lock() {
                    self.pipeline.enqueue(Arc::new(guard.clone()));
                }
            }
        }
    }

    /// Invokes `action` for every observer in registration order. A panic in
    /// one observer is caught and logged; it never reaches the traced
    /// program and never blocks the remaining observers.
    fn fire<F: Fn(&dyn TraceObserver)>(&self, action: F) {
        for observer in &self.observers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| action(observer.as_ref())));
            if outcome.is_err() {
                error!("observer callback panicked");
            }
        }
    }
}
