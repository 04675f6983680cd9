//! Per-thread call-sequence trees
//!
//! A [`CallTree`] turns the instrumentation source's before/after/exception
//! stream for one thread into a hierarchical tree of [`Event`] nodes. The
//! tree keeps an explicit LIFO stack of open calls; the first event becomes
//! the root, and the tree is *final* once the root exists and the stack is
//! empty. A final tree accepts no further events — the dispatcher starts a
//! fresh tree on the next event from that thread.
//!
//! Trees are thread-affine while they are being built and logically immutable
//! once handed to the processor pipeline.

use std::thread::{self, ThreadId};
use std::time::Instant;

use thiserror::Error;

use crate::event::{
    ConstructorCall, Event, EventId, EventKind, EventPayload, EventSubject, ExceptionRecord,
    MethodCall, StaticCall, Value,
};
use crate::identity::{ClassName, ObjRef, TaggedRef};

/// Contract violations of the instrumentation source.
///
/// These are programming errors of the external collaborator (before/after
/// calls not paired in proper stack order, or events sent to a tree that has
/// already completed). They are fatal to the local operation and never
/// retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("call tree is final and accepts no further events")]
    TreeFinal,

    #[error("no open call to close")]
    NoOpenCall,

    #[error("mismatched before/after pairing: expected {expected}, found {found}")]
    KindMismatch {
        expected: EventKind,
        found: EventKind,
    },
}

/// Call-sequence tree of one thread generation.
///
/// Nodes live in an arena (`Vec<Event>`) indexed by [`EventId`]; the tree
/// owns all nodes transitively from the root, and parent links are indices
/// used only for lookup.
#[derive(Clone, Debug)]
pub struct CallTree {
    thread_id: ThreadId,
    thread_name: Option<String>,
    events: Vec<Event>,
    stack: Vec<EventId>,
    root: Option<EventId>,
    completed: usize,
}

impl CallTree {
    /// Creates an empty tree bound to the calling thread.
    pub fn for_current_thread() -> Self {
        let current = thread::current();
        CallTree {
            thread_id: current.id(),
            thread_name: current.name().map(str::to_owned),
            events: Vec::new(),
            stack: Vec::new(),
            root: None,
            completed: 0,
        }
    }

    /// Id of the thread this tree was built on.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Name of the thread this tree was built on, if it had one.
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// A tree is final iff a root exists and the open-call stack is empty.
    pub fn is_final(&self) -> bool {
        self.root.is_some() && self.stack.is_empty()
    }

    pub fn root(&self) -> Option<EventId> {
        self.root
    }

    /// Number of *completed* events.
    pub fn event_count(&self) -> usize {
        self.completed
    }

    /// Looks up a node by arena index.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not come from this tree.
    pub fn event(&self, id: EventId) -> &Event {
        &self.events[id.0]
    }

    /// The open event at the top of the stack, falling back to the root once
    /// the tree is final.
    pub fn current(&self) -> Option<EventId> {
        self.stack.last().copied().or(self.root)
    }

    /// The object (or class) the event with id `id` was called from: the
    /// subject of its parent event.
    pub fn calling_object(&self, id: EventId) -> Option<EventSubject<'_>> {
        let parent = self.event(id).parent()?;
        self.event(parent).subject()
    }

    /// Opens a constructor event. Must be closed by a matching
    /// [`CallTree::after_constructor`].
    pub fn before_constructor(
        &mut self,
        class: ClassName,
        signature: &str,
        params: Vec<Value>,
    ) -> Result<EventId, TreeError> {
        let payload = EventPayload::Constructor(ConstructorCall {
            class,
            params,
            constructed: None,
            identity: None,
            delegated: false,
        });
        self.push_open(signature, payload)
    }

    /// Closes the innermost open constructor with the object it produced.
    ///
    /// The node is flagged as a delegated superclass-constructor call when
    /// the class named at the call site differs from the object's exact
    /// runtime class. Identity is attached separately via
    /// [`CallTree::assign_constructed_identity`], only once the outermost
    /// constructor has completed.
    pub fn after_constructor(&mut self, object: ObjRef) -> Result<EventId, TreeError> {
        let id = self.close_top(EventKind::Constructor)?;
        if let EventPayload::Constructor(call) = &mut self.events[id.0].payload {
            call.delegated = call.class.as_ref() != object.class().as_ref();
            call.constructed = Some(object);
        }
        Ok(id)
    }

    /// Attaches the constructed object's identity to a completed constructor
    /// node and propagates it depth-first to descendants flagged as
    /// delegated, stopping at any node that is not a delegated constructor.
    pub fn assign_constructed_identity(&mut self, id: EventId, object_id: i32) {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if let EventPayload::Constructor(call) = &mut self.events[current.0].payload {
                if let Some(obj) = call.constructed.clone() {
                    call.identity = Some(TaggedRef::new(obj, object_id));
                }
            }
            let children: Vec<EventId> = self.events[current.0].children.clone();
            for child in children {
                if let EventPayload::Constructor(call) = &self.events[child.0].payload {
                    if call.delegated {
                        pending.push(child);
                    }
                }
            }
        }
    }

    /// Opens an instance method event.
    pub fn before_method(
        &mut self,
        receiver: TaggedRef,
        signature: &str,
        params: Vec<Value>,
    ) -> Result<EventId, TreeError> {
        let payload = EventPayload::Method(MethodCall {
            receiver,
            params,
            ret: None,
        });
        self.push_open(signature, payload)
    }

    /// Closes the innermost open method, attaching its return value
    /// (`None` for void methods).
    pub fn after_method(&mut self, returned: Option<Value>) -> Result<EventId, TreeError> {
        let id = self.close_top(EventKind::Method)?;
        if let EventPayload::Method(call) = &mut self.events[id.0].payload {
            call.ret = returned;
        }
        Ok(id)
    }

    /// Opens a static method event.
    pub fn before_static_method(
        &mut self,
        class: ClassName,
        signature: &str,
        params: Vec<Value>,
    ) -> Result<EventId, TreeError> {
        let payload = EventPayload::StaticMethod(StaticCall {
            class,
            params,
            ret: None,
        });
        self.push_open(signature, payload)
    }

    /// Closes the innermost open static method.
    pub fn after_static_method(&mut self, returned: Option<Value>) -> Result<EventId, TreeError> {
        let id = self.close_top(EventKind::StaticMethod)?;
        if let EventPayload::StaticMethod(call) = &mut self.events[id.0].payload {
            call.ret = returned;
        }
        Ok(id)
    }

    /// Records a thrown exception as a closed leaf under the current open
    /// call.
    ///
    /// Both timestamps are stamped at creation and the stack depth never
    /// changes: the node marks "an exception occurred here", it is not an
    /// open frame. On an empty tree the marker becomes the root and the tree
    /// is immediately final.
    pub fn exception(&mut self, exception: TaggedRef) -> Result<EventId, TreeError> {
        if self.is_final() {
            return Err(TreeError::TreeFinal);
        }
        let parent = self.current();
        let signature = exception.class().clone();
        let mut event = Event::open(
            parent,
            signature.as_ref(),
            EventPayload::Exception(ExceptionRecord { exception }),
        );
        event.ended = Some(Instant::now());

        let id = EventId(self.events.len());
        self.events.push(event);
        match parent {
            Some(parent_id) => self.events[parent_id.0].children.push(id),
            None => self.root = Some(id),
        }
        self.completed += 1;
        Ok(id)
    }

    /// Restartable pre-order traversal: parent before children, children in
    /// call order.
    pub fn iter(&self) -> PreOrder<'_> {
        PreOrder {
            tree: self,
            stack: self.root.into_iter().collect(),
        }
    }

    fn push_open(&mut self, signature: &str, payload: EventPayload) -> Result<EventId, TreeError> {
        if self.is_final() {
            return Err(TreeError::TreeFinal);
        }
        let parent = self.stack.last().copied();
        let id = EventId(self.events.len());
        self.events.push(Event::open(parent, signature, payload));
        match parent {
            Some(parent_id) => self.events[parent_id.0].children.push(id),
            None => self.root = Some(id),
        }
        self.stack.push(id);
        Ok(id)
    }

    fn close_top(&mut self, expected: EventKind) -> Result<EventId, TreeError> {
        if self.is_final() {
            return Err(TreeError::TreeFinal);
        }
        let id = *self.stack.last().ok_or(TreeError::NoOpenCall)?;
        let found = self.events[id.0].kind();
        if found != expected {
            return Err(TreeError::KindMismatch { expected, found });
        }
        self.stack.pop();
        self.events[id.0].ended = Some(Instant::now());
        self.completed += 1;
        Ok(id)
    }
}

/// Pre-order iterator over a tree's events, driven by an explicit stack.
pub struct PreOrder<'a> {
    tree: &'a CallTree,
    stack: Vec<EventId>,
}

impl<'a> Iterator for PreOrder<'a> {
    type Item = &'a Event;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let event = self.tree.event(id);
        // Children pushed in reverse so the first child is visited first.
        for &child in event.children().iter().rev() {
            self.stack.push(child);
        }
        Some(event)
    }
}

impl<'a> IntoIterator for &'a CallTree {
    type Item = &'a Event;
    type IntoIter = PreOrder<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn class(name: &str) -> ClassName {
        Arc::from(name)
    }

    fn receiver(addr: usize, name: &str, id: i32) -> TaggedRef {
        TaggedRef::new(ObjRef::new(addr, class(name)), id)
    }

    #[test]
    fn test_first_event_becomes_root() {
        let mut tree = CallTree::for_current_thread();
        let id = tree
            .before_method(receiver(0x1, "app.A", 0), "app.A.foo()", Vec::new())
            .unwrap();
        assert_eq!(tree.root(), Some(id));
        assert!(!tree.is_final());
        assert_eq!(tree.event_count(), 0);
    }

    #[test]
    fn test_nested_calls_build_parent_child_links() {
        let mut tree = CallTree::for_current_thread();
        let outer = tree
            .before_method(receiver(0x1, "app.A", 0), "app.A.foo()", Vec::new())
            .unwrap();
        let inner = tree
            .before_method(receiver(0x1, "app.A", 0), "app.A.bar()", Vec::new())
            .unwrap();

        assert_eq!(tree.event(inner).parent(), Some(outer));
        assert_eq!(tree.event(outer).children(), &[inner]);

        tree.after_method(None).unwrap();
        tree.after_method(Some(Value::rendered("42"))).unwrap();

        assert!(tree.is_final());
        assert_eq!(tree.event_count(), 2);
        let outer_event = tree.event(outer);
        assert_eq!(
            outer_event.as_method().unwrap().returned_value().unwrap().text(),
            "42"
        );
        assert!(outer_event.as_method().unwrap().has_return());
        assert!(!tree.event(inner).as_method().unwrap().has_return());
    }

    #[test]
    fn test_final_tree_rejects_further_events() {
        let mut tree = CallTree::for_current_thread();
        tree.before_method(receiver(0x1, "app.A", 0), "app.A.foo()", Vec::new())
            .unwrap();
        tree.after_method(None).unwrap();
        assert!(tree.is_final());

        let err = tree
            .before_method(receiver(0x1, "app.A", 0), "app.A.bar()", Vec::new())
            .unwrap_err();
        assert_eq!(err, TreeError::TreeFinal);
        let err = tree.after_method(None).unwrap_err();
        assert_eq!(err, TreeError::TreeFinal);
    }

    #[test]
    fn test_after_without_before_fails() {
        let mut tree = CallTree::for_current_thread();
        assert_eq!(tree.after_method(None).unwrap_err(), TreeError::NoOpenCall);
    }

    #[test]
    fn test_mismatched_pairing_is_fatal() {
        let mut tree = CallTree::for_current_thread();
        tree.before_constructor(class("app.A"), "app.A.<init>()", Vec::new())
            .unwrap();
        let err = tree.after_method(None).unwrap_err();
        assert_eq!(
            err,
            TreeError::KindMismatch {
                expected: EventKind::Method,
                found: EventKind::Constructor,
            }
        );
    }

    #[test]
    fn test_exception_is_a_closed_leaf_and_keeps_stack_depth() {
        let mut tree = CallTree::for_current_thread();
        let outer = tree
            .before_method(receiver(0x1, "app.A", 0), "app.A.foo()", Vec::new())
            .unwrap();
        let exc = tree
            .exception(receiver(0x2, "app.BoomError", 0))
            .unwrap();

        assert_eq!(tree.event(exc).parent(), Some(outer));
        assert!(!tree.event(exc).is_open());
        assert_eq!(tree.current(), Some(outer));

        // The enclosing frame can still complete normally.
        tree.after_method(None).unwrap();
        assert!(tree.is_final());
        assert_eq!(tree.event_count(), 2);
    }

    #[test]
    fn test_exception_on_empty_tree_becomes_final_root() {
        let mut tree = CallTree::for_current_thread();
        let exc = tree
            .exception(receiver(0x2, "app.BoomError", 0))
            .unwrap();
        assert_eq!(tree.root(), Some(exc));
        assert!(tree.is_final());
    }

    #[test]
    fn test_delegated_constructor_flag() {
        let mut tree = CallTree::for_current_thread();
        tree.before_constructor(class("app.Derived"), "app.Derived.<init>()", Vec::new())
            .unwrap();
        tree.before_constructor(class("app.Base"), "app.Base.<init>()", Vec::new())
            .unwrap();

        let instance = ObjRef::new(0x9, class("app.Derived"));
        let base = tree.after_constructor(instance.clone()).unwrap();
        let derived = tree.after_constructor(instance).unwrap();

        assert!(tree.event(base).as_constructor().unwrap().is_delegated());
        assert!(!tree.event(derived).as_constructor().unwrap().is_delegated());
    }

    #[test]
    fn test_identity_propagates_to_delegated_constructors_only() {
        let mut tree = CallTree::for_current_thread();
        tree.before_constructor(class("app.Derived"), "app.Derived.<init>()", Vec::new())
            .unwrap();
        tree.before_constructor(class("app.Base"), "app.Base.<init>()", Vec::new())
            .unwrap();
        // A helper object constructed inside the Base constructor: its class
        // matches the call site, so it is a regular constructor and must not
        // inherit the Derived identity.
        tree.before_constructor(class("app.Helper"), "app.Helper.<init>()", Vec::new())
            .unwrap();
        let helper = tree
            .after_constructor(ObjRef::new(0x5, class("app.Helper")))
            .unwrap();
        tree.assign_constructed_identity(helper, 7);

        let instance = ObjRef::new(0x9, class("app.Derived"));
        let base = tree.after_constructor(instance.clone()).unwrap();
        let derived = tree.after_constructor(instance).unwrap();
        tree.assign_constructed_identity(derived, 3);

        let derived_id = tree
            .event(derived)
            .as_constructor()
            .unwrap()
            .constructed_object()
            .unwrap()
            .id();
        let base_id = tree
            .event(base)
            .as_constructor()
            .unwrap()
            .constructed_object()
            .unwrap()
            .id();
        let helper_id = tree
            .event(helper)
            .as_constructor()
            .unwrap()
            .constructed_object()
            .unwrap()
            .id();
        assert_eq!(derived_id, 3);
        assert_eq!(base_id, derived_id);
        assert_eq!(helper_id, 7);
    }

    #[test]
    fn test_preorder_traversal_matches_call_order() {
        let mut tree = CallTree::for_current_thread();
        let recv = receiver(0x1, "app.A", 0);
        tree.before_method(recv.clone(), "a()", Vec::new()).unwrap();
        tree.before_method(recv.clone(), "b()", Vec::new()).unwrap();
        tree.after_method(None).unwrap();
        tree.before_method(recv.clone(), "c()", Vec::new()).unwrap();
        tree.before_method(recv, "d()", Vec::new()).unwrap();
        tree.after_method(None).unwrap();
        tree.after_method(None).unwrap();
        tree.after_method(None).unwrap();

        let order: Vec<&str> = tree.iter().map(Event::signature).collect();
        assert_eq!(order, vec!["a()", "b()", "c()", "d()"]);

        // Traversal is restartable.
        let again: Vec<&str> = tree.iter().map(Event::signature).collect();
        assert_eq!(again, order);
    }

    #[test]
    fn test_calling_object_resolves_parent_subject() {
        let mut tree = CallTree::for_current_thread();
        tree.before_method(receiver(0x1, "app.A", 4), "app.A.foo()", Vec::new())
            .unwrap();
        let inner = tree
            .before_method(receiver(0x2, "app.B", 0), "app.B.bar()", Vec::new())
            .unwrap();
        match tree.calling_object(inner) {
            Some(EventSubject::Instance(tagged)) => {
                assert_eq!(tagged.class().as_ref(), "app.A");
                assert_eq!(tagged.id(), 4);
            }
            other => panic!("unexpected calling object: {other:?}"),
        }
    }

    #[test]
    fn test_empty_tree_iterates_nothing() {
        let tree = CallTree::for_current_thread();
        assert_eq!(tree.iter().count(), 0);
        assert!(!tree.is_final());
        assert_eq!(tree.current(), None);
    }
}
