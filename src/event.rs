//! Event node model for call-sequence trees
//!
//! One [`Event`] captures a single method call, constructor call, static
//! method call or thrown exception, together with its timing, signature,
//! captured parameters and position in the tree. Nodes are created open on
//! "before", mutated exactly once on "after" (end time, return value,
//! identity) and never mutated again.
//!
//! Events live in the arena owned by [`crate::tree::CallTree`]; parent and
//! child links are arena indices ([`EventId`]), so the tree owns every node
//! transitively from the root and the parent back-reference is lookup-only.

use std::fmt;
use std::time::{Duration, Instant};

use crate::identity::{ClassName, ObjRef, TaggedRef};

/// Index of an event inside its owning tree's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventId(pub(crate) usize);

impl EventId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A captured parameter or return value.
///
/// The instrumentation source renders the value to text at capture time; if
/// the value is an object reference it is carried along so the dispatcher can
/// opportunistically tag it with an already-known identity.
#[derive(Clone, Debug)]
pub struct Value {
    text: String,
    obj: Option<ObjRef>,
    id: Option<i32>,
}

impl Value {
    /// A plain rendered value (primitive, string, ...), never identity-tagged.
    pub fn rendered(text: impl Into<String>) -> Self {
        Value {
            text: text.into(),
            obj: None,
            id: None,
        }
    }

    /// A value that is an object reference and may receive an identity tag.
    pub fn object(text: impl Into<String>, obj: ObjRef) -> Self {
        Value {
            text: text.into(),
            obj: Some(obj),
            id: None,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn obj(&self) -> Option<&ObjRef> {
        self.obj.as_ref()
    }

    /// Identity tag, present only if the object was already known to the
    /// registry when this value was captured.
    pub fn id(&self) -> Option<i32> {
        self.id
    }

    pub(crate) fn tag(&mut self, id: i32) {
        self.id = Some(id);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.obj.as_ref(), self.id) {
            (Some(obj), Some(id)) => write!(f, "{}#{}", obj.class(), id),
            _ => f.write_str(&self.text),
        }
    }
}

/// Kind of an event node. Constant and unique per payload variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Constructor,
    Method,
    StaticMethod,
    Exception,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Constructor => "CONSTRUCTOR",
            EventKind::Method => "METHOD",
            EventKind::StaticMethod => "STATIC_METHOD",
            EventKind::Exception => "EXCEPTION",
        };
        f.write_str(name)
    }
}

/// A constructor call.
///
/// The constructed object and its identity are only known once the call
/// completes; `delegated` marks a nested superclass-constructor call, which
/// shares the identity of the outermost (most-derived) constructor.
#[derive(Clone, Debug)]
pub struct ConstructorCall {
    pub(crate) class: ClassName,
    pub(crate) params: Vec<Value>,
    pub(crate) constructed: Option<ObjRef>,
    pub(crate) identity: Option<TaggedRef>,
    pub(crate) delegated: bool,
}

impl ConstructorCall {
    /// Class named at the call site (may be a superclass of the constructed
    /// object's runtime class for delegated calls).
    pub fn class(&self) -> &ClassName {
        &self.class
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }

    /// The constructed object with its assigned identity.
    ///
    /// `None` while the call is still open, and on delegated nodes until the
    /// outermost constructor completes and propagates its identity.
    pub fn constructed_object(&self) -> Option<&TaggedRef> {
        self.identity.as_ref()
    }

    /// True for a delegated superclass-constructor call, false for the
    /// defining (most-derived) call.
    pub fn is_delegated(&self) -> bool {
        self.delegated
    }
}

/// An instance method call.
#[derive(Clone, Debug)]
pub struct MethodCall {
    pub(crate) receiver: TaggedRef,
    pub(crate) params: Vec<Value>,
    pub(crate) ret: Option<Value>,
}

impl MethodCall {
    pub fn receiver(&self) -> &TaggedRef {
        &self.receiver
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }

    /// Returned value; `None` for void methods (and while the call is open).
    pub fn returned_value(&self) -> Option<&Value> {
        self.ret.as_ref()
    }

    pub fn has_return(&self) -> bool {
        self.ret.is_some()
    }
}

/// A static method call; the subject is the class itself.
#[derive(Clone, Debug)]
pub struct StaticCall {
    pub(crate) class: ClassName,
    pub(crate) params: Vec<Value>,
    pub(crate) ret: Option<Value>,
}

impl StaticCall {
    pub fn class(&self) -> &ClassName {
        &self.class
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }

    pub fn returned_value(&self) -> Option<&Value> {
        self.ret.as_ref()
    }

    pub fn has_return(&self) -> bool {
        self.ret.is_some()
    }
}

/// A thrown exception, recorded as a closed leaf marker.
#[derive(Clone, Debug)]
pub struct ExceptionRecord {
    pub(crate) exception: TaggedRef,
}

impl ExceptionRecord {
    pub fn exception(&self) -> &TaggedRef {
        &self.exception
    }
}

/// Kind-specific payload of an event node.
#[derive(Clone, Debug)]
pub enum EventPayload {
    Constructor(ConstructorCall),
    Method(MethodCall),
    StaticMethod(StaticCall),
    Exception(ExceptionRecord),
}

/// The subject of an event: the thing child calls are made "from".
#[derive(Clone, Copy, Debug)]
pub enum EventSubject<'a> {
    /// An identified object instance (receiver, constructed object, thrown
    /// exception).
    Instance(&'a TaggedRef),
    /// A class, for static method calls.
    Class(&'a ClassName),
}

/// One node of a call-sequence tree.
#[derive(Clone, Debug)]
pub struct Event {
    pub(crate) parent: Option<EventId>,
    pub(crate) children: Vec<EventId>,
    pub(crate) signature: String,
    pub(crate) started: Instant,
    pub(crate) ended: Option<Instant>,
    pub(crate) payload: EventPayload,
}

impl Event {
    pub(crate) fn open(parent: Option<EventId>, signature: &str, payload: EventPayload) -> Self {
        Event {
            parent,
            children: Vec::new(),
            signature: signature.to_owned(),
            started: Instant::now(),
            ended: None,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::Constructor(_) => EventKind::Constructor,
            EventPayload::Method(_) => EventKind::Method,
            EventPayload::StaticMethod(_) => EventKind::StaticMethod,
            EventPayload::Exception(_) => EventKind::Exception,
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn started_at(&self) -> Instant {
        self.started
    }

    /// End timestamp, set exactly once when the call completes.
    pub fn ended_at(&self) -> Option<Instant> {
        self.ended
    }

    /// A node without an end timestamp is still on the open-call stack.
    pub fn is_open(&self) -> bool {
        self.ended.is_none()
    }

    /// Wall time between start and completion, `None` while open.
    pub fn elapsed(&self) -> Option<Duration> {
        self.ended.map(|end| end.duration_since(self.started))
    }

    pub fn parent(&self) -> Option<EventId> {
        self.parent
    }

    /// Child events in call order.
    pub fn children(&self) -> &[EventId] {
        &self.children
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn as_constructor(&self) -> Option<&ConstructorCall> {
        match &self.payload {
            EventPayload::Constructor(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_method(&self) -> Option<&MethodCall> {
        match &self.payload {
            EventPayload::Method(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_static_method(&self) -> Option<&StaticCall> {
        match &self.payload {
            EventPayload::StaticMethod(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_exception(&self) -> Option<&ExceptionRecord> {
        match &self.payload {
            EventPayload::Exception(record) => Some(record),
            _ => None,
        }
    }

    /// The object (or class) associated with this event. This is the calling
    /// object of all child events.
    ///
    /// `None` for a constructor node whose identity has not been assigned
    /// yet.
    pub fn subject(&self) -> Option<EventSubject<'_>> {
        match &self.payload {
            EventPayload::Constructor(call) => {
                call.identity.as_ref().map(EventSubject::Instance)
            }
            EventPayload::Method(call) => Some(EventSubject::Instance(&call.receiver)),
            EventPayload::StaticMethod(call) => Some(EventSubject::Class(&call.class)),
            EventPayload::Exception(record) => Some(EventSubject::Instance(&record.exception)),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.kind(), self.signature)
    }
}
