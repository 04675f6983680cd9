//! Object identity: stable per-class integer ids for traced objects
//!
//! Traced programs are free to redefine equality for their own types, so the
//! registry keys objects by *reference identity* — the address the
//! instrumentation source reports for the object — never by value equality.
//! Ids are scoped per exact runtime class: the third `Request` constructed
//! gets id 2 even if a `Response` already carries id 2.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Exact runtime class (type) name of a traced object.
///
/// Shared freely between events, registries and observers, so it is stored
/// behind an `Arc`.
pub type ClassName = Arc<str>;

/// Sentinel id returned by [`IdentityRegistry::identify`] when object
/// identification is disabled.
pub const UNIDENTIFIED: i32 = -1;

/// Opaque reference to a runtime object observed by the instrumentation
/// source.
///
/// `addr` is whatever the source uses for reference identity (typically the
/// object's address); `class` is the exact runtime class, with subclasses
/// distinct from their superclasses.
#[derive(Clone, Debug)]
pub struct ObjRef {
    addr: usize,
    class: ClassName,
}

impl ObjRef {
    pub fn new(addr: usize, class: impl Into<ClassName>) -> Self {
        ObjRef {
            addr,
            class: class.into(),
        }
    }

    /// Reference identity of the object.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Exact runtime class of the object.
    pub fn class(&self) -> &ClassName {
        &self.class
    }
}

/// An object reference paired with its assigned per-class id.
///
/// The id is unique among identified objects of the exact same runtime
/// class; objects of different classes may share an id.
#[derive(Clone, Debug)]
pub struct TaggedRef {
    obj: ObjRef,
    id: i32,
}

impl TaggedRef {
    pub fn new(obj: ObjRef, id: i32) -> Self {
        TaggedRef { obj, id }
    }

    pub fn obj(&self) -> &ObjRef {
        &self.obj
    }

    /// The per-class unique id, or [`UNIDENTIFIED`] when identification is
    /// disabled.
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn class(&self) -> &ClassName {
        self.obj.class()
    }
}

impl fmt::Display for TaggedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.obj.class(), self.id)
    }
}

#[derive(Default)]
struct IdentityState {
    /// Reference identity (address) → assigned id.
    ids: HashMap<usize, i32>,
    /// Per-class monotonic counters, starting at 0.
    counters: HashMap<ClassName, i32>,
}

/// Thread-safe registry assigning per-class unique ids to observed objects.
///
/// Identification can be disabled globally, trading traceability for lower
/// overhead and bounded registry growth: `identify` then returns
/// [`UNIDENTIFIED`] and `probe` always returns `None`.
pub struct IdentityRegistry {
    enabled: bool,
    state: Mutex<IdentityState>,
}

impl IdentityRegistry {
    pub fn new(enabled: bool) -> Self {
        IdentityRegistry {
            enabled,
            state: Mutex::new(IdentityState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the id already assigned to `obj`, or atomically assigns the
    /// next id for its exact runtime class.
    ///
    /// Idempotent per reference: concurrent identification races resolve to
    /// exactly one assigned id per object.
    pub fn identify(&self, obj: &ObjRef) -> i32 {
        if !self.enabled {
            return UNIDENTIFIED;
        }
        match self.state.lock() {
            Ok(mut state) => {
                if let Some(&id) = state.ids.get(&obj.addr()) {
                    return id;
                }
                let counter = state.counters.entry(obj.class().clone()).or_insert(0);
                let id = *counter;
                *counter += 1;
                state.ids.insert(obj.addr(), id);
                id
            }
            Err(_) => UNIDENTIFIED,
        }
    }

    /// Read-only lookup: returns the id of `obj` only if it has already been
    /// identified, never assigns.
    ///
    /// Used for parameters and return values, which are tagged only when the
    /// object is already known — "home" identity is established at
    /// construction, not at first sighting as an argument.
    pub fn probe(&self, obj: &ObjRef) -> Option<i32> {
        if !self.enabled {
            return None;
        }
        match self.state.lock() {
            Ok(state) => state.ids.get(&obj.addr()).copied(),
            Err(_) => None,
        }
    }

    /// Number of identified objects so far.
    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.ids.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str) -> ClassName {
        Arc::from(name)
    }

    #[test]
    fn test_identify_is_idempotent() {
        let registry = IdentityRegistry::new(true);
        let obj = ObjRef::new(0x1000, class("app.Request"));

        let first = registry.identify(&obj);
        let second = registry.identify(&obj);
        assert_eq!(first, 0);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_objects_of_same_class_never_collide() {
        let registry = IdentityRegistry::new(true);
        let a = ObjRef::new(0x1000, class("app.Request"));
        let b = ObjRef::new(0x2000, class("app.Request"));

        assert_eq!(registry.identify(&a), 0);
        assert_eq!(registry.identify(&b), 1);
    }

    #[test]
    fn test_different_classes_may_share_an_id() {
        let registry = IdentityRegistry::new(true);
        let a = ObjRef::new(0x1000, class("app.Request"));
        let b = ObjRef::new(0x2000, class("app.Response"));

        assert_eq!(registry.identify(&a), 0);
        assert_eq!(registry.identify(&b), 0);
    }

    #[test]
    fn test_probe_never_assigns() {
        let registry = IdentityRegistry::new(true);
        let obj = ObjRef::new(0x1000, class("app.Request"));

        assert_eq!(registry.probe(&obj), None);
        assert!(registry.is_empty());

        let id = registry.identify(&obj);
        assert_eq!(registry.probe(&obj), Some(id));
    }

    #[test]
    fn test_disabled_registry_returns_sentinel() {
        let registry = IdentityRegistry::new(false);
        let obj = ObjRef::new(0x1000, class("app.Request"));

        // Repeat sightings still return the sentinel, never assign.
        for _ in 0..3 {
            assert_eq!(registry.identify(&obj), UNIDENTIFIED);
            assert_eq!(registry.probe(&obj), None);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_identification_assigns_one_id() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let registry = StdArc::new(IdentityRegistry::new(true));
        let obj = ObjRef::new(0xbeef, class("app.Shared"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = StdArc::clone(&registry);
                let obj = obj.clone();
                thread::spawn(move || registry.identify(&obj))
            })
            .collect();

        let ids: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|&id| id == ids[0]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_tagged_ref_display() {
        let tagged = TaggedRef::new(ObjRef::new(0x1, class("app.Request")), 4);
        assert_eq!(tagged.to_string(), "app.Request#4");
    }
}
