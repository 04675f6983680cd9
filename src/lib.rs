//! Trazar - Runtime call-tracing engine
//!
//! Given a stream of "entered", "exited" and "exception thrown" events from
//! an external instrumentation source, trazar reconstructs per-thread
//! hierarchical call trees, assigns stable per-class identities to observed
//! objects, and delivers the results two ways: synchronously to live
//! [`observer::TraceObserver`]s, and asynchronously — completed trees through
//! a single-worker pipeline — to [`processor::TreeProcessor`]s.
//!
//! The engine runs inline with instrumented code, so it keeps per-call work
//! down to O(1) map/queue operations under short locks, and it stays correct
//! under reentrancy, exception unwinding and cross-thread object sharing.
//!
//! # Example
//!
//! ```
//! use trazar::{EventDispatcher, ObjRef, Value};
//!
//! let dispatcher = EventDispatcher::builder().build();
//! let widget = ObjRef::new(0x7f00_1000, "app.Widget");
//!
//! dispatcher.before_method(widget.clone(), "app.Widget.resize(int)",
//!     vec![Value::rendered("42")], true);
//! dispatcher.after_method(&widget, "app.Widget.resize(int)", None, false);
//!
//! dispatcher.shutdown();
//! ```

pub mod config;
pub mod dispatcher;
pub mod event;
pub mod identity;
pub mod observer;
pub mod pipeline;
pub mod processor;
pub mod signature;
pub mod tree;

pub use config::TraceConfig;
pub use dispatcher::{DispatcherBuilder, EventDispatcher};
pub use event::{Event, EventId, EventKind, EventPayload, EventSubject, Value};
pub use identity::{ClassName, IdentityRegistry, ObjRef, TaggedRef, UNIDENTIFIED};
pub use observer::TraceObserver;
pub use pipeline::ProcessorPipeline;
pub use processor::TreeProcessor;
pub use tree::{CallTree, PreOrder, TreeError};
