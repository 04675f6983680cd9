//! Live observer contract
//!
//! Observers receive trace events synchronously, on the traced thread, the
//! moment they happen. They exist for live feedback (console printers, timing
//! collectors); a slow observer directly slows the traced program, so
//! implementations should keep callbacks short and push heavy work elsewhere.
//!
//! All callbacks default to no-ops. Panics inside a callback are caught and
//! logged by the dispatcher, never propagated, and never block other
//! observers.

use crate::event::Event;
use crate::identity::ClassName;

/// Synchronous consumer of trace events.
///
/// Observers are shared across all traced threads, so implementations that
/// carry state need interior mutability.
pub trait TraceObserver: Send + Sync {
    /// Fired the first time instrumented code from `class` is seen.
    fn on_class_transformed(&self, _class: &ClassName) {}

    /// Fired once per instrumented method of a transformed class.
    fn on_method_transformed(&self, _class: &ClassName, _signature: &str) {}

    fn on_constructor_start(&self, _event: &Event) {}

    fn on_constructor_end(&self, _event: &Event) {}

    fn on_static_method_start(&self, _event: &Event) {}

    fn on_static_method_end(&self, _event: &Event) {}

    fn on_method_start(&self, _event: &Event) {}

    fn on_method_end(&self, _event: &Event) {}

    fn on_exception(&self, _event: &Event) {}

    /// Fired exactly once, after every tree has been flushed at shutdown.
    fn on_shut_down(&self) {}
}

impl<T: TraceObserver + ?Sized> TraceObserver for std::sync::Arc<T> {
    fn on_class_transformed(&self, class: &ClassName) {
        (**self).on_class_transformed(class);
    }

    fn on_method_transformed(&self, class: &ClassName, signature: &str) {
        (**self).on_method_transformed(class, signature);
    }

    fn on_constructor_start(&self, event: &Event) {
        (**self).on_constructor_start(event);
    }

    fn on_constructor_end(&self, event: &Event) {
        (**self).on_constructor_end(event);
    }

    fn on_static_method_start(&self, event: &Event) {
        (**self).on_static_method_start(event);
    }

    fn on_static_method_end(&self, event: &Event) {
        (**self).on_static_method_end(event);
    }

    fn on_method_start(&self, event: &Event) {
        (**self).on_method_start(event);
    }

    fn on_method_end(&self, event: &Event) {
        (**self).on_method_end(event);
    }

    fn on_exception(&self, event: &Event) {
        (**self).on_exception(event);
    }

    fn on_shut_down(&self) {
        (**self).on_shut_down();
    }
}
