//! Caller-supplied context contract.
//!
//! A context is the data object an instance operates on. It is owned by the
//! embedding application; the engine only calls through this capability
//! trait and never touches the domain data itself. The moment `is_valid`
//! reads false the engine stops invoking callbacks on the context and
//! schedules the owning instance for destruction.

use parking_lot::Mutex;
use std::sync::Arc;

/// Minimal capability contract a context object must satisfy.
pub trait Context {
    /// Display name used in diagnostics.
    fn name(&self) -> &str;

    /// Replaces the display name.
    fn set_name(&mut self, name: String);

    /// Liveness flag. False means the context is dead and its instance
    /// must be torn down.
    fn is_valid(&self) -> bool;

    /// Marks the context dead. Invoked by the engine when its instance is
    /// destroyed.
    fn invalidate(&mut self);
}

/// Shared handle to a caller-owned context.
///
/// The caller keeps one clone to mutate its own data between ticks; the
/// engine keeps another for the lifetime of the bound instance. Engine entry
/// points must not be called while the lock is held.
pub type ContextHandle<C> = Arc<Mutex<C>>;

/// Wraps a context for sharing between the caller and an engine.
pub fn shared<C: Context>(context: C) -> ContextHandle<C> {
    Arc::new(Mutex::new(context))
}
