//! Live instance state.

use crate::context::ContextHandle;
use std::fmt;

/// Engine-scoped identifier for a live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One live application of a blueprint, bound to one context.
///
/// The handle tracks the current state by name so it stays meaningful when
/// its blueprint is replaced wholesale; the stepper resolves the name once
/// per step and recovers through the initial state if it no longer exists.
pub struct Handle<C> {
    pub(crate) id: InstanceId,
    pub(crate) context: ContextHandle<C>,
    pub(crate) current: String,
    /// Whether the current state's enter callback has run. Cleared on every
    /// transition so entry fires on the next step, and left false at
    /// creation so constructing an instance has no side effects.
    pub(crate) entered: bool,
}

impl<C> Handle<C> {
    pub(crate) fn new(id: InstanceId, context: ContextHandle<C>, initial: &str) -> Self {
        Self {
            id,
            context,
            current: initial.to_string(),
            entered: false,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn current_state(&self) -> &str {
        &self.current
    }

    pub fn has_entered(&self) -> bool {
        self.entered
    }

    pub fn context(&self) -> &ContextHandle<C> {
        &self.context
    }
}

impl<C> fmt::Debug for Handle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("current", &self.current)
            .field("entered", &self.entered)
            .finish()
    }
}
