//! Staged runtime modification of registered blueprints.
//!
//! Edits to a live blueprint are staged into a [`Modification`] batch and
//! applied atomically by [`FsmEngine::apply_modification`]. Removing a state
//! first migrates every instance occupying it (to a caller-chosen fallback,
//! or the initial state) before the state disappears, so live instances are
//! never stranded by the edit itself.
//!
//! [`FsmEngine::apply_modification`]: crate::engine::FsmEngine::apply_modification

use crate::blueprint::{Guard, State};
use crate::error::Fault;
use std::sync::Arc;

pub(crate) enum ModOp<C> {
    AddState(State<C>),
    RemoveState {
        name: String,
        fallback: Option<String>,
    },
    AddTransition {
        from: String,
        to: String,
        guard: Guard<C>,
    },
    RemoveTransition {
        from: String,
        to: String,
    },
    AddAnyTransition {
        to: String,
        guard: Guard<C>,
    },
    RemoveAnyTransition {
        to: String,
    },
    SetRate(i32),
    SetGroup(String),
}

/// An ordered batch of staged edits to one registered blueprint.
pub struct Modification<C> {
    pub(crate) ops: Vec<ModOp<C>>,
}

impl<C> Modification<C> {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Stages a state insertion (or in-place replacement by name).
    pub fn add_state(mut self, state: State<C>) -> Self {
        self.ops.push(ModOp::AddState(state));
        self
    }

    /// Stages a state removal. Instances occupying the state migrate to the
    /// blueprint's initial state.
    pub fn remove_state(mut self, name: impl Into<String>) -> Self {
        self.ops.push(ModOp::RemoveState {
            name: name.into(),
            fallback: None,
        });
        self
    }

    /// Stages a state removal with an explicit fallback for occupying
    /// instances. An invalid fallback falls back to the initial state.
    pub fn remove_state_with_fallback(
        mut self,
        name: impl Into<String>,
        fallback: impl Into<String>,
    ) -> Self {
        self.ops.push(ModOp::RemoveState {
            name: name.into(),
            fallback: Some(fallback.into()),
        });
        self
    }

    /// Stages a transition insertion (or guard replacement for an existing
    /// (from, to) pair).
    pub fn add_transition<F>(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        guard: F,
    ) -> Self
    where
        F: Fn(&C) -> Result<bool, Fault> + Send + Sync + 'static,
    {
        self.ops.push(ModOp::AddTransition {
            from: from.into(),
            to: to.into(),
            guard: Arc::new(guard),
        });
        self
    }

    /// Stages a transition removal.
    pub fn remove_transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.ops.push(ModOp::RemoveTransition {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Stages an any-state transition insertion (or guard replacement for
    /// the destination).
    pub fn add_any_transition<F>(mut self, to: impl Into<String>, guard: F) -> Self
    where
        F: Fn(&C) -> Result<bool, Fault> + Send + Sync + 'static,
    {
        self.ops.push(ModOp::AddAnyTransition {
            to: to.into(),
            guard: Arc::new(guard),
        });
        self
    }

    /// Stages an any-state transition removal.
    pub fn remove_any_transition(mut self, to: impl Into<String>) -> Self {
        self.ops.push(ModOp::RemoveAnyTransition { to: to.into() });
        self
    }

    /// Stages a tick-rate change for the whole bucket.
    pub fn set_rate(mut self, rate: i32) -> Self {
        self.ops.push(ModOp::SetRate(rate));
        self
    }

    /// Stages a processing-group move for the whole bucket. Applied after
    /// all other staged operations.
    pub fn set_group(mut self, group: impl Into<String>) -> Self {
        self.ops.push(ModOp::SetGroup(group.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

impl<C> Default for Modification<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    #[test]
    fn test_staging_preserves_order() {
        let m: Modification<Dummy> = Modification::new()
            .add_state(State::new("a"))
            .remove_state("b")
            .add_transition("a", "b", |_| Ok(true))
            .set_rate(4)
            .set_group("background");

        assert_eq!(m.len(), 5);
        assert!(!m.is_empty());
        assert!(matches!(m.ops[0], ModOp::AddState(_)));
        assert!(matches!(m.ops[1], ModOp::RemoveState { .. }));
        assert!(matches!(m.ops[4], ModOp::SetGroup(_)));
    }

    #[test]
    fn test_empty_batch() {
        let m: Modification<Dummy> = Modification::default();
        assert!(m.is_empty());
        assert_eq!(m.len(), 0);
    }
}
