//! Fluent blueprint construction front-end.
//!
//! The builder is a convenience layer over [`Blueprint`]: states and
//! transitions are collected by name, then assembled and validated in one
//! pass. Construction problems (empty names, transitions whose endpoints
//! were never declared, a missing initial state) skip the offending element
//! and are reported through the engine's diagnostic channel when the
//! blueprint is registered; they never abort the rest of the build.

use crate::blueprint::{Blueprint, Guard, State, DEFAULT_GROUP, RATE_EVERY_TICK};
use crate::context::Context;
use crate::engine::FsmEngine;
use crate::error::{Fault, FsmError};
use std::sync::Arc;

/// Assembles one [`Blueprint`] from fluent declarations.
pub struct BlueprintBuilder<C> {
    name: String,
    group: String,
    rate: i32,
    states: Vec<State<C>>,
    initial: Option<String>,
    transitions: Vec<(String, String, Guard<C>)>,
    any_transitions: Vec<(String, Guard<C>)>,
}

impl<C: Context> BlueprintBuilder<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: DEFAULT_GROUP.to_string(),
            rate: RATE_EVERY_TICK,
            states: Vec::new(),
            initial: None,
            transitions: Vec::new(),
            any_transitions: Vec::new(),
        }
    }

    /// Declares a state. The first declared state becomes the initial state
    /// unless [`initial`](Self::initial) overrides it.
    pub fn state(mut self, state: State<C>) -> Self {
        self.states.push(state);
        self
    }

    /// Overrides the initial state by name.
    pub fn initial(mut self, name: impl Into<String>) -> Self {
        self.initial = Some(name.into());
        self
    }

    /// Declares an ordinary transition.
    pub fn transition<F>(mut self, from: impl Into<String>, to: impl Into<String>, guard: F) -> Self
    where
        F: Fn(&C) -> Result<bool, Fault> + Send + Sync + 'static,
    {
        self.transitions
            .push((from.into(), to.into(), Arc::new(guard)));
        self
    }

    /// Declares an any-state transition.
    pub fn any_transition<F>(mut self, to: impl Into<String>, guard: F) -> Self
    where
        F: Fn(&C) -> Result<bool, Fault> + Send + Sync + 'static,
    {
        self.any_transitions.push((to.into(), Arc::new(guard)));
        self
    }

    /// Sets the default tick rate: negative for every tick, zero for manual
    /// stepping only, positive N for every Nth tick.
    pub fn rate(mut self, rate: i32) -> Self {
        self.rate = rate;
        self
    }

    /// Sets the processing group.
    pub fn group(mut self, name: impl Into<String>) -> Self {
        self.group = name.into();
        self
    }

    /// Assembles the blueprint. Returns it together with the construction
    /// issues collected along the way; each issue names an element that was
    /// skipped. An empty blueprint name is the one hard failure.
    pub fn build(self) -> Result<(Blueprint<C>, Vec<String>), FsmError> {
        let mut blueprint = Blueprint::new(self.name)?;
        blueprint.set_group(self.group);
        blueprint.set_rate(self.rate);
        let mut issues = Vec::new();

        for state in self.states {
            if let Err(e) = blueprint.add_state(state) {
                issues.push(format!("state skipped: {}", e));
            }
        }
        if let Some(initial) = &self.initial {
            if let Err(e) = blueprint.set_initial(initial) {
                issues.push(format!("initial state not applied: {}", e));
            }
        }
        for (from, to, guard) in self.transitions {
            if let Err(e) = blueprint.add_transition_guard(&from, &to, guard) {
                issues.push(format!("transition '{}' -> '{}' skipped: {}", from, to, e));
            }
        }
        for (to, guard) in self.any_transitions {
            if let Err(e) = blueprint.add_any_transition_guard(&to, guard) {
                issues.push(format!("any-state transition to '{}' skipped: {}", to, e));
            }
        }
        if blueprint.initial().is_none() {
            issues.push(format!(
                "blueprint '{}' has no initial state; instances cannot be created until one is set",
                blueprint.name()
            ));
        }

        Ok((blueprint, issues))
    }

    /// Finalizes the build and registers the blueprint into `engine`,
    /// replacing any prior definition under the same name and group.
    /// Construction issues are reported through the engine's diagnostics.
    pub fn register(self, engine: &mut FsmEngine<C>) -> Result<(), FsmError> {
        let (blueprint, issues) = self.build()?;
        for issue in &issues {
            engine.diagnostics_mut().report(issue, None);
        }
        engine.register(blueprint);
        Ok(())
    }
}
