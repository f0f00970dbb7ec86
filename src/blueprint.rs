//! Blueprint data model: states, transitions, and structural queries.
//!
//! A blueprint is the template an instance runs against. States carry three
//! optional lifecycle callbacks (enter, update, exit); transitions carry a
//! guard predicate and are evaluated in definition order, with any-state
//! transitions outranking ordinary ones. State names are interned to small
//! indices when the structure changes, so the stepper resolves the current
//! state name once per step and works on indices after that.

use crate::error::{Fault, FsmError};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Default processing group for blueprints that never pick one.
pub const DEFAULT_GROUP: &str = "default";

/// Tick rate meaning "advance on every group tick".
pub const RATE_EVERY_TICK: i32 = -1;

/// Tick rate meaning "manual stepping only".
pub const RATE_MANUAL: i32 = 0;

/// Lifecycle callback invoked with exclusive access to the instance context.
pub type Callback<C> = Arc<dyn Fn(&mut C) -> Result<(), Fault> + Send + Sync>;

/// Guard predicate controlling whether a transition fires.
pub type Guard<C> = Arc<dyn Fn(&C) -> Result<bool, Fault> + Send + Sync>;

/// Index of a state inside its owning blueprint.
///
/// Assigned when names are interned; remapped whenever the state set
/// changes. Never valid across blueprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(pub(crate) u32);

impl StateId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A named unit of behavior with enter/update/exit callbacks.
pub struct State<C> {
    name: String,
    on_enter: Option<Callback<C>>,
    on_update: Option<Callback<C>>,
    on_exit: Option<Callback<C>>,
}

impl<C> State<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_enter: None,
            on_update: None,
            on_exit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builder-style enter callback.
    pub fn on_enter<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.on_enter = Some(Arc::new(f));
        self
    }

    /// Builder-style update callback.
    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(f));
        self
    }

    /// Builder-style exit callback.
    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut C) -> Result<(), Fault> + Send + Sync + 'static,
    {
        self.on_exit = Some(Arc::new(f));
        self
    }

    /// Replaces the enter callback. `None` restores the no-op.
    pub fn set_on_enter(&mut self, cb: Option<Callback<C>>) {
        self.on_enter = cb;
    }

    /// Replaces the update callback. `None` restores the no-op.
    pub fn set_on_update(&mut self, cb: Option<Callback<C>>) {
        self.on_update = cb;
    }

    /// Replaces the exit callback. `None` restores the no-op.
    pub fn set_on_exit(&mut self, cb: Option<Callback<C>>) {
        self.on_exit = cb;
    }

    pub(crate) fn enter(&self) -> Option<&Callback<C>> {
        self.on_enter.as_ref()
    }

    pub(crate) fn update(&self) -> Option<&Callback<C>> {
        self.on_update.as_ref()
    }

    pub(crate) fn exit(&self) -> Option<&Callback<C>> {
        self.on_exit.as_ref()
    }
}

impl<C> Clone for State<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            on_enter: self.on_enter.clone(),
            on_update: self.on_update.clone(),
            on_exit: self.on_exit.clone(),
        }
    }
}

impl<C> fmt::Debug for State<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("on_enter", &self.on_enter.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_exit", &self.on_exit.is_some())
            .finish()
    }
}

/// An ordinary transition. Identity is the (from, to) pair.
pub struct Transition<C> {
    pub(crate) from: StateId,
    pub(crate) to: StateId,
    pub(crate) guard: Guard<C>,
}

impl<C> Clone for Transition<C> {
    fn clone(&self) -> Self {
        Self {
            from: self.from,
            to: self.to,
            guard: self.guard.clone(),
        }
    }
}

/// An any-state transition, matched from every state. Identity is the
/// destination.
pub struct AnyTransition<C> {
    pub(crate) to: StateId,
    pub(crate) guard: Guard<C>,
}

impl<C> Clone for AnyTransition<C> {
    fn clone(&self) -> Self {
        Self {
            to: self.to,
            guard: self.guard.clone(),
        }
    }
}

/// Structural view of a blueprint, without callbacks.
///
/// Serializable for introspection and for computing [`Blueprint::signature`].
#[derive(Debug, Clone, Serialize)]
pub struct BlueprintDescriptor {
    pub name: String,
    pub group: String,
    pub rate: i32,
    pub initial: Option<String>,
    pub states: Vec<String>,
    pub transitions: Vec<TransitionDescriptor>,
    pub any_transitions: Vec<String>,
}

/// One (from, to) pair in a [`BlueprintDescriptor`].
#[derive(Debug, Clone, Serialize)]
pub struct TransitionDescriptor {
    pub from: String,
    pub to: String,
}

/// A named, ordered collection of states and transitions.
pub struct Blueprint<C> {
    name: String,
    group: String,
    rate: i32,
    states: Vec<State<C>>,
    index: HashMap<String, StateId>,
    initial: Option<StateId>,
    transitions: Vec<Transition<C>>,
    any_transitions: Vec<AnyTransition<C>>,
    /// Per-source transition indices, in definition order.
    by_source: Vec<Vec<usize>>,
}

impl<C> Blueprint<C> {
    /// Creates an empty blueprint. An empty name is a hard error: the caller
    /// has nothing usable to register.
    pub fn new(name: impl Into<String>) -> Result<Self, FsmError> {
        let name = name.into();
        if name.is_empty() {
            return Err(FsmError::InvalidDefinition {
                reason: "blueprint name must be non-empty".to_string(),
            });
        }
        Ok(Self {
            name,
            group: DEFAULT_GROUP.to_string(),
            rate: RATE_EVERY_TICK,
            states: Vec::new(),
            index: HashMap::new(),
            initial: None,
            transitions: Vec::new(),
            any_transitions: Vec::new(),
            by_source: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn rate(&self) -> i32 {
        self.rate
    }

    /// Name of the initial state, if one is set.
    pub fn initial(&self) -> Option<&str> {
        self.initial.map(|id| self.states[id.index()].name())
    }

    pub fn set_group(&mut self, group: impl Into<String>) {
        self.group = group.into();
    }

    pub fn set_rate(&mut self, rate: i32) {
        self.rate = rate;
    }

    /// Sets the initial state by name.
    pub fn set_initial(&mut self, name: &str) -> Result<(), FsmError> {
        match self.index.get(name) {
            Some(&id) => {
                self.initial = Some(id);
                Ok(())
            }
            None => Err(self.missing_state(name)),
        }
    }

    // =========================================================================
    // Structural edits
    // =========================================================================

    /// Inserts a state, replacing any existing state with the same name in
    /// place. The first state ever added becomes the initial state.
    pub fn add_state(&mut self, state: State<C>) -> Result<StateId, FsmError> {
        if state.name().is_empty() {
            return Err(FsmError::InvalidStateName {
                reason: format!("blueprint '{}': state name must be non-empty", self.name),
            });
        }
        if let Some(&id) = self.index.get(state.name()) {
            self.states[id.index()] = state;
            return Ok(id);
        }
        let id = StateId(self.states.len() as u32);
        self.index.insert(state.name().to_string(), id);
        self.states.push(state);
        self.by_source.push(Vec::new());
        if self.initial.is_none() {
            self.initial = Some(id);
        }
        Ok(id)
    }

    /// Removes a state and eagerly prunes every transition that references
    /// it. If the removed state was the initial state, the blueprint is left
    /// without one until the caller sets a new initial.
    pub fn remove_state(&mut self, name: &str) -> Result<(), FsmError> {
        let id = match self.index.get(name) {
            Some(&id) => id,
            None => return Err(self.missing_state(name)),
        };
        self.states.remove(id.index());

        self.transitions.retain(|t| t.from != id && t.to != id);
        for t in &mut self.transitions {
            if t.from.0 > id.0 {
                t.from.0 -= 1;
            }
            if t.to.0 > id.0 {
                t.to.0 -= 1;
            }
        }
        self.any_transitions.retain(|t| t.to != id);
        for t in &mut self.any_transitions {
            if t.to.0 > id.0 {
                t.to.0 -= 1;
            }
        }
        self.initial = match self.initial {
            Some(i) if i == id => None,
            Some(i) if i.0 > id.0 => Some(StateId(i.0 - 1)),
            other => other,
        };

        self.index = self
            .states
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name().to_string(), StateId(i as u32)))
            .collect();
        self.reindex();
        Ok(())
    }

    /// Adds a transition, replacing the guard of any existing (from, to)
    /// pair in place. Both endpoints must exist.
    pub fn add_transition<F>(&mut self, from: &str, to: &str, guard: F) -> Result<(), FsmError>
    where
        F: Fn(&C) -> Result<bool, Fault> + Send + Sync + 'static,
    {
        self.add_transition_guard(from, to, Arc::new(guard))
    }

    pub(crate) fn add_transition_guard(
        &mut self,
        from: &str,
        to: &str,
        guard: Guard<C>,
    ) -> Result<(), FsmError> {
        let from_id = self.resolve(from).ok_or_else(|| self.missing_state(from))?;
        let to_id = self.resolve(to).ok_or_else(|| self.missing_state(to))?;
        if let Some(existing) = self
            .transitions
            .iter_mut()
            .find(|t| t.from == from_id && t.to == to_id)
        {
            existing.guard = guard;
            return Ok(());
        }
        let idx = self.transitions.len();
        self.transitions.push(Transition {
            from: from_id,
            to: to_id,
            guard,
        });
        self.by_source[from_id.index()].push(idx);
        Ok(())
    }

    /// Removes the transition with the given (from, to) pair.
    pub fn remove_transition(&mut self, from: &str, to: &str) -> Result<(), FsmError> {
        let from_id = self.resolve(from).ok_or_else(|| self.missing_state(from))?;
        let to_id = self.resolve(to).ok_or_else(|| self.missing_state(to))?;
        let pos = self
            .transitions
            .iter()
            .position(|t| t.from == from_id && t.to == to_id)
            .ok_or_else(|| FsmError::TransitionNotFound {
                blueprint: self.name.clone(),
                from: from.to_string(),
                to: to.to_string(),
            })?;
        self.transitions.remove(pos);
        self.reindex();
        Ok(())
    }

    /// Adds an any-state transition, replacing the guard of any existing one
    /// with the same destination in place.
    pub fn add_any_transition<F>(&mut self, to: &str, guard: F) -> Result<(), FsmError>
    where
        F: Fn(&C) -> Result<bool, Fault> + Send + Sync + 'static,
    {
        self.add_any_transition_guard(to, Arc::new(guard))
    }

    pub(crate) fn add_any_transition_guard(
        &mut self,
        to: &str,
        guard: Guard<C>,
    ) -> Result<(), FsmError> {
        let to_id = self.resolve(to).ok_or_else(|| self.missing_state(to))?;
        if let Some(existing) = self.any_transitions.iter_mut().find(|t| t.to == to_id) {
            existing.guard = guard;
            return Ok(());
        }
        self.any_transitions.push(AnyTransition { to: to_id, guard });
        Ok(())
    }

    /// Removes the any-state transition with the given destination.
    pub fn remove_any_transition(&mut self, to: &str) -> Result<(), FsmError> {
        let to_id = self.resolve(to).ok_or_else(|| self.missing_state(to))?;
        let pos = self
            .any_transitions
            .iter()
            .position(|t| t.to == to_id)
            .ok_or_else(|| FsmError::TransitionNotFound {
                blueprint: self.name.clone(),
                from: "*".to_string(),
                to: to.to_string(),
            })?;
        self.any_transitions.remove(pos);
        Ok(())
    }

    // =========================================================================
    // Structural queries
    // =========================================================================

    pub fn has_state(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn state(&self, name: &str) -> Option<&State<C>> {
        self.resolve(name).map(|id| &self.states[id.index()])
    }

    /// Mutable access to a state, for replacing its callbacks.
    pub fn state_mut(&mut self, name: &str) -> Option<&mut State<C>> {
        let id = self.resolve(name)?;
        Some(&mut self.states[id.index()])
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// State names in definition order.
    pub fn state_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.states.iter().map(|s| s.name())
    }

    pub fn has_transition(&self, from: &str, to: &str) -> bool {
        match (self.resolve(from), self.resolve(to)) {
            (Some(f), Some(t)) => self.transitions.iter().any(|x| x.from == f && x.to == t),
            _ => false,
        }
    }

    /// All ordinary transitions as (from, to) name pairs, in definition order.
    pub fn transitions(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.transitions
            .iter()
            .map(|t| (self.state_name(t.from), self.state_name(t.to)))
    }

    /// All any-state transition destinations, in definition order.
    pub fn any_transition_targets(&self) -> impl Iterator<Item = &str> + '_ {
        self.any_transitions.iter().map(|t| self.state_name(t.to))
    }

    /// Structural view without callbacks.
    pub fn descriptor(&self) -> BlueprintDescriptor {
        BlueprintDescriptor {
            name: self.name.clone(),
            group: self.group.clone(),
            rate: self.rate,
            initial: self.initial().map(str::to_string),
            states: self.state_names().map(str::to_string).collect(),
            transitions: self
                .transitions()
                .map(|(from, to)| TransitionDescriptor {
                    from: from.to_string(),
                    to: to.to_string(),
                })
                .collect(),
            any_transitions: self.any_transition_targets().map(str::to_string).collect(),
        }
    }

    /// Hash of the structure for replacement diagnostics and integrity
    /// checks. Callbacks do not participate.
    pub fn signature(&self) -> String {
        let bytes = serde_json::to_vec(&self.descriptor())
            .expect("descriptor serialization cannot fail");
        format!("{:08x}", crc32c::crc32c(&bytes))
    }

    // =========================================================================
    // Interned access (stepper)
    // =========================================================================

    pub(crate) fn resolve(&self, name: &str) -> Option<StateId> {
        self.index.get(name).copied()
    }

    pub(crate) fn initial_id(&self) -> Option<StateId> {
        self.initial
    }

    pub(crate) fn state_by_id(&self, id: StateId) -> &State<C> {
        &self.states[id.index()]
    }

    pub(crate) fn state_name(&self, id: StateId) -> &str {
        self.states[id.index()].name()
    }

    pub(crate) fn any_transition_list(&self) -> &[AnyTransition<C>] {
        &self.any_transitions
    }

    /// Ordinary transitions leaving `from`, in definition order.
    pub(crate) fn transitions_from(&self, from: StateId) -> impl Iterator<Item = &Transition<C>> + '_ {
        self.by_source[from.index()]
            .iter()
            .map(|&i| &self.transitions[i])
    }

    fn reindex(&mut self) {
        self.by_source = vec![Vec::new(); self.states.len()];
        for (i, t) in self.transitions.iter().enumerate() {
            self.by_source[t.from.index()].push(i);
        }
    }

    fn missing_state(&self, name: &str) -> FsmError {
        FsmError::StateNotFound {
            blueprint: self.name.clone(),
            state: name.to_string(),
        }
    }
}

impl<C> Clone for Blueprint<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            group: self.group.clone(),
            rate: self.rate,
            states: self.states.clone(),
            index: self.index.clone(),
            initial: self.initial,
            transitions: self.transitions.clone(),
            any_transitions: self.any_transitions.clone(),
            by_source: self.by_source.clone(),
        }
    }
}

impl<C> fmt::Debug for Blueprint<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blueprint")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("rate", &self.rate)
            .field("initial", &self.initial())
            .field("states", &self.state_names().collect::<Vec<_>>())
            .field("transitions", &self.transitions.len())
            .field("any_transitions", &self.any_transitions.len())
            .finish()
    }
}
