//! FSM engine - registry, tick loop, and error containment.
//!
//! The engine owns every blueprint and instance, organized as
//! processing-group -> blueprint-name -> bucket. A group tick advances each
//! bucket that passes its rate gate, steps every live instance, feeds
//! faults to the escalator, and drains the deferred-mutation queue once
//! iteration is over. All entry points take `&mut self`; one misbehaving
//! machine is contained and reported, never allowed to take down the host.

use crate::blueprint::Blueprint;
use crate::context::{Context, ContextHandle};
use crate::diagnostics::{DiagnosticSink, Diagnostics};
use crate::error::{Fault, FsmError};
use crate::escalation::{EngineSettings, Escalator};
use crate::handle::{Handle, InstanceId};
use crate::modify::{ModOp, Modification};
use crate::stepper::{self, StepReport};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// One (blueprint, instances, rate) bucket inside a processing group.
struct Bucket<C> {
    blueprint: Blueprint<C>,
    instances: Vec<Handle<C>>,
    rate: i32,
    countdown: i32,
}

impl<C> Bucket<C> {
    fn new(blueprint: Blueprint<C>) -> Self {
        let rate = blueprint.rate();
        Self {
            blueprint,
            instances: Vec::new(),
            rate,
            countdown: rate.max(0),
        }
    }

    /// Applies rate gating: zero is manual-only, negative runs every tick,
    /// positive N runs every Nth tick.
    fn should_run(&mut self) -> bool {
        match self.rate {
            0 => false,
            r if r < 0 => true,
            r => {
                self.countdown -= 1;
                if self.countdown <= 0 {
                    self.countdown = r;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn set_rate(&mut self, rate: i32) {
        self.rate = rate;
        self.countdown = rate.max(0);
    }
}

/// Structural mutation raised during iteration, applied at the next drain.
enum DeferredOp {
    DestroyInstance { id: InstanceId, escalate: bool },
    DestroyBlueprint { group: String, name: String },
}

/// The FSM runtime engine. One value owns one independent registry; hosts
/// that want isolation (one per subsystem, one per test) simply construct
/// several.
pub struct FsmEngine<C> {
    groups: HashMap<String, HashMap<String, Bucket<C>>>,
    /// Instance id -> (group, blueprint name).
    locator: HashMap<InstanceId, (String, String)>,
    pending: VecDeque<DeferredOp>,
    escalator: Escalator,
    diagnostics: Diagnostics,
    settings: EngineSettings,
    next_id: u64,
}

impl<C: Context> FsmEngine<C> {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self {
            groups: HashMap::new(),
            locator: HashMap::new(),
            pending: VecDeque::new(),
            escalator: Escalator::default(),
            diagnostics: Diagnostics::default(),
            settings,
            next_id: 1,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut EngineSettings {
        &mut self.settings
    }

    /// Installs the diagnostic subscription point. One sink per engine;
    /// installing a new one replaces the old.
    pub fn set_diagnostic_sink<F>(&mut self, sink: F)
    where
        F: FnMut(&str, Option<&Fault>) + Send + 'static,
    {
        self.diagnostics.set_sink(Some(Box::new(sink) as DiagnosticSink));
    }

    pub fn clear_diagnostic_sink(&mut self) {
        self.diagnostics.set_sink(None);
    }

    pub(crate) fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    // =========================================================================
    // Blueprint management
    // =========================================================================

    /// Registers a blueprint under its own name and processing group,
    /// replacing any prior definition in place. Existing instances stay
    /// attached and observe the new definition on their next step.
    pub fn register(&mut self, blueprint: Blueprint<C>) {
        let group = blueprint.group().to_string();
        let name = blueprint.name().to_string();
        let buckets = self.groups.entry(group.clone()).or_default();
        match buckets.get_mut(&name) {
            Some(bucket) => {
                let old = bucket.blueprint.signature();
                let new = blueprint.signature();
                let rate = blueprint.rate();
                bucket.blueprint = blueprint;
                bucket.set_rate(rate);
                self.diagnostics.note(format!(
                    "replaced blueprint '{}' in group '{}' (signature {} -> {}), {} instance(s) reattached",
                    name,
                    group,
                    old,
                    new,
                    bucket.instances.len()
                ));
            }
            None => {
                tracing::debug!("registered blueprint '{}' in group '{}'", name, group);
                buckets.insert(name, Bucket::new(blueprint));
            }
        }
    }

    pub fn exists(&self, name: &str, group: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|g| g.contains_key(name))
    }

    /// All processing groups, sorted.
    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.keys().cloned().collect();
        names.sort();
        names
    }

    /// Blueprint names in a group, sorted. Empty for an unknown group.
    pub fn blueprint_names(&self, group: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .get(group)
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn blueprint(&self, name: &str, group: &str) -> Option<&Blueprint<C>> {
        self.groups
            .get(group)
            .and_then(|g| g.get(name))
            .map(|b| &b.blueprint)
    }

    /// Destroys a blueprint and every instance still running under it.
    /// Unknown names are reported, not fatal.
    pub fn destroy_blueprint(&mut self, name: &str, group: &str) {
        let Some(buckets) = self.groups.get_mut(group) else {
            self.diagnostics.report(
                format!("destroy_blueprint: unknown processing group '{}'", group),
                None,
            );
            return;
        };
        let Some(mut bucket) = buckets.remove(name) else {
            self.diagnostics.report(
                format!(
                    "destroy_blueprint: no blueprint '{}' in group '{}'",
                    name, group
                ),
                None,
            );
            return;
        };
        if buckets.is_empty() {
            self.groups.remove(group);
        }
        for mut handle in bucket.instances.drain(..) {
            self.locator.remove(&handle.id);
            self.escalator.clear_instance(handle.id);
            stepper::shutdown(&bucket.blueprint, &mut handle, &mut self.diagnostics);
        }
        self.escalator.clear_definition(group, name);
    }

    /// Destroys a whole processing group. Unknown groups are reported, not
    /// fatal.
    pub fn destroy_group(&mut self, group: &str) {
        let Some(buckets) = self.groups.remove(group) else {
            self.diagnostics.report(
                format!("destroy_group: unknown processing group '{}'", group),
                None,
            );
            return;
        };
        for (name, mut bucket) in buckets {
            for mut handle in bucket.instances.drain(..) {
                self.locator.remove(&handle.id);
                self.escalator.clear_instance(handle.id);
                stepper::shutdown(&bucket.blueprint, &mut handle, &mut self.diagnostics);
            }
            self.escalator.clear_definition(group, &name);
        }
    }

    // =========================================================================
    // Instance management
    // =========================================================================

    /// Creates an instance of the named blueprint, searching every group
    /// (lowest group name wins when the name is registered in several).
    pub fn create_instance(
        &mut self,
        name: &str,
        context: ContextHandle<C>,
    ) -> Result<InstanceId, FsmError> {
        let group = self
            .groups
            .iter()
            .filter(|(_, buckets)| buckets.contains_key(name))
            .map(|(g, _)| g.clone())
            .min()
            .ok_or_else(|| FsmError::UnknownBlueprint {
                name: name.to_string(),
            })?;
        self.create_instance_in(name, &group, context)
    }

    /// Creates an instance of the named blueprint in an explicit group.
    /// The instance starts in the blueprint's initial state; the enter
    /// callback is deferred until the first step.
    pub fn create_instance_in(
        &mut self,
        name: &str,
        group: &str,
        context: ContextHandle<C>,
    ) -> Result<InstanceId, FsmError> {
        {
            let ctx = context.lock();
            if !ctx.is_valid() {
                return Err(FsmError::InvalidContext {
                    name: ctx.name().to_string(),
                });
            }
        }
        let initial = {
            let bucket = self
                .groups
                .get(group)
                .and_then(|g| g.get(name))
                .ok_or_else(|| FsmError::BlueprintNotFound {
                    name: name.to_string(),
                    group: group.to_string(),
                })?;
            bucket
                .blueprint
                .initial()
                .ok_or_else(|| FsmError::InvalidDefinition {
                    reason: format!("blueprint '{}' has no initial state", name),
                })?
                .to_string()
        };
        let id = InstanceId(self.next_id);
        self.next_id += 1;
        if let Some(bucket) = self.groups.get_mut(group).and_then(|g| g.get_mut(name)) {
            bucket.instances.push(Handle::new(id, context, &initial));
        }
        self.locator
            .insert(id, (group.to_string(), name.to_string()));
        Ok(id)
    }

    /// Destroys an instance: runs its current state's exit callback, marks
    /// the context invalid, and detaches it from its bucket.
    pub fn destroy_instance(&mut self, id: InstanceId) -> Result<(), FsmError> {
        if self.remove_instance(id, false) {
            Ok(())
        } else {
            Err(FsmError::InstanceNotFound { id })
        }
    }

    /// Instance ids attached to a blueprint, in creation order.
    pub fn list_instances(&self, name: &str, group: &str) -> Vec<InstanceId> {
        self.groups
            .get(group)
            .and_then(|g| g.get(name))
            .map(|b| b.instances.iter().map(|h| h.id).collect())
            .unwrap_or_default()
    }

    pub fn instance_count(&self, name: &str, group: &str) -> usize {
        self.groups
            .get(group)
            .and_then(|g| g.get(name))
            .map(|b| b.instances.len())
            .unwrap_or(0)
    }

    /// Current state name of an instance.
    pub fn current_state(&self, id: InstanceId) -> Result<&str, FsmError> {
        self.find_handle(id).map(|h| h.current_state())
    }

    /// The shared context handle bound to an instance.
    pub fn context(&self, id: InstanceId) -> Result<ContextHandle<C>, FsmError> {
        self.find_handle(id).map(|h| h.context().clone())
    }

    /// Consecutive fault count recorded against an instance.
    pub fn instance_failures(&self, id: InstanceId) -> u32 {
        self.escalator.instance_fault_count(id)
    }

    /// Error-destruction count recorded against a blueprint.
    pub fn definition_failures(&self, name: &str, group: &str) -> u32 {
        self.escalator.definition_fault_count(group, name)
    }

    // =========================================================================
    // Advancement
    // =========================================================================

    /// Advances every bucket in the group that passes its rate gate, then
    /// drains deferred destructions. Unknown groups are reported, not fatal.
    pub fn tick(&mut self, group: &str) {
        let started = Instant::now();
        let names: Vec<String> = match self.groups.get(group) {
            Some(buckets) => {
                let mut names: Vec<String> = buckets.keys().cloned().collect();
                names.sort();
                names
            }
            None => {
                self.diagnostics.report(
                    format!("tick: unknown processing group '{}'", group),
                    None,
                );
                return;
            }
        };

        for name in &names {
            let mut outcomes: Vec<(InstanceId, StepReport)> = Vec::new();
            if let Some(bucket) = self.groups.get_mut(group).and_then(|g| g.get_mut(name)) {
                if !bucket.should_run() {
                    continue;
                }
                let Bucket {
                    blueprint,
                    instances,
                    ..
                } = bucket;
                for handle in instances.iter_mut() {
                    let report = stepper::step(blueprint, handle, &mut self.diagnostics);
                    outcomes.push((handle.id, report));
                }
            }
            for (id, report) in outcomes {
                self.note_step(id, report);
            }
        }

        self.drain_deferred();

        if let Some(budget) = self.settings.tick_warn_threshold {
            let elapsed = started.elapsed();
            if elapsed > budget {
                self.diagnostics.report(
                    format!(
                        "tick of group '{}' took {:?} (budget {:?})",
                        group, elapsed, budget
                    ),
                    None,
                );
            }
        }
    }

    /// Runs one full step for a single instance, regardless of its bucket's
    /// tick rate.
    pub fn step(&mut self, id: InstanceId) -> Result<(), FsmError> {
        let (group, name) = self
            .locator
            .get(&id)
            .cloned()
            .ok_or(FsmError::InstanceNotFound { id })?;
        let mut outcome = None;
        if let Some(bucket) = self.groups.get_mut(&group).and_then(|g| g.get_mut(&name)) {
            let Bucket {
                blueprint,
                instances,
                ..
            } = bucket;
            if let Some(handle) = instances.iter_mut().find(|h| h.id == id) {
                outcome = Some(stepper::step(blueprint, handle, &mut self.diagnostics));
            }
        }
        match outcome {
            Some(report) => {
                self.note_step(id, report);
                self.drain_deferred();
                Ok(())
            }
            None => Err(FsmError::InstanceNotFound { id }),
        }
    }

    /// Unconditionally moves an instance to the named state, bypassing
    /// guards: exit of the source, then enter of the destination, both
    /// immediately. Returns whether the move happened; a missing
    /// destination is a reported no-op.
    pub fn force_transition(&mut self, id: InstanceId, to: &str) -> Result<bool, FsmError> {
        let (group, name) = self
            .locator
            .get(&id)
            .cloned()
            .ok_or(FsmError::InstanceNotFound { id })?;
        let mut outcome = None;
        if let Some(bucket) = self.groups.get_mut(&group).and_then(|g| g.get_mut(&name)) {
            let Bucket {
                blueprint,
                instances,
                ..
            } = bucket;
            if let Some(handle) = instances.iter_mut().find(|h| h.id == id) {
                outcome = Some(stepper::force(blueprint, handle, to, &mut self.diagnostics));
            }
        }
        let Some(report) = outcome else {
            return Err(FsmError::InstanceNotFound { id });
        };
        if report.faults > 0 {
            self.note_faults(id, report.faults);
            self.drain_deferred();
        }
        Ok(report.moved)
    }

    // =========================================================================
    // Runtime modification
    // =========================================================================

    /// Applies a staged modification batch to a registered blueprint in one
    /// synchronous pass. Individual operations that turn out invalid are
    /// reported and skipped; the rest of the batch still applies. A staged
    /// group move is applied last.
    pub fn apply_modification(
        &mut self,
        name: &str,
        group: &str,
        modification: Modification<C>,
    ) -> Result<(), FsmError> {
        if !self.exists(name, group) {
            return Err(FsmError::BlueprintNotFound {
                name: name.to_string(),
                group: group.to_string(),
            });
        }
        let mut target_group: Option<String> = None;
        let mut migration_faults: Vec<(InstanceId, u32)> = Vec::new();

        for op in modification.ops {
            let Some(bucket) = self.groups.get_mut(group).and_then(|g| g.get_mut(name)) else {
                break;
            };
            match op {
                ModOp::AddState(state) => {
                    if let Err(e) = bucket.blueprint.add_state(state) {
                        self.diagnostics.report(
                            format!("modification of '{}' ({}): {}", name, group, e),
                            None,
                        );
                    }
                }
                ModOp::RemoveState {
                    name: state,
                    fallback,
                } => {
                    let Bucket {
                        blueprint,
                        instances,
                        ..
                    } = bucket;
                    if !blueprint.has_state(&state) {
                        self.diagnostics.report(
                            format!(
                                "modification of '{}' ({}): cannot remove unknown state '{}'",
                                name, group, state
                            ),
                            None,
                        );
                        continue;
                    }
                    // The migration target is settled while the state still
                    // exists; occupying instances move before the removal.
                    let target = match &fallback {
                        Some(f) if *f != state && blueprint.has_state(f) => Some(f.clone()),
                        Some(f) => {
                            self.diagnostics.report(
                                format!(
                                    "modification of '{}' ({}): fallback state '{}' is invalid, using initial",
                                    name, group, f
                                ),
                                None,
                            );
                            blueprint.initial().filter(|i| *i != state).map(str::to_string)
                        }
                        None => blueprint.initial().filter(|i| *i != state).map(str::to_string),
                    };
                    match target {
                        Some(target) => {
                            for handle in instances.iter_mut().filter(|h| h.current == state) {
                                let report = stepper::force(
                                    blueprint,
                                    handle,
                                    &target,
                                    &mut self.diagnostics,
                                );
                                if report.faults > 0 {
                                    migration_faults.push((handle.id, report.faults));
                                }
                            }
                        }
                        None => {
                            if instances.iter().any(|h| h.current == state) {
                                self.diagnostics.report(
                                    format!(
                                        "modification of '{}' ({}): no usable fallback for removed state '{}', occupying instances will recover on their next step",
                                        name, group, state
                                    ),
                                    None,
                                );
                            }
                        }
                    }
                    if let Err(e) = blueprint.remove_state(&state) {
                        self.diagnostics.report(
                            format!("modification of '{}' ({}): {}", name, group, e),
                            None,
                        );
                    }
                }
                ModOp::AddTransition { from, to, guard } => {
                    if let Err(e) = bucket.blueprint.add_transition_guard(&from, &to, guard) {
                        self.diagnostics.report(
                            format!("modification of '{}' ({}): {}", name, group, e),
                            None,
                        );
                    }
                }
                ModOp::RemoveTransition { from, to } => {
                    if let Err(e) = bucket.blueprint.remove_transition(&from, &to) {
                        self.diagnostics.report(
                            format!("modification of '{}' ({}): {}", name, group, e),
                            None,
                        );
                    }
                }
                ModOp::AddAnyTransition { to, guard } => {
                    if let Err(e) = bucket.blueprint.add_any_transition_guard(&to, guard) {
                        self.diagnostics.report(
                            format!("modification of '{}' ({}): {}", name, group, e),
                            None,
                        );
                    }
                }
                ModOp::RemoveAnyTransition { to } => {
                    if let Err(e) = bucket.blueprint.remove_any_transition(&to) {
                        self.diagnostics.report(
                            format!("modification of '{}' ({}): {}", name, group, e),
                            None,
                        );
                    }
                }
                ModOp::SetRate(rate) => {
                    bucket.set_rate(rate);
                    bucket.blueprint.set_rate(rate);
                }
                ModOp::SetGroup(g) => target_group = Some(g),
            }
        }

        if let Some(new_group) = target_group {
            if new_group != group {
                self.move_bucket(name, group, &new_group);
            }
        }

        for (id, faults) in migration_faults {
            self.note_faults(id, faults);
        }
        self.drain_deferred();
        Ok(())
    }

    fn move_bucket(&mut self, name: &str, group: &str, new_group: &str) {
        let collision = self
            .groups
            .get(new_group)
            .is_some_and(|g| g.contains_key(name));
        if collision {
            self.diagnostics.report(
                format!(
                    "modification of '{}' ({}): group '{}' already holds a blueprint with this name, move skipped",
                    name, group, new_group
                ),
                None,
            );
            return;
        }
        let Some(mut bucket) = self.groups.get_mut(group).and_then(|g| g.remove(name)) else {
            return;
        };
        bucket.blueprint.set_group(new_group);
        for handle in &bucket.instances {
            self.locator
                .insert(handle.id, (new_group.to_string(), name.to_string()));
        }
        self.escalator.move_definition(group, name, new_group);
        if self.groups.get(group).is_some_and(|g| g.is_empty()) {
            self.groups.remove(group);
        }
        self.groups
            .entry(new_group.to_string())
            .or_default()
            .insert(name.to_string(), bucket);
    }

    // =========================================================================
    // Escalation and deferred mutation
    // =========================================================================

    fn note_step(&mut self, id: InstanceId, report: StepReport) {
        if report.dead {
            self.diagnostics.report(
                format!("instance {} context is invalid, scheduling destruction", id),
                None,
            );
            self.pending
                .push_back(DeferredOp::DestroyInstance { id, escalate: false });
            return;
        }
        if report.faults == 0 {
            self.escalator.clear_instance(id);
        } else {
            self.note_faults(id, report.faults);
        }
    }

    fn note_faults(&mut self, id: InstanceId, faults: u32) {
        for _ in 0..faults {
            let count = self.escalator.instance_fault(id);
            if count >= self.settings.instance_error_threshold {
                self.escalator.clear_instance(id);
                self.diagnostics.report(
                    format!(
                        "instance {} exceeded the instance error threshold ({}), scheduling destruction",
                        id, self.settings.instance_error_threshold
                    ),
                    None,
                );
                self.pending
                    .push_back(DeferredOp::DestroyInstance { id, escalate: true });
                break;
            }
        }
    }

    fn drain_deferred(&mut self) {
        while let Some(op) = self.pending.pop_front() {
            match op {
                DeferredOp::DestroyInstance { id, escalate } => {
                    self.remove_instance(id, escalate);
                }
                DeferredOp::DestroyBlueprint { group, name } => {
                    self.destroy_blueprint(&name, &group);
                }
            }
        }
    }

    /// Detaches and shuts down one instance. With `escalate`, the
    /// destruction counts against the owning blueprint and may in turn
    /// schedule the blueprint's destruction.
    fn remove_instance(&mut self, id: InstanceId, escalate: bool) -> bool {
        let Some((group, name)) = self.locator.remove(&id) else {
            return false;
        };
        let Some(bucket) = self.groups.get_mut(&group).and_then(|g| g.get_mut(&name)) else {
            return false;
        };
        let Some(pos) = bucket.instances.iter().position(|h| h.id == id) else {
            return false;
        };
        let mut handle = bucket.instances.remove(pos);
        stepper::shutdown(&bucket.blueprint, &mut handle, &mut self.diagnostics);
        self.escalator.clear_instance(id);
        if escalate {
            let count = self.escalator.definition_fault(&group, &name);
            self.diagnostics.report(
                format!(
                    "instance {} of blueprint '{}' (group '{}') destroyed after repeated failures ({} error destruction(s) so far)",
                    id, name, group, count
                ),
                None,
            );
            if count >= self.settings.definition_error_threshold {
                self.diagnostics.report(
                    format!(
                        "blueprint '{}' in group '{}' exceeded the definition error threshold ({}), scheduling destruction",
                        name, group, self.settings.definition_error_threshold
                    ),
                    None,
                );
                self.pending
                    .push_back(DeferredOp::DestroyBlueprint { group, name });
            }
        }
        true
    }

    fn find_handle(&self, id: InstanceId) -> Result<&Handle<C>, FsmError> {
        let (group, name) = self
            .locator
            .get(&id)
            .ok_or(FsmError::InstanceNotFound { id })?;
        self.groups
            .get(group)
            .and_then(|g| g.get(name))
            .and_then(|b| b.instances.iter().find(|h| h.id == id))
            .ok_or(FsmError::InstanceNotFound { id })
    }
}

impl<C: Context> Default for FsmEngine<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::State;
    use crate::builder::BlueprintBuilder;
    use crate::context::shared;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Probe {
        name: String,
        alive: bool,
        on: bool,
        health: i32,
        log: Vec<String>,
    }

    impl Probe {
        fn new(name: &str) -> ContextHandle<Probe> {
            shared(Probe {
                name: name.to_string(),
                alive: true,
                health: 100,
                ..Default::default()
            })
        }
    }

    impl Context for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn set_name(&mut self, name: String) {
            self.name = name;
        }

        fn is_valid(&self) -> bool {
            self.alive
        }

        fn invalidate(&mut self) {
            self.alive = false;
        }
    }

    fn count(ctx: &ContextHandle<Probe>, entry: &str) -> usize {
        ctx.lock().log.iter().filter(|e| e.as_str() == entry).count()
    }

    /// A state that records every lifecycle call in the context log.
    fn logged(name: &'static str) -> State<Probe> {
        State::new(name)
            .on_enter(move |c: &mut Probe| {
                c.log.push(format!("enter:{}", name));
                Ok(())
            })
            .on_update(move |c: &mut Probe| {
                c.log.push(format!("update:{}", name));
                Ok(())
            })
            .on_exit(move |c: &mut Probe| {
                c.log.push(format!("exit:{}", name));
                Ok(())
            })
    }

    fn light_engine() -> FsmEngine<Probe> {
        let mut engine = FsmEngine::new();
        BlueprintBuilder::new("light")
            .group("g")
            .state(logged("off"))
            .state(logged("on"))
            .transition("off", "on", |c: &Probe| Ok(c.on))
            .transition("on", "off", |c: &Probe| Ok(!c.on))
            .register(&mut engine)
            .unwrap();
        engine
    }

    type Captured = Arc<Mutex<Vec<(String, bool)>>>;

    fn capture(engine: &mut FsmEngine<Probe>) -> Captured {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let clone = captured.clone();
        engine.set_diagnostic_sink(move |msg, fault| {
            clone.lock().push((msg.to_string(), fault.is_some()));
        });
        captured
    }

    fn saw(captured: &Captured, needle: &str) -> bool {
        captured.lock().iter().any(|(msg, _)| msg.contains(needle))
    }

    #[test]
    fn test_register_exists_and_listing() {
        let engine = light_engine();
        assert!(engine.exists("light", "g"));
        assert!(!engine.exists("light", "other"));
        assert_eq!(engine.groups(), vec!["g"]);
        assert_eq!(engine.blueprint_names("g"), vec!["light"]);
        assert!(engine.blueprint_names("other").is_empty());
        assert!(engine.blueprint("light", "g").is_some());
    }

    #[test]
    fn test_light_switch_follows_guards() {
        let mut engine = light_engine();
        let ctx = Probe::new("bulb");
        let id = engine.create_instance_in("light", "g", ctx.clone()).unwrap();

        // Creation has no side effects; entry waits for the first tick.
        assert_eq!(engine.current_state(id).unwrap(), "off");
        assert_eq!(count(&ctx, "enter:off"), 0);

        engine.tick("g");
        assert_eq!(engine.current_state(id).unwrap(), "off");
        assert_eq!(count(&ctx, "enter:off"), 1);
        assert_eq!(count(&ctx, "update:off"), 1);

        ctx.lock().on = true;
        engine.tick("g");
        assert_eq!(engine.current_state(id).unwrap(), "on");
        assert_eq!(count(&ctx, "exit:off"), 1);
        // The destination's entry is deferred to the following step.
        assert_eq!(count(&ctx, "enter:on"), 0);

        engine.tick("g");
        assert_eq!(engine.current_state(id).unwrap(), "on");
        assert_eq!(count(&ctx, "enter:on"), 1);
        assert_eq!(count(&ctx, "exit:off"), 1);
    }

    #[test]
    fn test_noop_step_runs_update_once() {
        let mut engine = light_engine();
        let ctx = Probe::new("bulb");
        let id = engine.create_instance_in("light", "g", ctx.clone()).unwrap();

        engine.tick("g");
        engine.tick("g");
        assert_eq!(engine.current_state(id).unwrap(), "off");
        assert_eq!(count(&ctx, "update:off"), 2);
        assert_eq!(engine.instance_failures(id), 0);
    }

    #[test]
    fn test_first_defined_transition_wins() {
        let mut engine = FsmEngine::new();
        BlueprintBuilder::new("race")
            .group("g")
            .state(logged("a"))
            .state(logged("b"))
            .state(logged("c"))
            .transition("a", "b", |_: &Probe| Ok(true))
            .transition("a", "c", |_: &Probe| Ok(true))
            .register(&mut engine)
            .unwrap();

        for _ in 0..3 {
            let ctx = Probe::new("runner");
            let id = engine.create_instance_in("race", "g", ctx.clone()).unwrap();
            engine.step(id).unwrap();
            assert_eq!(engine.current_state(id).unwrap(), "b");
            assert_eq!(count(&ctx, "enter:c"), 0);
        }
    }

    #[test]
    fn test_any_state_outranks_ordinary_and_skips_update() {
        let mut engine = FsmEngine::new();
        BlueprintBuilder::new("mortal")
            .group("g")
            .state(logged("walk"))
            .state(logged("idle"))
            .state(logged("dead"))
            .transition("walk", "idle", |_: &Probe| Ok(true))
            .any_transition("dead", |c: &Probe| Ok(c.health <= 0))
            .register(&mut engine)
            .unwrap();

        let ctx = Probe::new("mob");
        ctx.lock().health = 0;
        let id = engine.create_instance_in("mortal", "g", ctx.clone()).unwrap();

        engine.step(id).unwrap();
        assert_eq!(engine.current_state(id).unwrap(), "dead");
        // The any-state hit preempts the whole step: no entry, no update.
        assert_eq!(count(&ctx, "update:walk"), 0);
        assert_eq!(count(&ctx, "enter:walk"), 0);
        assert_eq!(count(&ctx, "exit:walk"), 1);

        engine.step(id).unwrap();
        assert_eq!(count(&ctx, "enter:dead"), 1);
    }

    #[test]
    fn test_guard_fault_skips_to_next_candidate() {
        let mut engine = FsmEngine::new();
        let captured = capture(&mut engine);
        BlueprintBuilder::new("flaky")
            .group("g")
            .state(logged("a"))
            .state(logged("b"))
            .state(logged("c"))
            .transition("a", "b", |_: &Probe| Err("guard blew up".into()))
            .transition("a", "c", |_: &Probe| Ok(true))
            .register(&mut engine)
            .unwrap();

        let ctx = Probe::new("unit");
        let id = engine.create_instance_in("flaky", "g", ctx.clone()).unwrap();
        engine.step(id).unwrap();

        assert_eq!(engine.current_state(id).unwrap(), "c");
        assert_eq!(engine.instance_failures(id), 1);
        assert!(captured.lock().iter().any(|(_, fault)| *fault));
    }

    #[test]
    fn test_rate_gated_bucket_runs_every_nth_tick() {
        let mut engine = FsmEngine::new();
        BlueprintBuilder::new("slow")
            .group("s")
            .rate(3)
            .state(logged("a"))
            .register(&mut engine)
            .unwrap();
        let ctx = Probe::new("turtle");
        engine.create_instance_in("slow", "s", ctx.clone()).unwrap();

        engine.tick("s");
        engine.tick("s");
        assert_eq!(count(&ctx, "update:a"), 0);
        engine.tick("s");
        assert_eq!(count(&ctx, "update:a"), 1);
        assert_eq!(count(&ctx, "enter:a"), 1);

        engine.tick("s");
        engine.tick("s");
        assert_eq!(count(&ctx, "update:a"), 1);
        engine.tick("s");
        assert_eq!(count(&ctx, "update:a"), 2);
    }

    #[test]
    fn test_manual_bucket_never_auto_updates() {
        let mut engine = FsmEngine::new();
        BlueprintBuilder::new("frozen")
            .group("m")
            .rate(0)
            .state(logged("a"))
            .register(&mut engine)
            .unwrap();
        let ctx = Probe::new("statue");
        let id = engine.create_instance_in("frozen", "m", ctx.clone()).unwrap();

        for _ in 0..5 {
            engine.tick("m");
        }
        assert!(ctx.lock().log.is_empty());

        engine.step(id).unwrap();
        assert_eq!(count(&ctx, "enter:a"), 1);
        assert_eq!(count(&ctx, "update:a"), 1);
    }

    #[test]
    fn test_instance_escalation_removes_and_counts() {
        let mut engine = FsmEngine::new();
        BlueprintBuilder::new("doomed")
            .group("d")
            .state(State::new("boom").on_update(|_: &mut Probe| Err("kaboom".into())))
            .register(&mut engine)
            .unwrap();
        let ctx = Probe::new("victim");
        let id = engine.create_instance_in("doomed", "d", ctx.clone()).unwrap();

        for i in 1..=4u32 {
            engine.tick("d");
            assert_eq!(engine.instance_failures(id), i);
            assert_eq!(engine.list_instances("doomed", "d"), vec![id]);
        }

        // Fifth consecutive fault reaches the default threshold.
        engine.tick("d");
        assert!(engine.list_instances("doomed", "d").is_empty());
        assert_eq!(engine.definition_failures("doomed", "d"), 1);
        assert!(!ctx.lock().is_valid());
        assert!(engine.current_state(id).is_err());
    }

    #[test]
    fn test_clean_step_resets_consecutive_faults() {
        let mut engine = FsmEngine::new();
        BlueprintBuilder::new("wobbly")
            .group("w")
            .state(State::new("a").on_update(|c: &mut Probe| {
                if c.on {
                    Err("bad day".into())
                } else {
                    Ok(())
                }
            }))
            .register(&mut engine)
            .unwrap();
        let ctx = Probe::new("unit");
        let id = engine.create_instance_in("wobbly", "w", ctx.clone()).unwrap();

        ctx.lock().on = true;
        for _ in 0..4 {
            engine.tick("w");
        }
        assert_eq!(engine.instance_failures(id), 4);

        ctx.lock().on = false;
        engine.tick("w");
        assert_eq!(engine.instance_failures(id), 0);

        // The streak starts over; the instance survives four more faults.
        ctx.lock().on = true;
        for _ in 0..4 {
            engine.tick("w");
        }
        assert_eq!(engine.list_instances("wobbly", "w"), vec![id]);
    }

    #[test]
    fn test_definition_escalation_removes_blueprint() {
        let mut engine = FsmEngine::new();
        engine.settings_mut().instance_error_threshold = 1;
        engine.settings_mut().definition_error_threshold = 2;

        BlueprintBuilder::new("cursed")
            .group("c")
            .state(State::new("boom").on_update(|_: &mut Probe| Err("kaboom".into())))
            .register(&mut engine)
            .unwrap();
        let ctx1 = Probe::new("one");
        let ctx2 = Probe::new("two");
        engine.create_instance_in("cursed", "c", ctx1.clone()).unwrap();
        engine.create_instance_in("cursed", "c", ctx2.clone()).unwrap();

        engine.tick("c");

        assert!(!engine.exists("cursed", "c"));
        assert!(engine.list_instances("cursed", "c").is_empty());
        assert!(!ctx1.lock().is_valid());
        assert!(!ctx2.lock().is_valid());
    }

    #[test]
    fn test_invalid_context_is_reaped_on_tick() {
        let mut engine = light_engine();
        let captured = capture(&mut engine);
        let ctx1 = Probe::new("first");
        let ctx2 = Probe::new("second");
        let id1 = engine.create_instance_in("light", "g", ctx1.clone()).unwrap();
        let id2 = engine.create_instance_in("light", "g", ctx2.clone()).unwrap();

        engine.tick("g");
        ctx1.lock().invalidate();
        engine.tick("g");

        assert_eq!(engine.list_instances("light", "g"), vec![id2]);
        assert!(engine.current_state(id1).is_err());
        assert!(saw(&captured, "context is invalid"));
        // The survivor kept advancing.
        assert_eq!(count(&ctx2, "update:off"), 2);
    }

    #[test]
    fn test_destroy_instance_runs_exit_and_invalidates() {
        let mut engine = light_engine();
        let ctx = Probe::new("bulb");
        let id = engine.create_instance_in("light", "g", ctx.clone()).unwrap();
        engine.tick("g");

        engine.destroy_instance(id).unwrap();
        assert_eq!(count(&ctx, "exit:off"), 1);
        assert!(!ctx.lock().is_valid());
        assert!(engine.list_instances("light", "g").is_empty());
        assert!(matches!(
            engine.destroy_instance(id),
            Err(FsmError::InstanceNotFound { .. })
        ));
    }

    #[test]
    fn test_destroy_blueprint_tears_down_instances() {
        let mut engine = light_engine();
        let ctx1 = Probe::new("one");
        let ctx2 = Probe::new("two");
        engine.create_instance_in("light", "g", ctx1.clone()).unwrap();
        engine.create_instance_in("light", "g", ctx2.clone()).unwrap();
        engine.tick("g");

        engine.destroy_blueprint("light", "g");
        assert!(!engine.exists("light", "g"));
        assert!(engine.groups().is_empty());
        assert_eq!(count(&ctx1, "exit:off"), 1);
        assert_eq!(count(&ctx2, "exit:off"), 1);
        assert!(!ctx1.lock().is_valid());
        assert!(!ctx2.lock().is_valid());
    }

    #[test]
    fn test_destroy_unknown_targets_are_reported_not_fatal() {
        let mut engine = light_engine();
        let captured = capture(&mut engine);

        engine.destroy_group("ghost");
        engine.destroy_blueprint("phantom", "g");
        engine.tick("ghost");

        assert!(saw(&captured, "unknown processing group 'ghost'"));
        assert!(saw(&captured, "no blueprint 'phantom'"));
    }

    #[test]
    fn test_force_transition_bypasses_guards() {
        let mut engine = light_engine();
        let ctx = Probe::new("bulb");
        let id = engine.create_instance_in("light", "g", ctx.clone()).unwrap();
        engine.tick("g");

        // Guards would keep the light off; force it on anyway.
        assert!(engine.force_transition(id, "on").unwrap());
        assert_eq!(engine.current_state(id).unwrap(), "on");
        assert_eq!(count(&ctx, "exit:off"), 1);
        assert_eq!(count(&ctx, "enter:on"), 1);

        // Entry already ran; the next tick only updates.
        ctx.lock().on = true;
        engine.tick("g");
        assert_eq!(count(&ctx, "enter:on"), 1);
        assert_eq!(count(&ctx, "update:on"), 1);
    }

    #[test]
    fn test_force_transition_to_missing_state_is_noop() {
        let mut engine = light_engine();
        let captured = capture(&mut engine);
        let ctx = Probe::new("bulb");
        let id = engine.create_instance_in("light", "g", ctx.clone()).unwrap();
        engine.tick("g");

        assert!(!engine.force_transition(id, "purple").unwrap());
        assert_eq!(engine.current_state(id).unwrap(), "off");
        assert_eq!(count(&ctx, "exit:off"), 0);
        assert!(saw(&captured, "missing state 'purple'"));
    }

    #[test]
    fn test_replacing_blueprint_keeps_instances_and_recovers_state() {
        let mut engine = light_engine();
        let captured = capture(&mut engine);
        let ctx = Probe::new("bulb");
        let id = engine.create_instance_in("light", "g", ctx.clone()).unwrap();
        engine.tick("g");
        assert_eq!(engine.current_state(id).unwrap(), "off");

        // A replacement definition without the old states.
        BlueprintBuilder::new("light")
            .group("g")
            .state(logged("standby"))
            .register(&mut engine)
            .unwrap();

        assert_eq!(engine.list_instances("light", "g"), vec![id]);
        assert!(saw(&captured, "replaced blueprint 'light'"));

        // The stale current state recovers through the new initial state.
        engine.tick("g");
        assert_eq!(engine.current_state(id).unwrap(), "standby");
        assert_eq!(count(&ctx, "enter:standby"), 1);
        assert!(saw(&captured, "unknown state 'off'"));
    }

    #[test]
    fn test_remove_state_migrates_occupants_to_fallback() {
        let mut engine = FsmEngine::new();
        BlueprintBuilder::new("worker")
            .group("w")
            .state(logged("work"))
            .state(logged("rest"))
            .state(logged("refuge"))
            .register(&mut engine)
            .unwrap();
        let ctx = Probe::new("drone");
        let id = engine.create_instance_in("worker", "w", ctx.clone()).unwrap();
        engine.tick("w");
        assert_eq!(engine.current_state(id).unwrap(), "work");

        engine
            .apply_modification(
                "worker",
                "w",
                Modification::new().remove_state_with_fallback("work", "refuge"),
            )
            .unwrap();

        assert_eq!(engine.current_state(id).unwrap(), "refuge");
        assert_eq!(count(&ctx, "exit:work"), 1);
        assert_eq!(count(&ctx, "enter:refuge"), 1);
        assert!(!engine.blueprint("worker", "w").unwrap().has_state("work"));
    }

    #[test]
    fn test_remove_state_with_bad_fallback_uses_initial() {
        let mut engine = FsmEngine::new();
        let captured = capture(&mut engine);
        BlueprintBuilder::new("worker")
            .group("w")
            .state(logged("idle"))
            .state(logged("work"))
            .register(&mut engine)
            .unwrap();
        let ctx = Probe::new("drone");
        let id = engine.create_instance_in("worker", "w", ctx.clone()).unwrap();
        engine.force_transition(id, "work").unwrap();

        engine
            .apply_modification(
                "worker",
                "w",
                Modification::new().remove_state_with_fallback("work", "nowhere"),
            )
            .unwrap();

        assert_eq!(engine.current_state(id).unwrap(), "idle");
        assert!(saw(&captured, "fallback state 'nowhere' is invalid"));
    }

    #[test]
    fn test_modification_edits_structure_and_rate() {
        let mut engine = FsmEngine::new();
        BlueprintBuilder::new("door")
            .group("m")
            .state(logged("closed"))
            .state(logged("open"))
            .transition("closed", "open", |c: &Probe| Ok(c.on))
            .register(&mut engine)
            .unwrap();
        let ctx = Probe::new("door-1");
        let id = engine.create_instance_in("door", "m", ctx.clone()).unwrap();

        engine
            .apply_modification(
                "door",
                "m",
                Modification::new()
                    .add_state(logged("jammed"))
                    .add_transition("closed", "jammed", |c: &Probe| Ok(c.health < 0))
                    .remove_transition("closed", "open")
                    .set_rate(2),
            )
            .unwrap();

        let bp = engine.blueprint("door", "m").unwrap();
        assert!(bp.has_state("jammed"));
        assert!(bp.has_transition("closed", "jammed"));
        assert!(!bp.has_transition("closed", "open"));

        // The removed transition no longer fires even with its guard true.
        ctx.lock().on = true;
        engine.tick("m");
        engine.tick("m");
        assert_eq!(engine.current_state(id).unwrap(), "closed");
        // Rate 2 gates updates to every second tick.
        assert_eq!(count(&ctx, "update:closed"), 1);
    }

    #[test]
    fn test_modification_moves_bucket_between_groups() {
        let mut engine = FsmEngine::new();
        BlueprintBuilder::new("roam")
            .group("old")
            .state(logged("idle"))
            .register(&mut engine)
            .unwrap();
        let ctx = Probe::new("wanderer");
        let id = engine.create_instance_in("roam", "old", ctx.clone()).unwrap();

        engine
            .apply_modification("roam", "old", Modification::new().set_group("new"))
            .unwrap();

        assert!(engine.exists("roam", "new"));
        assert!(!engine.exists("roam", "old"));
        assert_eq!(engine.groups(), vec!["new"]);
        assert_eq!(engine.list_instances("roam", "new"), vec![id]);

        engine.tick("new");
        assert_eq!(count(&ctx, "update:idle"), 1);
        engine.step(id).unwrap();
        assert_eq!(count(&ctx, "update:idle"), 2);
    }

    #[test]
    fn test_modification_requires_registered_blueprint() {
        let mut engine = light_engine();
        let result =
            engine.apply_modification("phantom", "g", Modification::<Probe>::new().set_rate(1));
        assert!(matches!(result, Err(FsmError::BlueprintNotFound { .. })));
    }

    #[test]
    fn test_create_instance_errors() {
        let mut engine = light_engine();

        assert!(matches!(
            engine.create_instance_in("light", "nope", Probe::new("x")),
            Err(FsmError::BlueprintNotFound { .. })
        ));
        assert!(matches!(
            engine.create_instance("phantom", Probe::new("x")),
            Err(FsmError::UnknownBlueprint { .. })
        ));

        let dead = Probe::new("corpse");
        dead.lock().invalidate();
        assert!(matches!(
            engine.create_instance_in("light", "g", dead),
            Err(FsmError::InvalidContext { .. })
        ));

        BlueprintBuilder::new("hollow")
            .group("g")
            .register(&mut engine)
            .unwrap();
        assert!(matches!(
            engine.create_instance_in("hollow", "g", Probe::new("x")),
            Err(FsmError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_create_instance_searches_groups() {
        let mut engine = light_engine();
        let id = engine.create_instance("light", Probe::new("bulb")).unwrap();
        assert_eq!(engine.list_instances("light", "g"), vec![id]);
    }

    #[test]
    fn test_tick_budget_warning() {
        let mut engine = light_engine();
        engine.settings_mut().tick_warn_threshold = Some(Duration::from_nanos(1));
        let captured = capture(&mut engine);
        engine.create_instance_in("light", "g", Probe::new("bulb")).unwrap();

        engine.tick("g");
        assert!(saw(&captured, "budget"));
    }
}
