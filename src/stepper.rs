//! Per-instance stepping: transition evaluation and lifecycle sequencing.
//!
//! One step evaluates any-state transitions first (in definition order),
//! then runs the deferred enter callback and the update callback, then
//! evaluates ordinary transitions from the current state (in definition
//! order). The first true guard wins; a transition defers the destination's
//! enter callback to the next step. Caller faults are contained here:
//! a guard or callback returning an error is reported and evaluation moves
//! on to the next candidate.

use crate::blueprint::{Blueprint, Callback, Guard};
use crate::context::Context;
use crate::diagnostics::Diagnostics;
use crate::handle::{Handle, InstanceId};

/// Outcome of stepping one instance.
#[derive(Debug, Default)]
pub(crate) struct StepReport {
    /// Caller faults and recoveries reported during this step.
    pub faults: u32,
    /// The context read as invalid before any callback ran.
    pub dead: bool,
}

/// Outcome of a forced transition.
#[derive(Debug, Default)]
pub(crate) struct ForceReport {
    /// Whether the instance actually moved.
    pub moved: bool,
    /// Caller faults reported while moving.
    pub faults: u32,
}

/// Runs one full step for `handle` against `blueprint`.
pub(crate) fn step<C: Context>(
    blueprint: &Blueprint<C>,
    handle: &mut Handle<C>,
    diagnostics: &mut Diagnostics,
) -> StepReport {
    let mut report = StepReport::default();
    let mut ctx = handle.context.lock();
    if !ctx.is_valid() {
        report.dead = true;
        return report;
    }

    // Validity precheck: an unknown current state (stale after a blueprint
    // replacement) recovers to the initial state and aborts the step.
    let Some(current) = blueprint.resolve(&handle.current) else {
        report.faults += 1;
        diagnostics.report(
            format!(
                "instance {} ('{}') is in unknown state '{}' of blueprint '{}', recovering to initial",
                handle.id,
                ctx.name(),
                handle.current,
                blueprint.name()
            ),
            None,
        );
        report.faults += recover_to_initial(
            blueprint,
            handle.id,
            &mut handle.current,
            &mut handle.entered,
            &mut ctx,
            diagnostics,
        );
        return report;
    };
    let state = blueprint.state_by_id(current);

    // Any-state transitions outrank everything; a hit skips this step's
    // update entirely.
    for t in blueprint.any_transition_list() {
        let dest = blueprint.state_name(t.to);
        match check(diagnostics, handle.id, state.name(), dest, &t.guard, &ctx) {
            Some(true) => {
                report.faults += invoke(
                    diagnostics,
                    handle.id,
                    state.name(),
                    "exit",
                    state.exit(),
                    &mut ctx,
                );
                handle.current = dest.to_string();
                handle.entered = false;
                return report;
            }
            Some(false) => {}
            None => report.faults += 1,
        }
    }

    // Deferred entry: runs on the first step spent in this state, so that
    // constructing an instance has no side effects.
    if !handle.entered {
        report.faults += invoke(
            diagnostics,
            handle.id,
            state.name(),
            "enter",
            state.enter(),
            &mut ctx,
        );
        handle.entered = true;
    }

    report.faults += invoke(
        diagnostics,
        handle.id,
        state.name(),
        "update",
        state.update(),
        &mut ctx,
    );

    for t in blueprint.transitions_from(current) {
        let dest = blueprint.state_name(t.to);
        match check(diagnostics, handle.id, state.name(), dest, &t.guard, &ctx) {
            Some(true) => {
                report.faults += invoke(
                    diagnostics,
                    handle.id,
                    state.name(),
                    "exit",
                    state.exit(),
                    &mut ctx,
                );
                handle.current = dest.to_string();
                handle.entered = false;
                return report;
            }
            Some(false) => {}
            None => report.faults += 1,
        }
    }

    report
}

/// Unconditionally moves `handle` to the named state, bypassing guards.
///
/// Runs the source's exit callback (skipped with a report if the source no
/// longer exists), then the destination's enter callback immediately. A
/// missing destination is a reported no-op; the instance keeps its state.
pub(crate) fn force<C: Context>(
    blueprint: &Blueprint<C>,
    handle: &mut Handle<C>,
    to: &str,
    diagnostics: &mut Diagnostics,
) -> ForceReport {
    let mut report = ForceReport::default();
    let Some(dest_id) = blueprint.resolve(to) else {
        diagnostics.report(
            format!(
                "forced transition of instance {} to missing state '{}' in blueprint '{}' ignored",
                handle.id,
                to,
                blueprint.name()
            ),
            None,
        );
        return report;
    };

    let mut ctx = handle.context.lock();
    if !ctx.is_valid() {
        diagnostics.report(
            format!(
                "forced transition of instance {} skipped: context '{}' is invalid",
                handle.id,
                ctx.name()
            ),
            None,
        );
        return report;
    }

    match blueprint.resolve(&handle.current) {
        Some(src) => {
            let state = blueprint.state_by_id(src);
            report.faults += invoke(
                diagnostics,
                handle.id,
                state.name(),
                "exit",
                state.exit(),
                &mut ctx,
            );
        }
        None => diagnostics.report(
            format!(
                "instance {} forced out of unknown state '{}', exit skipped",
                handle.id, handle.current
            ),
            None,
        ),
    }

    let dest = blueprint.state_by_id(dest_id);
    handle.current = dest.name().to_string();
    report.faults += invoke(
        diagnostics,
        handle.id,
        dest.name(),
        "enter",
        dest.enter(),
        &mut ctx,
    );
    handle.entered = true;
    report.moved = true;
    report
}

/// Destruction sequencing: runs the current state's exit callback while the
/// context is still valid, then marks the context invalid.
pub(crate) fn shutdown<C: Context>(
    blueprint: &Blueprint<C>,
    handle: &mut Handle<C>,
    diagnostics: &mut Diagnostics,
) {
    let mut ctx = handle.context.lock();
    if !ctx.is_valid() {
        return;
    }
    if let Some(id) = blueprint.resolve(&handle.current) {
        let state = blueprint.state_by_id(id);
        invoke(
            diagnostics,
            handle.id,
            state.name(),
            "exit",
            state.exit(),
            &mut ctx,
        );
    }
    ctx.invalidate();
}

fn recover_to_initial<C: Context>(
    blueprint: &Blueprint<C>,
    id: InstanceId,
    current: &mut String,
    entered: &mut bool,
    ctx: &mut C,
    diagnostics: &mut Diagnostics,
) -> u32 {
    let Some(initial) = blueprint.initial_id() else {
        diagnostics.report(
            format!(
                "blueprint '{}' has no initial state, instance {} cannot recover",
                blueprint.name(),
                id
            ),
            None,
        );
        return 0;
    };
    let state = blueprint.state_by_id(initial);
    *current = state.name().to_string();
    let faults = invoke(diagnostics, id, state.name(), "enter", state.enter(), ctx);
    *entered = true;
    faults
}

/// Runs one optional callback, containing any fault. Returns the number of
/// faults reported (0 or 1).
fn invoke<C: Context>(
    diagnostics: &mut Diagnostics,
    id: InstanceId,
    state: &str,
    kind: &str,
    cb: Option<&Callback<C>>,
    ctx: &mut C,
) -> u32 {
    let Some(cb) = cb else { return 0 };
    match cb(ctx) {
        Ok(()) => 0,
        Err(fault) => {
            diagnostics.report(
                format!(
                    "instance {} ('{}'): {} callback of state '{}' failed",
                    id,
                    ctx.name(),
                    kind,
                    state
                ),
                Some(&fault),
            );
            1
        }
    }
}

/// Evaluates one guard, containing any fault. `None` means the guard
/// faulted and the transition must be skipped.
fn check<C: Context>(
    diagnostics: &mut Diagnostics,
    id: InstanceId,
    from: &str,
    to: &str,
    guard: &Guard<C>,
    ctx: &C,
) -> Option<bool> {
    match guard(ctx) {
        Ok(fire) => Some(fire),
        Err(fault) => {
            diagnostics.report(
                format!(
                    "instance {}: guard for transition '{}' -> '{}' failed",
                    id, from, to
                ),
                Some(&fault),
            );
            None
        }
    }
}
