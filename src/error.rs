//! Core error types.

use crate::handle::InstanceId;
use thiserror::Error;

/// A fault raised by caller-supplied guard or callback code.
///
/// Faults are caught at the point of invocation, reported through the
/// diagnostic channel, and never propagated out of the engine.
pub type Fault = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned to the immediate caller of engine entry points.
///
/// Only programmer errors surface this way. Anything arising from runtime
/// machine operation (guard faults, unknown current states, invalid contexts
/// observed mid-tick) is recovered locally and reported as a diagnostic.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("blueprint '{name}' not registered in group '{group}'")]
    BlueprintNotFound { name: String, group: String },

    #[error("blueprint '{name}' not registered in any group")]
    UnknownBlueprint { name: String },

    #[error("instance not found: {id}")]
    InstanceNotFound { id: InstanceId },

    #[error("state '{state}' not found in blueprint '{blueprint}'")]
    StateNotFound { blueprint: String, state: String },

    #[error("transition '{from}' -> '{to}' not found in blueprint '{blueprint}'")]
    TransitionNotFound {
        blueprint: String,
        from: String,
        to: String,
    },

    #[error("invalid definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid state name: {reason}")]
    InvalidStateName { reason: String },

    #[error("context '{name}' is already invalid")]
    InvalidContext { name: String },
}
