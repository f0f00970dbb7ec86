//! # tickfsm
//!
//! An embeddable finite state machine runtime.
//!
//! This crate provides:
//! - Named FSM blueprints: states with enter/update/exit callbacks,
//!   guard-driven transitions, and any-state transitions
//! - A registry of live instances organized by processing group, advanced
//!   in batch by rate-gated group ticks or manually one step at a time
//! - Staged runtime modification of registered blueprints, safe with
//!   respect to live instances
//! - Fault containment: guards and callbacks that fail are reported and
//!   skipped, and repeat offenders are escalated out of service instead of
//!   taking down the host application
//!
//! The engine is single-threaded and cooperative: everything happens on the
//! thread that calls [`FsmEngine::tick`]. Contexts are caller-owned data
//! objects shared with the engine through [`ContextHandle`]; the engine only
//! calls through the [`Context`] capability trait.

pub mod blueprint;
pub mod builder;
pub mod context;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod handle;
pub mod modify;
mod stepper;

pub use blueprint::{
    Blueprint, BlueprintDescriptor, Callback, Guard, State, StateId, Transition,
    TransitionDescriptor, DEFAULT_GROUP, RATE_EVERY_TICK, RATE_MANUAL,
};
pub use builder::BlueprintBuilder;
pub use context::{shared, Context, ContextHandle};
pub use diagnostics::DiagnosticSink;
pub use engine::FsmEngine;
pub use error::{Fault, FsmError};
pub use escalation::EngineSettings;
pub use handle::{Handle, InstanceId};
pub use modify::Modification;
