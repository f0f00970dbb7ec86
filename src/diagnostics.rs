//! Diagnostic event channel.
//!
//! Every internal, instance-level, and definition-level event is surfaced as
//! a `(message, optional fault)` pair through a single subscription point,
//! and mirrored as a `tracing` event. Nothing here is fatal: diagnostics are
//! how the engine reports the problems it has already contained.

use crate::error::Fault;

/// Callback receiving every diagnostic event emitted by an engine.
pub type DiagnosticSink = Box<dyn FnMut(&str, Option<&Fault>) + Send>;

#[derive(Default)]
pub(crate) struct Diagnostics {
    sink: Option<DiagnosticSink>,
}

impl Diagnostics {
    pub(crate) fn set_sink(&mut self, sink: Option<DiagnosticSink>) {
        self.sink = sink;
    }

    /// Reports a contained problem: a caller fault, a structural
    /// inconsistency, or an escalation decision.
    pub(crate) fn report(&mut self, message: impl AsRef<str>, fault: Option<&Fault>) {
        let message = message.as_ref();
        match fault {
            Some(f) => tracing::warn!("{}: {}", message, f),
            None => tracing::warn!("{}", message),
        }
        if let Some(sink) = &mut self.sink {
            sink(message, fault);
        }
    }

    /// Reports an informational event, such as a definition being replaced.
    pub(crate) fn note(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!("{}", message);
        if let Some(sink) = &mut self.sink {
            sink(message, None);
        }
    }
}
