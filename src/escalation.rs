//! Failure escalation counters.
//!
//! A two-level circuit breaker. Consecutive faults on one instance
//! eventually destroy that instance; repeated error-destructions of
//! instances belonging to one blueprint eventually destroy the blueprint
//! and everything still running under it. The engine makes the destruction
//! decisions; this module only keeps the counts.

use crate::handle::InstanceId;
use std::collections::HashMap;
use std::time::Duration;

/// Tunable engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Consecutive faults before an instance is scheduled for destruction.
    pub instance_error_threshold: u32,

    /// Error-destroyed instances before a blueprint is scheduled for
    /// destruction.
    pub definition_error_threshold: u32,

    /// Optional wall-clock budget for one group tick. Exceeding it is
    /// reported as a diagnostic, nothing more.
    pub tick_warn_threshold: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            instance_error_threshold: 5,
            definition_error_threshold: 3,
            tick_warn_threshold: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct Escalator {
    /// Consecutive fault counts per live instance.
    instance_faults: HashMap<InstanceId, u32>,
    /// Error-destruction counts per (group, blueprint name).
    definition_faults: HashMap<(String, String), u32>,
}

impl Escalator {
    /// Records one fault; returns the new consecutive count.
    pub(crate) fn instance_fault(&mut self, id: InstanceId) -> u32 {
        let count = self.instance_faults.entry(id).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn instance_fault_count(&self, id: InstanceId) -> u32 {
        self.instance_faults.get(&id).copied().unwrap_or(0)
    }

    /// A clean step wipes the consecutive count.
    pub(crate) fn clear_instance(&mut self, id: InstanceId) {
        self.instance_faults.remove(&id);
    }

    /// Records an error-triggered instance destruction against the owning
    /// blueprint; returns the new count.
    pub(crate) fn definition_fault(&mut self, group: &str, name: &str) -> u32 {
        let count = self
            .definition_faults
            .entry((group.to_string(), name.to_string()))
            .or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn definition_fault_count(&self, group: &str, name: &str) -> u32 {
        self.definition_faults
            .get(&(group.to_string(), name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn clear_definition(&mut self, group: &str, name: &str) {
        self.definition_faults
            .remove(&(group.to_string(), name.to_string()));
    }

    /// Carries a blueprint's count across a processing-group move.
    pub(crate) fn move_definition(&mut self, group: &str, name: &str, new_group: &str) {
        if let Some(count) = self
            .definition_faults
            .remove(&(group.to_string(), name.to_string()))
        {
            self.definition_faults
                .insert((new_group.to_string(), name.to_string()), count);
        }
    }
}
