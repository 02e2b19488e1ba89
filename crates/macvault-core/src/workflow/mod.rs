//! Operator workflows: pool administration and hardware provisioning.
//!
//! Every entry point returns a [`WorkflowReport`] so both binaries render
//! results the same way.

mod manage;
mod privilege;
mod provisioning;


use crate::repository::LoadedPool;

pub use manage::{
    add_generated, add_imported, add_manual, annotate_entry, change_passphrase, create_pool,
    export_stats, list_pool, pool_info, remove_entries, reset_entries, validate_new_passphrase,
    ResetSelection,
};
pub use privilege::{ensure_root, running_as_root};
pub use provisioning::{
    record_allocation, NetworkRestoreStatus, Pause, ProvisionFailure, ProvisionOutcome,
    ProvisionRequest, ProvisionSettings, ProvisionState, Provisioner, ThreadPause, ACTION_FAILED,
    ACTION_NO_CHANGE, ACTION_UPDATED,
};

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowReport {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, level: WorkflowLevel, message: impl Into<String>) {
        self.events.push(event(level, message));
    }

    pub fn has_level(&self, level: WorkflowLevel) -> bool {
        self.events.iter().any(|event| event.level == level)
    }
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

/// Operators must hear about pools that could not be verified.
pub(crate) fn signature_event(loaded: &LoadedPool) -> Option<WorkflowEvent> {
    loaded.is_legacy_unsigned().then(|| {
        event(
            WorkflowLevel::Security,
            "Pool has no integrity signature (legacy format); contents were not verified. \
             It will be signed on the next save.",
        )
    })
}
