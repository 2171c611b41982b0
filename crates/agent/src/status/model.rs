//! Model — status records stored per instance / checkpoint ID.
//!
//! Every field is an `Option`: `None` means "not set by this producer" and
//! leaves the stored value untouched on merge. This is what lets the
//! reconciler (which knows state), the port allocator path (which knows the
//! port), and the checkpoint engine (which knows both plus timing) each
//! update only the slice of status they own.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    Creating,
    Running,
    Deleted,
    CreationFailed,
}

impl WorkloadState {
    /// Terminal states are reported to the control plane once, then evicted.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkloadState::Deleted | WorkloadState::CreationFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Running,
    PullBaseImageFailed,
    ContainerWaitReadyFailed,
    ContainerCheckpointFailed,
    PushCheckpointFailed,
    Completed,
}

impl CheckpointState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CheckpointState::Running)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub state: Option<WorkloadState>,
    pub port: Option<u16>,
}

impl WorkloadStatus {
    pub(super) fn merge_from(&mut self, update: &WorkloadStatus) {
        if let Some(state) = update.state {
            self.state = Some(state);
        }
        if let Some(port) = update.port {
            self.port = Some(port);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStatus {
    pub state: Option<CheckpointState>,
    pub message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub port: Option<u16>,
}

impl CheckpointStatus {
    pub(super) fn merge_from(&mut self, update: &CheckpointStatus) {
        if let Some(state) = update.state {
            self.state = Some(state);
        }
        if let Some(message) = &update.message {
            self.message = Some(message.clone());
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(port) = update.port {
            self.port = Some(port);
        }
    }
}

/// Composite record: an ID may carry workload status, checkpoint status, or
/// both. On merge each present component merges independently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusRecord {
    pub workload: Option<WorkloadStatus>,
    pub checkpoint: Option<CheckpointStatus>,
}

impl StatusRecord {
    pub fn workload_state(state: WorkloadState) -> Self {
        Self {
            workload: Some(WorkloadStatus {
                state: Some(state),
                port: None,
            }),
            checkpoint: None,
        }
    }

    pub fn workload_port(port: u16) -> Self {
        Self {
            workload: Some(WorkloadStatus {
                state: None,
                port: Some(port),
            }),
            checkpoint: None,
        }
    }

    pub fn checkpoint(status: CheckpointStatus) -> Self {
        Self {
            workload: None,
            checkpoint: Some(status),
        }
    }

    pub(super) fn merge_from(&mut self, update: &StatusRecord) {
        if let Some(workload_update) = &update.workload {
            self.workload
                .get_or_insert_with(WorkloadStatus::default)
                .merge_from(workload_update);
        }
        if let Some(checkpoint_update) = &update.checkpoint {
            self.checkpoint
                .get_or_insert_with(CheckpointStatus::default)
                .merge_from(checkpoint_update);
        }
    }
}
