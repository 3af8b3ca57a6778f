//! Outward notifications for whatever presents the programmer to a user.
//!
//! Events flow one way, in the order the underlying board events occurred.
//! Each terminal event produces exactly one `OperationFinished`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::models::OperationKind;
use crate::core::progress::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
    Cancelled,
    TimedOut,
}

/// Why an operation did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A local file or buffer could not be opened, allocated or flushed.
    ResourceOpenFailure,
    /// The board reported a protocol or communication failure.
    HardwareError,
    Cancelled,
    TimedOut,
    /// The image is larger than the selected SIMM capacity.
    CapacityMismatch,
    VerificationMismatch,
    /// The board went away mid-operation.
    ConnectionLost,
}

impl FailureKind {
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Cancelled => Outcome::Cancelled,
            Self::TimedOut => Outcome::TimedOut,
            _ => Outcome::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationReport {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub title: String,
    pub message: String,
    /// Operation-specific payload: test report, chip identities, mismatch details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl OperationReport {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    StatusMessage { text: String },
    Progress(Progress),
    OperationFinished(OperationReport),
    Connectivity { connected: bool },
}

/// Receiver of [`StatusEvent`]s. No acknowledgment is expected.
pub trait StatusObserver: Send {
    fn notify(&mut self, event: StatusEvent);
}

impl StatusObserver for mpsc::UnboundedSender<StatusEvent> {
    fn notify(&mut self, event: StatusEvent) {
        // A presentation layer that went away is not the orchestrator's problem.
        let _ = self.send(event);
    }
}
