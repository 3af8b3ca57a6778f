pub mod error;
pub mod hardware;
pub mod models;
pub mod observer;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod resources;
pub mod verifier;

pub use error::OrchestratorError;
pub use hardware::{ProgrammerAdapter, ProgrammerEvent};
pub use models::{ChipIdentity, OperationKind, OperationMode, SimmCapacity};
pub use observer::{FailureKind, OperationReport, Outcome, StatusEvent, StatusObserver};
pub use orchestrator::{Orchestrator, OrchestratorHandle, Request};
pub use progress::{Progress, ProgressTracker};
pub use resources::{ResourceManager, StreamLease};
pub use verifier::{VerifyResult, compare_image, verify_readback};
