use std::path::Path;

use tokio::sync::mpsc;

use crate::core::models::{ChipIdentity, OperationMode, SimmCapacity};
use crate::core::resources::StreamLease;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Erasing,
    EraseComplete,
    Complete,
    Error,
    Cancelled,
    EraseFailed,
    TimedOut,
    FileTooBig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Starting,
    Complete,
    Error,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectricalTestStatus {
    Started,
    Passed,
    Failed,
    TimedOut,
    CouldNotStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentificationStatus {
    Starting,
    Complete,
    Error,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareFlashStatus {
    Starting,
    Complete,
    Error,
    Cancelled,
    TimedOut,
}

/// Notifications emitted by the programmer board, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgrammerEvent {
    Write(WriteStatus),
    WriteTotalLength(u32),
    WriteCompletionLength(u32),
    Read(ReadStatus),
    ReadTotalLength(u32),
    ReadCompletionLength(u32),
    ElectricalTest(ElectricalTestStatus),
    /// Two pin location codes found shorted together.
    ElectricalTestShort(u8, u8),
    Identification(IdentificationStatus),
    FirmwareFlash(FirmwareFlashStatus),
    FirmwareFlashTotalLength(u32),
    FirmwareFlashCompletionLength(u32),
    BoardConnected,
    BoardDisconnected,
    BoardDisconnectedDuringOperation,
}

impl ProgrammerEvent {
    /// Whether this notification belongs to an operation running in `mode`.
    ///
    /// Connectivity events belong to every mode.
    pub fn applies_to(&self, mode: OperationMode) -> bool {
        match self {
            Self::Write(_) | Self::WriteTotalLength(_) | Self::WriteCompletionLength(_) => {
                mode == OperationMode::Writing
            }
            Self::Read(_) | Self::ReadTotalLength(_) | Self::ReadCompletionLength(_) => {
                matches!(mode, OperationMode::Reading | OperationMode::Verifying)
            }
            Self::ElectricalTest(_) | Self::ElectricalTestShort(..) => {
                mode == OperationMode::ElectricalTesting
            }
            Self::Identification(_) => mode == OperationMode::Identifying,
            Self::FirmwareFlash(_)
            | Self::FirmwareFlashTotalLength(_)
            | Self::FirmwareFlashCompletionLength(_) => mode == OperationMode::FlashingFirmware,
            Self::BoardConnected
            | Self::BoardDisconnected
            | Self::BoardDisconnectedDuringOperation => true,
        }
    }
}

/// Host-side driver for the programmer board.
///
/// Operation methods return immediately; outcomes arrive later as
/// [`ProgrammerEvent`]s on the channel passed to `start_port_monitoring`.
pub trait ProgrammerAdapter: Send + Sync {
    /// Start watching for the board. Connect/disconnect and all operation
    /// notifications are sent to `event_sender` from now on.
    fn start_port_monitoring(&self, event_sender: mpsc::Sender<ProgrammerEvent>);

    /// Stop monitoring and abandon any in-flight operation.
    fn stop(&self);

    fn write_to_simm(&self, source: StreamLease);

    fn read_simm(&self, destination: StreamLease);

    fn run_electrical_test(&self);

    fn identify_simm_chips(&self);

    /// Identity of chip `chip_index` (0..4) from the last identify run.
    fn chip_identity(&self, chip_index: usize) -> ChipIdentity;

    fn flash_firmware(&self, image_path: &Path);

    fn set_simm_capacity(&self, capacity: SimmCapacity);

    fn simm_capacity(&self) -> SimmCapacity;

    /// Display name for an electrical test pin location code.
    fn electrical_test_pin_name(&self, code: u8) -> String;
}
