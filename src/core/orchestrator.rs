//! The operation state machine.
//!
//! [`Orchestrator`] accepts one user request at a time, binds the streams the
//! operation needs, hands them to the [`ProgrammerAdapter`], and turns the
//! adapter's [`ProgrammerEvent`]s into state transitions and [`StatusEvent`]s.
//! A successful write with verification chains a read-back into a
//! capacity-sized buffer followed by a byte-exact comparison.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::core::error::OrchestratorError;
use crate::core::hardware::{
    ElectricalTestStatus, FirmwareFlashStatus, IdentificationStatus, ProgrammerAdapter,
    ProgrammerEvent, ReadStatus, WriteStatus,
};
use crate::core::models::{CHIP_COUNT, OperationMode, SimmCapacity};
use crate::core::observer::{FailureKind, OperationReport, Outcome, StatusEvent, StatusObserver};
use crate::core::progress::ProgressTracker;
use crate::core::report::{ElectricalTestReport, IDENTIFY_HEADING, format_identities};
use crate::core::resources::ResourceManager;
use crate::core::verifier;
use crate::logging::LogThrottle;

const EVENT_QUEUE_DEPTH: usize = 64;
const COMMAND_QUEUE_DEPTH: usize = 8;

const COMMUNICATING: &str = "Communicating with programmer (this may take a few seconds)...";
const CONNECTION_LOST: &str =
    "Lost contact with the programmer board. Unplug it, plug it back in, and try again.";

/// A user-initiated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Write { image: PathBuf, verify: bool },
    Read { output: PathBuf },
    ElectricalTest,
    Identify,
    FlashFirmware { image: PathBuf },
}

struct Command {
    request: Request,
    reply: oneshot::Sender<Result<(), OrchestratorError>>,
}

/// Cloneable handle for submitting requests to a spawned orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
}

impl OrchestratorHandle {
    /// Submit a request and wait until the orchestrator accepted or rejected it.
    /// The operation's outcome arrives later on the status observer.
    pub async fn submit(&self, request: Request) -> Result<(), OrchestratorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command { request, reply })
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        response.await.map_err(|_| OrchestratorError::Stopped)?
    }
}

struct ActiveOperation {
    id: Uuid,
    mode: OperationMode,
    started: Instant,
    /// Image path of a write, kept so verification can re-open it.
    image: Option<PathBuf>,
    verify: bool,
}

impl ActiveOperation {
    fn new(mode: OperationMode) -> Self {
        Self {
            id: Uuid::now_v7(),
            mode,
            started: Instant::now(),
            image: None,
            verify: false,
        }
    }
}

/// How an operation ended, before it is stamped into an [`OperationReport`].
struct Conclusion {
    outcome: Outcome,
    failure: Option<FailureKind>,
    title: &'static str,
    message: String,
    detail: Option<String>,
}

impl Conclusion {
    fn success(title: &'static str, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Success,
            failure: None,
            title,
            message: message.into(),
            detail: None,
        }
    }

    fn failure(kind: FailureKind, title: &'static str, message: impl Into<String>) -> Self {
        Self {
            outcome: kind.outcome(),
            failure: Some(kind),
            title,
            message: message.into(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub struct Orchestrator {
    adapter: Box<dyn ProgrammerAdapter>,
    observer: Box<dyn StatusObserver>,
    resources: ResourceManager,
    progress: ProgressTracker,
    electrical_report: ElectricalTestReport,
    active: Option<ActiveOperation>,
    connected: bool,
    progress_log: LogThrottle,
}

impl Orchestrator {
    pub fn new(adapter: Box<dyn ProgrammerAdapter>, observer: Box<dyn StatusObserver>) -> Self {
        Self {
            adapter,
            observer,
            resources: ResourceManager::new(),
            progress: ProgressTracker::new(),
            electrical_report: ElectricalTestReport::new(),
            active: None,
            connected: false,
            progress_log: LogThrottle::new(Duration::from_millis(500)),
        }
    }

    pub fn mode(&self) -> OperationMode {
        self.active
            .as_ref()
            .map(|op| op.mode)
            .unwrap_or(OperationMode::Idle)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Number of streams or buffers currently held for the active operation.
    pub fn live_resources(&self) -> usize {
        self.resources.live_count()
    }

    pub fn simm_capacity(&self) -> SimmCapacity {
        self.adapter.simm_capacity()
    }

    /// Select the SIMM capacity used by every later operation.
    ///
    /// Callers are expected to disable capacity selection while an operation
    /// runs; a change that slips through anyway is refused.
    pub fn set_simm_capacity(&mut self, capacity: SimmCapacity) -> Result<(), OrchestratorError> {
        let active = self.mode();
        if !active.is_idle() {
            return Err(OrchestratorError::CapacityChangeWhileBusy { active });
        }
        info!(capacity = %capacity, bytes = capacity.bytes(), "SIMM capacity selected");
        self.adapter.set_simm_capacity(capacity);
        Ok(())
    }

    /// Start the operation described by `request`.
    pub fn submit(&mut self, request: Request) -> Result<(), OrchestratorError> {
        match request {
            Request::Write { image, verify } => self.begin_write(&image, verify),
            Request::Read { output } => self.begin_read(&output),
            Request::ElectricalTest => self.begin_electrical_test(),
            Request::Identify => self.begin_identify(),
            Request::FlashFirmware { image } => self.begin_firmware_flash(&image),
        }
    }

    /// Write the image at `image` to the SIMM, optionally verifying it afterwards.
    ///
    /// If the image cannot be opened the operation finishes immediately with a
    /// `ResourceOpenFailure` and the board is never contacted.
    pub fn begin_write(&mut self, image: &Path, verify: bool) -> Result<(), OrchestratorError> {
        self.ensure_idle()?;

        let mut op = ActiveOperation::new(OperationMode::Writing);
        op.image = Some(image.to_path_buf());
        op.verify = verify;
        info!(
            operation_id = %op.id,
            image = %image.display(),
            verify,
            "Writing to SIMM"
        );
        self.active = Some(op);

        match self.resources.open_source(image) {
            Ok(source) => {
                self.announce_communicating();
                self.adapter.write_to_simm(source);
            }
            Err(e) => {
                warn!(error = %e, "Could not open image for writing");
                self.finish(
                    Conclusion::failure(
                        FailureKind::ResourceOpenFailure,
                        "Write error",
                        "An error occurred writing to the SIMM.",
                    )
                    .with_detail(e.to_string()),
                );
            }
        }
        Ok(())
    }

    /// Read the whole SIMM into a new file at `output`.
    pub fn begin_read(&mut self, output: &Path) -> Result<(), OrchestratorError> {
        self.ensure_idle()?;

        let op = ActiveOperation::new(OperationMode::Reading);
        info!(operation_id = %op.id, output = %output.display(), "Reading from SIMM");
        self.active = Some(op);

        match self.resources.open_destination(output) {
            Ok(destination) => {
                self.announce_communicating();
                self.adapter.read_simm(destination);
            }
            Err(e) => {
                warn!(error = %e, "Could not open read destination");
                self.finish(
                    Conclusion::failure(
                        FailureKind::ResourceOpenFailure,
                        "Read error",
                        "An error occurred reading from the SIMM.",
                    )
                    .with_detail(e.to_string()),
                );
            }
        }
        Ok(())
    }

    pub fn begin_electrical_test(&mut self) -> Result<(), OrchestratorError> {
        self.ensure_idle()?;

        self.electrical_report.reset();
        let op = ActiveOperation::new(OperationMode::ElectricalTesting);
        info!(operation_id = %op.id, "Running electrical test");
        self.active = Some(op);

        self.announce_communicating();
        self.adapter.run_electrical_test();
        Ok(())
    }

    pub fn begin_identify(&mut self) -> Result<(), OrchestratorError> {
        self.ensure_idle()?;

        let op = ActiveOperation::new(OperationMode::Identifying);
        info!(operation_id = %op.id, "Identifying chips");
        self.active = Some(op);

        self.announce_communicating();
        self.adapter.identify_simm_chips();
        Ok(())
    }

    /// Flash new programmer firmware. Only available while the board is connected.
    pub fn begin_firmware_flash(&mut self, image: &Path) -> Result<(), OrchestratorError> {
        self.ensure_idle()?;
        if !self.connected {
            return Err(OrchestratorError::NotConnected);
        }

        let op = ActiveOperation::new(OperationMode::FlashingFirmware);
        info!(operation_id = %op.id, image = %image.display(), "Updating firmware");
        self.active = Some(op);

        self.announce_communicating();
        self.adapter.flash_firmware(image);
        Ok(())
    }

    /// Apply one board notification.
    pub fn handle_event(&mut self, event: ProgrammerEvent) {
        let mode = self.mode();
        if !event.applies_to(mode) {
            warn!(?event, mode = %mode, "Ignoring notification for an operation that is not active");
            return;
        }

        match event {
            ProgrammerEvent::BoardConnected => self.on_board_connected(),
            ProgrammerEvent::BoardDisconnected
            | ProgrammerEvent::BoardDisconnectedDuringOperation => self.on_board_disconnected(),

            ProgrammerEvent::Write(status) => self.on_write_status(status),
            ProgrammerEvent::Read(status) => self.on_read_status(status),
            ProgrammerEvent::ElectricalTest(status) => self.on_electrical_test_status(status),
            ProgrammerEvent::ElectricalTestShort(a, b) => self.on_electrical_test_short(a, b),
            ProgrammerEvent::Identification(status) => self.on_identification_status(status),
            ProgrammerEvent::FirmwareFlash(status) => self.on_firmware_flash_status(status),

            ProgrammerEvent::WriteTotalLength(total)
            | ProgrammerEvent::ReadTotalLength(total)
            | ProgrammerEvent::FirmwareFlashTotalLength(total) => {
                if let Some(progress) = self.progress.set_total(total) {
                    debug!(total, "Progress total set");
                    self.observer.notify(StatusEvent::Progress(progress));
                }
            }
            ProgrammerEvent::WriteCompletionLength(done)
            | ProgrammerEvent::ReadCompletionLength(done)
            | ProgrammerEvent::FirmwareFlashCompletionLength(done) => {
                if let Some(progress) = self.progress.set_completion(done) {
                    if self.progress_log.should_log() {
                        debug!(
                            current = progress.current,
                            total = progress.total,
                            "Operation progress"
                        );
                    }
                    self.observer.notify(StatusEvent::Progress(progress));
                }
            }
        }
    }

    /// Drive the orchestrator from adapter events and submitted requests until
    /// every [`OrchestratorHandle`] is dropped.
    pub fn spawn(self) -> (OrchestratorHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let task = tokio::spawn(self.run(commands_rx));
        (
            OrchestratorHandle {
                commands: commands_tx,
            },
            task,
        )
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (events_tx, mut events) = mpsc::channel(EVENT_QUEUE_DEPTH);
        self.adapter.start_port_monitoring(events_tx);

        let span = info_span!("orchestrator");
        async {
            info!("Orchestrator started");
            loop {
                tokio::select! {
                    biased;

                    Some(event) = events.recv() => {
                        let mut batch = vec![event];
                        while let Ok(next) = events.try_recv() {
                            batch.push(next);
                        }
                        for event in disconnect_first(batch) {
                            self.handle_event(event);
                        }
                    }
                    command = commands.recv() => match command {
                        Some(Command { request, reply }) => {
                            let result = self.submit(request);
                            if let Err(e) = &result {
                                warn!(error = %e, "Request rejected");
                            }
                            let _ = reply.send(result);
                        }
                        None => break,
                    },
                }
            }
            info!("Orchestrator stopping");
        }
        .instrument(span)
        .await;

        self.adapter.stop();
        let released = self.resources.release_all();
        if released > 0 {
            debug!(released, "Released resources on shutdown");
        }
    }

    fn ensure_idle(&self) -> Result<(), OrchestratorError> {
        let active = self.mode();
        if active.is_idle() {
            Ok(())
        } else {
            Err(OrchestratorError::Busy { active })
        }
    }

    fn announce_communicating(&mut self) {
        self.progress_log.reset();
        let progress = self.progress.reset();
        self.observer.notify(StatusEvent::Progress(progress));
        self.status(COMMUNICATING);
    }

    fn status(&mut self, text: &str) {
        debug!(status = text, "Status");
        self.observer.notify(StatusEvent::StatusMessage {
            text: text.to_string(),
        });
    }

    /// Terminal transition: release everything, go idle, report once.
    fn finish(&mut self, conclusion: Conclusion) {
        let released = self.resources.release_all();
        let Some(op) = self.active.take() else {
            warn!(title = conclusion.title, "Operation finished while idle");
            return;
        };
        let Some(kind) = op.mode.kind() else {
            return;
        };

        let elapsed_ms = op.started.elapsed().as_millis() as u64;
        let progress = self.progress.get();
        info!(
            operation_id = %op.id,
            kind = ?kind,
            outcome = ?conclusion.outcome,
            failure = ?conclusion.failure,
            released,
            bytes_done = progress.current,
            elapsed_ms,
            "{}",
            conclusion.title
        );

        self.observer
            .notify(StatusEvent::OperationFinished(OperationReport {
                operation_id: op.id,
                kind,
                outcome: conclusion.outcome,
                failure: conclusion.failure,
                title: conclusion.title.to_string(),
                message: conclusion.message,
                detail: conclusion.detail,
                finished_at: Utc::now(),
                elapsed_ms,
            }));
    }

    fn on_board_connected(&mut self) {
        info!("Programmer board connected");
        self.connected = true;
        self.observer
            .notify(StatusEvent::Connectivity { connected: true });
    }

    fn on_board_disconnected(&mut self) {
        let was_busy = !self.mode().is_idle();
        self.connected = false;
        self.observer
            .notify(StatusEvent::Connectivity { connected: false });

        if was_busy {
            warn!(mode = %self.mode(), "Programmer board disconnected during operation");
            self.finish(Conclusion::failure(
                FailureKind::ConnectionLost,
                "Programmer lost connection",
                CONNECTION_LOST,
            ));
        } else {
            info!("Programmer board disconnected");
        }
    }

    fn on_write_status(&mut self, status: WriteStatus) {
        match status {
            WriteStatus::Erasing => self.status("Erasing SIMM (this may take a few seconds)..."),
            WriteStatus::EraseComplete => self.status("Writing SIMM..."),
            WriteStatus::Complete => {
                self.resources.release_source();
                let verify = self.active.as_ref().is_some_and(|op| op.verify);
                if verify {
                    self.start_verification();
                } else {
                    self.finish(Conclusion::success(
                        "Write complete",
                        "The write operation finished.",
                    ));
                }
            }
            WriteStatus::Error => self.finish(Conclusion::failure(
                FailureKind::HardwareError,
                "Write error",
                "An error occurred writing to the SIMM.",
            )),
            WriteStatus::Cancelled => self.finish(Conclusion::failure(
                FailureKind::Cancelled,
                "Write cancelled",
                "The write operation was cancelled.",
            )),
            WriteStatus::EraseFailed => self.finish(Conclusion::failure(
                FailureKind::HardwareError,
                "Write error",
                "An error occurred erasing the SIMM.",
            )),
            WriteStatus::TimedOut => self.finish(Conclusion::failure(
                FailureKind::TimedOut,
                "Write timed out",
                "The write operation timed out.",
            )),
            WriteStatus::FileTooBig => self.finish(Conclusion::failure(
                FailureKind::CapacityMismatch,
                "File too big",
                "The file you chose to write to the SIMM is too big according to the chip size you have selected.",
            )),
        }
    }

    /// The write succeeded; read the SIMM back into memory for comparison.
    fn start_verification(&mut self) {
        let capacity = self.adapter.simm_capacity();
        match self.resources.allocate_verify_buffer(capacity) {
            Ok(buffer) => {
                if let Some(op) = self.active.as_mut() {
                    op.mode = OperationMode::Verifying;
                    info!(operation_id = %op.id, bytes = capacity.bytes(), "Reading from SIMM for verification");
                }
                self.announce_communicating();
                self.adapter.read_simm(buffer);
            }
            Err(e) => {
                warn!(error = %e, "Could not set up verification");
                self.finish(
                    Conclusion::failure(
                        FailureKind::ResourceOpenFailure,
                        "Verify error",
                        "An error occurred reading the SIMM contents for verification.",
                    )
                    .with_detail(e.to_string()),
                );
            }
        }
    }

    fn on_read_status(&mut self, status: ReadStatus) {
        let verifying = self.mode() == OperationMode::Verifying;
        match status {
            ReadStatus::Starting if verifying => self.status("Verifying SIMM contents..."),
            ReadStatus::Starting => self.status("Reading SIMM contents..."),
            ReadStatus::Complete if verifying => self.complete_verification(),
            ReadStatus::Complete => match self.resources.release_destination() {
                Ok(_) => self.finish(Conclusion::success(
                    "Read complete",
                    "The read operation finished.",
                )),
                Err(e) => self.finish(
                    Conclusion::failure(
                        FailureKind::ResourceOpenFailure,
                        "Read error",
                        "An error occurred saving the SIMM contents.",
                    )
                    .with_detail(e.to_string()),
                ),
            },
            ReadStatus::Error if verifying => self.finish(Conclusion::failure(
                FailureKind::HardwareError,
                "Verify error",
                "An error occurred reading the SIMM contents for verification.",
            )),
            ReadStatus::Error => self.finish(Conclusion::failure(
                FailureKind::HardwareError,
                "Read error",
                "An error occurred reading from the SIMM.",
            )),
            ReadStatus::Cancelled if verifying => self.finish(Conclusion::failure(
                FailureKind::Cancelled,
                "Verify cancelled",
                "The verify operation was cancelled.",
            )),
            ReadStatus::Cancelled => self.finish(Conclusion::failure(
                FailureKind::Cancelled,
                "Read cancelled",
                "The read operation was cancelled.",
            )),
            ReadStatus::TimedOut if verifying => self.finish(Conclusion::failure(
                FailureKind::TimedOut,
                "Verify timed out",
                "The verify operation timed out.",
            )),
            ReadStatus::TimedOut => self.finish(Conclusion::failure(
                FailureKind::TimedOut,
                "Read timed out",
                "The read operation timed out.",
            )),
        }
    }

    fn complete_verification(&mut self) {
        let readback = self.resources.take_verify_buffer().unwrap_or_default();
        let image = self.active.as_ref().and_then(|op| op.image.clone());

        let result = match image {
            Some(path) => verifier::verify_readback(&path, &readback).map_err(|e| e.to_string()),
            None => Err("no image recorded for this write".to_string()),
        };

        let conclusion = match result {
            Ok(result) if result.is_verified() => Conclusion::success(
                "Write complete",
                "The write operation finished, and the contents were verified successfully.",
            ),
            Ok(mismatch) => Conclusion::failure(
                FailureKind::VerificationMismatch,
                "Verify error",
                "The data read back from the SIMM did not match the data written to it.",
            )
            .with_detail(mismatch.describe()),
            Err(e) => Conclusion::failure(
                FailureKind::ResourceOpenFailure,
                "Verify failed",
                "Unable to open file for verification.",
            )
            .with_detail(e),
        };
        self.finish(conclusion);
    }

    fn on_electrical_test_status(&mut self, status: ElectricalTestStatus) {
        match status {
            ElectricalTestStatus::Started => {
                self.status("Running electrical test (this may take a few seconds)...")
            }
            ElectricalTestStatus::Passed => self.finish(Conclusion::success(
                "Test passed",
                "The electrical test passed successfully.",
            )),
            ElectricalTestStatus::Failed => {
                if self.electrical_report.is_empty() {
                    warn!("Electrical test failed without reporting a short");
                } else {
                    info!(shorts = self.electrical_report.len(), "Electrical test found shorts");
                }
                let report = self.electrical_report.text();
                self.finish(
                    Conclusion::failure(
                        FailureKind::HardwareError,
                        "Test failed",
                        "The electrical test failed:",
                    )
                    .with_detail(report),
                );
            }
            ElectricalTestStatus::TimedOut => self.finish(Conclusion::failure(
                FailureKind::TimedOut,
                "Test timed out",
                "The electrical test operation timed out.",
            )),
            ElectricalTestStatus::CouldNotStart => self.finish(Conclusion::failure(
                FailureKind::HardwareError,
                "Communication error",
                "Unable to communicate with programmer board.",
            )),
        }
    }

    fn on_electrical_test_short(&mut self, a: u8, b: u8) {
        let pin_a = self.adapter.electrical_test_pin_name(a);
        let pin_b = self.adapter.electrical_test_pin_name(b);
        debug!(pin_a = %pin_a, pin_b = %pin_b, "Electrical test short");
        self.electrical_report.record_short(&pin_a, &pin_b);
    }

    fn on_identification_status(&mut self, status: IdentificationStatus) {
        match status {
            IdentificationStatus::Starting => self.status("Identifying chips..."),
            IdentificationStatus::Complete => {
                let identities: Vec<_> = (0..CHIP_COUNT)
                    .map(|index| self.adapter.chip_identity(index))
                    .collect();
                self.finish(
                    Conclusion::success("Identification complete", IDENTIFY_HEADING)
                        .with_detail(format_identities(&identities)),
                );
            }
            IdentificationStatus::Error => self.finish(Conclusion::failure(
                FailureKind::HardwareError,
                "Identification error",
                "An error occurred identifying the chips on the SIMM.",
            )),
            IdentificationStatus::TimedOut => self.finish(Conclusion::failure(
                FailureKind::TimedOut,
                "Identification timed out",
                "The identification operation timed out.",
            )),
        }
    }

    fn on_firmware_flash_status(&mut self, status: FirmwareFlashStatus) {
        match status {
            FirmwareFlashStatus::Starting => self.status("Flashing new firmware..."),
            FirmwareFlashStatus::Complete => self.finish(Conclusion::success(
                "Firmware update complete",
                "The firmware update operation finished.",
            )),
            FirmwareFlashStatus::Error => self.finish(Conclusion::failure(
                FailureKind::HardwareError,
                "Firmware update error",
                "An error occurred writing firmware to the device.",
            )),
            FirmwareFlashStatus::Cancelled => self.finish(Conclusion::failure(
                FailureKind::Cancelled,
                "Firmware update cancelled",
                "The firmware update was cancelled.",
            )),
            FirmwareFlashStatus::TimedOut => self.finish(Conclusion::failure(
                FailureKind::TimedOut,
                "Firmware update timed out",
                "The firmware update operation timed out.",
            )),
        }
    }
}

/// Move each mid-operation disconnect ahead of the operation notifications
/// queued before it.
///
/// Anything else queued for the lost operation is then seen while idle and
/// ignored, so a completion racing a disconnect never wins. Connectivity
/// events keep their arrival order, so the last one still decides whether
/// the board is connected.
pub fn disconnect_first(batch: Vec<ProgrammerEvent>) -> Vec<ProgrammerEvent> {
    let mut ordered = Vec::with_capacity(batch.len());
    // Index just past the last connectivity event placed so far.
    let mut anchor = 0;
    for event in batch {
        match event {
            ProgrammerEvent::BoardDisconnectedDuringOperation => {
                ordered.insert(anchor, event);
                anchor += 1;
            }
            ProgrammerEvent::BoardConnected | ProgrammerEvent::BoardDisconnected => {
                ordered.push(event);
                anchor = ordered.len();
            }
            _ => ordered.push(event),
        }
    }
    ordered
}
