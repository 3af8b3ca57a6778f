use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SimulatorSettings;
use crate::core::hardware::{
    ElectricalTestStatus, FirmwareFlashStatus, IdentificationStatus, ProgrammerAdapter,
    ProgrammerEvent, ReadStatus, WriteStatus,
};
use crate::core::models::{CHIP_COUNT, ChipIdentity, SimmCapacity};
use crate::core::resources::StreamLease;

/// Failure the simulated board produces during its next operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Error,
    /// Only meaningful for writes; other operations report a plain error.
    EraseFailed,
    TimedOut,
    Cancelled,
    /// The board vanishes halfway through the operation.
    Disconnect,
}

enum SimulatedCommand {
    PlugIn,
    Unplug,
}

/// Display name of an electrical test pin location code.
///
/// Codes 0-20 are address lines, 21-52 data lines, then the control
/// strobes and power rails.
pub fn pin_name(code: u8) -> String {
    match code {
        0..=20 => format!("A{}", code),
        21..=52 => format!("D{}", code - 21),
        53 => "CS".to_string(),
        54 => "OE".to_string(),
        55 => "WE".to_string(),
        56 => "GND".to_string(),
        57 => "+5V".to_string(),
        _ => format!("?{}", code),
    }
}

struct BoardState {
    connected: bool,
    busy: bool,
    /// Cancelled when the board is unplugged; each connection gets a new one.
    session: CancellationToken,
    capacity: SimmCapacity,
    memory: Vec<u8>,
    chips: [ChipIdentity; CHIP_COUNT],
    shorts: Vec<(u8, u8)>,
    next_failure: Option<InjectedFailure>,
    /// Offsets flipped after the next successful write.
    corruptions: Vec<usize>,
    firmware: Option<PathBuf>,
}

struct Shared {
    state: Mutex<BoardState>,
    events: Mutex<Option<mpsc::Sender<ProgrammerEvent>>>,
    shutdown: CancellationToken,
    step_delay: Duration,
    chunk_size: usize,
}

/// The board itself. Cloned into every task that drives it.
#[derive(Clone)]
struct Board {
    shared: Arc<Shared>,
}

impl Board {
    fn state(&self) -> MutexGuard<'_, BoardState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn emit(&self, event: ProgrammerEvent) {
        let sender = self
            .shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(tx) = sender {
            let _ = tx.send(event).await;
        }
    }

    /// Wait one protocol step. False if the connection went away meanwhile.
    async fn step(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.shared.step_delay) => true,
        }
    }

    async fn connect(&self) {
        {
            let mut state = self.state();
            if state.connected {
                return;
            }
            state.connected = true;
            state.session = self.shared.shutdown.child_token();
        }
        info!("(Simulator) Programmer board plugged in");
        self.emit(ProgrammerEvent::BoardConnected).await;
    }

    async fn disconnect(&self) {
        let was_busy = {
            let mut state = self.state();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.session.cancel();
            std::mem::replace(&mut state.busy, false)
        };
        info!(was_busy, "(Simulator) Programmer board unplugged");
        self.emit(if was_busy {
            ProgrammerEvent::BoardDisconnectedDuringOperation
        } else {
            ProgrammerEvent::BoardDisconnected
        })
        .await;
    }

    /// Claim the board for an operation.
    fn begin(&self) -> Option<(CancellationToken, Option<InjectedFailure>)> {
        let mut state = self.state();
        if !state.connected || state.busy {
            return None;
        }
        state.busy = true;
        Some((state.session.child_token(), state.next_failure.take()))
    }

    /// Release the board, then report the terminal event. Nothing is reported
    /// if the connection was lost in the meantime.
    async fn finish(&self, token: &CancellationToken, event: ProgrammerEvent) {
        {
            let mut state = self.state();
            if token.is_cancelled() {
                return;
            }
            state.busy = false;
        }
        self.emit(event).await;
    }

    /// Apply an injected failure mid-operation. Returns true if the operation ended.
    async fn fail(
        &self,
        token: &CancellationToken,
        failure: Option<InjectedFailure>,
        terminal: impl FnOnce(InjectedFailure) -> ProgrammerEvent,
    ) -> bool {
        match failure {
            None => false,
            Some(InjectedFailure::Disconnect) => {
                self.disconnect().await;
                true
            }
            Some(failure) => {
                debug!(?failure, "(Simulator) Injecting failure");
                self.finish(token, terminal(failure)).await;
                true
            }
        }
    }

    async fn run_write(self, source: StreamLease) {
        let Some((token, failure)) = self.begin() else {
            self.emit(ProgrammerEvent::Write(WriteStatus::Error)).await;
            return;
        };
        let write_failure = |f: InjectedFailure| {
            ProgrammerEvent::Write(match f {
                InjectedFailure::EraseFailed => WriteStatus::EraseFailed,
                InjectedFailure::TimedOut => WriteStatus::TimedOut,
                InjectedFailure::Cancelled => WriteStatus::Cancelled,
                _ => WriteStatus::Error,
            })
        };

        let capacity = self.state().capacity;
        if source.len() > u64::from(capacity.bytes()) {
            self.finish(&token, ProgrammerEvent::Write(WriteStatus::FileTooBig))
                .await;
            return;
        }

        self.emit(ProgrammerEvent::Write(WriteStatus::Erasing)).await;
        if !self.step(&token).await {
            return;
        }
        if failure == Some(InjectedFailure::EraseFailed) {
            self.fail(&token, failure, write_failure).await;
            return;
        }
        self.state().memory.fill(0xFF);
        self.emit(ProgrammerEvent::Write(WriteStatus::EraseComplete))
            .await;

        let total = source.len() as u32;
        self.emit(ProgrammerEvent::WriteTotalLength(total)).await;

        let mut buf = vec![0u8; self.shared.chunk_size.max(1)];
        let mut offset = 0usize;
        let mut failure = failure;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "(Simulator) Source stream failed");
                    self.finish(&token, ProgrammerEvent::Write(WriteStatus::Error))
                        .await;
                    return;
                }
            };
            {
                let mut state = self.state();
                let end = (offset + n).min(state.memory.len());
                if offset < end {
                    state.memory[offset..end].copy_from_slice(&buf[..end - offset]);
                }
            }
            offset += n;
            self.emit(ProgrammerEvent::WriteCompletionLength(offset as u32))
                .await;

            if self.fail(&token, failure.take(), write_failure).await {
                return;
            }
            if !self.step(&token).await {
                return;
            }
        }
        if self.fail(&token, failure, write_failure).await {
            return;
        }

        {
            let mut state = self.state();
            let corruptions = std::mem::take(&mut state.corruptions);
            for at in corruptions {
                if let Some(byte) = state.memory.get_mut(at) {
                    *byte ^= 0xFF;
                }
            }
        }

        self.finish(&token, ProgrammerEvent::Write(WriteStatus::Complete))
            .await;
    }

    async fn run_read(self, destination: StreamLease) {
        let Some((token, failure)) = self.begin() else {
            self.emit(ProgrammerEvent::Read(ReadStatus::Error)).await;
            return;
        };
        let read_failure = |f: InjectedFailure| {
            ProgrammerEvent::Read(match f {
                InjectedFailure::TimedOut => ReadStatus::TimedOut,
                InjectedFailure::Cancelled => ReadStatus::Cancelled,
                _ => ReadStatus::Error,
            })
        };

        self.emit(ProgrammerEvent::Read(ReadStatus::Starting)).await;
        let total = self.state().memory.len();
        self.emit(ProgrammerEvent::ReadTotalLength(total as u32))
            .await;

        let chunk_size = self.shared.chunk_size.max(1);
        let mut failure = failure;
        let mut offset = 0usize;
        while offset < total {
            let end = (offset + chunk_size).min(total);
            let chunk = self.state().memory[offset..end].to_vec();
            if let Err(e) = destination.write_all(&chunk) {
                warn!(error = %e, "(Simulator) Destination stream failed");
                self.finish(&token, ProgrammerEvent::Read(ReadStatus::Error))
                    .await;
                return;
            }
            offset = end;
            self.emit(ProgrammerEvent::ReadCompletionLength(offset as u32))
                .await;

            if self.fail(&token, failure.take(), read_failure).await {
                return;
            }
            if !self.step(&token).await {
                return;
            }
        }

        self.finish(&token, ProgrammerEvent::Read(ReadStatus::Complete))
            .await;
    }

    async fn run_electrical_test(self) {
        let Some((token, failure)) = self.begin() else {
            self.emit(ProgrammerEvent::ElectricalTest(
                ElectricalTestStatus::CouldNotStart,
            ))
            .await;
            return;
        };

        self.emit(ProgrammerEvent::ElectricalTest(ElectricalTestStatus::Started))
            .await;
        if !self.step(&token).await {
            return;
        }
        let test_failure = |f: InjectedFailure| {
            ProgrammerEvent::ElectricalTest(match f {
                InjectedFailure::TimedOut => ElectricalTestStatus::TimedOut,
                _ => ElectricalTestStatus::CouldNotStart,
            })
        };
        if self.fail(&token, failure, test_failure).await {
            return;
        }

        let shorts = self.state().shorts.clone();
        for &(a, b) in &shorts {
            self.emit(ProgrammerEvent::ElectricalTestShort(a, b)).await;
        }

        let status = if shorts.is_empty() {
            ElectricalTestStatus::Passed
        } else {
            ElectricalTestStatus::Failed
        };
        self.finish(&token, ProgrammerEvent::ElectricalTest(status))
            .await;
    }

    async fn run_identify(self) {
        let Some((token, failure)) = self.begin() else {
            self.emit(ProgrammerEvent::Identification(
                IdentificationStatus::Error,
            ))
            .await;
            return;
        };

        self.emit(ProgrammerEvent::Identification(
            IdentificationStatus::Starting,
        ))
        .await;
        if !self.step(&token).await {
            return;
        }
        let identify_failure = |f: InjectedFailure| {
            ProgrammerEvent::Identification(match f {
                InjectedFailure::TimedOut => IdentificationStatus::TimedOut,
                _ => IdentificationStatus::Error,
            })
        };
        if self.fail(&token, failure, identify_failure).await {
            return;
        }

        self.finish(
            &token,
            ProgrammerEvent::Identification(IdentificationStatus::Complete),
        )
        .await;
    }

    async fn run_firmware_flash(self, image: PathBuf) {
        let Some((token, failure)) = self.begin() else {
            self.emit(ProgrammerEvent::FirmwareFlash(FirmwareFlashStatus::Error))
                .await;
            return;
        };

        let firmware = match tokio::fs::read(&image).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %image.display(), error = %e, "(Simulator) Cannot read firmware");
                self.finish(
                    &token,
                    ProgrammerEvent::FirmwareFlash(FirmwareFlashStatus::Error),
                )
                .await;
                return;
            }
        };

        self.emit(ProgrammerEvent::FirmwareFlash(FirmwareFlashStatus::Starting))
            .await;
        self.emit(ProgrammerEvent::FirmwareFlashTotalLength(
            firmware.len() as u32
        ))
        .await;

        let flash_failure = |f: InjectedFailure| {
            ProgrammerEvent::FirmwareFlash(match f {
                InjectedFailure::TimedOut => FirmwareFlashStatus::TimedOut,
                InjectedFailure::Cancelled => FirmwareFlashStatus::Cancelled,
                _ => FirmwareFlashStatus::Error,
            })
        };
        let mut failure = failure;
        let mut sent = 0usize;
        for chunk in firmware.chunks(self.shared.chunk_size.max(1)) {
            sent += chunk.len();
            self.emit(ProgrammerEvent::FirmwareFlashCompletionLength(
                sent as u32,
            ))
            .await;
            if self.fail(&token, failure.take(), flash_failure).await {
                return;
            }
            if !self.step(&token).await {
                return;
            }
        }
        if self.fail(&token, failure, flash_failure).await {
            return;
        }

        self.state().firmware = Some(image);
        self.finish(
            &token,
            ProgrammerEvent::FirmwareFlash(FirmwareFlashStatus::Complete),
        )
        .await;
    }
}

/// Controller for a [`SimulatedProgrammer`], used by tests and the CLI to
/// play the part of the person at the bench.
#[derive(Clone)]
pub struct Simulator {
    tx: mpsc::UnboundedSender<SimulatedCommand>,
    board: Board,
}

impl Simulator {
    pub fn plug_in(&self) {
        let _ = self.tx.send(SimulatedCommand::PlugIn);
    }

    pub fn unplug(&self) {
        let _ = self.tx.send(SimulatedCommand::Unplug);
    }

    /// Make the next operation fail in the given way.
    pub fn fail_next(&self, failure: InjectedFailure) {
        self.board.state().next_failure = Some(failure);
    }

    pub fn set_shorts(&self, shorts: &[(u8, u8)]) {
        self.board.state().shorts = shorts.to_vec();
    }

    pub fn set_chip_identities(&self, chips: [ChipIdentity; CHIP_COUNT]) {
        self.board.state().chips = chips;
    }

    /// Flip the byte at `offset` once the next write completes.
    pub fn corrupt_byte(&self, offset: usize) {
        self.board.state().corruptions.push(offset);
    }

    /// Snapshot of the simulated SIMM contents.
    pub fn memory(&self) -> Vec<u8> {
        self.board.state().memory.clone()
    }

    /// Path of the last firmware image flashed successfully.
    pub fn firmware(&self) -> Option<PathBuf> {
        self.board.state().firmware.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.board.state().busy
    }
}

pub struct SimulatedProgrammer {
    board: Board,
    plugged_in: bool,
    // Taken by the first `start_port_monitoring` call.
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<SimulatedCommand>>>,
}

impl SimulatedProgrammer {
    pub fn new(settings: &SimulatorSettings) -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let capacity = SimmCapacity::default();

        let state = BoardState {
            connected: false,
            busy: false,
            session: shutdown.child_token(),
            capacity,
            memory: vec![0xFF; capacity.bytes() as usize],
            chips: default_chips(),
            shorts: settings
                .shorted_pins
                .iter()
                .map(|&[a, b]| (a, b))
                .collect(),
            next_failure: None,
            corruptions: Vec::new(),
            firmware: None,
        };

        let board = Board {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                events: Mutex::new(None),
                shutdown,
                step_delay: Duration::from_millis(settings.step_delay_ms),
                chunk_size: settings.chunk_size,
            }),
        };

        (
            Self {
                board: board.clone(),
                plugged_in: settings.plugged_in,
                cmd_rx: Mutex::new(Some(rx)),
            },
            Simulator { tx, board },
        )
    }
}

/// Four 128K x 8 flash chips as shipped on a typical ROM SIMM.
fn default_chips() -> [ChipIdentity; CHIP_COUNT] {
    [ChipIdentity::new(0xBF, 0xB5); CHIP_COUNT]
}

impl ProgrammerAdapter for SimulatedProgrammer {
    fn start_port_monitoring(&self, event_sender: mpsc::Sender<ProgrammerEvent>) {
        *self
            .board
            .shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(event_sender);

        let Some(mut rx) = self
            .cmd_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!("(Simulator) Port monitoring already started");
            return;
        };

        debug!("(Simulator) Listening for controller commands");

        let board = self.board.clone();
        let plugged_in = self.plugged_in;
        tokio::spawn(async move {
            if plugged_in {
                board.connect().await;
            }
            let shutdown = board.shared.shutdown.clone();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    cmd = rx.recv() => match cmd {
                        Some(SimulatedCommand::PlugIn) => board.connect().await,
                        Some(SimulatedCommand::Unplug) => board.disconnect().await,
                        None => break,
                    },
                }
            }
            debug!("(Simulator) Controller bridge stopped");
        });
    }

    fn stop(&self) {
        self.board.shared.shutdown.cancel();
    }

    fn write_to_simm(&self, source: StreamLease) {
        debug!(kind = ?source.kind(), bytes = source.len(), "(Simulator) Write requested");
        tokio::spawn(self.board.clone().run_write(source));
    }

    fn read_simm(&self, destination: StreamLease) {
        debug!(kind = ?destination.kind(), "(Simulator) Read requested");
        tokio::spawn(self.board.clone().run_read(destination));
    }

    fn run_electrical_test(&self) {
        tokio::spawn(self.board.clone().run_electrical_test());
    }

    fn identify_simm_chips(&self) {
        tokio::spawn(self.board.clone().run_identify());
    }

    fn chip_identity(&self, chip_index: usize) -> ChipIdentity {
        self.board
            .state()
            .chips
            .get(chip_index)
            .copied()
            .unwrap_or_default()
    }

    fn flash_firmware(&self, image_path: &Path) {
        tokio::spawn(
            self.board
                .clone()
                .run_firmware_flash(image_path.to_path_buf()),
        );
    }

    fn set_simm_capacity(&self, capacity: SimmCapacity) {
        let mut state = self.board.state();
        state.capacity = capacity;
        state.memory.resize(capacity.bytes() as usize, 0xFF);
    }

    fn simm_capacity(&self) -> SimmCapacity {
        self.board.state().capacity
    }

    fn electrical_test_pin_name(&self, code: u8) -> String {
        pin_name(code)
    }
}
