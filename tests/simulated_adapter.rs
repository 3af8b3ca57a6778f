use simmctl::adapters::{InjectedFailure, SimulatedProgrammer, Simulator};
use simmctl::config::SimulatorSettings;
use simmctl::core::hardware::{
    ElectricalTestStatus, IdentificationStatus, ProgrammerAdapter, ProgrammerEvent, ReadStatus,
    WriteStatus,
};
use simmctl::core::{ChipIdentity, ResourceManager, SimmCapacity};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn settings() -> SimulatorSettings {
    SimulatorSettings {
        step_delay_ms: 0,
        chunk_size: 4096,
        plugged_in: true,
        shorted_pins: Vec::new(),
    }
}

async fn started(
    settings: SimulatorSettings,
) -> (
    SimulatedProgrammer,
    Simulator,
    mpsc::Receiver<ProgrammerEvent>,
) {
    let plugged_in = settings.plugged_in;
    let (adapter, controller) = SimulatedProgrammer::new(&settings);
    adapter.set_simm_capacity(SimmCapacity::KB_512);
    let (tx, mut rx) = mpsc::channel(256);
    adapter.start_port_monitoring(tx);

    if plugged_in {
        assert_eq!(next(&mut rx).await, ProgrammerEvent::BoardConnected);
    }
    (adapter, controller, rx)
}

async fn next(rx: &mut mpsc::Receiver<ProgrammerEvent>) -> ProgrammerEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timeout waiting for event")
        .expect("channel closed")
}

/// Collect events up to and including the first one matching `last`.
async fn until(
    rx: &mut mpsc::Receiver<ProgrammerEvent>,
    last: impl Fn(&ProgrammerEvent) -> bool,
) -> Vec<ProgrammerEvent> {
    let mut events = Vec::new();
    loop {
        let event = next(rx).await;
        let done = last(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

fn image(len: usize) -> (TempDir, PathBuf) {
    let temp = tempdir().unwrap();
    let path = temp.path().join("rom.bin");
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    (temp, path)
}

#[tokio::test]
async fn test_plug_and_unplug() {
    let mut settings = settings();
    settings.plugged_in = false;
    let (_adapter, controller, mut rx) = started(settings).await;

    controller.plug_in();
    controller.unplug();

    assert_eq!(next(&mut rx).await, ProgrammerEvent::BoardConnected);
    assert_eq!(next(&mut rx).await, ProgrammerEvent::BoardDisconnected);
}

#[tokio::test]
async fn test_write_event_sequence() {
    let (adapter, controller, mut rx) = started(settings()).await;
    let (_temp, path) = image(10_000);

    let mut resources = ResourceManager::new();
    adapter.write_to_simm(resources.open_source(&path).unwrap());

    let events = until(&mut rx, |e| matches!(e, ProgrammerEvent::Write(WriteStatus::Complete))).await;
    assert_eq!(
        events,
        vec![
            ProgrammerEvent::Write(WriteStatus::Erasing),
            ProgrammerEvent::Write(WriteStatus::EraseComplete),
            ProgrammerEvent::WriteTotalLength(10_000),
            ProgrammerEvent::WriteCompletionLength(4096),
            ProgrammerEvent::WriteCompletionLength(8192),
            ProgrammerEvent::WriteCompletionLength(10_000),
            ProgrammerEvent::Write(WriteStatus::Complete),
        ]
    );

    let memory = controller.memory();
    assert_eq!(&memory[..10_000], std::fs::read(&path).unwrap().as_slice());
    assert!(memory[10_000..].iter().all(|&b| b == 0xFF));
    assert!(!controller.is_busy());
}

#[tokio::test]
async fn test_write_rejects_oversized_image() {
    let (adapter, controller, mut rx) = started(settings()).await;
    let (_temp, path) = image(512 * 1024 + 1);

    let mut resources = ResourceManager::new();
    adapter.write_to_simm(resources.open_source(&path).unwrap());

    assert_eq!(
        next(&mut rx).await,
        ProgrammerEvent::Write(WriteStatus::FileTooBig)
    );
    assert!(controller.memory().iter().all(|&b| b == 0xFF));
}

#[tokio::test]
async fn test_injected_erase_failure() {
    let (adapter, controller, mut rx) = started(settings()).await;
    let (_temp, path) = image(100);
    controller.fail_next(InjectedFailure::EraseFailed);

    let mut resources = ResourceManager::new();
    adapter.write_to_simm(resources.open_source(&path).unwrap());

    assert_eq!(
        next(&mut rx).await,
        ProgrammerEvent::Write(WriteStatus::Erasing)
    );
    assert_eq!(
        next(&mut rx).await,
        ProgrammerEvent::Write(WriteStatus::EraseFailed)
    );
}

#[tokio::test]
async fn test_disconnect_mid_write_sends_no_completion() {
    let (adapter, controller, mut rx) = started(settings()).await;
    let (_temp, path) = image(10_000);
    controller.fail_next(InjectedFailure::Disconnect);

    let mut resources = ResourceManager::new();
    adapter.write_to_simm(resources.open_source(&path).unwrap());

    let events = until(&mut rx, |e| {
        *e == ProgrammerEvent::BoardDisconnectedDuringOperation
    })
    .await;
    assert!(
        !events
            .iter()
            .any(|e| *e == ProgrammerEvent::Write(WriteStatus::Complete))
    );

    // The board stays gone until it is plugged back in.
    adapter.identify_simm_chips();
    assert_eq!(
        next(&mut rx).await,
        ProgrammerEvent::Identification(IdentificationStatus::Error)
    );
}

#[tokio::test]
async fn test_read_fills_destination() {
    let (adapter, _controller, mut rx) = started(settings()).await;
    let temp = tempdir().unwrap();
    let output = temp.path().join("dump.bin");

    let mut resources = ResourceManager::new();
    adapter.read_simm(resources.open_destination(&output).unwrap());

    let events = until(&mut rx, |e| matches!(e, ProgrammerEvent::Read(ReadStatus::Complete))).await;
    assert_eq!(events[0], ProgrammerEvent::Read(ReadStatus::Starting));
    assert_eq!(events[1], ProgrammerEvent::ReadTotalLength(512 * 1024));

    resources.release_destination().unwrap();
    let contents = std::fs::read(&output).unwrap();
    assert_eq!(contents.len(), 512 * 1024);
    assert!(contents.iter().all(|&b| b == 0xFF));
}

#[tokio::test]
async fn test_electrical_test_reports_shorts() {
    let mut settings = settings();
    settings.shorted_pins = vec![[3, 56], [21, 22]];
    let (adapter, _controller, mut rx) = started(settings).await;

    adapter.run_electrical_test();

    let events = until(&mut rx, |e| {
        matches!(
            e,
            ProgrammerEvent::ElectricalTest(
                ElectricalTestStatus::Passed | ElectricalTestStatus::Failed
            )
        )
    })
    .await;
    assert_eq!(
        events,
        vec![
            ProgrammerEvent::ElectricalTest(ElectricalTestStatus::Started),
            ProgrammerEvent::ElectricalTestShort(3, 56),
            ProgrammerEvent::ElectricalTestShort(21, 22),
            ProgrammerEvent::ElectricalTest(ElectricalTestStatus::Failed),
        ]
    );
    assert_eq!(adapter.electrical_test_pin_name(56), "GND");
}

#[tokio::test]
async fn test_electrical_test_while_unplugged() {
    let mut settings = settings();
    settings.plugged_in = false;
    let (adapter, _controller, mut rx) = started(settings).await;

    adapter.run_electrical_test();

    assert_eq!(
        next(&mut rx).await,
        ProgrammerEvent::ElectricalTest(ElectricalTestStatus::CouldNotStart)
    );
}

#[tokio::test]
async fn test_identify_returns_configured_chips() {
    let (adapter, controller, mut rx) = started(settings()).await;
    controller.set_chip_identities([
        ChipIdentity::new(0x01, 0xA4),
        ChipIdentity::new(0x01, 0xA4),
        ChipIdentity::new(0xBF, 0xB7),
        ChipIdentity::new(0xBF, 0xB7),
    ]);

    adapter.identify_simm_chips();

    assert_eq!(
        next(&mut rx).await,
        ProgrammerEvent::Identification(IdentificationStatus::Starting)
    );
    assert_eq!(
        next(&mut rx).await,
        ProgrammerEvent::Identification(IdentificationStatus::Complete)
    );
    assert_eq!(adapter.chip_identity(0), ChipIdentity::new(0x01, 0xA4));
    assert_eq!(adapter.chip_identity(3), ChipIdentity::new(0xBF, 0xB7));
}

#[tokio::test]
async fn test_injected_identify_timeout() {
    let (adapter, controller, mut rx) = started(settings()).await;
    controller.fail_next(InjectedFailure::TimedOut);

    adapter.identify_simm_chips();

    let events = until(&mut rx, |e| {
        !matches!(
            e,
            ProgrammerEvent::Identification(IdentificationStatus::Starting)
        )
    })
    .await;
    assert_eq!(
        events.last(),
        Some(&ProgrammerEvent::Identification(
            IdentificationStatus::TimedOut
        ))
    );
}

#[tokio::test]
async fn test_stop_ends_operations() {
    let mut settings = settings();
    settings.step_delay_ms = 10_000;
    let (adapter, _controller, mut rx) = started(settings).await;

    adapter.identify_simm_chips();
    assert_eq!(
        next(&mut rx).await,
        ProgrammerEvent::Identification(IdentificationStatus::Starting)
    );

    adapter.stop();
    assert!(
        timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );
}
