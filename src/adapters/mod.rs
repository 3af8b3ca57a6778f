use thiserror::Error;

use crate::config::SimulatorSettings;
use crate::core::hardware::ProgrammerAdapter;

mod simulated;

pub use simulated::{InjectedFailure, SimulatedProgrammer, Simulator, pin_name};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no hardware transport is built in; run with --simulation")]
    NoTransport,
}

/// Pick the programmer backend.
///
/// The simulated board can be driven from stdin while the CLI runs:
/// `plug`, `unplug`, or `fail <error|erase|timeout|cancel|disconnect>`.
pub fn get_adapter(
    simulation: bool,
    settings: &SimulatorSettings,
) -> Result<Box<dyn ProgrammerAdapter>, AdapterError> {
    if !simulation {
        return Err(AdapterError::NoTransport);
    }

    let (adapter, controller) = SimulatedProgrammer::new(settings);

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lines().map_while(Result::ok) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["plug"] => controller.plug_in(),
                ["unplug"] => controller.unplug(),
                ["fail", kind] => match parse_failure(kind) {
                    Some(failure) => controller.fail_next(failure),
                    None => eprintln!("(Simulator) Unknown failure '{}'", kind),
                },
                [] => {}
                _ => eprintln!(
                    "(Simulator) Use: 'plug', 'unplug' or 'fail <error|erase|timeout|cancel|disconnect>'"
                ),
            }
        }
    });

    Ok(Box::new(adapter))
}

fn parse_failure(kind: &str) -> Option<InjectedFailure> {
    match kind {
        "error" => Some(InjectedFailure::Error),
        "erase" => Some(InjectedFailure::EraseFailed),
        "timeout" => Some(InjectedFailure::TimedOut),
        "cancel" => Some(InjectedFailure::Cancelled),
        "disconnect" => Some(InjectedFailure::Disconnect),
        _ => None,
    }
}
