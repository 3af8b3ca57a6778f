use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::core::observer::{OperationReport, StatusEvent};
use crate::core::progress::Progress;

/// Renders status events on stdout, either as text or one JSON object per line.
pub struct Console {
    json: bool,
    /// Last progress decile printed in text mode.
    last_decile: Option<u8>,
}

impl Console {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            last_decile: None,
        }
    }

    /// Text for one event, or `None` if nothing should be printed.
    pub fn render(&mut self, event: &StatusEvent) -> Option<String> {
        if self.json {
            return serde_json::to_string(event).ok();
        }

        match event {
            StatusEvent::StatusMessage { text } => {
                self.last_decile = None;
                Some(text.clone())
            }
            StatusEvent::Progress(progress) => self.render_progress(progress),
            StatusEvent::Connectivity { connected: true } => {
                Some("Programmer board connected.".to_string())
            }
            StatusEvent::Connectivity { connected: false } => {
                Some("Programmer board disconnected.".to_string())
            }
            StatusEvent::OperationFinished(report) => Some(render_report(report)),
        }
    }

    fn render_progress(&mut self, progress: &Progress) -> Option<String> {
        let percent = progress.percentage()?;
        let decile = percent / 10;
        if self.last_decile.is_some_and(|last| last >= decile) {
            return None;
        }
        self.last_decile = Some(decile);
        Some(format!(
            "  {:>3}% ({}/{} bytes)",
            percent, progress.current, progress.total
        ))
    }

    fn print(&mut self, event: &StatusEvent) {
        if let Some(line) = self.render(event) {
            println!("{}", line);
        }
    }

    /// Block until the board reports itself connected.
    pub async fn wait_for_board(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<StatusEvent>,
        limit: Duration,
    ) -> Result<()> {
        let wait = async {
            while let Some(event) = events.recv().await {
                let connected = matches!(event, StatusEvent::Connectivity { connected: true });
                self.print(&event);
                if connected {
                    return true;
                }
            }
            false
        };

        match timeout(limit, wait).await {
            Ok(true) => Ok(()),
            Ok(false) => bail!("Programmer stopped before the board connected"),
            Err(_) => bail!(
                "Programmer board not found after {} seconds",
                limit.as_secs()
            ),
        }
    }

    /// Print events until the current operation finishes.
    pub async fn follow(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<StatusEvent>,
    ) -> Option<OperationReport> {
        while let Some(event) = events.recv().await {
            self.print(&event);
            if let StatusEvent::OperationFinished(report) = event {
                return Some(report);
            }
        }
        None
    }
}

fn render_report(report: &OperationReport) -> String {
    let mut out = format!("{}: {}", report.title, report.message);
    if let Some(detail) = &report.detail {
        out.push('\n');
        out.push_str(detail);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::OperationKind;
    use crate::core::observer::{FailureKind, Outcome};
    use chrono::Utc;
    use uuid::Uuid;

    fn progress(current: u32, total: u32) -> StatusEvent {
        StatusEvent::Progress(Progress { current, total })
    }

    #[test]
    fn test_progress_printed_once_per_decile() {
        let mut console = Console::new(false);

        assert_eq!(console.render(&progress(0, 0)), None);
        assert!(console.render(&progress(0, 100)).is_some());
        assert_eq!(console.render(&progress(5, 100)), None);
        assert_eq!(
            console.render(&progress(12, 100)).as_deref(),
            Some("   12% (12/100 bytes)")
        );
        assert_eq!(console.render(&progress(19, 100)), None);

        // A new phase starts over.
        console.render(&StatusEvent::StatusMessage {
            text: "Verifying SIMM contents...".to_string(),
        });
        assert!(console.render(&progress(0, 100)).is_some());
    }

    #[test]
    fn test_report_includes_detail() {
        let mut console = Console::new(false);
        let report = OperationReport {
            operation_id: Uuid::now_v7(),
            kind: OperationKind::ElectricalTest,
            outcome: Outcome::Error,
            failure: Some(FailureKind::HardwareError),
            title: "Test failed".to_string(),
            message: "The electrical test failed:".to_string(),
            detail: Some("A3 shorted to GND".to_string()),
            finished_at: Utc::now(),
            elapsed_ms: 40,
        };

        assert_eq!(
            console
                .render(&StatusEvent::OperationFinished(report))
                .as_deref(),
            Some("Test failed: The electrical test failed:\nA3 shorted to GND")
        );
    }

    #[test]
    fn test_json_mode_renders_every_event() {
        let mut console = Console::new(true);
        let line = console.render(&progress(0, 0)).unwrap();
        assert!(line.contains(r#""event":"progress""#));
    }

    #[tokio::test]
    async fn test_wait_for_board_times_out() {
        let mut console = Console::new(true);
        let (_tx, mut rx) = mpsc::unbounded_channel();

        let err = console
            .wait_for_board(&mut rx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
