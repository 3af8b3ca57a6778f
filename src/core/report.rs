use crate::core::models::ChipIdentity;

/// Shorted pin pairs collected during one electrical test.
#[derive(Debug, Default, Clone)]
pub struct ElectricalTestReport {
    entries: Vec<String>,
}

impl ElectricalTestReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn record_short(&mut self, pin_a: &str, pin_b: &str) {
        self.entries.push(format!("{} shorted to {}", pin_a, pin_b));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in arrival order, one per line.
    pub fn text(&self) -> String {
        self.entries.join("\n")
    }
}

pub const IDENTIFY_HEADING: &str = "The chips identified themselves as:";

/// One line per chip position, `IC1` first.
pub fn format_identities(identities: &[ChipIdentity]) -> String {
    identities
        .iter()
        .enumerate()
        .map(|(index, id)| {
            format!(
                "IC{}: Manufacturer 0x{:02X}, Device 0x{:02X}",
                index + 1,
                id.manufacturer,
                id.device
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
