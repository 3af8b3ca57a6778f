use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What the programmer is doing right now. Only one non-idle mode is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Idle,
    Writing,
    Reading,
    /// Reading back into the verify buffer after a successful write.
    Verifying,
    ElectricalTesting,
    Identifying,
    FlashingFirmware,
}

impl OperationMode {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// The operation kind this mode belongs to, `None` when idle.
    pub fn kind(&self) -> Option<OperationKind> {
        match self {
            Self::Idle => None,
            Self::Writing | Self::Verifying => Some(OperationKind::Write),
            Self::Reading => Some(OperationKind::Read),
            Self::ElectricalTesting => Some(OperationKind::ElectricalTest),
            Self::Identifying => Some(OperationKind::Identify),
            Self::FlashingFirmware => Some(OperationKind::FirmwareFlash),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Writing => "writing",
            Self::Reading => "reading",
            Self::Verifying => "verifying",
            Self::ElectricalTesting => "electrical_testing",
            Self::Identifying => "identifying",
            Self::FlashingFirmware => "flashing_firmware",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-visible kind of an operation, used to label finished events.
///
/// A verification read is reported as part of the `Write` that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Write,
    Read,
    ElectricalTest,
    Identify,
    FirmwareFlash,
}

/// Total addressable capacity across the four chips on the SIMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SimmCapacity(u32);

impl SimmCapacity {
    /// 4 x 128 KB (1 Mb) chips.
    pub const KB_512: Self = Self(512 * 1024);
    /// 4 x 256 KB (2 Mb) chips.
    pub const MB_1: Self = Self(1024 * 1024);
    /// 4 x 512 KB (4 Mb) chips.
    pub const MB_2: Self = Self(2 * 1024 * 1024);

    pub const SUPPORTED: [Self; 3] = [Self::KB_512, Self::MB_1, Self::MB_2];

    pub fn bytes(&self) -> u32 {
        self.0
    }

    /// Capacity of a single chip position.
    pub fn per_chip(&self) -> u32 {
        self.0 / CHIP_COUNT as u32
    }

    pub fn label(&self) -> String {
        let per_chip_kb = self.per_chip() / 1024;
        let megabits = per_chip_kb / 128;
        format!(
            "{} KB ({} Mb) per chip * {} chips = {}",
            per_chip_kb,
            megabits,
            CHIP_COUNT,
            human_size(self.0)
        )
    }
}

impl Default for SimmCapacity {
    fn default() -> Self {
        Self::MB_2
    }
}

impl TryFrom<u32> for SimmCapacity {
    type Error = String;

    fn try_from(bytes: u32) -> Result<Self, Self::Error> {
        Self::SUPPORTED
            .into_iter()
            .find(|c| c.0 == bytes)
            .ok_or_else(|| format!("unsupported SIMM capacity: {} bytes", bytes))
    }
}

impl From<SimmCapacity> for u32 {
    fn from(capacity: SimmCapacity) -> Self {
        capacity.0
    }
}

impl FromStr for SimmCapacity {
    type Err = String;

    /// Accepts `512K`, `1M`, `2M` (case-insensitive, optional trailing `B`) or a byte count.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let trimmed = upper.strip_suffix('B').unwrap_or(&upper);

        let (digits, multiplier) = if let Some(n) = trimmed.strip_suffix('K') {
            (n, 1024)
        } else if let Some(n) = trimmed.strip_suffix('M') {
            (n, 1024 * 1024)
        } else {
            (trimmed, 1)
        };

        let value: u32 = digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid capacity: {}", s))?;

        value
            .checked_mul(multiplier)
            .ok_or_else(|| format!("invalid capacity: {}", s))
            .and_then(Self::try_from)
    }
}

impl fmt::Display for SimmCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&human_size(self.0))
    }
}

fn human_size(bytes: u32) -> String {
    if bytes >= 1024 * 1024 && bytes % (1024 * 1024) == 0 {
        format!("{} MB", bytes / (1024 * 1024))
    } else {
        format!("{} KB", bytes / 1024)
    }
}

/// Number of chip positions on a SIMM.
pub const CHIP_COUNT: usize = 4;

/// Manufacturer and device codes reported by one chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChipIdentity {
    pub manufacturer: u8,
    pub device: u8,
}

impl ChipIdentity {
    pub fn new(manufacturer: u8, device: u8) -> Self {
        Self {
            manufacturer,
            device,
        }
    }
}
