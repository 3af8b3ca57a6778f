use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

/// Outcome of comparing a written image against the bytes read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// Every image byte matched the start of the read-back buffer.
    Verified { bytes_verified: u64 },
    /// At least one byte differs.
    Mismatch {
        first_difference: usize,
        image_digest: blake3::Hash,
        readback_digest: blake3::Hash,
    },
    /// The image is larger than the read-back buffer, so it cannot match.
    ImageTooLarge { image_len: usize, buffer_len: usize },
}

impl VerifyResult {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    /// Human-readable explanation of a failed comparison.
    pub fn describe(&self) -> String {
        match self {
            Self::Verified { bytes_verified } => {
                format!("{} bytes verified", bytes_verified)
            }
            Self::Mismatch {
                first_difference,
                image_digest,
                readback_digest,
            } => format!(
                "First difference at offset 0x{:06X}\n  image:     {}\n  read back: {}",
                first_difference,
                image_digest.to_hex(),
                readback_digest.to_hex()
            ),
            Self::ImageTooLarge {
                image_len,
                buffer_len,
            } => format!(
                "Image is {} bytes but only {} bytes were read back",
                image_len, buffer_len
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("unable to open {} for verification: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Byte-exact comparison of `image` against the first `image.len()` bytes of `readback`.
pub fn compare_image(image: &[u8], readback: &[u8]) -> VerifyResult {
    if image.len() > readback.len() {
        return VerifyResult::ImageTooLarge {
            image_len: image.len(),
            buffer_len: readback.len(),
        };
    }

    let region = &readback[..image.len()];
    if image == region {
        return VerifyResult::Verified {
            bytes_verified: image.len() as u64,
        };
    }

    let first_difference = image
        .iter()
        .zip(region)
        .position(|(a, b)| a != b)
        .unwrap_or(0);

    VerifyResult::Mismatch {
        first_difference,
        image_digest: blake3::hash(image),
        readback_digest: blake3::hash(region),
    }
}

/// Re-open the written image by path and compare it against the read-back buffer.
///
/// Blocks the calling task. An image longer than `readback` is rejected from
/// its metadata, and at most `readback.len() + 1` bytes are ever read, so the
/// work is bounded by the SIMM capacity and not by the file size.
pub fn verify_readback(source: &Path, readback: &[u8]) -> Result<VerifyResult, VerifyError> {
    debug!(path = %source.display(), "Re-opening image for verification");

    let open_err = |e: io::Error| VerifyError::Open {
        path: source.to_path_buf(),
        source: e,
    };
    let file = File::open(source).map_err(open_err)?;
    let image_len = file.metadata().map_err(open_err)?.len();

    let result = if image_len > readback.len() as u64 {
        VerifyResult::ImageTooLarge {
            image_len: image_len as usize,
            buffer_len: readback.len(),
        }
    } else {
        let mut image = Vec::with_capacity(image_len as usize);
        file.take(readback.len() as u64 + 1)
            .read_to_end(&mut image)
            .map_err(open_err)?;
        compare_image(&image, readback)
    };
    match &result {
        VerifyResult::Verified { bytes_verified } => {
            info!(bytes_verified = bytes_verified, "Verification complete");
        }
        VerifyResult::Mismatch {
            first_difference, ..
        } => {
            info!(first_difference = first_difference, "Verification failed");
        }
        VerifyResult::ImageTooLarge {
            image_len,
            buffer_len,
        } => {
            info!(
                image_len = image_len,
                buffer_len = buffer_len,
                "Verification failed: image larger than SIMM"
            );
        }
    }

    Ok(result)
}
