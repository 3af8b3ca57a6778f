//! Lifetime management for the streams bound to an in-flight operation.
//!
//! The orchestrator owns every stream through [`ResourceManager`]. The
//! adapter only receives a [`StreamLease`], a shared view onto the same slot.
//! Releasing a resource empties the slot, so a lease held by the adapter
//! fails with `NotConnected` from then on instead of touching a stale file.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::models::SimmCapacity;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to open {} for {purpose}: {source}", .path.display())]
    Open {
        path: PathBuf,
        purpose: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to allocate a {bytes} byte verify buffer")]
    Allocation { bytes: usize },

    #[error("failed to flush {}: {source}", .path.display())]
    Flush {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Read-only ROM image being written to the SIMM.
    Source,
    /// Write-only file receiving a user-requested read.
    Destination,
    /// Capacity-sized memory buffer receiving a verification read.
    VerifyBuffer,
}

enum Stream {
    Source(BufReader<File>),
    Destination(BufWriter<File>),
    Verify(Cursor<Box<[u8]>>),
}

/// Shared handle onto the stream of the current operation.
#[derive(Clone)]
pub struct StreamLease {
    kind: ResourceKind,
    len: u64,
    slot: Arc<Mutex<Option<Stream>>>,
}

impl std::fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLease")
            .field("kind", &self.kind)
            .field("len", &self.len)
            .field("open", &self.is_open())
            .finish()
    }
}

impl StreamLease {
    fn new(kind: ResourceKind, len: u64, stream: Stream) -> Self {
        Self {
            kind,
            len,
            slot: Arc::new(Mutex::new(Some(stream))),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Byte length of the source image, or the size of the verify buffer.
    /// Zero for destination files.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Read the next chunk of a source stream.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.lock().as_mut() {
            Some(Stream::Source(reader)) => reader.read(buf),
            Some(Stream::Verify(cursor)) => cursor.read(buf),
            Some(Stream::Destination(_)) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "destination stream is write-only",
            )),
            None => Err(closed()),
        }
    }

    /// Append data to a destination file or verify buffer.
    ///
    /// The verify buffer never grows past its capacity; overflowing it is an error.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        match self.lock().as_mut() {
            Some(Stream::Destination(writer)) => writer.write_all(data),
            Some(Stream::Verify(cursor)) => cursor.write_all(data),
            Some(Stream::Source(_)) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "source stream is read-only",
            )),
            None => Err(closed()),
        }
    }

    fn take(&self) -> Option<Stream> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Stream>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream was released")
}

struct SourceHandle {
    path: PathBuf,
    lease: StreamLease,
}

struct DestinationHandle {
    path: PathBuf,
    lease: StreamLease,
}

/// Owns at most one live resource of each kind.
#[derive(Default)]
pub struct ResourceManager {
    source: Option<SourceHandle>,
    destination: Option<DestinationHandle>,
    verify: Option<StreamLease>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` read-only as the image to write. Any stale source is released first.
    pub fn open_source(&mut self, path: &Path) -> Result<StreamLease, ResourceError> {
        self.release_source();

        let open_err = |source| ResourceError::Open {
            path: path.to_path_buf(),
            purpose: "reading",
            source,
        };
        let file = File::open(path).map_err(open_err)?;
        let len = file.metadata().map_err(open_err)?.len();

        let lease = StreamLease::new(
            ResourceKind::Source,
            len,
            Stream::Source(BufReader::new(file)),
        );
        debug!(path = %path.display(), bytes = len, "Opened source image");

        self.source = Some(SourceHandle {
            path: path.to_path_buf(),
            lease: lease.clone(),
        });
        Ok(lease)
    }

    /// Create (or truncate) `path` write-only as the read destination.
    pub fn open_destination(&mut self, path: &Path) -> Result<StreamLease, ResourceError> {
        if let Err(e) = self.release_destination() {
            warn!(error = %e, "Failed to flush stale destination");
        }

        let file = File::create(path).map_err(|source| ResourceError::Open {
            path: path.to_path_buf(),
            purpose: "writing",
            source,
        })?;

        let lease = StreamLease::new(
            ResourceKind::Destination,
            0,
            Stream::Destination(BufWriter::new(file)),
        );
        debug!(path = %path.display(), "Opened read destination");

        self.destination = Some(DestinationHandle {
            path: path.to_path_buf(),
            lease: lease.clone(),
        });
        Ok(lease)
    }

    /// Allocate a zeroed buffer of exactly `capacity` bytes for a verification read.
    pub fn allocate_verify_buffer(
        &mut self,
        capacity: SimmCapacity,
    ) -> Result<StreamLease, ResourceError> {
        self.release_verify_buffer();

        let bytes = capacity.bytes() as usize;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(bytes)
            .map_err(|_| ResourceError::Allocation { bytes })?;
        buffer.resize(bytes, 0u8);

        let lease = StreamLease::new(
            ResourceKind::VerifyBuffer,
            bytes as u64,
            Stream::Verify(Cursor::new(buffer.into_boxed_slice())),
        );
        debug!(bytes, "Allocated verify buffer");

        self.verify = Some(lease.clone());
        Ok(lease)
    }

    /// Close the source image. Returns whether anything was open.
    pub fn release_source(&mut self) -> bool {
        match self.source.take() {
            Some(handle) => {
                handle.lease.take();
                debug!(path = %handle.path.display(), "Released source image");
                true
            }
            None => false,
        }
    }

    /// Flush and close the destination file. Returns whether anything was open.
    pub fn release_destination(&mut self) -> Result<bool, ResourceError> {
        let Some(handle) = self.destination.take() else {
            return Ok(false);
        };

        debug!(path = %handle.path.display(), "Released read destination");
        match handle.lease.take() {
            Some(Stream::Destination(mut writer)) => {
                writer.flush().map_err(|source| ResourceError::Flush {
                    path: handle.path,
                    source,
                })?;
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    /// Drop the verify buffer without reading it.
    pub fn release_verify_buffer(&mut self) -> bool {
        match self.verify.take() {
            Some(lease) => {
                lease.take();
                debug!("Released verify buffer");
                true
            }
            None => false,
        }
    }

    /// Close the verify buffer and hand back its contents.
    pub fn take_verify_buffer(&mut self) -> Option<Vec<u8>> {
        let lease = self.verify.take()?;
        debug!("Released verify buffer");
        match lease.take() {
            Some(Stream::Verify(cursor)) => Some(cursor.into_inner().into_vec()),
            _ => None,
        }
    }

    /// Release everything still open. Returns how many resources were closed.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        if self.release_source() {
            released += 1;
        }
        match self.release_destination() {
            Ok(true) => released += 1,
            Ok(false) => {}
            Err(e) => {
                released += 1;
                warn!(error = %e, "Failed to flush destination while releasing");
            }
        }
        if self.release_verify_buffer() {
            released += 1;
        }
        released
    }

    /// Number of resources currently held.
    pub fn live_count(&self) -> usize {
        usize::from(self.source.is_some())
            + usize::from(self.destination.is_some())
            + usize::from(self.verify.is_some())
    }
}
