//! Snapshot save/restore of backing-store ranges.
//!
//! A snapshot file is the raw concatenation of the requested byte ranges in
//! the order they are supplied; there is no header and no per-range length
//! prefix. The ranges are a side-channel convention: the caller must supply
//! the same list when restoring.

use crate::memory::Memory;
use log::debug;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CHUNK: usize = 64 * 1024;

impl Memory {
    /// Write the bytes of each half-open range `[lo, hi)` to `path`, in
    /// order.
    pub fn save_snapshot(
        &self,
        path: impl AsRef<Path>,
        ranges: &[(u64, u64)],
    ) -> Result<(), SnapshotError> {
        let path = path.as_ref();
        self.validate_ranges(ranges)?;

        let io_err = |source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
        let mut chunk = vec![0u8; CHUNK];
        for &(lo, hi) in ranges {
            let mut address = lo;
            while address < hi {
                let n = ((hi - address) as usize).min(CHUNK);
                self.load_bytes(address, &mut chunk[..n]);
                out.write_all(&chunk[..n]).map_err(io_err)?;
                address += n as u64;
            }
        }
        out.flush().map_err(io_err)?;
        debug!("saved snapshot {} ({} ranges)", path.display(), ranges.len());
        Ok(())
    }

    /// Restore the bytes of each half-open range `[lo, hi)` from `path`.
    /// The file length must equal the sum of the range sizes.
    pub fn load_snapshot(
        &mut self,
        path: impl AsRef<Path>,
        ranges: &[(u64, u64)],
    ) -> Result<(), SnapshotError> {
        let path = path.as_ref();
        self.validate_ranges(ranges)?;

        let io_err = |source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let expected: u64 = ranges.iter().map(|&(lo, hi)| hi - lo).sum();
        let found = file.metadata().map_err(io_err)?.len();
        if found != expected {
            return Err(SnapshotError::SizeMismatch { expected, found });
        }

        let mut input = BufReader::new(file);
        let mut chunk = vec![0u8; CHUNK];
        for &(lo, hi) in ranges {
            let mut address = lo;
            while address < hi {
                let n = ((hi - address) as usize).min(CHUNK);
                input.read_exact(&mut chunk[..n]).map_err(io_err)?;
                self.store_bytes(address, &chunk[..n]);
                address += n as u64;
            }
        }
        debug!(
            "restored snapshot {} ({} ranges)",
            path.display(),
            ranges.len()
        );
        Ok(())
    }

    fn validate_ranges(&self, ranges: &[(u64, u64)]) -> Result<(), SnapshotError> {
        for &(lo, hi) in ranges {
            if lo > hi || hi > self.size() {
                return Err(SnapshotError::RangeOutOfBounds { lo, hi });
            }
        }
        Ok(())
    }
}

/// Failure to save or restore a snapshot.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("snapshot range [{lo:#x}, {hi:#x}) is not within the memory")]
    RangeOutOfBounds { lo: u64, hi: u64 },
    #[error("snapshot file holds {found} bytes, ranges describe {expected}")]
    SizeMismatch { expected: u64, found: u64 },
}
