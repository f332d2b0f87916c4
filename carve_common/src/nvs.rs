//! Non-volatile store contract and checksummed record layout.
//!
//! The firmware never talks to persistent media directly; everything goes
//! through [`NonVolatileStore`], a flat byte space with fixed record
//! offsets. Every record carries a trailing XOR checksum; a version byte at
//! offset 0 gates the whole image. Two implementations ship: an in-RAM
//! store for tests and check-mode, and a single-file image for hosted runs.
//!
//! ## Layout
//!
//! | Offset | Record |
//! |---|---|
//! | 0   | version byte |
//! | 1   | global settings block |
//! | 512 | coordinate tables: G54-G59, G28, G30 (N_AXIS × f32 + checksum each) |
//! | 768 | startup lines (2 × (80 + checksum)) |
//! | 942 | build-info string (80 + checksum) |

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::consts::{MAX_LINE_LENGTH, N_AXIS, N_STARTUP_LINES};

/// Total image size [bytes].
pub const NVS_SIZE: usize = 1024;

/// Image format version. A mismatch wipes and restores defaults.
pub const NVS_VERSION: u8 = 10;

/// Record offsets.
pub const ADDR_VERSION: usize = 0;
pub const ADDR_GLOBAL_SETTINGS: usize = 1;
pub const ADDR_PARAMETERS: usize = 512;
pub const ADDR_STARTUP_LINES: usize = 768;
pub const ADDR_BUILD_INFO: usize = 942;

/// Stored coordinate slots: G54-G59 work systems plus G28 and G30 homes.
pub const N_COORDINATE_DATA: usize = 8;
/// Slot index of the G28 home position.
pub const COORD_G28: usize = 6;
/// Slot index of the G30 home position.
pub const COORD_G30: usize = 7;

/// Bytes per coordinate record: N_AXIS little-endian f32 + checksum.
const COORD_RECORD_SIZE: usize = N_AXIS * 4 + 1;
/// Bytes per stored line record: fixed-width text + checksum.
const LINE_RECORD_SIZE: usize = MAX_LINE_LENGTH + 1;

static_assertions::const_assert!(ADDR_PARAMETERS + N_COORDINATE_DATA * COORD_RECORD_SIZE <= ADDR_STARTUP_LINES);
static_assertions::const_assert!(ADDR_STARTUP_LINES + N_STARTUP_LINES * LINE_RECORD_SIZE <= ADDR_BUILD_INFO);
static_assertions::const_assert!(ADDR_BUILD_INFO + LINE_RECORD_SIZE <= NVS_SIZE);

/// Non-volatile store failure.
#[derive(Debug, Error)]
pub enum NvsError {
    /// Access beyond the image bounds.
    #[error("access out of range: offset {offset} len {len}")]
    OutOfRange { offset: usize, len: usize },
    /// Record checksum did not match its payload.
    #[error("checksum mismatch at offset {offset}")]
    ChecksumMismatch { offset: usize },
    /// Backing file I/O failure.
    #[error("store i/o: {0}")]
    Io(#[from] io::Error),
}

/// Flat byte-addressed persistent store.
///
/// Writes must not be issued while the stepper is active; the caller is
/// responsible for draining the planner first (see the protocol layer's
/// buffer synchronize).
pub trait NonVolatileStore: Send {
    /// Read `buf.len()` bytes starting at `offset`.
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<(), NvsError>;
    /// Write `data` starting at `offset` and persist it.
    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<(), NvsError>;
}

// ─── Record Helpers ─────────────────────────────────────────────────

fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Write `payload` at `offset` followed by its XOR checksum byte.
pub fn write_record(
    store: &mut dyn NonVolatileStore,
    offset: usize,
    payload: &[u8],
) -> Result<(), NvsError> {
    store.write_bytes(offset, payload)?;
    store.write_bytes(offset + payload.len(), &[xor_checksum(payload)])
}

/// Read a record of `buf.len()` bytes at `offset` and verify its checksum.
pub fn read_record(
    store: &dyn NonVolatileStore,
    offset: usize,
    buf: &mut [u8],
) -> Result<(), NvsError> {
    store.read_bytes(offset, buf)?;
    let mut stored = [0u8; 1];
    store.read_bytes(offset + buf.len(), &mut stored)?;
    if stored[0] != xor_checksum(buf) {
        return Err(NvsError::ChecksumMismatch { offset });
    }
    Ok(())
}

/// Check the image version byte; wipe and restamp on mismatch.
///
/// Returns `true` if the image was wiped (callers then restore defaults).
pub fn init_store(store: &mut dyn NonVolatileStore) -> Result<bool, NvsError> {
    let mut version = [0u8; 1];
    store.read_bytes(ADDR_VERSION, &mut version)?;
    if version[0] == NVS_VERSION {
        return Ok(false);
    }
    warn!(
        found = version[0],
        expected = NVS_VERSION,
        "non-volatile image version mismatch, wiping"
    );
    store.write_bytes(0, &[0u8; NVS_SIZE])?;
    store.write_bytes(ADDR_VERSION, &[NVS_VERSION])?;
    Ok(true)
}

// ─── Coordinate Tables ──────────────────────────────────────────────

fn coord_offset(slot: usize) -> usize {
    ADDR_PARAMETERS + slot * COORD_RECORD_SIZE
}

/// Persist one coordinate slot (machine position per axis [mm]).
pub fn store_coord_data(
    store: &mut dyn NonVolatileStore,
    slot: usize,
    data: &[f32; N_AXIS],
) -> Result<(), NvsError> {
    debug_assert!(slot < N_COORDINATE_DATA);
    let mut payload = [0u8; N_AXIS * 4];
    for (axis, value) in data.iter().enumerate() {
        payload[axis * 4..axis * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }
    write_record(store, coord_offset(slot), &payload)
}

/// Load one coordinate slot. A checksum failure yields the zero vector
/// after re-persisting it, so the table self-heals.
pub fn load_coord_data(
    store: &mut dyn NonVolatileStore,
    slot: usize,
) -> Result<[f32; N_AXIS], NvsError> {
    debug_assert!(slot < N_COORDINATE_DATA);
    let mut payload = [0u8; N_AXIS * 4];
    match read_record(store, coord_offset(slot), &mut payload) {
        Ok(()) => {
            let mut data = [0.0f32; N_AXIS];
            for (axis, value) in data.iter_mut().enumerate() {
                let mut word = [0u8; 4];
                word.copy_from_slice(&payload[axis * 4..axis * 4 + 4]);
                *value = f32::from_le_bytes(word);
            }
            Ok(data)
        }
        Err(NvsError::ChecksumMismatch { offset }) => {
            warn!(slot, offset, "coordinate record corrupt, zeroing");
            let zero = [0.0f32; N_AXIS];
            store_coord_data(store, slot, &zero)?;
            Err(NvsError::ChecksumMismatch { offset })
        }
        Err(e) => Err(e),
    }
}

// ─── Stored Lines ───────────────────────────────────────────────────

fn pack_line(line: &str) -> Option<[u8; MAX_LINE_LENGTH]> {
    if line.len() >= MAX_LINE_LENGTH {
        return None;
    }
    let mut payload = [0u8; MAX_LINE_LENGTH];
    payload[..line.len()].copy_from_slice(line.as_bytes());
    Some(payload)
}

fn unpack_line(payload: &[u8; MAX_LINE_LENGTH]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(MAX_LINE_LENGTH);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Persist startup line `n`. Returns `None`-mapped error via `Err` when the
/// line is too long for the record.
pub fn store_startup_line(
    store: &mut dyn NonVolatileStore,
    n: usize,
    line: &str,
) -> Result<bool, NvsError> {
    debug_assert!(n < N_STARTUP_LINES);
    let Some(payload) = pack_line(line) else {
        return Ok(false);
    };
    write_record(store, ADDR_STARTUP_LINES + n * LINE_RECORD_SIZE, &payload)?;
    Ok(true)
}

/// Load startup line `n`; empty string when unset or corrupt.
pub fn load_startup_line(store: &dyn NonVolatileStore, n: usize) -> Result<String, NvsError> {
    debug_assert!(n < N_STARTUP_LINES);
    let mut payload = [0u8; MAX_LINE_LENGTH];
    match read_record(store, ADDR_STARTUP_LINES + n * LINE_RECORD_SIZE, &mut payload) {
        Ok(()) => Ok(unpack_line(&payload)),
        Err(NvsError::ChecksumMismatch { .. }) => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Persist the build-info string. Returns `false` if it does not fit.
pub fn store_build_info(store: &mut dyn NonVolatileStore, info: &str) -> Result<bool, NvsError> {
    let Some(payload) = pack_line(info) else {
        return Ok(false);
    };
    write_record(store, ADDR_BUILD_INFO, &payload)?;
    Ok(true)
}

/// Load the build-info string; empty when unset or corrupt.
pub fn load_build_info(store: &dyn NonVolatileStore) -> Result<String, NvsError> {
    let mut payload = [0u8; MAX_LINE_LENGTH];
    match read_record(store, ADDR_BUILD_INFO, &mut payload) {
        Ok(()) => Ok(unpack_line(&payload)),
        Err(NvsError::ChecksumMismatch { .. }) => Ok(String::new()),
        Err(e) => Err(e),
    }
}

// ─── Implementations ────────────────────────────────────────────────

/// In-RAM store for tests and check-mode sessions.
#[derive(Debug)]
pub struct MemoryStore {
    data: Vec<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: vec![0u8; NVS_SIZE],
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NonVolatileStore for MemoryStore {
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<(), NvsError> {
        let end = offset + buf.len();
        if end > self.data.len() {
            return Err(NvsError::OutOfRange {
                offset,
                len: buf.len(),
            });
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<(), NvsError> {
        let end = offset + data.len();
        if end > self.data.len() {
            return Err(NvsError::OutOfRange {
                offset,
                len: data.len(),
            });
        }
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }
}

/// Single-file image store for hosted runs.
///
/// The whole image is held in RAM and flushed on every write, mirroring the
/// write-through behaviour of an EEPROM: reads are free, writes are slow and
/// must only happen with the planner drained.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    data: Vec<u8>,
}

impl FileStore {
    /// Open or create the image file at `path`.
    pub fn open(path: &Path) -> Result<Self, NvsError> {
        let data = match std::fs::read(path) {
            Ok(mut bytes) => {
                bytes.resize(NVS_SIZE, 0);
                bytes
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => vec![0u8; NVS_SIZE],
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }
}

impl NonVolatileStore for FileStore {
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<(), NvsError> {
        let end = offset + buf.len();
        if end > self.data.len() {
            return Err(NvsError::OutOfRange {
                offset,
                len: buf.len(),
            });
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<(), NvsError> {
        let end = offset + data.len();
        if end > self.data.len() {
            return Err(NvsError::OutOfRange {
                offset,
                len: data.len(),
            });
        }
        self.data[offset..end].copy_from_slice(data);
        std::fs::write(&self.path, &self.data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let mut store = MemoryStore::new();
        let payload = [1u8, 2, 3, 4];
        write_record(&mut store, 100, &payload).unwrap();
        let mut read = [0u8; 4];
        read_record(&store, 100, &mut read).unwrap();
        assert_eq!(read, payload);
    }

    #[test]
    fn corrupt_record_fails_checksum() {
        let mut store = MemoryStore::new();
        write_record(&mut store, 100, &[1u8, 2, 3, 4]).unwrap();
        // Flip one payload byte behind the checksum's back.
        store.write_bytes(101, &[0xFF]).unwrap();
        let mut read = [0u8; 4];
        let err = read_record(&store, 100, &mut read).unwrap_err();
        assert!(matches!(err, NvsError::ChecksumMismatch { offset: 100 }));
    }

    #[test]
    fn version_mismatch_wipes() {
        let mut store = MemoryStore::new();
        store.write_bytes(50, &[0xAB]).unwrap();
        assert!(init_store(&mut store).unwrap());
        let mut b = [0u8; 1];
        store.read_bytes(50, &mut b).unwrap();
        assert_eq!(b[0], 0);
        // Second init sees the stamped version and leaves the image alone.
        assert!(!init_store(&mut store).unwrap());
    }

    #[test]
    fn coord_data_roundtrip() {
        let mut store = MemoryStore::new();
        let data = [10.5f32, -3.25, 0.0];
        store_coord_data(&mut store, 2, &data).unwrap();
        assert_eq!(load_coord_data(&mut store, 2).unwrap(), data);
    }

    #[test]
    fn corrupt_coord_slot_self_heals_to_zero() {
        let mut store = MemoryStore::new();
        store_coord_data(&mut store, 0, &[1.0, 2.0, 3.0]).unwrap();
        store.write_bytes(ADDR_PARAMETERS, &[0x55]).unwrap();
        assert!(load_coord_data(&mut store, 0).is_err());
        // The slot was rewritten as zero with a valid checksum.
        assert_eq!(load_coord_data(&mut store, 0).unwrap(), [0.0; N_AXIS]);
    }

    #[test]
    fn startup_line_roundtrip() {
        let mut store = MemoryStore::new();
        assert!(store_startup_line(&mut store, 0, "G21G90").unwrap());
        assert_eq!(load_startup_line(&store, 0).unwrap(), "G21G90");
        // Unset record is all zeroes, which checksums clean and unpacks empty.
        assert_eq!(load_startup_line(&store, 1).unwrap(), "");
    }

    #[test]
    fn overlong_line_is_rejected() {
        let mut store = MemoryStore::new();
        let long = "G1X0".repeat(40);
        assert!(!store_startup_line(&mut store, 0, &long).unwrap());
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvs.bin");
        {
            let mut store = FileStore::open(&path).unwrap();
            init_store(&mut store).unwrap();
            store_coord_data(&mut store, 1, &[7.0, 8.0, 9.0]).unwrap();
        }
        let mut reopened = FileStore::open(&path).unwrap();
        assert!(!init_store(&mut reopened).unwrap());
        assert_eq!(load_coord_data(&mut reopened, 1).unwrap(), [7.0, 8.0, 9.0]);
    }
}
