//! Fixed-size block I/O: logical block addresses mapped onto a set of volume
//! files. Two file-backed layouts (pre-allocated circular and expandable) plus
//! a volatile in-memory backend for tests.

use crate::error::DbError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Size of one block, in bytes. Every append consumes exactly one block slot.
pub const BLOCK_SIZE: usize = 4096;

const VOLUME_MAGIC: &[u8; 8] = b"TSCVOL01";
const VOLUME_VERSION: u32 = 1;

/// Logical block address: high 32 bits = volume generation, low 32 bits =
/// block slot within the volume. Dense and totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicAddr(pub u64);

impl LogicAddr {
    /// Sentinel for "no block"; never returned by an append.
    pub const EMPTY: LogicAddr = LogicAddr(u64::MAX);

    pub fn new(generation: u32, slot: u32) -> Self {
        LogicAddr(((generation as u64) << 32) | slot as u64)
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }
}

impl fmt::Display for LogicAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "EMPTY")
        } else {
            write!(f, "{}:{}", self.generation(), self.slot())
        }
    }
}

/// Durable description of one volume file, persisted in the metadata catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub id: u32,
    pub path: PathBuf,
    /// Capacity in blocks, excluding the header block.
    pub capacity: u32,
    pub generation: u32,
    pub nblocks: u32,
    pub version: u32,
}

/// Store of fixed-size blocks addressed by [`LogicAddr`].
pub trait BlockStore: Send + Sync + std::fmt::Debug {
    /// Writes one block (at most [`BLOCK_SIZE`] bytes, zero-padded) and
    /// returns its address.
    fn append(&self, block: &[u8]) -> Result<LogicAddr, DbError>;

    /// Reads a block back. A stale address (its generation was reclaimed by
    /// volume reuse) yields `NotFound`.
    fn read_block(&self, addr: LogicAddr) -> Result<Vec<u8>, DbError>;

    /// Forces buffered volume data to disk.
    fn flush(&self) -> Result<(), DbError>;

    /// Current descriptors, for catalog persistence. Empty for the in-memory
    /// backend.
    fn descriptors(&self) -> Vec<VolumeDescriptor>;

    /// Total successful appends since this store was opened.
    fn append_count(&self) -> u64;
}

// --- In-memory backend (tests and WAL-amplification accounting) --- //

/// Volatile backend: blocks live in a map keyed by raw address.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<u64, Vec<u8>>>,
    next_slot: AtomicU64,
    appends: AtomicU64,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn append(&self, block: &[u8]) -> Result<LogicAddr, DbError> {
        if block.len() > BLOCK_SIZE {
            return Err(DbError::BadArg(format!(
                "Block of {} bytes exceeds block size {}",
                block.len(),
                BLOCK_SIZE
            )));
        }
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        if slot > u32::MAX as u64 {
            return Err(DbError::Overflow("Memory block store full".to_string()));
        }
        let addr = LogicAddr::new(0, slot as u32);
        let mut padded = block.to_vec();
        padded.resize(BLOCK_SIZE, 0);
        self.blocks.write()?.insert(addr.0, padded);
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Vec<u8>, DbError> {
        self.blocks
            .read()?
            .get(&addr.0)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("Block {} not found", addr)))
    }

    fn flush(&self) -> Result<(), DbError> {
        Ok(())
    }

    fn descriptors(&self) -> Vec<VolumeDescriptor> {
        Vec::new()
    }

    fn append_count(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }
}

// --- Volume file --- //

#[derive(Debug)]
struct VolumeFile {
    file: File,
    desc: VolumeDescriptor,
}

impl VolumeFile {
    fn create(desc: VolumeDescriptor, preallocate: bool) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&desc.path)?;
        let mut vol = VolumeFile { file, desc };
        vol.write_header()?;
        if preallocate {
            let total = (vol.desc.capacity as u64 + 1) * BLOCK_SIZE as u64;
            vol.file.set_len(total)?;
        }
        vol.file.sync_data()?;
        Ok(vol)
    }

    fn open(desc: VolumeDescriptor) -> Result<Self, DbError> {
        let mut file = OpenOptions::new().read(true).write(true).open(&desc.path)?;
        let mut header = [0u8; 24];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if &header[..8] != VOLUME_MAGIC {
            return Err(DbError::corruption(format!(
                "Bad volume magic in {:?}",
                desc.path
            )));
        }
        let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if version != VOLUME_VERSION {
            return Err(DbError::corruption(format!(
                "Unsupported volume version {} in {:?}",
                version, desc.path
            )));
        }
        let capacity = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        if capacity != desc.capacity {
            return Err(DbError::BadArg(format!(
                "Volume {:?} capacity mismatch: file {} vs descriptor {}",
                desc.path, capacity, desc.capacity
            )));
        }
        Ok(VolumeFile { file, desc })
    }

    fn write_header(&mut self) -> Result<(), DbError> {
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(VOLUME_MAGIC);
        header.extend_from_slice(&VOLUME_VERSION.to_le_bytes());
        header.extend_from_slice(&self.desc.capacity.to_le_bytes());
        header.extend_from_slice(&self.desc.id.to_le_bytes());
        header.extend_from_slice(&self.desc.generation.to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    fn write_block(&mut self, slot: u32, block: &[u8]) -> Result<(), DbError> {
        let off = (slot as u64 + 1) * BLOCK_SIZE as u64;
        self.file.seek(SeekFrom::Start(off))?;
        let mut padded = [0u8; BLOCK_SIZE];
        padded[..block.len()].copy_from_slice(block);
        self.file.write_all(&padded)?;
        self.desc.nblocks = self.desc.nblocks.max(slot + 1);
        Ok(())
    }

    fn read_block(&mut self, slot: u32) -> Result<Vec<u8>, DbError> {
        let off = (slot as u64 + 1) * BLOCK_SIZE as u64;
        self.file.seek(SeekFrom::Start(off))?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Resets the volume for a new generation: header is rewritten and the
    /// block count starts over. Existing data becomes unreachable.
    fn recycle(&mut self, generation: u32) -> Result<(), DbError> {
        self.desc.generation = generation;
        self.desc.nblocks = 0;
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), DbError> {
        self.file.sync_data()?;
        Ok(())
    }
}

// --- Fixed-size file storage --- //

#[derive(Debug)]
struct FixedCursor {
    generation: u32,
    slot: u32,
}

/// Pre-allocated set of N volumes of fixed capacity. When the last volume
/// fills up the store wraps to the oldest one, bumping its generation so stale
/// addresses read as `NotFound`.
#[derive(Debug)]
pub struct FixedSizeFileStorage {
    volumes: Vec<Mutex<VolumeFile>>,
    cursor: Mutex<FixedCursor>,
    nvolumes: u32,
    appends: AtomicU64,
}

impl FixedSizeFileStorage {
    /// Creates and pre-allocates `nvolumes` volumes of `capacity` blocks each
    /// under `dir`, returning the store and the descriptors to persist.
    pub fn create(
        dir: &Path,
        nvolumes: u32,
        capacity: u32,
    ) -> Result<(Self, Vec<VolumeDescriptor>), DbError> {
        if nvolumes == 0 || capacity == 0 {
            return Err(DbError::BadArg(
                "Volume count and capacity must be positive".to_string(),
            ));
        }
        std::fs::create_dir_all(dir)?;
        let mut volumes = Vec::with_capacity(nvolumes as usize);
        let mut descs = Vec::with_capacity(nvolumes as usize);
        for id in 0..nvolumes {
            let desc = VolumeDescriptor {
                id,
                path: dir.join(format!("vol_{:04}.tsc", id)),
                capacity,
                generation: id,
                nblocks: 0,
                version: VOLUME_VERSION,
            };
            descs.push(desc.clone());
            volumes.push(Mutex::new(VolumeFile::create(desc, true)?));
        }
        let store = FixedSizeFileStorage {
            volumes,
            cursor: Mutex::new(FixedCursor {
                generation: 0,
                slot: 0,
            }),
            nvolumes,
            appends: AtomicU64::new(0),
        };
        Ok((store, descs))
    }

    /// Opens an existing store from catalog descriptors. The write cursor
    /// resumes after the newest generation's used blocks.
    pub fn open(descriptors: &[VolumeDescriptor]) -> Result<Self, DbError> {
        if descriptors.is_empty() {
            return Err(DbError::BadArg("No volume descriptors".to_string()));
        }
        let nvolumes = descriptors.len() as u32;
        let mut ordered = descriptors.to_vec();
        ordered.sort_by_key(|d| d.id);
        for (i, d) in ordered.iter().enumerate() {
            if d.id != i as u32 {
                return Err(DbError::BadArg(format!(
                    "Volume descriptor ids are not dense: expected {}, got {}",
                    i, d.id
                )));
            }
        }
        let newest = ordered
            .iter()
            .max_by_key(|d| d.generation)
            .cloned()
            .ok_or_else(|| DbError::BadArg("No volume descriptors".to_string()))?;
        let mut volumes = Vec::with_capacity(ordered.len());
        for desc in ordered {
            volumes.push(Mutex::new(VolumeFile::open(desc)?));
        }
        Ok(FixedSizeFileStorage {
            volumes,
            cursor: Mutex::new(FixedCursor {
                generation: newest.generation,
                slot: newest.nblocks,
            }),
            nvolumes,
            appends: AtomicU64::new(0),
        })
    }

    fn volume_for_generation(&self, generation: u32) -> &Mutex<VolumeFile> {
        &self.volumes[(generation % self.nvolumes) as usize]
    }
}

impl BlockStore for FixedSizeFileStorage {
    fn append(&self, block: &[u8]) -> Result<LogicAddr, DbError> {
        if block.len() > BLOCK_SIZE {
            return Err(DbError::BadArg(format!(
                "Block of {} bytes exceeds block size {}",
                block.len(),
                BLOCK_SIZE
            )));
        }
        let mut cursor = self.cursor.lock()?;
        let capacity = {
            let vol = self.volume_for_generation(cursor.generation).lock()?;
            vol.desc.capacity
        };
        if cursor.slot >= capacity {
            // Rotate. The outgoing volume is synced before its successor is
            // recycled so a crash cannot lose acknowledged blocks.
            let next_gen = cursor.generation + 1;
            self.volume_for_generation(cursor.generation).lock()?.sync()?;
            self.volume_for_generation(next_gen)
                .lock()?
                .recycle(next_gen)?;
            cursor.generation = next_gen;
            cursor.slot = 0;
        }
        let addr = LogicAddr::new(cursor.generation, cursor.slot);
        {
            let mut vol = self.volume_for_generation(cursor.generation).lock()?;
            vol.write_block(cursor.slot, block)?;
        }
        cursor.slot += 1;
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Vec<u8>, DbError> {
        if addr.is_empty() {
            return Err(DbError::BadArg("Read of the EMPTY address".to_string()));
        }
        let mut vol = self.volume_for_generation(addr.generation()).lock()?;
        if vol.desc.generation != addr.generation() {
            return Err(DbError::NotFound(format!(
                "Block {} was reclaimed (volume is at generation {})",
                addr, vol.desc.generation
            )));
        }
        if addr.slot() >= vol.desc.capacity {
            return Err(DbError::BadArg(format!("Block slot {} out of range", addr)));
        }
        vol.read_block(addr.slot())
    }

    fn flush(&self) -> Result<(), DbError> {
        for vol in &self.volumes {
            vol.lock()?.sync()?;
        }
        Ok(())
    }

    fn descriptors(&self) -> Vec<VolumeDescriptor> {
        let mut out = Vec::with_capacity(self.volumes.len());
        for vol in &self.volumes {
            if let Ok(guard) = vol.lock() {
                out.push(guard.desc.clone());
            }
        }
        out
    }

    fn append_count(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }
}

// --- Expandable file storage --- //

/// Volume set that grows on demand: generations map 1:1 to volumes and are
/// never reused, so addresses stay valid for the lifetime of the store.
#[derive(Debug)]
pub struct ExpandableFileStorage {
    dir: PathBuf,
    capacity: u32,
    volumes: Mutex<Vec<VolumeFile>>,
    cursor: Mutex<FixedCursor>,
    appends: AtomicU64,
}

impl ExpandableFileStorage {
    pub fn create(dir: &Path, capacity: u32) -> Result<Self, DbError> {
        if capacity == 0 {
            return Err(DbError::BadArg("Volume capacity must be positive".to_string()));
        }
        std::fs::create_dir_all(dir)?;
        let first = VolumeFile::create(
            VolumeDescriptor {
                id: 0,
                path: dir.join("vol_0000.tsc"),
                capacity,
                generation: 0,
                nblocks: 0,
                version: VOLUME_VERSION,
            },
            false,
        )?;
        Ok(ExpandableFileStorage {
            dir: dir.to_path_buf(),
            capacity,
            volumes: Mutex::new(vec![first]),
            cursor: Mutex::new(FixedCursor {
                generation: 0,
                slot: 0,
            }),
            appends: AtomicU64::new(0),
        })
    }

    pub fn open(descriptors: &[VolumeDescriptor]) -> Result<Self, DbError> {
        if descriptors.is_empty() {
            return Err(DbError::BadArg("No volume descriptors".to_string()));
        }
        let mut ordered = descriptors.to_vec();
        ordered.sort_by_key(|d| d.generation);
        let capacity = ordered[0].capacity;
        let dir = ordered[0]
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let last = ordered[ordered.len() - 1].clone();
        let mut volumes = Vec::with_capacity(ordered.len());
        for desc in ordered {
            volumes.push(VolumeFile::open(desc)?);
        }
        Ok(ExpandableFileStorage {
            dir,
            capacity,
            volumes: Mutex::new(volumes),
            cursor: Mutex::new(FixedCursor {
                generation: last.generation,
                slot: last.nblocks,
            }),
            appends: AtomicU64::new(0),
        })
    }
}

impl BlockStore for ExpandableFileStorage {
    fn append(&self, block: &[u8]) -> Result<LogicAddr, DbError> {
        if block.len() > BLOCK_SIZE {
            return Err(DbError::BadArg(format!(
                "Block of {} bytes exceeds block size {}",
                block.len(),
                BLOCK_SIZE
            )));
        }
        let mut cursor = self.cursor.lock()?;
        let mut volumes = self.volumes.lock()?;
        if cursor.slot >= self.capacity {
            let next_gen = cursor.generation + 1;
            volumes[cursor.generation as usize].sync()?;
            let desc = VolumeDescriptor {
                id: next_gen,
                path: self.dir.join(format!("vol_{:04}.tsc", next_gen)),
                capacity: self.capacity,
                generation: next_gen,
                nblocks: 0,
                version: VOLUME_VERSION,
            };
            volumes.push(VolumeFile::create(desc, false)?);
            cursor.generation = next_gen;
            cursor.slot = 0;
        }
        let addr = LogicAddr::new(cursor.generation, cursor.slot);
        volumes[cursor.generation as usize].write_block(cursor.slot, block)?;
        cursor.slot += 1;
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Vec<u8>, DbError> {
        if addr.is_empty() {
            return Err(DbError::BadArg("Read of the EMPTY address".to_string()));
        }
        let mut volumes = self.volumes.lock()?;
        let idx = addr.generation() as usize;
        if idx >= volumes.len() {
            return Err(DbError::NotFound(format!("Block {} not found", addr)));
        }
        if addr.slot() >= self.capacity {
            return Err(DbError::BadArg(format!("Block slot {} out of range", addr)));
        }
        volumes[idx].read_block(addr.slot())
    }

    fn flush(&self) -> Result<(), DbError> {
        let mut volumes = self.volumes.lock()?;
        for vol in volumes.iter_mut() {
            vol.sync()?;
        }
        Ok(())
    }

    fn descriptors(&self) -> Vec<VolumeDescriptor> {
        self.volumes
            .lock()
            .map(|vols| vols.iter().map(|v| v.desc.clone()).collect())
            .unwrap_or_default()
    }

    fn append_count(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }
}
