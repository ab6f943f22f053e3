//! Sharded append-only input log. One shard per writer; each shard is an
//! independent circular set of rotating volume files holding CRC-framed
//! records. Replay reconstructs column tails lost to a crash.

use crate::codec::{crc32c, read_u32, read_u64, read_var_u64, write_u32, write_u64, write_var_u64};
use crate::error::DbError;
use crate::types::{SeriesId, Timestamp, Value, MAX_EVENT_LEN, MAX_SNAME};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

const WAL_MAGIC: &[u8; 8] = b"TSCWAL01";
const WAL_VERSION: u32 = 1;

const REC_DATA: u8 = 1;
const REC_SERIES_NAME: u8 = 2;
const REC_EVENT: u8 = 3;

/// Buffered frame bytes before an automatic flush.
const FRAME_THRESHOLD: usize = 4096;

/// Geometry of the input log.
#[derive(Debug, Clone)]
pub struct InputLogConfig {
    pub path: PathBuf,
    /// Upper bound of one volume file, in bytes.
    pub volume_size: u64,
    /// Live volumes kept per shard; rotation deletes the oldest.
    pub volume_count: u32,
    /// Number of shards (writer concurrency).
    pub concurrency: u32,
}

impl InputLogConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        InputLogConfig {
            path: path.as_ref().to_path_buf(),
            volume_size: 4 * 1024 * 1024,
            volume_count: 4,
            concurrency: 2,
        }
    }
}

/// One input-log record.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Data {
        id: SeriesId,
        timestamp: Timestamp,
        value: Value,
    },
    Event {
        id: SeriesId,
        timestamp: Timestamp,
        body: Vec<u8>,
    },
    /// Declares `id`'s canonical name so recovery can re-register it before
    /// replaying dependent samples.
    SeriesName { id: SeriesId, name: String },
}

fn encode_record(rec: &LogRecord, buf: &mut Vec<u8>) {
    match rec {
        LogRecord::Data {
            id,
            timestamp,
            value,
        } => {
            buf.push(REC_DATA);
            write_u64(buf, *id);
            write_u64(buf, *timestamp);
            buf.extend_from_slice(&value.to_le_bytes());
        }
        LogRecord::Event {
            id,
            timestamp,
            body,
        } => {
            buf.push(REC_EVENT);
            write_u64(buf, *id);
            write_u64(buf, *timestamp);
            write_var_u64(buf, body.len() as u64);
            buf.extend_from_slice(body);
        }
        LogRecord::SeriesName { id, name } => {
            buf.push(REC_SERIES_NAME);
            write_u64(buf, *id);
            write_var_u64(buf, name.len() as u64);
            buf.extend_from_slice(name.as_bytes());
        }
    }
}

fn decode_records(payload: &[u8]) -> Result<Vec<LogRecord>, DbError> {
    let mut cur = Cursor::new(payload);
    let mut out = Vec::new();
    while (cur.position() as usize) < payload.len() {
        let mut typ = [0u8; 1];
        cur.read_exact(&mut typ)?;
        match typ[0] {
            REC_DATA => {
                let id = read_u64(&mut cur)?;
                let timestamp = read_u64(&mut cur)?;
                let mut v = [0u8; 8];
                cur.read_exact(&mut v)?;
                out.push(LogRecord::Data {
                    id,
                    timestamp,
                    value: f64::from_le_bytes(v),
                });
            }
            REC_EVENT => {
                let id = read_u64(&mut cur)?;
                let timestamp = read_u64(&mut cur)?;
                let len = read_var_u64(&mut cur)? as usize;
                if len > MAX_EVENT_LEN {
                    return Err(DbError::corruption("Event record length out of bounds"));
                }
                let mut body = vec![0u8; len];
                cur.read_exact(&mut body)?;
                out.push(LogRecord::Event {
                    id,
                    timestamp,
                    body,
                });
            }
            REC_SERIES_NAME => {
                let id = read_u64(&mut cur)?;
                let len = read_var_u64(&mut cur)? as usize;
                if len > MAX_SNAME {
                    return Err(DbError::corruption("Series name record length out of bounds"));
                }
                let mut name = vec![0u8; len];
                cur.read_exact(&mut name)?;
                out.push(LogRecord::SeriesName {
                    id,
                    name: String::from_utf8(name)
                        .map_err(|e| DbError::corruption(format!("Bad series name utf8: {}", e)))?,
                });
            }
            other => {
                return Err(DbError::corruption(format!(
                    "Unknown input log record type {}",
                    other
                )))
            }
        }
    }
    Ok(out)
}

fn volume_file_name(shard: u32, seq: u64) -> String {
    format!("inputlog_{:02}_{:08}.ils", shard, seq)
}

/// Lists `(seq, shard, path)` for every input-log volume under `dir`.
fn list_volumes(dir: &Path) -> Result<Vec<(u64, u32, PathBuf)>, DbError> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix("inputlog_") else {
            continue;
        };
        let Some(rest) = rest.strip_suffix(".ils") else {
            continue;
        };
        let Some((shard_str, seq_str)) = rest.split_once('_') else {
            continue;
        };
        let (Ok(shard), Ok(seq)) = (shard_str.parse::<u32>(), seq_str.parse::<u64>()) else {
            continue;
        };
        out.push((seq, shard, entry.path()));
    }
    out.sort();
    Ok(out)
}

/// One writer's rotating volume set. Exclusive to a single session thread.
#[derive(Debug)]
pub struct InputLogShard {
    shard_id: u32,
    dir: PathBuf,
    volume_size: u64,
    volume_count: u32,
    writer: Option<BufWriter<File>>,
    cur_seq: u64,
    cur_size: u64,
    frame: Vec<u8>,
    /// Ids already declared through this shard; declarations are per shard so
    /// replay stays self-contained.
    declared: HashSet<SeriesId>,
    bytes_written: u64,
}

impl InputLogShard {
    fn open(dir: &Path, shard_id: u32, cfg: &InputLogConfig) -> Result<Self, DbError> {
        fs::create_dir_all(dir)?;
        let next_seq = list_volumes(dir)?
            .iter()
            .filter(|(_, s, _)| *s == shard_id)
            .map(|(seq, _, _)| *seq + 1)
            .max()
            .unwrap_or(0);
        let mut shard = InputLogShard {
            shard_id,
            dir: dir.to_path_buf(),
            volume_size: cfg.volume_size,
            volume_count: cfg.volume_count,
            writer: None,
            cur_seq: next_seq,
            cur_size: 0,
            frame: Vec::new(),
            declared: HashSet::new(),
            bytes_written: 0,
        };
        shard.open_volume(next_seq)?;
        Ok(shard)
    }

    fn open_volume(&mut self, seq: u64) -> Result<(), DbError> {
        let path = self.dir.join(volume_file_name(self.shard_id, seq));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(WAL_MAGIC);
        write_u32(&mut header, WAL_VERSION);
        write_u32(&mut header, self.shard_id);
        write_u64(&mut header, seq);
        file.write_all(&header)?;
        file.sync_data()?;
        self.cur_seq = seq;
        self.cur_size = header.len() as u64;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// True when this shard has already written a name declaration for `id`.
    pub fn is_declared(&self, id: SeriesId) -> bool {
        self.declared.contains(&id)
    }

    pub fn append(&mut self, rec: &LogRecord) -> Result<(), DbError> {
        if let LogRecord::SeriesName { id, .. } = rec {
            self.declared.insert(*id);
        }
        encode_record(rec, &mut self.frame);
        if self.frame.len() >= FRAME_THRESHOLD {
            self.flush_frame()?;
        }
        Ok(())
    }

    /// Writes the buffered frame with its CRC trailer and makes it durable.
    /// Rotates the volume when the size bound is exceeded.
    pub fn flush_frame(&mut self) -> Result<(), DbError> {
        if self.frame.is_empty() {
            return Ok(());
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DbError::Internal("Input log shard is closed".to_string()))?;
        let mut head = Vec::with_capacity(8);
        write_u32(&mut head, self.frame.len() as u32);
        write_u32(&mut head, crc32c(&self.frame));
        writer.write_all(&head)?;
        writer.write_all(&self.frame)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        self.cur_size += (head.len() + self.frame.len()) as u64;
        self.bytes_written += (head.len() + self.frame.len()) as u64;
        self.frame.clear();
        if self.cur_size >= self.volume_size {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), DbError> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        let next_seq = self.cur_seq + 1;
        // Drop the oldest volumes beyond the configured live set. Samples
        // rotated out this way must already be sealed into the block store or
        // they are gone; the engine publishes rescue points often enough that
        // this is the bounded-loss contract of the log.
        let mine: Vec<(u64, u32, PathBuf)> = list_volumes(&self.dir)?
            .into_iter()
            .filter(|(_, s, _)| *s == self.shard_id)
            .collect();
        let live = self.volume_count.max(1) as usize;
        if mine.len() + 1 > live {
            for (_, _, path) in &mine[..mine.len() + 1 - live] {
                let _ = fs::remove_file(path);
            }
        }
        self.open_volume(next_seq)?;
        // Re-declare lazily: the new volume starts without declarations.
        self.declared.clear();
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), DbError> {
        self.flush_frame()?;
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Drop for InputLogShard {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// The full input log: a fixed set of shards plus replay and cleanup.
#[derive(Debug)]
pub struct ShardedInputLog {
    dir: PathBuf,
    shards: Vec<std::sync::Mutex<InputLogShard>>,
}

impl ShardedInputLog {
    pub fn open(cfg: &InputLogConfig) -> Result<Self, DbError> {
        let concurrency = cfg.concurrency.max(1);
        let mut shards = Vec::with_capacity(concurrency as usize);
        for shard_id in 0..concurrency {
            shards.push(std::sync::Mutex::new(InputLogShard::open(
                &cfg.path, shard_id, cfg,
            )?));
        }
        Ok(ShardedInputLog {
            dir: cfg.path.clone(),
            shards,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard(&self, idx: usize) -> &std::sync::Mutex<InputLogShard> {
        &self.shards[idx % self.shards.len()]
    }

    pub fn flush_all(&self) -> Result<(), DbError> {
        for shard in &self.shards {
            shard.lock()?.flush_frame()?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), DbError> {
        for shard in &self.shards {
            shard.lock()?.close()?;
        }
        Ok(())
    }

    /// Deletes every volume file. Called after recovery has republished
    /// rescue points, and on clean shutdown.
    pub fn clear(&self) -> Result<(), DbError> {
        for shard in &self.shards {
            let mut guard = shard.lock()?;
            guard.close()?;
            guard.declared.clear();
        }
        for (_, _, path) in list_volumes(&self.dir)? {
            let _ = fs::remove_file(&path);
        }
        // Reopen fresh volumes so writers can continue.
        for shard in &self.shards {
            let mut guard = shard.lock()?;
            let seq = guard.cur_seq + 1;
            guard.open_volume(seq)?;
        }
        Ok(())
    }
}

/// Outcome of reading one volume during recovery.
#[derive(Debug)]
pub struct VolumeReplay {
    pub shard: u32,
    pub seq: u64,
    pub records: Vec<LogRecord>,
    /// True when a torn or corrupt frame cut the volume short.
    pub truncated: bool,
}

/// Reads all volumes under `dir` in replay order: shard by shard, each
/// shard's volumes by sequence number. Corrupt frames terminate their volume
/// but not the replay.
pub fn read_input_log(dir: &Path) -> Result<Vec<VolumeReplay>, DbError> {
    let mut volumes = list_volumes(dir)?;
    volumes.sort_by_key(|(seq, shard, _)| (*shard, *seq));
    let mut out = Vec::with_capacity(volumes.len());
    for (seq, shard, path) in volumes {
        out.push(read_volume(&path, shard, seq)?);
    }
    Ok(out)
}

fn read_volume(path: &Path, shard: u32, seq: u64) -> Result<VolumeReplay, DbError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut replay = VolumeReplay {
        shard,
        seq,
        records: Vec::new(),
        truncated: false,
    };

    let mut magic = [0u8; 8];
    if reader.read_exact(&mut magic).is_err() || &magic != WAL_MAGIC {
        replay.truncated = true;
        return Ok(replay);
    }
    let Ok(version) = read_u32(&mut reader) else {
        replay.truncated = true;
        return Ok(replay);
    };
    if version != WAL_VERSION {
        replay.truncated = true;
        return Ok(replay);
    }
    let _shard = read_u32(&mut reader)?;
    let _seq = read_u64(&mut reader)?;

    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(DbError::Io(e)),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut crc_bytes = [0u8; 4];
        if reader.read_exact(&mut crc_bytes).is_err() {
            replay.truncated = true;
            break;
        }
        let expected = u32::from_le_bytes(crc_bytes);
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            replay.truncated = true;
            break;
        }
        if crc32c(&payload) != expected {
            replay.truncated = true;
            break;
        }
        match decode_records(&payload) {
            Ok(mut records) => replay.records.append(&mut records),
            Err(_) => {
                replay.truncated = true;
                break;
            }
        }
    }
    Ok(replay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;
    use tempfile::tempdir;

    fn config(dir: &Path) -> InputLogConfig {
        InputLogConfig {
            path: dir.to_path_buf(),
            volume_size: 64 * 1024,
            volume_count: 3,
            concurrency: 2,
        }
    }

    #[test]
    fn append_flush_and_replay_round_trip() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let log = ShardedInputLog::open(&cfg).unwrap();
        {
            let mut shard = log.shard(0).lock().unwrap();
            shard
                .append(&LogRecord::SeriesName {
                    id: 1024,
                    name: "cpu host=a".to_string(),
                })
                .unwrap();
            for ts in 0..100u64 {
                shard
                    .append(&LogRecord::Data {
                        id: 1024,
                        timestamp: ts,
                        value: ts as f64,
                    })
                    .unwrap();
            }
            shard.flush_frame().unwrap();
        }
        let replays = read_input_log(dir.path()).unwrap();
        let records: Vec<_> = replays.into_iter().flat_map(|r| r.records).collect();
        assert_eq!(records.len(), 101);
        assert_eq!(
            records[0],
            LogRecord::SeriesName {
                id: 1024,
                name: "cpu host=a".to_string()
            }
        );
        assert_eq!(
            records[100],
            LogRecord::Data {
                id: 1024,
                timestamp: 99,
                value: 99.0
            }
        );
    }

    #[test]
    fn unflushed_frame_is_not_durable() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let log = ShardedInputLog::open(&cfg).unwrap();
        log.shard(0)
            .lock()
            .unwrap()
            .append(&LogRecord::Data {
                id: 1,
                timestamp: 1,
                value: 1.0,
            })
            .unwrap();
        // No flush: the record only lives in the frame buffer.
        let total: usize = read_input_log(dir.path())
            .unwrap()
            .iter()
            .map(|r| r.records.len())
            .sum();
        assert_eq!(total, 0);
    }

    #[test]
    fn rotation_bounds_live_volumes() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.volume_size = 512;
        cfg.concurrency = 1;
        cfg.volume_count = 2;
        let log = ShardedInputLog::open(&cfg).unwrap();
        {
            let mut shard = log.shard(0).lock().unwrap();
            for ts in 0..200u64 {
                shard
                    .append(&LogRecord::Data {
                        id: 1,
                        timestamp: ts,
                        value: 0.0,
                    })
                    .unwrap();
                shard.flush_frame().unwrap();
            }
        }
        let volumes = list_volumes(dir.path()).unwrap();
        assert!(volumes.len() <= 2, "{} volumes live", volumes.len());
        // Newest records must still be readable.
        let replays = read_input_log(dir.path()).unwrap();
        let last = replays
            .iter()
            .flat_map(|r| r.records.iter())
            .last()
            .unwrap();
        assert_eq!(
            *last,
            LogRecord::Data {
                id: 1,
                timestamp: 199,
                value: 0.0
            }
        );
    }

    #[test]
    fn torn_frame_terminates_volume_not_replay() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.concurrency = 1;
        let log = ShardedInputLog::open(&cfg).unwrap();
        {
            let mut shard = log.shard(0).lock().unwrap();
            for ts in 0..10u64 {
                shard
                    .append(&LogRecord::Data {
                        id: 1,
                        timestamp: ts,
                        value: 0.0,
                    })
                    .unwrap();
            }
            shard.flush_frame().unwrap();
            shard.close().unwrap();
        }
        // Corrupt the last byte of the volume.
        let (_, _, path) = list_volumes(dir.path()).unwrap().pop().unwrap();
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        let end = f.metadata().unwrap().len();
        f.seek(std::io::SeekFrom::Start(end - 1)).unwrap();
        f.write_all(&[0xFF]).unwrap();
        f.sync_data().unwrap();

        let replays = read_input_log(dir.path()).unwrap();
        let torn = replays.iter().find(|r| r.truncated).unwrap();
        assert!(torn.records.is_empty());
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let log = ShardedInputLog::open(&cfg).unwrap();
        {
            let mut shard = log.shard(1).lock().unwrap();
            shard
                .append(&LogRecord::Data {
                    id: 1,
                    timestamp: 1,
                    value: 1.0,
                })
                .unwrap();
            shard.flush_frame().unwrap();
        }
        log.clear().unwrap();
        let total: usize = read_input_log(dir.path())
            .unwrap()
            .iter()
            .map(|r| r.records.len())
            .sum();
        assert_eq!(total, 0);
    }

    #[test]
    fn declarations_are_tracked_per_shard() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let log = ShardedInputLog::open(&cfg).unwrap();
        let mut shard = log.shard(0).lock().unwrap();
        assert!(!shard.is_declared(1024));
        shard
            .append(&LogRecord::SeriesName {
                id: 1024,
                name: "m a=1".to_string(),
            })
            .unwrap();
        assert!(shard.is_declared(1024));
    }
}
