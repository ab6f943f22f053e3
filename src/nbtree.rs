//! Per-series append tree ("extents list"). Level 0 accumulates samples into
//! compressed leaf blocks; each higher level aggregates the one below it.
//! Sealed blocks are immutable and chained through prev pointers, which makes
//! the whole structure reconstructible from a short list of per-level tip
//! addresses (the rescue point).

use crate::blockstore::{BlockStore, LogicAddr, BLOCK_SIZE};
use crate::codec::{
    crc32c, decode_gorilla_xor_u64, encode_gorilla_xor_u64, read_f64, read_u16, read_u32, read_u64,
    read_var_u64, write_f64, write_u16, write_u32, write_u64, write_var_u64,
};
use crate::error::DbError;
use crate::types::{
    AggregateFilter, AggregationResult, SeriesId, Timestamp, Value, ValueFilter, bucket_start,
    is_event_id, MAX_EVENT_LEN,
};
use std::io::{Cursor, Read};
use std::sync::Arc;

const BLOCK_MAGIC: &[u8; 8] = b"TSCBLK01";
const BLOCK_VERSION: u32 = 1;

/// Samples per leaf before it is sealed. Sized so that even incompressible
/// payloads stay inside one block.
const LEAF_MAX_ROWS: usize = 128;

/// Child references per superblock before it is sealed.
const SB_FANOUT: usize = 32;

/// Outcome of a single append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Ok,
    /// A block was sealed; the caller must collect `get_roots()` and publish
    /// the new rescue point.
    OkFlushNeeded,
    /// Timestamp is lower than the current series maximum.
    LateWrite,
    /// The id has no column.
    UnknownSeries,
}

/// Verdict of [`NBTreeExtentsList::repair_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStatus {
    Ok,
    Repair,
    /// Nothing was ever persisted for this series; open it fresh.
    Skip,
}

/// Aggregate a parent block stores for one child subtree. Also embedded into
/// every block header, describing the block's own contents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubtreeRef {
    pub addr: LogicAddr,
    pub level: u16,
    pub count: u64,
    pub begin: Timestamp,
    pub end: Timestamp,
    pub min: Value,
    pub min_ts: Timestamp,
    pub max: Value,
    pub max_ts: Timestamp,
    pub sum: Value,
    pub first: Value,
    pub last: Value,
}

impl SubtreeRef {
    fn from_aggregate(addr: LogicAddr, level: u16, agg: &AggregationResult) -> Self {
        SubtreeRef {
            addr,
            level,
            count: agg.cnt,
            begin: agg.begin,
            end: agg.end,
            min: agg.min,
            min_ts: agg.min_ts,
            max: agg.max,
            max_ts: agg.max_ts,
            sum: agg.sum,
            first: agg.first,
            last: agg.last,
        }
    }

    pub fn to_aggregate(&self) -> AggregationResult {
        AggregationResult {
            cnt: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            min_ts: self.min_ts,
            max_ts: self.max_ts,
            first: self.first,
            last: self.last,
            begin: self.begin,
            end: self.end,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        write_u64(buf, self.addr.0);
        write_u16(buf, self.level);
        write_u64(buf, self.count);
        write_u64(buf, self.begin);
        write_u64(buf, self.end);
        write_f64(buf, self.min);
        write_u64(buf, self.min_ts);
        write_f64(buf, self.max);
        write_u64(buf, self.max_ts);
        write_f64(buf, self.sum);
        write_f64(buf, self.first);
        write_f64(buf, self.last);
    }

    fn read<R: Read>(r: &mut R) -> Result<Self, DbError> {
        Ok(SubtreeRef {
            addr: LogicAddr(read_u64(r)?),
            level: read_u16(r)?,
            count: read_u64(r)?,
            begin: read_u64(r)?,
            end: read_u64(r)?,
            min: read_f64(r)?,
            min_ts: read_u64(r)?,
            max: read_f64(r)?,
            max_ts: read_u64(r)?,
            sum: read_f64(r)?,
            first: read_f64(r)?,
            last: read_f64(r)?,
        })
    }
}

// --- Block container --- //

#[derive(Debug)]
struct BlockHeader {
    id: SeriesId,
    level: u16,
    count: u32,
    prev: LogicAddr,
    agg: SubtreeRef,
}

fn encode_block(
    id: SeriesId,
    level: u16,
    count: u32,
    prev: LogicAddr,
    agg: &SubtreeRef,
    payload: &[u8],
) -> Result<Vec<u8>, DbError> {
    let mut buf = Vec::with_capacity(BLOCK_SIZE);
    buf.extend_from_slice(BLOCK_MAGIC);
    write_u32(&mut buf, BLOCK_VERSION);
    write_u64(&mut buf, id);
    write_u16(&mut buf, level);
    write_u32(&mut buf, count);
    write_u64(&mut buf, prev.0);
    agg.write(&mut buf);
    write_u32(&mut buf, payload.len() as u32);
    write_u32(&mut buf, crc32c(payload));
    buf.extend_from_slice(payload);
    if buf.len() > BLOCK_SIZE {
        return Err(DbError::Overflow(format!(
            "Encoded block of {} bytes does not fit a {} byte block",
            buf.len(),
            BLOCK_SIZE
        )));
    }
    Ok(buf)
}

/// Parses and CRC-checks a block, returning the header and payload slice.
fn decode_block(block: &[u8]) -> Result<(BlockHeader, Vec<u8>), DbError> {
    let mut cur = Cursor::new(block);
    let mut magic = [0u8; 8];
    cur.read_exact(&mut magic)?;
    if &magic != BLOCK_MAGIC {
        return Err(DbError::corruption("Bad block magic"));
    }
    let version = read_u32(&mut cur)?;
    if version != BLOCK_VERSION {
        return Err(DbError::corruption(format!(
            "Unsupported block version {}",
            version
        )));
    }
    let id = read_u64(&mut cur)?;
    let level = read_u16(&mut cur)?;
    let count = read_u32(&mut cur)?;
    let prev = LogicAddr(read_u64(&mut cur)?);
    let agg = SubtreeRef::read(&mut cur)?;
    let payload_len = read_u32(&mut cur)? as usize;
    let expected_crc = read_u32(&mut cur)?;
    let start = cur.position() as usize;
    if start + payload_len > block.len() {
        return Err(DbError::corruption("Truncated block payload"));
    }
    let payload = &block[start..start + payload_len];
    if crc32c(payload) != expected_crc {
        return Err(DbError::Corruption {
            details: "Block payload CRC mismatch".to_string(),
            series: Some(id),
            timestamp: None,
        });
    }
    Ok((
        BlockHeader {
            id,
            level,
            count,
            prev,
            agg,
        },
        payload.to_vec(),
    ))
}

// --- Leaf payload codecs --- //

fn encode_numeric_payload(rows: &[(Timestamp, Value)]) -> Result<Vec<u8>, DbError> {
    let mut payload = Vec::new();
    write_u64(&mut payload, rows[0].0);
    let mut prev = rows[0].0;
    for &(ts, _) in &rows[1..] {
        write_var_u64(&mut payload, ts - prev);
        prev = ts;
    }
    let bits: Vec<u64> = rows.iter().map(|&(_, v)| v.to_bits()).collect();
    encode_gorilla_xor_u64(&bits, &mut payload)?;
    Ok(payload)
}

fn decode_numeric_payload(payload: &[u8], count: usize) -> Result<Vec<(Timestamp, Value)>, DbError> {
    let mut cur = Cursor::new(payload);
    let mut timestamps = Vec::with_capacity(count);
    let first = read_u64(&mut cur)?;
    timestamps.push(first);
    let mut prev = first;
    for _ in 1..count {
        let d = read_var_u64(&mut cur)?;
        prev = prev
            .checked_add(d)
            .ok_or_else(|| DbError::corruption("Timestamp delta overflow"))?;
        timestamps.push(prev);
    }
    let bits = decode_gorilla_xor_u64(&mut cur, count)?;
    Ok(timestamps
        .into_iter()
        .zip(bits.into_iter().map(f64::from_bits))
        .collect())
}

fn encode_event_payload(rows: &[(Timestamp, Vec<u8>)]) -> Vec<u8> {
    let mut payload = Vec::new();
    write_u64(&mut payload, rows[0].0);
    let mut prev = rows[0].0;
    for (i, (ts, body)) in rows.iter().enumerate() {
        if i > 0 {
            write_var_u64(&mut payload, ts - prev);
            prev = *ts;
        }
        write_var_u64(&mut payload, body.len() as u64);
        payload.extend_from_slice(body);
    }
    payload
}

fn decode_event_payload(
    payload: &[u8],
    count: usize,
) -> Result<Vec<(Timestamp, Vec<u8>)>, DbError> {
    let mut cur = Cursor::new(payload);
    let mut out = Vec::with_capacity(count);
    let mut prev = read_u64(&mut cur)?;
    for i in 0..count {
        if i > 0 {
            prev = prev
                .checked_add(read_var_u64(&mut cur)?)
                .ok_or_else(|| DbError::corruption("Timestamp delta overflow"))?;
        }
        let len = read_var_u64(&mut cur)? as usize;
        if len > MAX_EVENT_LEN {
            return Err(DbError::corruption("Event body length out of bounds"));
        }
        let mut body = vec![0u8; len];
        cur.read_exact(&mut body)?;
        out.push((prev, body));
    }
    Ok(out)
}

// --- Builders --- //

#[derive(Debug)]
enum LeafRows {
    Numeric(Vec<(Timestamp, Value)>),
    Events(Vec<(Timestamp, Vec<u8>)>),
}

#[derive(Debug)]
struct LeafBuilder {
    rows: LeafRows,
    prev: LogicAddr,
    /// Rough serialized size, used to seal event leaves before they overflow.
    bytes: usize,
}

impl LeafBuilder {
    fn new(events: bool) -> Self {
        LeafBuilder {
            rows: if events {
                LeafRows::Events(Vec::new())
            } else {
                LeafRows::Numeric(Vec::new())
            },
            prev: LogicAddr::EMPTY,
            bytes: 0,
        }
    }

    fn len(&self) -> usize {
        match &self.rows {
            LeafRows::Numeric(v) => v.len(),
            LeafRows::Events(v) => v.len(),
        }
    }

    fn aggregate(&self) -> AggregationResult {
        let mut agg = AggregationResult::default();
        match &self.rows {
            LeafRows::Numeric(v) => {
                for &(ts, val) in v {
                    agg.add(ts, val);
                }
            }
            LeafRows::Events(v) => {
                for (ts, _) in v {
                    agg.add(*ts, 0.0);
                }
            }
        }
        agg
    }
}

#[derive(Debug)]
struct SuperBlockBuilder {
    level: u16,
    refs: Vec<SubtreeRef>,
    prev: LogicAddr,
}

impl SuperBlockBuilder {
    fn aggregate(&self) -> AggregationResult {
        let mut agg = AggregationResult::default();
        for r in &self.refs {
            agg.combine(&r.to_aggregate());
        }
        agg
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for r in &self.refs {
            r.write(&mut payload);
        }
        payload
    }
}

// --- The extents list --- //

/// One per series. All mutation goes through the owning column store's
/// per-tree lock; the struct itself is single-writer.
#[derive(Debug)]
pub struct NBTreeExtentsList {
    id: SeriesId,
    store: Arc<dyn BlockStore>,
    rescue: Vec<LogicAddr>,
    initialized: bool,
    leaf: LeafBuilder,
    supers: Vec<SuperBlockBuilder>,
    /// Sealed leaves in timestamp order; the query snapshot source.
    leaf_chain: Vec<SubtreeRef>,
    last_ts: Option<Timestamp>,
}

impl NBTreeExtentsList {
    pub fn new(id: SeriesId, rescue: Vec<LogicAddr>, store: Arc<dyn BlockStore>) -> Self {
        NBTreeExtentsList {
            id,
            store,
            rescue,
            initialized: false,
            leaf: LeafBuilder::new(is_event_id(id)),
            supers: Vec::new(),
            leaf_chain: Vec::new(),
            last_ts: None,
        }
    }

    pub fn get_id(&self) -> SeriesId {
        self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Classifies a stored rescue point without instantiating a tree.
    pub fn repair_status(rescue: &[LogicAddr], store: &dyn BlockStore) -> RepairStatus {
        if rescue.iter().all(|a| a.is_empty()) {
            return RepairStatus::Skip;
        }
        for addr in rescue {
            if addr.is_empty() {
                continue;
            }
            match store.read_block(*addr) {
                Ok(block) => {
                    if decode_block(&block).is_err() {
                        return RepairStatus::Repair;
                    }
                }
                Err(_) => return RepairStatus::Repair,
            }
        }
        RepairStatus::Ok
    }

    /// Loads the persisted state reachable from the rescue point and rebuilds
    /// the in-memory level builders. Unreadable blocks truncate the affected
    /// chain; their samples must come back through WAL replay.
    pub fn force_init(&mut self) -> Result<(), DbError> {
        if self.initialized {
            return Ok(());
        }
        self.leaf = LeafBuilder::new(is_event_id(self.id));
        self.supers.clear();
        self.leaf_chain.clear();
        self.last_ts = None;

        if self.rescue.iter().all(|a| a.is_empty()) {
            self.initialized = true;
            return Ok(());
        }

        let rescue = self.rescue.clone();
        let leaf_tip = rescue.first().copied().unwrap_or(LogicAddr::EMPTY);
        self.leaf.prev = leaf_tip;

        // Rebuild superblock builders top-down. Builder k holds refs to the
        // level-(k-1) blocks sealed after the last sealed level-k block.
        for k in 1..=rescue.len() {
            let tip = rescue.get(k).copied().unwrap_or(LogicAddr::EMPTY);
            let child_tip = rescue[k - 1];
            let boundary = if tip.is_empty() {
                LogicAddr::EMPTY
            } else {
                match self.read_super_refs(tip) {
                    Ok(refs) => refs.last().map(|r| r.addr).unwrap_or(LogicAddr::EMPTY),
                    Err(_) => LogicAddr::EMPTY,
                }
            };
            let (pending, _truncated) = self.collect_chain(child_tip, boundary);
            if tip.is_empty() && pending.is_empty() && k > 1 {
                break;
            }
            self.supers.push(SuperBlockBuilder {
                level: k as u16,
                refs: pending,
                prev: tip,
            });
        }
        // Drop empty trailing levels.
        while let Some(top) = self.supers.last() {
            if top.refs.is_empty() && top.prev.is_empty() {
                self.supers.pop();
            } else {
                break;
            }
        }

        // Rebuild the ordered leaf chain: refs recorded in level-1 blocks
        // first, then the uncovered leaf suffix from the prev chain.
        let level1_tip = rescue.get(1).copied().unwrap_or(LogicAddr::EMPTY);
        let mut covered_boundary = LogicAddr::EMPTY;
        if !level1_tip.is_empty() {
            let (l1_blocks, _) = self.collect_chain(level1_tip, LogicAddr::EMPTY);
            for sb in &l1_blocks {
                if let Ok(refs) = self.read_super_refs(sb.addr) {
                    self.leaf_chain.extend(refs);
                }
            }
            covered_boundary = self.leaf_chain.last().map(|r| r.addr).unwrap_or(LogicAddr::EMPTY);
        }
        let (tail_leaves, _) = self.collect_chain(leaf_tip, covered_boundary);
        self.leaf_chain.extend(tail_leaves);

        self.last_ts = self.leaf_chain.last().map(|r| r.end);
        self.initialized = true;
        Ok(())
    }

    /// Walks a prev-pointer chain from `tip` back to (but not including)
    /// `boundary`, returning refs oldest-first and whether the walk was cut
    /// short by an unreadable block.
    fn collect_chain(&self, tip: LogicAddr, boundary: LogicAddr) -> (Vec<SubtreeRef>, bool) {
        let mut out = Vec::new();
        let mut addr = tip;
        let mut truncated = false;
        while !addr.is_empty() && addr != boundary {
            match self.store.read_block(addr).and_then(|b| decode_block(&b)) {
                Ok((header, _)) => {
                    let mut sref = header.agg;
                    sref.addr = addr;
                    out.push(sref);
                    addr = header.prev;
                }
                Err(_) => {
                    truncated = true;
                    break;
                }
            }
        }
        out.reverse();
        (out, truncated)
    }

    fn read_super_refs(&self, addr: LogicAddr) -> Result<Vec<SubtreeRef>, DbError> {
        let block = self.store.read_block(addr)?;
        let (header, payload) = decode_block(&block)?;
        let mut cur = Cursor::new(payload.as_slice());
        let mut refs = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            refs.push(SubtreeRef::read(&mut cur)?);
        }
        Ok(refs)
    }

    // --- Append path --- //

    pub fn append(&mut self, ts: Timestamp, value: Value) -> Result<AppendResult, DbError> {
        self.append_impl(ts, value, false)
    }

    /// Permissive append used by WAL replay: samples at or below the restored
    /// maximum are treated as already present and skipped, which makes replay
    /// idempotent.
    pub fn append_allow_duplicates(
        &mut self,
        ts: Timestamp,
        value: Value,
    ) -> Result<AppendResult, DbError> {
        self.append_impl(ts, value, true)
    }

    fn append_impl(
        &mut self,
        ts: Timestamp,
        value: Value,
        allow_duplicates: bool,
    ) -> Result<AppendResult, DbError> {
        if is_event_id(self.id) {
            return Err(DbError::BadArg(
                "Numeric append on an event column".to_string(),
            ));
        }
        self.force_init()?;
        if let Some(last) = self.last_ts {
            if allow_duplicates {
                if ts <= last {
                    return Ok(AppendResult::Ok);
                }
            } else if ts < last {
                return Ok(AppendResult::LateWrite);
            }
        }
        let rows = match &mut self.leaf.rows {
            LeafRows::Numeric(v) => v,
            LeafRows::Events(_) => {
                return Err(DbError::Internal("Leaf payload kind mismatch".to_string()))
            }
        };
        rows.push((ts, value));
        self.last_ts = Some(ts);
        if self.leaf.len() >= LEAF_MAX_ROWS {
            self.seal_leaf()?;
            return Ok(AppendResult::OkFlushNeeded);
        }
        Ok(AppendResult::Ok)
    }

    pub fn append_event(&mut self, ts: Timestamp, body: &[u8]) -> Result<AppendResult, DbError> {
        self.append_event_impl(ts, body, false)
    }

    pub fn append_event_allow_duplicates(
        &mut self,
        ts: Timestamp,
        body: &[u8],
    ) -> Result<AppendResult, DbError> {
        self.append_event_impl(ts, body, true)
    }

    fn append_event_impl(
        &mut self,
        ts: Timestamp,
        body: &[u8],
        allow_duplicates: bool,
    ) -> Result<AppendResult, DbError> {
        if !is_event_id(self.id) {
            return Err(DbError::BadArg(
                "Event append on a numeric column".to_string(),
            ));
        }
        if body.len() > MAX_EVENT_LEN {
            return Err(DbError::Overflow(format!(
                "Event body of {} bytes exceeds limit {}",
                body.len(),
                MAX_EVENT_LEN
            )));
        }
        self.force_init()?;
        if let Some(last) = self.last_ts {
            if allow_duplicates {
                if ts <= last {
                    return Ok(AppendResult::Ok);
                }
            } else if ts < last {
                return Ok(AppendResult::LateWrite);
            }
        }
        // Seal early if this event would push the encoded payload past the
        // block budget.
        let budget = BLOCK_SIZE - 256;
        if self.leaf.len() > 0 && self.leaf.bytes + body.len() + 20 > budget {
            self.seal_leaf()?;
            self.push_event_row(ts, body);
            return Ok(AppendResult::OkFlushNeeded);
        }
        self.push_event_row(ts, body);
        if self.leaf.len() >= LEAF_MAX_ROWS {
            self.seal_leaf()?;
            return Ok(AppendResult::OkFlushNeeded);
        }
        Ok(AppendResult::Ok)
    }

    fn push_event_row(&mut self, ts: Timestamp, body: &[u8]) {
        self.leaf.bytes += body.len() + 20;
        self.last_ts = Some(ts);
        if let LeafRows::Events(v) = &mut self.leaf.rows {
            v.push((ts, body.to_vec()));
        }
    }

    fn seal_leaf(&mut self) -> Result<(), DbError> {
        if self.leaf.len() == 0 {
            return Ok(());
        }
        let agg = self.leaf.aggregate();
        let count = self.leaf.len() as u32;
        let payload = match &self.leaf.rows {
            LeafRows::Numeric(rows) => encode_numeric_payload(rows)?,
            LeafRows::Events(rows) => encode_event_payload(rows),
        };
        let mut sref = SubtreeRef::from_aggregate(LogicAddr::EMPTY, 0, &agg);
        let block = encode_block(self.id, 0, count, self.leaf.prev, &sref, &payload)?;
        let addr = self.store.append(&block)?;
        sref.addr = addr;
        self.leaf_chain.push(sref);
        self.leaf = LeafBuilder::new(is_event_id(self.id));
        self.leaf.prev = addr;
        self.bubble(sref, 0)?;
        Ok(())
    }

    /// Pushes a sealed block's ref into the parent level, sealing parents as
    /// they fill.
    fn bubble(&mut self, sref: SubtreeRef, child_level: u16) -> Result<(), DbError> {
        let idx = child_level as usize;
        if self.supers.len() <= idx {
            self.supers.push(SuperBlockBuilder {
                level: child_level + 1,
                refs: Vec::new(),
                prev: LogicAddr::EMPTY,
            });
        }
        self.supers[idx].refs.push(sref);
        if self.supers[idx].refs.len() >= SB_FANOUT {
            self.seal_super(idx)?;
        }
        Ok(())
    }

    fn seal_super(&mut self, idx: usize) -> Result<(), DbError> {
        let (level, prev, count, agg, payload) = {
            let sb = &self.supers[idx];
            (
                sb.level,
                sb.prev,
                sb.refs.len() as u32,
                sb.aggregate(),
                sb.encode_payload(),
            )
        };
        let mut sref = SubtreeRef::from_aggregate(LogicAddr::EMPTY, level, &agg);
        let block = encode_block(self.id, level, count, prev, &sref, &payload)?;
        let addr = self.store.append(&block)?;
        sref.addr = addr;
        self.supers[idx].refs.clear();
        self.supers[idx].prev = addr;
        self.bubble(sref, level)?;
        Ok(())
    }

    /// Current rescue point: per-level tip addresses, leaf level first.
    pub fn get_roots(&self) -> Vec<LogicAddr> {
        let mut roots = Vec::with_capacity(1 + self.supers.len());
        roots.push(self.leaf.prev);
        for sb in &self.supers {
            roots.push(sb.prev);
        }
        roots
    }

    /// Seals the partial leaf and returns the final rescue point. Superblock
    /// builders stay in memory: their pending refs are rebuilt from the
    /// sealed chains on reopen. The tree drops back to the uninitialized
    /// state and reopens lazily from these roots.
    pub fn close(&mut self) -> Result<Vec<LogicAddr>, DbError> {
        self.force_init()?;
        self.seal_leaf()?;
        self.store.flush()?;
        let roots = self.get_roots();
        self.rescue = roots.clone();
        self.initialized = false;
        self.leaf = LeafBuilder::new(is_event_id(self.id));
        self.supers.clear();
        self.leaf_chain.clear();
        self.last_ts = None;
        Ok(roots)
    }

    /// Bytes of samples buffered in memory and not yet sealed into blocks.
    pub fn uncommitted_size(&self) -> usize {
        match &self.leaf.rows {
            LeafRows::Numeric(v) => v.len() * 16,
            LeafRows::Events(v) => v.iter().map(|(_, b)| b.len() + 16).sum(),
        }
    }

    // --- Query path --- //

    /// Snapshot for readers: sealed leaf refs plus a copy of the unsealed tail.
    fn snapshot(&mut self) -> Result<TreeSnapshot, DbError> {
        self.force_init()?;
        let tail = match &self.leaf.rows {
            LeafRows::Numeric(v) => TailRows::Numeric(v.clone()),
            LeafRows::Events(v) => TailRows::Events(v.clone()),
        };
        Ok(TreeSnapshot {
            id: self.id,
            store: Arc::clone(&self.store),
            leaves: self.leaf_chain.clone(),
            tail,
        })
    }

    /// Ordered scan. Ascending over `[begin, end)` when `begin < end`,
    /// descending over `(end, begin]` when `begin > end`.
    pub fn search(&mut self, begin: Timestamp, end: Timestamp) -> Result<SeriesScan, DbError> {
        let snapshot = self.snapshot()?;
        Ok(SeriesScan::new(snapshot, begin, end, None))
    }

    pub fn filter(
        &mut self,
        begin: Timestamp,
        end: Timestamp,
        filter: ValueFilter,
    ) -> Result<SeriesScan, DbError> {
        let snapshot = self.snapshot()?;
        Ok(SeriesScan::new(snapshot, begin, end, Some(filter)))
    }

    pub fn search_events(&mut self, begin: Timestamp, end: Timestamp) -> Result<EventScan, DbError> {
        let snapshot = self.snapshot()?;
        EventScan::new(snapshot, begin, end, None)
    }

    pub fn filter_events(
        &mut self,
        begin: Timestamp,
        end: Timestamp,
        body_regex: &str,
    ) -> Result<EventScan, DbError> {
        let re = regex::bytes::Regex::new(body_regex)
            .map_err(|e| DbError::BadArg(format!("Bad event filter regex: {}", e)))?;
        let snapshot = self.snapshot()?;
        EventScan::new(snapshot, begin, end, Some(re))
    }

    /// Whole-range aggregate. Sealed leaves fully inside the range contribute
    /// their precomputed header aggregate and are not decompressed.
    pub fn aggregate(
        &mut self,
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<AggregationResult, DbError> {
        let snapshot = self.snapshot()?;
        let range = TimeRange::new(begin, end);
        let mut agg = AggregationResult::default();
        for leaf in &snapshot.leaves {
            if !range.overlaps(leaf.begin, leaf.end) {
                continue;
            }
            if range.covers(leaf.begin, leaf.end) {
                agg.combine(&leaf.to_aggregate());
            } else {
                for (ts, v) in snapshot.decode_numeric_leaf(leaf)? {
                    if range.contains(ts) {
                        agg.add(ts, v);
                    }
                }
            }
        }
        if let TailRows::Numeric(rows) = &snapshot.tail {
            for &(ts, v) in rows {
                if range.contains(ts) {
                    agg.add(ts, v);
                }
            }
        }
        Ok(agg)
    }

    /// Bucketed aggregates over `[begin, end)`; bucket k spans
    /// `[begin + k*step, begin + (k+1)*step)`. Only non-empty buckets are
    /// produced, ordered by bucket start (descending for reverse ranges).
    pub fn group_aggregate(
        &mut self,
        begin: Timestamp,
        end: Timestamp,
        step: Timestamp,
    ) -> Result<Vec<(Timestamp, AggregationResult)>, DbError> {
        if step == 0 {
            return Err(DbError::BadArg("Aggregation step must be positive".to_string()));
        }
        let snapshot = self.snapshot()?;
        let range = TimeRange::new(begin, end);
        let anchor = range.lo;
        let mut buckets: Vec<(Timestamp, AggregationResult)> = Vec::new();
        let mut fold = |ts: Timestamp, v: Value| {
            let start = bucket_start(ts, anchor, step);
            match buckets.binary_search_by_key(&start, |b| b.0) {
                Ok(i) => buckets[i].1.add(ts, v),
                Err(i) => {
                    let mut agg = AggregationResult::default();
                    agg.add(ts, v);
                    buckets.insert(i, (start, agg));
                }
            }
        };
        for leaf in &snapshot.leaves {
            if !range.overlaps(leaf.begin, leaf.end) {
                continue;
            }
            for (ts, v) in snapshot.decode_numeric_leaf(leaf)? {
                if range.contains(ts) {
                    fold(ts, v);
                }
            }
        }
        if let TailRows::Numeric(rows) = &snapshot.tail {
            for &(ts, v) in rows {
                if range.contains(ts) {
                    fold(ts, v);
                }
            }
        }
        if range.descending {
            buckets.reverse();
        }
        Ok(buckets)
    }

    pub fn group_aggregate_filter(
        &mut self,
        begin: Timestamp,
        end: Timestamp,
        step: Timestamp,
        filter: AggregateFilter,
    ) -> Result<Vec<(Timestamp, AggregationResult)>, DbError> {
        let mut buckets = self.group_aggregate(begin, end, step)?;
        buckets.retain(|(_, agg)| filter.matches(agg));
        Ok(buckets)
    }
}

// --- Query-side snapshot and iterators --- //

/// Half-open query interval with direction, normalized so `lo <= ts < hi`
/// selects matching samples in either direction.
#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub lo: Timestamp,
    pub hi: Timestamp,
    pub descending: bool,
}

impl TimeRange {
    /// Ascending `[begin, end)`; descending selects `(end, begin]`.
    pub fn new(begin: Timestamp, end: Timestamp) -> Self {
        if begin <= end {
            TimeRange {
                lo: begin,
                hi: end,
                descending: false,
            }
        } else {
            TimeRange {
                lo: end.saturating_add(1),
                hi: begin.saturating_add(1),
                descending: true,
            }
        }
    }

    #[inline]
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.lo && ts < self.hi
    }

    #[inline]
    fn overlaps(&self, begin: Timestamp, end: Timestamp) -> bool {
        begin < self.hi && end >= self.lo
    }

    #[inline]
    fn covers(&self, begin: Timestamp, end: Timestamp) -> bool {
        begin >= self.lo && end < self.hi
    }
}

#[derive(Debug)]
enum TailRows {
    Numeric(Vec<(Timestamp, Value)>),
    Events(Vec<(Timestamp, Vec<u8>)>),
}

#[derive(Debug)]
struct TreeSnapshot {
    id: SeriesId,
    store: Arc<dyn BlockStore>,
    leaves: Vec<SubtreeRef>,
    tail: TailRows,
}

impl TreeSnapshot {
    fn decode_numeric_leaf(&self, leaf: &SubtreeRef) -> Result<Vec<(Timestamp, Value)>, DbError> {
        let block = self.store.read_block(leaf.addr)?;
        let (header, payload) = decode_block(&block)?;
        decode_numeric_payload(&payload, header.count as usize)
    }

    fn decode_event_leaf(&self, leaf: &SubtreeRef) -> Result<Vec<(Timestamp, Vec<u8>)>, DbError> {
        let block = self.store.read_block(leaf.addr)?;
        let (header, payload) = decode_block(&block)?;
        decode_event_payload(&payload, header.count as usize)
    }
}

/// Ordered `(timestamp, value)` stream over one series. Blocks are decoded
/// lazily, one leaf at a time.
pub struct SeriesScan {
    snapshot: TreeSnapshot,
    range: TimeRange,
    filter: Option<ValueFilter>,
    /// Indices into `snapshot.leaves` still to visit, plus the tail sentinel.
    stages: Vec<ScanStage>,
    stage_pos: usize,
    buffer: Vec<(Timestamp, Value)>,
    buffer_pos: usize,
    failed: bool,
}

#[derive(Debug, Clone, Copy)]
enum ScanStage {
    Leaf(usize),
    Tail,
}

impl SeriesScan {
    fn new(snapshot: TreeSnapshot, begin: Timestamp, end: Timestamp, filter: Option<ValueFilter>) -> Self {
        let range = TimeRange::new(begin, end);
        let mut stages: Vec<ScanStage> = snapshot
            .leaves
            .iter()
            .enumerate()
            .filter(|(_, leaf)| range.overlaps(leaf.begin, leaf.end))
            .map(|(i, _)| ScanStage::Leaf(i))
            .collect();
        stages.push(ScanStage::Tail);
        if range.descending {
            stages.reverse();
        }
        SeriesScan {
            snapshot,
            range,
            filter,
            stages,
            stage_pos: 0,
            buffer: Vec::new(),
            buffer_pos: 0,
            failed: false,
        }
    }

    pub fn id(&self) -> SeriesId {
        self.snapshot.id
    }

    fn refill(&mut self) -> Result<bool, DbError> {
        while self.stage_pos < self.stages.len() {
            let stage = self.stages[self.stage_pos];
            self.stage_pos += 1;
            let mut rows = match stage {
                ScanStage::Leaf(i) => {
                    let leaf = self.snapshot.leaves[i];
                    self.snapshot.decode_numeric_leaf(&leaf)?
                }
                ScanStage::Tail => match &self.snapshot.tail {
                    TailRows::Numeric(rows) => rows.clone(),
                    TailRows::Events(_) => Vec::new(),
                },
            };
            rows.retain(|&(ts, v)| {
                self.range.contains(ts) && self.filter.map_or(true, |f| f.matches(v))
            });
            if self.range.descending {
                rows.reverse();
            }
            if !rows.is_empty() {
                self.buffer = rows;
                self.buffer_pos = 0;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Iterator for SeriesScan {
    type Item = Result<(Timestamp, Value), DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer_pos >= self.buffer.len() {
            match self.refill() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        let item = self.buffer[self.buffer_pos];
        self.buffer_pos += 1;
        Some(Ok(item))
    }
}

/// Ordered `(timestamp, body)` stream over one event series.
pub struct EventScan {
    rows: std::vec::IntoIter<(Timestamp, Vec<u8>)>,
    id: SeriesId,
}

impl EventScan {
    fn new(
        snapshot: TreeSnapshot,
        begin: Timestamp,
        end: Timestamp,
        body_regex: Option<regex::bytes::Regex>,
    ) -> Result<Self, DbError> {
        let range = TimeRange::new(begin, end);
        let mut rows: Vec<(Timestamp, Vec<u8>)> = Vec::new();
        for leaf in &snapshot.leaves {
            if !range.overlaps(leaf.begin, leaf.end) {
                continue;
            }
            for (ts, body) in snapshot.decode_event_leaf(leaf)? {
                if range.contains(ts) {
                    rows.push((ts, body));
                }
            }
        }
        if let TailRows::Events(tail) = &snapshot.tail {
            for (ts, body) in tail {
                if range.contains(*ts) {
                    rows.push((*ts, body.clone()));
                }
            }
        }
        if let Some(re) = body_regex {
            rows.retain(|(_, body)| re.is_match(body));
        }
        if range.descending {
            rows.reverse();
        }
        Ok(EventScan {
            rows: rows.into_iter(),
            id: snapshot.id,
        })
    }

    pub fn id(&self) -> SeriesId {
        self.id
    }
}

impl Iterator for EventScan {
    type Item = Result<(Timestamp, Vec<u8>), DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next().map(Ok)
    }
}
