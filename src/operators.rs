//! Query operators: ordered sample sources (scan merge, aggregates, join) and
//! the linear transform pipeline feeding the push cursor. Operators are plain
//! tagged values, composed by the planner into one pipeline per query.

use crate::error::DbError;
use crate::nbtree::{EventScan, SeriesScan};
use crate::types::{
    pack_tuple_header, AggregateComponent, AggregationResult, Payload, Sample, SeriesId,
    Timestamp, Value, ValueFilter,
};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Samples between cancellation checks.
pub const CURSOR_BATCH: usize = 1024;

/// Output ordering of a multi-series scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    Time,
    Series,
}

// --- Cursor contract --- //

/// Push interface consumed by the wire layer. The engine calls `complete` or
/// `set_error` exactly once and never calls `put` afterwards.
pub trait InternalCursor {
    /// Accepts one sample; `false` applies backpressure and stops the query.
    fn put(&mut self, sample: Sample) -> bool;
    fn complete(&mut self);
    fn set_error(&mut self, err: DbError);
}

/// Cursor collecting everything into memory; the library-level query surface.
#[derive(Debug, Default)]
pub struct CollectingCursor {
    pub samples: Vec<Sample>,
    pub error: Option<DbError>,
    pub completed: bool,
}

impl InternalCursor for CollectingCursor {
    fn put(&mut self, sample: Sample) -> bool {
        self.samples.push(sample);
        true
    }

    fn complete(&mut self) {
        debug_assert!(!self.completed && self.error.is_none());
        self.completed = true;
    }

    fn set_error(&mut self, err: DbError) {
        debug_assert!(!self.completed && self.error.is_none());
        self.error = Some(err);
    }
}

/// Per-query cancellation flag, checked between operator batches.
#[derive(Debug, Clone, Default)]
pub struct QueryCancelToken(Arc<AtomicBool>);

impl QueryCancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }
}

// --- Sources --- //

/// Ordered stream of samples feeding the pipeline.
pub trait SampleSource {
    fn next_sample(&mut self) -> Result<Option<Sample>, DbError>;
}

/// Pre-materialized source (aggregates, joins, metadata rows).
#[derive(Debug)]
pub struct VecSource {
    samples: std::vec::IntoIter<Sample>,
}

impl VecSource {
    pub fn new(samples: Vec<Sample>) -> Self {
        VecSource {
            samples: samples.into_iter(),
        }
    }
}

impl SampleSource for VecSource {
    fn next_sample(&mut self) -> Result<Option<Sample>, DbError> {
        Ok(self.samples.next())
    }
}

struct HeapEntry {
    ts: Timestamp,
    id: SeriesId,
    scan: usize,
    descending: bool,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts && self.id == other.id && self.scan == other.scan
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the pop order is (ts, id)
        // ascending, or ts descending with id ascending for reverse ranges.
        let ts_ord = if self.descending {
            self.ts.cmp(&other.ts)
        } else {
            other.ts.cmp(&self.ts)
        };
        ts_ord
            .then_with(|| other.id.cmp(&self.id))
            .then_with(|| other.scan.cmp(&self.scan))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges per-series scans into one ordered stream. Scans are grouped by
/// output id: `group-by` projections point several source series at one
/// logical output series.
///
/// `Time` order is a k-way heap merge keyed `(timestamp, id)`; `Series` order
/// concatenates groups in the given order, merging inside each group.
pub struct ScanSource {
    groups: Vec<(SeriesId, Vec<SeriesScan>)>,
    order: OrderBy,
    descending: bool,
    heap: BinaryHeap<HeapEntry>,
    pending: Vec<Option<(Timestamp, Value)>>,
    scan_ids: Vec<SeriesId>,
    group_of_scan: Vec<usize>,
    current_group: usize,
    started: bool,
}

impl ScanSource {
    pub fn new(groups: Vec<(SeriesId, Vec<SeriesScan>)>, order: OrderBy, descending: bool) -> Self {
        let mut scan_ids = Vec::new();
        let mut group_of_scan = Vec::new();
        for (gi, (out_id, scans)) in groups.iter().enumerate() {
            for _ in scans {
                scan_ids.push(*out_id);
                group_of_scan.push(gi);
            }
        }
        ScanSource {
            groups,
            order,
            descending,
            heap: BinaryHeap::new(),
            pending: Vec::new(),
            scan_ids,
            group_of_scan,
            current_group: 0,
            started: false,
        }
    }

    /// One scan per output id, no grouping.
    pub fn flat(scans: Vec<SeriesScan>, order: OrderBy, descending: bool) -> Self {
        let groups = scans.into_iter().map(|s| (s.id(), vec![s])).collect();
        Self::new(groups, order, descending)
    }

    fn scan_at(&mut self, idx: usize) -> &mut SeriesScan {
        let mut offset = idx;
        for (_, scans) in &mut self.groups {
            if offset < scans.len() {
                return &mut scans[offset];
            }
            offset -= scans.len();
        }
        unreachable!("scan index out of range")
    }

    fn advance(&mut self, idx: usize) -> Result<Option<(Timestamp, Value)>, DbError> {
        match self.scan_at(idx).next() {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn push_entry(&mut self, idx: usize) -> Result<(), DbError> {
        if let Some((ts, v)) = self.advance(idx)? {
            self.pending[idx] = Some((ts, v));
            self.heap.push(HeapEntry {
                ts,
                id: self.scan_ids[idx],
                scan: idx,
                descending: self.descending,
            });
        }
        Ok(())
    }

    fn start_time_order(&mut self) -> Result<(), DbError> {
        let n = self.scan_ids.len();
        self.pending = vec![None; n];
        for idx in 0..n {
            self.push_entry(idx)?;
        }
        Ok(())
    }

    fn start_group(&mut self, group: usize) -> Result<(), DbError> {
        self.heap.clear();
        let n = self.scan_ids.len();
        if self.pending.len() != n {
            self.pending = vec![None; n];
        }
        for idx in 0..n {
            if self.group_of_scan[idx] == group {
                self.push_entry(idx)?;
            }
        }
        Ok(())
    }
}

impl SampleSource for ScanSource {
    fn next_sample(&mut self) -> Result<Option<Sample>, DbError> {
        if !self.started {
            self.started = true;
            match self.order {
                OrderBy::Time => self.start_time_order()?,
                OrderBy::Series => {
                    self.current_group = 0;
                    if !self.groups.is_empty() {
                        self.start_group(0)?;
                    }
                }
            }
        }
        loop {
            if let Some(entry) = self.heap.pop() {
                let idx = entry.scan;
                let (ts, v) = self.pending[idx]
                    .take()
                    .ok_or_else(|| DbError::Internal("Scan merge lost a sample".to_string()))?;
                self.push_entry(idx)?;
                return Ok(Some(Sample::float(entry.id, ts, v)));
            }
            match self.order {
                OrderBy::Time => return Ok(None),
                OrderBy::Series => {
                    self.current_group += 1;
                    if self.current_group >= self.groups.len() {
                        return Ok(None);
                    }
                    let group = self.current_group;
                    self.start_group(group)?;
                }
            }
        }
    }
}

/// Event-series counterpart of [`ScanSource`]; no grouping, events merge by
/// `(timestamp, id)` in `Time` order or concatenate in `Series` order.
pub struct EventSource {
    scans: Vec<EventScan>,
    ids: Vec<SeriesId>,
    order: OrderBy,
    descending: bool,
    heap: BinaryHeap<HeapEntry>,
    pending: Vec<Option<(Timestamp, Vec<u8>)>>,
    current: usize,
    started: bool,
}

impl EventSource {
    pub fn new(scans: Vec<EventScan>, order: OrderBy, descending: bool) -> Self {
        let ids = scans.iter().map(|s| s.id()).collect();
        EventSource {
            scans,
            ids,
            order,
            descending,
            heap: BinaryHeap::new(),
            pending: Vec::new(),
            current: 0,
            started: false,
        }
    }

    fn push_entry(&mut self, idx: usize) -> Result<(), DbError> {
        match self.scans[idx].next() {
            Some(Ok((ts, body))) => {
                self.pending[idx] = Some((ts, body));
                self.heap.push(HeapEntry {
                    ts,
                    id: self.ids[idx],
                    scan: idx,
                    descending: self.descending,
                });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl SampleSource for EventSource {
    fn next_sample(&mut self) -> Result<Option<Sample>, DbError> {
        if !self.started {
            self.started = true;
            self.pending = (0..self.scans.len()).map(|_| None).collect();
            match self.order {
                OrderBy::Time => {
                    for idx in 0..self.scans.len() {
                        self.push_entry(idx)?;
                    }
                }
                OrderBy::Series => {}
            }
        }
        match self.order {
            OrderBy::Time => {
                let Some(entry) = self.heap.pop() else {
                    return Ok(None);
                };
                let idx = entry.scan;
                let (ts, body) = self.pending[idx]
                    .take()
                    .ok_or_else(|| DbError::Internal("Event merge lost a sample".to_string()))?;
                self.push_entry(idx)?;
                Ok(Some(Sample::event(entry.id, ts, body)))
            }
            OrderBy::Series => {
                while self.current < self.scans.len() {
                    match self.scans[self.current].next() {
                        Some(Ok((ts, body))) => {
                            let id = self.ids[self.current];
                            return Ok(Some(Sample::event(id, ts, body)));
                        }
                        Some(Err(e)) => return Err(e),
                        None => self.current += 1,
                    }
                }
                Ok(None)
            }
        }
    }
}

// --- Aggregate materialization --- //

/// Builds the tuple sample for one aggregation result and a function list.
pub fn aggregate_tuple(
    id: SeriesId,
    ts: Timestamp,
    agg: &AggregationResult,
    funcs: &[AggregateComponent],
) -> Result<Sample, DbError> {
    let values: Vec<Value> = funcs.iter().map(|f| agg.component(*f)).collect();
    let presence = if values.len() >= 64 {
        u64::MAX
    } else {
        (1u64 << values.len()) - 1
    };
    // The packed header is validated here so oversized tuples fail the query
    // instead of producing an unencodable sample.
    pack_tuple_header(presence, values.len())?;
    Ok(Sample {
        id,
        timestamp: ts,
        payload: Payload::Tuple { presence, values },
    })
}

/// One tuple sample per id for whole-range aggregates.
pub fn aggregate_samples(
    ids: &[SeriesId],
    results: &[AggregationResult],
    funcs_by_id: impl Fn(SeriesId) -> Vec<AggregateComponent>,
    ts: Timestamp,
) -> Result<Vec<Sample>, DbError> {
    let mut out = Vec::with_capacity(ids.len());
    for (&id, agg) in ids.iter().zip(results) {
        if agg.cnt == 0 {
            continue;
        }
        out.push(aggregate_tuple(id, ts, agg, &funcs_by_id(id))?);
    }
    Ok(out)
}

/// Tuple samples per bucket per id for group-aggregates, ordered according to
/// `order`.
pub fn group_aggregate_samples(
    ids: &[SeriesId],
    buckets_by_id: Vec<Vec<(Timestamp, AggregationResult)>>,
    funcs: &[AggregateComponent],
    order: OrderBy,
    descending: bool,
) -> Result<Vec<Sample>, DbError> {
    let mut out = Vec::new();
    for (&id, buckets) in ids.iter().zip(&buckets_by_id) {
        for (ts, agg) in buckets {
            out.push(aggregate_tuple(id, *ts, agg, funcs)?);
        }
    }
    match order {
        OrderBy::Series => {}
        OrderBy::Time => {
            if descending {
                out.sort_by(|a, b| {
                    b.timestamp
                        .cmp(&a.timestamp)
                        .then_with(|| a.id.cmp(&b.id))
                });
            } else {
                out.sort_by(|a, b| {
                    a.timestamp
                        .cmp(&b.timestamp)
                        .then_with(|| a.id.cmp(&b.id))
                });
            }
        }
    }
    Ok(out)
}

/// Column-aligned join of two metrics' group-aggregate streams. `pairs` holds
/// `(output_id, left_buckets, right_buckets)` per joined series pair; each
/// bucket present on either side yields one tuple sample with a presence bit
/// per metric.
pub fn join_samples(
    pairs: Vec<(
        SeriesId,
        Vec<(Timestamp, AggregationResult)>,
        Vec<(Timestamp, AggregationResult)>,
    )>,
    func: AggregateComponent,
    order: OrderBy,
    descending: bool,
) -> Result<Vec<Sample>, DbError> {
    let mut out = Vec::new();
    for (id, left, right) in pairs {
        let mut li = left.into_iter().peekable();
        let mut ri = right.into_iter().peekable();
        loop {
            let pick = match (li.peek(), ri.peek()) {
                (Some(l), Some(r)) => {
                    if l.0 == r.0 {
                        Ordering::Equal
                    } else if (l.0 < r.0) != descending {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => break,
            };
            let (ts, presence, values) = match pick {
                Ordering::Equal => {
                    let (ts, la) = li.next().expect("peeked");
                    let (_, ra) = ri.next().expect("peeked");
                    (ts, 0b11, vec![la.component(func), ra.component(func)])
                }
                Ordering::Less => {
                    let (ts, la) = li.next().expect("peeked");
                    (ts, 0b01, vec![la.component(func), 0.0])
                }
                Ordering::Greater => {
                    let (ts, ra) = ri.next().expect("peeked");
                    (ts, 0b10, vec![0.0, ra.component(func)])
                }
            };
            pack_tuple_header(presence, values.len())?;
            out.push(Sample {
                id,
                timestamp: ts,
                payload: Payload::Tuple { presence, values },
            });
        }
    }
    if order == OrderBy::Time {
        if descending {
            out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        } else {
            out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        }
    }
    Ok(out)
}

// --- Pipeline stages --- //

/// Linear transform applied to every sample between source and cursor.
#[derive(Debug)]
pub enum PipelineStage {
    /// Per-output-id value predicate (used when filtering cannot be pushed
    /// down to the tree scan, e.g. after group-by projection).
    Filter(std::collections::HashMap<SeriesId, ValueFilter>),
    /// A sample passes when any of the filters accepts it (the `ANY`
    /// combination rule across metric filters).
    AnyFilter(Vec<ValueFilter>),
    /// Absolute value of every numeric element.
    Absolute,
    /// Arithmetic expression over the sample's tuple fields; the result
    /// replaces the payload with a scalar.
    Eval(EvalExpr),
}

impl PipelineStage {
    /// Transforms `sample` in place; `false` drops it from the stream.
    pub fn apply(&self, sample: &mut Sample) -> bool {
        match self {
            PipelineStage::Filter(filters) => match filters.get(&sample.id) {
                Some(f) => sample.scalar().map_or(true, |v| f.matches(v)),
                None => true,
            },
            PipelineStage::AnyFilter(filters) => sample
                .scalar()
                .map_or(true, |v| filters.iter().any(|f| f.matches(v))),
            PipelineStage::Absolute => {
                match &mut sample.payload {
                    Payload::Float(v) => *v = v.abs(),
                    Payload::Tuple { values, .. } => {
                        for v in values {
                            *v = v.abs();
                        }
                    }
                    Payload::Event(_) => {}
                }
                true
            }
            PipelineStage::Eval(expr) => {
                let inputs: Vec<Value> = match &sample.payload {
                    Payload::Float(v) => vec![*v],
                    Payload::Tuple { values, .. } => values.clone(),
                    Payload::Event(_) => return true,
                };
                match expr.eval(&inputs) {
                    Some(v) => {
                        sample.payload = Payload::Float(v);
                        true
                    }
                    None => false,
                }
            }
        }
    }
}

/// Drives one query: pulls from the source, applies the stages, pushes into
/// the cursor. Terminates the cursor exactly once.
pub fn run_pipeline(
    source: &mut dyn SampleSource,
    stages: &[PipelineStage],
    cursor: &mut dyn InternalCursor,
    cancel: &QueryCancelToken,
) {
    let mut since_check = 0usize;
    loop {
        if since_check == 0 && cancel.is_cancelled() {
            cursor.set_error(DbError::Cancelled);
            return;
        }
        since_check = (since_check + 1) % CURSOR_BATCH;
        match source.next_sample() {
            Ok(Some(mut sample)) => {
                if stages.iter().all(|s| s.apply(&mut sample)) {
                    if !cursor.put(sample) {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                cursor.set_error(e);
                return;
            }
        }
    }
    cursor.complete();
}

// --- Expression evaluation --- //

/// Parsed arithmetic expression over tuple fields. Fields are addressed as
/// `$0`, `$1`, ...; `value` aliases `$0`.
#[derive(Debug, Clone)]
pub enum EvalExpr {
    Const(f64),
    Field(usize),
    Neg(Box<EvalExpr>),
    Abs(Box<EvalExpr>),
    Add(Box<EvalExpr>, Box<EvalExpr>),
    Sub(Box<EvalExpr>, Box<EvalExpr>),
    Mul(Box<EvalExpr>, Box<EvalExpr>),
    Div(Box<EvalExpr>, Box<EvalExpr>),
}

impl EvalExpr {
    pub fn parse(input: &str) -> Result<Self, DbError> {
        let mut parser = ExprParser {
            input: input.as_bytes(),
            pos: 0,
        };
        let expr = parser.parse_expr()?;
        parser.skip_ws();
        if parser.pos != parser.input.len() {
            return Err(DbError::query_parsing(format!(
                "Trailing input in expression at byte {}",
                parser.pos
            )));
        }
        Ok(expr)
    }

    /// `None` when the expression references a missing field.
    pub fn eval(&self, fields: &[Value]) -> Option<Value> {
        Some(match self {
            EvalExpr::Const(c) => *c,
            EvalExpr::Field(i) => *fields.get(*i)?,
            EvalExpr::Neg(e) => -e.eval(fields)?,
            EvalExpr::Abs(e) => e.eval(fields)?.abs(),
            EvalExpr::Add(a, b) => a.eval(fields)? + b.eval(fields)?,
            EvalExpr::Sub(a, b) => a.eval(fields)? - b.eval(fields)?,
            EvalExpr::Mul(a, b) => a.eval(fields)? * b.eval(fields)?,
            EvalExpr::Div(a, b) => a.eval(fields)? / b.eval(fields)?,
        })
    }
}

struct ExprParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> ExprParser<'a> {
    fn skip_ws(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.input.get(self.pos).copied()
    }

    fn parse_expr(&mut self) -> Result<EvalExpr, DbError> {
        let mut lhs = self.parse_term()?;
        loop {
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    lhs = EvalExpr::Add(Box::new(lhs), Box::new(self.parse_term()?));
                }
                Some(b'-') => {
                    self.pos += 1;
                    lhs = EvalExpr::Sub(Box::new(lhs), Box::new(self.parse_term()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_term(&mut self) -> Result<EvalExpr, DbError> {
        let mut lhs = self.parse_factor()?;
        loop {
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    lhs = EvalExpr::Mul(Box::new(lhs), Box::new(self.parse_factor()?));
                }
                Some(b'/') => {
                    self.pos += 1;
                    lhs = EvalExpr::Div(Box::new(lhs), Box::new(self.parse_factor()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_factor(&mut self) -> Result<EvalExpr, DbError> {
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                Ok(EvalExpr::Neg(Box::new(self.parse_factor()?)))
            }
            Some(b'(') => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                if self.peek() != Some(b')') {
                    return Err(DbError::query_parsing("Expected ')' in expression"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(b'$') => {
                self.pos += 1;
                let start = self.pos;
                while self.pos < self.input.len() && self.input[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
                if start == self.pos {
                    return Err(DbError::query_parsing("Expected field index after '$'"));
                }
                let idx: usize = std::str::from_utf8(&self.input[start..self.pos])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| DbError::query_parsing("Bad field index"))?;
                Ok(EvalExpr::Field(idx))
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => {
                let start = self.pos;
                while self.pos < self.input.len()
                    && (self.input[self.pos].is_ascii_digit()
                        || self.input[self.pos] == b'.'
                        || self.input[self.pos] == b'e'
                        || self.input[self.pos] == b'E')
                {
                    self.pos += 1;
                }
                let text = std::str::from_utf8(&self.input[start..self.pos])
                    .map_err(|_| DbError::query_parsing("Bad number"))?;
                let value: f64 = text
                    .parse()
                    .map_err(|_| DbError::query_parsing(format!("Bad number '{}'", text)))?;
                Ok(EvalExpr::Const(value))
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let start = self.pos;
                while self.pos < self.input.len() && self.input[self.pos].is_ascii_alphabetic() {
                    self.pos += 1;
                }
                let word = std::str::from_utf8(&self.input[start..self.pos])
                    .map_err(|_| DbError::query_parsing("Bad identifier"))?;
                match word {
                    "value" => Ok(EvalExpr::Field(0)),
                    "abs" => {
                        if self.peek() != Some(b'(') {
                            return Err(DbError::query_parsing("Expected '(' after abs"));
                        }
                        self.pos += 1;
                        let inner = self.parse_expr()?;
                        if self.peek() != Some(b')') {
                            return Err(DbError::query_parsing("Expected ')' after abs"));
                        }
                        self.pos += 1;
                        Ok(EvalExpr::Abs(Box::new(inner)))
                    }
                    other => Err(DbError::query_parsing(format!(
                        "Unknown identifier '{}' in expression",
                        other
                    ))),
                }
            }
            _ => Err(DbError::query_parsing("Unexpected end of expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::{BlockStore, MemoryBlockStore};
    use crate::nbtree::NBTreeExtentsList;

    fn make_scan(id: SeriesId, ts_range: std::ops::Range<u64>) -> SeriesScan {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let mut tree = NBTreeExtentsList::new(id, Vec::new(), store);
        for ts in ts_range.clone() {
            tree.append(ts, (ts / 10) as f64).unwrap();
        }
        tree.search(ts_range.start, ts_range.end).unwrap()
    }

    fn drain(source: &mut dyn SampleSource) -> Vec<Sample> {
        let mut cursor = CollectingCursor::default();
        run_pipeline(source, &[], &mut cursor, &QueryCancelToken::new());
        assert!(cursor.completed, "{:?}", cursor.error);
        cursor.samples
    }

    #[test]
    fn time_order_merges_by_timestamp_then_id() {
        let scans = vec![make_scan(2000, 0..50), make_scan(1000, 0..50)];
        let mut source = ScanSource::flat(scans, OrderBy::Time, false);
        let samples = drain(&mut source);
        assert_eq!(samples.len(), 100);
        for pair in samples.windows(2) {
            assert!(
                pair[0].timestamp < pair[1].timestamp
                    || (pair[0].timestamp == pair[1].timestamp && pair[0].id < pair[1].id)
            );
        }
    }

    #[test]
    fn series_order_concatenates_groups() {
        let scans = vec![make_scan(1000, 0..30), make_scan(2000, 0..30)];
        let mut source = ScanSource::flat(scans, OrderBy::Series, false);
        let samples = drain(&mut source);
        assert_eq!(samples.len(), 60);
        assert!(samples[..30].iter().all(|s| s.id == 1000));
        assert!(samples[30..].iter().all(|s| s.id == 2000));
    }

    #[test]
    fn grouped_scans_share_output_id_and_merge() {
        let groups = vec![(7u64, vec![make_scan(1, 0..10), make_scan(2, 10..20)])];
        let mut source = ScanSource::new(groups, OrderBy::Series, false);
        let samples = drain(&mut source);
        assert_eq!(samples.len(), 20);
        assert!(samples.iter().all(|s| s.id == 7));
        assert!(samples.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn cancellation_reports_through_cursor() {
        let scans = vec![make_scan(1000, 0..10)];
        let mut source = ScanSource::flat(scans, OrderBy::Time, false);
        let token = QueryCancelToken::new();
        token.cancel();
        let mut cursor = CollectingCursor::default();
        run_pipeline(&mut source, &[], &mut cursor, &token);
        assert!(!cursor.completed);
        assert!(matches!(cursor.error, Some(DbError::Cancelled)));
    }

    #[test]
    fn backpressure_stops_pushes_but_completes() {
        struct OneShot {
            taken: usize,
        }
        impl InternalCursor for OneShot {
            fn put(&mut self, _s: Sample) -> bool {
                self.taken += 1;
                false
            }
            fn complete(&mut self) {}
            fn set_error(&mut self, _e: DbError) {
                panic!("unexpected error");
            }
        }
        let scans = vec![make_scan(1000, 0..100)];
        let mut source = ScanSource::flat(scans, OrderBy::Time, false);
        let mut cursor = OneShot { taken: 0 };
        run_pipeline(&mut source, &[], &mut cursor, &QueryCancelToken::new());
        assert_eq!(cursor.taken, 1);
    }

    #[test]
    fn absolute_stage_rewrites_values() {
        let mut sample = Sample::float(1, 1, -4.0);
        assert!(PipelineStage::Absolute.apply(&mut sample));
        assert_eq!(sample.scalar(), Some(4.0));
    }

    #[test]
    fn eval_expressions() {
        let expr = EvalExpr::parse("($0 + $1) / 2").unwrap();
        assert_eq!(expr.eval(&[4.0, 6.0]), Some(5.0));
        let expr = EvalExpr::parse("abs(value) * -3").unwrap();
        assert_eq!(expr.eval(&[-2.0]), Some(-6.0));
        assert!(EvalExpr::parse("$0 +").is_err());
        assert!(EvalExpr::parse("nope($0)").is_err());
        // Missing field drops the sample rather than inventing a value.
        assert_eq!(EvalExpr::parse("$3").unwrap().eval(&[1.0]), None);
    }

    #[test]
    fn join_aligns_buckets_and_clears_missing_bits() {
        let mut l0 = AggregationResult::default();
        l0.add(0, 1.0);
        let mut l1 = AggregationResult::default();
        l1.add(10, 2.0);
        let mut r0 = AggregationResult::default();
        r0.add(0, 3.0);
        let mut r2 = AggregationResult::default();
        r2.add(20, 4.0);
        let pairs = vec![(5u64, vec![(0, l0), (10, l1)], vec![(0, r0), (20, r2)])];
        let samples =
            join_samples(pairs, AggregateComponent::Max, OrderBy::Time, false).unwrap();
        assert_eq!(samples.len(), 3);
        match &samples[0].payload {
            Payload::Tuple { presence, values } => {
                assert_eq!(*presence, 0b11);
                assert_eq!(values, &vec![1.0, 3.0]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        match &samples[1].payload {
            Payload::Tuple { presence, values } => {
                assert_eq!(*presence, 0b01);
                assert_eq!(values[0], 2.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        match &samples[2].payload {
            Payload::Tuple { presence, .. } => assert_eq!(*presence, 0b10),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
