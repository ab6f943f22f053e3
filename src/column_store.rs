//! Owning table from series id to its extents list. The map lock is held only
//! across lookup and insert; every tree carries its own lock for appends, so
//! writers on different series never contend.

use crate::blockstore::{BlockStore, LogicAddr};
use crate::error::DbError;
use crate::nbtree::{
    AppendResult, EventScan, NBTreeExtentsList, RepairStatus, SeriesScan,
};
use crate::types::{
    AggregateFilter, AggregationResult, Payload, Sample, SeriesId, Timestamp, ValueFilter,
};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

type TreeHandle = Arc<Mutex<NBTreeExtentsList>>;

/// Session-local cache of tree handles. Weak references: an evicted or closed
/// column falls back to a map lookup instead of pinning the tree alive.
pub type TreeCache = HashMap<SeriesId, Weak<Mutex<NBTreeExtentsList>>>;

#[derive(Debug)]
pub struct ColumnStore {
    store: Arc<dyn BlockStore>,
    columns: Mutex<HashMap<SeriesId, TreeHandle>>,
}

impl ColumnStore {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        ColumnStore {
            store,
            columns: Mutex::new(HashMap::new()),
        }
    }

    pub fn blockstore(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Instantiates a column per rescue-point mapping entry and reports the
    /// ids whose trees need WAL repair. With `force_init` every tree is
    /// restored eagerly; otherwise restoration happens on first access.
    pub fn open_or_restore(
        &self,
        mapping: &HashMap<SeriesId, Vec<LogicAddr>>,
        force_init: bool,
    ) -> Result<Vec<SeriesId>, DbError> {
        let mut ids2repair = Vec::new();
        for (&id, rescue_points) in mapping {
            let status = NBTreeExtentsList::repair_status(rescue_points, self.store.as_ref());
            let mut tree =
                NBTreeExtentsList::new(id, rescue_points.clone(), Arc::clone(&self.store));
            if force_init || status == RepairStatus::Repair {
                tree.force_init()?;
            }
            {
                let mut columns = self.columns.lock()?;
                if columns.contains_key(&id) {
                    return Err(DbError::BadArg(format!(
                        "Column {} already exists, cannot restore",
                        id
                    )));
                }
                columns.insert(id, Arc::new(Mutex::new(tree)));
            }
            if status == RepairStatus::Repair {
                ids2repair.push(id);
            }
        }
        ids2repair.sort_unstable();
        Ok(ids2repair)
    }

    /// Creates a fresh column; `BadArg` when the id is already present.
    pub fn create_new_column(&self, id: SeriesId) -> Result<(), DbError> {
        let mut columns = self.columns.lock()?;
        if columns.contains_key(&id) {
            return Err(DbError::BadArg(format!("Column {} already exists", id)));
        }
        let tree = NBTreeExtentsList::new(id, Vec::new(), Arc::clone(&self.store));
        columns.insert(id, Arc::new(Mutex::new(tree)));
        Ok(())
    }

    pub fn has_column(&self, id: SeriesId) -> bool {
        self.columns.lock().map(|c| c.contains_key(&id)).unwrap_or(false)
    }

    fn lookup(&self, id: SeriesId) -> Result<Option<TreeHandle>, DbError> {
        Ok(self.columns.lock()?.get(&id).cloned())
    }

    /// Appends a sample. On `OkFlushNeeded` the fresh rescue point is left in
    /// `rescue_points`; when a cache is supplied the tree handle is published
    /// to it so the session's next write skips the map lock.
    pub fn write(
        &self,
        sample: &Sample,
        rescue_points: &mut Vec<LogicAddr>,
        cache: Option<&mut TreeCache>,
    ) -> Result<AppendResult, DbError> {
        let Some(tree) = self.lookup(sample.id)? else {
            return Ok(AppendResult::UnknownSeries);
        };
        let result = append_to_tree(&tree, sample, false)?;
        if result == AppendResult::OkFlushNeeded {
            *rescue_points = tree.lock()?.get_roots();
        }
        if let Some(cache) = cache {
            cache.insert(sample.id, Arc::downgrade(&tree));
        }
        Ok(result)
    }

    /// Replay-path append: late and duplicate timestamps are swallowed so the
    /// same log can be replayed more than once.
    pub fn recovery_write(
        &self,
        sample: &Sample,
        allow_duplicates: bool,
    ) -> Result<AppendResult, DbError> {
        let Some(tree) = self.lookup(sample.id)? else {
            return Ok(AppendResult::UnknownSeries);
        };
        append_to_tree(&tree, sample, allow_duplicates)
    }

    // --- Per-id operator construction --- //

    fn with_trees<T>(
        &self,
        ids: &[SeriesId],
        mut f: impl FnMut(&mut NBTreeExtentsList) -> Result<T, DbError>,
    ) -> Result<Vec<T>, DbError> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            let tree = self
                .lookup(id)?
                .ok_or_else(|| DbError::NotFound(format!("Column {} not found", id)))?;
            let mut guard = tree.lock()?;
            out.push(f(&mut guard)?);
        }
        Ok(out)
    }

    /// One scan operator per id, in the order given.
    pub fn scan(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<SeriesScan>, DbError> {
        self.with_trees(ids, |tree| tree.search(begin, end))
    }

    /// Scan with per-id value filters; ids without an enabled filter scan
    /// unfiltered.
    pub fn filter(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        filters: &HashMap<SeriesId, ValueFilter>,
    ) -> Result<Vec<SeriesScan>, DbError> {
        self.with_trees(ids, |tree| match filters.get(&tree.get_id()) {
            Some(f) if f.is_enabled() => tree.filter(begin, end, *f),
            _ => tree.search(begin, end),
        })
    }

    /// Aggregates decode whole block ranges, so the per-id work fans out
    /// across the rayon pool; result order follows `ids`.
    pub fn aggregate(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<AggregationResult>, DbError> {
        let trees = self.collect_trees(ids)?;
        trees
            .par_iter()
            .map(|tree| tree.lock()?.aggregate(begin, end))
            .collect()
    }

    pub fn group_aggregate(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        step: Timestamp,
    ) -> Result<Vec<Vec<(Timestamp, AggregationResult)>>, DbError> {
        let trees = self.collect_trees(ids)?;
        trees
            .par_iter()
            .map(|tree| tree.lock()?.group_aggregate(begin, end, step))
            .collect()
    }

    fn collect_trees(&self, ids: &[SeriesId]) -> Result<Vec<TreeHandle>, DbError> {
        ids.iter()
            .map(|&id| {
                self.lookup(id)?
                    .ok_or_else(|| DbError::NotFound(format!("Column {} not found", id)))
            })
            .collect()
    }

    pub fn group_aggfilter(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        step: Timestamp,
        filters: &HashMap<SeriesId, AggregateFilter>,
    ) -> Result<Vec<Vec<(Timestamp, AggregationResult)>>, DbError> {
        self.with_trees(ids, |tree| match filters.get(&tree.get_id()) {
            Some(f) => tree.group_aggregate_filter(begin, end, step, *f),
            None => tree.group_aggregate(begin, end, step),
        })
    }

    pub fn scan_events(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<EventScan>, DbError> {
        self.with_trees(ids, |tree| tree.search_events(begin, end))
    }

    pub fn filter_events(
        &self,
        ids: &[SeriesId],
        begin: Timestamp,
        end: Timestamp,
        body_regex: &str,
    ) -> Result<Vec<EventScan>, DbError> {
        self.with_trees(ids, |tree| tree.filter_events(begin, end, body_regex))
    }

    /// Total bytes buffered in unsealed leaves across all columns.
    pub fn uncommitted_memory(&self) -> Result<usize, DbError> {
        let handles: Vec<TreeHandle> = self.columns.lock()?.values().cloned().collect();
        let mut total = 0;
        for tree in handles {
            let guard = tree.lock()?;
            if guard.is_initialized() {
                total += guard.uncommitted_size();
            }
        }
        Ok(total)
    }

    /// Quiesces every initialized column, returning the final rescue-point
    /// mapping for the metadata catalog.
    pub fn close(&self) -> Result<HashMap<SeriesId, Vec<LogicAddr>>, DbError> {
        let handles: Vec<(SeriesId, TreeHandle)> = self
            .columns
            .lock()?
            .iter()
            .map(|(id, t)| (*id, Arc::clone(t)))
            .collect();
        let mut result = HashMap::with_capacity(handles.len());
        for (id, tree) in handles {
            let mut guard = tree.lock()?;
            if guard.is_initialized() {
                result.insert(id, guard.close()?);
            }
        }
        Ok(result)
    }

    /// Closes only the listed columns (used by idle-tree eviction).
    pub fn close_ids(&self, ids: &[SeriesId]) -> Result<HashMap<SeriesId, Vec<LogicAddr>>, DbError> {
        let mut result = HashMap::with_capacity(ids.len());
        for &id in ids {
            let Some(tree) = self.lookup(id)? else { continue };
            let mut guard = tree.lock()?;
            if guard.is_initialized() {
                result.insert(id, guard.close()?);
            }
        }
        Ok(result)
    }

    /// Current rescue points of the listed columns, without closing them.
    pub fn rescue_points_of(
        &self,
        ids: &[SeriesId],
    ) -> Result<HashMap<SeriesId, Vec<LogicAddr>>, DbError> {
        let mut out = HashMap::with_capacity(ids.len());
        for &id in ids {
            let Some(tree) = self.lookup(id)? else { continue };
            let guard = tree.lock()?;
            if guard.is_initialized() {
                out.insert(id, guard.get_roots());
            }
        }
        Ok(out)
    }

    /// Ids of all initialized columns.
    pub fn initialized_ids(&self) -> Result<Vec<SeriesId>, DbError> {
        let handles: Vec<(SeriesId, TreeHandle)> = self
            .columns
            .lock()?
            .iter()
            .map(|(id, t)| (*id, Arc::clone(t)))
            .collect();
        let mut out = Vec::new();
        for (id, tree) in handles {
            if tree.lock()?.is_initialized() {
                out.push(id);
            }
        }
        out.sort_unstable();
        Ok(out)
    }
}

fn append_to_tree(
    tree: &TreeHandle,
    sample: &Sample,
    allow_duplicates: bool,
) -> Result<AppendResult, DbError> {
    let mut guard = tree.lock()?;
    match &sample.payload {
        Payload::Float(v) => {
            if allow_duplicates {
                guard.append_allow_duplicates(sample.timestamp, *v)
            } else {
                guard.append(sample.timestamp, *v)
            }
        }
        Payload::Event(body) => {
            if allow_duplicates {
                guard.append_event_allow_duplicates(sample.timestamp, body)
            } else {
                guard.append_event(sample.timestamp, body)
            }
        }
        Payload::Tuple { .. } => Err(DbError::BadArg(
            "Tuple payloads are query results, not writable samples".to_string(),
        )),
    }
}

/// Per-writer dispatch wrapper. Holds the session tree cache so repeat writes
/// to hot series bypass the column-store map lock. Not thread-safe; create one
/// per writer thread.
#[derive(Debug)]
pub struct CStoreSession {
    cstore: Arc<ColumnStore>,
    cache: TreeCache,
}

impl CStoreSession {
    pub fn new(cstore: Arc<ColumnStore>) -> Self {
        CStoreSession {
            cstore,
            cache: TreeCache::new(),
        }
    }

    pub fn write(
        &mut self,
        sample: &Sample,
        rescue_points: &mut Vec<LogicAddr>,
    ) -> Result<AppendResult, DbError> {
        let cached = self.cache.get(&sample.id).and_then(Weak::upgrade);
        if let Some(tree) = cached {
            let result = append_to_tree(&tree, sample, false)?;
            if result == AppendResult::OkFlushNeeded {
                *rescue_points = tree.lock()?.get_roots();
            }
            return Ok(result);
        }
        // An expired handle means the column went away; fall back to the map.
        self.cache.remove(&sample.id);
        self.cstore.write(sample, rescue_points, Some(&mut self.cache))
    }

    pub fn close(&mut self) {
        self.cache.clear();
    }
}
