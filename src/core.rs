//! Engine runtime: database open/create, write sessions, the crash-recovery
//! driver and the background worker (deferred rescue-point publication and
//! idle-tree eviction).

use crate::blockstore::{
    BlockStore, ExpandableFileStorage, FixedSizeFileStorage, LogicAddr, MemoryBlockStore,
};
use crate::catalog::{
    MetadataCatalog, CONFIG_BLOCKSTORE_TYPE, CONFIG_CREATION_DATETIME, CONFIG_DB_NAME,
    CONFIG_STORAGE_VERSION,
};
use crate::column_store::{CStoreSession, ColumnStore};
use crate::error::DbError;
use crate::index::SeriesMatcher;
use crate::nbtree::AppendResult;
use crate::operators::QueryCancelToken;
use crate::plan::{execute_query, QueryOutput};
use crate::telemetry::{db_metrics, noop_event_listener, DbEvent, DbEventListener};
use crate::types::{Payload, Sample, SeriesId, Timestamp, Value};
use crate::wal::{read_input_log, InputLogConfig, LogRecord, ShardedInputLog};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const STORAGE_VERSION: &str = "1";

/// Which block-store backend the database runs on.
#[derive(Debug, Clone)]
pub enum BlockStoreKind {
    /// Volatile, for tests.
    Memory,
    /// Pre-allocated circular volume set.
    FixedSize { nvolumes: u32, capacity: u32 },
    /// Volumes appended on demand.
    Expandable { capacity: u32 },
}

impl BlockStoreKind {
    fn type_name(&self) -> &'static str {
        match self {
            BlockStoreKind::Memory => "Memory",
            BlockStoreKind::FixedSize { .. } => "FixedSizeFileStorage",
            BlockStoreKind::Expandable { .. } => "ExpandableFileStorage",
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_name: String,
    /// Directory holding the catalog, volumes and input log.
    pub data_dir: PathBuf,
    pub blockstore: BlockStoreKind,
    /// `None` disables the write-ahead input log entirely.
    pub input_log: Option<InputLogConfig>,
    /// Structured event hook (no-op by default).
    pub event_listener: Arc<dyn DbEventListener>,
}

impl EngineConfig {
    pub fn new<P: Into<PathBuf>>(db_name: &str, data_dir: P) -> Self {
        let data_dir = data_dir.into();
        let input_log = InputLogConfig::new(data_dir.join("inputlog"));
        EngineConfig {
            db_name: db_name.to_string(),
            data_dir,
            blockstore: BlockStoreKind::Expandable { capacity: 4096 },
            input_log: Some(input_log),
            event_listener: noop_event_listener(),
        }
    }

    pub fn without_input_log(mut self) -> Self {
        self.input_log = None;
        self
    }
}

enum WorkerCommand {
    Tick,
    Shutdown,
}

/// The standalone database engine.
#[derive(Debug)]
pub struct Database {
    catalog: MetadataCatalog,
    matcher: SeriesMatcher,
    cstore: Arc<ColumnStore>,
    input_log: Option<ShardedInputLog>,
    listener: Arc<dyn DbEventListener>,
    next_shard: AtomicUsize,
    /// Eviction clock: bumped once per eviction pass; writes stamp their
    /// series with the current value.
    generation: AtomicU64,
    last_touch: Mutex<HashMap<SeriesId, u64>>,
    worker: Mutex<Option<(mpsc::Sender<WorkerCommand>, JoinHandle<()>)>>,
}

impl Database {
    /// Creates a fresh database under `cfg.data_dir`.
    pub fn create(cfg: &EngineConfig) -> Result<Arc<Self>, DbError> {
        std::fs::create_dir_all(&cfg.data_dir)?;
        let catalog_path = cfg.data_dir.join("catalog.tsc");
        if catalog_path.exists() {
            return Err(DbError::BadArg(format!(
                "Database already exists at {:?}",
                catalog_path
            )));
        }
        let created = chrono::Utc::now().to_rfc3339();
        let catalog = MetadataCatalog::create(
            &catalog_path,
            &[
                (CONFIG_DB_NAME, &cfg.db_name),
                (CONFIG_CREATION_DATETIME, &created),
                (CONFIG_BLOCKSTORE_TYPE, cfg.blockstore.type_name()),
                (CONFIG_STORAGE_VERSION, STORAGE_VERSION),
            ],
        )?;
        let store = Self::create_blockstore(cfg)?;
        catalog.set_volumes(store.descriptors())?;
        catalog.sync()?;
        Self::assemble(cfg, catalog, store)
    }

    /// Opens an existing database and runs crash recovery.
    pub fn open(cfg: &EngineConfig) -> Result<Arc<Self>, DbError> {
        let catalog = MetadataCatalog::open(&cfg.data_dir.join("catalog.tsc"))?;
        let stored_kind = catalog.get_config(CONFIG_BLOCKSTORE_TYPE)?.unwrap_or_default();
        if stored_kind != cfg.blockstore.type_name() {
            return Err(DbError::BadArg(format!(
                "Database uses blockstore '{}', configuration says '{}'",
                stored_kind,
                cfg.blockstore.type_name()
            )));
        }
        let store = Self::open_blockstore(cfg, &catalog)?;
        let db = Self::assemble(cfg, catalog, store)?;
        db.run_recovery()?;
        Ok(db)
    }

    pub fn open_or_create(cfg: &EngineConfig) -> Result<Arc<Self>, DbError> {
        if cfg.data_dir.join("catalog.tsc").exists() {
            Self::open(cfg)
        } else {
            Self::create(cfg)
        }
    }

    fn create_blockstore(cfg: &EngineConfig) -> Result<Arc<dyn BlockStore>, DbError> {
        Ok(match cfg.blockstore {
            BlockStoreKind::Memory => Arc::new(MemoryBlockStore::new()),
            BlockStoreKind::FixedSize { nvolumes, capacity } => {
                let (store, _descs) =
                    FixedSizeFileStorage::create(&cfg.data_dir.join("volumes"), nvolumes, capacity)?;
                Arc::new(store)
            }
            BlockStoreKind::Expandable { capacity } => Arc::new(ExpandableFileStorage::create(
                &cfg.data_dir.join("volumes"),
                capacity,
            )?),
        })
    }

    fn open_blockstore(
        cfg: &EngineConfig,
        catalog: &MetadataCatalog,
    ) -> Result<Arc<dyn BlockStore>, DbError> {
        let descriptors = catalog.volumes()?;
        Ok(match cfg.blockstore {
            BlockStoreKind::Memory => Arc::new(MemoryBlockStore::new()),
            BlockStoreKind::FixedSize { .. } => Arc::new(FixedSizeFileStorage::open(&descriptors)?),
            BlockStoreKind::Expandable { .. } => Arc::new(ExpandableFileStorage::open(&descriptors)?),
        })
    }

    fn assemble(
        cfg: &EngineConfig,
        catalog: MetadataCatalog,
        store: Arc<dyn BlockStore>,
    ) -> Result<Arc<Self>, DbError> {
        let input_log = cfg
            .input_log
            .as_ref()
            .map(ShardedInputLog::open)
            .transpose()?;
        Ok(Arc::new(Database {
            catalog,
            matcher: SeriesMatcher::default(),
            cstore: Arc::new(ColumnStore::new(store)),
            input_log,
            listener: Arc::clone(&cfg.event_listener),
            next_shard: AtomicUsize::new(0),
            generation: AtomicU64::new(1),
            last_touch: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
        }))
    }

    // --- Recovery driver --- //

    /// Restores columns from catalog rescue points, replays the input log,
    /// republishes rescue points and clears the log.
    fn run_recovery(&self) -> Result<(), DbError> {
        // Re-register the series mirror first so names resolve during replay.
        for (id, name) in self.catalog.series()? {
            self.matcher.register(&name, id)?;
        }
        let mapping: HashMap<SeriesId, Vec<LogicAddr>> = self
            .catalog
            .rescue_points()?
            .into_iter()
            .map(|(id, addrs)| (id, addrs.into_iter().map(LogicAddr).collect()))
            .collect();
        let ids_to_repair = self.cstore.open_or_restore(&mapping, false)?;
        self.listener.on_event(DbEvent::RecoveryStarted {
            ids_to_repair: ids_to_repair.len(),
        });

        let mut replayed: u64 = 0;
        if self.input_log.is_some() {
            for volume in read_input_log(&self.input_log_dir()?)? {
                if volume.truncated {
                    self.listener.on_event(DbEvent::WalVolumeTruncated {
                        shard: volume.shard,
                        seq: volume.seq,
                    });
                }
                for record in volume.records {
                    replayed += 1;
                    match record {
                        LogRecord::SeriesName { id, name } => {
                            self.matcher.register(&name, id)?;
                            self.catalog.register_series([(id, name.as_str())])?;
                            if !self.cstore.has_column(id) {
                                self.cstore.create_new_column(id)?;
                            }
                        }
                        LogRecord::Data {
                            id,
                            timestamp,
                            value,
                        } => {
                            self.replay_sample(Sample::float(id, timestamp, value))?;
                        }
                        LogRecord::Event {
                            id,
                            timestamp,
                            body,
                        } => {
                            self.replay_sample(Sample::event(id, timestamp, body))?;
                        }
                    }
                }
            }
        }

        // Samples first, then rescue points: the republished roots must cover
        // everything the replay sealed.
        let ids = self.cstore.initialized_ids()?;
        self.publish_rescue_points(&ids)?;
        self.catalog.sync()?;
        if let Some(log) = &self.input_log {
            log.clear()?;
        }
        db_metrics::record_recovery_replayed(replayed);
        self.listener.on_event(DbEvent::RecoveryCompleted {
            replayed_records: replayed,
        });
        Ok(())
    }

    fn replay_sample(&self, sample: Sample) -> Result<(), DbError> {
        if !self.cstore.has_column(sample.id) {
            self.cstore.create_new_column(sample.id)?;
        }
        self.cstore.recovery_write(&sample, true)?;
        Ok(())
    }

    fn input_log_dir(&self) -> Result<PathBuf, DbError> {
        // The log remembers its own directory via config; reconstruct from the
        // open shards' path.
        self.input_log
            .as_ref()
            .map(|log| log.dir().to_path_buf())
            .ok_or_else(|| DbError::Internal("Input log is disabled".to_string()))
    }

    // --- Accessors --- //

    pub fn matcher(&self) -> &SeriesMatcher {
        &self.matcher
    }

    pub fn column_store(&self) -> &Arc<ColumnStore> {
        &self.cstore
    }

    pub fn catalog(&self) -> &MetadataCatalog {
        &self.catalog
    }

    // --- Sessions and queries --- //

    pub fn session(self: &Arc<Self>) -> Session {
        let shard_idx = self.next_shard.fetch_add(1, Ordering::Relaxed);
        Session {
            db: Arc::clone(self),
            cstore_session: CStoreSession::new(Arc::clone(&self.cstore)),
            shard_idx,
            rescue_points: Vec::new(),
        }
    }

    pub fn execute_query(&self, json: &str) -> Result<QueryOutput, DbError> {
        self.execute_query_with_cancel(json, &QueryCancelToken::new())
    }

    pub fn execute_query_with_cancel(
        &self,
        json: &str,
        cancel: &QueryCancelToken,
    ) -> Result<QueryOutput, DbError> {
        let started = std::time::Instant::now();
        let out = execute_query(json, &self.cstore, &self.matcher, cancel);
        db_metrics::record_query_duration(started.elapsed());
        out
    }

    // --- Flush barrier, eviction, worker --- //

    fn publish_rescue_points(&self, ids: &[SeriesId]) -> Result<(), DbError> {
        let points = self.cstore.rescue_points_of(ids)?;
        let count = points.len() as u64;
        for (id, roots) in points {
            self.catalog
                .update_rescue_points(id, roots.into_iter().map(|a| a.0).collect())?;
        }
        if count > 0 {
            self.listener
                .on_event(DbEvent::RescuePointsPublished { series: count });
        }
        Ok(())
    }

    /// Flush barrier: input-log frames hit disk, rescue points and volume
    /// descriptors are republished, the catalog is synced. After `sync`
    /// returns, every prior write is recoverable.
    pub fn sync(&self) -> Result<(), DbError> {
        if let Some(log) = &self.input_log {
            log.flush_all()?;
        }
        let ids = self.cstore.initialized_ids()?;
        self.publish_rescue_points(&ids)?;
        self.catalog
            .set_volumes(self.cstore.blockstore().descriptors())?;
        self.catalog.sync()
    }

    /// Closes trees that saw no write since the previous eviction pass,
    /// sealing their tails into the block store and publishing final rescue
    /// points. Gated on the input log: without durable samples in the log,
    /// dropping hot tails would widen the crash window, so trees stay
    /// resident. Returns the number of evicted trees.
    pub fn evict_inactive(&self) -> Result<usize, DbError> {
        if self.input_log.is_none() {
            return Ok(0);
        }
        let pass = self.generation.fetch_add(1, Ordering::SeqCst);
        let idle: Vec<SeriesId> = {
            let touch = self.last_touch.lock()?;
            self.cstore
                .initialized_ids()?
                .into_iter()
                .filter(|id| touch.get(id).copied().unwrap_or(0) < pass)
                .collect()
        };
        if idle.is_empty() {
            return Ok(0);
        }
        let closed = self.cstore.close_ids(&idle)?;
        let count = closed.len();
        for (id, roots) in closed {
            self.catalog
                .update_rescue_points(id, roots.into_iter().map(|a| a.0).collect())?;
        }
        self.catalog.sync()?;
        db_metrics::record_trees_evicted(count as u64);
        self.listener.on_event(DbEvent::TreesEvicted { count });
        Ok(count)
    }

    fn touch(&self, id: SeriesId) {
        let gen = self.generation.load(Ordering::SeqCst);
        if let Ok(mut touch) = self.last_touch.lock() {
            touch.insert(id, gen);
        }
    }

    /// Spawns the background worker: periodic eviction pass and catalog sync.
    /// Idempotent; the worker stops on `close` or drop.
    pub fn start_worker(self: &Arc<Self>, interval: Duration) -> Result<(), DbError> {
        let mut guard = self.worker.lock()?;
        if guard.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel::<WorkerCommand>();
        let db = Arc::clone(self);
        let listener = Arc::clone(&self.listener);
        let handle = thread::spawn(move || {
            listener.on_event(DbEvent::WorkerThreadStarted);
            loop {
                match rx.recv_timeout(interval) {
                    Ok(WorkerCommand::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                        listener.on_event(DbEvent::WorkerThreadStopping);
                        break;
                    }
                    Ok(WorkerCommand::Tick) | Err(mpsc::RecvTimeoutError::Timeout) => {
                        if let Err(e) = db.evict_inactive() {
                            listener.on_event(DbEvent::EvictionFailed {
                                error: e.to_string(),
                            });
                        }
                        if let Err(e) = db.sync() {
                            listener.on_event(DbEvent::CatalogSyncFailed {
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
        });
        *guard = Some((tx, handle));
        Ok(())
    }

    /// Forces one worker pass now (no-op when the worker is not running).
    pub fn kick_worker(&self) -> Result<(), DbError> {
        if let Some((tx, _)) = self.worker.lock()?.as_ref() {
            let _ = tx.send(WorkerCommand::Tick);
        }
        Ok(())
    }

    /// Clean shutdown: stops the worker, quiesces every column, publishes
    /// final rescue points, syncs the catalog and clears the input log.
    pub fn close(&self) -> Result<(), DbError> {
        if let Some((tx, handle)) = self.worker.lock()?.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
            let _ = handle.join();
        }
        let mapping = self.cstore.close()?;
        for (id, roots) in mapping {
            self.catalog
                .update_rescue_points(id, roots.into_iter().map(|a| a.0).collect())?;
        }
        self.catalog
            .set_volumes(self.cstore.blockstore().descriptors())?;
        self.catalog.sync()?;
        if let Some(log) = &self.input_log {
            // Everything is durable in the block store now; the log can go.
            log.close()?;
            log.clear()?;
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.worker.lock() {
            if let Some((tx, handle)) = guard.take() {
                let _ = tx.send(WorkerCommand::Shutdown);
                let _ = handle.join();
            }
        }
    }
}

/// Write session: per-writer tree cache plus one input-log shard. Not
/// thread-safe; create one per writer thread.
#[derive(Debug)]
pub struct Session {
    db: Arc<Database>,
    cstore_session: CStoreSession,
    shard_idx: usize,
    rescue_points: Vec<LogicAddr>,
}

impl Session {
    /// Canonicalizes and registers a series name, creating its column and
    /// mirroring the name into the catalog and this session's log shard.
    pub fn series_to_id(&mut self, raw: &str) -> Result<SeriesId, DbError> {
        let id = self.db.matcher.add(raw)?;
        if !self.db.cstore.has_column(id) {
            // Benign race: another session can create the column between the
            // check and the insert.
            match self.db.cstore.create_new_column(id) {
                Ok(()) | Err(DbError::BadArg(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let new_names = self.db.matcher.pull_new_series()?;
        if !new_names.is_empty() {
            self.db
                .catalog
                .register_series(new_names.iter().map(|(id, n)| (*id, n.as_ref())))?;
        }
        if let Some(log) = &self.db.input_log {
            let shard = log.shard(self.shard_idx);
            let mut guard = shard.lock()?;
            if !guard.is_declared(id) {
                let name = self
                    .db
                    .matcher
                    .id2str(id)?
                    .ok_or_else(|| DbError::Internal("Freshly added name vanished".to_string()))?;
                guard.append(&LogRecord::SeriesName {
                    id,
                    name: name.to_string(),
                })?;
            }
        }
        Ok(id)
    }

    /// Resolves the compound `m1|m2|... tags` form, registering every member.
    pub fn series_to_id_list(&mut self, raw: &str) -> Result<Vec<SeriesId>, DbError> {
        crate::index::split_compound_name(raw)?
            .iter()
            .map(|name| self.series_to_id(name))
            .collect()
    }

    /// Appends one sample: input log first, then the column store. On a
    /// sealed block the fresh rescue point is pushed to the catalog.
    pub fn write_sample(&mut self, sample: &Sample) -> Result<AppendResult, DbError> {
        if let Some(log) = &self.db.input_log {
            let shard = log.shard(self.shard_idx);
            let mut guard = shard.lock()?;
            let before = guard.bytes_written();
            match &sample.payload {
                Payload::Float(v) => guard.append(&LogRecord::Data {
                    id: sample.id,
                    timestamp: sample.timestamp,
                    value: *v,
                })?,
                Payload::Event(body) => guard.append(&LogRecord::Event {
                    id: sample.id,
                    timestamp: sample.timestamp,
                    body: body.clone(),
                })?,
                Payload::Tuple { .. } => {
                    return Err(DbError::BadArg(
                        "Tuple payloads are query results, not writable samples".to_string(),
                    ))
                }
            }
            db_metrics::record_wal_bytes(guard.bytes_written() - before);
        }
        self.rescue_points.clear();
        let result = self.cstore_session.write(sample, &mut self.rescue_points)?;
        match result {
            AppendResult::Ok => {
                self.db.touch(sample.id);
                db_metrics::record_write();
            }
            AppendResult::OkFlushNeeded => {
                self.db.touch(sample.id);
                db_metrics::record_write();
                db_metrics::record_blocks_written(1);
                self.db.catalog.update_rescue_points(
                    sample.id,
                    self.rescue_points.iter().map(|a| a.0).collect(),
                )?;
            }
            AppendResult::LateWrite | AppendResult::UnknownSeries => {}
        }
        Ok(result)
    }

    /// Convenience write: resolves the name and appends a float sample. Late
    /// writes surface as `BadData`.
    pub fn write(&mut self, raw: &str, ts: Timestamp, value: Value) -> Result<SeriesId, DbError> {
        let id = self.series_to_id(raw)?;
        match self.write_sample(&Sample::float(id, ts, value))? {
            AppendResult::Ok | AppendResult::OkFlushNeeded => Ok(id),
            AppendResult::LateWrite => Err(DbError::BadData(format!(
                "Timestamp {} is below the series maximum",
                ts
            ))),
            AppendResult::UnknownSeries => {
                Err(DbError::NotFound(format!("No column for series {}", id)))
            }
        }
    }

    /// Convenience write for event payloads.
    pub fn write_event(
        &mut self,
        raw: &str,
        ts: Timestamp,
        body: &[u8],
    ) -> Result<SeriesId, DbError> {
        let id = self.series_to_id(raw)?;
        match self.write_sample(&Sample::event(id, ts, body.to_vec()))? {
            AppendResult::Ok | AppendResult::OkFlushNeeded => Ok(id),
            AppendResult::LateWrite => Err(DbError::BadData(format!(
                "Timestamp {} is below the series maximum",
                ts
            ))),
            AppendResult::UnknownSeries => {
                Err(DbError::NotFound(format!("No column for series {}", id)))
            }
        }
    }

    /// Flushes this session's input-log shard and releases cached tree
    /// handles.
    pub fn close(&mut self) -> Result<(), DbError> {
        if let Some(log) = &self.db.input_log {
            log.shard(self.shard_idx).lock()?.flush_frame()?;
        }
        self.cstore_session.close();
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> EngineConfig {
        let mut cfg = EngineConfig::new("testdb", dir);
        cfg.blockstore = BlockStoreKind::Expandable { capacity: 1024 };
        cfg
    }

    #[test]
    fn create_write_query_round_trip() {
        let dir = tempdir().unwrap();
        let db = Database::create(&config(dir.path())).unwrap();
        let mut session = db.session();
        for ts in 100..200u64 {
            session.write("cpu host=a", ts, ts as f64).unwrap();
        }
        let out = db
            .execute_query(r#"{"select": "cpu", "range": {"from": 100, "to": 200}}"#)
            .unwrap();
        assert_eq!(out.samples.len(), 100);
        let name = out
            .series_name(out.samples[0].id, db.matcher())
            .unwrap()
            .unwrap();
        assert_eq!(name, "cpu host=a");
        db.close().unwrap();
    }

    #[test]
    fn same_name_two_sessions_same_id() {
        let dir = tempdir().unwrap();
        let db = Database::create(&config(dir.path())).unwrap();
        let mut s1 = db.session();
        let mut s2 = db.session();
        let a = s1.write("hello world=1", 1, 1.0).unwrap();
        let b = s2.write("hello world=1", 2, 2.0).unwrap();
        assert_eq!(a, b);
        db.close().unwrap();
    }

    #[test]
    fn late_write_is_bad_data() {
        let dir = tempdir().unwrap();
        let db = Database::create(&config(dir.path())).unwrap();
        let mut session = db.session();
        session.write("m a=1", 100, 1.0).unwrap();
        assert!(matches!(
            session.write("m a=1", 10, 1.0),
            Err(DbError::BadData(_))
        ));
        db.close().unwrap();
    }

    #[test]
    fn open_missing_database_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Database::open(&config(dir.path())),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn create_twice_is_bad_arg() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let db = Database::create(&cfg).unwrap();
        db.close().unwrap();
        drop(db);
        assert!(matches!(Database::create(&cfg), Err(DbError::BadArg(_))));
    }

    #[test]
    fn clean_shutdown_then_reopen_preserves_data_and_ids() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let id = {
            let db = Database::create(&cfg).unwrap();
            let mut session = db.session();
            let id = session.write("cpu host=a", 1, 10.0).unwrap();
            for ts in 2..500u64 {
                session.write("cpu host=a", ts, ts as f64).unwrap();
            }
            session.close().unwrap();
            db.close().unwrap();
            id
        };
        let db = Database::open(&cfg).unwrap();
        assert_eq!(db.matcher().match_name("cpu host=a").unwrap(), Some(id));
        let out = db
            .execute_query(r#"{"select": "cpu", "range": {"from": 0, "to": 1000}}"#)
            .unwrap();
        assert_eq!(out.samples.len(), 499);
        db.close().unwrap();
    }

    #[test]
    fn eviction_is_gated_on_the_input_log() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path()).without_input_log();
        let db = Database::create(&cfg).unwrap();
        let mut session = db.session();
        session.write("m a=1", 1, 1.0).unwrap();
        assert_eq!(db.evict_inactive().unwrap(), 0);
        db.close().unwrap();
    }

    #[test]
    fn eviction_closes_idle_trees_and_data_survives() {
        let dir = tempdir().unwrap();
        let db = Database::create(&config(dir.path())).unwrap();
        let mut session = db.session();
        for i in 0..10 {
            session.write(&format!("m key={}", i), 1, 1.0).unwrap();
        }
        // First pass defines the idle window, second one evicts.
        db.evict_inactive().unwrap();
        let evicted = db.evict_inactive().unwrap();
        assert_eq!(evicted, 10);
        // Evicted trees reopen transparently on access.
        let out = db.execute_query(r#"{"select": "m"}"#).unwrap();
        assert_eq!(out.samples.len(), 10);
        // And accept further writes.
        session.write("m key=0", 2, 2.0).unwrap();
        db.close().unwrap();
    }
}
