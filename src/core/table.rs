use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use crate::analysis::tokenizer::{StandardTokenizer, Tokenizer};
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::types::{DocId, DocInfo, Document};
use crate::index::partition::Partition;
use crate::schema::schema::{validate_name, FieldKind, FieldSummary, StoredValue};
use crate::search::filter::{CompiledFilter, Filter};
use crate::search::query::{Query, TermClause};
use crate::storage::bitmap::Bitmap;
use crate::storage::file_lock::FileLock;
use crate::storage::kv_store::KvStore;
use crate::storage::layout::{read_json, remove_partition_files, write_json_atomic, TableLayout};
use crate::storage::merge_policy::{MergePolicy, PartitionStat};

const PK_COMPACT_MIN_RECORDS: u64 = 4096;

/// Key-store tree mapping the doc id of an unsealed rewrite to the doc id it
/// replaced. `#` keeps it apart from field names.
const REWRITES_TREE: &str = "#rewrites";

/// `<table>.meta`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub start_doc_id: DocId,
    pub next_doc_id: DocId,
    pub partition_names: Vec<String>,
    pub primary_key_field: String,
    pub fields: Vec<FieldSummary>,
    #[serde(default)]
    pub prefix_segment_counter: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Rows ever assigned an id, deleted ones included.
    pub doc_count: u64,
    pub deleted_count: u64,
    pub partition_count: usize,
    pub mem_doc_count: u64,
}

/// Ordered sealed partitions plus one in-memory partition taking appends, a
/// primary-key store and a deletion bitmap.
///
/// All mutations take the state lock exclusively; reads share it. Merges build
/// the new partition outside the lock and only swap it in under the write lock.
pub struct Table {
    layout: TableLayout,
    config: Config,
    tokenizer: Arc<dyn Tokenizer>,
    policy: Box<dyn MergePolicy>,
    state: RwLock<TableState>,
    merge_lock: Mutex<()>,
    _lock: FileLock,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("layout", &self.layout).finish_non_exhaustive()
    }
}

struct TableState {
    meta: TableMeta,
    partitions: Vec<Arc<Partition>>,
    mem: Option<Partition>,
    pk_store: KvStore,
    deleted: Bitmap,
}

impl Table {
    pub fn create(dir: PathBuf, name: &str, primary_key: &str, fields: &[FieldSummary], config: &Config) -> Result<Self> {
        Self::create_with_tokenizer(dir, name, primary_key, fields, config, Arc::new(StandardTokenizer::default()))
    }

    pub fn create_with_tokenizer(
        dir: PathBuf,
        name: &str,
        primary_key: &str,
        fields: &[FieldSummary],
        config: &Config,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<Self> {
        validate_name("table", name)?;
        let fields = build_schema(primary_key, fields)?;

        let layout = TableLayout::new(dir, name);
        layout.create_dir()?;
        let lock = FileLock::acquire(&layout.lock_path())?;
        if layout.meta_path().exists() {
            return Err(Error::already_exists("table", name));
        }

        let pk_path = layout.pk_store_path();
        if pk_path.exists() {
            std::fs::remove_file(&pk_path)?;
        }
        let pk_store = KvStore::open(&pk_path, config.kv_sync_mode)?;
        pk_store.add_tree(primary_key)?;
        pk_store.add_tree(REWRITES_TREE)?;
        let deleted = Bitmap::create(layout.bitmap_path(), config.deletion_bitmap_bits)?;

        let meta = TableMeta {
            name: name.to_string(),
            start_doc_id: 0,
            next_doc_id: 0,
            partition_names: Vec::new(),
            primary_key_field: primary_key.to_string(),
            fields,
            prefix_segment_counter: 0,
        };
        write_json_atomic(&layout.meta_path(), &meta)?;
        log::info!("created table {} in {}", name, layout.dir.display());

        Ok(Self::assemble(layout, config, tokenizer, lock, meta, Vec::new(), pk_store, deleted))
    }

    pub fn open(dir: PathBuf, name: &str, config: &Config) -> Result<Self> {
        Self::open_with_tokenizer(dir, name, config, Arc::new(StandardTokenizer::default()))
    }

    /// Load a table. Partition files not listed in the meta are removed, and
    /// primary keys or deletion marks of rows that never reached a sealed
    /// partition are dropped. A key whose unsealed row rewrote a sealed one
    /// points back at the sealed row, which is live again.
    pub fn open_with_tokenizer(dir: PathBuf, name: &str, config: &Config, tokenizer: Arc<dyn Tokenizer>) -> Result<Self> {
        let layout = TableLayout::new(dir, name);
        if !layout.meta_path().exists() {
            return Err(Error::not_found("table", name));
        }
        let lock = FileLock::acquire(&layout.lock_path())?;
        let mut meta: TableMeta = read_json(&layout.meta_path())?;

        let mut partitions: Vec<Arc<Partition>> = Vec::with_capacity(meta.partition_names.len());
        for partition_name in &meta.partition_names {
            let partition = Partition::load(layout.partition_prefix(partition_name), tokenizer.clone())?;
            let expected = partitions.last().map_or(meta.start_doc_id, |p| p.next_doc_id());
            if partition.start_doc_id() != expected {
                return Err(Error::corrupt(format!(
                    "partition {} starts at {}, expected {}",
                    partition_name,
                    partition.start_doc_id(),
                    expected
                )));
            }
            partitions.push(Arc::new(partition));
        }

        for orphan in layout.partitions_on_disk()? {
            if !meta.partition_names.contains(&orphan) {
                remove_partition_files(&layout.partition_prefix(&orphan))?;
                log::info!("table {}: removed orphan partition files {}", name, orphan);
            }
        }

        let next_doc_id = partitions.last().map_or(meta.start_doc_id, |p| p.next_doc_id());
        if meta.next_doc_id != next_doc_id {
            log::warn!(
                "table {}: rows [{}, {}) were never sealed and are dropped",
                name,
                next_doc_id,
                meta.next_doc_id
            );
            meta.next_doc_id = next_doc_id;
        }

        let pk_store = KvStore::open(layout.pk_store_path(), config.kv_sync_mode)?;
        pk_store.add_tree(&meta.primary_key_field)?;
        pk_store.add_tree(REWRITES_TREE)?;
        let restored = recover_primary_keys(&pk_store, &meta.primary_key_field, next_doc_id, name)?;
        compact_if_sparse(&pk_store)?;
        pk_store.sync()?;

        let mut deleted = Bitmap::open(layout.bitmap_path(), config.deletion_bitmap_bits)?;
        if let Some(max_one) = deleted.max_one_index() {
            for doc_id in next_doc_id as u64..=max_one {
                deleted.clear(doc_id)?;
            }
        }
        for doc_id in restored {
            deleted.clear(doc_id)?;
        }
        deleted.sync()?;

        write_json_atomic(&layout.meta_path(), &meta)?;
        log::info!(
            "opened table {}: {} partitions, docs [{}, {})",
            name,
            partitions.len(),
            meta.start_doc_id,
            meta.next_doc_id
        );

        Ok(Self::assemble(layout, config, tokenizer, lock, meta, partitions, pk_store, deleted))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        layout: TableLayout,
        config: &Config,
        tokenizer: Arc<dyn Tokenizer>,
        lock: FileLock,
        meta: TableMeta,
        partitions: Vec<Arc<Partition>>,
        pk_store: KvStore,
        deleted: Bitmap,
    ) -> Self {
        let policy = config
            .merge_policy
            .build(config.partition_merge_min_doc_count, config.partition_merge_max_doc_count);
        Table {
            layout,
            config: config.clone(),
            tokenizer,
            policy,
            state: RwLock::new(TableState {
                meta,
                partitions,
                mem: None,
                pk_store,
                deleted,
            }),
            merge_lock: Mutex::new(()),
            _lock: lock,
        }
    }

    pub fn name(&self) -> &str {
        &self.layout.name
    }

    pub fn meta(&self) -> TableMeta {
        self.state.read().meta.clone()
    }

    pub fn fields(&self) -> Vec<FieldSummary> {
        self.state.read().meta.fields.clone()
    }

    pub fn primary_key_field(&self) -> String {
        self.state.read().meta.primary_key_field.clone()
    }

    /// Insert a document under a fresh doc id. Every value is coerced before
    /// anything is written, so a rejected document leaves no trace.
    pub fn add_doc(&self, doc: &Document) -> Result<(DocId, String)> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let values = coerce_document(&state.meta.fields, doc)?;
        let pk = primary_key_value(&state.meta.primary_key_field, &values)?;
        if state.pk_store.get(&state.meta.primary_key_field, &pk).is_some() {
            return Err(Error::already_exists("primary key", &pk));
        }

        let doc_id = self.insert(state, &values, &pk)?;
        self.seal_if_due(state);
        Ok((doc_id, pk))
    }

    fn insert(&self, state: &mut TableState, values: &HashMap<String, StoredValue>, pk: &str) -> Result<DocId> {
        let doc_id = state.meta.next_doc_id;
        if doc_id == DocId::MAX {
            return Err(Error::internal(format!("table {} ran out of doc ids", self.layout.name)));
        }
        state.ensure_bitmap(doc_id)?;

        let mem = state.mem_partition(&self.layout, &self.tokenizer);
        mem.add_doc(doc_id, values)?;
        state.meta.next_doc_id += 1;
        state.pk_store.set(&state.meta.primary_key_field, pk, doc_id as u64)?;
        Ok(doc_id)
    }

    fn seal_if_due(&self, state: &mut TableState) {
        let due = state
            .mem
            .as_ref()
            .is_some_and(|m| m.doc_count() >= self.config.partition_persist_min_doc_count);
        if due {
            if let Err(e) = state.seal(&self.layout) {
                log::error!("table {}: sealing partition failed, will retry: {}", self.layout.name, e);
            }
        }
    }

    /// Update the document named by the primary key in `doc`. Integer/date-only
    /// changes to fields the owning partition holds are applied in place;
    /// anything else rewrites the document under a new doc id, carrying over the
    /// stored values of the fields `doc` leaves out. Returns the doc id now
    /// holding the document.
    pub fn update_doc(&self, doc: &Document) -> Result<DocId> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let pk_field = state.meta.primary_key_field.clone();

        let values = coerce_document(&state.meta.fields, doc)?;
        let pk = primary_key_value(&pk_field, &values)?;
        let old = match state.pk_store.get(&pk_field, &pk) {
            Some(id) if !state.deleted.get(id) => id as DocId,
            _ => return Err(Error::not_found("doc", &pk)),
        };

        let owner = state
            .partition_for(old)
            .ok_or_else(|| Error::internal(format!("no partition holds doc {}", old)))?;
        let in_place = values.keys().filter(|name| **name != pk_field).all(|name| {
            state
                .kind_of(name)
                .is_some_and(|kind| kind.is_updatable() && owner.field(name).is_some_and(|f| f.kind() == kind))
        });
        if in_place {
            let updates: HashMap<String, i64> = values
                .iter()
                .filter_map(|(name, value)| match value {
                    StoredValue::Number(n) => Some((name.clone(), *n)),
                    StoredValue::Text(_) => None,
                })
                .collect();
            if updates.is_empty() {
                return Ok(old);
            }
            match state.mem.as_mut().filter(|m| m.contains(old)) {
                Some(mem) => mem.update_doc(old, &updates)?,
                None => state
                    .sealed_for(old)
                    .ok_or_else(|| Error::internal(format!("no partition holds doc {}", old)))?
                    .update_sealed(old, &updates)?,
            }
            return Ok(old);
        }

        let mut merged = HashMap::with_capacity(state.meta.fields.len());
        for field in &state.meta.fields {
            let value = match values.get(&field.name) {
                Some(v) => v.clone(),
                None => owner
                    .get_stored_value(old, &field.name, field.kind)
                    .unwrap_or_else(|| StoredValue::missing(field.kind)),
            };
            merged.insert(field.name.clone(), value);
        }

        // The rewrite record goes first so that open can point the key back at
        // `old` if the new row is lost before it is sealed.
        let rewrite_key = state.meta.next_doc_id.to_string();
        state.pk_store.set(REWRITES_TREE, &rewrite_key, old as u64)?;
        let doc_id = match self.insert(state, &merged, &pk) {
            Ok(doc_id) => doc_id,
            Err(e) => {
                state.pk_store.remove(REWRITES_TREE, &rewrite_key)?;
                return Err(e);
            }
        };
        state.deleted.set(old as u64)?;
        log::debug!("table {}: doc {} rewritten as {}", self.layout.name, old, doc_id);
        self.seal_if_due(state);
        Ok(doc_id)
    }

    /// Mark the document deleted and release its primary key. Returns whether a
    /// live document was found.
    pub fn delete_doc(&self, primary_key: &str) -> Result<bool> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let pk_field = state.meta.primary_key_field.clone();

        let Some(doc_id) = state.pk_store.get(&pk_field, primary_key) else {
            return Ok(false);
        };
        state.ensure_bitmap(doc_id as DocId)?;
        state.deleted.set(doc_id)?;
        state.pk_store.remove(&pk_field, primary_key)?;
        Ok(true)
    }

    pub fn get_doc(&self, primary_key: &str) -> Result<Option<DocInfo>> {
        let state = self.state.read();
        let Some(doc_id) = state.pk_store.get(&state.meta.primary_key_field, primary_key) else {
            return Ok(None);
        };
        if state.deleted.get(doc_id) {
            return Ok(None);
        }
        let doc_id = doc_id as DocId;
        Ok(state.document(doc_id).map(|fields| DocInfo {
            doc_id,
            weight: 0,
            fields,
        }))
    }

    pub fn is_deleted(&self, doc_id: DocId) -> bool {
        self.state.read().deleted.get(doc_id as u64)
    }

    /// Live documents matching `query`, ascending by doc id. A partition that fails
    /// is logged and skipped.
    pub fn search(&self, query: &Query) -> Result<Vec<DocInfo>> {
        let state = self.state.read();

        let mut clauses: Vec<TermClause> = Vec::new();
        for clause in query.active_clauses() {
            let kind = state
                .kind_of(&clause.field)
                .ok_or_else(|| Error::not_found("field", &clause.field))?;
            if !kind.has_inverted() {
                return Err(Error::unsupported(format!(
                    "field '{}' of kind {:?} cannot be searched",
                    clause.field, kind
                )));
            }
            clauses.push(clause.clone());
        }
        let filters = state.compile_filters(&query.filters)?;

        let mut results = Vec::new();
        for partition in state.partitions.iter().map(Arc::as_ref).chain(state.mem.iter()) {
            let mut hits = Vec::new();
            if let Err(e) = partition.search(&clauses, &filters, &state.deleted, &mut hits) {
                log::error!("table {}: skipping partition {}: {}", self.layout.name, partition.name(), e);
                continue;
            }
            for hit in hits {
                results.push(DocInfo {
                    doc_id: hit.doc_id,
                    weight: hit.weight,
                    fields: project(&state.meta.fields, partition, hit.doc_id),
                });
            }
        }
        Ok(results)
    }

    /// Single-clause search; an empty `value` matches every live document.
    pub fn search_field(&self, field: &str, value: &str, filters: &[Filter]) -> Result<Vec<DocInfo>> {
        let mut query = Query::term(field, value);
        query.filters = filters.to_vec();
        self.search(&query)
    }

    /// Add a field. A non-empty in-memory partition is sealed first; older
    /// partitions report the field as empty.
    pub fn add_field(&self, summary: &FieldSummary) -> Result<()> {
        validate_name("field", &summary.name)?;
        if summary.kind == FieldKind::Primary {
            return Err(Error::invalid_argument("a table has exactly one primary key field"));
        }
        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.kind_of(&summary.name).is_some() {
            return Err(Error::already_exists("field", &summary.name));
        }

        state.seal_if_nonempty(&self.layout)?;
        if let Some(mem) = state.mem.as_mut() {
            mem.add_field(summary)?;
        }
        state.meta.fields.push(summary.schema_only());
        state.save_meta(&self.layout)?;
        log::info!("table {}: added field {} ({:?})", self.layout.name, summary.name, summary.kind);
        Ok(())
    }

    pub fn delete_field(&self, name: &str) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if name == state.meta.primary_key_field {
            return Err(Error::invalid_argument("the primary key field cannot be deleted"));
        }
        if state.kind_of(name).is_none() {
            return Err(Error::not_found("field", name));
        }

        state.seal_if_nonempty(&self.layout)?;
        if let Some(mem) = state.mem.as_mut() {
            mem.delete_field(name)?;
        }
        state.meta.fields.retain(|f| f.name != name);
        state.save_meta(&self.layout)?;
        log::info!("table {}: deleted field {}", self.layout.name, name);
        Ok(())
    }

    /// Seal the in-memory partition now. Returns whether there was anything to seal.
    pub fn persist_mem_partition(&self) -> Result<bool> {
        let mut state = self.state.write();
        state.seal_if_nonempty(&self.layout)
    }

    fn partition_stats(&self) -> Vec<PartitionStat> {
        self.state
            .read()
            .partitions
            .iter()
            .map(|p| PartitionStat {
                doc_count: p.doc_count(),
            })
            .collect()
    }

    /// Run the merge policy once. Returns whether a merge happened.
    pub fn merge_partitions(&self) -> Result<bool> {
        match self.policy.select(&self.partition_stats()) {
            Some(run) => self.merge_range(run.start, run.end),
            None => Ok(false),
        }
    }

    /// Merge sealed partitions `[start, end)` into one. Returns false when the
    /// merge was abandoned because an input took an in-place update meanwhile.
    pub fn merge_range(&self, start: usize, end: usize) -> Result<bool> {
        self.merge_run(start, end, &|| false)
    }

    fn merge_run(&self, start: usize, end: usize, cancelled: &dyn Fn() -> bool) -> Result<bool> {
        let _merging = self.merge_lock.lock();

        let (inputs, generations, summaries, name) = {
            let mut state = self.state.write();
            if end > state.partitions.len() || end < start + 2 {
                return Err(Error::invalid_argument(format!(
                    "cannot merge partitions {}..{} of {}",
                    start,
                    end,
                    state.partitions.len()
                )));
            }
            let name = self.layout.partition_name(state.meta.prefix_segment_counter);
            state.meta.prefix_segment_counter += 1;
            let inputs = state.partitions[start..end].to_vec();
            let generations: Vec<u64> = inputs.iter().map(|p| p.update_generation()).collect();
            (inputs, generations, state.meta.fields.clone(), name)
        };

        let doc_count: u64 = inputs.iter().map(|p| p.doc_count()).sum();
        log::info!(
            "table {}: merging {} partitions ({} docs) into {}",
            self.layout.name,
            inputs.len(),
            doc_count,
            name
        );
        let merged = Partition::merge(
            self.layout.partition_prefix(&name),
            &name,
            &summaries,
            &inputs,
            self.tokenizer.clone(),
        )?;
        if cancelled() {
            merged.retire();
            log::info!("table {}: merge into {} cancelled", self.layout.name, name);
            return Ok(false);
        }

        let mut guard = self.state.write();
        let state = &mut *guard;
        let unchanged = state
            .partitions
            .get(start..end)
            .is_some_and(|current| current.iter().zip(&inputs).all(|(a, b)| Arc::ptr_eq(a, b)));
        if !unchanged {
            merged.retire();
            return Err(Error::internal("partition list changed during merge"));
        }
        let updated = inputs
            .iter()
            .zip(&generations)
            .any(|(p, generation)| p.update_generation() != *generation);
        if updated {
            merged.retire();
            log::info!(
                "table {}: merge into {} dropped, its inputs were updated meanwhile",
                self.layout.name,
                name
            );
            return Ok(false);
        }

        let mut meta = state.meta.clone();
        meta.partition_names.splice(start..end, [name.clone()]);
        if let Err(e) = write_json_atomic(&self.layout.meta_path(), &meta) {
            merged.retire();
            return Err(e);
        }
        state.meta = meta;
        state.partitions.splice(start..end, [Arc::new(merged)]);

        for old in &inputs {
            old.retire();
        }
        log::info!("table {}: merge into {} finished", self.layout.name, name);
        Ok(true)
    }

    /// Seal the in-memory partition and flush everything to disk. The table stays
    /// usable; reopening it yields the same state.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.seal_if_nonempty(&self.layout)?;
        for partition in &state.partitions {
            partition.close()?;
        }
        compact_if_sparse(&state.pk_store)?;
        state.pk_store.sync()?;
        state.deleted.sync()?;
        state.save_meta(&self.layout)?;
        log::info!("closed table {}", self.layout.name);
        Ok(())
    }

    pub fn stats(&self) -> Result<TableStats> {
        let state = self.state.read();
        Ok(TableStats {
            doc_count: (state.meta.next_doc_id - state.meta.start_doc_id) as u64,
            deleted_count: state.deleted.count_ones()?,
            partition_count: state.partitions.len(),
            mem_doc_count: state.mem.as_ref().map_or(0, |m| m.doc_count()),
        })
    }

    /// `(name, start_doc_id, next_doc_id)` of every sealed partition, in order.
    pub fn partition_ranges(&self) -> Vec<(String, DocId, DocId)> {
        self.state
            .read()
            .partitions
            .iter()
            .map(|p| (p.name().to_string(), p.start_doc_id(), p.next_doc_id()))
            .collect()
    }

    /// Run the merge policy every `interval` on a background thread until the
    /// handle is dropped. The thread holds only a weak reference to the table.
    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) -> Result<MaintenanceHandle> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let stopped = Arc::new(AtomicBool::new(false));
        let table = Arc::downgrade(self);
        let flag = stopped.clone();
        let ticker = channel::tick(interval);

        let thread = std::thread::Builder::new()
            .name(format!("{}-maintenance", self.layout.name))
            .spawn(move || loop {
                crossbeam::select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        let Some(table) = table.upgrade() else { break };
                        table.run_maintenance(&flag);
                    }
                }
            })?;

        Ok(MaintenanceHandle {
            stopped,
            stop: stop_tx,
            thread: Some(thread),
        })
    }

    fn run_maintenance(&self, stopped: &AtomicBool) {
        while !stopped.load(Ordering::Acquire) {
            let Some(run) = self.policy.select(&self.partition_stats()) else {
                break;
            };
            match self.merge_run(run.start, run.end, &|| stopped.load(Ordering::Acquire)) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    log::error!("table {}: background merge failed: {}", self.layout.name, e);
                    break;
                }
            }
        }
    }
}

/// Stops the maintenance thread when dropped. A merge in flight is abandoned
/// before it is swapped in.
pub struct MaintenanceHandle {
    stopped: Arc<AtomicBool>,
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn stop(self) {}
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.stop.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("maintenance thread panicked");
            }
        }
    }
}

impl TableState {
    fn kind_of(&self, field: &str) -> Option<FieldKind> {
        self.meta.fields.iter().find(|f| f.name == field).map(|f| f.kind)
    }

    fn compile_filters(&self, filters: &[Filter]) -> Result<Vec<CompiledFilter>> {
        filters
            .iter()
            .map(|filter| {
                let kind = self
                    .kind_of(&filter.field)
                    .ok_or_else(|| Error::not_found("field", &filter.field))?;
                filter.compile(kind)
            })
            .collect()
    }

    fn sealed_for(&self, doc_id: DocId) -> Option<&Arc<Partition>> {
        let idx = self.partitions.partition_point(|p| p.next_doc_id() <= doc_id);
        self.partitions.get(idx).filter(|p| p.contains(doc_id))
    }

    fn partition_for(&self, doc_id: DocId) -> Option<&Partition> {
        match self.mem.as_ref().filter(|m| m.contains(doc_id)) {
            Some(mem) => Some(mem),
            None => self.sealed_for(doc_id).map(Arc::as_ref),
        }
    }

    /// Current schema's view of a stored document.
    fn document(&self, doc_id: DocId) -> Option<HashMap<String, String>> {
        let partition = self.partition_for(doc_id)?;
        Some(project(&self.meta.fields, partition, doc_id))
    }

    fn mem_partition(&mut self, layout: &TableLayout, tokenizer: &Arc<dyn Tokenizer>) -> &mut Partition {
        let meta = &mut self.meta;
        self.mem.get_or_insert_with(|| {
            let name = layout.partition_name(meta.prefix_segment_counter);
            meta.prefix_segment_counter += 1;
            Partition::new_empty(
                layout.partition_prefix(&name),
                &name,
                meta.next_doc_id,
                &meta.fields,
                tokenizer.clone(),
            )
        })
    }

    fn ensure_bitmap(&mut self, doc_id: DocId) -> Result<()> {
        let needed = doc_id as u64 + 1;
        if needed > self.deleted.size() {
            self.deleted.resize(needed.max(self.deleted.size() * 2))?;
        }
        Ok(())
    }

    fn seal_if_nonempty(&mut self, layout: &TableLayout) -> Result<bool> {
        if self.mem.as_ref().is_some_and(|m| !m.is_empty()) {
            self.seal(layout)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Persist the in-memory partition and append it to the sealed list. On
    /// failure the partition stays in memory.
    fn seal(&mut self, layout: &TableLayout) -> Result<()> {
        let Some(mut mem) = self.mem.take() else {
            return Ok(());
        };
        if mem.is_empty() {
            return Ok(());
        }
        if let Err(e) = mem.persist() {
            self.mem = Some(mem);
            return Err(e);
        }

        self.meta.partition_names.push(mem.name().to_string());
        self.partitions.push(Arc::new(mem));
        self.pk_store.sync()?;
        self.deleted.sync()?;
        self.save_meta(layout)?;
        for (key, _) in self.pk_store.entries(REWRITES_TREE) {
            self.pk_store.remove(REWRITES_TREE, &key)?;
        }
        Ok(())
    }

    fn save_meta(&self, layout: &TableLayout) -> Result<()> {
        write_json_atomic(&layout.meta_path(), &self.meta)
    }
}

/// Drop primary keys of rows at or beyond `next_doc_id`, which never got
/// sealed. A key whose row rewrote a sealed one is pointed back at that row
/// instead. Returns the sealed doc ids brought back.
fn recover_primary_keys(store: &KvStore, pk_field: &str, next_doc_id: DocId, table: &str) -> Result<Vec<u64>> {
    let next = next_doc_id as u64;
    let rewrites: HashMap<u64, u64> = store
        .entries(REWRITES_TREE)
        .into_iter()
        .filter_map(|(key, old)| key.parse().ok().map(|new| (new, old)))
        .collect();

    let mut stale = 0;
    let mut restored = Vec::new();
    for (key, doc_id) in store.entries(pk_field) {
        if doc_id < next {
            continue;
        }
        let mut origin = doc_id;
        while origin >= next {
            match rewrites.get(&origin) {
                Some(&prev) if prev < origin => origin = prev,
                _ => break,
            }
        }
        if origin < next {
            store.set(pk_field, &key, origin)?;
            restored.push(origin);
        } else {
            store.remove(pk_field, &key)?;
            stale += 1;
        }
    }
    for key in rewrites.keys() {
        store.remove(REWRITES_TREE, &key.to_string())?;
    }

    if stale > 0 {
        log::warn!("table {}: removed {} primary keys of unsealed rows", table, stale);
    }
    if !restored.is_empty() {
        log::warn!("table {}: restored {} documents whose rewrite was never sealed", table, restored.len());
    }
    Ok(restored)
}

/// Rewrite the primary-key log once most of its records are dead.
fn compact_if_sparse(store: &KvStore) -> Result<()> {
    let (records, live) = store.log_stats();
    if records > PK_COMPACT_MIN_RECORDS && records > 2 * live as u64 {
        store.compact()?;
    }
    Ok(())
}

/// Validate field names and put the primary key field in place.
fn build_schema(primary_key: &str, fields: &[FieldSummary]) -> Result<Vec<FieldSummary>> {
    validate_name("field", primary_key)?;
    let mut schema: Vec<FieldSummary> = Vec::with_capacity(fields.len() + 1);
    for field in fields {
        validate_name("field", &field.name)?;
        if schema.iter().any(|f| f.name == field.name) {
            return Err(Error::already_exists("field", &field.name));
        }
        let is_pk = field.name == primary_key;
        if is_pk != (field.kind == FieldKind::Primary) {
            return Err(Error::invalid_argument(format!(
                "field '{}': the primary key '{}' and only it must be of kind primary",
                field.name, primary_key
            )));
        }
        schema.push(field.schema_only());
    }
    if !schema.iter().any(|f| f.name == primary_key) {
        schema.insert(0, FieldSummary::new(primary_key, FieldKind::Primary));
    }
    Ok(schema)
}

fn coerce_document(fields: &[FieldSummary], doc: &Document) -> Result<HashMap<String, StoredValue>> {
    let mut values = HashMap::with_capacity(doc.len());
    for (name, value) in doc {
        match fields.iter().find(|f| &f.name == name) {
            Some(field) => {
                values.insert(name.clone(), field.kind.coerce(name, value)?);
            }
            None => log::debug!("ignoring value for unknown field '{}'", name),
        }
    }
    Ok(values)
}

fn primary_key_value(pk_field: &str, values: &HashMap<String, StoredValue>) -> Result<String> {
    values
        .get(pk_field)
        .and_then(StoredValue::as_text)
        .filter(|pk| !pk.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_argument(format!("missing primary key '{}'", pk_field)))
}

fn project(fields: &[FieldSummary], partition: &Partition, doc_id: DocId) -> HashMap<String, String> {
    fields
        .iter()
        .map(|f| (f.name.clone(), partition.get_field_value(doc_id, &f.name).unwrap_or_default()))
        .collect()
}
