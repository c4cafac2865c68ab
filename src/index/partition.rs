use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use crate::analysis::tokenizer::Tokenizer;
use crate::core::error::{Error, Result};
use crate::core::types::DocId;
use crate::index::field::Field;
use crate::index::posting::{intersect, union, DocNode};
use crate::index::term_dict::TermDict;
use crate::schema::schema::{FieldKind, FieldSummary, StoredValue};
use crate::search::filter::CompiledFilter;
use crate::search::query::TermClause;
use crate::storage::bitmap::Bitmap;
use crate::storage::layout::{artifact_path, read_json, remove_partition_files, write_json_atomic, META_EXT};
use crate::storage::segment::SegmentFiles;

/// `<partition>.meta`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub name: String,
    pub start_doc_id: DocId,
    pub next_doc_id: DocId,
    pub fields: Vec<FieldSummary>,
}

/// A contiguous doc-id range `[start_doc_id, next_doc_id)` indexed by a fixed set
/// of fields.
///
/// A partition starts in memory and accepts appends. `persist` seals it: every
/// field is written into one shared set of segment files, after which it is
/// read-only apart from in-place numeric updates. Sealed partitions are shared
/// behind `Arc`; `retire` marks one for deletion once its last reader lets go.
/// Every in-place update of a sealed partition bumps its update generation.
pub struct Partition {
    name: String,
    prefix: PathBuf,
    start_doc_id: DocId,
    next_doc_id: DocId,
    fields: Vec<Field>,
    files: Option<Arc<SegmentFiles>>,
    tokenizer: Arc<dyn Tokenizer>,
    retired: AtomicBool,
    updates: AtomicU64,
}

impl Partition {
    pub fn new_empty(
        prefix: PathBuf,
        name: &str,
        start_doc_id: DocId,
        summaries: &[FieldSummary],
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        Partition {
            name: name.to_string(),
            prefix,
            start_doc_id,
            next_doc_id: start_doc_id,
            fields: summaries.iter().map(|s| Field::new(s, start_doc_id)).collect(),
            files: None,
            tokenizer,
            retired: AtomicBool::new(false),
            updates: AtomicU64::new(0),
        }
    }

    /// Open a sealed partition from its meta and segment files.
    pub fn load(prefix: PathBuf, tokenizer: Arc<dyn Tokenizer>) -> Result<Self> {
        let meta_path = artifact_path(&prefix, META_EXT);
        if !meta_path.exists() {
            return Err(Error::not_found("partition", &prefix.display().to_string()));
        }
        let meta: PartitionMeta = read_json(&meta_path)?;
        if meta.start_doc_id > meta.next_doc_id {
            return Err(Error::corrupt(format!(
                "partition {} has start {} beyond next {}",
                meta.name, meta.start_doc_id, meta.next_doc_id
            )));
        }
        let doc_count = (meta.next_doc_id - meta.start_doc_id) as u64;
        if let Some(bad) = meta.fields.iter().find(|f| f.forward_doc_count != doc_count) {
            return Err(Error::corrupt(format!(
                "partition {} field '{}' holds {} docs, expected {}",
                meta.name, bad.name, bad.forward_doc_count, doc_count
            )));
        }

        let files = Arc::new(SegmentFiles::load(&prefix)?);
        let fields = meta
            .fields
            .iter()
            .map(|s| Field::open(s, meta.start_doc_id, files.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Partition {
            name: meta.name,
            prefix,
            start_doc_id: meta.start_doc_id,
            next_doc_id: meta.next_doc_id,
            fields,
            files: Some(files),
            tokenizer,
            retired: AtomicBool::new(false),
            updates: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn start_doc_id(&self) -> DocId {
        self.start_doc_id
    }

    pub fn next_doc_id(&self) -> DocId {
        self.next_doc_id
    }

    pub fn doc_count(&self) -> u64 {
        (self.next_doc_id - self.start_doc_id) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.start_doc_id == self.next_doc_id
    }

    pub fn in_memory(&self) -> bool {
        self.files.is_none()
    }

    pub fn contains(&self, doc_id: DocId) -> bool {
        doc_id >= self.start_doc_id && doc_id < self.next_doc_id
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name() == name)
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.name() == name)
    }

    pub fn summaries(&self) -> Vec<FieldSummary> {
        self.fields.iter().map(|f| f.summary().clone()).collect()
    }

    pub fn meta(&self) -> PartitionMeta {
        PartitionMeta {
            name: self.name.clone(),
            start_doc_id: self.start_doc_id,
            next_doc_id: self.next_doc_id,
            fields: self.summaries(),
        }
    }

    /// Append one document. Fields absent from `values` store a missing value.
    /// A failing field is logged, stores a missing value instead and the others
    /// still advance.
    pub fn add_doc(&mut self, doc_id: DocId, values: &HashMap<String, StoredValue>) -> Result<()> {
        if !self.in_memory() {
            return Err(Error::unsupported(format!("add to sealed partition {}", self.name)));
        }
        if doc_id != self.next_doc_id {
            return Err(Error::wrong_doc_id(self.next_doc_id, doc_id));
        }

        let tokenizer = self.tokenizer.clone();
        for field in &mut self.fields {
            let missing;
            let value = match values.get(field.name()) {
                Some(v) => v,
                None => {
                    missing = StoredValue::missing(field.kind());
                    &missing
                }
            };
            if let Err(e) = field.add(doc_id, value, tokenizer.as_ref()) {
                log::warn!("partition {}: field '{}' add of doc {} failed: {}", self.name, field.name(), doc_id, e);
                if let Err(e) = field.fill_missing(doc_id, tokenizer.as_ref()) {
                    log::error!("partition {}: field '{}' is out of step at doc {}: {}", self.name, field.name(), doc_id, e);
                }
            }
        }

        self.next_doc_id += 1;
        Ok(())
    }

    /// In-place numeric updates. Nothing is written unless every named field
    /// exists here and is updatable.
    pub fn update_doc(&mut self, doc_id: DocId, values: &HashMap<String, i64>) -> Result<()> {
        if !self.in_memory() {
            return self.update_sealed(doc_id, values);
        }
        self.check_update(doc_id, values)?;
        for (name, value) in values {
            if let Some(field) = self.field_mut(name) {
                field.update(doc_id, *value)?;
            }
        }
        Ok(())
    }

    /// `update_doc` for a sealed partition shared behind `Arc`.
    pub fn update_sealed(&self, doc_id: DocId, values: &HashMap<String, i64>) -> Result<()> {
        let Some(files) = &self.files else {
            return Err(Error::internal(format!("partition {} is not sealed", self.name)));
        };
        self.check_update(doc_id, values)?;
        self.updates.fetch_add(1, Ordering::AcqRel);
        for (name, value) in values {
            if let Some(field) = self.field(name) {
                field.update_shared(doc_id, *value)?;
            }
        }
        files.sync_shared()
    }

    fn check_update(&self, doc_id: DocId, values: &HashMap<String, i64>) -> Result<()> {
        if !self.contains(doc_id) {
            return Err(Error::not_found("doc", &doc_id.to_string()));
        }
        for name in values.keys() {
            match self.field(name) {
                Some(field) if field.kind().is_updatable() => {}
                Some(field) => {
                    return Err(Error::unsupported(format!(
                        "field '{}' of kind {:?} cannot be updated in place",
                        name,
                        field.kind()
                    )))
                }
                None => {
                    return Err(Error::unsupported(format!(
                        "partition {} predates field '{}'",
                        self.name, name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Number of in-place update batches applied since the partition was opened.
    pub fn update_generation(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }

    fn check_schema_mutable(&self) -> Result<()> {
        if self.in_memory() && self.is_empty() {
            Ok(())
        } else {
            Err(Error::schema_locked(&self.name))
        }
    }

    pub fn add_field(&mut self, summary: &FieldSummary) -> Result<()> {
        self.check_schema_mutable()?;
        if self.field(&summary.name).is_some() {
            return Err(Error::already_exists("field", &summary.name));
        }
        self.fields.push(Field::new(summary, self.start_doc_id));
        Ok(())
    }

    pub fn delete_field(&mut self, name: &str) -> Result<()> {
        self.check_schema_mutable()?;
        let before = self.fields.len();
        self.fields.retain(|f| f.name() != name);
        if self.fields.len() == before {
            return Err(Error::not_found("field", name));
        }
        Ok(())
    }

    /// Seal: write every field into fresh segment files, then the meta, then switch
    /// all fields to the mapped files. On failure the partition stays in memory and
    /// the partial files are removed.
    pub fn persist(&mut self) -> Result<()> {
        if !self.in_memory() {
            return Err(Error::internal(format!("partition {} is already sealed", self.name)));
        }
        match self.write_segment() {
            Ok((files, dicts)) => {
                let files = Arc::new(files);
                for (field, dict) in self.fields.iter_mut().zip(dicts) {
                    field.attach(files.clone(), dict);
                }
                self.files = Some(files);
                log::info!(
                    "sealed partition {} [{}, {}) with {} fields",
                    self.name,
                    self.start_doc_id,
                    self.next_doc_id,
                    self.fields.len()
                );
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = remove_partition_files(&self.prefix) {
                    log::error!("partition {}: cleanup after failed persist: {}", self.name, cleanup);
                }
                Err(e)
            }
        }
    }

    fn write_segment(&mut self) -> Result<(SegmentFiles, Vec<Option<TermDict>>)> {
        let mut files = SegmentFiles::create(&self.prefix)?;
        for field in &mut self.fields {
            field.persist(&mut files)?;
        }
        files.sync()?;
        let dicts = self
            .fields
            .iter()
            .map(|f| f.sealed_dict(&files))
            .collect::<Result<Vec<_>>>()?;
        write_json_atomic(&artifact_path(&self.prefix, META_EXT), &self.meta())?;
        Ok((files, dicts))
    }

    /// Flush pending in-place updates of a sealed partition.
    pub fn close(&self) -> Result<()> {
        if let Some(files) = &self.files {
            files.sync_shared()?;
        }
        Ok(())
    }

    /// Mark for deletion; files are removed when the partition is dropped.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Postings for `value` in `field`. A `Gather` field answers with its own
    /// postings united with those of every tokenized field.
    pub fn query(&self, field: &str, value: &str) -> Result<Option<Vec<DocNode>>> {
        let Some(target) = self.field(field) else {
            return Ok(None);
        };
        let tokenizer = self.tokenizer.as_ref();
        if target.kind() != FieldKind::Gather {
            return target.query(value, tokenizer);
        }

        let mut result = target.query(value, tokenizer)?;
        for other in self.fields.iter().filter(|f| f.kind() == FieldKind::Tokenized) {
            if let Some(postings) = other.query(value, tokenizer)? {
                result = Some(match result {
                    Some(acc) => union(&acc, &postings),
                    None => postings,
                });
            }
        }
        Ok(result)
    }

    pub fn get_field_value(&self, doc_id: DocId, field: &str) -> Option<String> {
        self.field(field)?.get_string(doc_id)
    }

    /// The stored value of `field` if this partition holds it under `kind`.
    pub fn get_stored_value(&self, doc_id: DocId, field: &str, kind: FieldKind) -> Option<StoredValue> {
        self.field(field).filter(|f| f.kind() == kind)?.get_value(doc_id)
    }

    pub fn get_document(&self, doc_id: DocId) -> Option<HashMap<String, String>> {
        if !self.contains(doc_id) {
            return None;
        }
        Some(
            self.fields
                .iter()
                .map(|f| (f.name().to_string(), f.get_string(doc_id).unwrap_or_default()))
                .collect(),
        )
    }

    fn passes(&self, doc_id: DocId, filters: &[CompiledFilter]) -> bool {
        filters.iter().all(|filter| match self.field(&filter.field) {
            Some(field) => field.filter(doc_id, filter),
            None => filter.matches_number(None),
        })
    }

    /// Append this partition's hits to `acc` in ascending doc-id order. Hits match
    /// every clause, pass every filter and are not marked in `deleted`. Returns
    /// whether anything was appended.
    pub fn search(
        &self,
        clauses: &[TermClause],
        filters: &[CompiledFilter],
        deleted: &Bitmap,
        acc: &mut Vec<DocNode>,
    ) -> Result<bool> {
        let mut candidates: Option<Vec<DocNode>> = None;
        for clause in clauses.iter().filter(|c| !c.value.is_empty()) {
            let Some(postings) = self.query(&clause.field, &clause.value)? else {
                return Ok(false);
            };
            candidates = Some(match candidates {
                Some(current) => intersect(&current, &postings),
                None => postings,
            });
        }

        let before = acc.len();
        let mut keep = |node: DocNode| {
            if self.contains(node.doc_id) && !deleted.get(node.doc_id as u64) && self.passes(node.doc_id, filters) {
                acc.push(node);
            }
        };
        match candidates {
            Some(nodes) => nodes.into_iter().for_each(&mut keep),
            None => (self.start_doc_id..self.next_doc_id).for_each(|id| keep(DocNode::new(id, 0))),
        }
        Ok(acc.len() > before)
    }

    /// Build a sealed partition at `prefix` from consecutive sealed `inputs`,
    /// laid out by `summaries`. Inputs lacking a field, or holding it under another
    /// kind, contribute missing values for it. Inputs are left untouched.
    pub fn merge(
        prefix: PathBuf,
        name: &str,
        summaries: &[FieldSummary],
        inputs: &[Arc<Partition>],
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<Partition> {
        let (Some(first), Some(last)) = (inputs.first(), inputs.last()) else {
            return Err(Error::invalid_argument("merge needs at least one partition"));
        };
        for pair in inputs.windows(2) {
            if pair[0].next_doc_id != pair[1].start_doc_id {
                return Err(Error::invalid_argument(format!(
                    "partitions {} and {} are not contiguous",
                    pair[0].name, pair[1].name
                )));
            }
        }
        if let Some(open) = inputs.iter().find(|p| p.in_memory()) {
            return Err(Error::invalid_argument(format!("partition {} is not sealed", open.name)));
        }

        let mut merged = Partition::new_empty(prefix, name, first.start_doc_id, summaries, tokenizer);
        merged.next_doc_id = last.next_doc_id;

        match Self::merge_segment(&merged, summaries, inputs) {
            Ok((files, merged_summaries)) => {
                let fields = merged_summaries
                    .iter()
                    .map(|s| Field::open(s, merged.start_doc_id, files.clone()))
                    .collect::<Result<Vec<_>>>();
                match fields {
                    Ok(fields) => {
                        merged.fields = fields;
                        merged.files = Some(files);
                        Ok(merged)
                    }
                    Err(e) => {
                        drop(files);
                        merged.retire();
                        Err(e)
                    }
                }
            }
            Err(e) => {
                if let Err(cleanup) = remove_partition_files(&merged.prefix) {
                    log::error!("partition {}: cleanup after failed merge: {}", merged.name, cleanup);
                }
                Err(e)
            }
        }
    }

    fn merge_segment(
        target: &Partition,
        summaries: &[FieldSummary],
        inputs: &[Arc<Partition>],
    ) -> Result<(Arc<SegmentFiles>, Vec<FieldSummary>)> {
        let mut files = SegmentFiles::create(&target.prefix)?;
        let mut merged_summaries = Vec::with_capacity(summaries.len());

        for summary in summaries {
            let fakes: Vec<Option<Field>> = inputs
                .iter()
                .map(|p| match p.field(&summary.name) {
                    Some(f) if f.kind() == summary.kind => None,
                    _ => Some(Field::fake(summary, p.start_doc_id, p.doc_count())),
                })
                .collect();
            let sources: Vec<&Field> = inputs
                .iter()
                .zip(&fakes)
                .filter_map(|(p, fake)| fake.as_ref().or_else(|| p.field(&summary.name)))
                .collect();
            merged_summaries.push(Field::merge(summary, &sources, &mut files)?);
        }

        files.sync()?;
        let meta = PartitionMeta {
            name: target.name.clone(),
            start_doc_id: target.start_doc_id,
            next_doc_id: target.next_doc_id,
            fields: merged_summaries.clone(),
        };
        write_json_atomic(&artifact_path(&target.prefix, META_EXT), &meta)?;
        Ok((Arc::new(files), merged_summaries))
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        if !self.is_retired() {
            return;
        }
        self.fields.clear();
        self.files = None;
        match remove_partition_files(&self.prefix) {
            Ok(()) => log::info!("removed partition {}", self.name),
            Err(e) => log::error!("failed to remove partition {}: {}", self.name, e),
        }
    }
}
