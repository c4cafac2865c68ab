use std::sync::Arc;
use crate::analysis::tokenizer::Tokenizer;
use crate::core::error::{Error, Result};
use crate::core::types::DocId;
use crate::index::forward::ForwardIndex;
use crate::index::inverted::InvertedIndex;
use crate::index::posting::{intersect, DocNode};
use crate::index::term_dict::TermDict;
use crate::schema::schema::{FieldKind, FieldSummary, StoredValue};
use crate::search::filter::CompiledFilter;
use crate::storage::segment::SegmentFiles;

/// One column of a partition: a forward index plus an inverted index for kinds
/// that have one.
pub struct Field {
    summary: FieldSummary,
    start_doc_id: DocId,
    forward: ForwardIndex,
    inverted: Option<InvertedIndex>,
}

impl Field {
    pub fn new(summary: &FieldSummary, start_doc_id: DocId) -> Self {
        Field {
            summary: summary.schema_only(),
            start_doc_id,
            forward: ForwardIndex::new(summary.kind, start_doc_id),
            inverted: InvertedIndex::new(&summary.name, summary.kind, start_doc_id),
        }
    }

    /// Bind to a persisted field whose location is recorded in `summary`.
    pub fn open(summary: &FieldSummary, start_doc_id: DocId, files: Arc<SegmentFiles>) -> Result<Self> {
        let count = summary.forward_doc_count;
        let next_doc_id = start_doc_id + count as DocId;
        let inverted = match Self::term_dict(summary, &files)? {
            Some(dict) => InvertedIndex::open(&summary.name, summary.kind, next_doc_id, files.clone(), dict),
            None => None,
        };
        Ok(Field {
            summary: summary.clone(),
            start_doc_id,
            forward: ForwardIndex::open(summary.kind, start_doc_id, files, summary.forward_offset, count),
            inverted,
        })
    }

    fn term_dict(summary: &FieldSummary, files: &SegmentFiles) -> Result<Option<TermDict>> {
        if !summary.kind.has_inverted() {
            return Ok(None);
        }
        files.term_dict(summary.dict_offset, summary.dict_len).map(Some)
    }

    /// Placeholder for a field a merge input lacks: `count` missing values, no postings.
    pub fn fake(summary: &FieldSummary, start_doc_id: DocId, count: u64) -> Self {
        Field {
            summary: summary.schema_only(),
            start_doc_id,
            forward: ForwardIndex::fake(summary.kind, start_doc_id, count),
            inverted: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.summary.name
    }

    pub fn kind(&self) -> FieldKind {
        self.summary.kind
    }

    pub fn summary(&self) -> &FieldSummary {
        &self.summary
    }

    pub fn next_doc_id(&self) -> DocId {
        self.forward.next_doc_id()
    }

    pub fn in_memory(&self) -> bool {
        self.forward.in_memory()
    }

    /// The inverted add is not undone if it fails after the forward add succeeded.
    pub fn add(&mut self, doc_id: DocId, value: &StoredValue, tokenizer: &dyn Tokenizer) -> Result<()> {
        self.forward.add(doc_id, value)?;
        if let (Some(inverted), Some(text)) = (self.inverted.as_mut(), value.as_text()) {
            inverted.add(doc_id, text, tokenizer)?;
        }
        Ok(())
    }

    /// Bring a field whose add of `doc_id` failed part way back in step with
    /// its partition by storing a missing value wherever the add did not land.
    pub fn fill_missing(&mut self, doc_id: DocId, tokenizer: &dyn Tokenizer) -> Result<()> {
        if self.forward.next_doc_id() == doc_id {
            self.forward.add(doc_id, &StoredValue::missing(self.summary.kind))?;
        }
        if let Some(inverted) = self.inverted.as_mut().filter(|i| i.next_doc_id() == doc_id) {
            inverted.add(doc_id, "", tokenizer)?;
        }
        Ok(())
    }

    pub fn update(&mut self, doc_id: DocId, value: i64) -> Result<()> {
        self.forward.update(doc_id, value)
    }

    pub fn update_shared(&self, doc_id: DocId, value: i64) -> Result<()> {
        self.forward.update_shared(doc_id, value)
    }

    /// Postings for a query term. Tokenized fields split the term in search mode and
    /// require every sub-term; other kinds look the raw term up.
    pub fn query(&self, term: &str, tokenizer: &dyn Tokenizer) -> Result<Option<Vec<DocNode>>> {
        let Some(inverted) = &self.inverted else {
            return Err(Error::unsupported(format!(
                "field '{}' of kind {:?} has no inverted index",
                self.summary.name, self.summary.kind
            )));
        };
        if self.summary.kind != FieldKind::Tokenized {
            return inverted.query_term(term);
        }

        let mut result: Option<Vec<DocNode>> = None;
        for sub_term in tokenizer.split(term, true) {
            let Some(postings) = inverted.query_term(&sub_term)? else {
                return Ok(None);
            };
            result = Some(match result {
                Some(acc) => intersect(&acc, &postings),
                None => postings,
            });
        }
        Ok(result)
    }

    fn position(&self, doc_id: DocId) -> Option<u64> {
        (doc_id >= self.start_doc_id && doc_id < self.next_doc_id()).then(|| (doc_id - self.start_doc_id) as u64)
    }

    pub fn filter(&self, doc_id: DocId, filter: &CompiledFilter) -> bool {
        match self.position(doc_id) {
            Some(pos) => self.forward.filter(pos, filter),
            None => false,
        }
    }

    pub fn get_string(&self, doc_id: DocId) -> Option<String> {
        self.forward.get_string(self.position(doc_id)?)
    }

    /// Stored form of the value: numbers for numeric kinds, text otherwise.
    pub fn get_value(&self, doc_id: DocId) -> Option<StoredValue> {
        let pos = self.position(doc_id)?;
        if self.summary.kind.is_numeric() {
            Some(match self.forward.get_int(pos) {
                Some(n) => StoredValue::Number(n),
                None => StoredValue::missing(self.summary.kind),
            })
        } else {
            self.forward.get_string(pos).map(StoredValue::Text)
        }
    }

    /// Write both indices into the segment and record where they landed.
    /// The field keeps serving from memory until `attach`.
    pub fn persist(&mut self, files: &mut SegmentFiles) -> Result<()> {
        let (offset, count) = self.forward.persist(files)?;
        if let Some(inverted) = &self.inverted {
            let (dict_offset, dict_len) = inverted.persist(files)?;
            self.summary.dict_offset = dict_offset;
            self.summary.dict_len = dict_len;
        }
        self.summary.forward_offset = offset;
        self.summary.forward_doc_count = count;
        Ok(())
    }

    /// Dictionary of a persisted field, to be handed to `attach`.
    pub fn sealed_dict(&self, files: &SegmentFiles) -> Result<Option<TermDict>> {
        match &self.inverted {
            Some(_) => Self::term_dict(&self.summary, files),
            None => Ok(None),
        }
    }

    pub fn attach(&mut self, files: Arc<SegmentFiles>, dict: Option<TermDict>) {
        self.forward
            .attach(files.clone(), self.summary.forward_offset, self.summary.forward_doc_count);
        if let (Some(inverted), Some(dict)) = (&mut self.inverted, dict) {
            inverted.attach(files, dict);
        }
    }

    /// Merge same-named fields of consecutive partitions into `files`. Fakes
    /// contribute missing forward values and no postings.
    pub fn merge(summary: &FieldSummary, inputs: &[&Field], files: &mut SegmentFiles) -> Result<FieldSummary> {
        let forwards: Vec<&ForwardIndex> = inputs.iter().map(|f| &f.forward).collect();
        let (offset, count) = ForwardIndex::merge(summary.kind, &forwards, files)?;

        let mut merged = summary.schema_only();
        if summary.kind.has_inverted() {
            let inverted: Vec<&InvertedIndex> = inputs.iter().filter_map(|f| f.inverted.as_ref()).collect();
            let (dict_offset, dict_len) = InvertedIndex::merge(&summary.name, &inverted, files)?;
            merged.dict_offset = dict_offset;
            merged.dict_len = dict_len;
        }
        merged.forward_offset = offset;
        merged.forward_doc_count = count;
        Ok(merged)
    }
}
