use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use crate::analysis::tokenizer::Tokenizer;
use crate::core::error::{Error, Result};
use crate::core::types::DocId;
use crate::index::posting::{read_postings, tf_weight, write_postings, DocNode};
use crate::index::term_dict::{TermDict, TermDictBuilder};
use crate::schema::schema::{FieldKind, TermRule};
use crate::storage::segment::SegmentFiles;

/// Per-field term → postings index.
///
/// In memory the postings live in an ordered map. Once persisted, postings are
/// `[count:u64][DocNode x count]` records in the partition's `.ivt` file and the
/// field's FST in the `.dict` file maps each term to its record offset.
pub struct InvertedIndex {
    field: String,
    kind: FieldKind,
    rule: TermRule,
    next_doc_id: DocId,
    store: InvertedStore,
}

enum InvertedStore {
    Memory(BTreeMap<String, Vec<DocNode>>),
    Disk { files: Arc<SegmentFiles>, dict: TermDict },
}

impl InvertedIndex {
    /// `None` for kinds without an inverted index.
    pub fn new(field: &str, kind: FieldKind, start_doc_id: DocId) -> Option<Self> {
        Some(InvertedIndex {
            field: field.to_string(),
            kind,
            rule: kind.term_rule()?,
            next_doc_id: start_doc_id,
            store: InvertedStore::Memory(BTreeMap::new()),
        })
    }

    pub fn open(field: &str, kind: FieldKind, next_doc_id: DocId, files: Arc<SegmentFiles>, dict: TermDict) -> Option<Self> {
        Some(InvertedIndex {
            field: field.to_string(),
            kind,
            rule: kind.term_rule()?,
            next_doc_id,
            store: InvertedStore::Disk { files, dict },
        })
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn in_memory(&self) -> bool {
        matches!(self.store, InvertedStore::Memory(_))
    }

    pub fn next_doc_id(&self) -> DocId {
        self.next_doc_id
    }

    /// Distinct terms in the index.
    pub fn term_count(&self) -> usize {
        match &self.store {
            InvertedStore::Memory(terms) => terms.len(),
            InvertedStore::Disk { dict, .. } => dict.len(),
        }
    }

    /// Terms and weights `content` contributes to one document.
    pub fn terms_for(rule: TermRule, content: &str, tokenizer: &dyn Tokenizer) -> Vec<(String, u16)> {
        match rule {
            TermRule::Whole => {
                if content.is_empty() {
                    Vec::new()
                } else {
                    vec![(content.to_string(), 0)]
                }
            }
            TermRule::List => {
                let mut terms: Vec<(String, u16)> = Vec::new();
                for item in content.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                    if !terms.iter().any(|(t, _)| t == item) {
                        terms.push((item.to_string(), 0));
                    }
                }
                terms
            }
            TermRule::SingleChar => {
                let mut terms: Vec<(String, u16)> = Vec::new();
                for c in content.chars() {
                    let term = c.to_string();
                    if !terms.iter().any(|(t, _)| *t == term) {
                        terms.push((term, 0));
                    }
                }
                terms
            }
            TermRule::Tokenized => {
                let tokens: Vec<String> = tokenizer
                    .split(content, true)
                    .into_iter()
                    .filter(|t| !t.is_empty())
                    .collect();
                let total = tokens.len();

                let mut order = Vec::new();
                let mut freq: HashMap<String, usize> = HashMap::new();
                for token in tokens {
                    let tf = freq.entry(token.clone()).or_insert(0);
                    if *tf == 0 {
                        order.push(token);
                    }
                    *tf += 1;
                }
                order
                    .into_iter()
                    .map(|term| {
                        let tf = freq.get(&term).copied().unwrap_or(0);
                        (term, tf_weight(tf, total))
                    })
                    .collect()
            }
        }
    }

    pub fn add(&mut self, doc_id: DocId, content: &str, tokenizer: &dyn Tokenizer) -> Result<()> {
        if doc_id != self.next_doc_id {
            return Err(Error::wrong_doc_id(self.next_doc_id, doc_id));
        }
        let InvertedStore::Memory(terms) = &mut self.store else {
            return Err(Error::unsupported("add on a persisted inverted index"));
        };
        for (term, weight) in Self::terms_for(self.rule, content, tokenizer) {
            terms.entry(term).or_default().push(DocNode::new(doc_id, weight));
        }
        self.next_doc_id += 1;
        Ok(())
    }

    /// Postings of one raw term, ascending by doc id.
    pub fn query_term(&self, term: &str) -> Result<Option<Vec<DocNode>>> {
        match &self.store {
            InvertedStore::Memory(terms) => Ok(terms.get(term).cloned()),
            InvertedStore::Disk { files, dict } => match dict.get(term) {
                Some(offset) => Ok(Some(read_postings(&files.ivt, offset)?)),
                None => Ok(None),
            },
        }
    }

    /// Write every term's postings in ascending term order followed by the
    /// field's dictionary. Returns the dictionary's `(offset, len)` in `.dict`.
    pub fn persist(&self, files: &mut SegmentFiles) -> Result<(u64, u64)> {
        let InvertedStore::Memory(terms) = &self.store else {
            return Err(Error::internal("persist of an inverted index that is not in memory"));
        };
        let (ivt, out, offset) = files.postings_and_dict()?;
        let mut dict = TermDictBuilder::new(out)?;
        for (term, postings) in terms {
            let at = write_postings(ivt, postings)?;
            dict.insert(term.as_bytes(), at)?;
        }
        let len = dict.finish()?;
        files.dict_written(len);
        log::debug!("field '{}': persisted {} terms", self.field, terms.len());
        Ok((offset, len))
    }

    /// Drop the in-memory postings and read from `files` from now on.
    pub fn attach(&mut self, files: Arc<SegmentFiles>, dict: TermDict) {
        self.store = InvertedStore::Disk { files, dict };
    }

    /// K-way merge of the inputs' dictionaries into `files`. Inputs must be in
    /// ascending doc-id range order; postings of equal terms are concatenated in
    /// that order, which keeps every merged list ascending. Returns the merged
    /// dictionary's `(offset, len)`.
    pub fn merge(field: &str, inputs: &[&InvertedIndex], files: &mut SegmentFiles) -> Result<(u64, u64)> {
        let mut sources = Vec::with_capacity(inputs.len());
        let mut dicts = Vec::with_capacity(inputs.len());
        for input in inputs {
            match &input.store {
                InvertedStore::Disk { files: source, dict } => {
                    sources.push(source.as_ref());
                    dicts.push(dict);
                }
                InvertedStore::Memory(_) => {
                    return Err(Error::internal("merge input inverted index is not persisted"));
                }
            }
        }

        let (ivt, out, offset) = files.postings_and_dict()?;
        let mut dict = TermDictBuilder::new(out)?;
        let mut terms = 0usize;
        TermDict::union_each(&dicts, |term, hits| {
            let mut merged = Vec::new();
            for &(source, at) in hits {
                merged.extend(read_postings(&sources[source].ivt, at)?);
            }
            let at = write_postings(&mut *ivt, &merged)?;
            dict.insert(term, at)?;
            terms += 1;
            Ok(())
        })?;
        let len = dict.finish()?;
        files.dict_written(len);
        log::debug!("field '{}': merged {} terms from {} inputs", field, terms, inputs.len());
        Ok((offset, len))
    }
}
