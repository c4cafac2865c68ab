use std::sync::Arc;
use crate::core::error::{Error, Result};
use crate::core::types::DocId;
use crate::schema::schema::{format_date, FieldKind, StoredValue, MISSING_NUMBER};
use crate::search::filter::CompiledFilter;
use crate::storage::segment::SegmentFiles;

/// Forward-array word marking a string value that was never written (fake ranges).
const MISSING_STRING_OFFSET: u64 = u64::MAX;

/// Per-field positional value store, indexed by `doc_id - start_doc_id`.
///
/// On disk a field owns `doc_count` consecutive u64 LE words of the partition's
/// `.fwd` file starting at `offset`. Numeric kinds store the value itself; string
/// kinds store the offset of a `[len:u64][bytes]` record in the `.ext` file.
pub struct ForwardIndex {
    kind: FieldKind,
    start_doc_id: DocId,
    next_doc_id: DocId,
    store: ForwardStore,
}

enum ForwardStore {
    Numbers(Vec<i64>),
    Strings(Vec<String>),
    Disk {
        files: Arc<SegmentFiles>,
        offset: u64,
    },
    /// Stand-in for a field a partition never had: every position is missing.
    Fake,
}

impl ForwardIndex {
    pub fn new(kind: FieldKind, start_doc_id: DocId) -> Self {
        let store = if kind.is_numeric() {
            ForwardStore::Numbers(Vec::new())
        } else {
            ForwardStore::Strings(Vec::new())
        };
        ForwardIndex {
            kind,
            start_doc_id,
            next_doc_id: start_doc_id,
            store,
        }
    }

    pub fn open(kind: FieldKind, start_doc_id: DocId, files: Arc<SegmentFiles>, offset: u64, count: u64) -> Self {
        ForwardIndex {
            kind,
            start_doc_id,
            next_doc_id: start_doc_id + count as DocId,
            store: ForwardStore::Disk { files, offset },
        }
    }

    pub fn fake(kind: FieldKind, start_doc_id: DocId, count: u64) -> Self {
        ForwardIndex {
            kind,
            start_doc_id,
            next_doc_id: start_doc_id + count as DocId,
            store: ForwardStore::Fake,
        }
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn in_memory(&self) -> bool {
        matches!(self.store, ForwardStore::Numbers(_) | ForwardStore::Strings(_))
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

    pub fn add(&mut self, doc_id: DocId, value: &StoredValue) -> Result<()> {
        if doc_id != self.next_doc_id {
            return Err(Error::wrong_doc_id(self.next_doc_id, doc_id));
        }
        match (&mut self.store, value) {
            (ForwardStore::Numbers(values), StoredValue::Number(n)) => values.push(*n),
            (ForwardStore::Strings(values), StoredValue::Text(s)) => values.push(s.clone()),
            (ForwardStore::Numbers(_), _) | (ForwardStore::Strings(_), _) => {
                return Err(Error::type_mismatch(
                    &format!("{:?} forward index", self.kind),
                    format!("cannot store {:?}", value),
                ));
            }
            _ => return Err(Error::unsupported("add on a persisted forward index")),
        }
        self.next_doc_id += 1;
        Ok(())
    }

    /// Overwrite a numeric value; strings are never updated in place.
    pub fn update(&mut self, doc_id: DocId, value: i64) -> Result<()> {
        let pos = self.position(doc_id)?;
        match &mut self.store {
            ForwardStore::Numbers(values) => {
                values[pos as usize] = value;
                Ok(())
            }
            _ => self.update_shared(doc_id, value),
        }
    }

    /// In-place update of a persisted numeric value through the shared forward file.
    pub fn update_shared(&self, doc_id: DocId, value: i64) -> Result<()> {
        if !self.kind.is_updatable() {
            return Err(Error::unsupported(format!("update on {:?} forward index", self.kind)));
        }
        let pos = self.position(doc_id)?;
        match &self.store {
            ForwardStore::Disk { files, offset } => {
                let at = offset + pos * 8;
                files.with_fwd_mut(|fwd| fwd.write_i64_le(at, value))
            }
            ForwardStore::Fake => Err(Error::unsupported("update on a missing field")),
            _ => Err(Error::internal("shared update on an in-memory forward index")),
        }
    }

    fn position(&self, doc_id: DocId) -> Result<u64> {
        if doc_id < self.start_doc_id || doc_id >= self.next_doc_id {
            return Err(Error::not_found("doc", &doc_id.to_string()));
        }
        Ok((doc_id - self.start_doc_id) as u64)
    }

    /// Numeric value at local position `pos`; `None` when missing or not numeric.
    pub fn get_int(&self, pos: u64) -> Option<i64> {
        if !self.kind.is_numeric() || pos >= self.doc_count() {
            return None;
        }
        let value = match &self.store {
            ForwardStore::Numbers(values) => values[pos as usize],
            ForwardStore::Disk { files, offset } => files.fwd().read_i64_le(offset + pos * 8).ok()?,
            _ => return None,
        };
        (value != MISSING_NUMBER).then_some(value)
    }

    /// String form of the value at `pos`. Dates render as local `YYYY-MM-DD HH:MM:SS`.
    pub fn get_string(&self, pos: u64) -> Option<String> {
        if pos >= self.doc_count() {
            return None;
        }
        if self.kind.is_numeric() {
            let value = self.get_int(pos)?;
            return if self.kind == FieldKind::Date {
                format_date(value)
            } else {
                Some(value.to_string())
            };
        }
        match &self.store {
            ForwardStore::Strings(values) => Some(values[pos as usize].clone()),
            ForwardStore::Disk { files, offset } => {
                let record = files.fwd().read_u64_le(offset + pos * 8).ok()?;
                if record == MISSING_STRING_OFFSET {
                    return None;
                }
                let len = files.ext.read_u64_le(record).ok()?;
                files.ext.read_str(record + 8, len).ok()
            }
            _ => None,
        }
    }

    pub fn filter(&self, pos: u64, filter: &CompiledFilter) -> bool {
        if self.kind.is_numeric() {
            filter.matches_number(self.get_int(pos))
        } else {
            filter.matches_text(self.get_string(pos).as_deref())
        }
    }

    /// Append the in-memory values to the segment's `.fwd` (and `.ext`) files.
    /// Returns `(offset, doc_count)`; the index stays in memory until `attach`.
    pub fn persist(&self, files: &mut SegmentFiles) -> Result<(u64, u64)> {
        let offset = files.fwd_mut().cursor();
        match &self.store {
            ForwardStore::Numbers(values) => {
                let fwd = files.fwd_mut();
                for value in values {
                    fwd.append_i64(*value)?;
                }
            }
            ForwardStore::Strings(values) => {
                for value in values {
                    let record = append_string(files, value)?;
                    files.fwd_mut().append_u64(record)?;
                }
            }
            _ => return Err(Error::internal("persist of a forward index that is not in memory")),
        }
        Ok((offset, self.doc_count()))
    }

    /// Switch to disk-backed mode over the region written by `persist`/`merge`.
    pub fn attach(&mut self, files: Arc<SegmentFiles>, offset: u64, count: u64) {
        self.next_doc_id = self.start_doc_id + count as DocId;
        self.store = ForwardStore::Disk { files, offset };
    }

    /// Concatenate `inputs` (ascending id ranges) into `files`; strings get a fresh
    /// `.ext` offset chain. Returns `(offset, doc_count)`.
    pub fn merge(kind: FieldKind, inputs: &[&ForwardIndex], files: &mut SegmentFiles) -> Result<(u64, u64)> {
        let offset = files.fwd_mut().cursor();
        let mut count = 0u64;

        for input in inputs {
            for pos in 0..input.doc_count() {
                if kind.is_numeric() {
                    let value = input.get_int(pos).unwrap_or(MISSING_NUMBER);
                    files.fwd_mut().append_i64(value)?;
                } else {
                    let record = match input.get_string(pos) {
                        Some(value) => append_string(files, &value)?,
                        None => MISSING_STRING_OFFSET,
                    };
                    files.fwd_mut().append_u64(record)?;
                }
            }
            count += input.doc_count();
        }

        Ok((offset, count))
    }
}

fn append_string(files: &mut SegmentFiles, value: &str) -> Result<u64> {
    let record = files.ext.append_u64(value.len() as u64)?;
    files.ext.append_str(value)?;
    Ok(record)
}
