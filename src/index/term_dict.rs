use std::io::Write;
use std::ops::Range;
use std::sync::Arc;
use fst::map::{IndexedValue, OpBuilder};
use fst::{IntoStreamer, Map, MapBuilder, Streamer};
use memmap2::Mmap;
use crate::core::error::{Error, Result};

/// A window of a mapped dictionary file holding exactly one FST.
#[derive(Clone)]
pub struct DictBytes {
    map: Arc<Mmap>,
    range: Range<usize>,
}

impl DictBytes {
    pub fn new(map: Arc<Mmap>, offset: u64, len: u64) -> Result<Self> {
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|end| *end <= map.len())
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "term dictionary [{}, +{}) outside a {} byte file",
                    offset,
                    len,
                    map.len()
                ))
            })?;
        Ok(DictBytes { map, range: start..end })
    }
}

impl AsRef<[u8]> for DictBytes {
    fn as_ref(&self) -> &[u8] {
        &self.map[self.range.clone()]
    }
}

/// Immutable term → postings-offset map of one sealed field, read straight from
/// the partition's `.dict` file.
pub struct TermDict {
    map: Map<DictBytes>,
}

impl TermDict {
    pub fn open(bytes: DictBytes) -> Result<Self> {
        Ok(TermDict { map: Map::new(bytes)? })
    }

    pub fn get(&self, term: &str) -> Option<u64> {
        self.map.get(term.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Smallest term and its offset.
    pub fn first(&self) -> Option<(String, u64)> {
        let mut stream = self.map.stream();
        stream
            .next()
            .map(|(term, offset)| (String::from_utf8_lossy(term).into_owned(), offset))
    }

    /// Smallest term strictly greater than `term`.
    pub fn next(&self, term: &str) -> Option<(String, u64)> {
        let mut stream = self.map.range().gt(term.as_bytes()).into_stream();
        stream
            .next()
            .map(|(term, offset)| (String::from_utf8_lossy(term).into_owned(), offset))
    }

    /// Walk the union of `dicts` in ascending term order. For every term, `visit`
    /// receives the offsets of the dictionaries holding it, ordered by position in
    /// `dicts`.
    pub fn union_each<F>(dicts: &[&TermDict], mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[(usize, u64)]) -> Result<()>,
    {
        let op = dicts.iter().fold(OpBuilder::new(), |op, dict| op.add(&dict.map));
        let mut union = op.union();
        let mut hits: Vec<(usize, u64)> = Vec::with_capacity(dicts.len());
        while let Some((term, values)) = union.next() {
            hits.clear();
            hits.extend(values.iter().map(|v: &IndexedValue| (v.index, v.value)));
            hits.sort_unstable_by_key(|&(index, _)| index);
            visit(term, &hits)?;
        }
        Ok(())
    }
}

/// Streams one field's dictionary into a shared writer. Terms must arrive in
/// strictly ascending byte order.
pub struct TermDictBuilder<W: Write> {
    builder: MapBuilder<CountingWriter<W>>,
}

impl<W: Write> TermDictBuilder<W> {
    pub fn new(out: W) -> Result<Self> {
        Ok(TermDictBuilder {
            builder: MapBuilder::new(CountingWriter { inner: out, written: 0 })?,
        })
    }

    pub fn insert(&mut self, term: &[u8], offset: u64) -> Result<()> {
        self.builder.insert(term, offset)?;
        Ok(())
    }

    /// Finish the FST; returns the number of bytes it occupies.
    pub fn finish(self) -> Result<u64> {
        let out = self.builder.into_inner()?;
        Ok(out.written)
    }
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn build(out: &mut Vec<u8>, terms: &[(&str, u64)]) -> (u64, u64) {
        let offset = out.len() as u64;
        let mut builder = TermDictBuilder::new(&mut *out).unwrap();
        for (term, value) in terms {
            builder.insert(term.as_bytes(), *value).unwrap();
        }
        (offset, builder.finish().unwrap())
    }

    fn mapped(dir: &TempDir, bytes: &[u8]) -> Arc<Mmap> {
        let path = dir.path().join("t.dict");
        std::fs::write(&path, bytes).unwrap();
        let file = File::open(&path).unwrap();
        Arc::new(unsafe { Mmap::map(&file).unwrap() })
    }

    #[test]
    fn two_dictionaries_in_one_file() {
        let dir = TempDir::new().unwrap();
        let mut out = Vec::new();
        let (a_off, a_len) = build(&mut out, &[("apple", 8), ("pear", 40)]);
        let (b_off, b_len) = build(&mut out, &[("kiwi", 16)]);
        assert_eq!(a_off + a_len, b_off);
        assert_eq!(b_off + b_len, out.len() as u64);

        let map = mapped(&dir, &out);
        let a = TermDict::open(DictBytes::new(map.clone(), a_off, a_len).unwrap()).unwrap();
        let b = TermDict::open(DictBytes::new(map, b_off, b_len).unwrap()).unwrap();

        assert_eq!(a.get("pear"), Some(40));
        assert_eq!(a.get("kiwi"), None);
        assert_eq!(b.get("kiwi"), Some(16));
        assert_eq!(a.len(), 2);

        assert_eq!(a.first(), Some(("apple".to_string(), 8)));
        assert_eq!(a.next("apple"), Some(("pear".to_string(), 40)));
        assert_eq!(a.next("banana"), Some(("pear".to_string(), 40)));
        assert_eq!(a.next("pear"), None);
    }

    #[test]
    fn out_of_order_terms_are_rejected() {
        let mut out = Vec::new();
        let mut builder = TermDictBuilder::new(&mut out).unwrap();
        builder.insert(b"b", 1).unwrap();
        assert!(builder.insert(b"a", 2).is_err());
    }

    #[test]
    fn window_outside_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let map = mapped(&dir, b"short");
        assert!(DictBytes::new(map, 2, 10).is_err());
    }

    #[test]
    fn union_reports_sources_in_order() {
        let dir = TempDir::new().unwrap();
        let mut out = Vec::new();
        let (a_off, a_len) = build(&mut out, &[("blue", 1), ("red", 2)]);
        let (b_off, b_len) = build(&mut out, &[("blue", 3), ("green", 4)]);
        let (e_off, e_len) = build(&mut out, &[]);
        let map = mapped(&dir, &out);
        let a = TermDict::open(DictBytes::new(map.clone(), a_off, a_len).unwrap()).unwrap();
        let b = TermDict::open(DictBytes::new(map.clone(), b_off, b_len).unwrap()).unwrap();
        let empty = TermDict::open(DictBytes::new(map, e_off, e_len).unwrap()).unwrap();
        assert!(empty.is_empty());

        let mut seen = Vec::new();
        TermDict::union_each(&[&b, &empty, &a], |term, hits| {
            seen.push((String::from_utf8(term.to_vec()).unwrap(), hits.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                ("blue".to_string(), vec![(0, 3), (2, 1)]),
                ("green".to_string(), vec![(0, 4)]),
                ("red".to_string(), vec![(2, 2)]),
            ]
        );
    }
}
