use crate::core::error::{Error, Result};
use crate::core::types::DocId;
use crate::mmap::mmap_file::MmapFile;

/// On-disk size of one posting: `[doc_id:u32 LE][weight:u16 LE]`.
pub const DOC_NODE_SIZE: usize = 6;

/// Scale of tokenized term weights: `round(tf / total * WEIGHT_SCALE)`.
pub const WEIGHT_SCALE: f64 = 10000.0;

/// Posting entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocNode {
    pub doc_id: DocId,
    pub weight: u16,
}

impl DocNode {
    pub fn new(doc_id: DocId, weight: u16) -> Self {
        DocNode { doc_id, weight }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.doc_id.to_le_bytes());
        buf.extend_from_slice(&self.weight.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Self {
        DocNode {
            doc_id: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            weight: u16::from_le_bytes([bytes[4], bytes[5]]),
        }
    }
}

/// Term-frequency weight of a term in a document.
pub fn tf_weight(tf: usize, total: usize) -> u16 {
    if total == 0 {
        return 0;
    }
    (tf as f64 / total as f64 * WEIGHT_SCALE).round() as u16
}

/// Append one `[count:u64][DocNode x count]` record; returns the offset of the count word.
pub fn write_postings(file: &mut MmapFile, nodes: &[DocNode]) -> Result<u64> {
    let mut buf = Vec::with_capacity(8 + nodes.len() * DOC_NODE_SIZE);
    buf.extend_from_slice(&(nodes.len() as u64).to_le_bytes());
    for node in nodes {
        node.encode(&mut buf);
    }
    file.append_bytes(&buf)
}

/// Read the postings record whose count word sits at `offset`.
pub fn read_postings(file: &MmapFile, offset: u64) -> Result<Vec<DocNode>> {
    let count = file.read_u64_le(offset)?;
    let len = count
        .checked_mul(DOC_NODE_SIZE as u64)
        .filter(|len| offset + 8 + len <= file.cursor())
        .ok_or_else(|| {
            Error::corrupt(format!(
                "{}: postings count {} at {} runs past data end {}",
                file.path().display(),
                count,
                offset,
                file.cursor()
            ))
        })?;
    let bytes = file.read_bytes(offset + 8, len)?;
    Ok(bytes.chunks_exact(DOC_NODE_SIZE).map(DocNode::decode).collect())
}

/// Docs present in both lists (both ascending by doc id). Weights add up.
pub fn intersect(a: &[DocNode], b: &[DocNode]) -> Vec<DocNode> {
    let mut result = Vec::new();
    let mut i = 0;
    let mut j = 0;

    while i < a.len() && j < b.len() {
        let (x, y) = (a[i], b[j]);
        if x.doc_id == y.doc_id {
            result.push(DocNode::new(x.doc_id, x.weight.saturating_add(y.weight)));
            i += 1;
            j += 1;
        } else if x.doc_id < y.doc_id {
            i += 1;
        } else {
            j += 1;
        }
    }

    result
}

/// Docs present in either list (both ascending). A doc in both keeps the larger weight.
pub fn union(a: &[DocNode], b: &[DocNode]) -> Vec<DocNode> {
    let mut result = Vec::with_capacity(a.len() + b.len());
    let mut i = 0;
    let mut j = 0;

    while i < a.len() && j < b.len() {
        let (x, y) = (a[i], b[j]);
        if x.doc_id == y.doc_id {
            result.push(DocNode::new(x.doc_id, x.weight.max(y.weight)));
            i += 1;
            j += 1;
        } else if x.doc_id < y.doc_id {
            result.push(x);
            i += 1;
        } else {
            result.push(y);
            j += 1;
        }
    }
    result.extend_from_slice(&a[i..]);
    result.extend_from_slice(&b[j..]);
    result
}
