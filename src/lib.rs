pub mod core;
pub mod storage;
pub mod analysis;
pub mod schema;
pub mod index;
pub mod search;
pub mod mmap;

pub use crate::core::config::Config;
pub use crate::core::database::Database;
pub use crate::core::engine::Engine;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::table::{MaintenanceHandle, Table, TableMeta, TableStats};
pub use crate::core::types::{document, document_from_json, DocId, DocInfo, Document, Value};
pub use crate::schema::schema::{FieldKind, FieldSummary};
pub use crate::search::filter::{Filter, FilterOp};
pub use crate::search::query::{Query, SearchRequest, TermClause};

/*
  Engine ── Database ── Table ─┬─ Partition (sealed, Arc) ─┬─ Field ─┬─ ForwardIndex ─┐
                               │                           │         └─ InvertedIndex ┼─ SegmentFiles
                               ├─ Partition (in memory)    └─ SegmentFiles          │   (.fwd .ext .ivt: MmapFile,
                               ├─ KvStore  (primary keys)                           │    .dict: fst maps)
                               └─ Bitmap   (deleted docs)                           ┘

  writes: Table → mem Partition → Field → {ForwardIndex, InvertedIndex}
  seal:   mem Partition → <table>_pNNNNNN.{meta,fwd,ext,ivt,dict}
  merge:  contiguous sealed run → one new sealed partition, old files removed on last drop
*/
