//! Shared identifiers, error taxonomy, and configuration for the storage
//! stack. Every other crate in the workspace depends on this one and nothing
//! in here depends back on them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use thiserror::Error;
use types::Value;

/// Identifier for a column within a table schema, assigned by insertion
/// order in the schema (0-based).
/// Examples:
/// - `let id_col: ColumnId = 0;`
/// - `let price_col: ColumnId = 4;`
pub type ColumnId = u16;

/// Logical identifier for a page in the storage layer. Signed so that
/// `INVALID_PAGE_ID` can be represented without an `Option` wrapper at every
/// call site that crosses a page-layout boundary (B+-tree pointers are
/// themselves signed on disk).
/// Examples:
/// - `let catalog_page = PageId(0);`
/// - `let empty_tree_root = INVALID_PAGE_ID;`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub i64);

/// Sentinel for "no page": an empty tree's root, or a leaf's missing
/// sibling.
pub const INVALID_PAGE_ID: PageId = PageId(-1);

impl PageId {
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

/// Fully-qualified identifier for a record within a data page. Stable only
/// until the row is relocated by an update that must grow the cell.
/// Examples:
/// - `let rid = RecordId { page_id: PageId(42), offset: 0 };`
/// - `let rid = RecordId { page_id: PageId(1), offset: 212 };`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub page_id: PageId,
    pub offset: u32,
}

/// Named projection of a row keyed by column name, the unit of exchange
/// between the storage engine and its callers.
/// Examples:
/// - `let mut row = RowMap::new(); row.insert("id".into(), Value::Int(1));`
/// - `let row = RowMap::from([("email".into(), Value::Text("a@b.com".into()))]);`
pub type RowMap = HashMap<String, Value>;

/// Canonical error type shared across the storage stack. Variants below
/// correspond 1:1 to the error kinds named in the component contracts
/// (`no-frame`, `page-corrupt`, `pk-violation`, ...); `Storage`/`Catalog` stay
/// as free-form wrappers for failures that don't need their own variant.
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("storage: {0}")]
    Storage(String),
    #[error("catalog: {0}")]
    Catalog(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("no free frame available in the buffer pool")]
    NoFrame,
    #[error("page is full")]
    PageFull,
    #[error("page is corrupt: {0}")]
    PageCorrupt(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("table already exists: {0}")]
    TableExists(String),
    #[error("column not found: {0}")]
    ColumnNotFound(String),
    #[error("primary key violation on column {column}: value {value}")]
    PkViolation { column: String, value: String },
    #[error("uniqueness violation on index {index}: value {value}")]
    UniqueViolation { index: String, value: String },
    #[error("duplicate key")]
    DuplicateKey,
    #[error("update failed: {0}")]
    UpdateFailed(String),
    #[error("no active transaction {0}")]
    NoTxn(u64),
    #[error("transaction {0} is already active")]
    NestedTxn(u64),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for the storage stack.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .data_dir(PathBuf::from("./my_db"))
///     .page_size(4096)
///     .buffer_pool_pages(64)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Directory where the database file lives.
    #[builder(default = std::path::PathBuf::from("./db_data"))]
    pub data_dir: std::path::PathBuf,
    /// Fixed-size page allocation in bytes.
    #[builder(default = 4096)]
    pub page_size: usize,
    /// Number of frames the buffer pool keeps resident.
    #[builder(default = 256)]
    pub buffer_pool_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: std::path::PathBuf::from("./db_data"),
            page_size: 4096,
            buffer_pool_pages: 256,
        }
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{Config, DbError, DbResult, PageId, RecordId, RowMap, INVALID_PAGE_ID};
    pub use types::{SqlType, Value};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_page_id_is_negative() {
        assert!(!INVALID_PAGE_ID.is_valid());
        assert!(PageId(0).is_valid());
    }

    #[test]
    fn config_defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.page_size, 4096);
        assert_eq!(cfg.buffer_pool_pages, 256);
    }

    #[test]
    fn config_builder_overrides_defaults() {
        let cfg = Config::builder().page_size(8192).buffer_pool_pages(16).build();
        assert_eq!(cfg.page_size, 8192);
        assert_eq!(cfg.buffer_pool_pages, 16);
    }

    #[test]
    fn record_id_equality_is_by_value() {
        let a = RecordId { page_id: PageId(1), offset: 0 };
        let b = RecordId { page_id: PageId(1), offset: 0 };
        let c = RecordId { page_id: PageId(1), offset: 4 };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
