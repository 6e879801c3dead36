//! Catalog page: the single page-0 directory of tables, schemas, and index
//! roots. Persisted as length-implicit JSON padded with zero bytes to the
//! page size, mirroring the way `storage::heap_page` pads its own directory
//! page, the catalog just has a richer payload.
//!
//! The `CatalogPage` type owns the whole in-memory document; the storage
//! engine is the only caller that mutates it, and every mutation ends with a
//! `serialize` + buffer-pool flush (see `engine::StorageEngine`).

use common::{ColumnId, DbError, DbResult, PageId};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use types::{SqlType, Value};

/// A single column in a table's schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub primary_key: bool,
    pub unique: bool,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub default: Option<Value>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            primary_key: false,
            unique: false,
            length: None,
            precision: None,
            scale: None,
            default: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// A PRIMARY_KEY or UNIQUE constraint both demand a backing unique index.
    pub fn needs_unique_index(&self) -> bool {
        self.primary_key || self.unique
    }
}

/// Ordered column list for one table, in schema (insertion) order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn column_index(&self, name: &str) -> Option<ColumnId> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .map(|i| i as ColumnId)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_by_id(&self, id: ColumnId) -> Option<&ColumnDef> {
        self.columns.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Metadata for one B+-tree index: which column it covers, whether it
/// enforces uniqueness, and its current root page. The root changes over
/// the index's lifetime as it splits; every change must be persisted here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    pub column: String,
    pub root_page_id: PageId,
    pub is_unique: bool,
}

/// Catalog entry for one table: where its heap lives, its schema, and the
/// indexes built over it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TableMeta {
    pub heap_root_page_id: PageId,
    pub schema: TableSchema,
    pub indexes: HashMap<String, IndexMeta>,
}

impl TableMeta {
    pub fn new(heap_root_page_id: PageId, schema: TableSchema) -> Self {
        Self {
            heap_root_page_id,
            schema,
            indexes: HashMap::new(),
        }
    }

    pub fn index_for_column(&self, column: &str) -> Option<&IndexMeta> {
        self.indexes.values().find(|idx| idx.column == column)
    }

    pub fn index(&self, name: &str) -> Option<&IndexMeta> {
        self.indexes.get(name)
    }

    pub fn index_mut(&mut self, name: &str) -> Option<&mut IndexMeta> {
        self.indexes.get_mut(name)
    }
}

/// The page-0 catalog: a map from table name to its metadata. Always loads
/// from and persists to a single fixed-size page.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CatalogPage {
    pub tables: HashMap<String, TableMeta>,
}

impl CatalogPage {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    /// Serializes to JSON and zero-pads to exactly `page_size` bytes.
    /// Fails if the document doesn't fit in one page.
    pub fn serialize(&self, page_size: usize) -> DbResult<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| DbError::Catalog(format!("serialize: {e}")))?;
        if json.len() > page_size {
            return Err(DbError::PageFull);
        }
        let mut buf = vec![0u8; page_size];
        buf[..json.len()].copy_from_slice(&json);
        Ok(buf)
    }

    /// Reads the JSON document up to the first zero byte. An all-zero page
    /// (the page buffer allocated for a brand new database file) decodes to
    /// an empty catalog rather than an error.
    pub fn deserialize(buf: &[u8]) -> DbResult<Self> {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if end == 0 {
            return Ok(Self::new());
        }
        serde_json::from_slice(&buf[..end])
            .map_err(|e| DbError::Decode(format!("catalog: {e}")))
    }

    pub fn table(&self, name: &str) -> DbResult<&TableMeta> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn table_mut(&mut self, name: &str) -> DbResult<&mut TableMeta> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn create_table(
        &mut self,
        name: &str,
        schema: TableSchema,
        heap_root_page_id: PageId,
    ) -> DbResult<()> {
        if self.tables.contains_key(name) {
            return Err(DbError::TableExists(name.to_string()));
        }
        self.tables
            .insert(name.to_string(), TableMeta::new(heap_root_page_id, schema));
        Ok(())
    }

    pub fn table_names(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }
}
