//! Per-table index manager: owns every B+-tree index declared for one
//! table, maintains them alongside heap writes, and keeps their root page
//! ids mirrored into the catalog.
//!
//! Grounded directly in the original `engine/index_manager.py`: same
//! `{column -> index_name}` / `{index_name -> is_unique}` bookkeeping, the
//! same catalog-write-then-populate order in `create_index`, and the same
//! primary-key-first violation check in `insert_entry`.

use crate::catalog_io;
use crate::row_codec;
use btree::BTree;
use buffer::BufferPoolManager;
use catalog::{CatalogPage, IndexMeta, TableSchema};
use common::{DbError, DbResult, RecordId, RowMap, INVALID_PAGE_ID};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use types::Value;

/// Owns the B+-trees backing every index on one table.
pub struct IndexManager {
    table: String,
    bpm: Arc<BufferPoolManager>,
    catalog: Arc<Mutex<CatalogPage>>,
    page_size: usize,
    trees: HashMap<String, BTree>,
    column_to_index: HashMap<String, String>,
    unique: HashMap<String, bool>,
}

impl IndexManager {
    /// Opens every index already declared for `table` in the catalog,
    /// rooted at whatever page id the catalog currently records.
    pub fn load(
        table: &str,
        bpm: Arc<BufferPoolManager>,
        catalog: Arc<Mutex<CatalogPage>>,
        page_size: usize,
    ) -> DbResult<Self> {
        let mut trees = HashMap::new();
        let mut column_to_index = HashMap::new();
        let mut unique = HashMap::new();
        {
            let cat = catalog.lock();
            let meta = cat.table(table)?;
            for (index_name, index_meta) in &meta.indexes {
                trees.insert(
                    index_name.clone(),
                    BTree::open(Arc::clone(&bpm), index_meta.root_page_id, page_size),
                );
                column_to_index.insert(index_meta.column.clone(), index_name.clone());
                unique.insert(index_name.clone(), index_meta.is_unique);
            }
        }
        Ok(Self {
            table: table.to_string(),
            bpm,
            catalog,
            page_size,
            trees,
            column_to_index,
            unique,
        })
    }

    fn flush_catalog(&self, catalog: &CatalogPage) -> DbResult<()> {
        catalog_io::flush(&self.bpm, catalog, self.page_size)
    }

    fn index_name(&self, column: &str) -> String {
        format!("idx_{}_{}", self.table, column)
    }

    /// Allocates a new empty index over `column`, declares it in the
    /// catalog immediately, then streams `existing_rows` to populate it.
    /// `existing_rows` is the table's current heap contents as raw encoded
    /// row bytes, supplied by the storage engine (this module never reads
    /// the heap itself).
    pub fn create_index(
        &mut self,
        schema: &TableSchema,
        column: &str,
        unique: bool,
        existing_rows: impl IntoIterator<Item = (RecordId, Vec<u8>)>,
    ) -> DbResult<()> {
        let index_name = self.index_name(column);
        if self.trees.contains_key(&index_name) {
            return Err(DbError::Storage(format!("index {index_name} already exists")));
        }

        let tree = BTree::open(Arc::clone(&self.bpm), INVALID_PAGE_ID, self.page_size);

        {
            let mut cat = self.catalog.lock();
            let meta = cat.table_mut(&self.table)?;
            meta.indexes.insert(
                index_name.clone(),
                IndexMeta {
                    name: index_name.clone(),
                    column: column.to_string(),
                    root_page_id: INVALID_PAGE_ID,
                    is_unique: unique,
                },
            );
            self.flush_catalog(&cat)?;
        }

        self.trees.insert(index_name.clone(), tree);
        self.column_to_index.insert(column.to_string(), index_name.clone());
        self.unique.insert(index_name.clone(), unique);

        let col_def = schema
            .column(column)
            .ok_or_else(|| DbError::ColumnNotFound(column.to_string()))?;

        for (rid, row_bytes) in existing_rows {
            let value = row_codec::decode_column(schema, &row_bytes, column)?;
            if value.is_null() {
                continue;
            }
            let key = btree::encode_key(&value, &col_def.sql_type)?;
            let tree = self.trees.get(&index_name).unwrap();
            match tree.insert(key, rid) {
                Ok(()) => {}
                Err(DbError::DuplicateKey) if unique => {
                    return Err(DbError::UniqueViolation {
                        index: index_name,
                        value: format!("{value:?}"),
                    });
                }
                Err(DbError::DuplicateKey) => {}
                Err(e) => return Err(e),
            }
        }

        self.sync_root(&index_name)?;
        tracing::debug!(table = %self.table, index = %index_name, "populated new index");
        Ok(())
    }

    /// Persists `index_name`'s current root page id into the catalog if it
    /// no longer matches what's stored there (a tree split or root collapse
    /// changed it since the last sync).
    fn sync_root(&self, index_name: &str) -> DbResult<()> {
        let current_root = self.trees[index_name].root_page_id();
        let mut cat = self.catalog.lock();
        let meta = cat.table_mut(&self.table)?;
        let stored = meta
            .index_mut(index_name)
            .ok_or_else(|| DbError::Storage(format!("index {index_name} missing from catalog")))?;
        if stored.root_page_id != current_root {
            stored.root_page_id = current_root;
            self.flush_catalog(&cat)?;
        }
        Ok(())
    }

    /// Inserts `(value, rid)` into every index covering a column present
    /// (and non-null) in `row`. A duplicate key becomes a primary-key or
    /// uniqueness violation depending on which constraint the column
    /// carries. A table can carry more than one unique/PK column, so a
    /// violation discovered on the second or later column must undo every
    /// index write this same call already made on earlier columns, the
    /// caller only undoes the heap write, never knows which indexes were
    /// touched, and `column_to_index` iterates in unspecified hash order,
    /// so "earlier" isn't even the column declaration order.
    pub fn insert_entry(&self, schema: &TableSchema, row: &RowMap, rid: RecordId) -> DbResult<()> {
        let mut applied: Vec<(&str, btree::Key)> = Vec::new();
        for (column, index_name) in &self.column_to_index {
            let Some(value) = row.get(column) else { continue };
            if value.is_null() {
                continue;
            }
            let col_def = schema
                .column(column)
                .ok_or_else(|| DbError::ColumnNotFound(column.clone()))?;
            let key = btree::encode_key(value, &col_def.sql_type)?;
            let tree = &self.trees[index_name];
            match tree.insert(key, rid) {
                Ok(()) => {
                    self.sync_root(index_name)?;
                    applied.push((index_name.as_str(), key));
                }
                Err(DbError::DuplicateKey) => {
                    if col_def.primary_key || self.unique.get(index_name).copied().unwrap_or(false) {
                        for (applied_index, applied_key) in applied {
                            let _ = self.trees[applied_index].delete(&applied_key);
                            self.sync_root(applied_index)?;
                        }
                        return Err(if col_def.primary_key {
                            DbError::PkViolation { column: column.clone(), value: format!("{value:?}") }
                        } else {
                            DbError::UniqueViolation { index: index_name.clone(), value: format!("{value:?}") }
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Removes `(value, rid)` from every index covering a column present in
    /// `row`. Mirrors `insert_entry`.
    pub fn delete_entry(&self, schema: &TableSchema, row: &RowMap, _rid: RecordId) -> DbResult<()> {
        for (column, index_name) in &self.column_to_index {
            let Some(value) = row.get(column) else { continue };
            if value.is_null() {
                continue;
            }
            let col_def = schema
                .column(column)
                .ok_or_else(|| DbError::ColumnNotFound(column.clone()))?;
            let key = btree::encode_key(value, &col_def.sql_type)?;
            let tree = &self.trees[index_name];
            tree.delete(&key)?;
            self.sync_root(index_name)?;
        }
        Ok(())
    }

    /// Checks, before an update is applied, that every unique index whose
    /// column value is changing will not collide with an existing row other
    /// than `old_rid` itself.
    pub fn check_uniqueness_for_update(
        &self,
        schema: &TableSchema,
        old_row: &RowMap,
        new_row: &RowMap,
        old_rid: RecordId,
    ) -> DbResult<()> {
        for (column, index_name) in &self.column_to_index {
            if !self.unique.get(index_name).copied().unwrap_or(false) {
                continue;
            }
            let old_value = old_row.get(column);
            let new_value = new_row.get(column);
            if old_value == new_value {
                continue;
            }
            let Some(new_value) = new_value else { continue };
            if new_value.is_null() {
                continue;
            }
            let col_def = schema
                .column(column)
                .ok_or_else(|| DbError::ColumnNotFound(column.clone()))?;
            let key = btree::encode_key(new_value, &col_def.sql_type)?;
            if let Some(existing_rid) = self.trees[index_name].search(&key)? {
                if existing_rid != old_rid {
                    if col_def.primary_key {
                        return Err(DbError::PkViolation {
                            column: column.clone(),
                            value: format!("{new_value:?}"),
                        });
                    }
                    return Err(DbError::UniqueViolation {
                        index: index_name.clone(),
                        value: format!("{new_value:?}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// The tree backing `column`'s index, if one exists.
    pub fn index_for_column(&self, column: &str) -> Option<&BTree> {
        self.column_to_index.get(column).and_then(|name| self.trees.get(name))
    }

    pub fn search_by_column(&self, column: &str, value: &Value, sql_type: &types::SqlType) -> DbResult<Option<RecordId>> {
        let Some(tree) = self.index_for_column(column) else {
            return Ok(None);
        };
        let key = btree::encode_key(value, sql_type)?;
        tree.search(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::ColumnDef;
    use common::PageId;
    use storage::{DiskManager, PAGE_SIZE};
    use types::SqlType;

    fn setup(schema: TableSchema) -> (tempfile::TempDir, Arc<BufferPoolManager>, Arc<Mutex<CatalogPage>>) {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::open(dir.path().join("t.db"), PAGE_SIZE).unwrap();
        let bpm = Arc::new(BufferPoolManager::new(disk, 32));
        let mut catalog = catalog_io::open(&bpm, PAGE_SIZE).unwrap();
        catalog.create_table("t", schema, PageId(1)).unwrap();
        catalog_io::flush(&bpm, &catalog, PAGE_SIZE).unwrap();
        (dir, bpm, Arc::new(Mutex::new(catalog)))
    }

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnDef::new("id", SqlType::Int).primary_key(),
            ColumnDef::new("email", SqlType::Text).unique(),
        ])
    }

    fn row(id: i32, email: &str) -> RowMap {
        RowMap::from_iter([
            ("id".to_string(), Value::Int(id)),
            ("email".to_string(), Value::Text(email.to_string())),
        ])
    }

    #[test]
    fn create_index_then_insert_detects_pk_violation() {
        let (_d, bpm, catalog) = setup(schema());
        let mut im = IndexManager::load("t", Arc::clone(&bpm), Arc::clone(&catalog), PAGE_SIZE).unwrap();
        im.create_index(&schema(), "id", true, std::iter::empty()).unwrap();
        im.create_index(&schema(), "email", true, std::iter::empty()).unwrap();

        let rid1 = RecordId { page_id: PageId(2), offset: 0 };
        im.insert_entry(&schema(), &row(1, "a@x.com"), rid1).unwrap();

        let rid2 = RecordId { page_id: PageId(2), offset: 40 };
        let err = im.insert_entry(&schema(), &row(1, "b@x.com"), rid2).unwrap_err();
        assert!(matches!(err, DbError::PkViolation { .. }));
    }

    #[test]
    fn unique_violation_on_non_pk_column() {
        let (_d, bpm, catalog) = setup(schema());
        let mut im = IndexManager::load("t", Arc::clone(&bpm), Arc::clone(&catalog), PAGE_SIZE).unwrap();
        im.create_index(&schema(), "id", true, std::iter::empty()).unwrap();
        im.create_index(&schema(), "email", true, std::iter::empty()).unwrap();

        let rid1 = RecordId { page_id: PageId(2), offset: 0 };
        im.insert_entry(&schema(), &row(1, "dup@x.com"), rid1).unwrap();

        let rid2 = RecordId { page_id: PageId(2), offset: 40 };
        let err = im.insert_entry(&schema(), &row(2, "dup@x.com"), rid2).unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[test]
    fn delete_entry_removes_from_every_index() {
        let (_d, bpm, catalog) = setup(schema());
        let mut im = IndexManager::load("t", Arc::clone(&bpm), Arc::clone(&catalog), PAGE_SIZE).unwrap();
        im.create_index(&schema(), "id", true, std::iter::empty()).unwrap();

        let rid = RecordId { page_id: PageId(2), offset: 0 };
        im.insert_entry(&schema(), &row(5, "x@x.com"), rid).unwrap();
        assert!(im.index_for_column("id").unwrap().search(&btree::encode_key(&Value::Int(5), &SqlType::Int).unwrap()).unwrap().is_some());

        im.delete_entry(&schema(), &row(5, "x@x.com"), rid).unwrap();
        assert!(im.index_for_column("id").unwrap().search(&btree::encode_key(&Value::Int(5), &SqlType::Int).unwrap()).unwrap().is_none());
    }

    #[test]
    fn check_uniqueness_for_update_allows_same_rid() {
        let (_d, bpm, catalog) = setup(schema());
        let mut im = IndexManager::load("t", Arc::clone(&bpm), Arc::clone(&catalog), PAGE_SIZE).unwrap();
        im.create_index(&schema(), "email", true, std::iter::empty()).unwrap();

        let rid = RecordId { page_id: PageId(2), offset: 0 };
        im.insert_entry(&schema(), &row(1, "a@x.com"), rid).unwrap();

        // Changing to a fresh value is fine.
        im.check_uniqueness_for_update(&schema(), &row(1, "a@x.com"), &row(1, "b@x.com"), rid)
            .unwrap();

        // Colliding with someone else's row is not.
        let rid2 = RecordId { page_id: PageId(2), offset: 40 };
        im.insert_entry(&schema(), &row(2, "taken@x.com"), rid2).unwrap();
        let err = im
            .check_uniqueness_for_update(&schema(), &row(1, "a@x.com"), &row(1, "taken@x.com"), rid)
            .unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[test]
    fn create_index_populates_from_existing_rows() {
        let (_d, bpm, catalog) = setup(schema());
        let mut im = IndexManager::load("t", Arc::clone(&bpm), Arc::clone(&catalog), PAGE_SIZE).unwrap();

        let rid = RecordId { page_id: PageId(2), offset: 0 };
        let bytes = row_codec::encode_row(&schema(), &row(9, "z@x.com")).unwrap();
        im.create_index(&schema(), "id", true, vec![(rid, bytes)]).unwrap();

        assert_eq!(
            im.index_for_column("id")
                .unwrap()
                .search(&btree::encode_key(&Value::Int(9), &SqlType::Int).unwrap())
                .unwrap(),
            Some(rid)
        );
    }
}
