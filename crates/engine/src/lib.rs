//! Ties the table heap, the B+-tree indexes, and the deferred-write
//! transaction log into one public API. Everything above this crate (a
//! future SQL layer, or the integration tests below) drives the database
//! exclusively through `StorageEngine`, nothing here exposes a raw page
//! or a raw B+-tree to a caller outside this crate.

pub mod catalog_io;
pub mod index_manager;
pub mod row_codec;
pub mod storage_engine;
pub mod transaction;

pub use index_manager::IndexManager;
pub use storage_engine::StorageEngine;
pub use transaction::{TransactionManager, WriteOp, WriteRecord};
