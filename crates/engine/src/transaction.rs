//! Deferred-write transaction bookkeeping.
//!
//! Grounded in `original_source/engine/transaction_manager.py`: a
//! transaction is nothing but an id, a state, and an ordered write set.
//! Writes made under a transaction id are captured here and only replayed
//! through the storage engine's immediate primitives on commit, see
//! `spec.md` §9, open question 1, and `StorageEngine::commit_transaction`.
//! This module holds no reference back to the storage engine; it is pure
//! bookkeeping, replayed by a caller that does own one.

use common::{DbError, DbResult, RecordId, RowMap};
use hashbrown::HashMap;

/// Which heap/index mutation a write-set entry represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Delete,
    Update,
}

/// One pending mutation recorded against a transaction, carrying enough of
/// the decoded row to replay through the immediate primitives later.
#[derive(Clone, Debug)]
pub struct WriteRecord {
    pub op: WriteOp,
    pub table: String,
    pub rid: Option<RecordId>,
    pub old_dict: Option<RowMap>,
    pub new_dict: Option<RowMap>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    Aborted,
}

struct Transaction {
    state: TxnState,
    write_set: Vec<WriteRecord>,
}

/// Tracks every in-flight transaction's write set. Does not itself apply
/// any write. `StorageEngine` owns replay, this type owns only the
/// bookkeeping, so there is no cyclic reference between the two.
#[derive(Default)]
pub struct TransactionManager {
    next_id: u64,
    transactions: HashMap<u64, Transaction>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self { next_id: 0, transactions: HashMap::new() }
    }

    /// Starts a new transaction and returns its id. `requested_id` lets a
    /// caller ask for a specific id (e.g. a client reconnecting a known
    /// session); passing one already active raises *nested-txn*.
    pub fn begin(&mut self, requested_id: Option<u64>) -> DbResult<u64> {
        let id = match requested_id {
            Some(id) => {
                if self.transactions.contains_key(&id) {
                    return Err(DbError::NestedTxn(id));
                }
                id
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        self.transactions.insert(id, Transaction { state: TxnState::Active, write_set: Vec::new() });
        Ok(id)
    }

    /// Appends a write-set entry to an active transaction's log.
    pub fn record_write(&mut self, id: u64, record: WriteRecord) -> DbResult<()> {
        let txn = self.transactions.get_mut(&id).ok_or(DbError::NoTxn(id))?;
        if txn.state != TxnState::Active {
            return Err(DbError::NoTxn(id));
        }
        txn.write_set.push(record);
        Ok(())
    }

    /// Marks the transaction committed and hands back its write set for the
    /// caller to replay. The transaction is removed from tracking once this
    /// returns, a second call with the same id fails with *no-txn*.
    pub fn take_for_commit(&mut self, id: u64) -> DbResult<Vec<WriteRecord>> {
        let txn = self.transactions.get(&id).ok_or(DbError::NoTxn(id))?;
        if txn.state != TxnState::Active {
            return Err(DbError::NoTxn(id));
        }
        let txn = self.transactions.remove(&id).unwrap();
        Ok(txn.write_set)
    }

    /// Discards an active transaction's write set.
    pub fn abort(&mut self, id: u64) -> DbResult<()> {
        let txn = self.transactions.get(&id).ok_or(DbError::NoTxn(id))?;
        if txn.state != TxnState::Active {
            return Err(DbError::NoTxn(id));
        }
        self.transactions.remove(&id);
        Ok(())
    }

    #[cfg(test)]
    fn is_active(&self, id: u64) -> bool {
        matches!(self.transactions.get(&id), Some(t) if t.state == TxnState::Active)
    }
}
