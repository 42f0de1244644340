//! # Transaction Model
//!
//! A transaction is a settlement machine: unsettled until the first of
//! complete/abort, then terminal; settlement is idempotent. It carries an
//! optional persistent-store transaction and a copy-on-write overlay for
//! in-memory collections, so writes stay private to the transaction and
//! become visible atomically on completion.
//!
//! In-memory transactions auto-complete: each envelope execution re-arms a
//! two-tick countdown (`delay_complete`), and the second idle tick with no
//! re-arm in between completes the transaction. Queued chains of writes
//! keep re-arming, so the transaction stays open exactly as long as work
//! keeps arriving.

use crate::error::{QueryError, QueryResult};
use crate::store::{CollectionId, MemCollection, RowId, StoreTransaction};
use crate::value::{Record, Value};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;
use tracing::debug;

/// Shared handle to an ambient transaction.
pub type TxnHandle = Rc<Transaction>;

/// Pending writes against in-memory collections.
#[derive(Debug, Default)]
struct Overlay {
    /// Rows inserted within the transaction, in write order.
    inserts: Vec<(CollectionId, RowId, Record)>,
    /// Shadow records: reads fall through to the base, writes do not.
    shadows: BTreeMap<RowId, Record>,
    deletes: BTreeSet<RowId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unsettled,
    Completed,
    Aborted,
}

/// The ambient transaction of one query execution.
pub struct Transaction {
    state: Cell<State>,
    store_txn: RefCell<Option<Box<dyn StoreTransaction>>>,
    overlay: RefCell<Overlay>,
    /// Collections touched by the overlay, for commit-back.
    collections: RefCell<BTreeMap<CollectionId, MemCollection>>,
    on_complete: RefCell<Vec<Box<dyn FnOnce(&Value)>>>,
    on_abort: RefCell<Vec<Box<dyn FnOnce(&QueryError)>>>,
    outcome: RefCell<Option<Result<Value, QueryError>>>,
    last_value: RefCell<Value>,
    /// Remaining idle ticks before auto-complete; 0 = unarmed.
    auto_ticks: Cell<u8>,
    /// Ticks `delay_complete` arms; from the engine configuration.
    arm_ticks: u8,
}

impl Transaction {
    /// A transaction over in-memory collections only.
    pub fn in_memory() -> TxnHandle {
        Transaction::with_arm_ticks(crate::config::EngineConfig::global().execution.auto_complete_ticks)
    }

    /// In-memory transaction with an explicit auto-complete countdown.
    pub fn with_arm_ticks(arm_ticks: u8) -> TxnHandle {
        Rc::new(Transaction {
            state: Cell::new(State::Unsettled),
            store_txn: RefCell::new(None),
            overlay: RefCell::new(Overlay::default()),
            collections: RefCell::new(BTreeMap::new()),
            on_complete: RefCell::new(Vec::new()),
            on_abort: RefCell::new(Vec::new()),
            outcome: RefCell::new(None),
            last_value: RefCell::new(Value::Null),
            auto_ticks: Cell::new(0),
            arm_ticks,
        })
    }

    /// A transaction bound to an open store transaction.
    pub fn with_store(store_txn: Box<dyn StoreTransaction>) -> TxnHandle {
        let txn = Transaction::in_memory();
        *txn.store_txn.borrow_mut() = Some(store_txn);
        txn
    }

    pub fn is_settled(&self) -> bool {
        self.state.get() != State::Unsettled
    }

    pub fn has_store(&self) -> bool {
        self.store_txn.borrow().is_some()
    }

    /// Run `f` against the underlying store transaction.
    pub fn with_store_txn<T>(
        &self,
        f: impl FnOnce(&mut dyn StoreTransaction) -> QueryResult<T>,
    ) -> QueryResult<T> {
        let mut guard = self.store_txn.borrow_mut();
        match guard.as_mut() {
            Some(txn) => f(txn.as_mut()),
            None => Err(QueryError::Internal(
                "no store transaction on this transaction".into(),
            )),
        }
    }

    /// Settlement outcome, once terminal.
    pub fn outcome(&self) -> Option<Result<Value, QueryError>> {
        self.outcome.borrow().clone()
    }

    pub fn on_complete(&self, hook: impl FnOnce(&Value) + 'static) {
        self.on_complete.borrow_mut().push(Box::new(hook));
    }

    pub fn on_abort(&self, hook: impl FnOnce(&QueryError) + 'static) {
        self.on_abort.borrow_mut().push(Box::new(hook));
    }

    /// Record the most recent value produced under this transaction; it
    /// becomes the completion value.
    pub fn set_last_value(&self, value: Value) {
        *self.last_value.borrow_mut() = value;
    }

    /// Complete: commit the store transaction, write the overlay back to
    /// its collections, fire the completion hooks. No-op when settled.
    pub fn complete(&self) {
        if self.is_settled() {
            return;
        }
        let mut store_guard = self.store_txn.borrow_mut();
        if let Some(store_txn) = store_guard.as_mut() {
            if let Err(err) = store_txn.commit() {
                // A failed commit settles the transaction as aborted.
                drop(store_guard);
                self.settle_aborted(err);
                return;
            }
        }
        drop(store_guard);
        self.state.set(State::Completed);
        debug!("transaction completed");

        let overlay = std::mem::take(&mut *self.overlay.borrow_mut());
        let collections = self.collections.borrow();
        for (collection_id, row_id, record) in overlay.inserts {
            if overlay.deletes.contains(&row_id) {
                continue;
            }
            if let Some(collection) = collections.get(&collection_id) {
                let record = match overlay.shadows.get(&row_id) {
                    Some(shadow) => record.merged_with(shadow),
                    None => record,
                };
                collection.apply_insert(row_id, record);
            }
        }
        for collection in collections.values() {
            for (row_id, shadow) in &overlay.shadows {
                collection.apply_shadow(*row_id, shadow);
            }
            for row_id in &overlay.deletes {
                collection.apply_delete(*row_id);
            }
        }

        let value = self.last_value.borrow().clone();
        *self.outcome.borrow_mut() = Some(Ok(value.clone()));
        for hook in self.on_complete.borrow_mut().drain(..) {
            hook(&value);
        }
        self.on_abort.borrow_mut().clear();
    }

    /// Abort: discard the overlay, abort the store transaction, fire the
    /// abort hooks. No-op when settled.
    pub fn abort(&self, reason: QueryError) {
        if self.is_settled() {
            return;
        }
        if let Some(store_txn) = self.store_txn.borrow_mut().as_mut() {
            store_txn.abort();
        }
        self.settle_aborted(reason);
    }

    fn settle_aborted(&self, reason: QueryError) {
        self.state.set(State::Aborted);
        debug!(error = %reason, "transaction aborted");
        *self.overlay.borrow_mut() = Overlay::default();
        *self.outcome.borrow_mut() = Some(Err(reason.clone()));
        for hook in self.on_abort.borrow_mut().drain(..) {
            hook(&reason);
        }
        self.on_complete.borrow_mut().clear();
    }

    // --- auto-completion --------------------------------------------------

    /// Arm (or re-arm) the auto-complete countdown (two ticks by default).
    pub fn delay_complete(&self) {
        if !self.is_settled() {
            self.auto_ticks.set(self.arm_ticks);
        }
    }

    /// One idle tick. Returns true while the transaction stays unsettled.
    pub fn tick(&self) -> bool {
        if self.is_settled() {
            return false;
        }
        match self.auto_ticks.get() {
            0 => true,
            1 => {
                self.auto_ticks.set(0);
                self.complete();
                false
            }
            n => {
                self.auto_ticks.set(n - 1);
                true
            }
        }
    }

    /// Drive idle ticks until the countdown settles the transaction or it
    /// was never armed.
    pub fn run_idle(&self) {
        while self.auto_ticks.get() > 0 && self.tick() {}
    }

    // --- overlay ----------------------------------------------------------

    fn track(&self, collection: &MemCollection) {
        self.collections
            .borrow_mut()
            .entry(collection.id())
            .or_insert_with(|| collection.clone());
    }

    /// Queue an insert; the row becomes visible to reads within this
    /// transaction immediately.
    pub fn insert(&self, collection: &MemCollection, record: Record) -> RowId {
        self.track(collection);
        let row_id = RowId::fresh();
        self.overlay
            .borrow_mut()
            .inserts
            .push((collection.id(), row_id, record));
        row_id
    }

    /// Shadow-write a row: fields of `shadow` overlay the base record
    /// until commit writes them back.
    pub fn shadow(&self, collection: &MemCollection, row_id: RowId, shadow: Record) {
        self.track(collection);
        let mut overlay = self.overlay.borrow_mut();
        match overlay.shadows.remove(&row_id) {
            Some(existing) => {
                overlay.shadows.insert(row_id, existing.merged_with(&shadow));
            }
            None => {
                overlay.shadows.insert(row_id, shadow);
            }
        }
    }

    pub fn delete_row(&self, collection: &MemCollection, row_id: RowId) {
        self.track(collection);
        self.overlay.borrow_mut().deletes.insert(row_id);
    }

    /// Read `collection` through the overlay: base rows with shadows and
    /// deletes applied, then rows inserted by this transaction.
    pub fn view(&self, collection: &MemCollection) -> Vec<(RowId, Record)> {
        let overlay = self.overlay.borrow();
        let mut rows: Vec<(RowId, Record)> = collection
            .rows()
            .into_iter()
            .filter(|(row_id, _)| !overlay.deletes.contains(row_id))
            .map(|(row_id, record)| match overlay.shadows.get(&row_id) {
                Some(shadow) => (row_id, record.merged_with(shadow)),
                None => (row_id, record),
            })
            .collect();
        for (collection_id, row_id, record) in &overlay.inserts {
            if *collection_id == collection.id() && !overlay.deletes.contains(row_id) {
                let record = match overlay.shadows.get(row_id) {
                    Some(shadow) => record.merged_with(shadow),
                    None => record.clone(),
                };
                rows.push((*row_id, record));
            }
        }
        rows
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state.get())
            .field("has_store", &self.has_store())
            .field("auto_ticks", &self.auto_ticks.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn settlement_is_idempotent() {
        let txn = Transaction::in_memory();
        txn.set_last_value(Value::from(7));
        txn.complete();
        assert!(txn.is_settled());
        // A later abort is a no-op.
        txn.abort(QueryError::Aborted("late".into()));
        assert!(matches!(txn.outcome(), Some(Ok(v)) if v == Value::from(7)));
    }

    #[test]
    fn hooks_fire_at_most_once() {
        let txn = Transaction::in_memory();
        let fired = Rc::new(Cell::new(0));
        let counter = Rc::clone(&fired);
        txn.on_complete(move |_| counter.set(counter.get() + 1));
        txn.complete();
        txn.complete();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn overlay_commits_back_on_complete() {
        let collection = MemCollection::from_records([Record::from_pairs([("x", 1)])]);
        let base_row = collection.rows()[0].0;

        let txn = Transaction::in_memory();
        txn.shadow(&collection, base_row, Record::from_pairs([("x", 2)]));
        txn.insert(&collection, Record::from_pairs([("x", 3)]));

        // Uncommitted writes are visible through the view only.
        assert_eq!(collection.records()[0].get("x"), &Value::from(1));
        let view = txn.view(&collection);
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].1.get("x"), &Value::from(2));

        txn.complete();
        let records = collection.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("x"), &Value::from(2));
        assert_eq!(records[1].get("x"), &Value::from(3));
    }

    #[test]
    fn overlay_discards_on_abort() {
        let collection = MemCollection::from_records([Record::from_pairs([("x", 1)])]);
        let base_row = collection.rows()[0].0;

        let txn = Transaction::in_memory();
        txn.shadow(&collection, base_row, Record::from_pairs([("x", 2)]));
        txn.insert(&collection, Record::from_pairs([("x", 3)]));
        txn.abort(QueryError::Aborted("boom".into()));

        let records = collection.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("x"), &Value::from(1));
    }

    #[test]
    fn deleted_rows_vanish_from_view_and_commit() {
        let collection = MemCollection::from_records([
            Record::from_pairs([("x", 1)]),
            Record::from_pairs([("x", 2)]),
        ]);
        let first = collection.rows()[0].0;

        let txn = Transaction::in_memory();
        txn.delete_row(&collection, first);
        assert_eq!(txn.view(&collection).len(), 1);

        txn.complete();
        assert_eq!(collection.records().len(), 1);
        assert_eq!(collection.records()[0].get("x"), &Value::from(2));
    }

    #[test]
    fn auto_complete_after_two_idle_ticks() {
        let txn = Transaction::in_memory();
        txn.delay_complete();
        assert!(txn.tick());
        assert!(!txn.is_settled());
        assert!(!txn.tick());
        assert!(txn.is_settled());
    }

    #[test]
    fn rearm_resets_the_countdown() {
        let txn = Transaction::in_memory();
        txn.delay_complete();
        assert!(txn.tick());
        // A new execute call re-arms before the second tick.
        txn.delay_complete();
        assert!(txn.tick());
        assert!(!txn.is_settled());
        assert!(!txn.tick());
        assert!(txn.is_settled());
    }

    #[test]
    fn unarmed_transaction_never_auto_completes() {
        let txn = Transaction::in_memory();
        assert!(txn.tick());
        assert!(txn.tick());
        assert!(!txn.is_settled());
    }
}
