//! # Executor
//!
//! Pull-based interpretation of the finalized plan. Each node becomes a
//! lazy row stream; joins are nested loops (for each left row, all right
//! matches consecutively), grouping folds into per-group aggregate state,
//! ordering and writes materialise at their node only. Errors travel
//! in-band and abort the ambient transaction at the envelope.

pub mod index;
pub mod stream;

pub use stream::{Replay, RowStream};

use crate::error::{QueryError, QueryResult};
use crate::expr::{EvalScope, Expression};
use crate::plan::{JoinKind, NodeId, OrderingEntry, PlanNode, SetOpKind, SourceDef, WriteSink};
use crate::store::StoreSource;
use crate::txn::{Transaction, TxnHandle};
use crate::value::{KeySpec, Record, Row, Value};
use index::AccessPath;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use stream::{empty, from_rows, once_err, DefaultIfEmpty, Lazy};
use tracing::trace;

/// Per-execution context: parameters, the accumulated outer tuple, the
/// memoization table, and the ambient transaction slot.
#[derive(Clone)]
pub struct ExecCtx<'a> {
    pub params: Rc<Record>,
    pub tuple: Row,
    memo: Rc<RefCell<HashMap<NodeId, Replay<'a>>>>,
    txn: Rc<RefCell<Option<TxnHandle>>>,
}

impl<'a> ExecCtx<'a> {
    pub fn new(params: Record, txn: Option<TxnHandle>) -> ExecCtx<'a> {
        ExecCtx {
            params: Rc::new(params),
            tuple: Row::new(),
            memo: Rc::new(RefCell::new(HashMap::new())),
            txn: Rc::new(RefCell::new(txn)),
        }
    }

    fn with_tuple(&self, tuple: Row) -> ExecCtx<'a> {
        ExecCtx {
            tuple,
            ..self.clone()
        }
    }

    /// The ambient transaction, once an envelope installed one.
    pub fn txn(&self) -> Option<TxnHandle> {
        self.txn.borrow().clone()
    }
}

fn apply_predicates(
    predicates: &[Expression],
    row: &Row,
    params: &Record,
) -> QueryResult<bool> {
    for predicate in predicates {
        let scope = EvalScope::new(row, params);
        if !predicate.matches(&scope)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Execute `node` under `ctx`, yielding a lazy row stream.
pub fn execute<'a>(node: &'a PlanNode, ctx: &ExecCtx<'a>) -> RowStream<'a> {
    match node {
        PlanNode::Source {
            name,
            def,
            predicates,
            key_ranges,
            ..
        } => {
            let ctx = ctx.clone();
            Lazy::stream(move || {
                let records = match source_records(def, key_ranges, &ctx) {
                    Ok(records) => records,
                    Err(e) => return once_err(e),
                };
                let base = ctx.tuple.clone();
                let params = Rc::clone(&ctx.params);
                Box::new(records.filter_map(move |res| match res {
                    Err(e) => Some(Err(e)),
                    Ok(record) => {
                        let row = base.with(name.clone(), record);
                        match apply_predicates(predicates, &row, &params) {
                            Err(e) => Some(Err(e)),
                            Ok(false) => None,
                            Ok(true) => Some(Ok(row)),
                        }
                    }
                }))
            })
        }

        PlanNode::Join {
            kind,
            left,
            right,
            predicates,
            ..
        } => {
            let ctx = ctx.clone();
            let right_names: Vec<String> = right
                .schema()
                .map(|s| s.into_keys().collect())
                .unwrap_or_default();
            let left_stream = execute(left, &ctx);
            Box::new(left_stream.flat_map(move |lres| -> RowStream<'a> {
                let lrow = match lres {
                    Ok(row) => row,
                    Err(e) => return once_err(e),
                };
                let rctx = ctx.with_tuple(ctx.tuple.union(&lrow));
                let right_stream = execute(right, &rctx);
                let params = Rc::clone(&ctx.params);

                match kind {
                    JoinKind::Inner => {
                        let lrow = lrow.clone();
                        Box::new(right_stream.filter_map(move |rres| match rres {
                            Err(e) => Some(Err(e)),
                            Ok(rrow) => {
                                let combined = lrow.union(&rrow);
                                match apply_predicates(predicates, &combined, &params) {
                                    Err(e) => Some(Err(e)),
                                    Ok(false) => None,
                                    Ok(true) => Some(Ok(combined)),
                                }
                            }
                        }))
                    }
                    JoinKind::Outer => {
                        // Retained predicates are part of the match: they
                        // filter the combined rows first, so a left row
                        // whose matches all fail still yields the
                        // sentinel. The sentinel itself is not filtered.
                        let mut sentinel = lrow.clone();
                        for name in &right_names {
                            sentinel.bind(name.clone(), Row::otherwise_record());
                        }
                        let lrow = lrow.clone();
                        let matched = Box::new(right_stream.filter_map(
                            move |rres| match rres {
                                Err(e) => Some(Err(e)),
                                Ok(rrow) => {
                                    let combined = lrow.union(&rrow);
                                    match apply_predicates(predicates, &combined, &params) {
                                        Err(e) => Some(Err(e)),
                                        Ok(false) => None,
                                        Ok(true) => Some(Ok(combined)),
                                    }
                                }
                            },
                        )) as RowStream<'a>;
                        DefaultIfEmpty::stream(matched, sentinel)
                    }
                    JoinKind::Anti => {
                        // The left row survives iff no right row passes
                        // the retained predicates; the sentinel row is
                        // emitted unfiltered.
                        let probe_row = lrow.clone();
                        let mut survivors =
                            right_stream.filter_map(move |rres| match rres {
                                Err(e) => Some(Err(e)),
                                Ok(rrow) => {
                                    let combined = probe_row.union(&rrow);
                                    match apply_predicates(predicates, &combined, &params) {
                                        Err(e) => Some(Err(e)),
                                        Ok(false) => None,
                                        Ok(true) => Some(Ok(combined)),
                                    }
                                }
                            });
                        match survivors.next() {
                            Some(Err(e)) => once_err(e),
                            Some(Ok(_)) => empty(),
                            None => {
                                let mut row = lrow.clone();
                                for name in &right_names {
                                    row.bind(name.clone(), Row::otherwise_record());
                                }
                                from_rows(vec![row])
                            }
                        }
                    }
                }
            }))
        }

        PlanNode::Where {
            child, predicate, ..
        } => {
            let child_stream = execute(child, ctx);
            let params = Rc::clone(&ctx.params);
            match predicate {
                None => child_stream,
                Some(predicate) => Box::new(child_stream.filter_map(move |res| match res {
                    Err(e) => Some(Err(e)),
                    Ok(row) => {
                        let scope = EvalScope::new(&row, &params);
                        match predicate.matches(&scope) {
                            Err(e) => Some(Err(e)),
                            Ok(false) => None,
                            Ok(true) => Some(Ok(row)),
                        }
                    }
                })),
            }
        }

        PlanNode::Select {
            child,
            selector,
            merge_source,
        } => {
            let child_stream = execute(child, ctx);
            let params = Rc::clone(&ctx.params);
            Box::new(child_stream.map(move |res| {
                let row = res?;
                let scope = EvalScope::new(&row, &params);
                let mut record = expect_record(selector.eval(&scope)?)?;
                if let Some(alias) = merge_source {
                    if let Some(prior) = row.get(alias) {
                        record = prior.merged_with(&record);
                    }
                }
                Ok(Row::of_value(record))
            }))
        }

        PlanNode::GroupBy {
            child,
            selector,
            grouper,
        } => {
            let ctx = ctx.clone();
            Lazy::stream(move || {
                let params = Rc::clone(&ctx.params);
                let mut order: Vec<Value> = Vec::new();
                let mut groups: BTreeMap<Value, GroupEntry> = BTreeMap::new();
                for res in execute(child, &ctx) {
                    let row = match res {
                        Ok(row) => row,
                        Err(e) => return once_err(e),
                    };
                    let key_scope = EvalScope::new(&row, &params);
                    let key = match grouper.eval(&key_scope) {
                        Ok(key) => key,
                        Err(e) => return once_err(e),
                    };
                    let entry = groups.entry(key.clone()).or_insert_with(|| {
                        order.push(key);
                        GroupEntry {
                            state: RefCell::new(selector.fresh_group_state()),
                            last: Value::Null,
                        }
                    });
                    let scope = EvalScope::new(&row, &params).with_group(&entry.state);
                    entry.last = match selector.eval(&scope) {
                        Ok(value) => value,
                        Err(e) => return once_err(e),
                    };
                }
                // Groups emit in first-seen order, each carrying the last
                // selector output (the finished aggregates).
                let mut rows = Vec::with_capacity(order.len());
                for key in order {
                    let entry = groups.remove(&key).expect("group recorded");
                    match expect_record(entry.last) {
                        Ok(record) => rows.push(Row::of_value(record)),
                        Err(e) => return once_err(e),
                    }
                }
                from_rows(rows)
            })
        }

        PlanNode::OrderBy { child, ordering } => {
            let ctx = ctx.clone();
            Lazy::stream(move || {
                let params = Rc::clone(&ctx.params);
                let mut keyed: Vec<(Row, Vec<Value>)> = Vec::new();
                for res in execute(child, &ctx) {
                    let row = match res {
                        Ok(row) => row,
                        Err(e) => return once_err(e),
                    };
                    let scope = EvalScope::new(&row, &params);
                    let mut keys = Vec::with_capacity(ordering.len());
                    for entry in ordering {
                        match entry.expr.eval(&scope) {
                            Ok(v) => keys.push(v),
                            Err(e) => return once_err(e),
                        }
                    }
                    keyed.push((row, keys));
                }
                keyed.sort_by(|a, b| compare_order_keys(&a.1, &b.1, ordering));
                from_rows(keyed.into_iter().map(|(row, _)| row).collect())
            })
        }

        PlanNode::SetOp { kind, left, right } => {
            let left_stream = execute(left, ctx);
            let right_stream = execute(right, ctx);
            let chained = Box::new(left_stream.chain(right_stream)) as RowStream<'a>;
            match kind {
                SetOpKind::UnionAll => chained,
                SetOpKind::Union => {
                    let mut seen: BTreeSet<Value> = BTreeSet::new();
                    Box::new(chained.filter_map(move |res| match res {
                        Err(e) => Some(Err(e)),
                        Ok(row) => {
                            if seen.insert(row.as_value()) {
                                Some(Ok(row))
                            } else {
                                None
                            }
                        }
                    }))
                }
            }
        }

        PlanNode::CompositeUnion { left, right } => {
            let left_stream = execute(left, ctx);
            let right_stream = execute(right, ctx);
            Box::new(left_stream.chain(right_stream))
        }

        PlanNode::Write {
            child,
            sink,
            alias,
            options,
        } => {
            let ctx = ctx.clone();
            Lazy::stream(move || {
                // Materialise the input fully before the first mutation so
                // reads in the same query never observe partial writes.
                let mut records = Vec::new();
                for res in execute(child, &ctx) {
                    match res {
                        Ok(row) => records.push(row.result_record()),
                        Err(e) => return once_err(e),
                    }
                }
                trace!(count = records.len(), "write materialised its input");
                match perform_writes(sink, records, *options, &ctx) {
                    Err(e) => once_err(e),
                    Ok(written) => Box::new(written.into_iter().map(move |record| {
                        let mut row = Row::of_value(record.clone());
                        row.bind(alias.clone(), record);
                        Ok(row)
                    })),
                }
            })
        }

        PlanNode::Memoize { id, child } => {
            let existing = ctx.memo.borrow().get(id).cloned();
            let replay = match existing {
                Some(replay) => replay,
                None => {
                    let replay = Replay::new(execute(child, ctx));
                    ctx.memo.borrow_mut().insert(*id, replay.clone());
                    replay
                }
            };
            replay.subscribe()
        }

        PlanNode::Envelope {
            child,
            store,
            sources,
            mode,
        } => {
            let txn = {
                let mut slot = ctx.txn.borrow_mut();
                match slot.as_ref() {
                    Some(txn) => Rc::clone(txn),
                    None => {
                        let txn = match store {
                            Some(store) => match store.transaction(sources, *mode) {
                                Ok(store_txn) => Transaction::with_store(store_txn),
                                Err(e) => return once_err(e),
                            },
                            None => Transaction::in_memory(),
                        };
                        *slot = Some(Rc::clone(&txn));
                        txn
                    }
                }
            };
            if txn.is_settled() {
                return once_err(QueryError::TransactionSettled);
            }
            // Chained executions keep re-arming the idle auto-complete.
            txn.delay_complete();

            let child_stream = execute(child, ctx);
            Box::new(child_stream.map(move |res| match res {
                Ok(row) => {
                    txn.set_last_value(Value::Record(row.result_record()));
                    Ok(row)
                }
                Err(e) => {
                    txn.abort(e.clone());
                    Err(e)
                }
            }))
        }
    }
}

struct GroupEntry {
    state: RefCell<Vec<crate::expr::AggState>>,
    last: Value,
}

fn expect_record(value: Value) -> QueryResult<Record> {
    match value {
        Value::Record(record) => Ok(record),
        other => Err(QueryError::Eval(format!(
            "selector must produce a record, got {other}"
        ))),
    }
}

/// Ordering comparator: first non-zero entry wins; null placement is
/// symmetric and not affected by the direction multiplier.
fn compare_order_keys(a: &[Value], b: &[Value], ordering: &[OrderingEntry]) -> Ordering {
    for (i, entry) in ordering.iter().enumerate() {
        let (av, bv) = (&a[i], &b[i]);
        match (av.is_null(), bv.is_null()) {
            (true, true) => continue,
            (true, false) => {
                return if entry.nulls > 0 {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, true) => {
                return if entry.nulls > 0 {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, false) => {}
        }
        let cmp = av.cmp(bv);
        let cmp = if entry.direction < 0 { cmp.reverse() } else { cmp };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

type RecordStream<'a> = Box<dyn Iterator<Item = QueryResult<Record>> + 'a>;

/// Base record stream of a named source, index-selected for stored
/// sources and overlay-aware for collections.
fn source_records<'a>(
    def: &'a SourceDef,
    key_ranges: &'a BTreeMap<crate::value::KeyPath, crate::range::KeyRange>,
    ctx: &ExecCtx<'a>,
) -> QueryResult<RecordStream<'a>> {
    match def {
        SourceDef::Collection(collection) => {
            let records: Vec<Record> = match ctx.txn() {
                Some(txn) if !txn.is_settled() => txn
                    .view(collection)
                    .into_iter()
                    .map(|(_, record)| record)
                    .collect(),
                _ => collection.records(),
            };
            Ok(Box::new(records.into_iter().map(Ok)))
        }

        SourceDef::Stored { source, .. } => {
            let txn = ctx.txn().ok_or_else(|| {
                QueryError::Internal("store access outside a transaction envelope".into())
            })?;
            let handle: Box<dyn StoreSource> =
                txn.with_store_txn(|store_txn| store_txn.source(source))?;
            let scope = EvalScope::new(&ctx.tuple, &ctx.params);
            let access = index::choose_access_path(&handle.meta(), key_ranges, &scope)?;
            let cursors: Vec<crate::store::Cursor> = match access {
                AccessPath::Empty => Vec::new(),
                AccessPath::FullScan => vec![handle.open_cursor(None)?],
                AccessPath::Primary(ranges) => {
                    let mut cursors = Vec::with_capacity(ranges.len());
                    for range in &ranges {
                        cursors.push(handle.open_cursor(Some(range))?);
                    }
                    cursors
                }
                AccessPath::Secondary(name, ranges) => {
                    let mut cursors = Vec::with_capacity(ranges.len());
                    for range in &ranges {
                        cursors.push(handle.open_index_cursor(&name, Some(range))?);
                    }
                    cursors
                }
            };
            let mut stream: RecordStream<'a> = Box::new(std::iter::empty());
            for cursor in cursors {
                stream = Box::new(stream.chain(cursor.map(|res| res.map(|(_, record)| record))));
            }
            Ok(stream)
        }

        SourceDef::Subquery(plan) => {
            let sub_ctx = ctx.with_tuple(Row::new());
            Ok(Box::new(
                execute(plan, &sub_ctx).map(|res| res.map(|row| row.result_record())),
            ))
        }

        SourceDef::Derived(f) => {
            let records = f(&ctx.params);
            Ok(Box::new(records.into_iter().map(Ok)))
        }
    }
}

/// Issue the materialised writes against the sink; returns the records as
/// persisted.
fn perform_writes(
    sink: &WriteSink,
    records: Vec<Record>,
    options: crate::plan::WriteOptions,
    ctx: &ExecCtx<'_>,
) -> QueryResult<Vec<Record>> {
    match sink {
        WriteSink::Stored { source, .. } => {
            let txn = ctx.txn().ok_or_else(|| {
                QueryError::Internal("write outside a transaction envelope".into())
            })?;
            txn.with_store_txn(|store_txn| {
                let mut handle = store_txn.source(source)?;
                let key_spec = handle.meta().key_spec;
                let mut written = Vec::with_capacity(records.len());
                for record in records {
                    if options.delete {
                        let key = write_key(&key_spec, &record)?;
                        handle.delete(&key)?;
                        written.push(record);
                    } else if options.overwrite {
                        written.push(handle.put(record, None)?);
                    } else {
                        written.push(handle.add(record, None)?);
                    }
                }
                Ok(written)
            })
        }

        WriteSink::Collection(collection) => {
            let txn = ctx.txn().ok_or_else(|| {
                QueryError::Internal("write outside a transaction envelope".into())
            })?;
            let mut written = Vec::with_capacity(records.len());
            for record in records {
                if options.delete {
                    let (row_id, _) = locate_collection_row(collection, &record)?;
                    txn.delete_row(collection, row_id);
                    written.push(record);
                } else if options.overwrite {
                    match collection
                        .key_path()
                        .map(|path| path.extract(&record))
                        .filter(|key| !key.is_null())
                        .and_then(|key| collection.find_by_key(&key))
                    {
                        Some((row_id, _)) => {
                            txn.shadow(collection, row_id, record.clone());
                            written.push(record);
                        }
                        None => {
                            txn.insert(collection, record.clone());
                            written.push(record);
                        }
                    }
                } else {
                    txn.insert(collection, record.clone());
                    written.push(record);
                }
            }
            Ok(written)
        }
    }
}

fn locate_collection_row(
    collection: &crate::store::MemCollection,
    record: &Record,
) -> QueryResult<(crate::store::RowId, Record)> {
    let path = collection.key_path().ok_or_else(|| {
        QueryError::Store("update/delete requires a keyed collection".into())
    })?;
    let key = path.extract(record);
    if key.is_null() {
        return Err(QueryError::Store(
            "record is missing its collection key".into(),
        ));
    }
    collection
        .find_by_key(&key)
        .ok_or_else(|| QueryError::Store(format!("no row with key {key}")))
}

fn write_key(key_spec: &KeySpec, record: &Record) -> QueryResult<Value> {
    key_spec
        .extract(record)
        .ok_or_else(|| QueryError::Store("record is missing its primary key".into()))
}
