//! # Fluent Builder
//!
//! The public query surface: `select`/`insert`/`upsert`/`update`/
//! `delete_from` start a statement, `from`/`join`/`on`/`where_`/
//! `group_by`/`order_by`/`into`/`returning` shape it, and `finalize`
//! compiles it into an immutable [`Query`]. Templates are expression
//! fragments with `?` substitution holes filled positionally from the
//! accompanying value list.
//!
//! ```rust
//! use squill::{select, SourceInput};
//! use squill::store::MemCollection;
//! use serde_json::json;
//!
//! let things = MemCollection::from_json(json!([
//!     {"id": 1, "name": "Apple"},
//! ]));
//! let query = select("{name: thing.name}")
//!     .from([("thing", SourceInput::from(things))])
//!     .finalize()
//!     .expect("valid query");
//! let rows = query.collect_records(Default::default()).expect("rows");
//! assert_eq!(rows.len(), 1);
//! ```
//!
//! Builder methods record the first error they hit and keep accepting
//! calls; `finalize` surfaces it. A finalized query is immutable by
//! construction (the builder is consumed), which is the strongest form of
//! refusing post-finalization modification.

use crate::error::{QueryError, QueryResult};
use crate::exec::{execute, ExecCtx, RowStream};
use crate::expr::{compile_fragment, ast::Node, CompileOptions, DepId, DepSet, Expression, Schema};
use crate::plan::{
    finalize as plan_finalize, JoinKind, NodeId, OrderingEntry, PlanNode, SetOpKind, SourceDef,
    WriteOptions, WriteSink,
};
use crate::store::{MemCollection, Store};
use crate::term::TermGroups;
use crate::txn::TxnHandle;
use crate::value::{Record, Row, Value};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

/// Anything that can stand on the right side of a `from`/`join` alias.
#[derive(Clone)]
pub enum SourceInput {
    Collection(MemCollection),
    Stored { store: Arc<dyn Store>, source: String },
    Query(Box<Query>),
    Derived(Rc<dyn Fn(&Record) -> Vec<Record>>),
}

impl SourceInput {
    pub fn stored(store: &Arc<dyn Store>, source: impl Into<String>) -> SourceInput {
        SourceInput::Stored {
            store: Arc::clone(store),
            source: source.into(),
        }
    }

    pub fn derived(f: impl Fn(&Record) -> Vec<Record> + 'static) -> SourceInput {
        SourceInput::Derived(Rc::new(f))
    }

    fn into_def(self) -> SourceDef {
        match self {
            SourceInput::Collection(c) => SourceDef::Collection(c),
            SourceInput::Stored { store, source } => SourceDef::Stored { store, source },
            SourceInput::Query(q) => SourceDef::Subquery(Box::new(q.subplan())),
            SourceInput::Derived(f) => SourceDef::Derived(f),
        }
    }
}

impl From<MemCollection> for SourceInput {
    fn from(c: MemCollection) -> SourceInput {
        SourceInput::Collection(c)
    }
}

impl From<Query> for SourceInput {
    fn from(q: Query) -> SourceInput {
        SourceInput::Query(Box::new(q))
    }
}

/// Start a projection statement.
pub fn select(template: &str) -> QueryBuilder {
    select_with(template, vec![])
}

pub fn select_with(template: &str, subs: Vec<Value>) -> QueryBuilder {
    QueryBuilder::new(Verb::Select, Some((template.to_string(), subs)))
}

/// Start an insert; fails on duplicate keys.
pub fn insert(template: &str) -> QueryBuilder {
    insert_with(template, vec![])
}

pub fn insert_with(template: &str, subs: Vec<Value>) -> QueryBuilder {
    QueryBuilder::new(Verb::Insert, Some((template.to_string(), subs)))
}

/// Start an upsert; overwrites existing keys.
pub fn upsert(template: &str) -> QueryBuilder {
    upsert_with(template, vec![])
}

pub fn upsert_with(template: &str, subs: Vec<Value>) -> QueryBuilder {
    QueryBuilder::new(Verb::Upsert, Some((template.to_string(), subs)))
}

/// Start an update; the template's fields shallow-merge over each matched
/// record, preserving unmentioned fields (and so the primary key).
pub fn update(template: &str) -> QueryBuilder {
    update_with(template, vec![])
}

pub fn update_with(template: &str, subs: Vec<Value>) -> QueryBuilder {
    QueryBuilder::new(Verb::Update, Some((template.to_string(), subs)))
}

/// Start a delete against `input`, bound under `alias` for predicates.
pub fn delete_from(alias: &str, input: SourceInput) -> QueryBuilder {
    let mut builder = QueryBuilder::new(Verb::Delete, None);
    builder = builder.from([(alias, input.clone())]);
    builder.sink_from_input(alias, input);
    builder
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Select,
    Insert,
    Upsert,
    Update,
    Delete,
}

struct OrderSpec {
    template: String,
    subs: Vec<Value>,
    direction: i8,
    nulls: i8,
}

/// Builds one statement; consumed by [`QueryBuilder::finalize`].
pub struct QueryBuilder {
    verb: Verb,
    selector: Option<(String, Vec<Value>)>,
    grouper: Option<(String, Vec<Value>)>,
    returning: Option<(String, Vec<Value>)>,
    order: Vec<OrderSpec>,
    root: Option<PlanNode>,
    schema: BTreeMap<String, DepId>,
    sink: Option<(String, WriteSink)>,
    memoized: bool,
    /// `on` is only legal immediately after a join.
    join_pending: bool,
    err: Option<QueryError>,
}

impl QueryBuilder {
    fn new(verb: Verb, selector: Option<(String, Vec<Value>)>) -> QueryBuilder {
        QueryBuilder {
            verb,
            selector,
            grouper: None,
            returning: None,
            order: Vec::new(),
            root: None,
            schema: BTreeMap::new(),
            sink: None,
            memoized: false,
            join_pending: false,
            err: None,
        }
    }

    fn fail(&mut self, err: QueryError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    fn current_schema(&self) -> Schema {
        match self.root.as_ref().and_then(PlanNode::schema) {
            Some(map) => Schema::Known(map),
            None => Schema::Unknown,
        }
    }

    /// Register sources; each alias wraps its source in a fresh named
    /// node joined onto the current tree.
    pub fn from<'s>(
        mut self,
        sources: impl IntoIterator<Item = (&'s str, SourceInput)>,
    ) -> QueryBuilder {
        for (alias, input) in sources {
            match self.named_source(alias, input) {
                Ok(node) => {
                    self.root = Some(match self.root.take() {
                        None => node,
                        Some(existing) => PlanNode::Join {
                            kind: JoinKind::Inner,
                            left: Box::new(existing),
                            right: Box::new(node),
                            groups: TermGroups::new(),
                            predicates: Vec::new(),
                        },
                    });
                }
                Err(e) => self.fail(e),
            }
        }
        self.join_pending = false;
        self
    }

    fn named_source(&mut self, alias: &str, input: SourceInput) -> QueryResult<PlanNode> {
        if self.schema.contains_key(alias) {
            return Err(QueryError::DuplicateAlias(alias.to_string()));
        }
        let dep = DepId::fresh();
        self.schema.insert(alias.to_string(), dep);
        Ok(PlanNode::Source {
            name: alias.to_string(),
            dep,
            def: input.into_def(),
            predicates: Vec::new(),
            key_ranges: BTreeMap::new(),
        })
    }

    fn join_with<'s>(
        mut self,
        sources: impl IntoIterator<Item = (&'s str, SourceInput)>,
        build: impl FnOnce(PlanNode, PlanNode) -> PlanNode,
    ) -> QueryBuilder {
        let Some(left) = self.root.take() else {
            self.fail(QueryError::BuilderMisuse("join before from".into()));
            return self;
        };
        let mut right: Option<PlanNode> = None;
        for (alias, input) in sources {
            match self.named_source(alias, input) {
                Ok(node) => {
                    right = Some(match right.take() {
                        None => node,
                        Some(existing) => PlanNode::Join {
                            kind: JoinKind::Inner,
                            left: Box::new(existing),
                            right: Box::new(node),
                            groups: TermGroups::new(),
                            predicates: Vec::new(),
                        },
                    });
                }
                Err(e) => self.fail(e),
            }
        }
        match right {
            Some(right) => {
                self.root = Some(build(left, right));
                self.join_pending = true;
            }
            None => {
                self.root = Some(left);
                self.fail(QueryError::BuilderMisuse("join with no sources".into()));
            }
        }
        self
    }

    pub fn join<'s>(
        self,
        sources: impl IntoIterator<Item = (&'s str, SourceInput)>,
    ) -> QueryBuilder {
        self.join_with(sources, |left, right| PlanNode::Join {
            kind: JoinKind::Inner,
            left: Box::new(left),
            right: Box::new(right),
            groups: TermGroups::new(),
            predicates: Vec::new(),
        })
    }

    pub fn left_join<'s>(
        self,
        sources: impl IntoIterator<Item = (&'s str, SourceInput)>,
    ) -> QueryBuilder {
        self.join_with(sources, |left, right| PlanNode::Join {
            kind: JoinKind::Outer,
            left: Box::new(left),
            right: Box::new(right),
            groups: TermGroups::new(),
            predicates: Vec::new(),
        })
    }

    /// Right outer join: a left outer join with the sides swapped.
    pub fn right_join<'s>(
        self,
        sources: impl IntoIterator<Item = (&'s str, SourceInput)>,
    ) -> QueryBuilder {
        self.join_with(sources, |left, right| PlanNode::Join {
            kind: JoinKind::Outer,
            left: Box::new(right),
            right: Box::new(left),
            groups: TermGroups::new(),
            predicates: Vec::new(),
        })
    }

    /// Full outer join, synthesised as
    /// `CompositeUnion(OuterJoin(L, R), AntiJoin(R, L))`.
    pub fn full_join<'s>(
        self,
        sources: impl IntoIterator<Item = (&'s str, SourceInput)>,
    ) -> QueryBuilder {
        self.join_with(sources, |left, right| PlanNode::CompositeUnion {
            left: Box::new(PlanNode::Join {
                kind: JoinKind::Outer,
                left: Box::new(left.clone()),
                right: Box::new(right.clone()),
                groups: TermGroups::new(),
                predicates: Vec::new(),
            }),
            right: Box::new(PlanNode::Join {
                kind: JoinKind::Anti,
                left: Box::new(right),
                right: Box::new(left),
                groups: TermGroups::new(),
                predicates: Vec::new(),
            }),
        })
    }

    pub fn anti_join<'s>(
        self,
        sources: impl IntoIterator<Item = (&'s str, SourceInput)>,
    ) -> QueryBuilder {
        self.join_with(sources, |left, right| PlanNode::Join {
            kind: JoinKind::Anti,
            left: Box::new(left),
            right: Box::new(right),
            groups: TermGroups::new(),
            predicates: Vec::new(),
        })
    }

    /// Join condition; merges into the join(s) added by the last `join`
    /// call (both legs of a synthesised full outer join).
    pub fn on(self, template: &str) -> QueryBuilder {
        self.on_with(template, vec![])
    }

    pub fn on_with(mut self, template: &str, subs: Vec<Value>) -> QueryBuilder {
        if !self.join_pending {
            self.fail(QueryError::BuilderMisuse("on without a preceding join".into()));
            return self;
        }
        let schema = self.current_schema();
        let mut groups = TermGroups::new();
        if let Err(e) = groups.parse(template, subs, &schema) {
            self.fail(e);
            return self;
        }
        match self.root.as_mut() {
            Some(PlanNode::Join { groups: own, .. }) => own.merge(groups),
            Some(PlanNode::CompositeUnion { left, right }) => {
                if let PlanNode::Join { groups: own, .. } = left.as_mut() {
                    own.merge(groups.clone());
                }
                if let PlanNode::Join { groups: own, .. } = right.as_mut() {
                    own.merge(groups);
                }
            }
            _ => self.fail(QueryError::BuilderMisuse(
                "on without a preceding join".into(),
            )),
        }
        self
    }

    pub fn where_(self, template: &str) -> QueryBuilder {
        self.where_with(template, vec![])
    }

    pub fn where_with(mut self, template: &str, subs: Vec<Value>) -> QueryBuilder {
        let Some(root) = self.root.take() else {
            self.fail(QueryError::BuilderMisuse("where before from".into()));
            return self;
        };
        let schema = self.current_schema_of(&root);
        let mut groups = TermGroups::new();
        match groups.parse(template, subs, &schema) {
            Ok(()) => {
                self.root = Some(PlanNode::Where {
                    child: Box::new(root),
                    groups,
                    predicate: None,
                });
            }
            Err(e) => {
                self.root = Some(root);
                self.fail(e);
            }
        }
        self.join_pending = false;
        self
    }

    fn current_schema_of(&self, root: &PlanNode) -> Schema {
        match root.schema() {
            Some(map) => Schema::Known(map),
            None => Schema::Unknown,
        }
    }

    /// Group selector; the statement's `select` template becomes the
    /// per-group projection and may use aggregates.
    pub fn group_by(self, template: &str) -> QueryBuilder {
        self.group_by_with(template, vec![])
    }

    pub fn group_by_with(mut self, template: &str, subs: Vec<Value>) -> QueryBuilder {
        if self.selector.is_none() {
            self.fail(QueryError::BuilderMisuse("group_by without a selector".into()));
            return self;
        }
        if self.grouper.is_some() {
            self.fail(QueryError::BuilderMisuse("group_by called twice".into()));
            return self;
        }
        self.grouper = Some((template.to_string(), subs));
        self
    }

    pub fn order_by(self, template: &str) -> QueryBuilder {
        self.order_by_with(template, vec![])
    }

    pub fn order_by_with(mut self, template: &str, subs: Vec<Value>) -> QueryBuilder {
        self.order.push(OrderSpec {
            template: template.to_string(),
            subs,
            direction: 1,
            nulls: 1,
        });
        self
    }

    pub fn asc(self) -> QueryBuilder {
        self.order(1)
    }

    pub fn desc(self) -> QueryBuilder {
        self.order(-1)
    }

    pub fn order(mut self, direction: i8) -> QueryBuilder {
        match self.order.last_mut() {
            Some(entry) => entry.direction = direction,
            None => self.fail(QueryError::BuilderMisuse(
                "ordering modifier without order_by".into(),
            )),
        }
        self
    }

    pub fn nulls_first(self) -> QueryBuilder {
        self.nulls(-1)
    }

    pub fn nulls_last(self) -> QueryBuilder {
        self.nulls(1)
    }

    pub fn nulls(mut self, nulls: i8) -> QueryBuilder {
        match self.order.last_mut() {
            Some(entry) => entry.nulls = nulls,
            None => self.fail(QueryError::BuilderMisuse(
                "nulls modifier without order_by".into(),
            )),
        }
        self
    }

    /// Target of a mutating statement.
    pub fn into(mut self, input: SourceInput) -> QueryBuilder {
        if self.sink.is_some() {
            self.fail(QueryError::BuilderMisuse("into called twice".into()));
            return self;
        }
        let alias = match &input {
            SourceInput::Stored { source, .. } => source.clone(),
            _ => "rows".to_string(),
        };
        self.sink_from_input(&alias, input);
        self
    }

    fn sink_from_input(&mut self, alias: &str, input: SourceInput) {
        let sink = match input {
            SourceInput::Collection(c) => WriteSink::Collection(c),
            SourceInput::Stored { store, source } => WriteSink::Stored { store, source },
            _ => {
                self.fail(QueryError::BuilderMisuse(
                    "write target must be a store source or collection".into(),
                ));
                return;
            }
        };
        self.sink = Some((alias.to_string(), sink));
    }

    /// Projection over the written records of a mutating statement.
    pub fn returning(self, template: &str) -> QueryBuilder {
        self.returning_with(template, vec![])
    }

    pub fn returning_with(mut self, template: &str, subs: Vec<Value>) -> QueryBuilder {
        self.returning = Some((template.to_string(), subs));
        self
    }

    /// Mark this select subquery for single-execution replay.
    pub fn memoize(mut self) -> QueryBuilder {
        self.memoized = true;
        self
    }

    fn compile_template(
        template: &str,
        subs: &[Value],
        schema: &Schema,
        allow_aggregates: bool,
    ) -> QueryResult<Expression> {
        let compiled = compile_fragment(
            template,
            0,
            schema,
            CompileOptions {
                allow_aggregates,
                compile_all: true,
            },
        )?;
        if compiled.holes != subs.len() {
            return Err(QueryError::BuilderMisuse(format!(
                "template has {} substitution holes but {} values were supplied",
                compiled.holes,
                subs.len()
            )));
        }
        Ok(compiled
            .full
            .ok_or_else(|| QueryError::Internal("compile_all yielded no expression".into()))?
            .with_subs(Rc::new(subs.to_vec())))
    }

    /// Compile the statement into an immutable query.
    pub fn finalize(mut self) -> QueryResult<Query> {
        if let Some(err) = self.err.take() {
            return Err(err);
        }

        // Inserts may omit `from`; they project off a single empty row.
        if self.root.is_none() && matches!(self.verb, Verb::Insert | Verb::Upsert) {
            let unit = MemCollection::from_records([Record::new()]);
            self = self.from([("$unit", SourceInput::from(unit))]);
            if let Some(err) = self.err.take() {
                return Err(err);
            }
        }
        let mut root = self
            .root
            .take()
            .ok_or_else(|| QueryError::BuilderMisuse("statement has no sources".into()))?;
        let schema = self.current_schema_of(&root);

        if !self.order.is_empty() {
            let mut ordering = Vec::with_capacity(self.order.len());
            for spec in &self.order {
                ordering.push(OrderingEntry {
                    expr: QueryBuilder::compile_template(
                        &spec.template,
                        &spec.subs,
                        &schema,
                        false,
                    )?,
                    direction: spec.direction,
                    nulls: spec.nulls,
                });
            }
            root = PlanNode::OrderBy {
                child: Box::new(root),
                ordering,
            };
        }

        let tree = match self.verb {
            Verb::Select => {
                let (template, subs) = self
                    .selector
                    .as_ref()
                    .ok_or_else(|| QueryError::BuilderMisuse("select without selector".into()))?;
                let selector = QueryBuilder::compile_template(
                    template,
                    subs,
                    &schema,
                    self.grouper.is_some(),
                )?;
                match &self.grouper {
                    Some((gt, gs)) => {
                        let grouper = QueryBuilder::compile_template(gt, gs, &schema, false)?;
                        PlanNode::GroupBy {
                            child: Box::new(root),
                            selector,
                            grouper,
                        }
                    }
                    None => PlanNode::Select {
                        child: Box::new(root),
                        selector,
                        merge_source: None,
                    },
                }
            }

            Verb::Insert | Verb::Upsert => {
                let (template, subs) = self
                    .selector
                    .as_ref()
                    .ok_or_else(|| QueryError::BuilderMisuse("insert without template".into()))?;
                let selector =
                    QueryBuilder::compile_template(template, subs, &schema, false)?;
                let (alias, sink) = self
                    .sink
                    .clone()
                    .ok_or_else(|| QueryError::BuilderMisuse("insert without into".into()))?;
                PlanNode::Write {
                    child: Box::new(PlanNode::Select {
                        child: Box::new(root),
                        selector,
                        merge_source: None,
                    }),
                    sink,
                    alias,
                    options: WriteOptions {
                        overwrite: self.verb == Verb::Upsert,
                        delete: false,
                    },
                }
            }

            Verb::Update => {
                let (template, subs) = self
                    .selector
                    .as_ref()
                    .ok_or_else(|| QueryError::BuilderMisuse("update without template".into()))?;
                let selector =
                    QueryBuilder::compile_template(template, subs, &schema, false)?;
                let target = self.single_alias()?;
                let (alias, sink) = self
                    .sink
                    .clone()
                    .ok_or_else(|| QueryError::BuilderMisuse("update without into".into()))?;
                PlanNode::Write {
                    child: Box::new(PlanNode::Select {
                        child: Box::new(root),
                        selector,
                        merge_source: Some(target),
                    }),
                    sink,
                    alias,
                    options: WriteOptions {
                        overwrite: true,
                        delete: false,
                    },
                }
            }

            Verb::Delete => {
                let target = self.single_alias()?;
                let dep = self.schema[&target];
                let mut deps = DepSet::new();
                deps.insert(target.clone(), dep);
                let selector = Expression::new(Node::Source(target), deps)
                    .with_subs(Rc::new(Vec::new()));
                let (alias, sink) = self
                    .sink
                    .clone()
                    .ok_or_else(|| QueryError::BuilderMisuse("delete without a target".into()))?;
                PlanNode::Write {
                    child: Box::new(PlanNode::Select {
                        child: Box::new(root),
                        selector,
                        merge_source: None,
                    }),
                    sink,
                    alias,
                    options: WriteOptions {
                        overwrite: true,
                        delete: true,
                    },
                }
            }
        };

        let tree = match &self.returning {
            None => tree,
            Some((template, subs)) => {
                let selector =
                    QueryBuilder::compile_template(template, subs, &Schema::Unknown, false)?;
                PlanNode::Select {
                    child: Box::new(tree),
                    selector,
                    merge_source: None,
                }
            }
        };

        let tree = if self.memoized {
            PlanNode::Memoize {
                id: NodeId::fresh(),
                child: Box::new(tree),
            }
        } else {
            tree
        };

        Ok(Query {
            plan: plan_finalize::finalize(tree)?,
        })
    }

    fn single_alias(&self) -> QueryResult<String> {
        if self.schema.len() != 1 {
            return Err(QueryError::BuilderMisuse(
                "update/delete requires exactly one source".into(),
            ));
        }
        Ok(self
            .schema
            .keys()
            .next()
            .cloned()
            .unwrap_or_default())
    }
}

/// Combine two finalized select queries with a set operation.
pub fn union(left: Query, right: Query) -> QueryResult<Query> {
    set_op(SetOpKind::Union, left, right)
}

pub fn union_all(left: Query, right: Query) -> QueryResult<Query> {
    set_op(SetOpKind::UnionAll, left, right)
}

fn set_op(kind: SetOpKind, left: Query, right: Query) -> QueryResult<Query> {
    let (left, right) = (left.subplan(), right.subplan());
    let names = |plan: &PlanNode| {
        plan.schema()
            .map(|s| s.into_keys().collect::<Vec<_>>())
    };
    if names(&left) != names(&right) {
        return Err(QueryError::SchemaMismatch(
            "legs expose different source names".into(),
        ));
    }
    let tree = PlanNode::SetOp {
        kind,
        left: Box::new(left),
        right: Box::new(right),
    };
    Ok(Query {
        plan: plan_finalize::finalize(tree)?,
    })
}

/// A finalized, immutable, repeatedly-executable query.
#[derive(Debug, Clone)]
pub struct Query {
    plan: PlanNode,
}

impl Query {
    pub fn plan(&self) -> &PlanNode {
        &self.plan
    }

    /// The plan stripped of its transaction envelope, for embedding as a
    /// subquery or set-operation leg inside an enclosing query.
    fn subplan(&self) -> PlanNode {
        match self.plan.clone() {
            PlanNode::Envelope { child, .. } => *child,
            other => other,
        }
    }

    /// Begin a lazy execution. The returned handle exposes the row stream
    /// and, once pulled, the ambient transaction.
    pub fn execute(&self, params: Record) -> Execution<'_> {
        self.execute_in(params, None)
    }

    pub fn execute_in(&self, params: Record, txn: Option<TxnHandle>) -> Execution<'_> {
        let ctx = ExecCtx::new(params, txn);
        let stream = execute(&self.plan, &ctx);
        Execution { stream, ctx }
    }

    /// Materialise the result rows, then drive the transaction's idle
    /// auto-completion.
    pub fn collect(&self, params: Record) -> QueryResult<Vec<Row>> {
        let mut execution = self.execute(params);
        let rows: QueryResult<Vec<Row>> = execution.stream.by_ref().collect();
        execution.finish();
        rows
    }

    /// Materialise the result records (the consumer-facing shape).
    pub fn collect_records(&self, params: Record) -> QueryResult<Vec<Record>> {
        Ok(self
            .collect(params)?
            .into_iter()
            .map(|row| row.result_record())
            .collect())
    }

    /// Run `f` for each result record.
    pub fn for_each(
        &self,
        params: Record,
        mut f: impl FnMut(Record),
    ) -> QueryResult<()> {
        for record in self.collect_records(params)? {
            f(record);
        }
        Ok(())
    }
}

/// One in-flight execution of a query.
pub struct Execution<'q> {
    pub stream: RowStream<'q>,
    ctx: ExecCtx<'q>,
}

impl Execution<'_> {
    /// The ambient transaction, once the envelope installed one.
    pub fn txn(&self) -> Option<TxnHandle> {
        self.ctx.txn()
    }

    /// Drive idle ticks so an armed in-memory transaction auto-completes.
    pub fn finish(self) {
        if let Some(txn) = self.ctx.txn() {
            txn.run_idle();
        }
    }
}
