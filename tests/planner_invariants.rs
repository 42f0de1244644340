//! Cross-cutting engine invariants: memoized subtrees execute once per
//! execution, finalized plans agree with a naive nested-loop rendering of
//! the same statement, and every parsed term ends up attached exactly
//! once somewhere in the plan.

use serde_json::json;
use squill::plan::PlanNode;
use squill::store::MemCollection;
use squill::{select, Record, SourceInput, Value};
use std::cell::Cell;
use std::rc::Rc;

#[test]
fn memoized_subquery_executes_its_child_once() {
    let executions = Rc::new(Cell::new(0));
    let counter = Rc::clone(&executions);
    let counted = SourceInput::derived(move |_| {
        counter.set(counter.get() + 1);
        vec![
            Record::from_pairs([("x", 1)]),
            Record::from_pairs([("x", 2)]),
        ]
    });

    let shared = select("{x: t.x}")
        .from([("t", counted)])
        .memoize()
        .finalize()
        .expect("finalize");

    // The same memoized subquery feeds both sides of a join.
    let query = select("{a: l.x, b: r.x}")
        .from([
            ("l", SourceInput::from(shared.clone())),
            ("r", SourceInput::from(shared)),
        ])
        .finalize()
        .expect("finalize");

    let records = query.collect_records(Record::new()).expect("collect");
    assert_eq!(records.len(), 4);
    assert_eq!(executions.get(), 1, "memoized child ran more than once");

    // A fresh execution starts a fresh memo.
    query.collect_records(Record::new()).expect("collect");
    assert_eq!(executions.get(), 2);
}

#[test]
fn finalized_plan_matches_naive_nested_loops() {
    let things = MemCollection::from_json(json!([
        {"id": 1, "name": "Apple",  "calories": 95,  "type_id": 1},
        {"id": 2, "name": "Banana", "calories": 105, "type_id": 1},
        {"id": 3, "name": "Cake",   "calories": 235, "type_id": 2},
        {"id": 4, "name": "Soup",   "calories": 80,  "type_id": 2},
    ]));
    let types = MemCollection::from_json(json!([
        {"id": 1, "name": "Vegetable"},
        {"id": 2, "name": "Mineral"},
    ]));

    let query = select("{name: thing.name, type_name: type.name}")
        .from([
            ("thing", SourceInput::from(things.clone())),
            ("type", SourceInput::from(types.clone())),
        ])
        .where_("thing.type_id === type.id && thing.calories > 90")
        .finalize()
        .expect("finalize");
    let planned = query.collect_records(Record::new()).expect("collect");

    // Naive rendering: cross product, then filter, in source order.
    let mut naive = Vec::new();
    for thing in things.records() {
        for ty in types.records() {
            if thing.get("type_id") == ty.get("id")
                && matches!(thing.get("calories"), Value::Number(n) if *n > 90.0)
            {
                naive.push(Record::from_pairs([
                    ("name", thing.get("name").clone()),
                    ("type_name", ty.get("name").clone()),
                ]));
            }
        }
    }
    assert_eq!(planned, naive);
}

#[test]
fn every_term_attaches_exactly_once() {
    let things = MemCollection::from_json(json!([{"id": 1, "type_id": 1}]));
    let types = MemCollection::from_json(json!([{"id": 1}]));

    // Three terms: one per source, one cross-source.
    let query = select("{id: thing.id}")
        .from([
            ("thing", SourceInput::from(things)),
            ("type", SourceInput::from(types)),
        ])
        .where_("thing.id > 0 && type.id > 0 && thing.type_id === type.id")
        .finalize()
        .expect("finalize");

    fn count_attached(node: &PlanNode) -> usize {
        let own = match node {
            PlanNode::Source { predicates, .. } => predicates.len(),
            PlanNode::Join { predicates, .. } => predicates.len(),
            PlanNode::Where { predicate, .. } => usize::from(predicate.is_some()),
            _ => 0,
        };
        let children: usize = match node {
            PlanNode::Source { .. } => 0,
            PlanNode::Join { left, right, .. }
            | PlanNode::SetOp { left, right, .. }
            | PlanNode::CompositeUnion { left, right } => {
                count_attached(left) + count_attached(right)
            }
            PlanNode::Where { child, .. }
            | PlanNode::GroupBy { child, .. }
            | PlanNode::OrderBy { child, .. }
            | PlanNode::Select { child, .. }
            | PlanNode::Write { child, .. }
            | PlanNode::Memoize { child, .. }
            | PlanNode::Envelope { child, .. } => count_attached(child),
        };
        own + children
    }
    assert_eq!(count_attached(query.plan()), 3);
}

#[test]
fn distinct_source_nodes_have_distinct_identities() {
    // The same collection joined twice under different aliases is two
    // independent dependencies; a predicate on one must not filter the
    // other.
    let rows = MemCollection::from_json(json!([
        {"id": 1}, {"id": 2},
    ]));
    let query = select("{a: left.id, b: right.id}")
        .from([
            ("left", SourceInput::from(rows.clone())),
            ("right", SourceInput::from(rows)),
        ])
        .where_("left.id === 1")
        .finalize()
        .expect("finalize");
    let records = query.collect_records(Record::new()).expect("collect");
    assert_eq!(records.len(), 2);
    for record in records {
        assert_eq!(record.get("a"), &Value::from(1));
    }
}
