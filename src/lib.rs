//! # Squill Query Engine
//!
//! An embedded relational query engine: fluent SQL-like statements over a
//! mixture of in-memory collections and an ordered key/value store with
//! primary and secondary indexes.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Fluent statement (templates + substitutions)
//!     ↓
//! [Expression Compiler]   → terms with dependency sets + key ranges
//!     ↓
//! [Relational Tree]       → sources, joins, where, group/order, writes
//!     ↓
//! [Finalization]          → predicates hoisted onto sources, orderings
//!     ↓                     fused, transaction envelope attached
//! [Executor]              → lazy row stream (index-selected scans,
//!     ↓                     nested-loop joins, group folds)
//! Results
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use squill::{select, SourceInput};
//! use squill::store::MemCollection;
//! use serde_json::json;
//!
//! let things = MemCollection::from_json(json!([
//!     {"id": 1, "name": "Apple",  "calories": 95},
//!     {"id": 2, "name": "Banana", "calories": 105},
//! ]));
//!
//! let query = select("{name: thing.name}")
//!     .from([("thing", SourceInput::from(things))])
//!     .where_("thing.calories > 100")
//!     .finalize()
//!     .expect("valid query");
//!
//! let rows = query.collect_records(Default::default()).expect("results");
//! assert_eq!(rows.len(), 1);
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | Value domain, total-order comparator, records, rows |
//! | `range` | Interval algebra, key ranges, native-range synthesis |
//! | `expr` | Template parsing, compile transforms, evaluation |
//! | `term` | Conjunctive term decomposition and merging |
//! | `plan` | Relational tree and the finalization passes |
//! | `exec` | Pull-based executor, streams, index selection |
//! | `store` | Store contracts, in-memory collections, reference store |
//! | `txn` | Transaction settlement, overlays, idle auto-complete |
//! | `builder` | Fluent statement surface |
//! | `config` | figment-backed engine configuration |

// Core value domain and comparator
pub mod value;

// Range algebra over the value domain
pub mod range;

// Expression compiler and evaluator
pub mod expr;

// Conjunctive term decomposition
pub mod term;

// Relational tree and finalization
pub mod plan;

// Pull-based executor
pub mod exec;

// Store contracts and in-memory backends
pub mod store;

// Transaction model
pub mod txn;

// Fluent builder surface
pub mod builder;

// Configuration system
pub mod config;

// Error taxonomy
pub mod error;

// Re-export the public surface
pub use builder::{
    delete_from, insert, insert_with, select, select_with, union, union_all, update,
    update_with, upsert, upsert_with, Execution, Query, QueryBuilder, SourceInput,
};
pub use config::EngineConfig;
pub use error::{QueryError, QueryResult};
pub use store::{MemCollection, MemoryStore};
pub use txn::{Transaction, TxnHandle};
pub use value::{KeyPath, KeySpec, Record, Row, Value};
