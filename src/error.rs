//! Query Engine Error Types

use thiserror::Error;

/// Errors raised across the build / plan / execute lifecycle of a query.
///
/// Build-time and plan-time errors leave the query unusable; runtime errors
/// surface as stream errors and abort the ambient transaction. No operation
/// is retried automatically.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    // --- build-time -------------------------------------------------------

    /// Expression fragment failed to parse
    #[error("parse error: {0}")]
    Parse(String),

    /// Identifier not bound by the schema, parameters, or standard scope
    #[error("unknown name '{0}' in expression")]
    UnknownName(String),

    /// `$$`-prefixed name outside the reserved set
    #[error("reserved name '{0}' is not usable in expressions")]
    ReservedName(String),

    /// Source alias registered twice in one join scope
    #[error("duplicate alias '{0}' in join")]
    DuplicateAlias(String),

    /// Aggregate call in a context that does not allow aggregates
    #[error("aggregate function '{0}' is not allowed here")]
    AggregateNotAllowed(String),

    /// Fluent surface misuse (select/into/groupBy repeated, missing from, ...)
    #[error("builder misuse: {0}")]
    BuilderMisuse(String),

    /// Modification attempted after the query was finalized
    #[error("query is finalized and can no longer be modified")]
    Finalized,

    // --- plan-time --------------------------------------------------------

    /// Terms left unassigned after predicate hoisting
    #[error("unassigned terms after hoisting: {0}")]
    UnassignedTerms(String),

    /// A query may touch at most one persistent store
    #[error("query references more than one persistent store")]
    MultipleStores,

    /// Set operation over schema-incompatible children
    #[error("set operation legs are not union-compatible: {0}")]
    SchemaMismatch(String),

    // --- runtime ----------------------------------------------------------

    /// Insert hit an existing primary key with overwrite disabled
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Error reported by the backing store
    #[error("store error: {0}")]
    Store(String),

    /// Expression evaluation failed
    #[error("evaluation error: {0}")]
    Eval(String),

    /// Group state is corrupt (aggregate slot out of bounds or mistyped)
    #[error("corrupt group state: {0}")]
    GroupState(String),

    /// Execute was called with an already-settled transaction
    #[error("transaction is already settled")]
    TransactionSettled,

    /// The ambient transaction was aborted
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for all query operations
pub type QueryResult<T> = Result<T, QueryError>;
