//! Public API facade for OnionQL.
//!
//! Re-exports the pieces an embedding front end needs: bind a statement
//! against a schema, describe the available onions, and generate a plan.

pub use onionql_ast::{
    Binder, BoundStmt, Expr, FieldIdent, GroupBy, Literal, OrderDirection, OrderKey, Projection,
    RelationDecl, RelationSource, SelectStmt,
};
pub use onionql_error::{PlanError, PlanResult};
pub use onionql_planner::{
    generate_candidate_plans, generate_onion_sets, EncContext, EstimateContext, OnionSet,
    PlanGenerator, PlanNode,
};
pub use onionql_types::{
    ColumnDef, DataType, Onion, OnionType, Schema, Statistics, TableDef, TableStats,
};
