//! AST node types and scope graph for OnionQL.
//!
//! The rewriter consumes a *bound* SELECT statement: every `FieldIdent`
//! carries a [`Symbol`] pointing at the [`Context`] that defines it, and all
//! contexts live in a [`ScopeArena`] owned by whoever bound the statement.
//! Rewriting never mutates input nodes; transforms produce new trees with
//! shared structure where unchanged.
//!
//! One enum covers plaintext input expressions, rewritten server-side
//! expressions (encrypted literals, bound placeholders), and client-side
//! residual expressions (tuple positions, subquery positions). The variants
//! a given pipeline stage may produce are documented on each variant.

pub mod bind;
mod display;
pub mod transform;

pub use bind::{lookup_column, resolve_aliases, BindError, Binder, BoundStmt};

use onionql_types::{DataType, Onion};

// ---------------------------------------------------------------------------
// Scope arena
// ---------------------------------------------------------------------------

/// Handle to a [`Context`] in a [`ScopeArena`].
///
/// Parent links between contexts are stored as handles, never owning
/// references, so the (cyclic-looking) child→parent graph stays a plain
/// vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u32);

impl ContextId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A relation visible in one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtxRelation {
    /// A base table of the logical schema.
    Table { name: String },
    /// A derived table; its projections live in the referenced context.
    Subquery { ctx: ContextId },
}

/// One output column descriptor of a SELECT, as seen by scope lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionDesc {
    /// A named output column at position `pos`.
    Named {
        name: String,
        expr: Expr,
        pos: usize,
    },
    /// A `*` projection; expands to the relations of the owning context.
    Wildcard,
}

/// One scope: the relations and output columns of a single SELECT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    /// Relation alias → relation, in FROM order.
    pub relations: Vec<(String, CtxRelation)>,
    /// Output column descriptors, positions contiguous from 0.
    pub projections: Vec<ProjectionDesc>,
    /// Enclosing scope, if any.
    pub parent: Option<ContextId>,
}

impl Context {
    /// Find a relation by alias (case-insensitive).
    #[must_use]
    pub fn relation(&self, alias: &str) -> Option<&CtxRelation> {
        self.relations
            .iter()
            .find(|(a, _)| a.eq_ignore_ascii_case(alias))
            .map(|(_, r)| r)
    }
}

/// Arena owning every [`Context`] of one bound statement tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeArena {
    ctxs: Vec<Context>,
}

impl ScopeArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, ctx: Context) -> ContextId {
        let id = ContextId(u32::try_from(self.ctxs.len()).expect("scope arena overflow"));
        self.ctxs.push(ctx);
        id
    }

    #[must_use]
    pub fn get(&self, id: ContextId) -> &Context {
        &self.ctxs[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ctxs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ctxs.is_empty()
    }

    pub fn get_mut(&mut self, id: ContextId) -> &mut Context {
        &mut self.ctxs[id.index()]
    }

    /// Whether `parent` is a (transitive) ancestor of `child`.
    #[must_use]
    pub fn is_parent_of(&self, parent: ContextId, child: ContextId) -> bool {
        let mut cur = self.get(child).parent;
        while let Some(id) = cur {
            if id == parent {
                return true;
            }
            cur = self.get(id).parent;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

/// Binding of a `FieldIdent` to a column of a relation in scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnSymbol {
    /// Alias of the relation in the defining scope.
    pub relation: String,
    /// Column name within that relation.
    pub column: String,
    /// Defining scope.
    pub ctx: ContextId,
    /// Logical type.
    pub ty: DataType,
}

/// Binding of a `FieldIdent` to a named projection of the enclosing SELECT.
/// Only legal in GROUP BY and ORDER BY keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectionSymbol {
    /// Projection name.
    pub name: String,
    /// Defining scope.
    pub ctx: ContextId,
    /// Logical type.
    pub ty: DataType,
}

/// What a bound `FieldIdent` refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Symbol {
    Column(ColumnSymbol),
    Projection(ProjectionSymbol),
}

impl Symbol {
    /// The defining scope of this symbol.
    #[must_use]
    pub fn ctx(&self) -> ContextId {
        match self {
            Self::Column(c) => c.ctx,
            Self::Projection(p) => p.ctx,
        }
    }

    /// Logical type of the bound value.
    #[must_use]
    pub fn ty(&self) -> DataType {
        match self {
            Self::Column(c) => c.ty,
            Self::Projection(p) => p.ty,
        }
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// A (possibly qualified) column or projection reference.
///
/// `symbol` is `None` before binding and in *canonical* form (the key shape
/// used by onion-set lookups): canonicalization strips both the qualifier
/// and the symbol so syntactically identical references collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldIdent {
    pub qualifier: Option<String>,
    pub name: String,
    pub symbol: Option<Symbol>,
}

impl FieldIdent {
    #[must_use]
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
            symbol: None,
        }
    }

    #[must_use]
    pub fn qualified(qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            qualifier: Some(qualifier.into()),
            name: name.into(),
            symbol: None,
        }
    }

    /// Copy with the qualifier and symbol stripped.
    #[must_use]
    pub fn canonical(&self) -> Self {
        Self {
            qualifier: None,
            name: self.name.clone(),
            symbol: None,
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Equality-like operators admit DET; inequality-like require OPE.
    #[must_use]
    pub const fn is_equality(self) -> bool {
        matches!(self, Self::Eq | Self::Ne)
    }

    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Arithmetic binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Plus,
    Minus,
    Mult,
    Div,
}

impl BinOp {
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Mult => "*",
            Self::Div => "/",
        }
    }
}

/// Aggregate functions taking one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggOp {
    Count,
    Min,
    Max,
    Sum,
    Avg,
}

impl AggOp {
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
        }
    }
}

/// Literal values.
///
/// No raw floats: decimal text keeps `Eq`/`Hash` derivable so canonical
/// expressions can key hash maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Literal {
    Int(i64),
    Decimal(String),
    Str(String),
    Date(String),
    Bool(bool),
    Null,
}

/// One WHEN/THEN arm of a CASE expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaseBranch {
    pub cond: Expr,
    pub then: Expr,
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    // --- input + server shapes ---
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    In {
        needle: Box<Expr>,
        set: Vec<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    Binop {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Case {
        branches: Vec<CaseBranch>,
        else_branch: Option<Box<Expr>>,
    },
    CountStar,
    Agg {
        op: AggOp,
        arg: Box<Expr>,
    },
    /// `GROUP_CONCAT(arg, sep)`; server-side vector projection for residual
    /// aggregate work.
    GroupConcat {
        arg: Box<Expr>,
        sep: String,
    },
    /// Opaque scalar function call (`substr`, `searchSWP`, `hom_agg`, ...).
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Field(FieldIdent),
    Lit(Literal),
    Subselect(Box<SelectStmt>),
    Exists(Box<SelectStmt>),
    /// Positional stand-in for an outer-tuple value inside a rewritten
    /// correlated subquery; bound per row at execution time.
    DependentPlaceholder(usize),

    // --- server-only shapes (produced by the rewriter) ---
    /// A literal encrypted under one onion before shipping.
    EncLit {
        lit: Literal,
        onion: Onion,
    },
    /// A dependent placeholder whose binding onion has been chosen.
    BoundPlaceholder {
        slot: usize,
        onion: Onion,
    },

    // --- client-only shapes (produced by the residual builder) ---
    /// Reference to one position of the consumed tuple.
    TuplePos(usize),
    /// Scalar result of the i-th residual subquery plan.
    SubqueryPos(usize),
    /// Non-emptiness of the i-th residual subquery plan.
    ExistsSubqueryPos(usize),
}

impl Expr {
    #[must_use]
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(FieldIdent::bare(name))
    }

    #[must_use]
    pub fn qualified_field(qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Field(FieldIdent::qualified(qualifier, name))
    }

    #[must_use]
    pub fn int(v: i64) -> Self {
        Self::Lit(Literal::Int(v))
    }

    #[must_use]
    pub fn str(v: impl Into<String>) -> Self {
        Self::Lit(Literal::Str(v.into()))
    }

    #[must_use]
    pub fn cmp(op: CmpOp, lhs: Self, rhs: Self) -> Self {
        Self::Cmp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    #[must_use]
    pub fn and(lhs: Self, rhs: Self) -> Self {
        Self::And(Box::new(lhs), Box::new(rhs))
    }

    #[must_use]
    pub fn binop(op: BinOp, lhs: Self, rhs: Self) -> Self {
        Self::Binop {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Whether this subtree contains an aggregate call (not descending into
    /// subselects, which aggregate in their own scope).
    #[must_use]
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        transform::visit_expr(self, &mut |e| {
            if matches!(e, Self::CountStar | Self::Agg { .. }) {
                found = true;
                return transform::Recurse::Stop;
            }
            transform::Recurse::Continue
        });
        found
    }
}

// ---------------------------------------------------------------------------
// SELECT statements
// ---------------------------------------------------------------------------

/// One output column of a SELECT.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Projection {
    Expr { expr: Expr, alias: Option<String> },
    Star,
}

/// A FROM-clause entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationDecl {
    pub alias: String,
    pub source: RelationSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelationSource {
    Table { name: String },
    Subquery(Box<SelectStmt>),
}

/// GROUP BY clause: keys plus optional HAVING.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupBy {
    pub keys: Vec<Expr>,
    pub having: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// One ORDER BY key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderKey {
    pub expr: Expr,
    pub dir: OrderDirection,
}

/// A SELECT statement. `ctx` is `None` until bound (and on rewritten
/// server-side statements, whose scopes are physical, not logical).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SelectStmt {
    pub projections: Vec<Projection>,
    pub relations: Vec<RelationDecl>,
    pub filter: Option<Expr>,
    pub group_by: Option<GroupBy>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<u64>,
    pub ctx: Option<ContextId>,
}

impl SelectStmt {
    /// A statement with only projections and relations set.
    #[must_use]
    pub fn simple(projections: Vec<Projection>, relations: Vec<RelationDecl>) -> Self {
        Self {
            projections,
            relations,
            filter: None,
            group_by: None,
            order_by: vec![],
            limit: None,
            ctx: None,
        }
    }

    /// Output name of projection `i`: the alias if present, else the bare
    /// field name, else a positional fallback.
    #[must_use]
    pub fn projection_name(&self, i: usize) -> String {
        match &self.projections[i] {
            Projection::Expr {
                alias: Some(a), ..
            } => a.clone(),
            Projection::Expr {
                expr: Expr::Field(fi),
                alias: None,
            } => fi.name.clone(),
            _ => format!("col{i}"),
        }
    }

    /// Whether any projection is a wildcard.
    #[must_use]
    pub fn has_wildcard(&self) -> bool {
        self.projections.iter().any(|p| matches!(p, Projection::Star))
    }

    /// Whether the statement aggregates: it has a GROUP BY, or some
    /// projection (or HAVING) contains an aggregate call.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        if self.group_by.is_some() {
            return true;
        }
        self.projections.iter().any(|p| match p {
            Projection::Expr { expr, .. } => expr.contains_aggregate(),
            Projection::Star => false,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
