//! Name resolution: scope construction, column/projection lookup, alias
//! substitution.
//!
//! The planner consumes a statement whose `FieldIdent`s already carry
//! symbols. [`Binder`] produces one: it allocates a [`Context`] per SELECT
//! into a fresh [`ScopeArena`], records relations and projection
//! descriptors, and binds every field reference via [`lookup_column`].
//!
//! [`lookup_column`] search order: the current scope's relations first
//! (table columns hit the schema, subquery columns hit the subquery's
//! projection list, recursing through wildcards); then, for unqualified
//! names in projection scope, the scope's own named projections; then the
//! parent scope with projection lookup disabled, since SQL has no correlated
//! references to outer projections.

use onionql_error::PlanError;
use onionql_types::{DataType, Schema};

use crate::{
    AggOp, CaseBranch, ColumnSymbol, Context, ContextId, CtxRelation, Expr, Literal, Projection,
    ProjectionDesc, ProjectionSymbol, RelationSource, ScopeArena, SelectStmt, Symbol,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors during name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// The referenced table is not in the schema.
    UnknownTable { name: String },
    /// The referenced column matched nothing in any enclosing scope.
    UnknownColumn { name: String },
    /// An unqualified column matched more than one relation.
    AmbiguousColumn { name: String },
    /// Two relations in one FROM clause share an alias.
    DuplicateAlias { alias: String },
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTable { name } => write!(f, "no such table: {name}"),
            Self::UnknownColumn { name } => write!(f, "no such column: {name}"),
            Self::AmbiguousColumn { name } => write!(f, "ambiguous column name: {name}"),
            Self::DuplicateAlias { alias } => write!(f, "duplicate relation alias: {alias}"),
        }
    }
}

impl std::error::Error for BindError {}

impl From<BindError> for PlanError {
    fn from(e: BindError) -> Self {
        Self::Bind {
            detail: e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Column lookup
// ---------------------------------------------------------------------------

/// Resolve a (possibly qualified) column reference in `ctx`.
///
/// Returns every match; ties are not broken here and the order of equally
/// plausible symbols is unspecified; callers must tolerate multiple
/// results. `in_projection_scope` permits matches against the scope's own
/// named projections (GROUP BY / ORDER BY keys); it is forced off when the
/// search climbs to a parent scope.
#[must_use]
pub fn lookup_column(
    arena: &ScopeArena,
    schema: &Schema,
    ctx_id: ContextId,
    qualifier: Option<&str>,
    name: &str,
    in_projection_scope: bool,
) -> Vec<Symbol> {
    let ctx = arena.get(ctx_id);
    let mut out = Vec::new();

    for (alias, rel) in &ctx.relations {
        if let Some(q) = qualifier {
            if !q.eq_ignore_ascii_case(alias) {
                continue;
            }
        }
        let ty = match rel {
            CtxRelation::Table { name: table } => schema
                .table(table)
                .and_then(|t| t.find_column(name))
                .map(|c| c.ty),
            CtxRelation::Subquery { ctx: sub } => subquery_output_type(arena, schema, *sub, name),
        };
        if let Some(ty) = ty {
            out.push(Symbol::Column(ColumnSymbol {
                relation: alias.clone(),
                column: name.to_owned(),
                ctx: ctx_id,
                ty,
            }));
        }
    }

    // Only named projections are addressable by name; wildcard positions
    // never match here.
    if out.is_empty() && qualifier.is_none() && in_projection_scope {
        for p in &ctx.projections {
            if let ProjectionDesc::Named {
                name: pname, expr, ..
            } = p
            {
                if pname.eq_ignore_ascii_case(name) {
                    out.push(Symbol::Projection(ProjectionSymbol {
                        name: pname.clone(),
                        ctx: ctx_id,
                        ty: expr_type(expr),
                    }));
                }
            }
        }
    }

    if out.is_empty() {
        if let Some(parent) = ctx.parent {
            out = lookup_column(arena, schema, parent, qualifier, name, false);
        }
    }

    out
}

/// Type of the subquery output column named `name`, following wildcards
/// into the subquery's own relations.
fn subquery_output_type(
    arena: &ScopeArena,
    schema: &Schema,
    sub_ctx: ContextId,
    name: &str,
) -> Option<DataType> {
    let ctx = arena.get(sub_ctx);
    for p in &ctx.projections {
        match p {
            ProjectionDesc::Named { name: pname, expr, .. }
                if pname.eq_ignore_ascii_case(name) =>
            {
                return Some(expr_type(expr));
            }
            ProjectionDesc::Wildcard => {
                for (_, rel) in &ctx.relations {
                    let found = match rel {
                        CtxRelation::Table { name: table } => schema
                            .table(table)
                            .and_then(|t| t.find_column(name))
                            .map(|c| c.ty),
                        CtxRelation::Subquery { ctx: inner } => {
                            subquery_output_type(arena, schema, *inner, name)
                        }
                    };
                    if found.is_some() {
                        return found;
                    }
                }
            }
            ProjectionDesc::Named { .. } => {}
        }
    }
    None
}

/// Best-effort logical type of a bound expression.
#[must_use]
pub fn expr_type(e: &Expr) -> DataType {
    match e {
        Expr::Field(fi) => fi.symbol.as_ref().map_or(DataType::Unknown, Symbol::ty),
        Expr::Lit(l) | Expr::EncLit { lit: l, .. } => match l {
            Literal::Int(_) => DataType::Int,
            Literal::Decimal(_) => DataType::Decimal,
            Literal::Str(_) => DataType::Str,
            Literal::Date(_) => DataType::Date,
            Literal::Bool(_) => DataType::Bool,
            Literal::Null => DataType::Unknown,
        },
        Expr::CountStar => DataType::Int,
        Expr::Agg { op, arg } => match op {
            AggOp::Count => DataType::Int,
            AggOp::Sum | AggOp::Avg => DataType::Decimal,
            AggOp::Min | AggOp::Max => expr_type(arg),
        },
        Expr::Binop { lhs, rhs, .. } => {
            if expr_type(lhs) == DataType::Decimal || expr_type(rhs) == DataType::Decimal {
                DataType::Decimal
            } else {
                DataType::Int
            }
        }
        Expr::Case { branches, .. } => branches
            .first()
            .map_or(DataType::Unknown, |b| expr_type(&b.then)),
        Expr::And(..) | Expr::Or(..) | Expr::Not(_) | Expr::Cmp { .. } | Expr::In { .. }
        | Expr::Like { .. } | Expr::Exists(_) => DataType::Bool,
        _ => DataType::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Alias substitution
// ---------------------------------------------------------------------------

/// Replace every `FieldIdent` bound to a [`ProjectionSymbol`] with its
/// defining expression, recursively. Idempotent: a resolved tree contains
/// no projection symbols, so a second pass is the identity.
#[must_use]
pub fn resolve_aliases(arena: &ScopeArena, e: &Expr) -> Expr {
    crate::transform::top_down_transform(e, &mut |node| {
        if let Expr::Field(fi) = node {
            if let Some(Symbol::Projection(ps)) = &fi.symbol {
                for p in &arena.get(ps.ctx).projections {
                    if let ProjectionDesc::Named { name, expr, .. } = p {
                        if name.eq_ignore_ascii_case(&ps.name) {
                            return (
                                Some(resolve_aliases(arena, expr)),
                                crate::transform::Recurse::Stop,
                            );
                        }
                    }
                }
            }
        }
        (None, crate::transform::Recurse::Continue)
    })
}

// ---------------------------------------------------------------------------
// Binder
// ---------------------------------------------------------------------------

/// A statement plus the scope arena its symbols point into.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStmt {
    pub stmt: SelectStmt,
    pub arena: ScopeArena,
}

/// Allocates contexts and fills symbols for a hand-built statement.
pub struct Binder<'a> {
    schema: &'a Schema,
    arena: ScopeArena,
    columns_bound: u64,
}

impl<'a> Binder<'a> {
    #[must_use]
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            arena: ScopeArena::new(),
            columns_bound: 0,
        }
    }

    /// Bind a statement, consuming the binder.
    pub fn bind(mut self, stmt: SelectStmt) -> Result<BoundStmt, BindError> {
        let span = tracing::debug_span!(
            target: "onionql.bind",
            "bind_statement",
            contexts = tracing::field::Empty,
            columns_bound = tracing::field::Empty,
        );
        let _guard = span.enter();

        let mut stmt = stmt;
        self.bind_select(&mut stmt, None)?;

        span.record("contexts", self.arena.len() as u64);
        span.record("columns_bound", self.columns_bound);

        Ok(BoundStmt {
            stmt,
            arena: self.arena,
        })
    }

    fn bind_select(
        &mut self,
        stmt: &mut SelectStmt,
        parent: Option<ContextId>,
    ) -> Result<ContextId, BindError> {
        let ctx = self.arena.alloc(Context {
            parent,
            ..Context::default()
        });
        stmt.ctx = Some(ctx);

        for rel in &mut stmt.relations {
            if self.arena.get(ctx).relation(&rel.alias).is_some() {
                return Err(BindError::DuplicateAlias {
                    alias: rel.alias.clone(),
                });
            }
            let entry = match &mut rel.source {
                RelationSource::Table { name } => {
                    if self.schema.table(name).is_none() {
                        return Err(BindError::UnknownTable { name: name.clone() });
                    }
                    CtxRelation::Table { name: name.clone() }
                }
                RelationSource::Subquery(sub) => {
                    let sub_ctx = self.bind_select(sub, Some(ctx))?;
                    CtxRelation::Subquery { ctx: sub_ctx }
                }
            };
            self.arena
                .get_mut(ctx)
                .relations
                .push((rel.alias.clone(), entry));
        }

        for p in &mut stmt.projections {
            if let Projection::Expr { expr, .. } = p {
                self.bind_expr(expr, ctx, false)?;
            }
        }
        for i in 0..stmt.projections.len() {
            let desc = match &stmt.projections[i] {
                Projection::Star => ProjectionDesc::Wildcard,
                Projection::Expr { expr, .. } => ProjectionDesc::Named {
                    name: stmt.projection_name(i),
                    expr: expr.clone(),
                    pos: i,
                },
            };
            self.arena.get_mut(ctx).projections.push(desc);
        }

        if let Some(f) = &mut stmt.filter {
            self.bind_expr(f, ctx, false)?;
        }
        if let Some(g) = &mut stmt.group_by {
            for k in &mut g.keys {
                self.bind_expr(k, ctx, true)?;
            }
            if let Some(h) = &mut g.having {
                self.bind_expr(h, ctx, false)?;
            }
        }
        for k in &mut stmt.order_by {
            self.bind_expr(&mut k.expr, ctx, true)?;
        }

        Ok(ctx)
    }

    fn bind_expr(
        &mut self,
        e: &mut Expr,
        ctx: ContextId,
        in_projection_scope: bool,
    ) -> Result<(), BindError> {
        match e {
            Expr::Field(fi) => {
                let mut matches = lookup_column(
                    &self.arena,
                    self.schema,
                    ctx,
                    fi.qualifier.as_deref(),
                    &fi.name,
                    in_projection_scope,
                );
                match matches.len() {
                    0 => Err(BindError::UnknownColumn {
                        name: fi.name.clone(),
                    }),
                    1 => {
                        fi.symbol = Some(matches.remove(0));
                        self.columns_bound += 1;
                        Ok(())
                    }
                    _ => Err(BindError::AmbiguousColumn {
                        name: fi.name.clone(),
                    }),
                }
            }
            Expr::Subselect(sub) | Expr::Exists(sub) => {
                self.bind_select(sub, Some(ctx)).map(|_| ())
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                self.bind_expr(l, ctx, in_projection_scope)?;
                self.bind_expr(r, ctx, in_projection_scope)
            }
            Expr::Not(x) => self.bind_expr(x, ctx, in_projection_scope),
            Expr::Cmp { lhs, rhs, .. } | Expr::Binop { lhs, rhs, .. } => {
                self.bind_expr(lhs, ctx, in_projection_scope)?;
                self.bind_expr(rhs, ctx, in_projection_scope)
            }
            Expr::In { needle, set, .. } => {
                self.bind_expr(needle, ctx, in_projection_scope)?;
                for x in set {
                    self.bind_expr(x, ctx, in_projection_scope)?;
                }
                Ok(())
            }
            Expr::Like { expr, pattern, .. } => {
                self.bind_expr(expr, ctx, in_projection_scope)?;
                self.bind_expr(pattern, ctx, in_projection_scope)
            }
            Expr::Case {
                branches,
                else_branch,
            } => {
                for CaseBranch { cond, then } in branches {
                    self.bind_expr(cond, ctx, in_projection_scope)?;
                    self.bind_expr(then, ctx, in_projection_scope)?;
                }
                if let Some(x) = else_branch {
                    self.bind_expr(x, ctx, in_projection_scope)?;
                }
                Ok(())
            }
            Expr::Agg { arg, .. } | Expr::GroupConcat { arg, .. } => {
                self.bind_expr(arg, ctx, in_projection_scope)
            }
            Expr::Call { args, .. } => {
                for x in args {
                    self.bind_expr(x, ctx, in_projection_scope)?;
                }
                Ok(())
            }
            Expr::CountStar
            | Expr::Lit(_)
            | Expr::DependentPlaceholder(_)
            | Expr::EncLit { .. }
            | Expr::BoundPlaceholder { .. }
            | Expr::TuplePos(_)
            | Expr::SubqueryPos(_)
            | Expr::ExistsSubqueryPos(_) => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CmpOp, OrderDirection, OrderKey, RelationDecl};
    use onionql_types::{ColumnDef, TableDef};

    fn schema() -> Schema {
        let mut s = Schema::new();
        s.add_table(TableDef {
            name: "t".to_owned(),
            columns: vec![
                ColumnDef {
                    name: "a".to_owned(),
                    ty: DataType::Int,
                },
                ColumnDef {
                    name: "b".to_owned(),
                    ty: DataType::Str,
                },
            ],
        });
        s.add_table(TableDef {
            name: "u".to_owned(),
            columns: vec![ColumnDef {
                name: "a".to_owned(),
                ty: DataType::Int,
            }],
        });
        s
    }

    fn table(alias: &str, name: &str) -> RelationDecl {
        RelationDecl {
            alias: alias.to_owned(),
            source: RelationSource::Table {
                name: name.to_owned(),
            },
        }
    }

    fn proj(expr: Expr) -> Projection {
        Projection::Expr { expr, alias: None }
    }

    #[test]
    fn test_bind_simple_select() {
        let stmt = SelectStmt::simple(vec![proj(Expr::field("a"))], vec![table("t", "t")]);
        let bound = Binder::new(&schema()).bind(stmt).expect("binds");
        let Projection::Expr { expr, .. } = &bound.stmt.projections[0] else {
            panic!("expected expr projection");
        };
        let Expr::Field(fi) = expr else {
            panic!("expected field");
        };
        let Some(Symbol::Column(cs)) = &fi.symbol else {
            panic!("expected column symbol");
        };
        assert_eq!(cs.relation, "t");
        assert_eq!(cs.ty, DataType::Int);
        assert_eq!(cs.ctx, bound.stmt.ctx.unwrap());
    }

    #[test]
    fn test_bind_unknown_column() {
        let stmt = SelectStmt::simple(vec![proj(Expr::field("nope"))], vec![table("t", "t")]);
        assert_eq!(
            Binder::new(&schema()).bind(stmt),
            Err(BindError::UnknownColumn {
                name: "nope".to_owned()
            })
        );
    }

    #[test]
    fn test_bind_ambiguous_across_relations() {
        let stmt = SelectStmt::simple(
            vec![proj(Expr::field("a"))],
            vec![table("t", "t"), table("u", "u")],
        );
        assert_eq!(
            Binder::new(&schema()).bind(stmt),
            Err(BindError::AmbiguousColumn {
                name: "a".to_owned()
            })
        );
    }

    #[test]
    fn test_order_by_alias_binds_to_projection() {
        let mut stmt = SelectStmt::simple(
            vec![Projection::Expr {
                expr: Expr::field("a"),
                alias: Some("x".to_owned()),
            }],
            vec![table("t", "t")],
        );
        stmt.order_by = vec![OrderKey {
            expr: Expr::field("x"),
            dir: OrderDirection::Asc,
        }];
        let bound = Binder::new(&schema()).bind(stmt).expect("binds");
        let Expr::Field(fi) = &bound.stmt.order_by[0].expr else {
            panic!("expected field");
        };
        assert!(matches!(fi.symbol, Some(Symbol::Projection(_))));

        let resolved = resolve_aliases(&bound.arena, &bound.stmt.order_by[0].expr);
        let Expr::Field(inner) = &resolved else {
            panic!("expected field after resolution");
        };
        assert!(matches!(inner.symbol, Some(Symbol::Column(_))));
        // Idempotent.
        assert_eq!(resolve_aliases(&bound.arena, &resolved), resolved);
    }

    #[test]
    fn test_correlated_lookup_climbs_to_parent() {
        // SELECT a FROM t WHERE EXISTS (SELECT u.a FROM u WHERE u.a = b)
        // `b` only exists in the outer scope.
        let inner = {
            let mut s = SelectStmt::simple(
                vec![proj(Expr::qualified_field("u", "a"))],
                vec![table("u", "u")],
            );
            s.filter = Some(Expr::cmp(
                CmpOp::Eq,
                Expr::qualified_field("u", "a"),
                Expr::field("b"),
            ));
            s
        };
        let mut stmt = SelectStmt::simple(vec![proj(Expr::field("a"))], vec![table("t", "t")]);
        stmt.filter = Some(Expr::Exists(Box::new(inner)));

        let bound = Binder::new(&schema()).bind(stmt).expect("binds");
        let Some(Expr::Exists(sub)) = &bound.stmt.filter else {
            panic!("expected exists");
        };
        let Some(Expr::Cmp { rhs, .. }) = &sub.filter else {
            panic!("expected comparison");
        };
        let Expr::Field(fi) = rhs.as_ref() else {
            panic!("expected field");
        };
        let sym = fi.symbol.as_ref().expect("bound");
        // `b`'s defining scope is the outer statement's.
        assert_eq!(sym.ctx(), bound.stmt.ctx.unwrap());
        assert!(bound
            .arena
            .is_parent_of(bound.stmt.ctx.unwrap(), sub.ctx.unwrap()));
    }

    #[test]
    fn test_lookup_through_wildcard_subquery() {
        // SELECT s.a FROM (SELECT * FROM t) s
        let inner = SelectStmt::simple(vec![Projection::Star], vec![table("t", "t")]);
        let stmt = SelectStmt::simple(
            vec![proj(Expr::qualified_field("s", "a"))],
            vec![RelationDecl {
                alias: "s".to_owned(),
                source: RelationSource::Subquery(Box::new(inner)),
            }],
        );
        let bound = Binder::new(&schema()).bind(stmt).expect("binds");
        let Projection::Expr { expr, .. } = &bound.stmt.projections[0] else {
            panic!("expected expr projection");
        };
        let Expr::Field(fi) = expr else {
            panic!("expected field");
        };
        let Some(Symbol::Column(cs)) = &fi.symbol else {
            panic!("expected column symbol");
        };
        assert_eq!(cs.relation, "s");
        assert_eq!(cs.ty, DataType::Int);
    }

    #[test]
    fn test_no_projection_symbols_from_parent_scope() {
        // ORDER BY in a subquery must not see outer projection aliases.
        let syms = {
            let stmt = SelectStmt::simple(
                vec![Projection::Expr {
                    expr: Expr::field("a"),
                    alias: Some("x".to_owned()),
                }],
                vec![table("t", "t")],
            );
            let bound = Binder::new(&schema()).bind(stmt).expect("binds");
            let mut arena = bound.arena;
            let child = arena.alloc(Context {
                parent: bound.stmt.ctx,
                ..Context::default()
            });
            lookup_column(&arena, &schema(), child, None, "x", true)
        };
        assert!(syms.is_empty());
    }
}
