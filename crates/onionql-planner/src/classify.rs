//! Expression classification: which server-side encrypted form, if any, can
//! answer a given expression.
//!
//! [`find_onionable_expr`] decides whether an expression is *precomputable*:
//! dependent on columns of exactly one base table, possibly seen through a
//! derived-table projection. Its canonical form (qualifiers and symbols
//! stripped) keys every onion-set lookup.
//!
//! The `get_supported_*` family on [`StmtPlanner`] turns a classified
//! expression into concrete server SQL against the encrypted relations,
//! picking the first acceptable onion bit-ascending so plans stay
//! deterministic.

use onionql_ast::{
    bind::resolve_aliases, transform, ColumnSymbol, ContextId, CtxRelation, Expr, FieldIdent,
    ProjectionDesc, ScopeArena, Symbol,
};
use onionql_types::{
    enc_column_name, enc_table_name, HomDesc, Onion, OnionType, Schema, ROWID_COLUMN,
};

use crate::StmtPlanner;

// ---------------------------------------------------------------------------
// Precomputable-form classification
// ---------------------------------------------------------------------------

/// Result of [`find_onionable_expr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionableInfo {
    /// Relation alias as seen in the expression's scope (possibly a derived
    /// table's alias).
    pub scope_alias: String,
    /// Underlying base table whose onion set keys the lookup.
    pub table: String,
    /// Canonical expression: aliases resolved, qualifiers and symbols
    /// stripped.
    pub canonical: Expr,
    /// Scope the expression's columns are bound in.
    pub ctx: ContextId,
    /// Whether classification recursed through a derived-table projection.
    pub via_subquery: bool,
}

/// Classify `e` as precomputable over a single base table.
///
/// Aliases are resolved first: onionability is a property of the underlying
/// column expression, not of projection names. Returns `None` when the
/// expression touches no columns, columns of more than one relation, or a
/// derived table through anything but a bare field reference.
#[must_use]
pub fn find_onionable_expr(
    arena: &ScopeArena,
    schema: &Schema,
    e: &Expr,
) -> Option<OnionableInfo> {
    let resolved = resolve_aliases(arena, e);
    let fields = transform::gather_fields(&resolved);

    let mut key: Option<(ContextId, String)> = None;
    for fi in &fields {
        let Some(Symbol::Column(cs)) = &fi.symbol else {
            return None;
        };
        let k = (cs.ctx, cs.relation.to_ascii_lowercase());
        match &key {
            None => key = Some(k),
            Some(existing) if *existing == k => {}
            Some(_) => return None,
        }
    }
    let (ctx, _) = key?;
    let alias = match &fields[0].symbol {
        Some(Symbol::Column(cs)) => cs.relation.clone(),
        _ => unreachable!("checked above"),
    };

    match arena.get(ctx).relation(&alias)? {
        CtxRelation::Table { name } => Some(OnionableInfo {
            scope_alias: alias,
            table: name.clone(),
            canonical: transform::canonicalize(&resolved),
            ctx,
            via_subquery: false,
        }),
        CtxRelation::Subquery { ctx: sub } => {
            // Only a bare field sees through a derived table.
            let Expr::Field(fi) = &resolved else {
                return None;
            };
            let inner_expr = subquery_projection_expr(arena, schema, *sub, &fi.name)?;
            let inner = find_onionable_expr(arena, schema, &inner_expr)?;
            Some(OnionableInfo {
                scope_alias: alias,
                table: inner.table,
                canonical: inner.canonical,
                ctx,
                via_subquery: true,
            })
        }
    }
}

/// The defining expression of a derived table's output column, following
/// wildcards into the derived table's own relations.
fn subquery_projection_expr(
    arena: &ScopeArena,
    schema: &Schema,
    sub_ctx: ContextId,
    name: &str,
) -> Option<Expr> {
    let ctx = arena.get(sub_ctx);
    for p in &ctx.projections {
        match p {
            ProjectionDesc::Named { name: pname, expr, .. }
                if pname.eq_ignore_ascii_case(name) =>
            {
                return Some(expr.clone());
            }
            ProjectionDesc::Wildcard => {
                for (alias, rel) in &ctx.relations {
                    match rel {
                        CtxRelation::Table { name: table } => {
                            if let Some(col) =
                                schema.table(table).and_then(|t| t.find_column(name))
                            {
                                return Some(Expr::Field(FieldIdent {
                                    qualifier: Some(alias.clone()),
                                    name: col.name.clone(),
                                    symbol: Some(Symbol::Column(ColumnSymbol {
                                        relation: alias.clone(),
                                        column: col.name.clone(),
                                        ctx: sub_ctx,
                                        ty: col.ty,
                                    })),
                                }));
                            }
                        }
                        CtxRelation::Subquery { ctx: inner } => {
                            if let Some(e) =
                                subquery_projection_expr(arena, schema, *inner, name)
                            {
                                return Some(e);
                            }
                        }
                    }
                }
            }
            ProjectionDesc::Named { .. } => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Supported-expression lookup
// ---------------------------------------------------------------------------

impl<'a> StmtPlanner<'a> {
    /// Physical qualifier for a base-table reference: the encrypted table
    /// name when the alias is the table itself, else the alias as written.
    fn enc_qualifier(scope_alias: &str, table: &str) -> String {
        if scope_alias.eq_ignore_ascii_case(table) {
            enc_table_name(table)
        } else {
            scope_alias.to_owned()
        }
    }

    /// Server form of `e` under some bit of `mask`, if one exists.
    ///
    /// Literals always succeed (plain or `encrypt(..)`); derived-table
    /// columns consult the child plan's tuple descriptor; everything else
    /// goes through the onion catalog keyed by canonical form.
    pub(crate) fn get_supported_expr(
        &self,
        e: &Expr,
        mask: Onion,
    ) -> Option<(Expr, OnionType)> {
        if let Expr::Lit(lit) = e {
            let pick = mask.pick_one()?;
            return Some(if pick == Onion::PLAIN {
                (e.clone(), OnionType::plain())
            } else {
                (
                    Expr::EncLit {
                        lit: lit.clone(),
                        onion: pick,
                    },
                    OnionType::Bit(pick),
                )
            });
        }

        // A column of one of this statement's derived tables: its onion is
        // whatever the child plan produced at that output position.
        if let Expr::Field(fi) = e {
            if let Some(Symbol::Column(cs)) = &fi.symbol {
                if cs.ctx == self.ctx {
                    if let Some(CtxRelation::Subquery { ctx: sub }) =
                        self.arena.get(cs.ctx).relation(&cs.relation)
                    {
                        let desc = self.subrels.get(&cs.relation.to_ascii_lowercase())?;
                        let pos = self.projection_pos(*sub, &cs.column)?;
                        let pd = desc.get(pos)?;
                        let bit = pd.onion.bit()?;
                        if !mask.contains(bit) {
                            return None;
                        }
                        return Some((
                            Expr::Field(FieldIdent {
                                qualifier: Some(cs.relation.clone()),
                                name: cs.column.clone(),
                                symbol: None,
                            }),
                            pd.onion.clone(),
                        ));
                    }
                }
            }
        }

        let info = find_onionable_expr(self.arena, self.gen.schema, e)?;
        if info.via_subquery || info.ctx != self.ctx {
            return None;
        }
        let (base, stored) = self.gen.onions.lookup(&info.table, &info.canonical)?;
        let pick = (stored & mask).pick_one()?;
        Some((
            Expr::Field(FieldIdent {
                qualifier: Some(Self::enc_qualifier(&info.scope_alias, &info.table)),
                name: enc_column_name(base, pick),
                symbol: None,
            }),
            OnionType::Bit(pick),
        ))
    }

    /// [`Self::get_supported_expr`] under group-by constraints: in aggregate
    /// context a bare field is projectable only as a group key, and only
    /// under the onion the key was grouped by.
    pub(crate) fn get_supported_expr_constraint_aware(
        &self,
        e: &Expr,
        mask: Onion,
        agg_context: bool,
    ) -> Option<(Expr, OnionType)> {
        if agg_context {
            if let Expr::Field(_) = e {
                let key = transform::canonicalize(&resolve_aliases(self.arena, e));
                return match self.group_key_onions.get(&key) {
                    Some(&forced) if mask.contains(forced) => {
                        self.get_supported_expr(e, forced)
                    }
                    _ => None,
                };
            }
        }
        self.get_supported_expr(e, mask)
    }

    /// Packed-HOM path: the server expression yielding the shared row id,
    /// plus every group position holding `e`.
    pub(crate) fn get_supported_hom_row_desc_expr(
        &self,
        e: &Expr,
    ) -> Option<(Expr, Vec<HomDesc>)> {
        let info = find_onionable_expr(self.arena, self.gen.schema, e)?;
        if info.via_subquery || info.ctx != self.ctx {
            return None;
        }
        let descs = self
            .gen
            .onions
            .lookup_packed_hom(&info.table, &info.canonical);
        if descs.is_empty() {
            return None;
        }
        Some((
            Expr::Field(FieldIdent {
                qualifier: Some(Self::enc_qualifier(&info.scope_alias, &info.table)),
                name: ROWID_COLUMN.to_owned(),
                symbol: None,
            }),
            descs,
        ))
    }

    /// Output position of a derived table's named projection.
    pub(crate) fn projection_pos(&self, sub_ctx: ContextId, name: &str) -> Option<usize> {
        for p in &self.arena.get(sub_ctx).projections {
            if let ProjectionDesc::Named { name: pname, pos, .. } = p {
                if pname.eq_ignore_ascii_case(name) {
                    return Some(*pos);
                }
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use onionql_ast::{
        BinOp, Binder, Projection, RelationDecl, RelationSource, SelectStmt,
    };
    use onionql_types::{ColumnDef, DataType, TableDef};

    fn schema() -> Schema {
        let mut s = Schema::new();
        s.add_table(TableDef {
            name: "lineitem".to_owned(),
            columns: vec![
                ColumnDef {
                    name: "l_extendedprice".to_owned(),
                    ty: DataType::Decimal,
                },
                ColumnDef {
                    name: "l_discount".to_owned(),
                    ty: DataType::Decimal,
                },
            ],
        });
        s.add_table(TableDef {
            name: "orders".to_owned(),
            columns: vec![ColumnDef {
                name: "o_orderkey".to_owned(),
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
    fn test_single_table_product_is_onionable() {
        let expr = Expr::binop(
            BinOp::Mult,
            Expr::qualified_field("l", "l_extendedprice"),
            Expr::binop(
                BinOp::Minus,
                Expr::int(1),
                Expr::qualified_field("l", "l_discount"),
            ),
        );
        let stmt = SelectStmt::simple(vec![proj(expr)], vec![table("l", "lineitem")]);
        let bound = Binder::new(&schema()).bind(stmt).expect("binds");
        let Projection::Expr { expr, .. } = &bound.stmt.projections[0] else {
            unreachable!()
        };

        let info = find_onionable_expr(&bound.arena, &schema(), expr).expect("onionable");
        assert_eq!(info.scope_alias, "l");
        assert_eq!(info.table, "lineitem");
        assert!(!info.via_subquery);
        // Canonical form has no qualifiers and no symbols.
        for fi in transform::gather_fields(&info.canonical) {
            assert!(fi.qualifier.is_none());
            assert!(fi.symbol.is_none());
        }
    }

    #[test]
    fn test_cross_table_expr_is_not_onionable() {
        let expr = Expr::binop(
            BinOp::Plus,
            Expr::qualified_field("l", "l_extendedprice"),
            Expr::qualified_field("o", "o_orderkey"),
        );
        let stmt = SelectStmt::simple(
            vec![proj(expr)],
            vec![table("l", "lineitem"), table("o", "orders")],
        );
        let bound = Binder::new(&schema()).bind(stmt).expect("binds");
        let Projection::Expr { expr, .. } = &bound.stmt.projections[0] else {
            unreachable!()
        };
        assert!(find_onionable_expr(&bound.arena, &schema(), expr).is_none());
    }

    #[test]
    fn test_field_through_subquery_preserves_outer_alias() {
        // SELECT s.o_orderkey FROM (SELECT o_orderkey FROM orders) s
        let inner = SelectStmt::simple(
            vec![proj(Expr::field("o_orderkey"))],
            vec![table("orders", "orders")],
        );
        let stmt = SelectStmt::simple(
            vec![proj(Expr::qualified_field("s", "o_orderkey"))],
            vec![RelationDecl {
                alias: "s".to_owned(),
                source: RelationSource::Subquery(Box::new(inner)),
            }],
        );
        let bound = Binder::new(&schema()).bind(stmt).expect("binds");
        let Projection::Expr { expr, .. } = &bound.stmt.projections[0] else {
            unreachable!()
        };

        let info = find_onionable_expr(&bound.arena, &schema(), expr).expect("onionable");
        assert_eq!(info.scope_alias, "s");
        assert_eq!(info.table, "orders");
        assert!(info.via_subquery);
        assert_eq!(info.canonical, Expr::field("o_orderkey"));
    }

    #[test]
    fn test_literal_only_expr_is_not_onionable() {
        let stmt = SelectStmt::simple(vec![proj(Expr::int(1))], vec![table("l", "lineitem")]);
        let bound = Binder::new(&schema()).bind(stmt).expect("binds");
        let Projection::Expr { expr, .. } = &bound.stmt.projections[0] else {
            unreachable!()
        };
        assert!(find_onionable_expr(&bound.arena, &schema(), expr).is_none());
    }

    #[test]
    fn test_equal_after_alias_resolution_share_canonical_form() {
        let mut stmt = SelectStmt::simple(
            vec![Projection::Expr {
                expr: Expr::field("l_extendedprice"),
                alias: Some("price".to_owned()),
            }],
            vec![table("lineitem", "lineitem")],
        );
        stmt.order_by = vec![onionql_ast::OrderKey {
            expr: Expr::field("price"),
            dir: onionql_ast::OrderDirection::Asc,
        }];
        let bound = Binder::new(&schema()).bind(stmt).expect("binds");

        let via_alias =
            find_onionable_expr(&bound.arena, &schema(), &bound.stmt.order_by[0].expr)
                .expect("onionable");
        let Projection::Expr { expr, .. } = &bound.stmt.projections[0] else {
            unreachable!()
        };
        let direct = find_onionable_expr(&bound.arena, &schema(), expr).expect("onionable");
        assert_eq!(via_alias.canonical, direct.canonical);
        assert_eq!(via_alias.table, direct.table);
    }
}
