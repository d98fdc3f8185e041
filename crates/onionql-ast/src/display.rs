//! SQL text rendering via `fmt::Display` for AST nodes.
//!
//! The rewriter's output plans carry server-side statements as AST; their
//! `Display` form is the SQL actually shipped to the encrypted store.
//! Client-only variants (tuple positions, subquery positions) render in a
//! debug-friendly positional notation since they never reach a server.

use crate::{
    CaseBranch, Expr, Literal, OrderDirection, Projection, RelationSource, SelectStmt,
};
use std::fmt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn comma_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Write an operand, parenthesizing compound expressions so precedence
/// survives the round trip through text.
fn write_operand(f: &mut fmt::Formatter<'_>, e: &Expr) -> fmt::Result {
    if matches!(
        e,
        Expr::And(..) | Expr::Or(..) | Expr::Cmp { .. } | Expr::Binop { .. }
    ) {
        write!(f, "({e})")
    } else {
        write!(f, "{e}")
    }
}

fn escape_str(s: &str) -> String {
    s.replace('\'', "''")
}

// ---------------------------------------------------------------------------
// Literal
// ---------------------------------------------------------------------------

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Decimal(d) => f.write_str(d),
            Self::Str(s) => write!(f, "'{}'", escape_str(s)),
            Self::Date(d) => write!(f, "date '{}'", escape_str(d)),
            Self::Bool(true) => f.write_str("TRUE"),
            Self::Bool(false) => f.write_str("FALSE"),
            Self::Null => f.write_str("NULL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Expr
// ---------------------------------------------------------------------------

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(l, r) => {
                write_operand(f, l)?;
                f.write_str(" AND ")?;
                write_operand(f, r)
            }
            Self::Or(l, r) => {
                write_operand(f, l)?;
                f.write_str(" OR ")?;
                write_operand(f, r)
            }
            Self::Not(x) => {
                f.write_str("NOT ")?;
                write_operand(f, x)
            }
            Self::Cmp { op, lhs, rhs } => {
                write_operand(f, lhs)?;
                write!(f, " {} ", op.sql())?;
                write_operand(f, rhs)
            }
            Self::In {
                needle,
                set,
                negated,
            } => {
                write_operand(f, needle)?;
                f.write_str(if *negated { " NOT IN " } else { " IN " })?;
                // A lone subselect already carries its parentheses.
                if let [Self::Subselect(s)] = set.as_slice() {
                    write!(f, "({s})")
                } else {
                    f.write_str("(")?;
                    comma_list(f, set)?;
                    f.write_str(")")
                }
            }
            Self::Like {
                expr,
                pattern,
                negated,
            } => {
                write_operand(f, expr)?;
                f.write_str(if *negated { " NOT LIKE " } else { " LIKE " })?;
                write_operand(f, pattern)
            }
            Self::Binop { op, lhs, rhs } => {
                write_operand(f, lhs)?;
                write!(f, " {} ", op.sql())?;
                write_operand(f, rhs)
            }
            Self::Case {
                branches,
                else_branch,
            } => {
                f.write_str("CASE")?;
                for CaseBranch { cond, then } in branches {
                    write!(f, " WHEN {cond} THEN {then}")?;
                }
                if let Some(e) = else_branch {
                    write!(f, " ELSE {e}")?;
                }
                f.write_str(" END")
            }
            Self::CountStar => f.write_str("COUNT(*)"),
            Self::Agg { op, arg } => write!(f, "{}({arg})", op.sql()),
            Self::GroupConcat { arg, sep } => {
                write!(f, "GROUP_CONCAT({arg}, '{}')", escape_str(sep))
            }
            Self::Call { name, args } => {
                write!(f, "{name}(")?;
                comma_list(f, args)?;
                f.write_str(")")
            }
            Self::Field(fi) => {
                if let Some(q) = &fi.qualifier {
                    write!(f, "{q}.")?;
                }
                f.write_str(&fi.name)
            }
            Self::Lit(l) => write!(f, "{l}"),
            Self::Subselect(s) => write!(f, "({s})"),
            Self::Exists(s) => write!(f, "EXISTS ({s})"),
            Self::DependentPlaceholder(i) => write!(f, ":p{i}"),
            Self::EncLit { lit, onion } => write!(f, "encrypt({lit}, '{onion}')"),
            Self::BoundPlaceholder { slot, .. } => write!(f, ":p{slot}"),
            Self::TuplePos(i) => write!(f, "${i}"),
            Self::SubqueryPos(i) => write!(f, "subquery${i}"),
            Self::ExistsSubqueryPos(i) => write!(f, "exists${i}"),
        }
    }
}

// ---------------------------------------------------------------------------
// SelectStmt
// ---------------------------------------------------------------------------

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Star => f.write_str("*"),
            Self::Expr { expr, alias: None } => write!(f, "{expr}"),
            Self::Expr {
                expr,
                alias: Some(a),
            } => write!(f, "{expr} AS {a}"),
        }
    }
}

impl fmt::Display for SelectStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        comma_list(f, &self.projections)?;
        if !self.relations.is_empty() {
            f.write_str(" FROM ")?;
            for (i, rel) in self.relations.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                match &rel.source {
                    RelationSource::Table { name } => {
                        f.write_str(name)?;
                        if !rel.alias.eq_ignore_ascii_case(name) {
                            write!(f, " AS {}", rel.alias)?;
                        }
                    }
                    RelationSource::Subquery(s) => write!(f, "({s}) AS {}", rel.alias)?,
                }
            }
        }
        if let Some(w) = &self.filter {
            write!(f, " WHERE {w}")?;
        }
        if let Some(g) = &self.group_by {
            f.write_str(" GROUP BY ")?;
            comma_list(f, &g.keys)?;
            if let Some(h) = &g.having {
                write!(f, " HAVING {h}")?;
            }
        }
        if !self.order_by.is_empty() {
            f.write_str(" ORDER BY ")?;
            for (i, k) in self.order_by.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", k.expr)?;
                if k.dir == OrderDirection::Desc {
                    f.write_str(" DESC")?;
                }
            }
        }
        if let Some(n) = self.limit {
            write!(f, " LIMIT {n}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinOp, CmpOp, GroupBy, OrderKey, RelationDecl};
    use onionql_types::Onion;

    fn table(alias: &str, name: &str) -> RelationDecl {
        RelationDecl {
            alias: alias.to_owned(),
            source: RelationSource::Table {
                name: name.to_owned(),
            },
        }
    }

    #[test]
    fn test_literal_rendering() {
        assert_eq!(Literal::Int(42).to_string(), "42");
        assert_eq!(Literal::Str("a'b".to_owned()).to_string(), "'a''b'");
        assert_eq!(
            Literal::Date("1998-09-01".to_owned()).to_string(),
            "date '1998-09-01'"
        );
        assert_eq!(Literal::Null.to_string(), "NULL");
    }

    #[test]
    fn test_expr_precedence_parens() {
        let e = Expr::binop(
            BinOp::Mult,
            Expr::field("l_extendedprice"),
            Expr::binop(BinOp::Minus, Expr::int(1), Expr::field("l_discount")),
        );
        assert_eq!(e.to_string(), "l_extendedprice * (1 - l_discount)");
    }

    #[test]
    fn test_enc_literal_rendering() {
        let e = Expr::EncLit {
            lit: Literal::Date("1998-09-01".to_owned()),
            onion: Onion::OPE,
        };
        assert_eq!(e.to_string(), "encrypt(date '1998-09-01', 'OPE')");
    }

    #[test]
    fn test_select_rendering() {
        let mut stmt = crate::SelectStmt::simple(
            vec![Projection::Expr {
                expr: Expr::qualified_field("lineitem$enc", "l_shipdate$OPE"),
                alias: None,
            }],
            vec![table("lineitem$enc", "lineitem$enc")],
        );
        stmt.filter = Some(Expr::cmp(
            CmpOp::Lt,
            Expr::qualified_field("lineitem$enc", "l_shipdate$OPE"),
            Expr::EncLit {
                lit: Literal::Date("1998-09-01".to_owned()),
                onion: Onion::OPE,
            },
        ));
        stmt.group_by = Some(GroupBy {
            keys: vec![Expr::field("k$DET")],
            having: None,
        });
        stmt.order_by = vec![OrderKey {
            expr: Expr::field("k$DET"),
            dir: OrderDirection::Desc,
        }];
        stmt.limit = Some(10);
        assert_eq!(
            stmt.to_string(),
            "SELECT lineitem$enc.l_shipdate$OPE FROM lineitem$enc \
             WHERE lineitem$enc.l_shipdate$OPE < encrypt(date '1998-09-01', 'OPE') \
             GROUP BY k$DET ORDER BY k$DET DESC LIMIT 10"
        );
    }
}
