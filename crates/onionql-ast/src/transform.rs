//! Expression traversal kit.
//!
//! Two entry points: [`top_down_transform`] rebuilds a tree with optional
//! per-node replacement, [`visit_expr`] walks it read-only. Neither descends
//! into `Subselect`/`Exists` bodies: those are separate scopes, and every
//! caller that cares handles them explicitly at the node itself.

use crate::{CaseBranch, Expr, FieldIdent};

/// Whether a traversal continues into the (possibly replaced) node's
/// children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurse {
    Continue,
    Stop,
}

/// Rebuild `e` top-down. `f` is applied to every node before its children;
/// it may return a replacement, and controls whether the traversal descends
/// into the result's children.
pub fn top_down_transform<F>(e: &Expr, f: &mut F) -> Expr
where
    F: FnMut(&Expr) -> (Option<Expr>, Recurse),
{
    let (replacement, recurse) = f(e);
    let cur = replacement.unwrap_or_else(|| e.clone());
    if recurse == Recurse::Stop {
        return cur;
    }
    map_children(&cur, &mut |c| top_down_transform(c, f))
}

/// Pre-order read-only walk. Returning [`Recurse::Stop`] skips the node's
/// children.
pub fn visit_expr<F>(e: &Expr, f: &mut F)
where
    F: FnMut(&Expr) -> Recurse,
{
    if f(e) == Recurse::Stop {
        return;
    }
    for_each_child(e, &mut |c| visit_expr(c, f));
}

/// Immediate children of `e` (subselect bodies excluded).
#[must_use]
pub fn children(e: &Expr) -> Vec<&Expr> {
    let mut out = Vec::new();
    for_each_child_ref(e, &mut |c| out.push(c));
    out
}

/// All `FieldIdent`s in `e`, pre-order, not crossing subselect boundaries.
#[must_use]
pub fn gather_fields(e: &Expr) -> Vec<&FieldIdent> {
    let mut out = Vec::new();
    collect_fields(e, &mut out);
    out
}

fn collect_fields<'a>(e: &'a Expr, out: &mut Vec<&'a FieldIdent>) {
    if let Expr::Field(fi) = e {
        out.push(fi);
    }
    for_each_child_ref(e, &mut |c| collect_fields(c, out));
}

// ---------------------------------------------------------------------------
// Child plumbing
// ---------------------------------------------------------------------------

fn map_children(e: &Expr, f: &mut impl FnMut(&Expr) -> Expr) -> Expr {
    match e {
        Expr::And(l, r) => Expr::And(Box::new(f(l)), Box::new(f(r))),
        Expr::Or(l, r) => Expr::Or(Box::new(f(l)), Box::new(f(r))),
        Expr::Not(x) => Expr::Not(Box::new(f(x))),
        Expr::Cmp { op, lhs, rhs } => Expr::Cmp {
            op: *op,
            lhs: Box::new(f(lhs)),
            rhs: Box::new(f(rhs)),
        },
        Expr::In {
            needle,
            set,
            negated,
        } => Expr::In {
            needle: Box::new(f(needle)),
            set: set.iter().map(&mut *f).collect(),
            negated: *negated,
        },
        Expr::Like {
            expr,
            pattern,
            negated,
        } => Expr::Like {
            expr: Box::new(f(expr)),
            pattern: Box::new(f(pattern)),
            negated: *negated,
        },
        Expr::Binop { op, lhs, rhs } => Expr::Binop {
            op: *op,
            lhs: Box::new(f(lhs)),
            rhs: Box::new(f(rhs)),
        },
        Expr::Case {
            branches,
            else_branch,
        } => Expr::Case {
            branches: branches
                .iter()
                .map(|b| CaseBranch {
                    cond: f(&b.cond),
                    then: f(&b.then),
                })
                .collect(),
            else_branch: else_branch.as_ref().map(|x| Box::new(f(x))),
        },
        Expr::Agg { op, arg } => Expr::Agg {
            op: *op,
            arg: Box::new(f(arg)),
        },
        Expr::GroupConcat { arg, sep } => Expr::GroupConcat {
            arg: Box::new(f(arg)),
            sep: sep.clone(),
        },
        Expr::Call { name, args } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(&mut *f).collect(),
        },
        // Leaves and scope boundaries.
        Expr::CountStar
        | Expr::Field(_)
        | Expr::Lit(_)
        | Expr::Subselect(_)
        | Expr::Exists(_)
        | Expr::DependentPlaceholder(_)
        | Expr::EncLit { .. }
        | Expr::BoundPlaceholder { .. }
        | Expr::TuplePos(_)
        | Expr::SubqueryPos(_)
        | Expr::ExistsSubqueryPos(_) => e.clone(),
    }
}

fn for_each_child<'a>(e: &'a Expr, f: &mut impl FnMut(&'a Expr)) {
    for_each_child_ref(e, f);
}

fn for_each_child_ref<'a>(e: &'a Expr, f: &mut impl FnMut(&'a Expr)) {
    match e {
        Expr::And(l, r) | Expr::Or(l, r) => {
            f(l);
            f(r);
        }
        Expr::Not(x) => f(x),
        Expr::Cmp { lhs, rhs, .. } | Expr::Binop { lhs, rhs, .. } => {
            f(lhs);
            f(rhs);
        }
        Expr::In { needle, set, .. } => {
            f(needle);
            for x in set {
                f(x);
            }
        }
        Expr::Like { expr, pattern, .. } => {
            f(expr);
            f(pattern);
        }
        Expr::Case {
            branches,
            else_branch,
        } => {
            for b in branches {
                f(&b.cond);
                f(&b.then);
            }
            if let Some(x) = else_branch {
                f(x);
            }
        }
        Expr::Agg { arg, .. } | Expr::GroupConcat { arg, .. } => f(arg),
        Expr::Call { args, .. } => {
            for x in args {
                f(x);
            }
        }
        Expr::CountStar
        | Expr::Field(_)
        | Expr::Lit(_)
        | Expr::Subselect(_)
        | Expr::Exists(_)
        | Expr::DependentPlaceholder(_)
        | Expr::EncLit { .. }
        | Expr::BoundPlaceholder { .. }
        | Expr::TuplePos(_)
        | Expr::SubqueryPos(_)
        | Expr::ExistsSubqueryPos(_) => {}
    }
}

/// Apply `f` to every clause expression of a statement, recursing into
/// derived-table subqueries. `f` is responsible for descending into the
/// expressions it receives (and into any subselects nested inside them).
#[must_use]
pub fn map_stmt_exprs(
    stmt: &crate::SelectStmt,
    f: &mut impl FnMut(&Expr) -> Expr,
) -> crate::SelectStmt {
    use crate::{GroupBy, Projection, RelationSource};

    let mut out = stmt.clone();
    for p in &mut out.projections {
        if let Projection::Expr { expr, .. } = p {
            *expr = f(expr);
        }
    }
    for rel in &mut out.relations {
        if let RelationSource::Subquery(s) = &mut rel.source {
            **s = map_stmt_exprs(s, f);
        }
    }
    if let Some(w) = &mut out.filter {
        *w = f(w);
    }
    if let Some(GroupBy { keys, having }) = &mut out.group_by {
        for k in keys.iter_mut() {
            *k = f(k);
        }
        if let Some(h) = having {
            *h = f(h);
        }
    }
    for k in &mut out.order_by {
        k.expr = f(&k.expr);
    }
    out
}

/// Canonical copy: every `FieldIdent` loses its qualifier and symbol.
/// Canonical expressions are the keys of onion-set lookups, so any two
/// syntactically identical expressions must compare equal.
#[must_use]
pub fn canonicalize(e: &Expr) -> Expr {
    top_down_transform(e, &mut |node| match node {
        Expr::Field(fi) => (Some(Expr::Field(fi.canonical())), Recurse::Stop),
        _ => (None, Recurse::Continue),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinOp, CmpOp};

    #[test]
    fn test_transform_replaces_fields() {
        let e = Expr::cmp(
            CmpOp::Gt,
            Expr::binop(BinOp::Mult, Expr::field("a"), Expr::field("b")),
            Expr::int(3),
        );
        let out = top_down_transform(&e, &mut |n| match n {
            Expr::Field(_) => (Some(Expr::TuplePos(7)), Recurse::Stop),
            _ => (None, Recurse::Continue),
        });
        assert_eq!(
            out,
            Expr::cmp(
                CmpOp::Gt,
                Expr::binop(BinOp::Mult, Expr::TuplePos(7), Expr::TuplePos(7)),
                Expr::int(3),
            )
        );
    }

    #[test]
    fn test_gather_fields_preorder() {
        let e = Expr::and(
            Expr::cmp(CmpOp::Eq, Expr::qualified_field("t", "a"), Expr::int(1)),
            Expr::cmp(CmpOp::Lt, Expr::field("b"), Expr::field("c")),
        );
        let names: Vec<&str> = gather_fields(&e).iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_canonicalize_idempotent() {
        let e = Expr::binop(
            BinOp::Mult,
            Expr::qualified_field("l", "l_extendedprice"),
            Expr::binop(
                BinOp::Minus,
                Expr::int(1),
                Expr::qualified_field("l", "l_discount"),
            ),
        );
        let once = canonicalize(&e);
        assert_eq!(canonicalize(&once), once);
        assert!(gather_fields(&once).iter().all(|f| f.qualifier.is_none()));
    }
}
