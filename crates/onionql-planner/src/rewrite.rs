//! Per-expression server rewrite and the residual client-computation
//! builder.
//!
//! [`StmtPlanner::rewrite_expr_for_server`] splits top-level conjunctions
//! and rewrites each independently. A conjunct either becomes server SQL
//! under the requested onions ([`ServerRewrite::Full`]) or falls to the
//! *residual path*: the server projects the encrypted values the client
//! needs, and the conjunct is re-expressed over tuple positions as a
//! [`ClientComputation`] ([`ServerRewrite::Partial`]).
//!
//! The per-conjunct transform is an explicit-result match over supported
//! node shapes; a failed child rewrite bails the whole conjunct rather than
//! producing partial server SQL. Onion tie-breaking walks candidates
//! bit-ascending (PLAIN, DET, OPE, ...), which keeps plans deterministic.

use std::collections::HashMap;

use onionql_ast::{
    bind::resolve_aliases, transform, transform::Recurse, AggOp, CaseBranch, Expr, GroupBy,
    Literal, OrderKey, Projection, ProjectionSymbol, RelationSource, SelectStmt, Symbol,
};
use onionql_error::{PlanError, PlanResult};
use onionql_types::{HomDesc, Onion, OnionSeq, OnionType};

use crate::plan::PlanNode;
use crate::{EncContext, StmtPlanner};

// ---------------------------------------------------------------------------
// Rewrite context
// ---------------------------------------------------------------------------

/// Onion requirements threaded through one rewrite: the ranked onion
/// sequence acceptable for the result, and whether the expression sits in
/// aggregate context.
#[derive(Debug, Clone)]
pub(crate) struct RewriteCtx {
    pub onions: OnionSeq,
    pub agg: bool,
}

impl RewriteCtx {
    pub(crate) fn new(onions: OnionSeq, agg: bool) -> Self {
        Self { onions, agg }
    }

    pub(crate) fn single(onion: Onion, agg: bool) -> Self {
        Self {
            onions: OnionSeq::from_slice(&[onion]),
            agg,
        }
    }

    pub(crate) fn plain(agg: bool) -> Self {
        Self::single(Onion::PLAIN, agg)
    }

    fn in_clear(&self) -> bool {
        self.onions.contains(&Onion::PLAIN)
    }

    fn contains(&self, onion: Onion) -> bool {
        self.onions.contains(&onion)
    }
}

// ---------------------------------------------------------------------------
// Client computations
// ---------------------------------------------------------------------------

/// One server-side projection feeding a client computation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientProjection {
    /// Original subexpression this projection stands for.
    pub orig: Expr,
    /// Server-side expression shipped in the SELECT list.
    pub server: Expr,
    /// Onion the projected value arrives under.
    pub onion: OnionType,
    /// Whether the projection is a `GROUP_CONCAT` vector of one group's
    /// values.
    pub vector: bool,
}

/// Association of a dependent placeholder with the outer value feeding it.
#[derive(Debug, Clone, PartialEq)]
pub struct DependentBinding {
    /// Placeholder slot inside the rewritten subquery.
    pub slot: usize,
    /// The outer field the slot is bound from.
    pub field: Expr,
    /// Index into the owning computation's `subquery_projections`.
    pub projection: usize,
}

/// A residual subquery: the original node, its plan, and the outer-tuple
/// bindings its placeholders consume.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualSubquery {
    pub orig: Expr,
    pub plan: PlanNode,
    pub bindings: Vec<DependentBinding>,
}

/// Residual work the client performs on decrypted projected values.
///
/// `expr` references only tuple positions, dependent placeholders, and
/// positional subquery results.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientComputation {
    pub expr: Expr,
    pub orig: Expr,
    pub projections: Vec<ClientProjection>,
    pub subquery_projections: Vec<ClientProjection>,
    pub subqueries: Vec<ResidualSubquery>,
}

/// Outcome of rewriting one expression for the server.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ServerRewrite {
    /// Fully answerable server-side.
    Full(Expr, OnionType),
    /// Residual: optional reduced server expression (PLAIN) plus the client
    /// computation finishing the rest.
    Partial(Option<Expr>, ClientComputation),
}

/// Flatten a conjunction chain.
fn split_conjunctions(e: &Expr) -> Vec<&Expr> {
    match e {
        Expr::And(l, r) => {
            let mut out = split_conjunctions(l);
            out.extend(split_conjunctions(r));
            out
        }
        _ => vec![e],
    }
}

/// Merge per-conjunct client computations into one, offsetting positional
/// references. Associative.
pub(crate) fn merge_conjunctions(mut ccs: Vec<ClientComputation>) -> ClientComputation {
    let mut it = ccs.drain(..);
    let mut acc = it.next().expect("merge of at least one conjunct");
    for cc in it {
        let p_off = acc.projections.len();
        let sp_off = acc.subquery_projections.len();
        let sq_off = acc.subqueries.len();
        let shifted = shift_positions(&cc.expr, p_off, sq_off);
        acc.projections.extend(cc.projections);
        acc.subquery_projections.extend(cc.subquery_projections);
        acc.subqueries.extend(cc.subqueries.into_iter().map(|mut s| {
            for b in &mut s.bindings {
                b.projection += sp_off;
            }
            s
        }));
        acc.expr = Expr::and(acc.expr, shifted);
        acc.orig = Expr::and(acc.orig, cc.orig);
    }
    acc
}

fn shift_positions(e: &Expr, p_off: usize, sq_off: usize) -> Expr {
    transform::top_down_transform(e, &mut |n| match n {
        Expr::TuplePos(i) => (Some(Expr::TuplePos(i + p_off)), Recurse::Stop),
        Expr::SubqueryPos(i) => (Some(Expr::SubqueryPos(i + sq_off)), Recurse::Stop),
        Expr::ExistsSubqueryPos(i) => (Some(Expr::ExistsSubqueryPos(i + sq_off)), Recurse::Stop),
        _ => (None, Recurse::Continue),
    })
}

/// Content-addressed insert: identical server projections share a slot.
fn push_projection(projs: &mut Vec<ClientProjection>, p: ClientProjection) -> usize {
    if let Some(i) = projs
        .iter()
        .position(|q| q.server == p.server && q.vector == p.vector)
    {
        return i;
    }
    projs.push(p);
    projs.len() - 1
}

// ---------------------------------------------------------------------------
// Server rewrite
// ---------------------------------------------------------------------------

impl<'a> StmtPlanner<'a> {
    /// Rewrite `e` for the server, splitting conjunctions so that the
    /// server keeps every conjunct it can answer and the client finishes
    /// the rest.
    pub(crate) fn rewrite_expr_for_server(
        &self,
        e: &Expr,
        rctx: &RewriteCtx,
    ) -> PlanResult<ServerRewrite> {
        let conjuncts = split_conjunctions(e);
        let mut server: Vec<(Expr, OnionType)> = Vec::new();
        let mut clients: Vec<ClientComputation> = Vec::new();

        for c in &conjuncts {
            match self.do_transform_server(c, rctx)? {
                Some(hit) => server.push(hit),
                None => {
                    tracing::debug!(target: "onionql.plan", expr = %c, "plan.residual");
                    clients.push(self.mk_client_computation(c, rctx)?);
                }
            }
        }

        if clients.is_empty() {
            if server.len() == 1 {
                let (se, ot) = server.pop().expect("one conjunct");
                return Ok(ServerRewrite::Full(se, ot));
            }
            let folded = server
                .into_iter()
                .map(|(se, _)| se)
                .reduce(Expr::and)
                .expect("non-empty conjunction");
            return Ok(ServerRewrite::Full(folded, OnionType::plain()));
        }

        let residual = server.into_iter().map(|(se, _)| se).reduce(Expr::and);
        Ok(ServerRewrite::Partial(residual, merge_conjunctions(clients)))
    }

    /// Per-conjunct top-down transform over supported node shapes.
    /// `Ok(None)` is a bail-out: the shape (or one of its children) has no
    /// server form under the requested onions.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn do_transform_server(
        &self,
        e: &Expr,
        rctx: &RewriteCtx,
    ) -> PlanResult<Option<(Expr, OnionType)>> {
        match e {
            Expr::And(l, r) | Expr::Or(l, r) if rctx.in_clear() => {
                let sub = RewriteCtx::plain(rctx.agg);
                let (Some((le, _)), Some((re, _))) = (
                    self.do_transform_server(l, &sub)?,
                    self.do_transform_server(r, &sub)?,
                ) else {
                    return Ok(None);
                };
                let rebuilt = match e {
                    Expr::And(..) => Expr::And(Box::new(le), Box::new(re)),
                    _ => Expr::Or(Box::new(le), Box::new(re)),
                };
                Ok(Some((rebuilt, OnionType::plain())))
            }

            Expr::Not(x) if rctx.in_clear() => {
                match self.do_transform_server(x, &RewriteCtx::plain(rctx.agg))? {
                    Some((xe, _)) => Ok(Some((Expr::Not(Box::new(xe)), OnionType::plain()))),
                    None => Ok(None),
                }
            }

            Expr::Cmp { op, lhs, rhs } if rctx.in_clear() => {
                let order: &[Onion] = if op.is_equality() {
                    &[Onion::PLAIN, Onion::DET, Onion::OPE]
                } else {
                    &[Onion::PLAIN, Onion::OPE]
                };
                for onion in order {
                    let l = self.rewrite_cmp_side(lhs, *onion, rctx.agg)?;
                    let r = self.rewrite_cmp_side(rhs, *onion, rctx.agg)?;
                    if let (Some(le), Some(re)) = (l, r) {
                        return Ok(Some((
                            Expr::cmp(*op, le, re),
                            OnionType::plain(),
                        )));
                    }
                }
                Ok(None)
            }

            Expr::Like {
                expr,
                pattern,
                negated,
            } if rctx.in_clear() => {
                let l = self.rewrite_cmp_side(expr, Onion::SWP, rctx.agg)?;
                let p = self.rewrite_cmp_side(pattern, Onion::SWP, rctx.agg)?;
                let (Some(le), Some(pe)) = (l, p) else {
                    return Ok(None);
                };
                let call = Expr::Call {
                    name: "searchSWP".to_owned(),
                    args: vec![le, pe, Expr::Lit(Literal::Null)],
                };
                let rebuilt = if *negated {
                    Expr::Not(Box::new(call))
                } else {
                    call
                };
                Ok(Some((rebuilt, OnionType::plain())))
            }

            Expr::In {
                needle,
                set,
                negated,
            } if rctx.in_clear() => {
                'onions: for onion in [Onion::DET, Onion::OPE] {
                    let Some(ne) = self.rewrite_cmp_side(needle, onion, rctx.agg)? else {
                        continue;
                    };
                    let mut items = Vec::with_capacity(set.len());
                    for s in set {
                        match self.rewrite_cmp_side(s, onion, rctx.agg)? {
                            Some(x) => items.push(x),
                            None => continue 'onions,
                        }
                    }
                    return Ok(Some((
                        Expr::In {
                            needle: Box::new(ne),
                            set: items,
                            negated: *negated,
                        },
                        OnionType::plain(),
                    )));
                }
                Ok(None)
            }

            Expr::Exists(sub) if rctx.in_clear() => {
                match self.plan_subselect(sub, &EncContext::PreserveCardinality) {
                    Ok(PlanNode::RemoteSql { stmt, subplans, .. }) if subplans.is_empty() => Ok(
                        Some((Expr::Exists(Box::new(stmt)), OnionType::plain())),
                    ),
                    _ => Ok(None),
                }
            }

            Expr::CountStar if rctx.in_clear() && rctx.agg => {
                Ok(Some((Expr::CountStar, OnionType::plain())))
            }

            Expr::Agg {
                op: AggOp::Count,
                arg,
            } if rctx.in_clear() && rctx.agg => {
                for onion in (Onion::PLAIN | Onion::COUNTABLE).to_seq() {
                    if let Some((se, _)) =
                        self.do_transform_server(arg, &RewriteCtx::single(onion, false))?
                    {
                        return Ok(Some((
                            Expr::Agg {
                                op: AggOp::Count,
                                arg: Box::new(se),
                            },
                            OnionType::plain(),
                        )));
                    }
                }
                Ok(None)
            }

            Expr::Agg { op, arg }
                if matches!(op, AggOp::Min | AggOp::Max)
                    && rctx.contains(Onion::OPE)
                    && rctx.agg =>
            {
                match self.do_transform_server(arg, &RewriteCtx::single(Onion::OPE, false))? {
                    Some((se, _)) => Ok(Some((
                        Expr::Agg {
                            op: *op,
                            arg: Box::new(se),
                        },
                        OnionType::Bit(Onion::OPE),
                    ))),
                    None => Ok(None),
                }
            }

            Expr::Agg {
                op: AggOp::Sum,
                arg,
            } if rctx.agg => {
                if rctx.in_clear() {
                    if let Some((se, _)) =
                        self.do_transform_server(arg, &RewriteCtx::single(Onion::PLAIN, false))?
                    {
                        return Ok(Some((
                            Expr::Agg {
                                op: AggOp::Sum,
                                arg: Box::new(se),
                            },
                            OnionType::plain(),
                        )));
                    }
                }
                if rctx.contains(Onion::HOM) {
                    if let Some((se, _)) =
                        self.do_transform_server(arg, &RewriteCtx::single(Onion::HOM, false))?
                    {
                        return Ok(Some((
                            Expr::Call {
                                name: "hom_agg".to_owned(),
                                args: vec![se],
                            },
                            OnionType::Bit(Onion::HOM),
                        )));
                    }
                }
                Ok(None)
            }

            Expr::Agg {
                op: AggOp::Avg,
                arg,
            } if rctx.in_clear() && rctx.agg => {
                match self.do_transform_server(arg, &RewriteCtx::single(Onion::PLAIN, false))? {
                    Some((se, _)) => Ok(Some((
                        Expr::Agg {
                            op: AggOp::Avg,
                            arg: Box::new(se),
                        },
                        OnionType::plain(),
                    ))),
                    None => Ok(None),
                }
            }

            Expr::Case {
                branches,
                else_branch,
            } => {
                // Conditions are predicates: always PLAIN. Branch values
                // must agree on a single outer onion; first in the ranked
                // sequence that works for every branch wins.
                let cond_ctx = RewriteCtx::plain(rctx.agg);
                let mut conds = Vec::with_capacity(branches.len());
                for b in branches {
                    match self.do_transform_server(&b.cond, &cond_ctx)? {
                        Some((c, _)) => conds.push(c),
                        None => return Ok(None),
                    }
                }
                'onions: for onion in &rctx.onions {
                    let bctx = RewriteCtx::single(*onion, rctx.agg);
                    let mut thens = Vec::with_capacity(branches.len());
                    for b in branches {
                        match self.do_transform_server(&b.then, &bctx)? {
                            Some((t, _)) => thens.push(t),
                            None => continue 'onions,
                        }
                    }
                    let els = match else_branch {
                        Some(x) => match self.do_transform_server(x, &bctx)? {
                            Some((t, _)) => Some(Box::new(t)),
                            None => continue 'onions,
                        },
                        None => None,
                    };
                    return Ok(Some((
                        Expr::Case {
                            branches: conds
                                .iter()
                                .cloned()
                                .zip(thens)
                                .map(|(cond, then)| CaseBranch { cond, then })
                                .collect(),
                            else_branch: els,
                        },
                        OnionType::Bit(*onion),
                    )));
                }
                Ok(None)
            }

            Expr::Lit(_) => {
                let Some(first) = rctx.onions.first() else {
                    return Ok(None);
                };
                Ok(self.get_supported_expr(e, *first))
            }

            Expr::DependentPlaceholder(slot) => {
                let Some(first) = rctx.onions.first() else {
                    return Ok(None);
                };
                Ok(Some((
                    Expr::BoundPlaceholder {
                        slot: *slot,
                        onion: *first,
                    },
                    OnionType::Bit(*first),
                )))
            }

            // A bare subselect in scalar position is only inlinable as a
            // comparison operand; anywhere else it falls to the residual
            // path.
            Expr::Subselect(_) => Ok(None),

            // Field references, arithmetic, opaque calls, and anything
            // that fell through a guard above: first onion with a stored
            // server form wins.
            other => {
                for onion in &rctx.onions {
                    if *onion == Onion::HOM_ROW_DESC {
                        if let Some((se, _)) = self.get_supported_hom_row_desc_expr(other) {
                            return Ok(Some((se, OnionType::Bit(Onion::HOM_ROW_DESC))));
                        }
                    } else if let Some(hit) =
                        self.get_supported_expr_constraint_aware(other, *onion, rctx.agg)
                    {
                        return Ok(Some(hit));
                    }
                }
                Ok(None)
            }
        }
    }

    /// One side of a comparison under a single onion. A subselect side is
    /// inlined when its plan is a pure `RemoteSql` with the required output
    /// onion; planning failures mean "this onion does not work", not a hard
    /// error.
    fn rewrite_cmp_side(
        &self,
        e: &Expr,
        onion: Onion,
        agg: bool,
    ) -> PlanResult<Option<Expr>> {
        if let Expr::Subselect(sub) = e {
            let enc = EncContext::EncProj {
                onions: vec![onion],
                require: true,
            };
            return Ok(match self.plan_subselect(sub, &enc) {
                Ok(PlanNode::RemoteSql { stmt, subplans, .. }) if subplans.is_empty() => {
                    Some(Expr::Subselect(Box::new(stmt)))
                }
                _ => None,
            });
        }
        Ok(self
            .do_transform_server(e, &RewriteCtx::single(onion, agg))?
            .map(|(se, _)| se))
    }

    fn plan_subselect(&self, stmt: &SelectStmt, enc: &EncContext) -> PlanResult<PlanNode> {
        self.gen.generate_plan_inner(stmt, self.arena, enc)
    }

    // -----------------------------------------------------------------------
    // Residual path
    // -----------------------------------------------------------------------

    /// Build the client computation for an expression the server cannot
    /// answer: plan embedded subselects, apply the packed-HOM sum
    /// optimization, and project everything else under a decryptable onion.
    pub(crate) fn mk_client_computation(
        &self,
        e: &Expr,
        rctx: &RewriteCtx,
    ) -> PlanResult<ClientComputation> {
        let resolved = resolve_aliases(self.arena, e);

        let mut projections: Vec<ClientProjection> = Vec::new();
        let mut subquery_projections: Vec<ClientProjection> = Vec::new();
        let mut subqueries: Vec<ResidualSubquery> = Vec::new();

        let mut sub_nodes: Vec<Expr> = Vec::new();
        transform::visit_expr(&resolved, &mut |n| {
            if matches!(n, Expr::Subselect(_) | Expr::Exists(_)) && !sub_nodes.contains(n) {
                sub_nodes.push(n.clone());
            }
            Recurse::Continue
        });

        for node in &sub_nodes {
            let (stmt, enc) = match node {
                Expr::Subselect(s) => (s, EncContext::PreserveOriginal),
                Expr::Exists(s) => (s, EncContext::PreserveCardinality),
                _ => unreachable!("collected above"),
            };
            let (rewritten, binding_fields) = self.rewrite_outer_references(stmt)?;
            let plan = self.plan_subselect(&rewritten, &enc)?;
            let mut bindings = Vec::with_capacity(binding_fields.len());
            for (slot, field) in binding_fields.into_iter().enumerate() {
                let Some(projection) =
                    self.project_residual_value(&field, rctx, &mut subquery_projections)
                else {
                    return Err(PlanError::ResidualUnprojectable {
                        expr: field.to_string(),
                    });
                };
                bindings.push(DependentBinding {
                    slot,
                    field,
                    projection,
                });
            }
            subqueries.push(ResidualSubquery {
                orig: node.clone(),
                plan,
                bindings,
            });
        }

        let mut opt_map: HashMap<Expr, Expr> = HashMap::new();
        self.collect_hom_optimizations(&resolved, &mut projections, &mut opt_map);

        let client =
            self.build_client_expr(&resolved, rctx, &opt_map, &sub_nodes, &mut projections);

        // Anything still referencing a column could not be projected under
        // a decryptable onion; the candidate onion set cannot answer this.
        if !transform::gather_fields(&client).is_empty() {
            return Err(PlanError::ResidualUnprojectable {
                expr: e.to_string(),
            });
        }

        Ok(ClientComputation {
            expr: client,
            orig: e.clone(),
            projections,
            subquery_projections,
            subqueries,
        })
    }

    fn build_client_expr(
        &self,
        resolved: &Expr,
        rctx: &RewriteCtx,
        opt_map: &HashMap<Expr, Expr>,
        sub_nodes: &[Expr],
        projections: &mut Vec<ClientProjection>,
    ) -> Expr {
        transform::top_down_transform(resolved, &mut |node| {
            if let Some(rep) = opt_map.get(node) {
                return (Some(rep.clone()), Recurse::Stop);
            }
            if matches!(node, Expr::Subselect(_) | Expr::Exists(_)) {
                let idx = sub_nodes
                    .iter()
                    .position(|n| n == node)
                    .expect("subselect collected");
                let rep = match node {
                    Expr::Exists(_) => Expr::ExistsSubqueryPos(idx),
                    _ => Expr::SubqueryPos(idx),
                };
                return (Some(rep), Recurse::Stop);
            }
            if let Some(slot) = self.project_residual_value(node, rctx, projections) {
                return (Some(Expr::TuplePos(slot)), Recurse::Stop);
            }
            (None, Recurse::Continue)
        })
    }

    /// Project one value the client needs, preferring the largest wholly
    /// server-expressible form: aggregates via a full server rewrite,
    /// scalars under a decryptable onion, and in aggregate context a
    /// `GROUP_CONCAT` vector of the group's values.
    fn project_residual_value(
        &self,
        node: &Expr,
        rctx: &RewriteCtx,
        projections: &mut Vec<ClientProjection>,
    ) -> Option<usize> {
        match node {
            // Connectives and comparisons decompose; literals and
            // positional references stay client-side as written.
            Expr::And(..)
            | Expr::Or(..)
            | Expr::Not(_)
            | Expr::Cmp { .. }
            | Expr::In { .. }
            | Expr::Like { .. }
            | Expr::Subselect(_)
            | Expr::Exists(_)
            | Expr::Lit(_)
            | Expr::EncLit { .. }
            | Expr::DependentPlaceholder(_)
            | Expr::BoundPlaceholder { .. }
            | Expr::TuplePos(_)
            | Expr::SubqueryPos(_)
            | Expr::ExistsSubqueryPos(_) => None,

            Expr::CountStar => Some(push_projection(
                projections,
                ClientProjection {
                    orig: Expr::CountStar,
                    server: Expr::CountStar,
                    onion: OnionType::plain(),
                    vector: false,
                },
            )),

            Expr::Agg { .. } => {
                // A wholly server-computable aggregate (MIN under OPE, SUM
                // under HOM) beats decomposing into a per-row vector.
                let all = RewriteCtx::new(Onion::ALL.to_seq(), true);
                match self.do_transform_server(node, &all) {
                    Ok(Some((se, ot))) => Some(push_projection(
                        projections,
                        ClientProjection {
                            orig: node.clone(),
                            server: se,
                            onion: ot,
                            vector: false,
                        },
                    )),
                    _ => None,
                }
            }

            _ => {
                if let Some((se, ot)) =
                    self.get_supported_expr_constraint_aware(node, Onion::COMPARABLE, rctx.agg)
                {
                    return Some(push_projection(
                        projections,
                        ClientProjection {
                            orig: node.clone(),
                            server: se,
                            onion: ot,
                            vector: false,
                        },
                    ));
                }
                if rctx.agg {
                    if let Some((se, ot)) = self.get_supported_expr(node, Onion::COMPARABLE) {
                        return Some(push_projection(
                            projections,
                            ClientProjection {
                                orig: node.clone(),
                                server: Expr::GroupConcat {
                                    arg: Box::new(se),
                                    sep: ",".to_owned(),
                                },
                                onion: ot,
                                vector: true,
                            },
                        ));
                    }
                }
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Packed-HOM sum optimization
    // -----------------------------------------------------------------------

    fn collect_hom_optimizations(
        &self,
        resolved: &Expr,
        projections: &mut Vec<ClientProjection>,
        opt_map: &mut HashMap<Expr, Expr>,
    ) {
        transform::visit_expr(resolved, &mut |n| {
            if let Expr::Agg { op, arg } = n {
                if matches!(op, AggOp::Sum | AggOp::Avg) {
                    if let Some((inner, desc)) = self.establish_hom_group(arg) {
                        let hom_slot = push_projection(
                            projections,
                            ClientProjection {
                                orig: n.clone(),
                                server: Expr::Call {
                                    name: "hom_agg".to_owned(),
                                    args: vec![
                                        inner,
                                        Expr::Lit(Literal::Str(desc.table.clone())),
                                        Expr::Lit(Literal::Int(desc.group as i64)),
                                    ],
                                },
                                onion: OnionType::HomGroup {
                                    table: desc.table.clone(),
                                    group: desc.group,
                                },
                                vector: false,
                            },
                        );
                        let get = Expr::Call {
                            name: "hom_get_pos".to_owned(),
                            args: vec![
                                Expr::TuplePos(hom_slot),
                                Expr::Lit(Literal::Int(desc.pos as i64)),
                            ],
                        };
                        let rep = if *op == AggOp::Avg {
                            let cnt_slot = push_projection(
                                projections,
                                ClientProjection {
                                    orig: Expr::CountStar,
                                    server: Expr::CountStar,
                                    onion: OnionType::plain(),
                                    vector: false,
                                },
                            );
                            Expr::binop(
                                onionql_ast::BinOp::Div,
                                get,
                                Expr::TuplePos(cnt_slot),
                            )
                        } else {
                            get
                        };
                        tracing::debug!(
                            target: "onionql.plan",
                            table = %desc.table,
                            group = desc.group,
                            pos = desc.pos,
                            "plan.hom_group_sum"
                        );
                        opt_map.insert(n.clone(), rep);
                        return Recurse::Stop;
                    }
                }
            }
            Recurse::Continue
        });
    }

    /// Establish a single packed HOM group answering a sum argument,
    /// walking through CASE branches. Returns the server expression whose
    /// non-null rows feed `hom_agg`, and the chosen group position.
    fn establish_hom_group(&self, arg: &Expr) -> Option<(Expr, HomDesc)> {
        match arg {
            Expr::Case {
                branches,
                else_branch,
            } => {
                // The else branch may only contribute zero.
                match else_branch.as_deref() {
                    None | Some(Expr::Lit(Literal::Int(0) | Literal::Null)) => {}
                    Some(_) => return None,
                }
                let mut common: Option<Vec<HomDesc>> = None;
                let mut rowid: Option<Expr> = None;
                for b in branches {
                    let (r, descs) = self.get_supported_hom_row_desc_expr(&b.then)?;
                    rowid.get_or_insert(r);
                    common = Some(match common {
                        None => descs,
                        Some(prev) => prev.into_iter().filter(|d| descs.contains(d)).collect(),
                    });
                }
                let candidates = common?;
                if candidates.is_empty() {
                    return None;
                }
                let desc = self.pick_hom_group(&candidates);
                let rowid = rowid?;
                let mut conds = Vec::with_capacity(branches.len());
                for b in branches {
                    match self.do_transform_server(&b.cond, &RewriteCtx::plain(false)) {
                        Ok(Some((c, _))) => conds.push(c),
                        _ => return None,
                    }
                }
                let inner = Expr::Case {
                    branches: conds
                        .into_iter()
                        .map(|cond| CaseBranch {
                            cond,
                            then: rowid.clone(),
                        })
                        .collect(),
                    else_branch: Some(Box::new(Expr::Lit(Literal::Null))),
                };
                Some((inner, desc))
            }
            _ => {
                let (rowid, descs) = self.get_supported_hom_row_desc_expr(arg)?;
                let desc = self.pick_hom_group(&descs);
                Some((rowid, desc))
            }
        }
    }

    /// Tie-break candidate groups by the precomputed per-table preference:
    /// the least-used group first, so heavily shared groups stay available
    /// for other sums in the query.
    fn pick_hom_group(&self, candidates: &[HomDesc]) -> HomDesc {
        debug_assert!(!candidates.is_empty());
        if let Some(pref) = self.hom_pref.get(&candidates[0].table.to_ascii_lowercase()) {
            for group in pref {
                if let Some(d) = candidates.iter().find(|d| d.group == *group) {
                    return d.clone();
                }
            }
        }
        candidates[0].clone()
    }

    // -----------------------------------------------------------------------
    // Correlated subqueries
    // -----------------------------------------------------------------------

    /// Rewrite a subselect's references to the enclosing statement as
    /// positional placeholders, returning the rewritten statement plus the
    /// outer field bound to each slot.
    pub(crate) fn rewrite_outer_references(
        &self,
        sub: &SelectStmt,
    ) -> PlanResult<(SelectStmt, Vec<Expr>)> {
        let mut slots: Vec<Expr> = Vec::new();
        let rewritten = self.rewrite_outer_refs_in_stmt(sub, &mut slots)?;
        Ok((rewritten, slots))
    }

    fn rewrite_outer_refs_in_stmt(
        &self,
        stmt: &SelectStmt,
        slots: &mut Vec<Expr>,
    ) -> PlanResult<SelectStmt> {
        let mut out = stmt.clone();
        for p in &mut out.projections {
            if let Projection::Expr { expr, .. } = p {
                *expr = self.rewrite_outer_refs_in_expr(expr, slots)?;
            }
        }
        for rel in &mut out.relations {
            if let RelationSource::Subquery(s) = &mut rel.source {
                **s = self.rewrite_outer_refs_in_stmt(s, slots)?;
            }
        }
        if let Some(f) = &mut out.filter {
            *f = self.rewrite_outer_refs_in_expr(f, slots)?;
        }
        if let Some(GroupBy { keys, having }) = &mut out.group_by {
            for k in keys.iter_mut() {
                *k = self.rewrite_outer_refs_in_expr(k, slots)?;
            }
            if let Some(h) = having {
                *h = self.rewrite_outer_refs_in_expr(h, slots)?;
            }
        }
        for OrderKey { expr, .. } in &mut out.order_by {
            *expr = self.rewrite_outer_refs_in_expr(expr, slots)?;
        }
        Ok(out)
    }

    fn rewrite_outer_refs_in_expr(
        &self,
        e: &Expr,
        slots: &mut Vec<Expr>,
    ) -> PlanResult<Expr> {
        // Manual recursion: placeholder rewriting must reach nested
        // subselect bodies, which the generic transform treats as opaque.
        if let Expr::Subselect(s) = e {
            return Ok(Expr::Subselect(Box::new(
                self.rewrite_outer_refs_in_stmt(s, slots)?,
            )));
        }
        if let Expr::Exists(s) = e {
            return Ok(Expr::Exists(Box::new(
                self.rewrite_outer_refs_in_stmt(s, slots)?,
            )));
        }
        if let Expr::Field(fi) = e {
            if let Some(sym) = &fi.symbol {
                let outer = sym.ctx() == self.ctx
                    || self.arena.is_parent_of(sym.ctx(), self.ctx);
                if outer {
                    if let Symbol::Projection(ProjectionSymbol { name, .. }) = sym {
                        return Err(PlanError::OuterProjectionReference { name: name.clone() });
                    }
                    let slot = slots.iter().position(|s| s == e).unwrap_or_else(|| {
                        slots.push(e.clone());
                        slots.len() - 1
                    });
                    return Ok(Expr::DependentPlaceholder(slot));
                }
            }
            return Ok(e.clone());
        }

        // Rebuild interior nodes child by child.
        let mut err: Option<PlanError> = None;
        let rebuilt = transform::top_down_transform(e, &mut |node| {
            if std::ptr::eq(node, e) {
                return (None, Recurse::Continue);
            }
            match self.rewrite_outer_refs_in_expr(node, slots) {
                Ok(r) => (Some(r), Recurse::Stop),
                Err(x) => {
                    err = Some(x);
                    (None, Recurse::Stop)
                }
            }
        });
        match err {
            Some(x) => Err(x),
            None => Ok(rebuilt),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
