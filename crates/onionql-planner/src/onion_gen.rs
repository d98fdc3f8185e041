//! Onion-set generation and candidate-plan enumeration.
//!
//! [`generate_onion_sets`] mirrors the rewrite traversal but, instead of
//! rewriting, records the onion each clause would need server-side:
//! comparisons request DET or OPE on both operands (propagated as
//! alternative candidate sets), LIKE requests SWP, group keys request a
//! comparable onion, order keys request OPE, and SUM/AVG arguments register
//! packed HOM groups. [`generate_candidate_plans`] merges every non-empty
//! subset of those sets, completes each with DET, and runs the generator
//! once per candidate.

use onionql_ast::{
    AggOp, BoundStmt, Expr, GroupBy, Projection, RelationSource, ScopeArena, SelectStmt,
};
use onionql_types::{Onion, Schema, Statistics};

use crate::classify::find_onionable_expr;
use crate::plan::PlanNode;
use crate::{EncContext, OnionSet, PlanGenerator};

/// Upper bound on alternative candidate sets kept during generation.
const MAX_CANDIDATES: usize = 32;

/// Upper bound on base sets fed into the power-set merge.
const MAX_POWER_SET_BASE: usize = 6;

/// What the candidate-ranking layer needs to know about one generated plan.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EstimateContext {
    /// Stable identity of the candidate onion set.
    pub onion_set: String,
    /// Catalog entries in the candidate.
    pub entries: usize,
}

// ---------------------------------------------------------------------------
// Onion-set generation
// ---------------------------------------------------------------------------

/// One onion requirement: (table, canonical expression, onion).
type Requirement = (String, Expr, Onion);

struct OnionGen<'a> {
    arena: &'a ScopeArena,
    schema: &'a Schema,
    candidates: Vec<OnionSet>,
}

/// Enumerate the onion requirements a candidate set must satisfy to answer
/// `bound` server-side. Alternatives (DET vs OPE equality) fan out into
/// separate sets.
#[must_use]
pub fn generate_onion_sets(bound: &BoundStmt, schema: &Schema) -> Vec<OnionSet> {
    let mut gen = OnionGen {
        arena: &bound.arena,
        schema,
        candidates: vec![OnionSet::new()],
    };
    gen.walk_stmt(&bound.stmt);
    tracing::debug!(
        target: "onionql.plan",
        candidates = gen.candidates.len(),
        "onion_gen.candidates"
    );
    gen.candidates
}

impl<'a> OnionGen<'a> {
    fn onionable(&self, e: &Expr) -> Option<(String, Expr)> {
        find_onionable_expr(self.arena, self.schema, e).map(|info| (info.table, info.canonical))
    }

    fn require(&mut self, reqs: &[Requirement]) {
        for c in &mut self.candidates {
            for (table, expr, onion) in reqs {
                c.add(table, expr, *onion);
            }
        }
    }

    /// Fan the working set out over alternative requirement lists.
    fn alternatives(&mut self, alts: &[Vec<Requirement>]) {
        match alts.len() {
            0 => {}
            1 => self.require(&alts[0]),
            _ => {
                let mut next = Vec::with_capacity(self.candidates.len() * alts.len());
                for c in &self.candidates {
                    for alt in alts {
                        let mut c2 = c.clone();
                        for (table, expr, onion) in alt {
                            c2.add(table, expr, *onion);
                        }
                        next.push(c2);
                    }
                }
                next.truncate(MAX_CANDIDATES);
                self.candidates = next;
            }
        }
    }

    fn packed(&mut self, table: &str, expr: &Expr) {
        for c in &mut self.candidates {
            if c.lookup_packed_hom(table, expr).is_empty() {
                c.add_packed_hom(table, expr);
            }
        }
    }

    fn walk_stmt(&mut self, stmt: &SelectStmt) {
        for rel in &stmt.relations {
            if let RelationSource::Subquery(sub) = &rel.source {
                self.walk_stmt(sub);
            }
        }
        for p in &stmt.projections {
            if let Projection::Expr { expr, .. } = p {
                self.walk_value(expr);
            }
        }
        if let Some(f) = &stmt.filter {
            self.walk_pred(f);
        }
        if let Some(GroupBy { keys, having }) = &stmt.group_by {
            for k in keys {
                if let Some((table, canonical)) = self.onionable(k) {
                    self.require(&[(table, canonical, Onion::DET)]);
                }
            }
            if let Some(h) = having {
                self.walk_pred(h);
            }
        }
        for k in &stmt.order_by {
            if let Some((table, canonical)) = self.onionable(&k.expr) {
                self.require(&[(table, canonical, Onion::OPE)]);
            }
        }
    }

    fn walk_pred(&mut self, e: &Expr) {
        match e {
            Expr::And(l, r) | Expr::Or(l, r) => {
                self.walk_pred(l);
                self.walk_pred(r);
            }
            Expr::Not(x) => self.walk_pred(x),
            Expr::Cmp { op, lhs, rhs } => {
                let sides: Vec<(String, Expr)> = [lhs, rhs]
                    .iter()
                    .filter_map(|s| self.onionable(s))
                    .collect();
                for side in [lhs, rhs] {
                    if let Expr::Subselect(s) = side.as_ref() {
                        self.walk_stmt(s);
                    }
                }
                if sides.is_empty() {
                    return;
                }
                if op.is_equality() {
                    let det: Vec<Requirement> = sides
                        .iter()
                        .map(|(t, c)| (t.clone(), c.clone(), Onion::DET))
                        .collect();
                    let ope: Vec<Requirement> = sides
                        .iter()
                        .map(|(t, c)| (t.clone(), c.clone(), Onion::OPE))
                        .collect();
                    self.alternatives(&[det, ope]);
                } else {
                    let ope: Vec<Requirement> = sides
                        .into_iter()
                        .map(|(t, c)| (t, c, Onion::OPE))
                        .collect();
                    self.require(&ope);
                }
            }
            Expr::In { needle, set, .. } => {
                let mut det: Vec<Requirement> = Vec::new();
                let mut ope: Vec<Requirement> = Vec::new();
                for side in std::iter::once(needle.as_ref()).chain(set.iter()) {
                    if let Expr::Subselect(s) = side {
                        self.walk_stmt(s);
                    }
                    if let Some((t, c)) = self.onionable(side) {
                        det.push((t.clone(), c.clone(), Onion::DET));
                        ope.push((t, c, Onion::OPE));
                    }
                }
                if !det.is_empty() {
                    self.alternatives(&[det, ope]);
                }
            }
            Expr::Like { expr, .. } => {
                if let Some((t, c)) = self.onionable(expr) {
                    self.require(&[(t, c, Onion::SWP)]);
                }
            }
            Expr::Exists(s) => self.walk_stmt(s),
            Expr::CountStar | Expr::Agg { .. } => self.walk_value(e),
            _ => {
                // Residual shapes still need their columns projectable.
                for_each_onionable_field(self.arena, self.schema, e, &mut |t, c| {
                    self.require(&[(t, c, Onion::DET)]);
                });
            }
        }
    }

    fn walk_value(&mut self, e: &Expr) {
        match e {
            Expr::Agg { op, arg } => match op {
                AggOp::Sum | AggOp::Avg => {
                    let branches: Vec<&Expr> = match arg.as_ref() {
                        Expr::Case {
                            branches,
                            else_branch: _,
                        } => {
                            for b in branches {
                                self.walk_pred(&b.cond);
                            }
                            branches.iter().map(|b| &b.then).collect()
                        }
                        other => vec![other],
                    };
                    for b in branches {
                        if let Some((t, c)) = self.onionable(b) {
                            self.packed(&t, &c);
                        }
                    }
                }
                AggOp::Min | AggOp::Max => {
                    if let Some((t, c)) = self.onionable(arg) {
                        self.require(&[(t, c, Onion::OPE)]);
                    }
                }
                AggOp::Count => {
                    if let Some((t, c)) = self.onionable(arg) {
                        self.require(&[(t, c, Onion::DET)]);
                    }
                }
            },
            Expr::CountStar => {}
            Expr::Subselect(s) | Expr::Exists(s) => self.walk_stmt(s),
            Expr::Case {
                branches,
                else_branch,
            } => {
                for b in branches {
                    self.walk_pred(&b.cond);
                    self.walk_value(&b.then);
                }
                if let Some(x) = else_branch {
                    self.walk_value(x);
                }
            }
            _ => {
                if let Some((t, c)) = self.onionable(e) {
                    self.require(&[(t, c, Onion::DET)]);
                    return;
                }
                for_each_onionable_field(self.arena, self.schema, e, &mut |t, c| {
                    self.require(&[(t, c, Onion::DET)]);
                });
            }
        }
    }
}

/// Apply `f` to the (table, canonical) of every field in `e` that
/// classifies as onionable on its own.
fn for_each_onionable_field(
    arena: &ScopeArena,
    schema: &Schema,
    e: &Expr,
    f: &mut impl FnMut(String, Expr),
) {
    for fi in onionql_ast::transform::gather_fields(e) {
        let field = Expr::Field(fi.clone());
        if let Some(info) = find_onionable_expr(arena, schema, &field) {
            f(info.table, info.canonical);
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate enumeration
// ---------------------------------------------------------------------------

/// Enumerate candidate onion sets for `bound`, plan each, and return the
/// distinct plans with their estimate contexts. Candidates the generator
/// rejects (infeasible group or order keys) are skipped.
#[must_use]
pub fn generate_candidate_plans(
    bound: &BoundStmt,
    schema: &Schema,
    stats: &Statistics,
) -> Vec<(PlanNode, EstimateContext)> {
    let sets = generate_onion_sets(bound, schema);
    let n = sets.len().min(MAX_POWER_SET_BASE);

    let mut merged: Vec<OnionSet> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for bits in 1u32..(1 << n) {
        let mut acc = OnionSet::new();
        for (i, set) in sets.iter().take(n).enumerate() {
            if bits & (1 << i) != 0 {
                acc = acc.merge(set);
            }
        }
        acc.complete(schema);
        if seen.insert(acc.fingerprint()) {
            merged.push(acc);
        }
    }
    if merged.is_empty() {
        let mut acc = OnionSet::new();
        acc.complete(schema);
        merged.push(acc);
    }

    let mut out: Vec<(PlanNode, EstimateContext)> = Vec::new();
    for onions in &merged {
        let gen = PlanGenerator::new(schema, stats, onions);
        match gen.generate_plan(bound, &EncContext::PreserveOriginal) {
            Ok(plan) => {
                if out.iter().any(|(p, _)| *p == plan) {
                    continue;
                }
                let ctx = EstimateContext {
                    onion_set: onions.fingerprint(),
                    entries: onions.len(),
                };
                out.push((plan, ctx));
            }
            Err(e) => {
                tracing::warn!(
                    target: "onionql.plan",
                    error = %e,
                    "onion_gen.candidate_infeasible"
                );
            }
        }
    }
    tracing::debug!(
        target: "onionql.plan",
        candidates = merged.len(),
        plans = out.len(),
        "onion_gen.plans"
    );
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
