//! Plan generation for OnionQL: rewrite a bound SELECT against encrypted
//! relations into a tree of server SQL plus client-side operators.
//!
//! The generator is a pure function of (statement, onion set, encryption
//! context) plus read-only schema and statistics. Per-invocation scratch
//! (the projection cache, accumulated local operators, group-key onions,
//! HOM group preferences) lives in a [`StmtPlanner`] and dies with the
//! call.
//! Candidate enumeration calls the generator once per candidate onion set;
//! invocations are independent.
//!
//! Pipeline per statement: plan derived tables (inline pure `RemoteSql`
//! children, materialize the rest), gather packed-HOM preferences, rewrite
//! WHERE / GROUP BY / HAVING / ORDER BY / LIMIT / projections in that
//! order, then stage-assemble decrypt, filter, transform, sort, and limit
//! operators around the base `RemoteSql`.

mod classify;
mod onion_gen;
mod onion_set;
pub mod plan;
mod rewrite;

pub use classify::{find_onionable_expr, OnionableInfo};
pub use onion_gen::{generate_candidate_plans, generate_onion_sets, EstimateContext};
pub use onion_set::OnionSet;
pub use plan::{PlanNode, PosDesc, SortKey, TransformOutput};
pub use rewrite::{
    ClientComputation, ClientProjection, DependentBinding, ResidualSubquery,
};

use std::collections::HashMap;

use onionql_ast::{
    bind::resolve_aliases, transform, transform::Recurse, AggOp, BoundStmt, ContextId, Expr,
    GroupBy, OrderDirection, OrderKey, Projection, RelationDecl, RelationSource, ScopeArena,
    SelectStmt, Symbol,
};
use onionql_error::{PlanError, PlanResult};
use onionql_types::{enc_table_name, Onion, OnionSeq, OnionType, Schema, Statistics};

use rewrite::{RewriteCtx, ServerRewrite};

// ---------------------------------------------------------------------------
// Encryption contexts
// ---------------------------------------------------------------------------

/// Caller requirement on the returned plan's output encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncContext {
    /// Output tuples must be fully plaintext.
    PreserveOriginal,
    /// Only the row count matters; outputs may stay encrypted.
    PreserveCardinality,
    /// Output position `i` must (`require`) or should carry one of the
    /// onion bits of `onions[i]`.
    EncProj { onions: Vec<Onion>, require: bool },
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Plan generator over one schema, statistics, and candidate onion set.
pub struct PlanGenerator<'a> {
    pub schema: &'a Schema,
    pub stats: &'a Statistics,
    pub onions: &'a OnionSet,
}

impl<'a> PlanGenerator<'a> {
    #[must_use]
    pub fn new(schema: &'a Schema, stats: &'a Statistics, onions: &'a OnionSet) -> Self {
        Self {
            schema,
            stats,
            onions,
        }
    }

    /// Generate an executable plan for a bound statement.
    pub fn generate_plan(&self, bound: &BoundStmt, enc: &EncContext) -> PlanResult<PlanNode> {
        self.generate_plan_inner(&bound.stmt, &bound.arena, enc)
    }

    pub(crate) fn generate_plan_inner(
        &self,
        stmt: &SelectStmt,
        arena: &ScopeArena,
        enc: &EncContext,
    ) -> PlanResult<PlanNode> {
        let span = tracing::debug_span!(
            target: "onionql.plan",
            "generate_plan",
            relations = stmt.relations.len(),
            projections = stmt.projections.len(),
            local_ops = tracing::field::Empty,
        );
        let _guard = span.enter();

        if stmt.has_wildcard() {
            return Err(PlanError::WildcardProjection);
        }
        let ctx = stmt.ctx.ok_or_else(|| PlanError::Internal {
            detail: "statement not bound".to_owned(),
        })?;
        if let EncContext::EncProj { onions, .. } = enc {
            if onions.len() != stmt.projections.len() {
                return Err(PlanError::EncProjWidthMismatch {
                    expected: onions.len(),
                    actual: stmt.projections.len(),
                });
            }
            for (i, o) in onions.iter().enumerate() {
                if o.is_empty() {
                    return Err(PlanError::EmptyOnionRequirement { position: i });
                }
            }
        }

        let planner = StmtPlanner {
            gen: self,
            arena,
            stmt,
            ctx,
            agg: stmt.is_aggregate(),
            group_key_onions: HashMap::new(),
            hom_pref: HashMap::new(),
            subrels: HashMap::new(),
        };
        let node = planner.plan(enc)?;
        node.check_tuple_desc()?;
        Ok(node)
    }
}

// ---------------------------------------------------------------------------
// Per-statement planner
// ---------------------------------------------------------------------------

/// Scratch state for planning one statement.
pub(crate) struct StmtPlanner<'a> {
    pub(crate) gen: &'a PlanGenerator<'a>,
    pub(crate) arena: &'a ScopeArena,
    pub(crate) stmt: &'a SelectStmt,
    pub(crate) ctx: ContextId,
    /// Whether projections/HAVING evaluate in aggregate context.
    pub(crate) agg: bool,
    /// Canonical group-key expression → the onion it was grouped under.
    pub(crate) group_key_onions: HashMap<Expr, Onion>,
    /// Per table (lowercase): packed group ids, least-used first.
    pub(crate) hom_pref: HashMap<String, Vec<usize>>,
    /// Derived-table alias (lowercase) → child plan tuple descriptor.
    pub(crate) subrels: HashMap<String, Vec<PosDesc>>,
}

/// A deduplicated server-side projection slot.
struct FinalProj {
    server: Expr,
    onion: OnionType,
    vector: bool,
    alias: Option<String>,
}

/// Projection outcome before interning.
enum ProjOutcome {
    Server { expr: Expr, onion: OnionType },
    Client(ClientComputation),
}

/// A local sort key before transform offsets are known.
enum LocalOrderTarget {
    /// Sort on logical output position `i`.
    Output(usize),
    /// Sort on an auxiliary OPE server projection (ciphertext compare).
    AuxOpe(Expr),
    /// Sort on an auxiliary client-computed value.
    AuxComputed(ClientComputation),
}

/// A remapped client computation ready for assembly.
struct RemappedComputation {
    expr: Expr,
    orig: Expr,
    reads: Vec<usize>,
    subplans: Vec<PlanNode>,
}

impl<'a> StmtPlanner<'a> {
    #[allow(clippy::too_many_lines)]
    fn plan(mut self, enc: &EncContext) -> PlanResult<PlanNode> {
        let stmt = self.stmt;

        // --- derived tables -------------------------------------------------
        let mut server_relations: Vec<RelationDecl> = Vec::new();
        let mut base_subplans: Vec<PlanNode> = Vec::new();
        for rel in &stmt.relations {
            match &rel.source {
                RelationSource::Table { name } => {
                    let enc_name = enc_table_name(name);
                    let alias = if rel.alias.eq_ignore_ascii_case(name) {
                        enc_name.clone()
                    } else {
                        rel.alias.clone()
                    };
                    server_relations.push(RelationDecl {
                        alias,
                        source: RelationSource::Table { name: enc_name },
                    });
                }
                RelationSource::Subquery(sub) => {
                    let demands = self.collect_subquery_demands(&rel.alias, sub)?;
                    let child = self.gen.generate_plan_inner(
                        sub,
                        self.arena,
                        &EncContext::EncProj {
                            onions: demands,
                            require: false,
                        },
                    )?;
                    let desc = child.tuple_desc();
                    match child {
                        PlanNode::RemoteSql {
                            stmt: inner,
                            subplans,
                            ..
                        } => {
                            server_relations.push(RelationDecl {
                                alias: rel.alias.clone(),
                                source: RelationSource::Subquery(Box::new(inner)),
                            });
                            base_subplans.extend(subplans);
                        }
                        other => {
                            let name = format!("{}$mat", rel.alias);
                            base_subplans.push(PlanNode::RemoteMaterialize {
                                name: name.clone(),
                                child: Box::new(other),
                            });
                            server_relations.push(RelationDecl {
                                alias: rel.alias.clone(),
                                source: RelationSource::Table { name },
                            });
                        }
                    }
                    self.subrels.insert(rel.alias.to_ascii_lowercase(), desc);
                }
            }
        }

        // --- packed-HOM preferences ----------------------------------------
        self.gather_hom_preferences();

        // --- WHERE ----------------------------------------------------------
        let mut server_filter: Option<Expr> = None;
        let mut local_filters: Vec<ClientComputation> = Vec::new();
        if let Some(f) = &stmt.filter {
            match self.rewrite_expr_for_server(f, &RewriteCtx::plain(false))? {
                ServerRewrite::Full(se, _) => server_filter = Some(se),
                ServerRewrite::Partial(res, cc) => {
                    server_filter = res;
                    local_filters.push(cc);
                }
            }
        }

        // --- GROUP BY / HAVING ---------------------------------------------
        let mut server_group_keys: Vec<Expr> = Vec::new();
        let mut server_having: Option<Expr> = None;
        let mut local_group_filters: Vec<ClientComputation> = Vec::new();
        if let Some(GroupBy { keys, having }) = &stmt.group_by {
            for k in keys {
                let resolved = resolve_aliases(self.arena, k);
                let Some((se, ot)) = self.get_supported_expr(&resolved, Onion::COMPARABLE)
                else {
                    return Err(PlanError::GroupKeyUnsupported { key: k.to_string() });
                };
                let OnionType::Bit(bit) = ot else {
                    return Err(PlanError::Internal {
                        detail: "group key mapped to packed group".to_owned(),
                    });
                };
                self.group_key_onions
                    .insert(transform::canonicalize(&resolved), bit);
                server_group_keys.push(se);
            }
            if let Some(h) = having {
                match self.rewrite_expr_for_server(h, &RewriteCtx::plain(true))? {
                    ServerRewrite::Full(se, _) => server_having = Some(se),
                    ServerRewrite::Partial(res, cc) => {
                        server_having = res;
                        local_group_filters.push(cc);
                    }
                }
            }
        }

        // --- ORDER BY: server attempt --------------------------------------
        let mut server_order: Vec<(Expr, OrderDirection)> = Vec::new();
        let mut order_server_ok = true;
        for k in &stmt.order_by {
            let resolved = resolve_aliases(self.arena, &k.expr);
            match self.get_supported_expr_constraint_aware(
                &resolved,
                Onion::IEQUAL_COMPARABLE,
                self.agg,
            ) {
                Some((se, _)) => server_order.push((se, k.dir)),
                None => {
                    order_server_ok = false;
                    server_order.clear();
                    break;
                }
            }
        }

        // --- projections ----------------------------------------------------
        let preserve_cardinality = matches!(enc, EncContext::PreserveCardinality);
        let mut outcomes: Vec<ProjOutcome> = Vec::new();
        for (i, p) in stmt.projections.iter().enumerate() {
            let Projection::Expr { expr, .. } = p else {
                return Err(PlanError::WildcardProjection);
            };
            let seq = Self::projection_onion_seq(enc, i);
            let rctx = RewriteCtx::new(seq, self.agg);
            let outcome = match self.rewrite_expr_for_server(expr, &rctx)? {
                ServerRewrite::Full(se, ot) => ProjOutcome::Server { expr: se, onion: ot },
                ServerRewrite::Partial(None, cc) => ProjOutcome::Client(cc),
                // A conjunction split left part of the value server-side;
                // re-derive the whole expression as one client computation.
                ServerRewrite::Partial(Some(_), _) => {
                    ProjOutcome::Client(self.mk_client_computation(expr, &rctx)?)
                }
            };
            let outcome = if preserve_cardinality {
                // Cardinality does not need the value; keep the row shape
                // with a unit literal instead of client work.
                match outcome {
                    ProjOutcome::Client(_) => ProjOutcome::Server {
                        expr: Expr::int(1),
                        onion: OnionType::plain(),
                    },
                    s => s,
                }
            } else {
                outcome
            };
            outcomes.push(outcome);
        }

        // --- ORDER BY: local targets ---------------------------------------
        let mut local_order: Vec<(LocalOrderTarget, OrderDirection)> = Vec::new();
        if !order_server_ok && !preserve_cardinality {
            for k in &stmt.order_by {
                let resolved = resolve_aliases(self.arena, &k.expr);
                if let Some(i) = self.matching_projection(&resolved) {
                    local_order.push((LocalOrderTarget::Output(i), k.dir));
                } else if let Some((se, _)) =
                    self.get_supported_expr_constraint_aware(&resolved, Onion::OPE, self.agg)
                {
                    local_order.push((LocalOrderTarget::AuxOpe(se), k.dir));
                } else {
                    let rctx = RewriteCtx::new(Onion::COMPARABLE.to_seq(), self.agg);
                    let cc = self
                        .mk_client_computation(&k.expr, &rctx)
                        .map_err(|_| PlanError::OrderKeyUnsupported {
                            key: k.expr.to_string(),
                        })?;
                    local_order.push((LocalOrderTarget::AuxComputed(cc), k.dir));
                }
            }
        }

        // --- LIMIT ----------------------------------------------------------
        let order_is_local = !order_server_ok && !stmt.order_by.is_empty();
        let limit_on_server = local_filters.is_empty()
            && local_group_filters.is_empty()
            && !order_is_local;
        let server_limit = if limit_on_server { stmt.limit } else { None };
        let local_limit = if limit_on_server { None } else { stmt.limit };

        // --- intern server projections --------------------------------------
        let mut finals: Vec<FinalProj> = Vec::new();

        let filters_remapped: Vec<RemappedComputation> = local_filters
            .into_iter()
            .map(|cc| Self::remap_computation(cc, &mut finals, None))
            .collect();
        let group_filters_remapped: Vec<RemappedComputation> = local_group_filters
            .into_iter()
            .map(|cc| Self::remap_computation(cc, &mut finals, None))
            .collect();

        let mut outputs_remapped: Vec<RemappedComputation> = Vec::new();
        let mut output_slots: Vec<Option<usize>> = Vec::new();
        let mut extra_subplans: Vec<PlanNode> = Vec::new();
        for (i, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                ProjOutcome::Server { expr, onion } => {
                    let slot = Self::intern(
                        &mut finals,
                        expr,
                        onion,
                        false,
                        Some(stmt.projection_name(i)),
                    );
                    output_slots.push(Some(slot));
                    outputs_remapped.push(RemappedComputation {
                        expr: Expr::TuplePos(slot),
                        orig: Expr::TuplePos(slot),
                        reads: vec![],
                        subplans: vec![],
                    });
                }
                ProjOutcome::Client(cc) => {
                    let sq_base = base_subplans.len() + extra_subplans.len();
                    let remapped = Self::remap_computation(cc, &mut finals, Some(sq_base));
                    extra_subplans.extend(remapped.subplans.iter().cloned());
                    output_slots.push(None);
                    outputs_remapped.push(remapped);
                }
            }
        }

        for (se, _) in &server_order {
            // Keep server sort keys in the projected row so downstream
            // operators observe the ordering column.
            Self::intern(
                &mut finals,
                se.clone(),
                OnionType::Bit(Onion::OPE),
                false,
                None,
            );
        }

        enum ReadySortKey {
            Output(usize),
            Aux(usize),
            Computed(RemappedComputation),
        }
        let mut ready_sort: Vec<(ReadySortKey, OrderDirection)> = Vec::new();
        for (target, dir) in local_order {
            match target {
                LocalOrderTarget::Output(i) => {
                    ready_sort.push((ReadySortKey::Output(i), dir));
                }
                LocalOrderTarget::AuxOpe(se) => {
                    let slot =
                        Self::intern(&mut finals, se, OnionType::Bit(Onion::OPE), false, None);
                    ready_sort.push((ReadySortKey::Aux(slot), dir));
                }
                LocalOrderTarget::AuxComputed(cc) => {
                    let remapped = Self::remap_computation(cc, &mut finals, None);
                    ready_sort.push((ReadySortKey::Computed(remapped), dir));
                }
            }
        }

        // --- base RemoteSql -------------------------------------------------
        let server_stmt = SelectStmt {
            projections: finals
                .iter()
                .map(|fp| Projection::Expr {
                    expr: fp.server.clone(),
                    alias: fp.alias.clone(),
                })
                .collect(),
            relations: server_relations,
            filter: server_filter,
            group_by: if server_group_keys.is_empty() && server_having.is_none() {
                None
            } else {
                Some(GroupBy {
                    keys: server_group_keys,
                    having: server_having,
                })
            },
            order_by: server_order
                .into_iter()
                .map(|(expr, dir)| OrderKey { expr, dir })
                .collect(),
            limit: server_limit,
            ctx: None,
        };
        let desc: Vec<PosDesc> = finals
            .iter()
            .map(|fp| PosDesc {
                onion: fp.onion.clone(),
                vector_ctx: fp.vector,
            })
            .collect();
        let mut subplans = base_subplans;
        subplans.extend(extra_subplans);

        tracing::debug!(
            target: "onionql.plan",
            server_projs = desc.len(),
            filters = filters_remapped.len(),
            group_filters = group_filters_remapped.len(),
            "plan.server_statement"
        );

        let mut cur = PlanNode::RemoteSql {
            stmt: server_stmt,
            desc,
            subplans,
        };

        // --- stage assembly -------------------------------------------------
        for f in filters_remapped {
            cur = Self::wrap_decrypt(cur, &f.reads);
            cur = PlanNode::LocalFilter {
                expr: f.expr,
                orig: f.orig,
                child: Box::new(cur),
                subplans: f.subplans,
            };
        }
        for f in group_filters_remapped {
            cur = Self::wrap_decrypt(cur, &f.reads);
            cur = PlanNode::LocalGroupFilter {
                expr: f.expr,
                orig: f.orig,
                child: Box::new(cur),
                subplans: f.subplans,
            };
        }

        if !preserve_cardinality {
            let n_logical = outputs_remapped.len();
            let mut outputs: Vec<TransformOutput> = Vec::new();
            let mut reads: Vec<usize> = Vec::new();
            for (i, r) in outputs_remapped.into_iter().enumerate() {
                if let Some(slot) = output_slots[i] {
                    outputs.push(TransformOutput::Position(slot));
                    continue;
                }
                reads.extend(r.reads.iter().copied());
                if let Expr::TuplePos(j) = r.expr {
                    outputs.push(TransformOutput::Position(j));
                } else {
                    let Projection::Expr { expr: orig_expr, .. } = &stmt.projections[i] else {
                        unreachable!("wildcards rejected above");
                    };
                    outputs.push(TransformOutput::Expr {
                        expr: r.expr,
                        orig: orig_expr.clone(),
                    });
                }
            }

            let mut sort_keys: Vec<(usize, OrderDirection)> = Vec::new();
            for (key, dir) in ready_sort {
                match key {
                    ReadySortKey::Output(i) => sort_keys.push((i, dir)),
                    ReadySortKey::Aux(slot) => {
                        let out = outputs.len();
                        outputs.push(TransformOutput::Position(slot));
                        sort_keys.push((out, dir));
                    }
                    ReadySortKey::Computed(r) => {
                        reads.extend(r.reads.iter().copied());
                        let out = outputs.len();
                        outputs.push(TransformOutput::Expr {
                            expr: r.expr,
                            orig: r.orig,
                        });
                        sort_keys.push((out, dir));
                    }
                }
            }

            cur = Self::wrap_decrypt(cur, &reads);

            let width = cur.tuple_desc().len();
            let identity = outputs.len() == width
                && outputs
                    .iter()
                    .enumerate()
                    .all(|(i, o)| matches!(o, TransformOutput::Position(j) if *j == i));
            if !identity {
                cur = PlanNode::LocalTransform {
                    outputs,
                    child: Box::new(cur),
                };
            }

            if !sort_keys.is_empty() {
                let desc_now = cur.tuple_desc();
                let mut dec: Vec<usize> = Vec::new();
                let mut keys: Vec<SortKey> = Vec::new();
                for (pos, dir) in sort_keys {
                    let ope = desc_now[pos].onion == OnionType::Bit(Onion::OPE);
                    if !ope && desc_now[pos].onion.needs_decrypt() {
                        dec.push(pos);
                    }
                    keys.push(SortKey {
                        pos,
                        dir,
                        ope_compare: ope,
                    });
                }
                cur = Self::wrap_decrypt(cur, &dec);
                cur = PlanNode::LocalOrderBy {
                    keys,
                    child: Box::new(cur),
                };
                // Drop auxiliary sort columns.
                if cur.tuple_desc().len() > n_logical {
                    cur = PlanNode::LocalTransform {
                        outputs: (0..n_logical).map(TransformOutput::Position).collect(),
                        child: Box::new(cur),
                    };
                }
            }
        }

        if let Some(n) = local_limit {
            cur = PlanNode::LocalLimit {
                n,
                child: Box::new(cur),
            };
        }

        self.finalize(cur, enc)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Ranked onion sequence for projection `i` under the encryption
    /// context.
    fn projection_onion_seq(enc: &EncContext, i: usize) -> OnionSeq {
        match enc {
            EncContext::PreserveOriginal => OnionSeq::from_slice(&[Onion::PLAIN]),
            EncContext::PreserveCardinality => Onion::ALL.to_seq(),
            EncContext::EncProj { onions, require } => {
                if *require {
                    onions[i].to_seq()
                } else {
                    onions[i].complete_seq_with_preference()
                }
            }
        }
    }

    /// Content-addressed insert into the final projection list.
    fn intern(
        finals: &mut Vec<FinalProj>,
        server: Expr,
        onion: OnionType,
        vector: bool,
        alias: Option<String>,
    ) -> usize {
        if let Some(i) = finals
            .iter()
            .position(|fp| fp.server == server && fp.vector == vector)
        {
            if finals[i].alias.is_none() {
                finals[i].alias = alias;
            }
            return i;
        }
        finals.push(FinalProj {
            server,
            onion,
            vector,
            alias,
        });
        finals.len() - 1
    }

    /// Intern a computation's projections and rewrite its positional
    /// references to final slots. Dependent-binding placeholders inside
    /// subquery plans are rebound to the final tuple position of the outer
    /// value feeding them. `sq_base` offsets subquery positions for
    /// computations whose subplans live on the base `RemoteSql`.
    fn remap_computation(
        cc: ClientComputation,
        finals: &mut Vec<FinalProj>,
        sq_base: Option<usize>,
    ) -> RemappedComputation {
        let mut slot_map: Vec<usize> = Vec::with_capacity(cc.projections.len());
        for p in &cc.projections {
            slot_map.push(Self::intern(
                finals,
                p.server.clone(),
                p.onion.clone(),
                p.vector,
                None,
            ));
        }
        let sq_off = sq_base.unwrap_or(0);
        let expr = transform::top_down_transform(&cc.expr, &mut |n| match n {
            Expr::TuplePos(i) => (Some(Expr::TuplePos(slot_map[*i])), Recurse::Stop),
            Expr::SubqueryPos(i) => (Some(Expr::SubqueryPos(i + sq_off)), Recurse::Stop),
            Expr::ExistsSubqueryPos(i) => {
                (Some(Expr::ExistsSubqueryPos(i + sq_off)), Recurse::Stop)
            }
            _ => (None, Recurse::Continue),
        });
        let mut reads: Vec<usize> = slot_map.clone();

        let mut subplans = Vec::with_capacity(cc.subqueries.len());
        for sq in cc.subqueries {
            let mut slot_to_final: HashMap<usize, usize> = HashMap::new();
            for b in &sq.bindings {
                let p = &cc.subquery_projections[b.projection];
                let fidx = Self::intern(
                    finals,
                    p.server.clone(),
                    p.onion.clone(),
                    p.vector,
                    None,
                );
                reads.push(fidx);
                slot_to_final.insert(b.slot, fidx);
            }
            subplans.push(if slot_to_final.is_empty() {
                sq.plan
            } else {
                sq.plan.map_exprs(&mut |e| rebind_expr(e, &slot_to_final))
            });
        }

        reads.sort_unstable();
        reads.dedup();
        RemappedComputation {
            expr,
            orig: cc.orig,
            reads,
            subplans,
        }
    }

    /// Wrap in `LocalDecrypt` over the still-encrypted positions of
    /// `wanted`; a no-op when every wanted position is already plain.
    fn wrap_decrypt(plan: PlanNode, wanted: &[usize]) -> PlanNode {
        let desc = plan.tuple_desc();
        let mut positions: Vec<usize> = wanted
            .iter()
            .copied()
            .filter(|p| desc[*p].onion.needs_decrypt())
            .collect();
        positions.sort_unstable();
        positions.dedup();
        if positions.is_empty() {
            plan
        } else {
            PlanNode::LocalDecrypt {
                positions,
                child: Box::new(plan),
            }
        }
    }

    /// Index of the original projection structurally equal to `resolved`
    /// after alias resolution, if any.
    fn matching_projection(&self, resolved: &Expr) -> Option<usize> {
        for (i, p) in self.stmt.projections.iter().enumerate() {
            if let Projection::Expr { expr, .. } = p {
                if resolve_aliases(self.arena, expr) == *resolved {
                    return Some(i);
                }
            }
        }
        None
    }

    /// Final encryption-context enforcement.
    fn finalize(&self, cur: PlanNode, enc: &EncContext) -> PlanResult<PlanNode> {
        match enc {
            EncContext::PreserveCardinality => Ok(cur),
            EncContext::PreserveOriginal => {
                let desc = cur.tuple_desc();
                if let Some((i, pd)) =
                    desc.iter().enumerate().find(|(_, pd)| !pd.onion.is_plain())
                {
                    return Err(PlanError::NotPlain {
                        position: i,
                        onion: pd.onion.to_string(),
                    });
                }
                Ok(cur)
            }
            EncContext::EncProj { onions, require } => {
                // A trailing decrypt that the requirement does not need is
                // wasted client work; strip it.
                let cur = match cur {
                    PlanNode::LocalDecrypt { ref child, .. }
                        if Self::encproj_satisfied(&child.tuple_desc(), onions) =>
                    {
                        (**child).clone()
                    }
                    other => other,
                };
                let desc = cur.tuple_desc();
                if desc.len() != onions.len() {
                    return Err(PlanError::Internal {
                        detail: format!(
                            "encryption requirement width {} vs descriptor {}",
                            onions.len(),
                            desc.len()
                        ),
                    });
                }
                if !require || Self::encproj_satisfied(&desc, onions) {
                    return Ok(cur);
                }
                let mut dec: Vec<usize> = Vec::new();
                let mut encs: Vec<(usize, Onion)> = Vec::new();
                for (i, pd) in desc.iter().enumerate() {
                    let ok = pd.onion.bit().is_some_and(|b| onions[i].contains(b));
                    if ok {
                        continue;
                    }
                    if pd.onion.needs_decrypt() {
                        dec.push(i);
                    }
                    if !onions[i].contains(Onion::PLAIN) {
                        let target = onions[i]
                            .pick_one()
                            .ok_or(PlanError::EmptyOnionRequirement { position: i })?;
                        encs.push((i, target));
                    }
                }
                let mut out = cur;
                if !dec.is_empty() {
                    out = PlanNode::LocalDecrypt {
                        positions: dec,
                        child: Box::new(out),
                    };
                }
                if !encs.is_empty() {
                    out = PlanNode::LocalEncrypt {
                        positions: encs,
                        child: Box::new(out),
                    };
                }
                Ok(out)
            }
        }
    }

    fn encproj_satisfied(desc: &[PosDesc], onions: &[Onion]) -> bool {
        desc.len() == onions.len()
            && desc.iter().zip(onions).all(|(pd, mask)| {
                pd.onion.bit().is_some_and(|b| mask.contains(b))
            })
    }

    // -----------------------------------------------------------------------
    // Derived-table onion demands
    // -----------------------------------------------------------------------

    /// OR of the onions the enclosing statement would request from each
    /// output position of the derived table `alias`. Undemanded positions
    /// default to DET.
    fn collect_subquery_demands(
        &self,
        alias: &str,
        sub: &SelectStmt,
    ) -> PlanResult<Vec<Onion>> {
        let sub_ctx = sub.ctx.ok_or_else(|| PlanError::Internal {
            detail: "derived table not bound".to_owned(),
        })?;
        let mut demands = vec![Onion::NONE; sub.projections.len()];

        let stmt = self.stmt;
        for p in &stmt.projections {
            if let Projection::Expr { expr, .. } = p {
                self.demand_expr(expr, Onion::DET, alias, sub_ctx, &mut demands);
            }
        }
        if let Some(f) = &stmt.filter {
            self.demand_pred(f, alias, sub_ctx, &mut demands);
        }
        if let Some(GroupBy { keys, having }) = &stmt.group_by {
            for k in keys {
                self.demand_expr(k, Onion::COMPARABLE, alias, sub_ctx, &mut demands);
            }
            if let Some(h) = having {
                self.demand_pred(h, alias, sub_ctx, &mut demands);
            }
        }
        for k in &stmt.order_by {
            self.demand_expr(&k.expr, Onion::OPE, alias, sub_ctx, &mut demands);
        }

        Ok(demands
            .into_iter()
            .map(|d| if d.is_empty() { Onion::DET } else { d })
            .collect())
    }

    /// Predicate-shaped demand walk: comparisons request DET/OPE/SWP on
    /// their operands.
    fn demand_pred(
        &self,
        e: &Expr,
        alias: &str,
        sub_ctx: ContextId,
        demands: &mut [Onion],
    ) {
        match e {
            Expr::And(l, r) | Expr::Or(l, r) => {
                self.demand_pred(l, alias, sub_ctx, demands);
                self.demand_pred(r, alias, sub_ctx, demands);
            }
            Expr::Not(x) => self.demand_pred(x, alias, sub_ctx, demands),
            Expr::Cmp { op, lhs, rhs } => {
                let mask = if op.is_equality() {
                    Onion::COMPARABLE
                } else {
                    Onion::OPE
                };
                self.demand_expr(lhs, mask, alias, sub_ctx, demands);
                self.demand_expr(rhs, mask, alias, sub_ctx, demands);
            }
            Expr::In { needle, set, .. } => {
                self.demand_expr(needle, Onion::COMPARABLE, alias, sub_ctx, demands);
                for s in set {
                    self.demand_expr(s, Onion::COMPARABLE, alias, sub_ctx, demands);
                }
            }
            Expr::Like { expr, pattern, .. } => {
                self.demand_expr(expr, Onion::SWP, alias, sub_ctx, demands);
                self.demand_expr(pattern, Onion::SWP, alias, sub_ctx, demands);
            }
            _ => self.demand_expr(e, Onion::DET, alias, sub_ctx, demands),
        }
    }

    /// Record `mask` for every reference to a projection of the derived
    /// table, adjusting for aggregate argument positions.
    fn demand_expr(
        &self,
        e: &Expr,
        mask: Onion,
        alias: &str,
        sub_ctx: ContextId,
        demands: &mut [Onion],
    ) {
        match e {
            Expr::Field(fi) => {
                if let Some(Symbol::Column(cs)) = &fi.symbol {
                    if cs.ctx == self.ctx && cs.relation.eq_ignore_ascii_case(alias) {
                        if let Some(pos) = self.projection_pos(sub_ctx, &cs.column) {
                            demands[pos] |= mask;
                        }
                    }
                }
            }
            Expr::Agg { op, arg } => {
                let inner = match op {
                    AggOp::Sum | AggOp::Avg => Onion::HOM,
                    AggOp::Min | AggOp::Max => Onion::OPE,
                    AggOp::Count => Onion::DET,
                };
                self.demand_expr(arg, inner, alias, sub_ctx, demands);
            }
            Expr::Cmp { .. }
            | Expr::And(..)
            | Expr::Or(..)
            | Expr::Not(_)
            | Expr::In { .. }
            | Expr::Like { .. } => self.demand_pred(e, alias, sub_ctx, demands),
            Expr::Subselect(s) | Expr::Exists(s) => {
                // Correlated references from a nested subselect still bind
                // to this statement's relations.
                for p in &s.projections {
                    if let Projection::Expr { expr, .. } = p {
                        self.demand_expr(expr, Onion::DET, alias, sub_ctx, demands);
                    }
                }
                if let Some(f) = &s.filter {
                    self.demand_pred(f, alias, sub_ctx, demands);
                }
            }
            _ => {
                for k in transform::children(e) {
                    self.demand_expr(k, mask, alias, sub_ctx, demands);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Packed-HOM preference
    // -----------------------------------------------------------------------

    /// Count, per table, how many sums in the statement could be answered
    /// by each packed group, and order group ids ascending by that count.
    fn gather_hom_preferences(&mut self) {
        let mut counts: HashMap<(String, usize), usize> = HashMap::new();
        let stmt = self.stmt;
        let mut scan = |e: &Expr, counts: &mut HashMap<(String, usize), usize>| {
            transform::visit_expr(e, &mut |n| {
                if let Expr::Agg { op, arg } = n {
                    if matches!(op, AggOp::Sum | AggOp::Avg) {
                        let candidates: Vec<&Expr> = match arg.as_ref() {
                            Expr::Case { branches, .. } => {
                                branches.iter().map(|b| &b.then).collect()
                            }
                            other => vec![other],
                        };
                        for c in candidates {
                            if let Some((_, descs)) = self.get_supported_hom_row_desc_expr(c) {
                                for d in descs {
                                    *counts
                                        .entry((d.table.to_ascii_lowercase(), d.group))
                                        .or_insert(0) += 1;
                                }
                            }
                        }
                    }
                }
                Recurse::Continue
            });
        };
        for p in &stmt.projections {
            if let Projection::Expr { expr, .. } = p {
                scan(expr, &mut counts);
            }
        }
        if let Some(GroupBy {
            having: Some(h), ..
        }) = &stmt.group_by
        {
            scan(h, &mut counts);
        }

        let mut per_table: HashMap<String, Vec<(usize, usize)>> = HashMap::new();
        for ((table, group), count) in counts {
            per_table.entry(table).or_default().push((group, count));
        }
        self.hom_pref = per_table
            .into_iter()
            .map(|(table, mut groups)| {
                groups.sort_by_key(|(group, count)| (*count, *group));
                (table, groups.into_iter().map(|(g, _)| g).collect())
            })
            .collect();
    }
}

/// Rewrite placeholder slots to final outer-tuple positions, descending
/// into subselects nested inside server expressions.
fn rebind_expr(e: &Expr, map: &HashMap<usize, usize>) -> Expr {
    transform::top_down_transform(e, &mut |n| match n {
        Expr::BoundPlaceholder { slot, onion } => match map.get(slot) {
            Some(s) => (
                Some(Expr::BoundPlaceholder {
                    slot: *s,
                    onion: *onion,
                }),
                Recurse::Stop,
            ),
            None => (None, Recurse::Stop),
        },
        Expr::DependentPlaceholder(slot) => match map.get(slot) {
            Some(s) => (Some(Expr::DependentPlaceholder(*s)), Recurse::Stop),
            None => (None, Recurse::Stop),
        },
        Expr::Subselect(s) => (
            Some(Expr::Subselect(Box::new(transform::map_stmt_exprs(
                s,
                &mut |x| rebind_expr(x, map),
            )))),
            Recurse::Stop,
        ),
        Expr::Exists(s) => (
            Some(Expr::Exists(Box::new(transform::map_stmt_exprs(
                s,
                &mut |x| rebind_expr(x, map),
            )))),
            Recurse::Stop,
        ),
        _ => (None, Recurse::Continue),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
