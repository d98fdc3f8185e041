//! Plan tree node types.
//!
//! A plan is a tower of client-side operators over `RemoteSql` leaves. The
//! leaf ships rewritten SQL to the encrypted store; every interior node
//! finishes work the server could not perform under the chosen onions.
//! Each node exposes a *tuple descriptor*: the per-position encryption
//! state of the rows it emits.

use onionql_ast::{Expr, OrderDirection, SelectStmt};
use onionql_error::{PlanError, PlanResult};
use onionql_types::{Onion, OnionType};

use std::fmt;

// ---------------------------------------------------------------------------
// Tuple descriptors
// ---------------------------------------------------------------------------

/// Encryption state of one output position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct PosDesc {
    /// Onion the position is encrypted under (or the packed HOM group it
    /// aggregates).
    pub onion: OnionType,
    /// Whether the position holds a `GROUP_CONCAT`-packed vector of the
    /// group's values rather than a scalar.
    pub vector_ctx: bool,
}

impl PosDesc {
    #[must_use]
    pub fn plain() -> Self {
        Self {
            onion: OnionType::plain(),
            vector_ctx: false,
        }
    }

    #[must_use]
    pub fn bit(onion: Onion) -> Self {
        Self {
            onion: OnionType::Bit(onion),
            vector_ctx: false,
        }
    }
}

/// One output slot of a [`PlanNode::LocalTransform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutput {
    /// Pass the child's position through unchanged.
    Position(usize),
    /// Evaluate a client expression over the child tuple.
    Expr { expr: Expr, orig: Expr },
}

/// One sort key of a [`PlanNode::LocalOrderBy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Tuple position sorted on.
    pub pos: usize,
    pub dir: OrderDirection,
    /// Compare ciphertexts directly; only sound for OPE positions.
    pub ope_compare: bool,
}

// ---------------------------------------------------------------------------
// Plan nodes
// ---------------------------------------------------------------------------

/// A node of the executable plan tree.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    /// Ship a rewritten statement to the encrypted store.
    RemoteSql {
        stmt: SelectStmt,
        desc: Vec<PosDesc>,
        /// Plans of residual subqueries referenced positionally by client
        /// expressions above this leaf.
        subplans: Vec<PlanNode>,
    },
    /// Execute `child`, upload the result server-side under `name`, then
    /// let the enclosing statement reference it as a table.
    RemoteMaterialize { name: String, child: Box<PlanNode> },
    /// Keep rows for which the client expression is true.
    LocalFilter {
        expr: Expr,
        orig: Expr,
        child: Box<PlanNode>,
        subplans: Vec<PlanNode>,
    },
    /// Same as `LocalFilter` but applied to post-aggregation group rows.
    LocalGroupFilter {
        expr: Expr,
        orig: Expr,
        child: Box<PlanNode>,
        subplans: Vec<PlanNode>,
    },
    /// Reshape each tuple: pass-throughs and computed client expressions.
    LocalTransform {
        outputs: Vec<TransformOutput>,
        child: Box<PlanNode>,
    },
    /// Client-side sort.
    LocalOrderBy {
        keys: Vec<SortKey>,
        child: Box<PlanNode>,
    },
    /// Keep the first `n` rows.
    LocalLimit { n: u64, child: Box<PlanNode> },
    /// Decrypt the listed positions to PLAIN.
    LocalDecrypt {
        positions: Vec<usize>,
        child: Box<PlanNode>,
    },
    /// Re-encrypt the listed positions under target onions.
    LocalEncrypt {
        positions: Vec<(usize, Onion)>,
        child: Box<PlanNode>,
    },
}

impl PlanNode {
    /// The tuple descriptor of rows this node emits.
    #[must_use]
    pub fn tuple_desc(&self) -> Vec<PosDesc> {
        match self {
            Self::RemoteSql { desc, .. } => desc.clone(),
            Self::RemoteMaterialize { child, .. }
            | Self::LocalFilter { child, .. }
            | Self::LocalGroupFilter { child, .. }
            | Self::LocalOrderBy { child, .. }
            | Self::LocalLimit { child, .. } => child.tuple_desc(),
            Self::LocalTransform { outputs, child } => {
                let inner = child.tuple_desc();
                outputs
                    .iter()
                    .map(|o| match o {
                        TransformOutput::Position(i) => inner[*i].clone(),
                        TransformOutput::Expr { .. } => PosDesc::plain(),
                    })
                    .collect()
            }
            Self::LocalDecrypt { positions, child } => {
                let mut inner = child.tuple_desc();
                for p in positions {
                    let vector = inner[*p].vector_ctx;
                    inner[*p] = PosDesc {
                        onion: OnionType::plain(),
                        vector_ctx: vector,
                    };
                }
                inner
            }
            Self::LocalEncrypt { positions, child } => {
                let mut inner = child.tuple_desc();
                for (p, o) in positions {
                    let vector = inner[*p].vector_ctx;
                    inner[*p] = PosDesc {
                        onion: OnionType::Bit(*o),
                        vector_ctx: vector,
                    };
                }
                inner
            }
        }
    }

    /// Whether the plan is a bare `RemoteSql` leaf (inlinable as nested
    /// server SQL).
    #[must_use]
    pub fn is_remote_sql(&self) -> bool {
        matches!(self, Self::RemoteSql { .. })
    }

    /// Rebuild the tree with `f` applied to every carried expression
    /// (statement clauses, filter and transform expressions). `f` handles
    /// its own descent.
    #[must_use]
    pub fn map_exprs(&self, f: &mut impl FnMut(&Expr) -> Expr) -> PlanNode {
        match self {
            Self::RemoteSql {
                stmt,
                desc,
                subplans,
            } => Self::RemoteSql {
                stmt: onionql_ast::transform::map_stmt_exprs(stmt, f),
                desc: desc.clone(),
                subplans: subplans.iter().map(|p| p.map_exprs(f)).collect(),
            },
            Self::RemoteMaterialize { name, child } => Self::RemoteMaterialize {
                name: name.clone(),
                child: Box::new(child.map_exprs(f)),
            },
            Self::LocalFilter {
                expr,
                orig,
                child,
                subplans,
            } => Self::LocalFilter {
                expr: f(expr),
                orig: orig.clone(),
                child: Box::new(child.map_exprs(f)),
                subplans: subplans.iter().map(|p| p.map_exprs(f)).collect(),
            },
            Self::LocalGroupFilter {
                expr,
                orig,
                child,
                subplans,
            } => Self::LocalGroupFilter {
                expr: f(expr),
                orig: orig.clone(),
                child: Box::new(child.map_exprs(f)),
                subplans: subplans.iter().map(|p| p.map_exprs(f)).collect(),
            },
            Self::LocalTransform { outputs, child } => Self::LocalTransform {
                outputs: outputs
                    .iter()
                    .map(|o| match o {
                        TransformOutput::Position(i) => TransformOutput::Position(*i),
                        TransformOutput::Expr { expr, orig } => TransformOutput::Expr {
                            expr: f(expr),
                            orig: orig.clone(),
                        },
                    })
                    .collect(),
                child: Box::new(child.map_exprs(f)),
            },
            Self::LocalOrderBy { keys, child } => Self::LocalOrderBy {
                keys: keys.clone(),
                child: Box::new(child.map_exprs(f)),
            },
            Self::LocalLimit { n, child } => Self::LocalLimit {
                n: *n,
                child: Box::new(child.map_exprs(f)),
            },
            Self::LocalDecrypt { positions, child } => Self::LocalDecrypt {
                positions: positions.clone(),
                child: Box::new(child.map_exprs(f)),
            },
            Self::LocalEncrypt { positions, child } => Self::LocalEncrypt {
                positions: positions.clone(),
                child: Box::new(child.map_exprs(f)),
            },
        }
    }

    /// Child plan, if any.
    #[must_use]
    pub fn child(&self) -> Option<&PlanNode> {
        match self {
            Self::RemoteSql { .. } => None,
            Self::RemoteMaterialize { child, .. }
            | Self::LocalFilter { child, .. }
            | Self::LocalGroupFilter { child, .. }
            | Self::LocalTransform { child, .. }
            | Self::LocalOrderBy { child, .. }
            | Self::LocalLimit { child, .. }
            | Self::LocalDecrypt { child, .. }
            | Self::LocalEncrypt { child, .. } => Some(child),
        }
    }

    /// Verify positional references and descriptor shapes on every node.
    pub fn check_tuple_desc(&self) -> PlanResult<()> {
        let fail = |detail: String| -> PlanResult<()> {
            Err(PlanError::Internal { detail })
        };
        match self {
            Self::RemoteSql { stmt, desc, subplans } => {
                if stmt.projections.len() != desc.len() {
                    return fail(format!(
                        "RemoteSql projects {} columns but descriptor has {}",
                        stmt.projections.len(),
                        desc.len()
                    ));
                }
                for sp in subplans {
                    sp.check_tuple_desc()?;
                }
                Ok(())
            }
            Self::RemoteMaterialize { child, .. } => child.check_tuple_desc(),
            Self::LocalFilter {
                child, subplans, ..
            }
            | Self::LocalGroupFilter {
                child, subplans, ..
            } => {
                for sp in subplans {
                    sp.check_tuple_desc()?;
                }
                child.check_tuple_desc()
            }
            Self::LocalTransform { outputs, child } => {
                let n = child.tuple_desc().len();
                for o in outputs {
                    if let TransformOutput::Position(i) = o {
                        if *i >= n {
                            return fail(format!(
                                "transform pass-through {i} out of range ({n} inputs)"
                            ));
                        }
                    }
                }
                child.check_tuple_desc()
            }
            Self::LocalOrderBy { keys, child } => {
                let inner = child.tuple_desc();
                for k in keys {
                    if k.pos >= inner.len() {
                        return fail(format!("sort key {} out of range", k.pos));
                    }
                    if k.ope_compare
                        && inner[k.pos].onion != OnionType::Bit(Onion::OPE)
                    {
                        return fail(format!(
                            "OPE compare on non-OPE position {}",
                            k.pos
                        ));
                    }
                }
                child.check_tuple_desc()
            }
            Self::LocalLimit { child, .. } => child.check_tuple_desc(),
            Self::LocalDecrypt { positions, child } => {
                let inner = child.tuple_desc();
                for p in positions {
                    if *p >= inner.len() {
                        return fail(format!("decrypt position {p} out of range"));
                    }
                    if inner[*p].onion.is_plain() {
                        return fail(format!("decrypt of already-plain position {p}"));
                    }
                }
                child.check_tuple_desc()
            }
            Self::LocalEncrypt { positions, child } => {
                let inner = child.tuple_desc();
                for (p, o) in positions {
                    if *p >= inner.len() {
                        return fail(format!("encrypt position {p} out of range"));
                    }
                    if !o.is_single() {
                        return fail(format!("encrypt target for {p} is not a single onion"));
                    }
                }
                child.check_tuple_desc()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl fmt::Display for TransformOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position(i) => write!(f, "${i}"),
            Self::Expr { expr, .. } => write!(f, "{expr}"),
        }
    }
}

impl PlanNode {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Self::RemoteSql { stmt, subplans, .. } => {
                writeln!(f, "{pad}RemoteSql({stmt})")?;
                for sp in subplans {
                    writeln!(f, "{pad}  sub:")?;
                    sp.fmt_indented(f, indent + 2)?;
                }
                Ok(())
            }
            Self::RemoteMaterialize { name, child } => {
                writeln!(f, "{pad}RemoteMaterialize({name})")?;
                child.fmt_indented(f, indent + 1)
            }
            Self::LocalFilter {
                expr,
                child,
                subplans,
                ..
            } => {
                writeln!(f, "{pad}LocalFilter({expr})")?;
                for sp in subplans {
                    writeln!(f, "{pad}  sub:")?;
                    sp.fmt_indented(f, indent + 2)?;
                }
                child.fmt_indented(f, indent + 1)
            }
            Self::LocalGroupFilter {
                expr,
                child,
                subplans,
                ..
            } => {
                writeln!(f, "{pad}LocalGroupFilter({expr})")?;
                for sp in subplans {
                    writeln!(f, "{pad}  sub:")?;
                    sp.fmt_indented(f, indent + 2)?;
                }
                child.fmt_indented(f, indent + 1)
            }
            Self::LocalTransform { outputs, child } => {
                write!(f, "{pad}LocalTransform([")?;
                for (i, o) in outputs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{o}")?;
                }
                writeln!(f, "])")?;
                child.fmt_indented(f, indent + 1)
            }
            Self::LocalOrderBy { keys, child } => {
                write!(f, "{pad}LocalOrderBy([")?;
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(
                        f,
                        "${}{}",
                        k.pos,
                        if k.dir == OrderDirection::Desc {
                            " DESC"
                        } else {
                            ""
                        }
                    )?;
                }
                writeln!(f, "])")?;
                child.fmt_indented(f, indent + 1)
            }
            Self::LocalLimit { n, child } => {
                writeln!(f, "{pad}LocalLimit({n})")?;
                child.fmt_indented(f, indent + 1)
            }
            Self::LocalDecrypt { positions, child } => {
                writeln!(f, "{pad}LocalDecrypt({positions:?})")?;
                child.fmt_indented(f, indent + 1)
            }
            Self::LocalEncrypt { positions, child } => {
                write!(f, "{pad}LocalEncrypt([")?;
                for (i, (p, o)) in positions.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{p}:{o}")?;
                }
                writeln!(f, "])")?;
                child.fmt_indented(f, indent + 1)
            }
        }
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
