//! The onion catalog: which encrypted representations exist.
//!
//! Keys are *canonical* expressions (qualifiers and symbols stripped), so
//! syntactically identical expressions collide regardless of where they were
//! written. A bare column keys its own onions; a compound expression keys a
//! precomputed encrypted column. Packed HOM groups are tracked separately:
//! each group is an ordered sequence of expressions co-located in one
//! ciphertext row, summed in one shot by `hom_agg`.

use onionql_ast::{transform, Expr};
use onionql_types::{HomDesc, Onion, Schema};

use std::collections::HashMap;
use std::fmt;

/// One catalog entry: the physical base name plus available onions.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OnionEntry {
    base: String,
    mask: Onion,
}

/// Catalog of available onions per (table, canonical expression), plus
/// packed HOM groups per table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnionSet {
    opts: HashMap<(String, Expr), OnionEntry>,
    packed: HashMap<String, Vec<Vec<Expr>>>,
    precomp_count: usize,
}

impl OnionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Available onions for a canonical expression of `table`.
    #[must_use]
    pub fn lookup(&self, table: &str, canonical: &Expr) -> Option<(&str, Onion)> {
        self.opts
            .get(&(table.to_ascii_lowercase(), canonical.clone()))
            .map(|e| (e.base.as_str(), e.mask))
    }

    /// Every packed-group position holding this canonical expression.
    #[must_use]
    pub fn lookup_packed_hom(&self, table: &str, canonical: &Expr) -> Vec<HomDesc> {
        let Some(groups) = self.packed.get(&table.to_ascii_lowercase()) else {
            return vec![];
        };
        let mut out = vec![];
        for (group, exprs) in groups.iter().enumerate() {
            for (pos, e) in exprs.iter().enumerate() {
                if e == canonical {
                    out.push(HomDesc {
                        table: table.to_owned(),
                        group,
                        pos,
                    });
                }
            }
        }
        out
    }

    /// Register an onion for a canonical expression. Bare fields keep their
    /// column name as the physical base; compound expressions get a
    /// synthesized precomputed-column base name.
    pub fn add(&mut self, table: &str, canonical: &Expr, onion: Onion) {
        debug_assert!(onion.is_single(), "add takes a single onion bit");
        let key = (table.to_ascii_lowercase(), canonicalized(canonical));
        if let Some(entry) = self.opts.get_mut(&key) {
            entry.mask |= onion;
            return;
        }
        let base = match &key.1 {
            Expr::Field(fi) => fi.name.clone(),
            _ => {
                self.precomp_count += 1;
                format!("precomp${}", self.precomp_count - 1)
            }
        };
        self.opts.insert(key, OnionEntry { base, mask: onion });
    }

    /// Start a new packed HOM group holding `canonical` at position 0.
    pub fn add_packed_hom(&mut self, table: &str, canonical: &Expr) {
        self.packed
            .entry(table.to_ascii_lowercase())
            .or_default()
            .push(vec![canonicalized(canonical)]);
    }

    /// Append `canonical` to the most recently added group of `table`,
    /// starting a new group if there is none.
    pub fn add_packed_hom_to_last_group(&mut self, table: &str, canonical: &Expr) {
        let groups = self.packed.entry(table.to_ascii_lowercase()).or_default();
        match groups.last_mut() {
            Some(last) => last.push(canonicalized(canonical)),
            None => groups.push(vec![canonicalized(canonical)]),
        }
    }

    /// Number of packed groups registered for `table`.
    #[must_use]
    pub fn packed_group_count(&self, table: &str) -> usize {
        self.packed
            .get(&table.to_ascii_lowercase())
            .map_or(0, Vec::len)
    }

    /// Fill in DET for every base column, so every column has at least an
    /// equality onion regardless of what the candidate enumeration chose.
    pub fn complete(&mut self, schema: &Schema) {
        for table in schema.tables() {
            for col in &table.columns {
                let key = Expr::field(col.name.clone());
                self.add(&table.name, &key, Onion::DET);
            }
        }
    }

    /// Union of two catalogs. Packed groups of `other` are appended after
    /// this catalog's groups.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for ((table, expr), entry) in &other.opts {
            // Re-add bit by bit so base-name synthesis stays consistent.
            for bit in entry.mask.to_seq() {
                out.add(table, expr, bit);
            }
        }
        for (table, groups) in &other.packed {
            let dst = out.packed.entry(table.clone()).or_default();
            for g in groups {
                if !dst.contains(g) {
                    dst.push(g.clone());
                }
            }
        }
        out
    }

    /// Number of catalog entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.opts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.opts.is_empty()
    }

    /// Stable text form used for deduplicating candidate sets.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut entries: Vec<String> = self
            .opts
            .iter()
            .map(|((t, e), entry)| format!("{t}|{e}|{}", entry.mask))
            .collect();
        entries.sort();
        let mut packed: Vec<String> = self
            .packed
            .iter()
            .map(|(t, groups)| {
                let gs: Vec<String> = groups
                    .iter()
                    .map(|g| {
                        g.iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(";")
                    })
                    .collect();
                format!("{t}#{}", gs.join("#"))
            })
            .collect();
        packed.sort();
        format!("{}//{}", entries.join(","), packed.join(","))
    }
}

impl fmt::Display for OnionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<String> = self
            .opts
            .iter()
            .map(|((t, e), entry)| format!("{t}.{e} -> {}", entry.mask))
            .collect();
        entries.sort();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

fn canonicalized(e: &Expr) -> Expr {
    transform::canonicalize(e)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use onionql_ast::BinOp;
    use onionql_types::{ColumnDef, DataType, TableDef};

    fn price_expr() -> Expr {
        Expr::binop(
            BinOp::Mult,
            Expr::qualified_field("l", "l_extendedprice"),
            Expr::binop(
                BinOp::Minus,
                Expr::int(1),
                Expr::qualified_field("l", "l_discount"),
            ),
        )
    }

    #[test]
    fn test_lookup_is_canonical() {
        let mut os = OnionSet::new();
        os.add("lineitem", &price_expr(), Onion::HOM);
        // Same expression written without qualifiers must collide.
        let bare = Expr::binop(
            BinOp::Mult,
            Expr::field("l_extendedprice"),
            Expr::binop(BinOp::Minus, Expr::int(1), Expr::field("l_discount")),
        );
        let (base, mask) = os.lookup("lineitem", &bare).expect("hit");
        assert_eq!(mask, Onion::HOM);
        assert!(base.starts_with("precomp$"));
    }

    #[test]
    fn test_add_accumulates_mask() {
        let mut os = OnionSet::new();
        os.add("t", &Expr::field("a"), Onion::DET);
        os.add("t", &Expr::field("a"), Onion::OPE);
        let (base, mask) = os.lookup("t", &Expr::field("a")).expect("hit");
        assert_eq!(base, "a");
        assert_eq!(mask, Onion::DET | Onion::OPE);
    }

    #[test]
    fn test_packed_groups() {
        let mut os = OnionSet::new();
        os.add_packed_hom("lineitem", &price_expr());
        os.add_packed_hom_to_last_group("lineitem", &Expr::field("l_quantity"));
        os.add_packed_hom("lineitem", &Expr::field("l_quantity"));

        let descs = os.lookup_packed_hom("lineitem", &Expr::field("l_quantity"));
        assert_eq!(descs.len(), 2);
        assert_eq!((descs[0].group, descs[0].pos), (0, 1));
        assert_eq!((descs[1].group, descs[1].pos), (1, 0));
        assert_eq!(os.packed_group_count("lineitem"), 2);
    }

    #[test]
    fn test_complete_fills_det() {
        let mut schema = Schema::new();
        schema.add_table(TableDef {
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
        let mut os = OnionSet::new();
        os.add("t", &Expr::field("a"), Onion::OPE);
        os.complete(&schema);

        let (_, a_mask) = os.lookup("t", &Expr::field("a")).expect("a");
        let (_, b_mask) = os.lookup("t", &Expr::field("b")).expect("b");
        assert_eq!(a_mask, Onion::OPE | Onion::DET);
        assert_eq!(b_mask, Onion::DET);
    }

    #[test]
    fn test_merge_unions_masks() {
        let mut a = OnionSet::new();
        a.add("t", &Expr::field("a"), Onion::DET);
        let mut b = OnionSet::new();
        b.add("t", &Expr::field("a"), Onion::OPE);
        b.add("t", &Expr::field("b"), Onion::SWP);

        let m = a.merge(&b);
        assert_eq!(m.lookup("t", &Expr::field("a")).unwrap().1, Onion::DET | Onion::OPE);
        assert_eq!(m.lookup("t", &Expr::field("b")).unwrap().1, Onion::SWP);
        assert_eq!(a.merge(&b).fingerprint(), b.merge(&a).fingerprint());
    }
}
