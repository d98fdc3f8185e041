//! Core types for OnionQL.
//!
//! This crate defines the vocabulary shared by every layer of the encrypted
//! query rewriter: the onion bitmask algebra, logical data types, schema
//! definitions with row statistics, and the physical naming scheme that maps
//! logical tables and columns onto their encrypted server-side counterparts.

pub mod onion;

pub use onion::{HomDesc, Onion, OnionSeq, OnionType};

use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Logical data types
// ---------------------------------------------------------------------------

/// Logical type of a column or expression.
///
/// The rewriter only needs enough typing to size encrypted columns and keep
/// symbols honest; there is no affinity or coercion machinery here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DataType {
    Int,
    Decimal,
    Str,
    Date,
    Bool,
    Unknown,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Int => "int",
            Self::Decimal => "decimal",
            Self::Str => "str",
            Self::Date => "date",
            Self::Bool => "bool",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Schema definitions
// ---------------------------------------------------------------------------

/// A column definition in the logical schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name (stored in original case).
    pub name: String,
    /// Logical type.
    pub ty: DataType,
}

/// A table definition in the logical schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Column definitions in declaration order.
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    /// Find a column by name (case-insensitive).
    #[must_use]
    pub fn find_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Whether the table has a column with the given name.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.find_column(name).is_some()
    }
}

/// The logical schema: every table the front end knows about.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: HashMap<String, TableDef>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, table: TableDef) {
        self.tables.insert(table.name.to_ascii_lowercase(), table);
    }

    /// Look up a table by name (case-insensitive).
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(&name.to_ascii_lowercase())
    }

    /// All tables, in no particular order.
    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Row statistics for one table, used by the outer candidate-ranking layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TableStats {
    /// Estimated row count.
    pub n_rows: u64,
}

/// Per-table statistics loaded from the backing database.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Statistics {
    per_table: HashMap<String, TableStats>,
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, table: &str, stats: TableStats) {
        self.per_table.insert(table.to_ascii_lowercase(), stats);
    }

    #[must_use]
    pub fn get(&self, table: &str) -> Option<TableStats> {
        self.per_table.get(&table.to_ascii_lowercase()).copied()
    }
}

// ---------------------------------------------------------------------------
// Physical naming
// ---------------------------------------------------------------------------

/// Column holding the shared row identifier used by packed HOM groups.
pub const ROWID_COLUMN: &str = "rowid";

/// Physical name of the encrypted counterpart of a logical table.
#[must_use]
pub fn enc_table_name(table: &str) -> String {
    format!("{table}$enc")
}

/// Physical name of one onion of a stored column or precomputed expression.
///
/// # Panics
///
/// Panics if `onion` is not a single bit.
#[must_use]
pub fn enc_column_name(base: &str, onion: Onion) -> String {
    format!("{base}${}", onion.name())
}

/// Physical name of the ciphertext column holding one packed HOM group.
#[must_use]
pub fn hom_group_column_name(group: usize) -> String {
    format!("hom${group}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lineitem() -> TableDef {
        TableDef {
            name: "lineitem".to_owned(),
            columns: vec![
                ColumnDef {
                    name: "l_extendedprice".to_owned(),
                    ty: DataType::Decimal,
                },
                ColumnDef {
                    name: "l_shipdate".to_owned(),
                    ty: DataType::Date,
                },
            ],
        }
    }

    #[test]
    fn test_schema_lookup_case_insensitive() {
        let mut schema = Schema::new();
        schema.add_table(lineitem());
        assert!(schema.table("LINEITEM").is_some());
        let t = schema.table("lineitem").unwrap();
        assert!(t.has_column("L_SHIPDATE"));
        assert!(!t.has_column("l_tax"));
    }

    #[test]
    fn test_enc_naming() {
        assert_eq!(enc_table_name("lineitem"), "lineitem$enc");
        assert_eq!(enc_column_name("l_shipdate", Onion::OPE), "l_shipdate$OPE");
        assert_eq!(hom_group_column_name(2), "hom$2");
    }

    #[test]
    fn test_statistics_roundtrip() {
        let mut stats = Statistics::new();
        stats.set("lineitem", TableStats { n_rows: 6_000_000 });
        assert_eq!(stats.get("Lineitem").unwrap().n_rows, 6_000_000);
        assert!(stats.get("orders").is_none());
    }
}
