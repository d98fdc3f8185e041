//! Onion bitmask algebra.
//!
//! An *onion* is one encrypted representation of a column, supporting a
//! specific operation class server-side: DET answers equality, OPE answers
//! ordering, HOM answers summation, SWP answers substring match. PLAIN marks
//! data stored unencrypted. HOM_ROW_DESC tags a row within a packed HOM
//! group and HOM_AGG is the aggregate sink that packed sums land in.
//!
//! Masks are plain bit-ors of onion bits. The bit order is load-bearing:
//! rewrite tie-breaking walks candidate onions bit-ascending, so PLAIN must
//! sort before DET, and DET before OPE.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use smallvec::SmallVec;

/// A set of onions, one bit per scheme. A value with exactly one bit set is
/// a single onion; helpers below distinguish the two uses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Onion(u32);

/// Inline sequence of single onion bits (at most one per scheme).
pub type OnionSeq = SmallVec<[Onion; 7]>;

impl Onion {
    /// Unencrypted storage.
    pub const PLAIN: Self = Self(1);
    /// Deterministic encryption; supports equality.
    pub const DET: Self = Self(1 << 1);
    /// Order-preserving encryption; supports comparison.
    pub const OPE: Self = Self(1 << 2);
    /// Additively homomorphic encryption; supports summation.
    pub const HOM: Self = Self(1 << 3);
    /// Searchable encryption; supports substring match.
    pub const SWP: Self = Self(1 << 4);
    /// Row descriptor within a packed HOM group.
    pub const HOM_ROW_DESC: Self = Self(1 << 5);
    /// Aggregate sink for packed HOM sums.
    pub const HOM_AGG: Self = Self(1 << 6);

    /// The empty mask.
    pub const NONE: Self = Self(0);
    /// Every onion.
    pub const ALL: Self = Self((1 << 7) - 1);

    /// Onions usable as a COUNT(expr) argument.
    pub const COUNTABLE: Self =
        Self(Self::DET.0 | Self::OPE.0 | Self::HOM_ROW_DESC.0 | Self::SWP.0);
    /// Onions usable as an equality operand or group-by key.
    pub const COMPARABLE: Self = Self(Self::DET.0 | Self::OPE.0);
    /// Onions usable as an inequality operand or order-by key.
    pub const IEQUAL_COMPARABLE: Self = Self::OPE;

    /// All single-onion bits, ascending.
    pub const BITS: [Self; 7] = [
        Self::PLAIN,
        Self::DET,
        Self::OPE,
        Self::HOM,
        Self::SWP,
        Self::HOM_ROW_DESC,
        Self::HOM_AGG,
    ];

    /// Raw mask value.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether exactly one onion bit is set.
    #[must_use]
    pub const fn is_single(self) -> bool {
        self.0 != 0 && self.0 & (self.0 - 1) == 0
    }

    /// Whether every bit of `other` is contained in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `self` and `other` share at least one bit.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// The lowest set bit, or `None` for the empty mask. Deterministic:
    /// PLAIN < DET < OPE < HOM < SWP < HOM_ROW_DESC < HOM_AGG.
    #[must_use]
    pub fn pick_one(self) -> Option<Self> {
        if self.0 == 0 {
            None
        } else {
            Some(Self(1 << self.0.trailing_zeros()))
        }
    }

    /// All set bits as single onions, ascending.
    #[must_use]
    pub fn to_seq(self) -> OnionSeq {
        Self::BITS
            .iter()
            .copied()
            .filter(|b| self.contains(*b))
            .collect()
    }

    /// The bits of `self` (ascending) followed by every remaining onion
    /// bit. Used when a caller prefers certain onions but accepts any.
    #[must_use]
    pub fn complete_seq_with_preference(self) -> OnionSeq {
        let mut seq = self.to_seq();
        for b in Self::BITS {
            if !self.contains(b) {
                seq.push(b);
            }
        }
        seq
    }

    /// Physical name component for a single onion bit.
    ///
    /// # Panics
    ///
    /// Panics if more than one bit is set.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::PLAIN => "PLAIN",
            Self::DET => "DET",
            Self::OPE => "OPE",
            Self::HOM => "HOM",
            Self::SWP => "SWP",
            Self::HOM_ROW_DESC => "HOM_ROW_DESC",
            Self::HOM_AGG => "HOM_AGG",
            other => panic!("onion name requires a single bit, got {other:?}"),
        }
    }
}

impl BitOr for Onion {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Onion {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Onion {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Onion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for b in Self::BITS {
            if self.contains(b) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(b.name())?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Onion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Onion-typed values
// ---------------------------------------------------------------------------

/// The encryption state of one produced column.
///
/// Most columns carry a single onion bit; a packed-HOM aggregate column
/// carries the identity of the group it sums instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub enum OnionType {
    /// A single onion bit.
    Bit(Onion),
    /// The aggregate of one packed HOM group of `table`.
    HomGroup { table: String, group: usize },
}

impl OnionType {
    #[must_use]
    pub const fn plain() -> Self {
        Self::Bit(Onion::PLAIN)
    }

    #[must_use]
    pub fn is_plain(&self) -> bool {
        matches!(self, Self::Bit(o) if *o == Onion::PLAIN)
    }

    /// Whether a client decrypt stage can turn this column into PLAIN.
    /// Everything the server hands back is decryptable except data that is
    /// already plain.
    #[must_use]
    pub fn needs_decrypt(&self) -> bool {
        !self.is_plain()
    }

    /// The single onion bit, if this is not a packed-group column.
    #[must_use]
    pub fn bit(&self) -> Option<Onion> {
        match self {
            Self::Bit(o) => Some(*o),
            Self::HomGroup { .. } => None,
        }
    }
}

impl fmt::Display for OnionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bit(o) => write!(f, "{o}"),
            Self::HomGroup { table, group } => write!(f, "HOM_GROUP({table},{group})"),
        }
    }
}

/// Location of one expression inside a packed HOM group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HomDesc {
    /// Base table owning the group.
    pub table: String,
    /// Group id within the table (ordinal).
    pub group: usize,
    /// Position of the expression within the group's ciphertext row.
    pub pos: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
