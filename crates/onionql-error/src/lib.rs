//! Error types for the OnionQL query rewriter.
//!
//! One structured enum for the whole planning pipeline. Variants fall into
//! three classes: *infeasibility* errors that tell the candidate-enumeration
//! layer this onion set cannot answer the query (try another), *contract*
//! errors raised when a caller-supplied encryption requirement cannot be
//! met, and *invariant* errors that indicate a bug in the rewriter itself.
//!
//! Shape failures during server rewriting are deliberately not errors: they
//! are recovered locally by the residual path and produce client-side
//! computations instead.

use thiserror::Error;

/// Primary error type for plan generation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    // === Infeasibility (try another onion set) ===
    /// A GROUP BY key has no supported comparable onion.
    #[error("no comparable onion for GROUP BY key: {key}")]
    GroupKeyUnsupported { key: String },

    /// An ORDER BY key is not expressible as any supported projection.
    #[error("no supported projection for ORDER BY key: {key}")]
    OrderKeyUnsupported { key: String },

    /// A residual client computation needs a value the server cannot
    /// project under any decryptable onion.
    #[error("no decryptable projection for residual value: {expr}")]
    ResidualUnprojectable { expr: String },

    // === Unsupported statement shapes ===
    /// Wildcard `*` in a projection list being planned.
    #[error("wildcard projections cannot be planned")]
    WildcardProjection,

    /// A correlated reference to a named projection of an outer statement.
    #[error("correlated reference to outer projection: {name}")]
    OuterProjectionReference { name: String },

    // === Encryption-context contract ===
    /// EncProj vector length does not match the projection count.
    #[error("encryption requirement width {expected} does not match {actual} projections")]
    EncProjWidthMismatch { expected: usize, actual: usize },

    /// A required output onion mask is empty.
    #[error("empty onion requirement for output position {position}")]
    EmptyOnionRequirement { position: usize },

    /// An output column is still encrypted where plaintext was required.
    #[error("output position {position} is {onion}, expected PLAIN")]
    NotPlain { position: usize, onion: String },

    // === Binding ===
    /// Name resolution failed while preparing the statement.
    #[error("bind error: {detail}")]
    Bind { detail: String },

    // === Internal invariants ===
    /// A rewriter invariant was violated; this is a bug, not bad input.
    #[error("internal invariant violated: {detail}")]
    Internal { detail: String },
}

/// Convenience alias used across the planner.
pub type PlanResult<T> = Result<T, PlanError>;
