//! Error taxonomy for assembly and distributed system construction.
use thiserror::Error;

/// Classified errors produced by assembly, numbering and solve operations.
///
/// The taxonomy distinguishes conditions that are recoverable by the caller
/// (none of them are, within a single build/solve step) from conditions that
/// indicate a programming or partitioning defect. `Consistency` errors in
/// particular must abort the whole distributed job: a torn global system
/// cannot be meaningfully continued.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or contradictory setup input (no dofs, unregistered field,
    /// operation invoked in the wrong state).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Degenerate element geometry (non-positive Jacobian determinant or
    /// domain size).
    #[error("geometry error: {0}")]
    Geometry(String),

    /// A numerical precondition of a kernel was violated, e.g. requesting
    /// cross-wind parameters at a near-zero velocity magnitude.
    #[error("numerical singularity: {0}")]
    Singularity(String),

    /// Partition-global bookkeeping disagrees with the local view
    /// (dof counts, missing sparsity entries, unset equation ids).
    #[error("distributed consistency error: {0}")]
    Consistency(String),

    /// The linear solver failed to produce a solution.
    #[error("solver error: {0}")]
    Solver(String),
}

pub type Result<T> = std::result::Result<T, Error>;
