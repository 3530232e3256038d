//! Assembly of local element systems and their scatter into global storage.
//!
//! The local/global split follows the usual pattern: element assemblers
//! produce dense local matrices and vectors together with the global
//! equation ids they map to, and the global layer owns the scatter-add into
//! distributed sparse storage.
use nalgebra::{DMatrixViewMut, DVectorViewMut};

pub mod adjoint;
pub mod global;
pub mod local;

/// Connectivity view of an element assembler, decoupled from any scalar
/// computation. Mirrors the mesh topology: element count, node count, and
/// the node indices of each element.
pub trait ElementConnectivityAssembler {
    fn solution_dim(&self) -> usize;

    fn num_elements(&self) -> usize;

    fn num_nodes(&self) -> usize;

    fn element_node_count(&self, element_index: usize) -> usize;

    fn populate_element_nodes(&self, output: &mut [usize], element_index: usize);
}

/// An assembler that can produce local system contributions addressed by
/// global equation ids.
///
/// Implementations must be safe to call concurrently for different elements:
/// all outputs go into caller-provided buffers and no per-element state may
/// be shared mutably.
pub trait ElementSystemAssembler: ElementConnectivityAssembler {
    /// Number of local equations of the element. Must equal the dimension of
    /// the local matrix and the length of the equation id vector.
    fn element_dof_count(&self, element_index: usize) -> usize;

    /// Writes the global equation id of every local dof, ordered to match
    /// the local system.
    ///
    /// # Panics
    ///
    /// Panics if equation ids have not been assigned yet; requesting ids
    /// before numbering is a programming defect, not a runtime condition.
    fn populate_element_equation_ids(&self, output: &mut [usize], element_index: usize);

    /// Elements flagged inactive are skipped by every build loop.
    fn element_is_active(&self, _element_index: usize) -> bool {
        true
    }

    fn assemble_element_system_into(
        &self,
        element_index: usize,
        lhs: DMatrixViewMut<f64>,
        rhs: DVectorViewMut<f64>,
    ) -> eyre::Result<()>;

    fn assemble_element_lhs_into(
        &self,
        element_index: usize,
        lhs: DMatrixViewMut<f64>,
    ) -> eyre::Result<()>;

    fn assemble_element_rhs_into(
        &self,
        element_index: usize,
        rhs: DVectorViewMut<f64>,
    ) -> eyre::Result<()>;
}
