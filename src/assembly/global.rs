//! Scatter-add of local element systems into the distributed storage.
use crate::assembly::ElementSystemAssembler;
use crate::error::Result;
use crate::sparse::{DistributedCsr, DistributedVector};
use nalgebra::{DMatrix, DMatrixViewMut, DVector, DVectorViewMut};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// Adds a dense local matrix at the Cartesian product of the given global
/// equation ids.
pub fn add_local_matrix(
    matrix: &mut DistributedCsr,
    equation_ids: &[usize],
    local: &DMatrix<f64>,
) -> Result<()> {
    assert_eq!(
        equation_ids.len(),
        local.nrows(),
        "equation id vector must match the local matrix dimension"
    );
    for (a, &row) in equation_ids.iter().enumerate() {
        for (c, &col) in equation_ids.iter().enumerate() {
            matrix.add(row, col, local[(a, c)])?;
        }
    }
    Ok(())
}

pub fn add_local_vector(
    rhs: &mut DistributedVector,
    equation_ids: &[usize],
    local: &DVector<f64>,
) {
    assert_eq!(
        equation_ids.len(),
        local.len(),
        "equation id vector must match the local vector dimension"
    );
    for (a, &row) in equation_ids.iter().enumerate() {
        rhs.add(row, local[a]);
    }
}

/// Serially assembles every active element of the given assembler into the
/// requested outputs. Does not finalize communication; callers follow up
/// with `global_assemble` on the touched containers.
pub fn assemble_into(
    mut matrix: Option<&mut DistributedCsr>,
    mut rhs: Option<&mut DistributedVector>,
    assembler: &dyn ElementSystemAssembler,
) -> eyre::Result<()> {
    let mut equation_ids = Vec::new();
    let mut local_matrix = DMatrix::zeros(0, 0);
    let mut local_rhs = DVector::zeros(0);

    for element_index in 0..assembler.num_elements() {
        if !assembler.element_is_active(element_index) {
            continue;
        }
        let dof_count = assembler.element_dof_count(element_index);
        equation_ids.resize(dof_count, usize::MAX);
        assembler.populate_element_equation_ids(&mut equation_ids, element_index);

        match (matrix.as_deref_mut(), rhs.as_deref_mut()) {
            (Some(matrix), Some(rhs)) => {
                local_matrix.resize_mut(dof_count, dof_count, 0.0);
                local_rhs.resize_vertically_mut(dof_count, 0.0);
                assembler.assemble_element_system_into(
                    element_index,
                    DMatrixViewMut::from(&mut local_matrix),
                    DVectorViewMut::from(&mut local_rhs),
                )?;
                add_local_matrix(matrix, &equation_ids, &local_matrix)?;
                add_local_vector(rhs, &equation_ids, &local_rhs);
            }
            (Some(matrix), None) => {
                local_matrix.resize_mut(dof_count, dof_count, 0.0);
                assembler.assemble_element_lhs_into(
                    element_index,
                    DMatrixViewMut::from(&mut local_matrix),
                )?;
                add_local_matrix(matrix, &equation_ids, &local_matrix)?;
            }
            (None, Some(rhs)) => {
                local_rhs.resize_vertically_mut(dof_count, 0.0);
                assembler.assemble_element_rhs_into(
                    element_index,
                    DVectorViewMut::from(&mut local_rhs),
                )?;
                add_local_vector(rhs, &equation_ids, &local_rhs);
            }
            (None, None) => {}
        }
    }
    Ok(())
}

/// Parallel variant of [`assemble_into`]: element contributions are computed
/// concurrently (elements write disjoint local buffers) and scattered
/// serially in element order, so the accumulation order — and therefore the
/// floating point result — matches the serial path.
pub fn par_assemble_into(
    matrix: &mut DistributedCsr,
    rhs: &mut DistributedVector,
    assembler: &(dyn ElementSystemAssembler + Sync),
) -> eyre::Result<()> {
    type LocalSystem = (Vec<usize>, DMatrix<f64>, DVector<f64>);

    let contributions: Vec<Option<LocalSystem>> = (0..assembler.num_elements())
        .into_par_iter()
        .map(|element_index| -> eyre::Result<Option<LocalSystem>> {
            if !assembler.element_is_active(element_index) {
                return Ok(None);
            }
            let dof_count = assembler.element_dof_count(element_index);
            let mut equation_ids = vec![usize::MAX; dof_count];
            assembler.populate_element_equation_ids(&mut equation_ids, element_index);
            let mut local_matrix = DMatrix::zeros(dof_count, dof_count);
            let mut local_rhs = DVector::zeros(dof_count);
            assembler.assemble_element_system_into(
                element_index,
                DMatrixViewMut::from(&mut local_matrix),
                DVectorViewMut::from(&mut local_rhs),
            )?;
            Ok(Some((equation_ids, local_matrix, local_rhs)))
        })
        .collect::<eyre::Result<_>>()?;

    for (equation_ids, local_matrix, local_rhs) in contributions.into_iter().flatten() {
        add_local_matrix(matrix, &equation_ids, &local_matrix)?;
        add_local_vector(rhs, &equation_ids, &local_rhs);
    }
    Ok(())
}
