//! The block builder-and-solver: drives dof numbering, graph construction,
//! assembly, Dirichlet elimination and the linear solve for one partition
//! of a distributed run.
//!
//! "Block" refers to the numbering convention: every collected dof receives
//! an equation id, fixed or not, and Dirichlet conditions are enforced by
//! row/column elimination on the assembled system rather than by removing
//! rows from it. The eliminated rows keep their assembled diagonal entry
//! (scaled by nothing), which keeps the elimination idempotent and the
//! matrix scale intact.
use crate::assembly::global::{assemble_into, par_assemble_into};
use crate::assembly::ElementSystemAssembler;
use crate::comm::Communicator;
use crate::context::FieldId;
use crate::dof::DofSet;
use crate::error::{Error, Result};
use crate::mesh::{FieldStore, Mesh};
use crate::solver::LinearSolver;
use crate::sparse::{ColumnImporter, DistributedCsr, DistributedVector, GraphBuilder, RowLayout};
use log::warn;

/// The assembled distributed system of one solution step.
#[derive(Debug)]
pub struct GlobalSystem {
    pub matrix: DistributedCsr,
    /// Solution increment.
    pub dx: DistributedVector,
    /// Residual / right-hand side.
    pub rhs: DistributedVector,
}

pub struct BlockBuilderAndSolver<S> {
    solver: S,
    system: Option<GlobalSystem>,
}

/// Recovers the typed classification of an assembly failure; anything that
/// is not one of our own errors is treated as a consistency defect.
fn classify(report: eyre::Report) -> Error {
    report
        .downcast::<Error>()
        .unwrap_or_else(|other| Error::Consistency(format!("{other:#}")))
}

impl<S: LinearSolver> BlockBuilderAndSolver<S> {
    pub fn new(solver: S) -> Self {
        Self {
            solver,
            system: None,
        }
    }

    pub fn system(&self) -> Option<&GlobalSystem> {
        self.system.as_ref()
    }

    pub fn system_mut(&mut self) -> Option<&mut GlobalSystem> {
        self.system.as_mut()
    }

    fn system_or_error(&mut self) -> Result<&mut GlobalSystem> {
        self.system.as_mut().ok_or_else(|| {
            Error::Configuration(
                "no global system allocated; call resize_and_initialize first".to_string(),
            )
        })
    }

    /// Collects the dof set of this partition from the mesh.
    pub fn set_up_dof_set(
        &self,
        dofs: &mut DofSet,
        mesh: &Mesh,
        fields: &[FieldId],
    ) -> Result<()> {
        dofs.collect(mesh, fields)?;
        if dofs.is_empty() {
            return Err(Error::Configuration(
                "no degrees of freedom on this partition".to_string(),
            ));
        }
        Ok(())
    }

    /// Assigns globally unique equation ids. Collective.
    pub fn set_up_system(&self, dofs: &mut DofSet, comm: &dyn Communicator) -> Result<()> {
        dofs.assign_equation_ids(comm)
    }

    /// Builds the sparsity graph from the element connectivities and
    /// allocates the matrix and vectors. Collective.
    pub fn resize_and_initialize(
        &mut self,
        dofs: &DofSet,
        assemblers: &[&dyn ElementSystemAssembler],
        comm: &dyn Communicator,
    ) -> Result<()> {
        let layout = RowLayout::gather(comm, dofs.owned_count());
        if layout.global_size() != dofs.global_size() {
            return Err(Error::Consistency(format!(
                "row layout has {} global rows but the dof set numbered {}",
                layout.global_size(),
                dofs.global_size()
            )));
        }

        let mut graph = GraphBuilder::new(layout.clone(), comm.rank());
        let mut equation_ids = Vec::new();
        for assembler in assemblers {
            for element_index in 0..assembler.num_elements() {
                let dof_count = assembler.element_dof_count(element_index);
                equation_ids.resize(dof_count, usize::MAX);
                assembler.populate_element_equation_ids(&mut equation_ids, element_index);
                graph.insert_connectivity(&equation_ids);
            }
        }
        let matrix = graph.global_assemble(comm);

        self.system = Some(GlobalSystem {
            matrix,
            dx: DistributedVector::new(layout.clone(), comm.rank()),
            rhs: DistributedVector::new(layout, comm.rank()),
        });
        Ok(())
    }

    /// Assembles matrix and right-hand side from every owned, active element
    /// and condition, then merges cross-partition contributions. Collective.
    pub fn build(
        &mut self,
        assemblers: &[&dyn ElementSystemAssembler],
        comm: &dyn Communicator,
    ) -> Result<()> {
        let system = self.system_or_error()?;
        system.matrix.fill_zero();
        system.rhs.fill(0.0);
        for assembler in assemblers {
            assemble_into(Some(&mut system.matrix), Some(&mut system.rhs), *assembler)
                .map_err(classify)?;
        }
        system.matrix.global_assemble(comm)?;
        system.rhs.global_assemble(comm);
        Ok(())
    }

    /// [`BlockBuilderAndSolver::build`] with element contributions computed
    /// in parallel on each partition.
    pub fn par_build(
        &mut self,
        assemblers: &[&(dyn ElementSystemAssembler + Sync)],
        comm: &dyn Communicator,
    ) -> Result<()> {
        let system = self.system_or_error()?;
        system.matrix.fill_zero();
        system.rhs.fill(0.0);
        for assembler in assemblers {
            par_assemble_into(&mut system.matrix, &mut system.rhs, *assembler)
                .map_err(classify)?;
        }
        system.matrix.global_assemble(comm)?;
        system.rhs.global_assemble(comm);
        Ok(())
    }

    /// Matrix-only build. Collective.
    pub fn build_lhs(
        &mut self,
        assemblers: &[&dyn ElementSystemAssembler],
        comm: &dyn Communicator,
    ) -> Result<()> {
        let system = self.system_or_error()?;
        system.matrix.fill_zero();
        for assembler in assemblers {
            assemble_into(Some(&mut system.matrix), None, *assembler)
                .map_err(classify)?;
        }
        system.matrix.global_assemble(comm)?;
        Ok(())
    }

    /// Right-hand-side-only build. Collective.
    pub fn build_rhs(
        &mut self,
        assemblers: &[&dyn ElementSystemAssembler],
        comm: &dyn Communicator,
    ) -> Result<()> {
        let system = self.system_or_error()?;
        system.rhs.fill(0.0);
        for assembler in assemblers {
            assemble_into(None, Some(&mut system.rhs), *assembler)
                .map_err(classify)?;
        }
        system.rhs.global_assemble(comm);
        Ok(())
    }

    /// Eliminates fixed dofs from the assembled system: fixed rows keep only
    /// their diagonal entry and get a zero right-hand side; free rows zero
    /// every coefficient in a fixed column so the eliminated unknowns
    /// decouple symmetrically. Idempotent. Collective (ghost column fixity
    /// is imported from the owning partitions).
    pub fn apply_dirichlet_conditions(
        &mut self,
        dofs: &DofSet,
        comm: &dyn Communicator,
    ) -> Result<()> {
        let rank = comm.rank();
        let system = self.system_or_error()?;
        let first = system.matrix.first_row();
        let local_size = system.matrix.local_size();

        // Fixity of owned rows, indexed by local row.
        let mut fixed = vec![false; local_size];
        for dof in dofs.dofs().iter().filter(|dof| dof.owner == rank) {
            let id = dof.equation_id().ok_or_else(|| {
                Error::Consistency(format!("dof of node {} has no equation id", dof.node_id))
            })?;
            fixed[id - first] = dof.fixed;
        }

        // Every partition must also classify its ghost columns, so fixity is
        // shipped through the same import path as vector values.
        let mut flags = DistributedVector::new(system.rhs.layout().clone(), rank);
        for (local_row, &is_fixed) in fixed.iter().enumerate() {
            flags.owned_mut()[local_row] = if is_fixed { 1.0 } else { 0.0 };
        }
        let importer = ColumnImporter::from_matrix(&system.matrix);
        let ghost_flags = importer.import(&flags, comm)?;
        let column_is_fixed = |col: usize| -> bool {
            if col >= first && col < first + local_size {
                fixed[col - first]
            } else {
                ghost_flags[importer
                    .position(col)
                    .expect("ghost column missing from importer")]
                    != 0.0
            }
        };

        for local_row in 0..local_size {
            let row_id = first + local_row;
            let row_is_fixed = fixed[local_row];
            let (columns, values) = system.matrix.row_mut(local_row);
            if row_is_fixed {
                for (&col, value) in columns.iter().zip(values.iter_mut()) {
                    if col != row_id {
                        *value = 0.0;
                    }
                }
                system.rhs.owned_mut()[local_row] = 0.0;
            } else {
                for (&col, value) in columns.iter().zip(values.iter_mut()) {
                    if column_is_fixed(col) {
                        *value = 0.0;
                    }
                }
            }
        }
        Ok(())
    }

    /// Solves the assembled system. A zero right-hand side is not an error:
    /// the increment is set to zero and the solver is never invoked.
    pub fn solve_with_physics(
        &mut self,
        dofs: &DofSet,
        mesh: &Mesh,
        comm: &dyn Communicator,
    ) -> Result<()> {
        let system = self.system.as_mut().ok_or_else(|| {
            Error::Configuration(
                "no global system allocated; call resize_and_initialize first".to_string(),
            )
        })?;
        let rhs_norm = system.rhs.two_norm(comm);
        if rhs_norm == 0.0 {
            system.dx.fill(0.0);
            warn!("right-hand side norm is zero; setting the increment to zero without solving");
            return Ok(());
        }

        if self.solver.additional_physical_data_is_needed() {
            self.solver
                .provide_additional_data(&system.matrix, &system.dx, &system.rhs, dofs, mesh);
        }
        self.solver
            .solve(&system.matrix, &mut system.dx, &system.rhs, comm)
    }

    /// Build, eliminate, solve. Collective.
    pub fn build_and_solve(
        &mut self,
        dofs: &DofSet,
        mesh: &Mesh,
        assemblers: &[&dyn ElementSystemAssembler],
        comm: &dyn Communicator,
    ) -> Result<()> {
        self.build(assemblers, comm)?;
        self.apply_dirichlet_conditions(dofs, comm)?;
        self.solve_with_physics(dofs, mesh, comm)
    }

    /// Re-uses the previously built matrix and only refreshes the
    /// right-hand side before solving. Collective.
    pub fn build_rhs_and_solve(
        &mut self,
        dofs: &DofSet,
        mesh: &Mesh,
        assemblers: &[&dyn ElementSystemAssembler],
        comm: &dyn Communicator,
    ) -> Result<()> {
        self.build_rhs(assemblers, comm)?;
        self.solve_with_physics(dofs, mesh, comm)
    }

    /// Recovers reactions: rebuilds only the right-hand side, imports the
    /// entry of every collected dof (owned or ghost) from the owning
    /// partition and stores its negation in the reaction field.
    pub fn calculate_reactions(
        &mut self,
        dofs: &DofSet,
        assemblers: &[&dyn ElementSystemAssembler],
        store: &mut FieldStore,
        reaction_field: FieldId,
        comm: &dyn Communicator,
    ) -> Result<()> {
        // Reactions need a scalar slot per node; a missing or vector-typed
        // slot is a setup defect, checked only in debug builds.
        #[cfg(debug_assertions)]
        if store.components(reaction_field) != Some(1) {
            return Err(Error::Configuration(format!(
                "reaction field slot {} has no scalar storage",
                reaction_field.index()
            )));
        }

        self.build_rhs(assemblers, comm)?;
        let system = self.system_or_error()?;

        let mut wanted: Vec<usize> = Vec::with_capacity(dofs.len());
        for dof in dofs.dofs() {
            wanted.push(dof.equation_id().ok_or_else(|| {
                Error::Consistency(format!("dof of node {} has no equation id", dof.node_id))
            })?);
        }
        let mut unique = wanted.clone();
        unique.sort_unstable();
        unique.dedup();

        // Fewer globally visible dofs than equations means the numbering and
        // the collection disagree; that is a numbering defect, not something
        // to retry.
        let globally_visible = comm.sum_all_usize(unique.len());
        if globally_visible < dofs.global_size() {
            return Err(Error::Consistency(format!(
                "dof count is not correct: expected {} active dofs, found {}",
                dofs.global_size(),
                globally_visible
            )));
        }

        let values = system.rhs.import(&wanted, comm)?;
        for (dof, value) in dofs.dofs().iter().zip(values) {
            store.set_scalar(reaction_field, dof.node, 0, -value);
        }
        Ok(())
    }
}
