use crate::unit_tests::fixtures::{
    reference_model, two_triangles_partition, two_triangles_serial, Setup,
};
use garm::assembly::local::CdrElementAssembler;
use garm::builder::BlockBuilderAndSolver;
use garm::comm::{ChannelComm, Communicator, SerialComm};
use garm::dof::DofSet;
use garm::error::Result;
use garm::mesh::FieldStore;
use garm::physics::{ConvectionDiffusionReaction, LinearCdrModel};
use garm::solver::{BiCgStab, LinearSolver};
use garm::sparse::{DistributedCsr, DistributedVector};
use matrixcompare::assert_matrix_eq;
use nalgebra::DMatrix;
use std::thread;

/// A solver that must never be reached; used to verify the degenerate
/// zero right-hand-side path.
struct UnreachableSolver;

impl LinearSolver for UnreachableSolver {
    fn solve(
        &mut self,
        _matrix: &DistributedCsr,
        _solution: &mut DistributedVector,
        _rhs: &DistributedVector,
        _comm: &dyn Communicator,
    ) -> Result<()> {
        panic!("the solver must not be invoked for a zero right-hand side");
    }
}

fn build_system<M: ConvectionDiffusionReaction, S: LinearSolver>(
    setup: &Setup,
    model: &M,
    dofs: &mut DofSet,
    comm: &dyn Communicator,
    solver: S,
) -> BlockBuilderAndSolver<S> {
    let mut builder = BlockBuilderAndSolver::new(solver);
    builder
        .set_up_dof_set(dofs, &setup.mesh, &[setup.fields.scalar])
        .unwrap();
    builder.set_up_system(dofs, comm).unwrap();
    let assembler = CdrElementAssembler::new(
        &setup.mesh,
        &setup.store,
        setup.fields,
        model,
        &setup.context,
        dofs,
    );
    builder
        .resize_and_initialize(dofs, &[&assembler], comm)
        .unwrap();
    builder.build(&[&assembler], comm).unwrap();
    builder
}

fn owned_rows_dense(builder: &BlockBuilderAndSolver<impl LinearSolver>) -> DMatrix<f64> {
    DMatrix::from(&builder.system().unwrap().matrix.to_csr())
}

#[test]
fn serial_build_assembles_both_elements() {
    let setup = two_triangles_serial();
    let model = reference_model();
    let mut dofs = DofSet::new();
    let builder = build_system(&setup, &model, &mut dofs, &SerialComm, BiCgStab::default());

    let dense = owned_rows_dense(&builder);
    assert_eq!(dense.nrows(), 4);
    // Nodes 0 and 3 never share an element, so their coupling is absent
    // from the pattern and the assembled values.
    assert_eq!(dense[(0, 3)], 0.0);
    assert_eq!(dense[(3, 0)], 0.0);
    assert!(dense[(1, 1)].abs() > 0.0);
}

#[test]
fn parallel_element_loop_matches_the_serial_build() {
    let setup = two_triangles_serial();
    let model = reference_model();
    let mut dofs = DofSet::new();
    let mut builder = build_system(&setup, &model, &mut dofs, &SerialComm, BiCgStab::default());
    let serial_dense = owned_rows_dense(&builder);
    let serial_rhs = builder.system().unwrap().rhs.owned().to_vec();

    let assembler = CdrElementAssembler::new(
        &setup.mesh,
        &setup.store,
        setup.fields,
        &model,
        &setup.context,
        &dofs,
    );
    builder.par_build(&[&assembler], &SerialComm).unwrap();
    let parallel_dense = owned_rows_dense(&builder);
    let parallel_rhs = builder.system().unwrap().rhs.owned().to_vec();

    assert_matrix_eq!(serial_dense, parallel_dense, comp = abs, tol = 1e-14);
    for (serial, parallel) in serial_rhs.iter().zip(&parallel_rhs) {
        assert!((serial - parallel).abs() < 1e-14);
    }
}

#[test]
fn inactive_elements_are_skipped() {
    let mut setup = two_triangles_serial();
    setup.mesh.cells_mut()[1].active = false;
    let model = reference_model();
    let mut dofs = DofSet::new();
    let builder = build_system(&setup, &model, &mut dofs, &SerialComm, BiCgStab::default());

    let dense = owned_rows_dense(&builder);
    // Node 3 belongs only to the deactivated element; its row stays empty.
    for col in 0..4 {
        assert_eq!(dense[(3, col)], 0.0);
    }
    assert!(dense[(0, 0)].abs() > 0.0);
}

/// Assembly additivity: the matrix assembled from two partitions with ghost
/// exchange equals the single-partition assembly, entry for entry.
#[test]
fn partitioned_assembly_matches_serial_assembly() {
    let serial_setup = two_triangles_serial();
    let model = reference_model();
    let mut serial_dofs = DofSet::new();
    let serial_builder = build_system(
        &serial_setup,
        &model,
        &mut serial_dofs,
        &SerialComm,
        BiCgStab::default(),
    );
    let serial_dense = owned_rows_dense(&serial_builder);
    let serial_rhs = serial_builder.system().unwrap().rhs.owned().to_vec();

    let group = ChannelComm::create_group(2);
    let results: Vec<(usize, DMatrix<f64>, Vec<f64>)> = thread::scope(|scope| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                scope.spawn(move || {
                    let setup = two_triangles_partition(comm.rank());
                    let model = reference_model();
                    let mut dofs = DofSet::new();
                    let builder =
                        build_system(&setup, &model, &mut dofs, &comm, BiCgStab::default());
                    let system = builder.system().unwrap();
                    (
                        system.matrix.first_row(),
                        DMatrix::from(&system.matrix.to_csr()),
                        system.rhs.owned().to_vec(),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (first_row, dense, rhs) in &results {
        for local_row in 0..dense.nrows() {
            let global_row = first_row + local_row;
            for col in 0..4 {
                let difference = (dense[(local_row, col)] - serial_dense[(global_row, col)]).abs();
                assert!(
                    difference < 1e-12,
                    "matrix entry ({global_row}, {col}) differs by {difference:e}"
                );
            }
            assert!((rhs[local_row] - serial_rhs[global_row]).abs() < 1e-12);
        }
    }
}

/// Dirichlet elimination is idempotent: applying it twice leaves the system
/// exactly as applying it once.
#[test]
fn dirichlet_application_is_idempotent() {
    let setup = two_triangles_serial();
    let model = reference_model();
    let mut dofs = DofSet::new();
    let mut builder = build_system(&setup, &model, &mut dofs, &SerialComm, BiCgStab::default());
    dofs.set_fixed(0, setup.fields.scalar, true).unwrap();
    dofs.set_fixed(3, setup.fields.scalar, true).unwrap();

    builder.apply_dirichlet_conditions(&dofs, &SerialComm).unwrap();
    let once_dense = owned_rows_dense(&builder);
    let once_rhs = builder.system().unwrap().rhs.owned().to_vec();

    builder.apply_dirichlet_conditions(&dofs, &SerialComm).unwrap();
    let twice_dense = owned_rows_dense(&builder);
    let twice_rhs = builder.system().unwrap().rhs.owned().to_vec();

    assert_eq!(once_rhs, twice_rhs);
    assert_matrix_eq!(once_dense, twice_dense, comp = exact);
}

#[test]
fn dirichlet_elimination_decouples_fixed_and_free_rows() {
    let setup = two_triangles_serial();
    let model = reference_model();
    let mut dofs = DofSet::new();
    let mut builder = build_system(&setup, &model, &mut dofs, &SerialComm, BiCgStab::default());
    let assembled = owned_rows_dense(&builder);
    dofs.set_fixed(0, setup.fields.scalar, true).unwrap();

    builder.apply_dirichlet_conditions(&dofs, &SerialComm).unwrap();
    let dense = owned_rows_dense(&builder);

    // Fixed row: only the diagonal survives, kept at its assembled value;
    // the right-hand side entry is zeroed.
    assert_eq!(dense[(0, 0)], assembled[(0, 0)]);
    for col in 1..4 {
        assert_eq!(dense[(0, col)], 0.0);
    }
    assert_eq!(builder.system().unwrap().rhs.owned()[0], 0.0);
    // Free rows: coefficients in the fixed column are zeroed.
    for row in 1..4 {
        assert_eq!(dense[(row, 0)], 0.0);
    }
    // Everything else is untouched.
    for row in 1..4 {
        for col in 1..4 {
            assert_eq!(dense[(row, col)], assembled[(row, col)]);
        }
    }
}

/// A zero right-hand side must skip the solver and return a zero increment.
#[test]
fn zero_rhs_skips_the_solve() {
    let setup = two_triangles_serial();
    // Zero state and zero source make the residual identically zero.
    let store = FieldStore::with_registry(&setup.context.fields, &setup.mesh, 2);
    let zero_setup = Setup { store, ..setup };
    let model = LinearCdrModel::constant(1.0, 0.5, 0.0);
    let mut dofs = DofSet::new();
    let mut builder = build_system(&zero_setup, &model, &mut dofs, &SerialComm, UnreachableSolver);

    builder
        .solve_with_physics(&dofs, &zero_setup.mesh, &SerialComm)
        .unwrap();
    let dx = builder.system().unwrap().dx.owned();
    assert!(dx.iter().all(|&v| v == 0.0));
}

/// The solved increment satisfies the eliminated system.
#[test]
fn build_and_solve_produces_a_consistent_increment() {
    let setup = two_triangles_serial();
    let model = reference_model();
    let mut dofs = DofSet::new();
    let mut builder = build_system(&setup, &model, &mut dofs, &SerialComm, BiCgStab::default());
    dofs.set_fixed(0, setup.fields.scalar, true).unwrap();

    let assembler = CdrElementAssembler::new(
        &setup.mesh,
        &setup.store,
        setup.fields,
        &model,
        &setup.context,
        &dofs,
    );
    builder
        .build_and_solve(&dofs, &setup.mesh, &[&assembler], &SerialComm)
        .unwrap();

    let system = builder.system().unwrap();
    let dense = DMatrix::from(&system.matrix.to_csr());
    let dx = nalgebra::DVector::from_column_slice(system.dx.owned());
    let rhs = nalgebra::DVector::from_column_slice(system.rhs.owned());
    let residual = &dense * &dx - rhs;
    assert!(
        residual.norm() <= 1e-8 * system.rhs.two_norm(&SerialComm).max(1.0),
        "solve residual too large: {:e}",
        residual.norm()
    );
    // The fixed dof keeps a zero increment.
    assert_eq!(dx[0], 0.0);
}

/// The increment of a partitioned solve agrees with the serial solve.
#[test]
fn partitioned_solve_matches_serial_solve() {
    let serial_setup = two_triangles_serial();
    let model = reference_model();
    let mut serial_dofs = DofSet::new();
    let mut serial_builder = build_system(
        &serial_setup,
        &model,
        &mut serial_dofs,
        &SerialComm,
        BiCgStab::default(),
    );
    serial_dofs
        .set_fixed(0, serial_setup.fields.scalar, true)
        .unwrap();
    let assembler = CdrElementAssembler::new(
        &serial_setup.mesh,
        &serial_setup.store,
        serial_setup.fields,
        &model,
        &serial_setup.context,
        &serial_dofs,
    );
    serial_builder
        .build_and_solve(&serial_dofs, &serial_setup.mesh, &[&assembler], &SerialComm)
        .unwrap();
    let serial_dx = serial_builder.system().unwrap().dx.owned().to_vec();

    let group = ChannelComm::create_group(2);
    let results: Vec<(usize, Vec<f64>)> = thread::scope(|scope| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|comm| {
                scope.spawn(move || {
                    let setup = two_triangles_partition(comm.rank());
                    let model = reference_model();
                    let mut dofs = DofSet::new();
                    let mut builder =
                        build_system(&setup, &model, &mut dofs, &comm, BiCgStab::default());
                    // Global node 0 only exists on rank 0.
                    if comm.rank() == 0 {
                        dofs.set_fixed(0, setup.fields.scalar, true).unwrap();
                    }
                    let assembler = CdrElementAssembler::new(
                        &setup.mesh,
                        &setup.store,
                        setup.fields,
                        &model,
                        &setup.context,
                        &dofs,
                    );
                    builder
                        .build_and_solve(&dofs, &setup.mesh, &[&assembler], &comm)
                        .unwrap();
                    let system = builder.system().unwrap();
                    (system.matrix.first_row(), system.dx.owned().to_vec())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (first_row, dx) in &results {
        for (local, value) in dx.iter().enumerate() {
            let difference = (value - serial_dx[first_row + local]).abs();
            assert!(
                difference < 1e-6,
                "dx[{}] differs by {difference:e}",
                first_row + local
            );
        }
    }
}

/// Reactions are the negated right-hand side entries of the rebuilt
/// residual, gathered per dof across partitions.
#[test]
fn reactions_are_negated_rhs_entries() {
    let setup = two_triangles_serial();
    let model = reference_model();
    let mut dofs = DofSet::new();
    let mut builder = build_system(&setup, &model, &mut dofs, &SerialComm, BiCgStab::default());

    let assembler = CdrElementAssembler::new(
        &setup.mesh,
        &setup.store,
        setup.fields,
        &model,
        &setup.context,
        &dofs,
    );
    let mut store = setup.store.clone();
    builder
        .calculate_reactions(
            &dofs,
            &[&assembler],
            &mut store,
            setup.fields.reaction,
            &SerialComm,
        )
        .unwrap();

    let rhs = builder.system().unwrap().rhs.owned();
    for node in 0..4 {
        let equation_id = dofs.equation_id(node, setup.fields.scalar).unwrap();
        let reaction = store.scalar(setup.fields.reaction, node, 0);
        assert!((reaction + rhs[equation_id]).abs() < 1e-14);
    }
}
