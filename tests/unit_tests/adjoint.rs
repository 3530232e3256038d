//! Finite-difference validation of the analytic residual derivatives.
//!
//! There is no independent closed form for the chained stabilization
//! derivatives, so the contract is: for every residual entry and every
//! perturbed nodal quantity, the analytic derivative must match a central
//! finite difference of the forward residual to a relative tolerance of
//! 1e-5.
use crate::unit_tests::fixtures::{reference_model, single_triangle, Setup};
use garm::assembly::local::CdrElementAssembler;
use garm::assembly::ElementSystemAssembler;
use garm::dof::DofSet;
use garm::physics::{ConvectionDiffusionReaction, LinearCdrModel};
use nalgebra::{DMatrix, DMatrixViewMut, DVector, DVectorViewMut};

const STEP: f64 = 1e-7;
const RELATIVE_TOLERANCE: f64 = 1e-5;

fn element_residual<M: ConvectionDiffusionReaction>(setup: &Setup, model: &M) -> DVector<f64> {
    let dofs = DofSet::new();
    let assembler = CdrElementAssembler::new(
        &setup.mesh,
        &setup.store,
        setup.fields,
        model,
        &setup.context,
        &dofs,
    );
    let mut rhs = DVector::zeros(3);
    assembler
        .assemble_element_rhs_into(0, DVectorViewMut::from(&mut rhs))
        .unwrap();
    rhs
}

fn assert_derivative_entry(analytic: f64, finite_difference: f64, label: &str) {
    let tolerance = RELATIVE_TOLERANCE * analytic.abs().max(1.0);
    assert!(
        (analytic - finite_difference).abs() <= tolerance,
        "{label}: analytic {analytic:.10e} vs finite difference {finite_difference:.10e}"
    );
}

fn check_scalar_derivatives<M: ConvectionDiffusionReaction>(setup: &mut Setup, model: &M) {
    let mut analytic = DMatrix::zeros(3, 3);
    {
        let dofs = DofSet::new();
        let assembler = CdrElementAssembler::new(
            &setup.mesh,
            &setup.store,
            setup.fields,
            model,
            &setup.context,
            &dofs,
        );
        assembler
            .scalar_derivatives_into(0, DMatrixViewMut::from(&mut analytic))
            .unwrap();
    }

    let scalar = setup.fields.scalar;
    for c in 0..3 {
        let base = setup.store.scalar(scalar, c, 0);

        setup.store.set_scalar(scalar, c, 0, base + STEP);
        let plus = element_residual(setup, model);
        setup.store.set_scalar(scalar, c, 0, base - STEP);
        let minus = element_residual(setup, model);
        setup.store.set_scalar(scalar, c, 0, base);

        for a in 0..3 {
            let finite_difference = (plus[a] - minus[a]) / (2.0 * STEP);
            assert_derivative_entry(
                analytic[(a, c)],
                finite_difference,
                &format!("dR[{a}]/dphi[{c}]"),
            );
        }
    }
}

fn check_velocity_derivatives<M: ConvectionDiffusionReaction>(setup: &mut Setup, model: &M) {
    let mut analytic = DMatrix::zeros(3, 6);
    {
        let dofs = DofSet::new();
        let assembler = CdrElementAssembler::new(
            &setup.mesh,
            &setup.store,
            setup.fields,
            model,
            &setup.context,
            &dofs,
        );
        assembler
            .velocity_derivatives_into(0, DMatrixViewMut::from(&mut analytic))
            .unwrap();
    }

    let velocity = setup.fields.velocity;
    for c in 0..3 {
        for k in 0..2 {
            let mut base = [0.0; 2];
            base.copy_from_slice(setup.store.vector(velocity, c, 0));

            let mut perturbed = base;
            perturbed[k] = base[k] + STEP;
            setup.store.set_vector(velocity, c, 0, &perturbed);
            let plus = element_residual(setup, model);
            perturbed[k] = base[k] - STEP;
            setup.store.set_vector(velocity, c, 0, &perturbed);
            let minus = element_residual(setup, model);
            setup.store.set_vector(velocity, c, 0, &base);

            for a in 0..3 {
                let finite_difference = (plus[a] - minus[a]) / (2.0 * STEP);
                assert_derivative_entry(
                    analytic[(a, 2 * c + k)],
                    finite_difference,
                    &format!("dR[{a}]/du[{c}][{k}]"),
                );
            }
        }
    }
}

#[test]
fn scalar_derivatives_match_finite_differences() {
    let mut setup = single_triangle();
    let model = reference_model();
    check_scalar_derivatives(&mut setup, &model);
}

#[test]
fn velocity_derivatives_match_finite_differences() {
    let mut setup = single_triangle();
    let model = reference_model();
    check_velocity_derivatives(&mut setup, &model);
}

#[test]
fn derivatives_match_finite_differences_with_constant_coefficients() {
    // With constant coefficients every model chain vanishes and the
    // Jacobian is dominated by the frozen operator plus the residual-driven
    // diffusion chains.
    let mut setup = single_triangle();
    let model = LinearCdrModel::constant(0.8, 1.5, 3.0);
    check_scalar_derivatives(&mut setup, &model);
    check_velocity_derivatives(&mut setup, &model);
}

#[test]
fn derivatives_match_finite_differences_in_the_clamped_regime() {
    // A large diffusivity clamps both diffusion weights to zero; the
    // derivatives must vanish with them rather than follow the unclamped
    // expressions.
    let mut setup = single_triangle();
    let mut model = reference_model();
    model.nu_0 = 200.0;
    check_scalar_derivatives(&mut setup, &model);
    check_velocity_derivatives(&mut setup, &model);
}

#[test]
fn derivative_matrices_have_the_documented_layout() {
    let setup = single_triangle();
    let model = reference_model();
    let dofs = DofSet::new();
    let assembler = CdrElementAssembler::new(
        &setup.mesh,
        &setup.store,
        setup.fields,
        &model,
        &setup.context,
        &dofs,
    );

    let mut scalar = DMatrix::zeros(3, 3);
    assembler
        .scalar_derivatives_into(0, DMatrixViewMut::from(&mut scalar))
        .unwrap();
    let mut velocity = DMatrix::zeros(3, 6);
    assembler
        .velocity_derivatives_into(0, DMatrixViewMut::from(&mut velocity))
        .unwrap();
    // Nothing in the reference state is symmetric, so a fully populated
    // Jacobian is expected.
    assert!(scalar.iter().all(|v| v.is_finite()));
    assert!(velocity.iter().all(|v| v.is_finite()));
    assert!(scalar.iter().any(|v| v.abs() > 0.0));
    assert!(velocity.iter().any(|v| v.abs() > 0.0));
}
