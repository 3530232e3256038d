use garm::context::TimeIntegration;
use garm::stabilization::{cross_wind_parameters, stabilization_tau, StabilizationState};
use nalgebra::{DMatrix, DVector};
use proptest::prelude::*;

fn finite_positive() -> impl Strategy<Value = f64> {
    // Spread over several orders of magnitude without hitting overflow.
    (-6.0f64..6.0).prop_map(|exponent| 10.0f64.powf(exponent))
}

proptest! {
    /// Positivity: tau is strictly positive and the diffusion weights are
    /// non-negative for any finite positive input combination.
    #[test]
    fn tau_is_positive_and_weights_are_clamped(
        ux in -100.0f64..100.0,
        uy in -100.0f64..100.0,
        reaction in finite_positive(),
        diffusivity in finite_positive(),
        delta_time in finite_positive(),
        metric_scale in finite_positive(),
    ) {
        let velocity = DVector::from_vec(vec![ux, uy]);
        let metric = DMatrix::identity(2, 2) * metric_scale;
        let (tau, element_length) =
            stabilization_tau(&velocity, &metric, reaction, diffusivity, delta_time);
        prop_assert!(tau > 0.0);
        prop_assert!(tau.is_finite());
        prop_assert!(element_length >= 0.0);

        let time = TimeIntegration {
            delta_time,
            bossak_alpha: -0.3,
            newmark_gamma: 0.5,
        };
        let state =
            StabilizationState::evaluate(&velocity, &metric, reaction, diffusivity, &time);
        prop_assert!(state.k1 >= 0.0);
        prop_assert!(state.k2 >= 0.0);
    }

    /// The element length is the diameter induced by the metric: scaling
    /// the metric by c scales the length by 1/sqrt(c).
    #[test]
    fn element_length_scales_with_the_metric(
        ux in 1.0f64..50.0,
        uy in -50.0f64..50.0,
        metric_scale in 0.01f64..100.0,
    ) {
        let velocity = DVector::from_vec(vec![ux, uy]);
        let unit_metric = DMatrix::identity(2, 2);
        let scaled_metric = DMatrix::identity(2, 2) * metric_scale;
        let (_, h_unit) = stabilization_tau(&velocity, &unit_metric, 1.0, 0.1, 0.1);
        let (_, h_scaled) = stabilization_tau(&velocity, &scaled_metric, 1.0, 0.1, 0.1);
        let expected = h_unit / metric_scale.sqrt();
        prop_assert!((h_scaled - expected).abs() <= 1e-9 * expected.abs().max(1.0));
    }
}

#[test]
fn tau_matches_the_closed_form_on_the_identity_metric() {
    let velocity = DVector::from_vec(vec![3.0, 4.0]);
    let metric = DMatrix::identity(2, 2);
    let (tau, element_length) = stabilization_tau(&velocity, &metric, 2.0, 0.5, 0.1);

    let stab_dynamics = (2.0f64 / 0.1).powi(2);
    let stab_convection = 25.0;
    let stab_diffusion = (1.5f64).powi(2) * 2.0f64.sqrt();
    let stab_reaction = 4.0;
    let expected =
        1.0 / (stab_dynamics + stab_convection + stab_diffusion + stab_reaction).sqrt();
    assert!((tau - expected).abs() < 1e-15);
    assert!((element_length - 2.0).abs() < 1e-14);
}

#[test]
fn cross_wind_weights_reduce_to_hand_computed_values() {
    // With tau = 0 and reaction_tilde = 0 the weights collapse to
    // max(0, |u| h / 2 - nu) and chi to 1 / |u|.
    let (chi, k1, k2) = cross_wind_parameters(2.0, 0.0, 0.5, 0.0, 1.0);
    assert!((chi - 0.5).abs() < 1e-15);
    assert!((k1 - 0.5).abs() < 1e-15);
    assert!((k2 - 0.5).abs() < 1e-15);
}
