//! Stabilization parameters for convection-diffusion-reaction transport.
//!
//! All quantities here are deterministic functions of floating point inputs
//! with a fixed accumulation order, so repeated evaluation at equal inputs is
//! bit-for-bit reproducible. This matters: the same values feed both the
//! primal residual and its derivative propagation, and the two must agree.
use crate::context::TimeIntegration;
use nalgebra::{DMatrix, DVector};

/// All stabilization quantities evaluated at one integration point.
#[derive(Debug, Clone, Copy)]
pub struct StabilizationState {
    pub tau: f64,
    /// Streamline element length `2 |u| / sqrt(u^T G u)`.
    ///
    /// Zero when the convective contribution vanishes; see
    /// [`stabilization_tau`] for the singularity discussion.
    pub element_length: f64,
    /// Reaction augmented by the transient Bossak contribution.
    pub reaction_tilde: f64,
    pub chi: f64,
    pub psi_one: f64,
    pub psi_two: f64,
    /// Streamline diffusion weight, clamped non-negative.
    pub k1: f64,
    /// Cross-wind diffusion weight, clamped non-negative.
    pub k2: f64,
}

impl StabilizationState {
    /// Evaluates tau, the element length and the cross-wind parameters from
    /// the local state at an integration point.
    pub fn evaluate(
        velocity: &DVector<f64>,
        metric: &DMatrix<f64>,
        reaction: f64,
        diffusivity: f64,
        time: &TimeIntegration,
    ) -> Self {
        let (tau, element_length) =
            stabilization_tau(velocity, metric, reaction, diffusivity, time.delta_time);
        let velocity_norm = velocity.norm();
        let reaction_tilde = time.dynamic_reaction(reaction);
        let (chi, k1, k2) = cross_wind_parameters(
            velocity_norm,
            tau,
            diffusivity,
            reaction_tilde,
            element_length,
        );
        Self {
            tau,
            element_length,
            reaction_tilde,
            chi,
            psi_one: psi_one(velocity_norm, tau, reaction_tilde),
            psi_two: psi_two(reaction_tilde, tau, element_length),
            k1,
            k2,
        }
    }
}

/// Computes the stabilization parameter tau and the streamline element
/// length from the contravariant metric tensor `G` of the element.
///
/// ```text
/// tau = 1 / sqrt( (2/dt)^2 + u^T G u + (3 k)^2 |G|_F + s^2 )
/// h   = 2 |u| / sqrt(u^T G u)
/// ```
///
/// The element length is ill-defined when the convective contribution
/// `u^T G u` vanishes (zero velocity). Rather than propagating NaN, this
/// returns `h = 0` in that case; callers that need the cross-wind path must
/// guard on the velocity magnitude first, since a zero length makes the
/// cross-wind parameters meaningless.
pub fn stabilization_tau(
    velocity: &DVector<f64>,
    metric: &DMatrix<f64>,
    reaction: f64,
    diffusivity: f64,
    delta_time: f64,
) -> (f64, f64) {
    let stab_convection = (metric * velocity).dot(velocity);
    let stab_diffusion = (3.0 * diffusivity).powi(2) * metric.norm();
    let stab_dynamics = (2.0 / delta_time).powi(2);
    let stab_reaction = reaction.powi(2);

    let tau = 1.0 / (stab_dynamics + stab_convection + stab_diffusion + stab_reaction).sqrt();
    let element_length = if stab_convection > f64::EPSILON {
        2.0 * velocity.norm() / stab_convection.sqrt()
    } else {
        0.0
    };
    (tau, element_length)
}

pub fn psi_one(velocity_norm: f64, tau: f64, reaction_tilde: f64) -> f64 {
    velocity_norm + tau * velocity_norm * reaction_tilde
}

pub fn psi_two(reaction_tilde: f64, tau: f64, element_length: f64) -> f64 {
    (reaction_tilde + tau * reaction_tilde * reaction_tilde.abs()) * element_length.powi(2) / 6.0
}

/// Computes the positivity parameter chi and the streamline (`k1`) and
/// cross-wind (`k2`) diffusion weights.
pub fn cross_wind_parameters(
    velocity_norm: f64,
    tau: f64,
    diffusivity: f64,
    reaction_tilde: f64,
    element_length: f64,
) -> (f64, f64, f64) {
    let chi = 2.0 / (reaction_tilde.abs() * element_length + 2.0 * velocity_norm);

    let psi_one = psi_one(velocity_norm, tau, reaction_tilde);
    let psi_two = psi_two(reaction_tilde, tau, element_length);

    let mut value =
        0.5 * (psi_one - tau * velocity_norm * reaction_tilde).abs() * element_length;
    value -= diffusivity + tau * velocity_norm.powi(2);
    value += psi_two;
    let k1 = value.max(0.0);

    let mut value = 0.5 * psi_one.abs() * element_length;
    value -= diffusivity;
    value += psi_two;
    let k2 = value.max(0.0);

    (chi, k1, k2)
}
