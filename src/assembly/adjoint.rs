//! First-derivative propagation of the stabilized transport residual.
//!
//! For a fixed element and state, [`CdrElementAssembler::scalar_derivatives_into`]
//! and [`CdrElementAssembler::velocity_derivatives_into`] produce the
//! analytic Jacobians of the local residual with respect to the nodal scalar
//! unknowns and the nodal velocities. Every intermediate quantity of the
//! forward evaluation (tau, element length, chi, psi_one, psi_two, the
//! diffusion weights and the positivity coefficient) has exactly one
//! companion derivative routine here that combines the derivatives of its
//! inputs by the product and quotient rules. The forward arithmetic is
//! never restated: where a derivative needs a forward value it reads the
//! value computed by [`GaussPointValues`].
//!
//! There is no closed form to validate these expressions against; the
//! binding contract is agreement with finite differences of the forward
//! residual, which the test suite checks entry by entry.
use crate::assembly::local::{
    assemble_cdr_local, CdrElementAssembler, ElementData, GaussPointValues,
};
use crate::physics::{ConvectionDiffusionReaction, PointBasis};
use crate::quadrature::ElementGeometry;
use nalgebra::{DMatrix, DMatrixViewMut, DVector};

fn sign(value: f64) -> f64 {
    if value >= 0.0 {
        1.0
    } else {
        -1.0
    }
}

/// d|v|/dx from dv/dx, valid away from v = 0; at the kink the right-sided
/// subgradient is used.
fn abs_scalar_derivatives(value: f64, derivatives: &DVector<f64>) -> DVector<f64> {
    derivatives * sign(value)
}

fn abs_velocity_derivatives(value: f64, derivatives: &DMatrix<f64>) -> DMatrix<f64> {
    derivatives * sign(value)
}

/// Derivatives of `tau = (dyn + u^T G u + (3 nu)^2 |G|_F + s^2)^{-1/2}` with
/// respect to the nodal scalars, via the diffusivity and reaction chains.
fn tau_scalar_derivatives(
    tau: f64,
    diffusivity: f64,
    reaction: f64,
    metric: &DMatrix<f64>,
    diffusivity_derivatives: &DVector<f64>,
    reaction_derivatives: &DVector<f64>,
) -> DVector<f64> {
    (diffusivity_derivatives * (18.0 * diffusivity * metric.norm())
        + reaction_derivatives * (2.0 * reaction))
        * (-tau.powi(3) / 2.0)
}

/// Velocity companion of [`tau_scalar_derivatives`]; additionally carries
/// the direct `u^T G u` chain through the interpolated velocity.
fn tau_velocity_derivatives(
    tau: f64,
    diffusivity: f64,
    reaction: f64,
    velocity: &DVector<f64>,
    metric: &DMatrix<f64>,
    diffusivity_derivatives: &DMatrix<f64>,
    reaction_derivatives: &DMatrix<f64>,
    basis: &[f64],
) -> DMatrix<f64> {
    let n = basis.len();
    let dim = velocity.len();
    let metric_velocity = metric * velocity + metric.transpose() * velocity;

    let mut out = DMatrix::zeros(n, dim);
    for c in 0..n {
        for k in 0..dim {
            out[(c, k)] = basis[c] * metric_velocity[k];
        }
    }
    out += diffusivity_derivatives * (18.0 * metric.norm() * diffusivity);
    out += reaction_derivatives * (2.0 * reaction);
    out * (-tau.powi(3) / 2.0)
}

/// `d|u|/du_{c,k} = u_k N_c / |u|`; zero at the (non-differentiable) origin.
fn velocity_magnitude_derivatives(
    velocity_norm: f64,
    velocity: &DVector<f64>,
    basis: &[f64],
) -> DMatrix<f64> {
    let n = basis.len();
    let dim = velocity.len();
    let mut out = DMatrix::zeros(n, dim);
    if velocity_norm <= f64::EPSILON {
        return out;
    }
    for c in 0..n {
        for k in 0..dim {
            out[(c, k)] = velocity[k] * basis[c] / velocity_norm;
        }
    }
    out
}

/// Derivatives of `h = 2 |u| / sqrt(u^T G u)` with respect to the nodal
/// velocities.
fn element_length_velocity_derivatives(
    velocity_norm: f64,
    velocity: &DVector<f64>,
    velocity_magnitude_derivatives: &DMatrix<f64>,
    metric: &DMatrix<f64>,
    basis: &[f64],
) -> DMatrix<f64> {
    let n = basis.len();
    let dim = velocity.len();
    let sqrt_u_g_u = (metric * velocity).dot(velocity).sqrt();
    let mut out = DMatrix::zeros(n, dim);
    if sqrt_u_g_u <= f64::EPSILON {
        return out;
    }
    let metric_velocity = metric * velocity + metric.transpose() * velocity;
    for c in 0..n {
        for k in 0..dim {
            out[(c, k)] = basis[c] * metric_velocity[k];
        }
    }
    out *= -velocity_norm / sqrt_u_g_u.powi(3);
    out + velocity_magnitude_derivatives * (2.0 / sqrt_u_g_u)
}

/// Derivatives of `chi = 2 / (|rt| h + 2 |u|)` through the reaction chain.
fn chi_scalar_derivatives(
    chi: f64,
    element_length: f64,
    reaction_tilde: f64,
    reaction_derivatives: &DVector<f64>,
) -> DVector<f64> {
    abs_scalar_derivatives(reaction_tilde, reaction_derivatives)
        * (-0.5 * chi.powi(2) * element_length)
}

fn chi_velocity_derivatives(
    chi: f64,
    element_length: f64,
    reaction_tilde: f64,
    reaction_derivatives: &DMatrix<f64>,
    velocity_magnitude_derivatives: &DMatrix<f64>,
    element_length_derivatives: &DMatrix<f64>,
) -> DMatrix<f64> {
    let abs_rt_derivatives = abs_velocity_derivatives(reaction_tilde, reaction_derivatives);
    (abs_rt_derivatives * element_length
        + element_length_derivatives * reaction_tilde.abs()
        + velocity_magnitude_derivatives * 2.0)
        * (-0.5 * chi.powi(2))
}

/// Derivatives of the strong residual `rate + u . grad phi + s phi - q` with
/// respect to the nodal scalars.
fn residual_scalar_derivatives(
    scalar: f64,
    reaction: f64,
    convection: &DVector<f64>,
    basis: &[f64],
    reaction_derivatives: &DVector<f64>,
    source_derivatives: &DVector<f64>,
) -> DVector<f64> {
    let n = basis.len();
    let mut out = DVector::zeros(n);
    for c in 0..n {
        out[c] = convection[c] + scalar * reaction_derivatives[c] + reaction * basis[c]
            - source_derivatives[c];
    }
    out
}

fn residual_velocity_derivatives(
    scalar: f64,
    scalar_gradient: &DVector<f64>,
    reaction_derivatives: &DMatrix<f64>,
    source_derivatives: &DMatrix<f64>,
    basis: &[f64],
) -> DMatrix<f64> {
    let n = basis.len();
    let dim = scalar_gradient.len();
    let mut out = DMatrix::zeros(n, dim);
    for c in 0..n {
        for k in 0..dim {
            out[(c, k)] = basis[c] * scalar_gradient[k];
        }
    }
    out + reaction_derivatives * scalar - source_derivatives
}

/// Derivatives of `ppc = |res| chi / (|u|^2 |grad phi|)` with respect to the
/// nodal scalars.
fn positivity_scalar_derivatives(
    chi: f64,
    abs_residual: f64,
    gradient_norm: f64,
    velocity_norm_square: f64,
    chi_derivatives: &DVector<f64>,
    abs_residual_derivatives: &DVector<f64>,
    gradient_norm_derivatives: &DVector<f64>,
) -> DVector<f64> {
    abs_residual_derivatives * (chi / (velocity_norm_square * gradient_norm))
        + chi_derivatives * (abs_residual / (velocity_norm_square * gradient_norm))
        - gradient_norm_derivatives
            * (chi * abs_residual / (gradient_norm.powi(2) * velocity_norm_square))
}

fn positivity_velocity_derivatives(
    chi: f64,
    abs_residual: f64,
    gradient_norm: f64,
    velocity_norm: f64,
    chi_derivatives: &DMatrix<f64>,
    abs_residual_derivatives: &DMatrix<f64>,
    velocity_magnitude_derivatives: &DMatrix<f64>,
) -> DMatrix<f64> {
    let velocity_norm_square = velocity_norm.powi(2);
    (velocity_magnitude_derivatives * (-2.0 * chi / velocity_norm) + chi_derivatives)
        * (abs_residual / (velocity_norm_square * gradient_norm))
        + abs_residual_derivatives * (chi / (gradient_norm * velocity_norm_square))
}

/// Derivatives of `psi_one = |u| + tau |u| rt`.
fn psi_one_scalar_derivatives(
    velocity_norm: f64,
    reaction_tilde: f64,
    tau: f64,
    tau_derivatives: &DVector<f64>,
    reaction_derivatives: &DVector<f64>,
) -> DVector<f64> {
    tau_derivatives * (velocity_norm * reaction_tilde)
        + reaction_derivatives * (tau * velocity_norm)
}

fn psi_one_velocity_derivatives(
    velocity_norm: f64,
    reaction_tilde: f64,
    tau: f64,
    tau_derivatives: &DMatrix<f64>,
    reaction_derivatives: &DMatrix<f64>,
    velocity_magnitude_derivatives: &DMatrix<f64>,
) -> DMatrix<f64> {
    velocity_magnitude_derivatives
        + tau_derivatives * (velocity_norm * reaction_tilde)
        + velocity_magnitude_derivatives * (tau * reaction_tilde)
        + reaction_derivatives * (tau * velocity_norm)
}

/// Derivatives of `psi_two = (rt + tau rt |rt|) h^2 / 6`.
fn psi_two_scalar_derivatives(
    element_length: f64,
    tau: f64,
    reaction_tilde: f64,
    tau_derivatives: &DVector<f64>,
    reaction_derivatives: &DVector<f64>,
    abs_reaction_tilde_derivatives: &DVector<f64>,
) -> DVector<f64> {
    let abs_rt = reaction_tilde.abs();
    (reaction_derivatives
        + tau_derivatives * (reaction_tilde * abs_rt)
        + reaction_derivatives * (tau * abs_rt)
        + abs_reaction_tilde_derivatives * (tau * reaction_tilde))
        * (element_length.powi(2) / 6.0)
}

fn psi_two_velocity_derivatives(
    reaction_tilde: f64,
    tau: f64,
    element_length: f64,
    tau_derivatives: &DMatrix<f64>,
    reaction_derivatives: &DMatrix<f64>,
    abs_reaction_tilde_derivatives: &DMatrix<f64>,
    element_length_derivatives: &DMatrix<f64>,
) -> DMatrix<f64> {
    let abs_rt = reaction_tilde.abs();
    (reaction_derivatives
        + tau_derivatives * (reaction_tilde * abs_rt)
        + reaction_derivatives * (tau * abs_rt)
        + abs_reaction_tilde_derivatives * (tau * reaction_tilde))
        * (element_length.powi(2) / 6.0)
        + element_length_derivatives
            * (element_length * (reaction_tilde + tau * reaction_tilde * abs_rt) / 3.0)
}

/// Derivatives of the streamline diffusion weight
/// `k1 = max(0, 0.5 |psi_one - tau |u| rt| h - (nu + tau |u|^2) + psi_two)`.
///
/// Inside the clamped region the weight is identically zero and so are its
/// derivatives.
#[allow(clippy::too_many_arguments)]
fn stream_line_coeff_scalar_derivatives(
    k1: f64,
    element_length: f64,
    tau: f64,
    velocity_norm: f64,
    reaction_tilde: f64,
    psi_one: f64,
    psi_one_derivatives: &DVector<f64>,
    psi_two_derivatives: &DVector<f64>,
    tau_derivatives: &DVector<f64>,
    reaction_derivatives: &DVector<f64>,
    diffusivity_derivatives: &DVector<f64>,
) -> DVector<f64> {
    if k1 <= 0.0 {
        return DVector::zeros(psi_one_derivatives.len());
    }
    let coeff = psi_one - tau * velocity_norm * reaction_tilde;
    let mut out = psi_one_derivatives
        - tau_derivatives * (velocity_norm * reaction_tilde)
        - reaction_derivatives * (tau * velocity_norm);
    out *= 0.5 * element_length * sign(coeff);
    out += psi_two_derivatives;
    out -= diffusivity_derivatives;
    out -= tau_derivatives * velocity_norm.powi(2);
    out
}

#[allow(clippy::too_many_arguments)]
fn stream_line_coeff_velocity_derivatives(
    k1: f64,
    element_length: f64,
    tau: f64,
    velocity_norm: f64,
    reaction_tilde: f64,
    psi_one: f64,
    velocity_magnitude_derivatives: &DMatrix<f64>,
    psi_one_derivatives: &DMatrix<f64>,
    psi_two_derivatives: &DMatrix<f64>,
    tau_derivatives: &DMatrix<f64>,
    reaction_derivatives: &DMatrix<f64>,
    diffusivity_derivatives: &DMatrix<f64>,
    element_length_derivatives: &DMatrix<f64>,
) -> DMatrix<f64> {
    if k1 <= 0.0 {
        return DMatrix::zeros(psi_one_derivatives.nrows(), psi_one_derivatives.ncols());
    }
    let coeff = psi_one - tau * velocity_norm * reaction_tilde;
    let mut out = psi_one_derivatives
        - tau_derivatives * (velocity_norm * reaction_tilde)
        - velocity_magnitude_derivatives * (tau * reaction_tilde)
        - reaction_derivatives * (tau * velocity_norm);
    out *= 0.5 * element_length * sign(coeff);
    out += element_length_derivatives * (0.5 * coeff.abs());
    out += psi_two_derivatives;
    out -= diffusivity_derivatives;
    out -= tau_derivatives * velocity_norm.powi(2);
    out -= velocity_magnitude_derivatives * (2.0 * tau * velocity_norm);
    out
}

/// Derivatives of the cross-wind diffusion weight
/// `k2 = max(0, 0.5 |psi_one| h - nu + psi_two)`.
fn cross_wind_coeff_scalar_derivatives(
    k2: f64,
    psi_one: f64,
    element_length: f64,
    psi_one_derivatives: &DVector<f64>,
    psi_two_derivatives: &DVector<f64>,
    diffusivity_derivatives: &DVector<f64>,
) -> DVector<f64> {
    if k2 <= 0.0 {
        return DVector::zeros(psi_one_derivatives.len());
    }
    psi_one_derivatives * (0.5 * sign(psi_one) * element_length) - diffusivity_derivatives
        + psi_two_derivatives
}

fn cross_wind_coeff_velocity_derivatives(
    k2: f64,
    psi_one: f64,
    element_length: f64,
    psi_one_derivatives: &DMatrix<f64>,
    psi_two_derivatives: &DMatrix<f64>,
    diffusivity_derivatives: &DMatrix<f64>,
    element_length_derivatives: &DMatrix<f64>,
) -> DMatrix<f64> {
    if k2 <= 0.0 {
        return DMatrix::zeros(psi_one_derivatives.nrows(), psi_one_derivatives.ncols());
    }
    psi_one_derivatives * (0.5 * sign(psi_one) * element_length)
        + element_length_derivatives * (0.5 * psi_one.abs())
        - diffusivity_derivatives
        + psi_two_derivatives
}

impl<'a, M: ConvectionDiffusionReaction> CdrElementAssembler<'a, M> {
    /// Fills `out[(a, c)]` with the analytic derivative of residual entry
    /// `a` with respect to the scalar unknown at node `c`.
    pub fn scalar_derivatives_into(
        &self,
        element_index: usize,
        mut out: DMatrixViewMut<f64>,
    ) -> eyre::Result<()> {
        let geometry = self.element_geometry(element_index)?;
        let data = self.element_data(element_index);
        let n = data.phi.len();
        assert_eq!(out.nrows(), n, "output matrix dimension mismatch");
        assert_eq!(out.ncols(), n, "output matrix dimension mismatch");
        out.fill(0.0);

        self.add_scalar_derivative_chains(&geometry, &data, &mut out);

        // Frozen-coefficient part: the residual is F - D phi, so the damping
        // operator enters the Jacobian with a minus sign.
        let mut damping = DMatrix::zeros(n, n);
        assemble_cdr_local(
            &geometry,
            &data,
            self.model,
            self.context,
            Some(DMatrixViewMut::from(&mut damping)),
            None,
        );
        for a in 0..n {
            for c in 0..n {
                out[(a, c)] -= damping[(a, c)];
            }
        }
        Ok(())
    }

    fn add_scalar_derivative_chains(
        &self,
        geometry: &ElementGeometry,
        data: &ElementData,
        out: &mut DMatrixViewMut<f64>,
    ) {
        let n = data.phi.len();
        for g in 0..geometry.num_points() {
            let values = GaussPointValues::evaluate(geometry, data, self.model, self.context, g);
            let gradients = &geometry.shape_gradients[g];
            let weight = geometry.weights[g];
            let state = values.point_state();
            let basis = PointBasis {
                values: &values.basis,
                gradients,
            };

            let mut diffusivity_derivatives = DVector::zeros(n);
            let mut reaction_derivatives = DVector::zeros(n);
            let mut source_derivatives = DVector::zeros(n);
            self.model.effective_diffusivity_scalar_derivatives(
                &mut diffusivity_derivatives,
                &state,
                &basis,
                self.context,
            );
            self.model.reaction_scalar_derivatives(
                &mut reaction_derivatives,
                &state,
                &basis,
                self.context,
            );
            self.model.source_scalar_derivatives(
                &mut source_derivatives,
                &state,
                &basis,
                self.context,
            );

            let stab = &values.stabilization;
            let tau_derivatives = tau_scalar_derivatives(
                stab.tau,
                values.diffusivity,
                values.reaction,
                &geometry.metric_tensors[g],
                &diffusivity_derivatives,
                &reaction_derivatives,
            );
            let s_abs = values.reaction.abs();
            let s_derivatives = abs_scalar_derivatives(values.reaction, &reaction_derivatives);
            let abs_reaction_tilde_derivatives =
                abs_scalar_derivatives(stab.reaction_tilde, &reaction_derivatives);

            let velocity_norm = values.velocity.norm();
            let velocity_norm_square = values.velocity.norm_squared();
            let gradient_norm = values.scalar_gradient.norm();
            let u_dot_grad_phi = values.velocity.dot(&values.scalar_gradient);
            let relaxed_rate = values.relaxed_rate;

            // The positivity-preservation chains are only defined where the
            // cross-wind guard admits them in the forward evaluation.
            let (positivity_derivatives, k1_derivatives, k2_derivatives) =
                if values.cross_wind_active {
                    let chi_derivatives = chi_scalar_derivatives(
                        stab.chi,
                        stab.element_length,
                        stab.reaction_tilde,
                        &reaction_derivatives,
                    );
                    let gradient_norm_derivatives = &values.scalar_convection / gradient_norm;
                    let res_derivatives = residual_scalar_derivatives(
                        values.scalar,
                        values.reaction,
                        &values.convection,
                        &values.basis,
                        &reaction_derivatives,
                        &source_derivatives,
                    );
                    let abs_res_derivatives =
                        abs_scalar_derivatives(values.residual, &res_derivatives);
                    let positivity_derivatives = positivity_scalar_derivatives(
                        stab.chi,
                        values.residual.abs(),
                        gradient_norm,
                        velocity_norm_square,
                        &chi_derivatives,
                        &abs_res_derivatives,
                        &gradient_norm_derivatives,
                    );
                    let psi_one_d = psi_one_scalar_derivatives(
                        velocity_norm,
                        stab.reaction_tilde,
                        stab.tau,
                        &tau_derivatives,
                        &reaction_derivatives,
                    );
                    let psi_two_d = psi_two_scalar_derivatives(
                        stab.element_length,
                        stab.tau,
                        stab.reaction_tilde,
                        &tau_derivatives,
                        &reaction_derivatives,
                        &abs_reaction_tilde_derivatives,
                    );
                    let k1_derivatives = stream_line_coeff_scalar_derivatives(
                        stab.k1,
                        stab.element_length,
                        stab.tau,
                        velocity_norm,
                        stab.reaction_tilde,
                        stab.psi_one,
                        &psi_one_d,
                        &psi_two_d,
                        &tau_derivatives,
                        &reaction_derivatives,
                        &diffusivity_derivatives,
                    );
                    let k2_derivatives = cross_wind_coeff_scalar_derivatives(
                        stab.k2,
                        stab.psi_one,
                        stab.element_length,
                        &psi_one_d,
                        &psi_two_d,
                        &diffusivity_derivatives,
                    );
                    (positivity_derivatives, k1_derivatives, k2_derivatives)
                } else {
                    (DVector::zeros(n), DVector::zeros(n), DVector::zeros(n))
                };

            for a in 0..n {
                let supg_test = values.convection[a] + s_abs * values.basis[a];
                for c in 0..n {
                    // Coefficient chains of the damping operator applied to
                    // the current state.
                    let mut value = 0.0;

                    value += values.scalar_convection[a] * diffusivity_derivatives[c];
                    value += values.basis[a] * reaction_derivatives[c] * values.scalar;

                    value += tau_derivatives[c] * supg_test * u_dot_grad_phi;
                    value += stab.tau * s_derivatives[c] * values.basis[a] * u_dot_grad_phi;

                    value += tau_derivatives[c] * supg_test * values.reaction * values.scalar;
                    value += stab.tau
                        * s_derivatives[c]
                        * values.basis[a]
                        * values.reaction
                        * values.scalar;
                    value += stab.tau * supg_test * reaction_derivatives[c] * values.scalar;

                    value += positivity_derivatives[c]
                        * stab.k2
                        * values.scalar_convection[a]
                        * velocity_norm_square;
                    value += values.positivity_coeff
                        * k2_derivatives[c]
                        * values.scalar_convection[a]
                        * velocity_norm_square;
                    value -= positivity_derivatives[c]
                        * stab.k2
                        * values.convection[a]
                        * u_dot_grad_phi;
                    value -= values.positivity_coeff
                        * k2_derivatives[c]
                        * values.convection[a]
                        * u_dot_grad_phi;

                    value += positivity_derivatives[c]
                        * stab.k1
                        * values.convection[a]
                        * u_dot_grad_phi;
                    value += values.positivity_coeff
                        * k1_derivatives[c]
                        * values.convection[a]
                        * u_dot_grad_phi;

                    // Transient SUPG chains, multiplied by the relaxed rate.
                    let mass_value = (tau_derivatives[c] * supg_test
                        + stab.tau * s_derivatives[c] * values.basis[a])
                        * relaxed_rate;

                    // Source chains.
                    let source_value = values.basis[a] * source_derivatives[c]
                        + tau_derivatives[c] * supg_test * values.source
                        + stab.tau * s_derivatives[c] * values.basis[a] * values.source
                        + stab.tau * supg_test * source_derivatives[c];

                    out[(a, c)] += weight * (source_value - value - mass_value);
                }
            }
        }
    }

    /// Fills `out[(a, c * dim + k)]` with the analytic derivative of
    /// residual entry `a` with respect to velocity component `k` at node
    /// `c`.
    pub fn velocity_derivatives_into(
        &self,
        element_index: usize,
        mut out: DMatrixViewMut<f64>,
    ) -> eyre::Result<()> {
        let geometry = self.element_geometry(element_index)?;
        let data = self.element_data(element_index);
        let n = data.phi.len();
        let dim = data.velocities.ncols();
        assert_eq!(out.nrows(), n, "output matrix dimension mismatch");
        assert_eq!(out.ncols(), n * dim, "output matrix dimension mismatch");
        out.fill(0.0);

        for g in 0..geometry.num_points() {
            let values = GaussPointValues::evaluate(&geometry, &data, self.model, self.context, g);
            let gradients = &geometry.shape_gradients[g];
            let weight = geometry.weights[g];
            let state = values.point_state();
            let basis = PointBasis {
                values: &values.basis,
                gradients,
            };

            let mut diffusivity_derivatives = DMatrix::zeros(n, dim);
            let mut reaction_derivatives = DMatrix::zeros(n, dim);
            let mut source_derivatives = DMatrix::zeros(n, dim);
            self.model.effective_diffusivity_velocity_derivatives(
                &mut diffusivity_derivatives,
                &state,
                &basis,
                self.context,
            );
            self.model.reaction_velocity_derivatives(
                &mut reaction_derivatives,
                &state,
                &basis,
                self.context,
            );
            self.model.source_velocity_derivatives(
                &mut source_derivatives,
                &state,
                &basis,
                self.context,
            );

            let stab = &values.stabilization;
            let velocity_norm = values.velocity.norm();
            let velocity_norm_square = values.velocity.norm_squared();
            let gradient_norm = values.scalar_gradient.norm();
            let u_dot_grad_phi = values.velocity.dot(&values.scalar_gradient);

            let vmag_derivatives =
                velocity_magnitude_derivatives(velocity_norm, &values.velocity, &values.basis);
            let tau_derivatives = tau_velocity_derivatives(
                stab.tau,
                values.diffusivity,
                values.reaction,
                &values.velocity,
                &geometry.metric_tensors[g],
                &diffusivity_derivatives,
                &reaction_derivatives,
                &values.basis,
            );
            let element_length_derivatives = element_length_velocity_derivatives(
                velocity_norm,
                &values.velocity,
                &vmag_derivatives,
                &geometry.metric_tensors[g],
                &values.basis,
            );
            let s_abs = values.reaction.abs();
            let s_derivatives = abs_velocity_derivatives(values.reaction, &reaction_derivatives);
            let abs_reaction_tilde_derivatives =
                abs_velocity_derivatives(stab.reaction_tilde, &reaction_derivatives);

            let (positivity_derivatives, k1_derivatives, k2_derivatives) =
                if values.cross_wind_active {
                    let chi_derivatives = chi_velocity_derivatives(
                        stab.chi,
                        stab.element_length,
                        stab.reaction_tilde,
                        &reaction_derivatives,
                        &vmag_derivatives,
                        &element_length_derivatives,
                    );
                    let res_derivatives = residual_velocity_derivatives(
                        values.scalar,
                        &values.scalar_gradient,
                        &reaction_derivatives,
                        &source_derivatives,
                        &values.basis,
                    );
                    let abs_res_derivatives =
                        abs_velocity_derivatives(values.residual, &res_derivatives);
                    let positivity_derivatives = positivity_velocity_derivatives(
                        stab.chi,
                        values.residual.abs(),
                        gradient_norm,
                        velocity_norm,
                        &chi_derivatives,
                        &abs_res_derivatives,
                        &vmag_derivatives,
                    );
                    let psi_one_d = psi_one_velocity_derivatives(
                        velocity_norm,
                        stab.reaction_tilde,
                        stab.tau,
                        &tau_derivatives,
                        &reaction_derivatives,
                        &vmag_derivatives,
                    );
                    let psi_two_d = psi_two_velocity_derivatives(
                        stab.reaction_tilde,
                        stab.tau,
                        stab.element_length,
                        &tau_derivatives,
                        &reaction_derivatives,
                        &abs_reaction_tilde_derivatives,
                        &element_length_derivatives,
                    );
                    let k1_derivatives = stream_line_coeff_velocity_derivatives(
                        stab.k1,
                        stab.element_length,
                        stab.tau,
                        velocity_norm,
                        stab.reaction_tilde,
                        stab.psi_one,
                        &vmag_derivatives,
                        &psi_one_d,
                        &psi_two_d,
                        &tau_derivatives,
                        &reaction_derivatives,
                        &diffusivity_derivatives,
                        &element_length_derivatives,
                    );
                    let k2_derivatives = cross_wind_coeff_velocity_derivatives(
                        stab.k2,
                        stab.psi_one,
                        stab.element_length,
                        &psi_one_d,
                        &psi_two_d,
                        &diffusivity_derivatives,
                        &element_length_derivatives,
                    );
                    (positivity_derivatives, k1_derivatives, k2_derivatives)
                } else {
                    (
                        DMatrix::zeros(n, dim),
                        DMatrix::zeros(n, dim),
                        DMatrix::zeros(n, dim),
                    )
                };

            for a in 0..n {
                let supg_test = values.convection[a] + s_abs * values.basis[a];
                for c in 0..n {
                    let column_base = c * dim;
                    for k in 0..dim {
                        // Chains of the damping operator applied to the
                        // current state.
                        let mut value = 0.0;

                        value +=
                            values.basis[a] * values.basis[c] * values.scalar_gradient[k];

                        value += diffusivity_derivatives[(c, k)] * values.scalar_convection[a];

                        value +=
                            reaction_derivatives[(c, k)] * values.basis[a] * values.scalar;

                        value += tau_derivatives[(c, k)] * supg_test * u_dot_grad_phi;
                        value += stab.tau
                            * (values.basis[c] * gradients[(a, k)]
                                + s_derivatives[(c, k)] * values.basis[a])
                            * u_dot_grad_phi;
                        value += stab.tau
                            * supg_test
                            * values.basis[c]
                            * values.scalar_gradient[k];

                        value += tau_derivatives[(c, k)]
                            * supg_test
                            * values.reaction
                            * values.scalar;
                        value += stab.tau
                            * (values.basis[c] * gradients[(a, k)]
                                + s_derivatives[(c, k)] * values.basis[a])
                            * values.reaction
                            * values.scalar;
                        value += stab.tau
                            * supg_test
                            * reaction_derivatives[(c, k)]
                            * values.scalar;

                        value += positivity_derivatives[(c, k)]
                            * stab.k2
                            * velocity_norm_square
                            * values.scalar_convection[a];
                        value += values.positivity_coeff
                            * k2_derivatives[(c, k)]
                            * velocity_norm_square
                            * values.scalar_convection[a];
                        value += values.positivity_coeff
                            * stab.k2
                            * 2.0
                            * velocity_norm
                            * vmag_derivatives[(c, k)]
                            * values.scalar_convection[a];
                        value -= positivity_derivatives[(c, k)]
                            * stab.k2
                            * values.convection[a]
                            * u_dot_grad_phi;
                        value -= values.positivity_coeff
                            * k2_derivatives[(c, k)]
                            * values.convection[a]
                            * u_dot_grad_phi;
                        value -= values.positivity_coeff
                            * stab.k2
                            * values.basis[c]
                            * gradients[(a, k)]
                            * u_dot_grad_phi;
                        value -= values.positivity_coeff
                            * stab.k2
                            * values.basis[c]
                            * values.convection[a]
                            * values.scalar_gradient[k];

                        value += positivity_derivatives[(c, k)]
                            * stab.k1
                            * values.convection[a]
                            * u_dot_grad_phi;
                        value += values.positivity_coeff
                            * k1_derivatives[(c, k)]
                            * values.convection[a]
                            * u_dot_grad_phi;
                        value += values.positivity_coeff
                            * stab.k1
                            * values.basis[c]
                            * gradients[(a, k)]
                            * u_dot_grad_phi;
                        value += values.positivity_coeff
                            * stab.k1
                            * values.convection[a]
                            * values.basis[c]
                            * values.scalar_gradient[k];

                        out[(a, column_base + k)] -= weight * value;

                        // Source chains.
                        let mut value = 0.0;
                        value += values.basis[a] * source_derivatives[(c, k)];
                        value += tau_derivatives[(c, k)] * supg_test * values.source;
                        value += stab.tau
                            * (values.basis[c] * gradients[(a, k)]
                                + s_derivatives[(c, k)] * values.basis[a])
                            * values.source;
                        value += stab.tau * supg_test * source_derivatives[(c, k)];

                        out[(a, column_base + k)] += weight * value;

                        // Transient SUPG chains.
                        let mut value = 0.0;
                        value +=
                            tau_derivatives[(c, k)] * supg_test * values.relaxed_rate;
                        value += stab.tau
                            * (values.basis[c] * gradients[(a, k)]
                                + s_derivatives[(c, k)] * values.basis[a])
                            * values.relaxed_rate;

                        out[(a, column_base + k)] -= weight * value;
                    }
                }
            }
        }
        Ok(())
    }
}
