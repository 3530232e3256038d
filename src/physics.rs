//! The constitutive seam of the transport equation.
//!
//! A [`ConvectionDiffusionReaction`] model supplies the effective
//! diffusivity, the reaction coefficient and the source term at an
//! integration point, together with their derivatives with respect to the
//! nodal scalar unknowns and the nodal velocities. The model is a black box
//! to the assemblers: it may be arbitrarily nonlinear internally, but each
//! call must be a pure function of the point state.
use crate::context::SimulationContext;
use nalgebra::{DMatrix, DVector};

/// Interpolated quantities at a single integration point.
#[derive(Debug)]
pub struct PointState<'a> {
    /// Velocity at the point, `dim` components.
    pub velocity: &'a DVector<f64>,
    /// Primal scalar unknown at the point.
    pub scalar: f64,
    /// Physical gradient of the scalar, `dim` components.
    pub scalar_gradient: &'a DVector<f64>,
    /// Bossak-relaxed rate of the scalar.
    pub relaxed_rate: f64,
    /// Divergence of the velocity field at the point.
    pub velocity_divergence: f64,
}

/// Shape function data a model needs to express nodal derivative chains.
#[derive(Debug)]
pub struct PointBasis<'a> {
    /// Shape function values, one per node.
    pub values: &'a [f64],
    /// Physical shape gradients, `num_nodes × dim`.
    pub gradients: &'a DMatrix<f64>,
}

impl<'a> PointBasis<'a> {
    pub fn num_nodes(&self) -> usize {
        self.values.len()
    }

    pub fn dim(&self) -> usize {
        self.gradients.ncols()
    }
}

/// Constitutive response of a scalar transport equation.
///
/// The derivative methods must be exact companions of the forward methods:
/// for every forward quantity `q`, the scalar variant fills
/// `out[c] = dq/dphi_c` and the velocity variant
/// `out[(c, k)] = dq/du_{c,k}`. The adjoint propagation chains these through
/// the stabilization expressions, so an inconsistent pair here silently
/// corrupts every sensitivity built on top of it.
pub trait ConvectionDiffusionReaction {
    fn effective_diffusivity(&self, state: &PointState, ctx: &SimulationContext) -> f64;

    fn reaction(&self, state: &PointState, ctx: &SimulationContext) -> f64;

    fn source(&self, state: &PointState, ctx: &SimulationContext) -> f64;

    fn effective_diffusivity_scalar_derivatives(
        &self,
        out: &mut DVector<f64>,
        state: &PointState,
        basis: &PointBasis,
        ctx: &SimulationContext,
    );

    fn reaction_scalar_derivatives(
        &self,
        out: &mut DVector<f64>,
        state: &PointState,
        basis: &PointBasis,
        ctx: &SimulationContext,
    );

    fn source_scalar_derivatives(
        &self,
        out: &mut DVector<f64>,
        state: &PointState,
        basis: &PointBasis,
        ctx: &SimulationContext,
    );

    fn effective_diffusivity_velocity_derivatives(
        &self,
        out: &mut DMatrix<f64>,
        state: &PointState,
        basis: &PointBasis,
        ctx: &SimulationContext,
    );

    fn reaction_velocity_derivatives(
        &self,
        out: &mut DMatrix<f64>,
        state: &PointState,
        basis: &PointBasis,
        ctx: &SimulationContext,
    );

    fn source_velocity_derivatives(
        &self,
        out: &mut DMatrix<f64>,
        state: &PointState,
        basis: &PointBasis,
        ctx: &SimulationContext,
    );
}

/// A transport model with affine dependence of its coefficients on the
/// scalar unknown and the velocity divergence:
///
/// ```text
/// nu(phi)    = nu_0 + nu_phi * phi
/// s(phi, u)  = s_0 + s_phi * phi + s_div * div(u)
/// q(phi)     = q_0 + q_phi * phi
/// ```
///
/// The affine structure keeps every derivative chain nontrivial while the
/// closed forms stay simple enough to validate by hand, which makes this
/// model the reference vehicle for the sensitivity tests.
#[derive(Debug, Clone, Copy)]
pub struct LinearCdrModel {
    pub nu_0: f64,
    pub nu_phi: f64,
    pub s_0: f64,
    pub s_phi: f64,
    pub s_div: f64,
    pub q_0: f64,
    pub q_phi: f64,
}

impl LinearCdrModel {
    /// Constant coefficients without any state dependence.
    pub fn constant(diffusivity: f64, reaction: f64, source: f64) -> Self {
        Self {
            nu_0: diffusivity,
            nu_phi: 0.0,
            s_0: reaction,
            s_phi: 0.0,
            s_div: 0.0,
            q_0: source,
            q_phi: 0.0,
        }
    }
}

impl ConvectionDiffusionReaction for LinearCdrModel {
    fn effective_diffusivity(&self, state: &PointState, _ctx: &SimulationContext) -> f64 {
        self.nu_0 + self.nu_phi * state.scalar
    }

    fn reaction(&self, state: &PointState, _ctx: &SimulationContext) -> f64 {
        self.s_0 + self.s_phi * state.scalar + self.s_div * state.velocity_divergence
    }

    fn source(&self, state: &PointState, _ctx: &SimulationContext) -> f64 {
        self.q_0 + self.q_phi * state.scalar
    }

    fn effective_diffusivity_scalar_derivatives(
        &self,
        out: &mut DVector<f64>,
        _state: &PointState,
        basis: &PointBasis,
        _ctx: &SimulationContext,
    ) {
        for c in 0..basis.num_nodes() {
            out[c] = self.nu_phi * basis.values[c];
        }
    }

    fn reaction_scalar_derivatives(
        &self,
        out: &mut DVector<f64>,
        _state: &PointState,
        basis: &PointBasis,
        _ctx: &SimulationContext,
    ) {
        for c in 0..basis.num_nodes() {
            out[c] = self.s_phi * basis.values[c];
        }
    }

    fn source_scalar_derivatives(
        &self,
        out: &mut DVector<f64>,
        _state: &PointState,
        basis: &PointBasis,
        _ctx: &SimulationContext,
    ) {
        for c in 0..basis.num_nodes() {
            out[c] = self.q_phi * basis.values[c];
        }
    }

    fn effective_diffusivity_velocity_derivatives(
        &self,
        out: &mut DMatrix<f64>,
        _state: &PointState,
        _basis: &PointBasis,
        _ctx: &SimulationContext,
    ) {
        out.fill(0.0);
    }

    fn reaction_velocity_derivatives(
        &self,
        out: &mut DMatrix<f64>,
        _state: &PointState,
        basis: &PointBasis,
        _ctx: &SimulationContext,
    ) {
        for c in 0..basis.num_nodes() {
            for k in 0..basis.dim() {
                out[(c, k)] = self.s_div * basis.gradients[(c, k)];
            }
        }
    }

    fn source_velocity_derivatives(
        &self,
        out: &mut DMatrix<f64>,
        _state: &PointState,
        _basis: &PointBasis,
        _ctx: &SimulationContext,
    ) {
        out.fill(0.0);
    }
}
