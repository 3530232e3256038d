//! Element-local assembly of the stabilized convection-diffusion-reaction
//! operator.
//!
//! The weak form combines the Galerkin convection, reaction and diffusion
//! terms with SUPG streamline stabilization and residual-driven cross-wind
//! diffusion. The same gauss-point arithmetic feeds both the damping matrix
//! and the Newton residual so the two can never drift apart; the adjoint
//! derivative propagation in [`crate::assembly::adjoint`] differentiates
//! exactly this evaluation.
use crate::assembly::{ElementConnectivityAssembler, ElementSystemAssembler};
use crate::context::{FieldId, SimulationContext};
use crate::dof::DofSet;
use crate::error::Result;
use crate::mesh::{FieldStore, Mesh};
use crate::physics::{ConvectionDiffusionReaction, PointState};
use crate::quadrature::{compute_element_geometry, ElementGeometry};
use crate::stabilization::StabilizationState;
use nalgebra::{DMatrix, DMatrixViewMut, DVector, DVectorViewMut};

/// The nodal fields the transport assembler reads and writes.
#[derive(Debug, Clone, Copy)]
pub struct TransportFields {
    /// Primal scalar unknown.
    pub scalar: FieldId,
    /// Time rate of the scalar (two history steps required).
    pub scalar_rate: FieldId,
    /// Convecting velocity.
    pub velocity: FieldId,
    /// Output slot for recovered reactions.
    pub reaction: FieldId,
}

/// Nodal data of one element, gathered from the field store.
#[derive(Debug, Clone)]
pub struct ElementData {
    /// Scalar unknown per node.
    pub phi: DVector<f64>,
    /// Bossak-relaxed scalar rate per node.
    pub relaxed_rate: DVector<f64>,
    /// Velocity per node, `num_nodes × dim`.
    pub velocities: DMatrix<f64>,
}

impl ElementData {
    pub fn gather(
        mesh: &Mesh,
        store: &FieldStore,
        fields: &TransportFields,
        context: &SimulationContext,
        nodes: &[usize],
    ) -> Self {
        let n = nodes.len();
        let dim = mesh.dim();
        let mut phi = DVector::zeros(n);
        let mut relaxed_rate = DVector::zeros(n);
        let mut velocities = DMatrix::zeros(n, dim);
        for (c, &node) in nodes.iter().enumerate() {
            phi[c] = store.scalar(fields.scalar, node, 0);
            relaxed_rate[c] = context.time.relax_rate(
                store.scalar(fields.scalar_rate, node, 0),
                store.scalar(fields.scalar_rate, node, 1),
            );
            let velocity = store.vector(fields.velocity, node, 0);
            for k in 0..dim {
                velocities[(c, k)] = velocity[k];
            }
        }
        Self {
            phi,
            relaxed_rate,
            velocities,
        }
    }
}

/// Everything evaluated at one integration point that both the forward
/// assembly and the derivative propagation consume.
pub(crate) struct GaussPointValues {
    pub basis: Vec<f64>,
    pub velocity: DVector<f64>,
    pub scalar: f64,
    pub scalar_gradient: DVector<f64>,
    pub relaxed_rate: f64,
    pub velocity_divergence: f64,
    /// `u . grad N_c` per node.
    pub convection: DVector<f64>,
    /// `grad phi . grad N_c` per node.
    pub scalar_convection: DVector<f64>,
    pub diffusivity: f64,
    pub reaction: f64,
    pub source: f64,
    pub stabilization: StabilizationState,
    pub residual: f64,
    /// `|residual| chi / (|u|^2 |grad phi|)`, zero outside the guard.
    pub positivity_coeff: f64,
    /// True when the cross-wind guard (`|u|^2 > eps`, `|grad phi| > eps`)
    /// admits the residual-driven diffusion terms.
    pub cross_wind_active: bool,
}

impl GaussPointValues {
    pub fn evaluate<M: ConvectionDiffusionReaction>(
        geometry: &ElementGeometry,
        data: &ElementData,
        model: &M,
        context: &SimulationContext,
        g: usize,
    ) -> Self {
        let n = data.phi.len();
        let dim = geometry.metric_tensors[g].nrows();
        let gradients = &geometry.shape_gradients[g];

        let mut basis = vec![0.0; n];
        for c in 0..n {
            basis[c] = geometry.shape_values[(g, c)];
        }

        let mut velocity = DVector::zeros(dim);
        let mut scalar = 0.0;
        let mut relaxed_rate = 0.0;
        for c in 0..n {
            scalar += basis[c] * data.phi[c];
            relaxed_rate += basis[c] * data.relaxed_rate[c];
            for k in 0..dim {
                velocity[k] += basis[c] * data.velocities[(c, k)];
            }
        }

        let mut scalar_gradient = DVector::zeros(dim);
        let mut velocity_divergence = 0.0;
        for c in 0..n {
            for k in 0..dim {
                scalar_gradient[k] += gradients[(c, k)] * data.phi[c];
                velocity_divergence += gradients[(c, k)] * data.velocities[(c, k)];
            }
        }

        let convection = gradients * &velocity;
        let scalar_convection = gradients * &scalar_gradient;

        let state = PointState {
            velocity: &velocity,
            scalar,
            scalar_gradient: &scalar_gradient,
            relaxed_rate,
            velocity_divergence,
        };
        let diffusivity = model.effective_diffusivity(&state, context);
        let reaction = model.reaction(&state, context);
        let source = model.source(&state, context);

        let stabilization = StabilizationState::evaluate(
            &velocity,
            &geometry.metric_tensors[g],
            reaction,
            diffusivity,
            &context.time,
        );

        let residual =
            relaxed_rate + velocity.dot(&scalar_gradient) + reaction * scalar - source;

        let velocity_norm_square = velocity.norm_squared();
        let gradient_norm = scalar_gradient.norm();
        let cross_wind_active =
            velocity_norm_square > f64::EPSILON && gradient_norm > f64::EPSILON;
        let positivity_coeff = if cross_wind_active {
            residual.abs() * stabilization.chi / (velocity_norm_square * gradient_norm)
        } else {
            0.0
        };

        Self {
            basis,
            velocity,
            scalar,
            scalar_gradient,
            relaxed_rate,
            velocity_divergence,
            convection,
            scalar_convection,
            diffusivity,
            reaction,
            source,
            stabilization,
            residual,
            positivity_coeff,
            cross_wind_active,
        }
    }

    pub fn point_state(&self) -> PointState {
        PointState {
            velocity: &self.velocity,
            scalar: self.scalar,
            scalar_gradient: &self.scalar_gradient,
            relaxed_rate: self.relaxed_rate,
            velocity_divergence: self.velocity_divergence,
        }
    }
}

/// Accumulates the damping matrix and/or the Newton residual of one element.
///
/// Both outputs are produced from a single evaluation of the gauss-point
/// operator coefficients: the residual is `F - D phi` with `F` the
/// (stabilization-weighted) source and rate contribution and `D` the damping
/// operator, so requesting both costs one pass.
pub(crate) fn assemble_cdr_local<M: ConvectionDiffusionReaction>(
    geometry: &ElementGeometry,
    data: &ElementData,
    model: &M,
    context: &SimulationContext,
    mut lhs: Option<DMatrixViewMut<f64>>,
    mut rhs: Option<DVectorViewMut<f64>>,
) {
    let n = data.phi.len();
    if let Some(lhs) = lhs.as_mut() {
        lhs.fill(0.0);
    }
    if let Some(rhs) = rhs.as_mut() {
        rhs.fill(0.0);
    }

    for g in 0..geometry.num_points() {
        let values = GaussPointValues::evaluate(geometry, data, model, context, g);
        let weight = geometry.weights[g];
        let gradients = &geometry.shape_gradients[g];
        let dim = gradients.ncols();

        let tau = values.stabilization.tau;
        let s_abs = values.reaction.abs();
        let stream_line = values.positivity_coeff * values.stabilization.k1;
        let cross_wind = values.positivity_coeff * values.stabilization.k2;
        let velocity_norm_square = values.velocity.norm_squared();

        for a in 0..n {
            let supg_test = values.convection[a] + s_abs * values.basis[a];

            for c in 0..n {
                let mut grad_a_dot_grad_c = 0.0;
                for k in 0..dim {
                    grad_a_dot_grad_c += gradients[(a, k)] * gradients[(c, k)];
                }

                let mut value = 0.0;

                value += values.basis[a] * values.convection[c];
                value += values.basis[a] * values.reaction * values.basis[c];
                value += values.diffusivity * grad_a_dot_grad_c;

                value += tau
                    * supg_test
                    * (values.convection[c] + values.reaction * values.basis[c]);

                value += cross_wind
                    * (grad_a_dot_grad_c * velocity_norm_square
                        - values.convection[a] * values.convection[c]);
                value += stream_line * values.convection[a] * values.convection[c];

                if let Some(lhs) = lhs.as_mut() {
                    lhs[(a, c)] += weight * value;
                }
                if let Some(rhs) = rhs.as_mut() {
                    rhs[a] -= weight * value * data.phi[c];
                }
            }

            if let Some(rhs) = rhs.as_mut() {
                rhs[a] += weight
                    * (values.basis[a] + tau * supg_test)
                    * (values.source - values.relaxed_rate);
            }
        }
    }
}

/// Assembler producing the stabilized transport system for every cell of a
/// partition-local mesh.
pub struct CdrElementAssembler<'a, M> {
    mesh: &'a Mesh,
    store: &'a FieldStore,
    fields: TransportFields,
    pub(crate) model: &'a M,
    pub(crate) context: &'a SimulationContext,
    dofs: &'a DofSet,
}

impl<'a, M> CdrElementAssembler<'a, M> {
    pub fn new(
        mesh: &'a Mesh,
        store: &'a FieldStore,
        fields: TransportFields,
        model: &'a M,
        context: &'a SimulationContext,
        dofs: &'a DofSet,
    ) -> Self {
        Self {
            mesh,
            store,
            fields,
            model,
            context,
            dofs,
        }
    }

    pub fn fields(&self) -> &TransportFields {
        &self.fields
    }

    pub(crate) fn element_geometry(&self, element_index: usize) -> Result<ElementGeometry> {
        compute_element_geometry(self.mesh, &self.mesh.cells()[element_index])
    }

    pub(crate) fn element_data(&self, element_index: usize) -> ElementData {
        ElementData::gather(
            self.mesh,
            self.store,
            &self.fields,
            self.context,
            &self.mesh.cells()[element_index].nodes,
        )
    }
}

impl<'a, M: ConvectionDiffusionReaction> ElementConnectivityAssembler
    for CdrElementAssembler<'a, M>
{
    fn solution_dim(&self) -> usize {
        1
    }

    fn num_elements(&self) -> usize {
        self.mesh.cells().len()
    }

    fn num_nodes(&self) -> usize {
        self.mesh.num_nodes()
    }

    fn element_node_count(&self, element_index: usize) -> usize {
        self.mesh.cells()[element_index].nodes.len()
    }

    fn populate_element_nodes(&self, output: &mut [usize], element_index: usize) {
        output.copy_from_slice(&self.mesh.cells()[element_index].nodes);
    }
}

impl<'a, M: ConvectionDiffusionReaction> ElementSystemAssembler for CdrElementAssembler<'a, M> {
    fn element_dof_count(&self, element_index: usize) -> usize {
        self.mesh.cells()[element_index].nodes.len()
    }

    fn populate_element_equation_ids(&self, output: &mut [usize], element_index: usize) {
        let nodes = &self.mesh.cells()[element_index].nodes;
        for (local, &node) in nodes.iter().enumerate() {
            output[local] = self
                .dofs
                .equation_id(node, self.fields.scalar)
                .expect("equation id requested before dof numbering");
        }
    }

    fn element_is_active(&self, element_index: usize) -> bool {
        self.mesh.cells()[element_index].active
    }

    fn assemble_element_system_into(
        &self,
        element_index: usize,
        lhs: DMatrixViewMut<f64>,
        rhs: DVectorViewMut<f64>,
    ) -> eyre::Result<()> {
        let geometry = self.element_geometry(element_index)?;
        let data = self.element_data(element_index);
        assemble_cdr_local(
            &geometry,
            &data,
            self.model,
            self.context,
            Some(lhs),
            Some(rhs),
        );
        Ok(())
    }

    fn assemble_element_lhs_into(
        &self,
        element_index: usize,
        lhs: DMatrixViewMut<f64>,
    ) -> eyre::Result<()> {
        let geometry = self.element_geometry(element_index)?;
        let data = self.element_data(element_index);
        assemble_cdr_local(&geometry, &data, self.model, self.context, Some(lhs), None);
        Ok(())
    }

    fn assemble_element_rhs_into(
        &self,
        element_index: usize,
        rhs: DVectorViewMut<f64>,
    ) -> eyre::Result<()> {
        let geometry = self.element_geometry(element_index)?;
        let data = self.element_data(element_index);
        assemble_cdr_local(&geometry, &data, self.model, self.context, None, Some(rhs));
        Ok(())
    }
}
