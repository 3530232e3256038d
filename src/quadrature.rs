//! Per-element integration point data.
//!
//! [`ElementGeometry`] bundles everything the local assemblers consume at a
//! quadrature point: scaled weights, shape function values, physical shape
//! gradients, and the contravariant metric tensor of the parametric map.
//! The data is recomputed on every request, since nodal positions (and hence
//! Jacobians) may change between solution steps.
use crate::error::{Error, Result};
use crate::mesh::{Cell, Mesh};
use nalgebra::DMatrix;

/// Integration data for one element, one entry per quadrature point.
#[derive(Debug, Clone)]
pub struct ElementGeometry {
    /// Quadrature weights scaled by the Jacobian determinant.
    pub weights: Vec<f64>,
    /// Shape function values; row `g` holds the values at point `g`.
    pub shape_values: DMatrix<f64>,
    /// Physical shape gradients per point, `num_nodes × dim`.
    pub shape_gradients: Vec<DMatrix<f64>>,
    /// Contravariant metric tensor `J^{-T} J^{-1}` per point, `dim × dim`.
    pub metric_tensors: Vec<DMatrix<f64>>,
}

impl ElementGeometry {
    pub fn num_points(&self) -> usize {
        self.weights.len()
    }

    pub fn domain_size(&self) -> f64 {
        self.weights.iter().sum()
    }
}

/// Computes integration point data for a cell of the given mesh.
///
/// Fails with a geometry error before any dependent arithmetic if the
/// parametric Jacobian is singular or negatively oriented.
pub fn compute_element_geometry(mesh: &Mesh, cell: &Cell) -> Result<ElementGeometry> {
    let kind = cell.kind;
    let dim = kind.reference_dim();
    if dim != mesh.dim() {
        return Err(Error::Configuration(format!(
            "{:?} cell in a {}-dimensional mesh",
            kind,
            mesh.dim()
        )));
    }
    let n = kind.num_nodes();
    let (ref_weights, ref_points) = kind.reference_quadrature();
    let num_points = ref_weights.len();

    let mut weights = Vec::with_capacity(num_points);
    let mut shape_values = DMatrix::zeros(num_points, n);
    let mut shape_gradients = Vec::with_capacity(num_points);
    let mut metric_tensors = Vec::with_capacity(num_points);

    let mut basis = vec![0.0; n];
    let mut reference_gradients = DMatrix::zeros(n, dim);

    for (g, (ref_w, xi)) in ref_weights.iter().zip(&ref_points).enumerate() {
        kind.populate_basis(&mut basis, xi);
        for (a, &value) in basis.iter().enumerate() {
            shape_values[(g, a)] = value;
        }
        kind.populate_reference_gradients(&mut reference_gradients, xi);

        // Jacobian of the reference-to-physical map: J_ij = sum_a x_a,i dN_a/dxi_j
        let mut jacobian = DMatrix::zeros(dim, dim);
        for (a, &node) in cell.nodes.iter().enumerate() {
            let x = mesh.node_position(node);
            for i in 0..dim {
                for j in 0..dim {
                    jacobian[(i, j)] += x[i] * reference_gradients[(a, j)];
                }
            }
        }

        let det = jacobian.determinant();
        if det <= 0.0 {
            return Err(Error::Geometry(format!(
                "non-positive Jacobian determinant {det:.6e} at integration point {g}"
            )));
        }
        let jacobian_inv = jacobian
            .clone()
            .try_inverse()
            .ok_or_else(|| Error::Geometry("singular element Jacobian".to_string()))?;

        // Physical gradients dN/dx = dN/dxi J^{-1}; metric G = J^{-T} J^{-1}.
        shape_gradients.push(&reference_gradients * &jacobian_inv);
        metric_tensors.push(jacobian_inv.transpose() * &jacobian_inv);
        weights.push(ref_w * det);
    }

    Ok(ElementGeometry {
        weights,
        shape_values,
        shape_gradients,
        metric_tensors,
    })
}

/// Setup-time validation: computes the integration data of every cell and
/// condition once, surfacing degenerate geometry before any solve is
/// attempted.
pub fn check_mesh_geometry(mesh: &Mesh) -> Result<()> {
    for (index, cell) in mesh.cells().iter().enumerate() {
        compute_element_geometry(mesh, cell)
            .map_err(|error| Error::Geometry(format!("cell {index}: {error}")))?;
    }
    for (index, cell) in mesh.conditions().iter().enumerate() {
        compute_element_geometry(mesh, cell)
            .map_err(|error| Error::Geometry(format!("condition {index}: {error}")))?;
    }
    Ok(())
}
