//! Reference finite elements: basis values, reference gradients and
//! canonical quadrature rules for linear simplices.
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Supported reference element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellKind {
    /// Linear triangle in 2D.
    Tri3,
    /// Linear tetrahedron in 3D.
    Tet4,
}

impl CellKind {
    pub fn num_nodes(self) -> usize {
        match self {
            CellKind::Tri3 => 3,
            CellKind::Tet4 => 4,
        }
    }

    pub fn reference_dim(self) -> usize {
        match self {
            CellKind::Tri3 => 2,
            CellKind::Tet4 => 3,
        }
    }

    /// Evaluates the nodal basis functions at the reference point `xi`.
    pub fn populate_basis(self, out: &mut [f64], xi: &[f64]) {
        assert_eq!(out.len(), self.num_nodes());
        assert_eq!(xi.len(), self.reference_dim());
        match self {
            CellKind::Tri3 => {
                out[0] = 1.0 - xi[0] - xi[1];
                out[1] = xi[0];
                out[2] = xi[1];
            }
            CellKind::Tet4 => {
                out[0] = 1.0 - xi[0] - xi[1] - xi[2];
                out[1] = xi[0];
                out[2] = xi[1];
                out[3] = xi[2];
            }
        }
    }

    /// Gradients of the basis functions with respect to reference
    /// coordinates, one row per node. Constant for linear simplices, but the
    /// reference point is taken anyway so that higher-order kinds can slot in
    /// without changing call sites.
    pub fn populate_reference_gradients(self, out: &mut DMatrix<f64>, _xi: &[f64]) {
        assert_eq!(out.nrows(), self.num_nodes());
        assert_eq!(out.ncols(), self.reference_dim());
        match self {
            CellKind::Tri3 => {
                out.copy_from_slice(&[-1.0, 1.0, 0.0, -1.0, 0.0, 1.0]);
            }
            CellKind::Tet4 => {
                out.copy_from_slice(&[
                    -1.0, 1.0, 0.0, 0.0, //
                    -1.0, 0.0, 1.0, 0.0, //
                    -1.0, 0.0, 0.0, 1.0,
                ]);
            }
        }
    }

    /// Canonical Gauss rule: weights and reference points. The rules are
    /// exact for quadratic integrands, which is what the stabilized operator
    /// terms on linear simplices require.
    pub fn reference_quadrature(self) -> (Vec<f64>, Vec<Vec<f64>>) {
        match self {
            CellKind::Tri3 => {
                let w = 1.0 / 6.0;
                (
                    vec![w, w, w],
                    vec![
                        vec![1.0 / 6.0, 1.0 / 6.0],
                        vec![2.0 / 3.0, 1.0 / 6.0],
                        vec![1.0 / 6.0, 2.0 / 3.0],
                    ],
                )
            }
            CellKind::Tet4 => {
                let a = 0.585_410_196_624_968_5;
                let b = 0.138_196_601_125_010_5;
                let w = 1.0 / 24.0;
                (
                    vec![w, w, w, w],
                    vec![
                        vec![a, b, b],
                        vec![b, a, b],
                        vec![b, b, a],
                        vec![b, b, b],
                    ],
                )
            }
        }
    }
}
