//! Pluggable linear solvers for the distributed system.
use crate::comm::Communicator;
use crate::dof::DofSet;
use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::sparse::{ColumnImporter, DistributedCsr, DistributedVector};
use itertools::izip;
use log::debug;

/// A linear solver operating on the row-partitioned system.
///
/// Solvers that need physical context (dof ordering, nodal coordinates) can
/// request it through [`LinearSolver::additional_physical_data_is_needed`];
/// the driver then calls [`LinearSolver::provide_additional_data`] before
/// each solve.
pub trait LinearSolver {
    fn additional_physical_data_is_needed(&self) -> bool {
        false
    }

    fn provide_additional_data(
        &mut self,
        _matrix: &DistributedCsr,
        _solution: &DistributedVector,
        _rhs: &DistributedVector,
        _dofs: &DofSet,
        _mesh: &Mesh,
    ) {
    }

    /// Solves `A x = b`. `x` is used as output only; implementations choose
    /// their own initial guess.
    fn solve(
        &mut self,
        matrix: &DistributedCsr,
        solution: &mut DistributedVector,
        rhs: &DistributedVector,
        comm: &dyn Communicator,
    ) -> Result<()>;
}

/// Jacobi-preconditioned conjugate gradient on the distributed matrix.
///
/// Every inner product is a collective reduction in rank order, and ghost
/// column values of the search direction are re-imported before each
/// matrix-vector product, so all ranks iterate in lockstep on identical
/// scalars.
#[derive(Debug, Clone)]
pub struct ConjugateGradient {
    pub relative_tolerance: f64,
    pub max_iterations: usize,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self {
            relative_tolerance: 1e-10,
            max_iterations: 1000,
        }
    }
}

impl LinearSolver for ConjugateGradient {
    fn solve(
        &mut self,
        matrix: &DistributedCsr,
        solution: &mut DistributedVector,
        rhs: &DistributedVector,
        comm: &dyn Communicator,
    ) -> Result<()> {
        let local_size = rhs.local_size();
        solution.fill(0.0);

        let rhs_norm = rhs.two_norm(comm);
        if rhs_norm == 0.0 {
            return Ok(());
        }

        let importer = ColumnImporter::from_matrix(matrix);
        let preconditioner: Vec<f64> = matrix
            .diagonal()
            .into_iter()
            .map(|d| if d.abs() > 0.0 { 1.0 / d } else { 1.0 })
            .collect();

        // Zero initial guess, so r = b.
        let mut residual: Vec<f64> = rhs.owned().to_vec();
        let mut preconditioned: Vec<f64> =
            izip!(&residual, &preconditioner).map(|(r, m)| r * m).collect();

        let mut direction = DistributedVector::new(rhs.layout().clone(), comm.rank());
        direction.owned_mut().copy_from_slice(&preconditioned);

        let mut rho = comm.sum_all_f64(
            izip!(&residual, &preconditioned)
                .map(|(r, z)| r * z)
                .sum::<f64>(),
        );

        let mut matvec = vec![0.0; local_size];
        for iteration in 0..self.max_iterations {
            let ghost_direction = importer.import(&direction, comm)?;
            matrix.spmv(&direction, &ghost_direction, &importer, &mut matvec);

            let curvature = comm.sum_all_f64(
                izip!(direction.owned(), &matvec)
                    .map(|(p, ap)| p * ap)
                    .sum::<f64>(),
            );
            if curvature <= 0.0 {
                return Err(Error::Solver(format!(
                    "conjugate gradient encountered non-positive curvature {curvature:.6e}; \
                     the system matrix is not positive definite"
                )));
            }

            let alpha = rho / curvature;
            for (x, p) in izip!(solution.owned_mut(), direction.owned()) {
                *x += alpha * p;
            }
            for (r, ap) in izip!(&mut residual, &matvec) {
                *r -= alpha * ap;
            }

            let residual_norm =
                comm.sum_all_f64(residual.iter().map(|r| r * r).sum::<f64>()).sqrt();
            if residual_norm <= self.relative_tolerance * rhs_norm {
                debug!(
                    "conjugate gradient converged after {} iterations, residual {:.3e}",
                    iteration + 1,
                    residual_norm
                );
                return Ok(());
            }

            for (z, r, m) in izip!(&mut preconditioned, &residual, &preconditioner) {
                *z = r * m;
            }
            let rho_next = comm.sum_all_f64(
                izip!(&residual, &preconditioned)
                    .map(|(r, z)| r * z)
                    .sum::<f64>(),
            );
            let beta = rho_next / rho;
            rho = rho_next;
            for (p, z) in izip!(direction.owned_mut(), &preconditioned) {
                *p = z + beta * *p;
            }
        }

        Err(Error::Solver(format!(
            "conjugate gradient did not converge within {} iterations",
            self.max_iterations
        )))
    }
}

/// Stabilized bi-conjugate gradient for the general (nonsymmetric)
/// convection-dominated system.
#[derive(Debug, Clone)]
pub struct BiCgStab {
    pub relative_tolerance: f64,
    pub max_iterations: usize,
}

impl Default for BiCgStab {
    fn default() -> Self {
        Self {
            relative_tolerance: 1e-10,
            max_iterations: 2000,
        }
    }
}

impl LinearSolver for BiCgStab {
    fn solve(
        &mut self,
        matrix: &DistributedCsr,
        solution: &mut DistributedVector,
        rhs: &DistributedVector,
        comm: &dyn Communicator,
    ) -> Result<()> {
        let local_size = rhs.local_size();
        solution.fill(0.0);

        let rhs_norm = rhs.two_norm(comm);
        if rhs_norm == 0.0 {
            return Ok(());
        }
        let tolerance = self.relative_tolerance * rhs_norm;

        let importer = ColumnImporter::from_matrix(matrix);
        let global_dot = |a: &[f64], b: &[f64]| -> f64 {
            comm.sum_all_f64(izip!(a, b).map(|(x, y)| x * y).sum::<f64>())
        };

        // Zero initial guess, so r = b; the shadow residual stays fixed.
        let mut residual: Vec<f64> = rhs.owned().to_vec();
        let shadow: Vec<f64> = residual.clone();

        let mut direction = DistributedVector::new(rhs.layout().clone(), comm.rank());
        let mut intermediate = DistributedVector::new(rhs.layout().clone(), comm.rank());
        let mut v = vec![0.0; local_size];
        let mut t = vec![0.0; local_size];

        let mut rho = 1.0;
        let mut alpha = 1.0;
        let mut omega = 1.0;

        for iteration in 0..self.max_iterations {
            let rho_next = global_dot(&shadow, &residual);
            if rho_next == 0.0 {
                return Err(Error::Solver(
                    "bi-conjugate gradient breakdown: rho vanished".to_string(),
                ));
            }
            let beta = (rho_next / rho) * (alpha / omega);
            rho = rho_next;
            for (p, r, vi) in izip!(direction.owned_mut(), &residual, &v) {
                *p = r + beta * (*p - omega * vi);
            }

            let ghost = importer.import(&direction, comm)?;
            matrix.spmv(&direction, &ghost, &importer, &mut v);
            alpha = rho / global_dot(&shadow, &v);

            for (s, r, vi) in izip!(intermediate.owned_mut(), &residual, &v) {
                *s = r - alpha * vi;
            }
            let s_norm = intermediate.two_norm(comm);
            if s_norm <= tolerance {
                for (x, p) in izip!(solution.owned_mut(), direction.owned()) {
                    *x += alpha * p;
                }
                debug!(
                    "bicgstab converged after {} iterations (early), residual {:.3e}",
                    iteration + 1,
                    s_norm
                );
                return Ok(());
            }

            let ghost = importer.import(&intermediate, comm)?;
            matrix.spmv(&intermediate, &ghost, &importer, &mut t);
            let t_dot_t = global_dot(&t, &t);
            if t_dot_t == 0.0 {
                return Err(Error::Solver(
                    "bi-conjugate gradient breakdown: t vanished".to_string(),
                ));
            }
            omega = global_dot(&t, intermediate.owned()) / t_dot_t;

            for (x, p, s) in izip!(
                solution.owned_mut(),
                direction.owned(),
                intermediate.owned()
            ) {
                *x += alpha * p + omega * s;
            }
            for (r, s, ti) in izip!(&mut residual, intermediate.owned(), &t) {
                *r = s - omega * ti;
            }

            let residual_norm =
                comm.sum_all_f64(residual.iter().map(|r| r * r).sum::<f64>()).sqrt();
            if residual_norm <= tolerance {
                debug!(
                    "bicgstab converged after {} iterations, residual {:.3e}",
                    iteration + 1,
                    residual_norm
                );
                return Ok(());
            }
        }

        Err(Error::Solver(format!(
            "bicgstab did not converge within {} iterations",
            self.max_iterations
        )))
    }
}
