/*!
# Linear algebra backends

The expensive linear algebra of a patch goes through a [LinearAlgebraBackend].
Every method takes host memory inputs and returns host memory outputs:
a backend running on an accelerator stages the inputs to the device and the
results back to the host before returning, one patch at a time.
*/

use nalgebra::{DMatrix, DVector};

use crate::{
    error::NumericalError,
    psf::{project_transpose, ProjectionMatrix},
    solver::SolveStrategy,
};

/// Weighted normal equations `C x = y`
#[derive(Debug, Clone)]
pub struct NormalEquations {
    /// inverse covariance `A^T W A`
    pub icov: DMatrix<f64>,
    /// `A^T W pix`
    pub y: DVector<f64>,
}

pub trait LinearAlgebraBackend: Send + Sync {
    fn name(&self) -> &'static str;
    /// Assembles `A^T W A` and `A^T W pix` with `W = diag(weights)`
    ///
    /// Pixels with a null weight do not contribute, whatever their value
    fn normal_equations(
        &self,
        a: &ProjectionMatrix,
        weights: &DVector<f64>,
        pix: &DVector<f64>,
    ) -> NormalEquations;
    /// Column sums of `W A`
    fn column_weights(&self, a: &ProjectionMatrix, weights: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(project_transpose(a, weights.as_slice()))
    }
    /// Solves the symmetric positive (semi-)definite system `icov x = y`
    fn solve(
        &self,
        icov: &DMatrix<f64>,
        y: &DVector<f64>,
        strategy: &SolveStrategy,
    ) -> Result<DVector<f64>, NumericalError> {
        match *strategy {
            SolveStrategy::Direct => direct_solve(icov, y),
            SolveStrategy::ConjugateGradient {
                tolerance,
                max_iterations,
            } => conjugate_gradient(
                icov,
                y,
                tolerance,
                max_iterations.unwrap_or(10 * y.len().max(1)),
            ),
        }
    }
    /// Eigenvalues and eigenvectors (columns) of the real symmetric matrix `m`
    fn symmetric_eigen(&self, m: DMatrix<f64>) -> (DVector<f64>, DMatrix<f64>) {
        let eig = m.symmetric_eigen();
        (eig.eigenvalues, eig.eigenvectors)
    }
}

/// Cholesky factorization, falling back to LU for semi-definite systems
pub fn direct_solve(icov: &DMatrix<f64>, y: &DVector<f64>) -> Result<DVector<f64>, NumericalError> {
    if let Some(chol) = icov.clone().cholesky() {
        return Ok(chol.solve(y));
    }
    log::debug!("normal equations are not positive definite, solving with LU");
    icov.clone().lu().solve(y).ok_or(NumericalError::Singular)
}

/// Jacobi preconditioned conjugate gradient
pub fn conjugate_gradient(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> Result<DVector<f64>, NumericalError> {
    let n = b.len();
    let mut x = DVector::<f64>::zeros(n);
    let bnorm = b.norm();
    if bnorm == 0. {
        return Ok(x);
    }
    let inv_diag = a.diagonal().map(|d| if d > 0. { d.recip() } else { 1. });
    let mut r = b.clone();
    let mut z = r.component_mul(&inv_diag);
    let mut p = z.clone();
    let mut rz = r.dot(&z);
    let mut iterations = 0;
    while iterations < max_iterations {
        if r.norm() <= tolerance * bnorm {
            return Ok(x);
        }
        let ap = a * &p;
        let pap = p.dot(&ap);
        if !(pap > 0.) {
            break;
        }
        let alpha = rz / pap;
        x.axpy(alpha, &p, 1.);
        r.axpy(-alpha, &ap, 1.);
        z = r.component_mul(&inv_diag);
        let rz_next = r.dot(&z);
        p = &z + &p * (rz_next / rz);
        rz = rz_next;
        iterations += 1;
    }
    let residual = r.norm() / bnorm;
    if residual <= tolerance {
        Ok(x)
    } else {
        Err(NumericalError::NotConverged {
            iterations,
            residual,
        })
    }
}

/// Assembles the normal equations from the sparse rows of the projection matrix
#[derive(Debug, Default, Clone, Copy)]
pub struct SparseCpu;
impl LinearAlgebraBackend for SparseCpu {
    fn name(&self) -> &'static str {
        "sparse CPU"
    }
    fn normal_equations(
        &self,
        a: &ProjectionMatrix,
        weights: &DVector<f64>,
        pix: &DVector<f64>,
    ) -> NormalEquations {
        let n = a.ncols();
        let mut icov = DMatrix::<f64>::zeros(n, n);
        let mut y = DVector::<f64>::zeros(n);
        for (i, row) in a.row_iter().enumerate() {
            let w = weights[i];
            if w == 0. {
                continue;
            }
            let (cols, vals) = (row.col_indices(), row.values());
            for (&j, &a_ij) in cols.iter().zip(vals) {
                let wa = w * a_ij;
                y[j] += wa * pix[i];
                for (&k, &a_ik) in cols.iter().zip(vals) {
                    icov[(j, k)] += wa * a_ik;
                }
            }
        }
        NormalEquations { icov, y }
    }
}

/// Assembles the normal equations with dense matrix products
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseCpu;
impl LinearAlgebraBackend for DenseCpu {
    fn name(&self) -> &'static str {
        "dense CPU"
    }
    fn normal_equations(
        &self,
        a: &ProjectionMatrix,
        weights: &DVector<f64>,
        pix: &DVector<f64>,
    ) -> NormalEquations {
        let a = DMatrix::from(a);
        let mut wa = a.clone();
        wa.row_iter_mut()
            .zip(weights.iter())
            .for_each(|(mut row, &w)| row *= w);
        let wpix = pix.zip_map(weights, |p, w| if w == 0. { 0. } else { w * p });
        NormalEquations {
            icov: a.transpose() * wa,
            y: a.transpose() * wpix,
        }
    }
}

/// Backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BackendKind {
    #[default]
    SparseCpu,
    DenseCpu,
}
impl BackendKind {
    pub fn backend(&self) -> Box<dyn LinearAlgebraBackend> {
        match self {
            BackendKind::SparseCpu => Box::new(SparseCpu),
            BackendKind::DenseCpu => Box::new(DenseCpu),
        }
    }
}
