/*!
# Resolution matrix

Decorrelates the raw flux of a patch following Bolton & Schlegel 2010:
with `C = V L V^T` the inverse covariance of the raw flux `f`,
`Q = V L^1/2 V^T`, `n` the row sums of `Q` and `R = diag(1/n) Q`,
the resolution convolved flux `R f` has the diagonal covariance `diag(1/n^2)`.
*/

use nalgebra::{DMatrix, DVector};

use crate::{
    backend::{LinearAlgebraBackend, SparseCpu},
    error::{InputError, NumericalError},
    Result,
};

/// Eigenvalues are floored to `EIGEN_THRESHOLD` times the largest one
pub const EIGEN_THRESHOLD: f64 = 10. * f64::EPSILON;

/// Function of the eigenvalues applied by [eigen_compose]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compose {
    Identity,
    Inverse,
    Sqrt,
    InverseSqrt,
}
impl Compose {
    fn sqrt(&self) -> bool {
        matches!(self, Compose::Sqrt | Compose::InverseSqrt)
    }
    fn invert(&self) -> bool {
        matches!(self, Compose::Inverse | Compose::InverseSqrt)
    }
}

/// Eigenvalues `w` transformed according to `op`
///
/// The (square rooted) eigenvalues below the threshold are replaced by the threshold,
/// bounding the condition number of the recomposed matrix to the machine precision
pub fn regularized_eigenvalues(w: &DVector<f64>, op: Compose) -> DVector<f64> {
    let maxval = w.max();
    let minval = if op.sqrt() {
        maxval.sqrt() * EIGEN_THRESHOLD
    } else {
        maxval * EIGEN_THRESHOLD
    };
    w.map(|wi| {
        let v = if op.sqrt() { wi.sqrt() } else { wi };
        let v = if v > minval { v } else { minval };
        if op.invert() {
            v.recip()
        } else {
            v
        }
    })
}

/// Recomposes the real symmetric matrix `V f(W) V^T` from its eigenvalues `w` and
/// eigenvectors `v` (columns)
pub fn eigen_compose(w: &DVector<f64>, v: &DMatrix<f64>, op: Compose) -> DMatrix<f64> {
    let scaled = regularized_eigenvalues(w, op);
    let mut vs = v.clone();
    vs.column_iter_mut()
        .zip(scaled.iter())
        .for_each(|(mut col, &s)| col *= s);
    vs * v.transpose()
}

/// Formula for the inverse variance of the decorrelated flux
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VarianceFormula {
    /// `n^2`, Bolton & Schlegel 2010 eq. 13
    #[default]
    NormVector,
    /// `1 / diag(R C^-1 R^T)`, the propagated covariance of the decorrelated flux
    Propagated,
}

/// Resolution matrix and decorrelated inverse variance
#[derive(Debug, Clone)]
pub struct Resolution {
    pub r: DMatrix<f64>,
    /// normalization vector
    pub norm: DVector<f64>,
    pub ivar: DVector<f64>,
}
impl Resolution {
    /// Resolution convolved flux
    pub fn convolve(&self, xflux: &DVector<f64>) -> DVector<f64> {
        &self.r * xflux
    }
}

pub struct ResolutionBuilder<'a> {
    backend: &'a dyn LinearAlgebraBackend,
    variance: VarianceFormula,
}
impl<'a> ResolutionBuilder<'a> {
    pub fn new(backend: &'a dyn LinearAlgebraBackend) -> Self {
        Self {
            backend,
            variance: VarianceFormula::default(),
        }
    }
    pub fn variance(self, variance: VarianceFormula) -> Self {
        Self { variance, ..self }
    }

    fn eigen(&self, m: DMatrix<f64>) -> Result<(DVector<f64>, DMatrix<f64>)> {
        let (w, v) = self.backend.symmetric_eigen(m);
        let n_bad = w.iter().filter(|x| !x.is_finite()).count();
        if n_bad > 0 {
            Err(NumericalError::NonFiniteEigenvalues(n_bad))?
        }
        Ok((w, v))
    }

    /// Resolution matrix of the inverse covariance `icov`
    ///
    /// If `decorr` is given, it is the list of the number of flux bins of each spectrum:
    /// `R` is then block diagonal, the signal is not mixed between spectra at the cost
    /// of a noise correlated between spectra
    pub fn resolution(&self, icov: &DMatrix<f64>, decorr: Option<&[usize]>) -> Result<Resolution> {
        let dim = icov.nrows();
        if let Some(blocks) = decorr {
            let sum: usize = blocks.iter().sum();
            if sum != dim {
                Err(InputError::DecorrBlocks { sum, dim })?
            }
        }

        // rounding may break the symmetry
        let icov = (icov + icov.transpose()) * 0.5;
        let (w, v) = self.eigen(icov)?;

        let sqrt_icov = match decorr {
            Some(blocks) => {
                let inverse = eigen_compose(&w, &v, Compose::Inverse);
                let mut q = DMatrix::<f64>::zeros(dim, dim);
                let mut offset = 0;
                for &b in blocks {
                    let (bw, bv) = self.eigen(inverse.view((offset, offset), (b, b)).into_owned())?;
                    q.view_mut((offset, offset), (b, b))
                        .copy_from(&eigen_compose(&bw, &bv, Compose::InverseSqrt));
                    offset += b;
                }
                q
            }
            None => eigen_compose(&w, &v, Compose::Sqrt),
        };

        let norm = DVector::from_iterator(dim, sqrt_icov.row_iter().map(|row| row.sum()));
        if let Some(i) = norm.iter().position(|n| !n.is_finite() || *n == 0.) {
            Err(NumericalError::Normalization(i))?
        }
        let mut r = sqrt_icov;
        r.row_iter_mut()
            .zip(norm.iter())
            .for_each(|(mut row, &n)| row /= n);

        let ivar = match self.variance {
            VarianceFormula::NormVector => norm.map(|n| n * n),
            VarianceFormula::Propagated => {
                let rc = &r * eigen_compose(&w, &v, Compose::Inverse);
                DVector::from_iterator(
                    dim,
                    rc.row_iter()
                        .zip(r.row_iter())
                        .map(|(rc, r)| rc.dot(&r).recip()),
                )
            }
        };
        Ok(Resolution { r, norm, ivar })
    }
}

/// Resolution matrix and decorrelated inverse variance of `icov` computed on the CPU
pub fn resolution_from_icov(
    icov: &DMatrix<f64>,
    decorr: Option<&[usize]>,
) -> Result<(DMatrix<f64>, DVector<f64>)> {
    let Resolution { r, ivar, .. } = ResolutionBuilder::new(&SparseCpu).resolution(icov, decorr)?;
    Ok((r, ivar))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_icov(seed: u64, n: usize) -> DMatrix<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let m = DMatrix::from_fn(n, n, |_, _| rng.gen::<f64>() - 0.5);
        &m * m.transpose() + DMatrix::identity(n, n) * n as f64
    }

    #[test]
    fn rows_sum_to_one() {
        for seed in 0..5 {
            let icov = random_icov(seed, 24);
            let (r, ivar) = resolution_from_icov(&icov, None).unwrap();
            r.row_iter()
                .for_each(|row| assert!((row.sum() - 1.).abs() < 1e-8));
            assert!(ivar.iter().all(|&v| v > 0.));
            let (r, _) = resolution_from_icov(&icov, Some(&[10, 14])).unwrap();
            r.row_iter()
                .for_each(|row| assert!((row.sum() - 1.).abs() < 1e-8));
        }
    }

    #[test]
    fn double_inversion() {
        let m = random_icov(1, 16);
        let eig = m.clone().symmetric_eigen();
        let inverse = eigen_compose(&eig.eigenvalues, &eig.eigenvectors, Compose::Inverse);
        assert!((&inverse * &m - DMatrix::identity(16, 16)).amax() < 1e-10);
        let eig = inverse.symmetric_eigen();
        let m2 = eigen_compose(&eig.eigenvalues, &eig.eigenvectors, Compose::Inverse);
        assert!((&m2 - &m).amax() < 1e-9 * m.amax());
    }

    #[test]
    fn square_root_then_square() {
        let m = random_icov(2, 16);
        let eig = m.clone().symmetric_eigen();
        let s = eigen_compose(&eig.eigenvalues, &eig.eigenvectors, Compose::Sqrt);
        assert!((&s * &s - &m).amax() < 1e-9 * m.amax());
        let is = eigen_compose(&eig.eigenvalues, &eig.eigenvectors, Compose::InverseSqrt);
        assert!((&s * &is - DMatrix::identity(16, 16)).amax() < 1e-10);
        let id = eigen_compose(&eig.eigenvalues, &eig.eigenvectors, Compose::Identity);
        assert!((&id - &m).amax() < 1e-9 * m.amax());
    }

    #[test]
    fn floored_eigenvalues() {
        let w = DVector::from_vec(vec![4., 1e-40, -1e-18, 0.]);
        let floor = 4. * EIGEN_THRESHOLD;
        let inv = regularized_eigenvalues(&w, Compose::Inverse);
        assert_eq!(inv[0], 0.25);
        assert!(inv.iter().skip(1).all(|&x| x == floor.recip()));
        let sqrt = regularized_eigenvalues(&w, Compose::Sqrt);
        assert_eq!(sqrt[0], 2.);
        assert!(sqrt.iter().skip(1).all(|&x| x == 2. * EIGEN_THRESHOLD));
        assert!(regularized_eigenvalues(&w, Compose::InverseSqrt)
            .iter()
            .all(|x| x.is_finite()));
    }

    #[test]
    fn decorr_blocks_must_sum_to_size() {
        let icov = random_icov(3, 10);
        let e = resolution_from_icov(&icov, Some(&[4, 5])).unwrap_err();
        assert!(matches!(
            e,
            Error::Input(InputError::DecorrBlocks { sum: 9, dim: 10 })
        ));
    }

    #[test]
    fn block_decorrelation_is_block_diagonal() {
        let icov = random_icov(4, 12);
        let (r, _) = resolution_from_icov(&icov, Some(&[6, 6])).unwrap();
        assert!(r.view((0, 6), (6, 6)).amax() == 0.);
        assert!(r.view((6, 0), (6, 6)).amax() == 0.);
        let (r, _) = resolution_from_icov(&icov, None).unwrap();
        assert!(r.view((0, 6), (6, 6)).amax() > 0.);
    }

    #[test]
    fn variance_formulas_agree_when_well_conditioned() {
        let icov = random_icov(5, 20);
        for decorr in [None, Some([8usize, 12].as_slice())] {
            let n = ResolutionBuilder::new(&SparseCpu)
                .resolution(&icov, decorr)
                .unwrap();
            let p = ResolutionBuilder::new(&SparseCpu)
                .variance(VarianceFormula::Propagated)
                .resolution(&icov, decorr)
                .unwrap();
            n.ivar
                .iter()
                .zip(p.ivar.iter())
                .for_each(|(a, b)| assert!((a - b).abs() < 1e-8 * a, "{a} {b}"));
        }
    }

    #[test]
    fn uncorrelated_flux() {
        let icov = DMatrix::from_diagonal(&DVector::from_vec(vec![4., 9., 16.]));
        let (r, ivar) = resolution_from_icov(&icov, None).unwrap();
        assert!((r - DMatrix::identity(3, 3)).amax() < 1e-12);
        assert!((ivar - icov.diagonal()).amax() < 1e-12);
    }
}
