/*!
# Patch solver

Solves the weighted normal equations of a patch (Bolton & Schlegel 2010 eq. 4)
```text
(A^T W A) f = A^T W p
```
for the raw, deconvolved, flux `f`.

Flux bins with very little pixel weight, at the edges of the patch or of a bundle,
are only constrained by the wings of the PSF.
They are regularized by stacking an identity block below `A` (extra pixels of
unit weight and null value) which pulls them softly towards zero.
*/

use nalgebra::{DMatrix, DVector};

use crate::{
    backend::LinearAlgebraBackend,
    error::NumericalError,
    psf::ProjectionMatrix,
};

/// Flux bins with less than `MIN_WEIGHT_FRACTION` of the largest flux bin weight are underdetermined
///
/// The ratio of the CCD read noise variance to the Poisson variance of a pixel at full well
pub const MIN_WEIGHT_FRACTION: f64 = 1e-4;

/// Algorithm used to solve the normal equations
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SolveStrategy {
    /// Cholesky factorization with a LU fallback
    #[default]
    Direct,
    /// Iterative solver, defaults to `10 x nflux` iterations
    ConjugateGradient {
        tolerance: f64,
        max_iterations: Option<usize>,
    },
}

/// Raw flux solution of a patch
#[derive(Debug, Clone)]
pub struct PatchSolution {
    /// deconvolved flux
    pub xflux: DVector<f64>,
    /// regularized inverse covariance of `xflux`
    pub icov: DMatrix<f64>,
    /// per flux bin pixel weight
    pub fluxweight: DVector<f64>,
    /// flux bins with a weight below the threshold
    pub underdetermined: Vec<bool>,
}
impl PatchSolution {
    pub fn n_underdetermined(&self) -> usize {
        self.underdetermined.iter().filter(|&&b| b).count()
    }
}

pub struct PatchSolver<'a> {
    backend: &'a dyn LinearAlgebraBackend,
    strategy: SolveStrategy,
    regularize: f64,
}
impl<'a> PatchSolver<'a> {
    pub fn new(backend: &'a dyn LinearAlgebraBackend) -> Self {
        Self {
            backend,
            strategy: SolveStrategy::default(),
            regularize: 0.,
        }
    }
    pub fn strategy(self, strategy: SolveStrategy) -> Self {
        Self { strategy, ..self }
    }
    /// Regularization strength applied to all the flux bins
    pub fn regularize(self, regularize: f64) -> Self {
        Self { regularize, ..self }
    }
    /// Diagonal of the identity block stacked below `A`
    pub fn regularization(&self, fluxweight: &DVector<f64>) -> (DVector<f64>, Vec<bool>) {
        let minweight = MIN_WEIGHT_FRACTION * fluxweight.max();
        let underdetermined: Vec<bool> = fluxweight.iter().map(|&w| w < minweight).collect();
        let diag = DVector::from_iterator(
            fluxweight.len(),
            fluxweight
                .iter()
                .zip(&underdetermined)
                .map(|(&w, &bad)| if bad { minweight - w } else { self.regularize }),
        );
        (diag, underdetermined)
    }
    /// Solves for the raw flux of the patch pixels `pix` with inverse variance `ivar`
    pub fn solve(
        &self,
        a: &ProjectionMatrix,
        pix: &DVector<f64>,
        ivar: &DVector<f64>,
    ) -> Result<PatchSolution, NumericalError> {
        let fluxweight = self.backend.column_weights(a, ivar);
        let (diag, underdetermined) = self.regularization(&fluxweight);

        let mut normal = self.backend.normal_equations(a, ivar, pix);
        // the stacked identity rows have unit weight and null pixel values:
        // they add diag^2 to the inverse covariance and nothing to A^T W p
        if diag.iter().any(|&d| d != 0.) {
            normal
                .icov
                .set_diagonal(&(normal.icov.diagonal() + diag.component_mul(&diag)));
        }

        let xflux = self.backend.solve(&normal.icov, &normal.y, &self.strategy)?;
        let n_bad = xflux.iter().filter(|x| !x.is_finite()).count();
        if n_bad > 0 {
            return Err(NumericalError::NonFiniteFlux(n_bad));
        }
        Ok(PatchSolution {
            xflux,
            icov: normal.icov,
            fluxweight,
            underdetermined,
        })
    }
}
