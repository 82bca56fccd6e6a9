use serde::{Deserialize, Serialize};

use crate::{
    backend::BackendKind, error::InputError, resolution::VarianceFormula, solver::SolveStrategy,
};

/// Extraction parameters
///
/// ```
/// use spex2d::ExtractionConfig;
///
/// let wavelengths: Vec<f64> = (0..200).map(|i| 5000. + 0.5 * i as f64).collect();
/// let config = ExtractionConfig::new(0, 20, wavelengths)
///     .bundlesize(10)
///     .nsubbundles(2)
///     .wavesize(40)
///     .full_output(true);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// first spectrum
    pub specmin: usize,
    /// number of spectra
    pub nspec: usize,
    /// linear output wavelength grid [A]
    pub wavelengths: Vec<f64>,
    /// number of spectra per bundle
    pub bundlesize: usize,
    /// number of subbundles a bundle is split into
    pub nsubbundles: usize,
    /// number of wavelength bins in the core of a patch
    pub wavesize: usize,
    /// flux bins regularization strength
    pub regularize: f64,
    /// decorrelates the spectra independently of each other
    pub ndecorr: bool,
    /// fractional PSF model error, defaults to the PSF value
    pub psferr: Option<f64>,
    /// computes the model image and the pixel diagnostics
    pub full_output: bool,
    pub solver: SolveStrategy,
    pub variance: VarianceFormula,
    pub backend: BackendKind,
    /// upper bound on the number of flux bins of a patch
    pub max_patch_bins: usize,
    /// solves the patches in parallel
    pub parallel: bool,
}
impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            specmin: 0,
            nspec: 0,
            wavelengths: vec![],
            bundlesize: 25,
            nsubbundles: 1,
            wavesize: 50,
            regularize: 0.,
            ndecorr: false,
            psferr: None,
            full_output: false,
            solver: SolveStrategy::default(),
            variance: VarianceFormula::default(),
            backend: BackendKind::default(),
            max_patch_bins: 10_000,
            parallel: true,
        }
    }
}
impl ExtractionConfig {
    /// Extraction of spectra `[specmin, specmin + nspec)` on the `wavelengths` grid
    pub fn new(specmin: usize, nspec: usize, wavelengths: Vec<f64>) -> Self {
        Self {
            specmin,
            nspec,
            wavelengths,
            ..Default::default()
        }
    }
    pub fn bundlesize(self, bundlesize: usize) -> Self {
        Self { bundlesize, ..self }
    }
    pub fn nsubbundles(self, nsubbundles: usize) -> Self {
        Self {
            nsubbundles,
            ..self
        }
    }
    pub fn wavesize(self, wavesize: usize) -> Self {
        Self { wavesize, ..self }
    }
    pub fn regularize(self, regularize: f64) -> Self {
        Self { regularize, ..self }
    }
    pub fn ndecorr(self, ndecorr: bool) -> Self {
        Self { ndecorr, ..self }
    }
    pub fn psferr(self, psferr: f64) -> Self {
        Self {
            psferr: Some(psferr),
            ..self
        }
    }
    pub fn full_output(self, full_output: bool) -> Self {
        Self {
            full_output,
            ..self
        }
    }
    pub fn solver(self, solver: SolveStrategy) -> Self {
        Self { solver, ..self }
    }
    pub fn variance(self, variance: VarianceFormula) -> Self {
        Self { variance, ..self }
    }
    pub fn backend(self, backend: BackendKind) -> Self {
        Self { backend, ..self }
    }
    pub fn max_patch_bins(self, max_patch_bins: usize) -> Self {
        Self {
            max_patch_bins,
            ..self
        }
    }
    pub fn parallel(self, parallel: bool) -> Self {
        Self { parallel, ..self }
    }
    /// Spectra range
    pub fn specrange(&self) -> std::ops::Range<usize> {
        self.specmin..self.specmin + self.nspec
    }

    /// Checks the parameters that do not depend on the PSF
    pub fn validate(&self) -> Result<(), InputError> {
        for (value, name) in [
            (self.nspec, "nspec"),
            (self.bundlesize, "bundlesize"),
            (self.nsubbundles, "nsubbundles"),
            (self.wavesize, "wavesize"),
            (self.max_patch_bins, "max_patch_bins"),
        ] {
            if value == 0 {
                return Err(InputError::NotPositive(name));
            }
        }
        if self.nsubbundles > self.bundlesize {
            return Err(InputError::TooManySubbundles {
                n: self.nsubbundles,
                bundlesize: self.bundlesize,
            });
        }
        if !(self.regularize.is_finite() && self.regularize >= 0.) {
            return Err(InputError::Regularize(self.regularize));
        }
        if let Some(psferr) = self.psferr {
            if !(psferr.is_finite() && psferr > 0.) {
                return Err(InputError::NotPositive("psferr"));
            }
        }
        if let SolveStrategy::ConjugateGradient { tolerance, .. } = self.solver {
            if !(tolerance > 0.) {
                return Err(InputError::NotPositive("tolerance"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ExtractionConfig::new(10, 5, vec![1., 2.]);
        assert_eq!(config.bundlesize, 25);
        assert_eq!(config.wavesize, 50);
        assert_eq!(config.max_patch_bins, 10_000);
        assert!(config.parallel && !config.full_output && !config.ndecorr);
        assert_eq!(config.specrange(), 10..15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_parameters() {
        let config = ExtractionConfig::new(0, 5, vec![1., 2.]);
        assert_eq!(
            config.clone().regularize(-1.).validate(),
            Err(InputError::Regularize(-1.))
        );
        assert!(config.clone().regularize(f64::NAN).validate().is_err());
        assert_eq!(
            config.clone().wavesize(0).validate(),
            Err(InputError::NotPositive("wavesize"))
        );
        assert_eq!(
            config.clone().bundlesize(4).nsubbundles(5).validate(),
            Err(InputError::TooManySubbundles {
                n: 5,
                bundlesize: 4
            })
        );
        assert_eq!(
            config.psferr(0.).validate(),
            Err(InputError::NotPositive("psferr"))
        );
    }
}
