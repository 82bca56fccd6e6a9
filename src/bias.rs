/*!
# PSF model bias

Offline diagnostic of the flux bias of an extraction done with a PSF model `B`
when the true PSF is `A`.
For a single spectrum with photons `phot`, the noiseless image is `A phot` and
the pixel weights are `W = diag(1 / (readnoise^2 + A phot))`.
The extraction with `B` returns the decorrelated flux
`R_B (B^T W B)^-1 B^T W A phot`, to be compared to the flux `R_A phot` of an
extraction with the true PSF.
*/

use nalgebra::{DMatrix, DVector};

use crate::{
    error::{InputError, NumericalError},
    psf::{project, Psf},
    resolution::resolution_from_icov,
    Result,
};

/// PSF model bias of the extraction of one spectrum
pub struct BiasEstimator<'a, P1: Psf + ?Sized, P2: Psf + ?Sized> {
    truth: &'a P1,
    model: &'a P2,
    ispec: usize,
    readnoise: f64,
}
impl<'a, P1: Psf + ?Sized, P2: Psf + ?Sized> BiasEstimator<'a, P1, P2> {
    /// Bias of extracting with `model` if the real PSF is `truth`
    pub fn new(truth: &'a P1, model: &'a P2) -> Self {
        Self {
            truth,
            model,
            ispec: 0,
            readnoise: 3.,
        }
    }
    pub fn spectrum(self, ispec: usize) -> Self {
        Self { ispec, ..self }
    }
    /// CCD read noise [electron]
    pub fn readnoise(self, readnoise: f64) -> Self {
        Self { readnoise, ..self }
    }

    /// Absolute bias `(R_B Cov_B B^T W A - R_A) phot` and the resolution matrix `R_A`
    pub fn absolute(&self, wave: &[f64], phot: &[f64]) -> Result<(DVector<f64>, DMatrix<f64>)> {
        if wave.len() != phot.len() {
            Err(InputError::LengthMismatch {
                wave: wave.len(),
                phot: phot.len(),
            })?
        }
        if wave.is_empty() {
            Err(InputError::ShortGrid(0))?
        }
        let specrange = self.ispec..self.ispec + 1;
        let xyrange = self
            .truth
            .xyrange(specrange.clone(), (wave[0], wave[wave.len() - 1]));
        let a = self.truth.projection_matrix(specrange.clone(), wave, &xyrange);
        let b = self.model.projection_matrix(specrange, wave, &xyrange);

        // shot noise and read noise
        let weights = DVector::from_iterator(
            a.nrows(),
            project(&a, phot)
                .into_iter()
                .map(|p| (self.readnoise * self.readnoise + p).recip()),
        );
        let a = DMatrix::from(&a);
        let b = DMatrix::from(&b);
        let mut wa = a.clone();
        wa.row_iter_mut()
            .zip(weights.iter())
            .for_each(|(mut row, &w)| row *= w);
        let mut wb = b.clone();
        wb.row_iter_mut()
            .zip(weights.iter())
            .for_each(|(mut row, &w)| row *= w);

        let ia_cov = a.transpose() * &wa;
        let ib_cov = b.transpose() * &wb;
        let b_cov = ib_cov
            .clone()
            .try_inverse()
            .ok_or(NumericalError::Singular)?;

        let (ra, _) = resolution_from_icov(&ia_cov, None)?;
        let (rb, _) = resolution_from_icov(&ib_cov, None)?;

        let phot = DVector::from_column_slice(phot);
        let bias = (rb * b_cov * b.transpose() * wa - &ra) * phot;
        Ok((bias, ra))
    }

    /// Relative bias `(R_B Cov_B B^T W A - R_A) phot / (R_A phot)`
    pub fn relative(&self, wave: &[f64], phot: &[f64]) -> Result<DVector<f64>> {
        let (bias, ra) = self.absolute(wave, phot)?;
        let flux = ra * DVector::from_column_slice(phot);
        Ok(bias.component_div(&flux))
    }
}

/// Relative bias of extracting spectrum `ispec` with PSF `p2` if the real PSF is `p1`
pub fn psf_bias<P1: Psf + ?Sized, P2: Psf + ?Sized>(
    p1: &P1,
    p2: &P2,
    wave: &[f64],
    phot: &[f64],
    ispec: usize,
    readnoise: f64,
) -> Result<DVector<f64>> {
    BiasEstimator::new(p1, p2)
        .spectrum(ispec)
        .readnoise(readnoise)
        .relative(wave, phot)
}

/// Absolute bias of extracting spectrum `ispec` with PSF `p2` if the real PSF is `p1`
/// and the resolution matrix of `p1`
pub fn psf_abs_bias<P1: Psf + ?Sized, P2: Psf + ?Sized>(
    p1: &P1,
    p2: &P2,
    wave: &[f64],
    phot: &[f64],
    ispec: usize,
    readnoise: f64,
) -> Result<(DVector<f64>, DMatrix<f64>)> {
    BiasEstimator::new(p1, p2)
        .spectrum(ispec)
        .readnoise(readnoise)
        .absolute(wave, phot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{psf::GaussianPsf, Error};

    fn psf() -> GaussianPsf {
        GaussianPsf::new(2, (100, 40), (5000., 5050.))
            .traces(15., 10.)
            .dispersion(0., 0.5)
            .sigma(1., 1.)
            .half_width(6)
    }

    fn spectrum() -> (Vec<f64>, Vec<f64>) {
        let wave: Vec<f64> = (0..41).map(|i| 5010. + 0.5 * i as f64).collect();
        (wave, vec![1000.; 41])
    }

    #[test]
    fn unbiased_with_the_true_psf() {
        let psf = psf();
        let (wave, phot) = spectrum();
        let bias = psf_bias(&psf, &psf, &wave, &phot, 1, 3.).unwrap();
        assert_eq!(bias.len(), 41);
        assert!(bias.amax() < 1e-6, "{}", bias.amax());
    }

    #[test]
    fn wrong_cross_dispersion_width() {
        let truth = psf();
        let model = psf().sigma(1.2, 1.);
        let (wave, phot) = spectrum();
        let relative = psf_bias(&truth, &model, &wave, &phot, 0, 3.).unwrap();
        assert!(relative[20].abs() > 1e-2);
        let (absolute, ra) = psf_abs_bias(&truth, &model, &wave, &phot, 0, 3.).unwrap();
        assert_eq!(ra.shape(), (41, 41));
        let flux = &ra * DVector::from_column_slice(&phot);
        for i in 0..41 {
            assert!((absolute[i] - relative[i] * flux[i]).abs() < 1e-9 * flux[i].abs());
        }
    }

    #[test]
    fn mismatched_inputs() {
        let psf = psf();
        let (wave, _) = spectrum();
        let e = psf_bias(&psf, &psf, &wave, &[1.; 10], 0, 3.).unwrap_err();
        assert!(matches!(
            e,
            Error::Input(InputError::LengthMismatch { wave: 41, phot: 10 })
        ));
    }
}
