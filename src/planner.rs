/*!
# Patch planning

The extraction is divided into patches: a group of spectra times a core window of
[wavesize](crate::ExtractionConfig::wavesize) wavelength bins.
The core windows tile the wavelength grid exactly, each patch solves for
`nlo` and `nhi` extra border bins on both sides of its core so that the spots
of the core bins are fully modeled, the border bins are then discarded.
*/

use std::ops::Range;

use crate::{
    error::{InputError, ResourceError},
    psf::{PixelBox, Psf},
    subbundle::SpectralGroup,
    Result,
};

/// Number of standard deviations of the largest spot kept in the resolution matrix
pub const NSIGMA_RESOLUTION: f64 = 9.0;

/// Checks that the wavelength grid is linear and returns its step
pub fn uniform_step(wavelengths: &[f64]) -> std::result::Result<f64, InputError> {
    if wavelengths.len() < 2 {
        return Err(InputError::ShortGrid(wavelengths.len()));
    }
    let dw = wavelengths[1] - wavelengths[0];
    if !(dw > 0.) {
        return Err(InputError::NonUniformGrid {
            index: 0,
            step: dw,
            expected: dw,
        });
    }
    match wavelengths
        .windows(2)
        .map(|w| w[1] - w[0])
        .enumerate()
        .find(|(_, step)| !((step - dw).abs() <= 1e-8 + 1e-5 * dw.abs()))
    {
        Some((index, step)) => Err(InputError::NonUniformGrid {
            index,
            step,
            expected: dw,
        }),
        None => Ok(dw),
    }
}

/// Half width of the resolution matrix band in units of wavelength bins
///
/// Keeps the resolution matrix terms out to 9 sigma of the largest spot sampled at
/// the first, middle and last spectrum and at the blue, middle and red wavelengths,
/// but no more than half the PSF stamp
pub fn ndiag<P: Psf + ?Sized>(psf: &P, specrange: Range<usize>, dw: f64) -> usize {
    let nspec = specrange.len();
    let spectra = [
        specrange.start,
        specrange.start + nspec / 2,
        specrange.end.saturating_sub(1).max(specrange.start),
    ];
    let (wmin, wmax) = (psf.wmin(), psf.wmax());
    let waves = [wmin, 0.5 * (wmin + wmax), wmax];
    let ndiag = spectra
        .iter()
        .flat_map(|&ispec| {
            waves
                .iter()
                .map(move |&w| (NSIGMA_RESOLUTION * psf.wdisp(ispec, w) / dw).round() as usize)
        })
        .max()
        .unwrap_or_default();
    let wmid = 0.5 * (psf.wmin_all() + psf.wmax_all());
    let (ny, nx) = psf.stamp_shape(specrange.start, wmid);
    ndiag.min(ny / 2).min(nx / 2)
}

/// Extraction patch
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    /// spectra solved for in the patch
    pub specrange: Range<usize>,
    /// spectra of `specrange` written to the output
    pub keep: Vec<bool>,
    /// core window: indices of the output wavelength grid
    pub core: Range<usize>,
    /// number of border bins below the core
    pub nlo: usize,
    /// number of border bins above the core
    pub nhi: usize,
    /// border extended wavelength grid
    pub wavelengths: Vec<f64>,
    /// pixels of the core window
    pub xyrange: PixelBox,
}
impl Patch {
    /// Number of wavelength bins including the borders
    pub fn nwave(&self) -> usize {
        self.wavelengths.len()
    }
    pub fn nspec(&self) -> usize {
        self.specrange.len()
    }
    /// Number of flux bins
    pub fn nflux(&self) -> usize {
        self.nspec() * self.nwave()
    }
    /// Core bins in the patch wavelength grid
    pub fn core_in_patch(&self) -> Range<usize> {
        self.nlo..self.nlo + self.core.len()
    }
    /// Core wavelength range
    pub fn waverange(&self) -> (f64, f64) {
        (
            self.wavelengths[self.nlo],
            self.wavelengths[self.nlo + self.core.len() - 1],
        )
    }
}

/// Patch tiling of the extraction
#[derive(Debug, Clone)]
pub struct PatchPlan {
    pub ndiag: usize,
    /// wavelength step
    pub dw: f64,
    pub patches: Vec<Patch>,
}

/// Computes the [PatchPlan] of an extraction
pub struct PatchPlanner<'a, P: Psf + ?Sized> {
    psf: &'a P,
    wavesize: usize,
    max_patch_bins: usize,
}
impl<'a, P: Psf + ?Sized> PatchPlanner<'a, P> {
    pub fn new(psf: &'a P, wavesize: usize) -> Self {
        Self {
            psf,
            wavesize,
            max_patch_bins: usize::MAX,
        }
    }
    /// Upper bound on the number of flux bins of a patch
    pub fn max_patch_bins(self, max_patch_bins: usize) -> Self {
        Self {
            max_patch_bins,
            ..self
        }
    }
    /// Tiles the spectral groups and the wavelength grid into patches
    ///
    /// `specrange` is the full range of extracted spectra, it is used to size the
    /// resolution band
    pub fn plan(
        &self,
        specrange: Range<usize>,
        groups: &[SpectralGroup],
        wavelengths: &[f64],
    ) -> Result<PatchPlan> {
        if self.wavesize == 0 {
            Err(InputError::NotPositive("wavesize"))?
        }
        if specrange.is_empty() {
            Err(InputError::NotPositive("nspec"))?
        }
        let dw = uniform_step(wavelengths)?;
        let ndiag = ndiag(self.psf, specrange, dw);
        log::debug!("resolution matrix half width: {ndiag} bins of {dw}A");

        let nwave = wavelengths.len();
        let mut patches = vec![];
        for group in groups {
            for iwave in (0..nwave).step_by(self.wavesize) {
                let core = iwave..(iwave + self.wavesize).min(nwave);
                let patch = self.patch(group, core, wavelengths, dw, ndiag);
                if patch.nflux() > self.max_patch_bins {
                    Err(ResourceError::PatchTooLarge {
                        nflux: patch.nflux(),
                        limit: self.max_patch_bins,
                    })?
                }
                patches.push(patch);
            }
        }
        Ok(PatchPlan { ndiag, dw, patches })
    }

    fn patch(
        &self,
        group: &SpectralGroup,
        core: Range<usize>,
        wavelengths: &[f64],
        dw: f64,
        ndiag: usize,
    ) -> Patch {
        let psf = self.psf;
        let speclo = group.specrange.start;
        let wlo = wavelengths[core.start];
        let whi = wavelengths[core.end - 1];
        let xyrange = psf.xyrange(group.specrange.clone(), (wlo, whi));

        // border large enough to include all the spots touching the core pixels
        let (ny, _) = psf.stamp_shape(speclo, wlo);
        let ymin = xyrange.ymin as f64 - ny as f64 + 2.;
        let ymax = xyrange.ymax as f64 + ny as f64 - 2.;
        let border = |dwave: f64| ((dwave / dw) as i64 - 1).max(ndiag as i64) as usize;
        let nlo = border(wlo - psf.wavelength(speclo, ymin));
        let nhi = border(psf.wavelength(speclo, ymax) - whi);

        let nw = nlo + core.len() + nhi;
        let wavelengths = (0..nw)
            .map(|k| wlo + (k as f64 - nlo as f64) * dw)
            .collect();
        Patch {
            specrange: group.specrange.clone(),
            keep: group.keep.clone(),
            core,
            nlo,
            nhi,
            wavelengths,
            xyrange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{psf::GaussianPsf, subbundle::spectral_groups, Error};

    fn psf() -> GaussianPsf {
        GaussianPsf::new(10, (400, 120), (5000., 5300.))
            .traces(10., 10.)
            .dispersion(30., 0.5)
            .sigma(1., 1.)
            .half_width(9)
    }

    #[test]
    fn linear_grid() {
        let ww: Vec<f64> = (0..100).map(|i| 5000. + 0.8 * i as f64).collect();
        assert!((uniform_step(&ww).unwrap() - 0.8).abs() < 1e-12);
        let mut bad = ww.clone();
        bad[50] += 0.1;
        assert!(matches!(
            uniform_step(&bad),
            Err(InputError::NonUniformGrid { index: 49, .. })
        ));
        assert_eq!(uniform_step(&[5000.]), Err(InputError::ShortGrid(1)));
    }

    #[test]
    fn ndiag_clamped_to_stamp() {
        let psf = psf();
        // 9 x 0.5A / 0.5A
        assert_eq!(ndiag(&psf, 0..10, 0.5), 9);
        // 9 x 0.5A / 0.25A, stamp is 19 pixels wide
        assert_eq!(ndiag(&psf, 0..10, 0.25), 9);
        assert_eq!(ndiag(&psf, 0..10, 1.), 5);
    }

    #[test]
    fn cores_tile_the_grid() {
        let psf = psf();
        let ww: Vec<f64> = (0..95).map(|i| 5050. + 0.5 * i as f64).collect();
        let groups = spectral_groups(2, 4, 4, 1).unwrap();
        let plan = PatchPlanner::new(&psf, 20).plan(2..6, &groups, &ww).unwrap();
        assert_eq!(plan.patches.len(), 5);
        let mut next = 0;
        for patch in &plan.patches {
            assert_eq!(patch.core.start, next);
            next = patch.core.end;
            assert!(patch.nlo >= plan.ndiag && patch.nhi >= plan.ndiag);
            let core = patch.core_in_patch();
            // the patch grid is aligned on the output grid
            for (i, j) in core.zip(patch.core.clone()) {
                assert!((patch.wavelengths[i] - ww[j]).abs() < 1e-9);
            }
            assert_eq!(patch.nwave(), patch.nlo + patch.core.len() + patch.nhi);
        }
        assert_eq!(next, ww.len());
    }

    #[test]
    fn border_covers_stamp() {
        let psf = psf();
        let ww: Vec<f64> = (0..40).map(|i| 5100. + 0.5 * i as f64).collect();
        let groups = spectral_groups(0, 1, 1, 1).unwrap();
        let plan = PatchPlanner::new(&psf, 40).plan(0..1, &groups, &ww).unwrap();
        let patch = &plan.patches[0];
        // the box starts 9 rows below the 1st core bin and the border reaches 17 rows
        // further: 26 rows of 0.5A less one bin
        assert_eq!(patch.nlo, 25);
        // the box upper edge is exclusive
        assert_eq!(patch.nhi, 26);
    }

    #[test]
    fn oversized_patch() {
        let psf = psf();
        let ww: Vec<f64> = (0..40).map(|i| 5100. + 0.5 * i as f64).collect();
        let groups = spectral_groups(0, 10, 10, 1).unwrap();
        let e = PatchPlanner::new(&psf, 40)
            .max_patch_bins(500)
            .plan(0..10, &groups, &ww)
            .unwrap_err();
        assert!(matches!(
            e,
            Error::Resource(ResourceError::PatchTooLarge { limit: 500, .. })
        ));
    }
}
