/*!
# Patch stitching

Each patch keeps the core bins of its kept spectra, the border bins are only
there to stabilize the solution and are discarded.
The cropped patches are merged into the output arrays in plan order.
*/

use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::{
    image::SubImage,
    planner::Patch,
    psf::{project, project_transpose, PixelBox, ProjectionMatrix},
    resolution::Resolution,
};

/// Banded storage `[nspec, 2 ndiag + 1, nwave]` of the per spectrum resolution matrices
///
/// `get(ispec, k, j)` is the element `R[j - ndiag + k, j]` of the resolution matrix of spectrum `ispec`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionData {
    nspec: usize,
    ndiag: usize,
    nwave: usize,
    data: Vec<f64>,
}
impl ResolutionData {
    pub fn new(nspec: usize, ndiag: usize, nwave: usize) -> Self {
        Self {
            nspec,
            ndiag,
            nwave,
            data: vec![0f64; nspec * (2 * ndiag + 1) * nwave],
        }
    }
    pub fn ndiag(&self) -> usize {
        self.ndiag
    }
    /// Number of diagonals `2 ndiag + 1`
    pub fn ndiagonals(&self) -> usize {
        2 * self.ndiag + 1
    }
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.nspec, self.ndiagonals(), self.nwave)
    }
    fn offset(&self, ispec: usize, k: usize, j: usize) -> usize {
        (ispec * self.ndiagonals() + k) * self.nwave + j
    }
    pub fn get(&self, ispec: usize, k: usize, j: usize) -> f64 {
        self.data[self.offset(ispec, k, j)]
    }
    pub fn set(&mut self, ispec: usize, k: usize, j: usize, value: f64) {
        let i = self.offset(ispec, k, j);
        self.data[i] = value;
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
    /// Dense `[nwave, nwave]` resolution matrix of spectrum `ispec`
    pub fn to_matrix(&self, ispec: usize) -> DMatrix<f64> {
        let mut r = DMatrix::zeros(self.nwave, self.nwave);
        for j in 0..self.nwave {
            for k in 0..self.ndiagonals() {
                if let Some(i) = (j + k).checked_sub(self.ndiag).filter(|&i| i < self.nwave) {
                    r[(i, j)] = self.get(ispec, k, j);
                }
            }
        }
        r
    }
    /// Convolves `flux` with the resolution matrix of spectrum `ispec`
    pub fn apply(&self, ispec: usize, flux: &[f64]) -> Vec<f64> {
        let mut out = vec![0f64; self.nwave];
        for j in 0..self.nwave {
            for k in 0..self.ndiagonals() {
                if let Some(i) = (j + k).checked_sub(self.ndiag).filter(|&i| i < self.nwave) {
                    out[i] += self.get(ispec, k, j) * flux[j];
                }
            }
        }
        out
    }
}

/// Model based diagnostics of a patch, one value per flux bin
#[derive(Debug, Clone)]
pub struct PatchDiagnostics {
    /// model image of the patch pixels
    pub model: Vec<f64>,
    pub pixmask_fraction: Vec<f64>,
    pub chi2pix: Vec<f64>,
}
impl PatchDiagnostics {
    /// Compares the model `A xflux` to the patch pixels
    ///
    /// The pixel variance includes the fractional PSF model error `psferr`,
    /// the chi-square of a flux bin is weighted by its projection on the pixels
    pub fn new(a: &ProjectionMatrix, xflux: &DVector<f64>, sub: &SubImage, psferr: f64) -> Self {
        let model = project(a, xflux.as_slice());

        let unmasked: Vec<f64> = sub.ivar.iter().map(|&v| f64::from(v > 0.)).collect();
        let pixmask_fraction = project_transpose(a, &unmasked)
            .into_iter()
            .map(|f| 1. - f)
            .collect();

        let totpix_ivar: Vec<f64> = model
            .iter()
            .zip(sub.ivar.iter())
            .map(|(&m, &ivar)| {
                let modelivar = (m * psferr + 1e-32).powi(-2);
                if modelivar > 0. && ivar > 0. {
                    (modelivar.recip() + ivar.recip()).recip()
                } else {
                    0.
                }
            })
            .collect();
        let chi2: Vec<f64> = sub
            .pix
            .iter()
            .zip(&model)
            .zip(&totpix_ivar)
            .map(|((&p, &m), &w)| (p - m) * (p - m) * w)
            .collect();
        let weighted: Vec<f64> = totpix_ivar.iter().map(|&w| f64::from(w > 0.)).collect();
        let psfweight = project_transpose(a, &weighted);
        let chi2pix = project_transpose(a, &chi2)
            .into_iter()
            .zip(psfweight)
            .map(|(c, w)| if w == 0. { 0. } else { c / w })
            .collect();
        Self {
            model,
            pixmask_fraction,
            chi2pix,
        }
    }
}

/// Core region of a patch, ready to be merged in the output
#[derive(Debug, Clone)]
pub struct PatchCore {
    /// output rows of the kept spectra
    pub rows: Vec<usize>,
    /// output wavelength bins
    pub core: Range<usize>,
    /// `[rows, core]`
    pub flux: DMatrix<f64>,
    pub ivar: DMatrix<f64>,
    /// one `[2 ndiag + 1, core]` band per row
    pub bands: Vec<DMatrix<f64>>,
    pub diagnostics: Option<CoreDiagnostics>,
}

#[derive(Debug, Clone)]
pub struct CoreDiagnostics {
    pub xyrange: PixelBox,
    pub model: Vec<f64>,
    pub pixmask_fraction: DMatrix<f64>,
    pub chi2pix: DMatrix<f64>,
}

/// Diagnostic outputs of the extraction
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    /// model image, same shape as the input image
    pub modelimage: DMatrix<f64>,
    /// fraction of masked pixels `[nspec, nwave]`
    pub pixmask_fraction: DMatrix<f64>,
    /// reduced chi-square of the pixels contributing to each flux bin `[nspec, nwave]`
    pub chi2pix: DMatrix<f64>,
}

/// Extracted spectra
#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    pub specmin: usize,
    pub wavelengths: Vec<f64>,
    /// resolution convolved flux `[nspec, nwave]` [photon/A]
    pub flux: DMatrix<f64>,
    /// flux inverse variance `[nspec, nwave]` [(photon/A)^-2]
    pub ivar: DMatrix<f64>,
    pub resolution_data: ResolutionData,
    pub diagnostics: Option<Diagnostics>,
}
impl Extraction {
    pub fn nspec(&self) -> usize {
        self.flux.nrows()
    }
    pub fn nwave(&self) -> usize {
        self.flux.ncols()
    }
    /// Flux in photon per wavelength bin
    pub fn flux_per_bin(&self) -> DMatrix<f64> {
        let dwave = bin_widths(&self.wavelengths);
        let mut flux = self.flux.clone();
        flux.column_iter_mut()
            .zip(&dwave)
            .for_each(|(mut col, &dw)| col *= dw);
        flux
    }
    /// Inverse variance of the flux per wavelength bin
    pub fn ivar_per_bin(&self) -> DMatrix<f64> {
        let dwave = bin_widths(&self.wavelengths);
        let mut ivar = self.ivar.clone();
        ivar.column_iter_mut()
            .zip(&dwave)
            .for_each(|(mut col, &dw)| col /= dw * dw);
        ivar
    }
}

/// Local wavelength bin widths, centered differences but at the edges
pub fn bin_widths(wavelengths: &[f64]) -> Vec<f64> {
    let n = wavelengths.len();
    match n {
        0 => vec![],
        1 => vec![1.],
        _ => (0..n)
            .map(|i| match i {
                0 => wavelengths[1] - wavelengths[0],
                i if i == n - 1 => wavelengths[n - 1] - wavelengths[n - 2],
                i => 0.5 * (wavelengths[i + 1] - wavelengths[i - 1]),
            })
            .collect(),
    }
}

/// Merges patch cores into the output arrays
#[derive(Debug)]
pub struct PatchStitcher {
    specmin: usize,
    flux: DMatrix<f64>,
    ivar: DMatrix<f64>,
    resolution_data: ResolutionData,
    diagnostics: Option<(PixelBox, Diagnostics)>,
}
impl PatchStitcher {
    pub fn new(specmin: usize, nspec: usize, nwave: usize, ndiag: usize) -> Self {
        Self {
            specmin,
            flux: DMatrix::zeros(nspec, nwave),
            ivar: DMatrix::zeros(nspec, nwave),
            resolution_data: ResolutionData::new(nspec, ndiag, nwave),
            diagnostics: None,
        }
    }
    /// Allocates the diagnostic outputs for an image covering `image_xyrange`
    pub fn with_diagnostics(self, image_xyrange: PixelBox) -> Self {
        let (nspec, nwave) = self.flux.shape();
        let diagnostics = Diagnostics {
            modelimage: DMatrix::zeros(image_xyrange.ny(), image_xyrange.nx()),
            pixmask_fraction: DMatrix::zeros(nspec, nwave),
            chi2pix: DMatrix::zeros(nspec, nwave),
        };
        Self {
            diagnostics: Some((image_xyrange, diagnostics)),
            ..self
        }
    }

    /// Crops the kept spectra and the core wavelengths of a solved patch
    ///
    /// `flux` and `resolution` are the decorrelated flux and the resolution of the patch
    pub fn crop(
        patch: &Patch,
        specmin: usize,
        ndiag: usize,
        flux: &DVector<f64>,
        resolution: &Resolution,
        diagnostics: Option<PatchDiagnostics>,
    ) -> PatchCore {
        let nw = patch.nwave();
        let core = patch.core_in_patch();
        let kept: Vec<(usize, usize)> = patch
            .specrange
            .clone()
            .enumerate()
            .filter(|(s, _)| patch.keep[*s])
            .collect();
        let crop = |v: &[f64]| {
            DMatrix::from_fn(kept.len(), core.len(), |r, c| v[kept[r].0 * nw + core.start + c])
        };
        let bands = kept
            .iter()
            .map(|&(s, _)| {
                DMatrix::from_fn(2 * ndiag + 1, core.len(), |k, c| {
                    let j = s * nw + core.start + c;
                    resolution.r[(j + k - ndiag, j)]
                })
            })
            .collect();
        let diagnostics = diagnostics.map(|d| CoreDiagnostics {
            xyrange: patch.xyrange,
            pixmask_fraction: crop(d.pixmask_fraction.as_slice()),
            chi2pix: crop(d.chi2pix.as_slice()),
            model: d.model,
        });
        PatchCore {
            rows: kept.iter().map(|&(_, ispec)| ispec - specmin).collect(),
            core: patch.core.clone(),
            flux: crop(flux.as_slice()),
            ivar: crop(resolution.ivar.as_slice()),
            bands,
            diagnostics,
        }
    }

    /// Writes a patch core into the output arrays
    pub fn merge(&mut self, patch: PatchCore) {
        let ncore = patch.core.len();
        for (r, &row) in patch.rows.iter().enumerate() {
            self.flux
                .view_mut((row, patch.core.start), (1, ncore))
                .copy_from(&patch.flux.row(r));
            self.ivar
                .view_mut((row, patch.core.start), (1, ncore))
                .copy_from(&patch.ivar.row(r));
            let band = &patch.bands[r];
            for k in 0..band.nrows() {
                for c in 0..ncore {
                    self.resolution_data
                        .set(row, k, patch.core.start + c, band[(k, c)]);
                }
            }
        }
        if let (Some((image_xyrange, diagnostics)), Some(core)) =
            (self.diagnostics.as_mut(), patch.diagnostics)
        {
            for (r, &row) in patch.rows.iter().enumerate() {
                diagnostics
                    .pixmask_fraction
                    .view_mut((row, patch.core.start), (1, ncore))
                    .copy_from(&core.pixmask_fraction.row(r));
                diagnostics
                    .chi2pix
                    .view_mut((row, patch.core.start), (1, ncore))
                    .copy_from(&core.chi2pix.row(r));
            }
            // overlapping patch models are overwritten by the later patch
            let bbox = core.xyrange;
            for (i, value) in core.model.into_iter().enumerate() {
                let (x, y) = (bbox.xmin + i % bbox.nx(), bbox.ymin + i / bbox.nx());
                diagnostics.modelimage[(y - image_xyrange.ymin, x - image_xyrange.xmin)] = value;
            }
        }
    }

    /// Converts photon per bin to photon per Angstrom
    pub fn finish(self, wavelengths: &[f64]) -> Extraction {
        let dwave = bin_widths(wavelengths);
        let Self {
            specmin,
            mut flux,
            mut ivar,
            resolution_data,
            diagnostics,
        } = self;
        flux.column_iter_mut()
            .zip(&dwave)
            .for_each(|(mut col, &dw)| col /= dw);
        ivar.column_iter_mut()
            .zip(&dwave)
            .for_each(|(mut col, &dw)| col *= dw * dw);
        Extraction {
            specmin,
            wavelengths: wavelengths.to_vec(),
            flux,
            ivar,
            resolution_data,
            diagnostics: diagnostics.map(|(_, d)| d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::{CooMatrix, CsrMatrix};

    #[test]
    fn banded_resolution() {
        let mut rd = ResolutionData::new(1, 1, 4);
        let r = DMatrix::from_row_slice(
            4,
            4,
            &[
                0.6, 0.2, 0., 0., //
                0.2, 0.6, 0.2, 0., //
                0., 0.2, 0.6, 0.2, //
                0., 0., 0.2, 0.6,
            ],
        );
        for j in 0..4usize {
            for k in 0..3 {
                if let Some(i) = (j + k).checked_sub(1).filter(|&i| i < 4) {
                    rd.set(0, k, j, r[(i, j)]);
                }
            }
        }
        assert_eq!(rd.to_matrix(0), r);
        let flux = [1., 2., 3., 4.];
        let expected = &r * DVector::from_column_slice(&flux);
        rd.apply(0, &flux)
            .iter()
            .zip(expected.iter())
            .for_each(|(a, b)| assert!((a - b).abs() < 1e-12));
    }

    #[test]
    fn gradient_bin_widths() {
        assert_eq!(bin_widths(&[1., 2., 4., 8.]), vec![1., 1.5, 3., 4.]);
        assert_eq!(bin_widths(&[1., 1.5]), vec![0.5, 0.5]);
    }

    fn patch() -> Patch {
        Patch {
            specrange: 4..6,
            keep: vec![false, true],
            core: 10..13,
            nlo: 2,
            nhi: 2,
            wavelengths: (0..7).map(|i| 100. + i as f64).collect(),
            xyrange: PixelBox::new(1, 3, 0, 2),
        }
    }

    #[test]
    fn crop_core() {
        let patch = patch();
        let n = patch.nflux();
        let flux = DVector::from_fn(n, |i, _| i as f64);
        let resolution = Resolution {
            r: DMatrix::from_fn(n, n, |i, j| (100 * i + j) as f64),
            norm: DVector::from_element(n, 1.),
            ivar: DVector::from_fn(n, |i, _| -(i as f64)),
        };
        let core = PatchStitcher::crop(&patch, 3, 1, &flux, &resolution, None);
        assert_eq!(core.rows, vec![2]);
        assert_eq!(core.core, 10..13);
        // 2nd spectrum, bins 2 to 4
        assert_eq!(core.flux.row(0).iter().cloned().collect::<Vec<_>>(), vec![9., 10., 11.]);
        assert_eq!(core.ivar[(0, 2)], -11.);
        // R[j - 1 + k, j] for j = 9
        assert_eq!(core.bands[0].column(0).iter().cloned().collect::<Vec<_>>(), vec![809., 909., 1009.]);
    }

    #[test]
    fn stitch_and_convert_units() {
        let patch = patch();
        let n = patch.nflux();
        let resolution = Resolution {
            r: DMatrix::identity(n, n),
            norm: DVector::from_element(n, 2.),
            ivar: DVector::from_element(n, 4.),
        };
        let flux = DVector::from_element(n, 3.);
        let mut stitcher = PatchStitcher::new(3, 4, 15, 1);
        stitcher.merge(PatchStitcher::crop(&patch, 3, 1, &flux, &resolution, None));
        let wavelengths: Vec<f64> = (0..15).map(|i| 100. + 0.5 * i as f64).collect();
        let extraction = stitcher.finish(&wavelengths);
        assert_eq!(extraction.flux[(2, 11)], 6.);
        assert_eq!(extraction.ivar[(2, 11)], 1.);
        assert_eq!(extraction.flux[(1, 11)], 0.);
        assert_eq!(extraction.flux[(2, 13)], 0.);
        assert_eq!(extraction.resolution_data.get(2, 1, 12), 1.);
        assert_eq!(extraction.resolution_data.get(2, 0, 12), 0.);
        let per_bin = extraction.flux_per_bin();
        let ivar_per_bin = extraction.ivar_per_bin();
        assert_eq!(per_bin[(2, 10)], 3.);
        assert_eq!(ivar_per_bin[(2, 10)], 4.);
    }

    #[test]
    fn diagnostics_of_perfect_model() {
        // 2 flux bins on 3 pixels
        let mut coo = CooMatrix::new(3, 2);
        coo.push(0, 0, 0.5);
        coo.push(1, 0, 0.5);
        coo.push(1, 1, 0.5);
        coo.push(2, 1, 0.5);
        let a = CsrMatrix::from(&coo);
        let xflux = DVector::from_vec(vec![2., 4.]);
        let sub = SubImage {
            xyrange: PixelBox::new(0, 3, 0, 1),
            pix: DVector::from_vec(vec![1., 3., 2.]),
            ivar: DVector::from_vec(vec![1., 1., 0.]),
        };
        let d = PatchDiagnostics::new(&a, &xflux, &sub, 0.01);
        assert_eq!(d.model, vec![1., 3., 2.]);
        assert_eq!(d.pixmask_fraction, vec![0., 0.5]);
        assert_eq!(d.chi2pix, vec![0., 0.]);

        let sub = SubImage {
            ivar: DVector::from_vec(vec![0., 0., 0.]),
            ..sub
        };
        let d = PatchDiagnostics::new(&a, &xflux, &sub, 0.01);
        assert_eq!(d.chi2pix, vec![0., 0.]);
        assert_eq!(d.pixmask_fraction, vec![1., 1.]);
    }
}
