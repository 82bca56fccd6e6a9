use std::ops::Range;

use itertools::Itertools;
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use super::{project, PixelBox, ProjectionMatrix, Psf};

/// Gaussian PSF of a spectrograph with straight traces
///
/// Spectrum `ispec` is centered on column `x0 + ispec * fiber_spacing`; the
/// wavelength increases linearly along the CCD rows from `y0` at the blue end.
/// Spots are separable Gaussians sampled at the pixel centers and normalized
/// over a square stamp of `2 * half_width + 1` pixels.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GaussianPsf {
    nspec: usize,
    /// CCD (rows, columns)
    ccd_shape: (usize, usize),
    wavelength_range: (f64, f64),
    x0: f64,
    fiber_spacing: f64,
    y0: f64,
    angstrom_per_pixel: f64,
    /// spot size along (x, y) [pixel]
    sigma: (f64, f64),
    half_width: usize,
    psferr: f64,
}
impl GaussianPsf {
    pub fn new(nspec: usize, ccd_shape: (usize, usize), wavelength_range: (f64, f64)) -> Self {
        Self {
            nspec,
            ccd_shape,
            wavelength_range,
            x0: 10.,
            fiber_spacing: 10.,
            y0: 10.,
            angstrom_per_pixel: 1.,
            sigma: (1., 1.),
            half_width: 5,
            psferr: 0.01,
        }
    }
    /// Sets the column of the 1st fiber and the fiber pitch [pixel]
    pub fn traces(self, x0: f64, fiber_spacing: f64) -> Self {
        Self {
            x0,
            fiber_spacing,
            ..self
        }
    }
    /// Sets the row of the blue end and the dispersion [A/pixel]
    pub fn dispersion(self, y0: f64, angstrom_per_pixel: f64) -> Self {
        Self {
            y0,
            angstrom_per_pixel,
            ..self
        }
    }
    pub fn sigma(self, sigma_x: f64, sigma_y: f64) -> Self {
        Self {
            sigma: (sigma_x, sigma_y),
            ..self
        }
    }
    pub fn half_width(self, half_width: usize) -> Self {
        Self { half_width, ..self }
    }
    pub fn with_psferr(self, psferr: f64) -> Self {
        Self { psferr, ..self }
    }
    pub fn nspec(&self) -> usize {
        self.nspec
    }
    pub fn ccd_shape(&self) -> (usize, usize) {
        self.ccd_shape
    }
    /// The whole CCD
    pub fn ccd(&self) -> PixelBox {
        PixelBox::new(0, self.ccd_shape.1, 0, self.ccd_shape.0)
    }

    // normalized 1D Gaussian profile sampled on the pixels centered on the nearest pixel of `c`
    fn profile(&self, c: f64, sigma: f64) -> (i64, Vec<f64>) {
        let hw = self.half_width as i64;
        let first = c.round() as i64 - hw;
        let g: Vec<f64> = (first..=first + 2 * hw)
            .map(|i| {
                let u = (i as f64 - c) / sigma;
                (-0.5 * u * u).exp()
            })
            .collect();
        let s: f64 = g.iter().sum();
        (first, g.into_iter().map(|g| g / s).collect())
    }

    /// Renders the noiseless image of spectra `specmin..specmin+flux.nrows()`
    ///
    /// `flux[(k, iw)]` is the number of photons in the bin `wavelengths[iw]` of spectrum `specmin + k`
    pub fn project(&self, specmin: usize, flux: &DMatrix<f64>, wavelengths: &[f64]) -> DMatrix<f64> {
        let ccd = self.ccd();
        let a = self.projection_matrix(specmin..specmin + flux.nrows(), wavelengths, &ccd);
        // spectrum-major flattening
        let x: Vec<f64> = flux.transpose().iter().cloned().collect();
        DMatrix::from_row_slice(ccd.ny(), ccd.nx(), &project(&a, &x))
    }
}

fn clamp_pixel(v: f64, n: usize) -> usize {
    v.max(0.).min(n as f64) as usize
}

impl Psf for GaussianPsf {
    fn wavelength(&self, _ispec: usize, y: f64) -> f64 {
        self.wavelength_range.0 + (y - self.y0) * self.angstrom_per_pixel
    }
    fn x(&self, ispec: usize, _wavelength: f64) -> f64 {
        self.x0 + ispec as f64 * self.fiber_spacing
    }
    fn y(&self, _ispec: usize, wavelength: f64) -> f64 {
        self.y0 + (wavelength - self.wavelength_range.0) / self.angstrom_per_pixel
    }
    fn xsigma(&self, _ispec: usize, _wavelength: f64) -> f64 {
        self.sigma.0
    }
    fn wdisp(&self, _ispec: usize, _wavelength: f64) -> f64 {
        self.sigma.1 * self.angstrom_per_pixel
    }
    fn stamp_shape(&self, _ispec: usize, _wavelength: f64) -> (usize, usize) {
        let n = 2 * self.half_width + 1;
        (n, n)
    }
    fn xyrange(&self, specrange: Range<usize>, waverange: (f64, f64)) -> PixelBox {
        let hw = self.half_width as f64;
        let (Some((xlo, xhi)), Some((ylo, yhi))) = (
            specrange
                .clone()
                .flat_map(|i| [self.x(i, waverange.0), self.x(i, waverange.1)])
                .minmax()
                .into_option(),
            specrange
                .flat_map(|i| [self.y(i, waverange.0), self.y(i, waverange.1)])
                .minmax()
                .into_option(),
        ) else {
            return PixelBox::default();
        };
        let (ny, nx) = self.ccd_shape;
        PixelBox::new(
            clamp_pixel(xlo.round() - hw, nx),
            clamp_pixel(xhi.round() + hw + 1., nx),
            clamp_pixel(ylo.round() - hw, ny),
            clamp_pixel(yhi.round() + hw + 1., ny),
        )
    }
    fn projection_matrix(
        &self,
        specrange: Range<usize>,
        wavelengths: &[f64],
        xyrange: &PixelBox,
    ) -> ProjectionMatrix {
        let nw = wavelengths.len();
        let mut coo = CooMatrix::new(xyrange.npix(), specrange.len() * nw);
        for (k, ispec) in specrange.enumerate() {
            for (iw, &w) in wavelengths.iter().enumerate() {
                let (x_first, gx) = self.profile(self.x(ispec, w), self.sigma.0);
                let (y_first, gy) = self.profile(self.y(ispec, w), self.sigma.1);
                for (y, vy) in (y_first..).zip(&gy) {
                    for (x, vx) in (x_first..).zip(&gx) {
                        if x < 0 || y < 0 {
                            continue;
                        }
                        if let Some(i) = xyrange.index(x as usize, y as usize) {
                            coo.push(i, k * nw + iw, vx * vy);
                        }
                    }
                }
            }
        }
        CsrMatrix::from(&coo)
    }
    fn psferr(&self) -> f64 {
        self.psferr
    }
    fn wmin(&self) -> f64 {
        self.wavelength_range.0
    }
    fn wmax(&self) -> f64 {
        self.wavelength_range.1
    }
}
