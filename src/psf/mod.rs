/*!
# Point spread function providers

The extraction engine only sees the PSF through the [`Psf`] trait: the wavelength
solution, the spot geometry and the projection matrix mapping flux bins to pixels.

Pixels of a [`PixelBox`] are flattened row-major, pixel `(x, y)` is row
`(y - ymin) * nx + (x - xmin)` of a [`ProjectionMatrix`].
Flux bins are flattened spectrum-major, bin `iw` of the `k`-th spectrum of the
requested range is column `k * nwave + iw`.
*/

use std::ops::Range;

use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;

mod gaussian;
pub use gaussian::GaussianPsf;

/// Sparse flux bins to pixels mapping
pub type ProjectionMatrix = CsrMatrix<f64>;

/// Half-open pixel bounding box `[xmin, xmax) x [ymin, ymax)` in detector coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct PixelBox {
    pub xmin: usize,
    pub xmax: usize,
    pub ymin: usize,
    pub ymax: usize,
}
impl PixelBox {
    pub fn new(xmin: usize, xmax: usize, ymin: usize, ymax: usize) -> Self {
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }
    pub fn nx(&self) -> usize {
        self.xmax.saturating_sub(self.xmin)
    }
    pub fn ny(&self) -> usize {
        self.ymax.saturating_sub(self.ymin)
    }
    /// Number of pixels
    pub fn npix(&self) -> usize {
        self.nx() * self.ny()
    }
    pub fn contains(&self, x: usize, y: usize) -> bool {
        (self.xmin..self.xmax).contains(&x) && (self.ymin..self.ymax).contains(&y)
    }
    /// Row-major index of pixel `(x, y)` within the box
    pub fn index(&self, x: usize, y: usize) -> Option<usize> {
        self.contains(x, y)
            .then(|| (y - self.ymin) * self.nx() + x - self.xmin)
    }
    pub fn as_array(&self) -> [usize; 4] {
        [self.xmin, self.xmax, self.ymin, self.ymax]
    }
}

/// Point spread function model of a fiber spectrograph
///
/// Wavelengths are in Angstrom, pixel coordinates are detector coordinates.
pub trait Psf: Sync {
    /// Wavelength of spectrum `ispec` at CCD row `y`
    fn wavelength(&self, ispec: usize, y: f64) -> f64;
    /// CCD column of the trace of spectrum `ispec` at `wavelength`
    fn x(&self, ispec: usize, wavelength: f64) -> f64;
    /// CCD row of the trace of spectrum `ispec` at `wavelength`
    fn y(&self, ispec: usize, wavelength: f64) -> f64;
    /// Cross-dispersion spot size [pixel]
    fn xsigma(&self, ispec: usize, wavelength: f64) -> f64;
    /// Spot dispersion along the wavelength direction [A]
    fn wdisp(&self, ispec: usize, wavelength: f64) -> f64;
    /// Shape `(ny, nx)` of the spot stamp
    fn stamp_shape(&self, ispec: usize, wavelength: f64) -> (usize, usize);
    /// Pixel box covering the spots of spectra `specrange` between the wavelengths `waverange`
    fn xyrange(&self, specrange: Range<usize>, waverange: (f64, f64)) -> PixelBox;
    /// Projection matrix of spectra `specrange` sampled at `wavelengths` onto the pixels of `xyrange`
    fn projection_matrix(
        &self,
        specrange: Range<usize>,
        wavelengths: &[f64],
        xyrange: &PixelBox,
    ) -> ProjectionMatrix;
    /// Fractional error of the PSF model
    fn psferr(&self) -> f64;
    /// Wavelength range common to all spectra
    fn wmin(&self) -> f64;
    fn wmax(&self) -> f64;
    /// Wavelength range covered by any spectrum
    fn wmin_all(&self) -> f64 {
        self.wmin()
    }
    fn wmax_all(&self) -> f64 {
        self.wmax()
    }
}

/// `A * x`
pub fn project(a: &ProjectionMatrix, x: &[f64]) -> Vec<f64> {
    (a * &DVector::from_column_slice(x)).as_slice().to_vec()
}

/// `A^T * v`
pub fn project_transpose(a: &ProjectionMatrix, v: &[f64]) -> Vec<f64> {
    (&a.transpose() * &DVector::from_column_slice(v))
        .as_slice()
        .to_vec()
}
