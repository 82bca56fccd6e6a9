/*!
# Spectroperfectionism extraction

2D extraction of fiber spectra from a detector image following
[Bolton & Schlegel 2010](https://arxiv.org/abs/0911.2689).

The image is cut into patches of a few spectra times a window of wavelengths.
For each patch, the flux of the spectra is solved for by fitting a [Psf] model to the
pixels, then decorrelated with the resolution matrix of the patch.
The core of each patch is stitched into the [Extraction]: the flux and inverse
variance in photon per Angstrom and the banded [ResolutionData].

```no_run
use nalgebra::DMatrix;
use spex2d::{ExtractionConfig, Extractor, GaussianPsf, Image};

# fn main() -> spex2d::Result<()> {
let psf = GaussianPsf::new(10, (300, 120), (5500., 5650.)).traces(10., 10.);
let image = Image::new(DMatrix::zeros(300, 120), DMatrix::repeat(300, 120, 1.))?;
let wavelengths: Vec<f64> = (0..100).map(|i| 5520. + i as f64).collect();
let config = ExtractionConfig::new(0, 10, wavelengths).bundlesize(5).wavesize(25);
let extraction = Extractor::new(&psf, config).extract(&image)?;
# Ok(())
# }
```
*/

pub mod backend;
pub mod bias;
pub mod config;
mod error;
pub mod extract;
pub mod image;
pub mod observer;
pub mod planner;
pub mod psf;
pub mod resolution;
pub mod solver;
pub mod stitcher;
pub mod subbundle;

pub use backend::{BackendKind, LinearAlgebraBackend};
pub use bias::{psf_abs_bias, psf_bias, BiasEstimator};
pub use config::ExtractionConfig;
pub use error::{Error, InputError, NumericalError, ResourceError, Result};
pub use extract::Extractor;
pub use image::Image;
pub use observer::{ExtractionObserver, LogObserver, PatchSummary, Silent};
pub use psf::{GaussianPsf, PixelBox, Psf};
pub use resolution::{resolution_from_icov, VarianceFormula};
pub use solver::SolveStrategy;
pub use stitcher::{Diagnostics, Extraction, ResolutionData};
pub use subbundle::split_bundle;
