/*!
# Extraction driver

Plans the patches, solves them independently, possibly in parallel, and stitches
their core regions into the output spectra.
The patches are merged in plan order whatever the order they are solved in,
the output does not depend on the number of threads.
*/

use std::time::Instant;

use rayon::prelude::*;

use crate::{
    backend::LinearAlgebraBackend,
    error::{InputError, NumericalError},
    image::Image,
    observer::{ExtractionObserver, PatchSummary, Silent},
    planner::{Patch, PatchPlan, PatchPlanner},
    psf::Psf,
    resolution::ResolutionBuilder,
    solver::PatchSolver,
    stitcher::{Extraction, PatchCore, PatchDiagnostics, PatchStitcher},
    subbundle::spectral_groups,
    ExtractionConfig, Result,
};

/// Spectroperfectionism extraction of a detector image
///
/// ```no_run
/// use nalgebra::DMatrix;
/// use spex2d::{ExtractionConfig, Extractor, GaussianPsf, Image, LogObserver};
///
/// # fn main() -> spex2d::Result<()> {
/// let psf = GaussianPsf::new(20, (400, 220), (5000., 5200.)).traces(10., 10.);
/// let (pix, ivar) = (DMatrix::zeros(400, 220), DMatrix::repeat(400, 220, 1.));
/// let image = Image::new(pix, ivar)?;
/// let wavelengths: Vec<f64> = (0..150).map(|i| 5020. + i as f64).collect();
/// let extraction = Extractor::new(&psf, ExtractionConfig::new(0, 20, wavelengths))
///     .observer(&LogObserver)
///     .extract(&image)?;
/// println!("{}", extraction.flux);
/// # Ok(())
/// # }
/// ```
pub struct Extractor<'a, P: Psf + ?Sized> {
    psf: &'a P,
    config: ExtractionConfig,
    observer: &'a dyn ExtractionObserver,
}
impl<'a, P: Psf + ?Sized> Extractor<'a, P> {
    pub fn new(psf: &'a P, config: ExtractionConfig) -> Self {
        Self {
            psf,
            config,
            observer: &Silent,
        }
    }
    pub fn observer(self, observer: &'a dyn ExtractionObserver) -> Self {
        Self { observer, ..self }
    }
    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Patches of the extraction
    pub fn plan(&self) -> Result<PatchPlan> {
        let config = &self.config;
        config.validate()?;
        let groups = spectral_groups(
            config.specmin,
            config.nspec,
            config.bundlesize,
            config.nsubbundles,
        )?;
        PatchPlanner::new(self.psf, config.wavesize)
            .max_patch_bins(config.max_patch_bins)
            .plan(config.specrange(), &groups, &config.wavelengths)
    }

    /// Extracts the spectra from `image`
    ///
    /// Nothing is returned if any patch fails, the error carries the spectra and
    /// the wavelengths of the first failed patch in plan order
    pub fn extract(&self, image: &Image) -> Result<Extraction> {
        let now = Instant::now();
        let plan = self.plan()?;
        let config = &self.config;
        let backend = config.backend.backend();
        log::info!(
            "extracting spectra {:?} over {} wavelengths in {} patches with the {} backend",
            config.specrange(),
            config.wavelengths.len(),
            plan.patches.len(),
            backend.name()
        );
        self.observer.plan_ready(plan.patches.len());

        let solve = |(index, patch): (usize, &Patch)| {
            self.extract_patch(index, patch, image, backend.as_ref(), plan.ndiag)
                .map_err(|e| e.in_patch(patch.specrange.clone(), patch.waverange()))
        };
        let results: Vec<Result<PatchCore>> = if config.parallel {
            plan.patches.par_iter().enumerate().map(solve).collect()
        } else {
            plan.patches.iter().enumerate().map(solve).collect()
        };
        let cores = results.into_iter().collect::<Result<Vec<_>>>()?;

        let mut stitcher = PatchStitcher::new(
            config.specmin,
            config.nspec,
            config.wavelengths.len(),
            plan.ndiag,
        );
        if config.full_output {
            stitcher = stitcher.with_diagnostics(image.xyrange());
        }
        cores.into_iter().for_each(|core| stitcher.merge(core));
        let extraction = stitcher.finish(&config.wavelengths);

        self.observer.finished();
        log::info!("extraction completed in {:.3}s", now.elapsed().as_secs_f64());
        Ok(extraction)
    }

    fn extract_patch(
        &self,
        index: usize,
        patch: &Patch,
        image: &Image,
        backend: &dyn LinearAlgebraBackend,
        ndiag: usize,
    ) -> Result<PatchCore> {
        let now = Instant::now();
        let config = &self.config;
        let sub = image.cutout(&patch.xyrange)?;
        let a = self
            .psf
            .projection_matrix(patch.specrange.clone(), &patch.wavelengths, &patch.xyrange);
        let expected = (patch.xyrange.npix(), patch.nflux());
        if (a.nrows(), a.ncols()) != expected {
            Err(InputError::ProjectionShape {
                found: (a.nrows(), a.ncols()),
                expected,
            })?
        }

        let solution = PatchSolver::new(backend)
            .strategy(config.solver)
            .regularize(config.regularize)
            .solve(&a, &sub.pix, &sub.ivar)?;

        // one block per spectrum
        let decorr = config
            .ndecorr
            .then(|| vec![patch.nwave(); patch.nspec()]);
        let resolution = ResolutionBuilder::new(backend)
            .variance(config.variance)
            .resolution(&solution.icov, decorr.as_deref())?;
        let flux = resolution.convolve(&solution.xflux);
        let n_bad = flux.iter().filter(|x| !x.is_finite()).count();
        if n_bad > 0 {
            Err(NumericalError::NonFiniteFlux(n_bad))?
        }

        let diagnostics = config.full_output.then(|| {
            let psferr = config.psferr.unwrap_or_else(|| self.psf.psferr());
            PatchDiagnostics::new(&a, &solution.xflux, &sub, psferr)
        });

        log::debug!(
            "patch #{index} solved in {:.3}s, {} underdetermined flux bins",
            now.elapsed().as_secs_f64(),
            solution.n_underdetermined()
        );
        self.observer.patch_done(&PatchSummary {
            index,
            specrange: patch.specrange.clone(),
            waverange: patch.waverange(),
            nflux: patch.nflux(),
            npix: patch.xyrange.npix(),
            n_underdetermined: solution.n_underdetermined(),
        });
        Ok(PatchStitcher::crop(
            patch,
            config.specmin,
            ndiag,
            &flux,
            &resolution,
            diagnostics,
        ))
    }
}
