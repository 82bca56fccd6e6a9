use std::{fs::File, path::PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::DMatrix;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use spex2d::{
    BackendKind, Extraction, ExtractionConfig, ExtractionObserver, Extractor, GaussianPsf, Image,
    PatchSummary, VarianceFormula,
};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "ex2d-sim",
    about = "Spectroperfectionism extraction of a simulated spectrograph frame"
)]
struct Opt {
    /// Number of spectra
    #[structopt(long, default_value = "20")]
    nspec: usize,
    /// Number of spectra per bundle
    #[structopt(long, default_value = "10")]
    bundlesize: usize,
    /// Number of subbundles per bundle
    #[structopt(long, default_value = "1")]
    nsubbundles: usize,
    /// Number of wavelength bins in the core of a patch
    #[structopt(long, default_value = "50")]
    wavesize: usize,
    /// Flux regularization strength
    #[structopt(long, default_value = "0")]
    regularize: f64,
    /// Decorrelates the spectra independently
    #[structopt(long)]
    ndecorr: bool,
    /// Propagates the flux covariance for the inverse variance
    #[structopt(long)]
    propagated: bool,
    /// Writes the model image and the pixel diagnostics
    #[structopt(long)]
    full_output: bool,
    /// Uses dense linear algebra
    #[structopt(long)]
    dense: bool,
    /// CCD read noise [electron]
    #[structopt(long, default_value = "3")]
    readnoise: f64,
    /// Random generator seed
    #[structopt(long, default_value = "0")]
    seed: u64,
    /// Pickle output file
    #[structopt(short, long, default_value = "ex2d.pkl")]
    output: PathBuf,
}

const NY: usize = 600;
const ANGSTROM_PER_PIXEL: f64 = 0.5;
const WMIN: f64 = 5500.;

#[derive(Serialize)]
struct Output {
    /// simulated photons per bin on the CCD wide wavelength grid
    truth_wavelengths: Vec<f64>,
    truth: DMatrix<f64>,
    extraction: Extraction,
}

struct Progress(ProgressBar);
impl ExtractionObserver for Progress {
    fn plan_ready(&self, npatch: usize) {
        self.0.set_length(npatch as u64);
    }
    fn patch_done(&self, summary: &PatchSummary) {
        if summary.n_underdetermined > 0 {
            self.0.set_message(format!(
                "{} underdetermined bins in patch #{}",
                summary.n_underdetermined, summary.index
            ));
        }
        self.0.inc(1);
    }
    fn finished(&self) {
        self.0.finish_with_message("extracted");
    }
}

/// Adds read and shot noise to a noiseless frame
fn noisy_image(noiseless: DMatrix<f64>, readnoise: f64, rng: &mut StdRng) -> anyhow::Result<Image> {
    let variance = noiseless.map(|p| readnoise * readnoise + p.max(0.));
    let mut pix = noiseless;
    for (p, &v) in pix.iter_mut().zip(variance.iter()) {
        *p += Normal::new(0., v.sqrt())?.sample(rng);
    }
    Ok(Image::new(pix, variance.map(|v| v.recip()))?)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();
    let mut rng = StdRng::seed_from_u64(opt.seed);

    let nx = 10 * opt.nspec + 20;
    let wmax = WMIN + NY as f64 * ANGSTROM_PER_PIXEL;
    let psf = GaussianPsf::new(opt.nspec, (NY, nx), (WMIN, wmax))
        .traces(15., 10.)
        .dispersion(0., ANGSTROM_PER_PIXEL)
        .sigma(1.1, 1.)
        .half_width(7);

    // continuum and a few emission lines
    let truth_wavelengths: Vec<f64> = (0..=NY).map(|i| WMIN + i as f64 * ANGSTROM_PER_PIXEL).collect();
    let mut truth = DMatrix::from_fn(opt.nspec, truth_wavelengths.len(), |_, _| 50.);
    for mut row in truth.row_iter_mut() {
        for _ in 0..8 {
            let i = rng.gen_range(0..row.len());
            row[i] += rng.gen_range(200f64..2000.);
        }
    }
    let noiseless = psf.project(0, &truth, &truth_wavelengths);
    let image = noisy_image(noiseless, opt.readnoise, &mut rng)?;
    log::info!("simulated a {NY}x{nx} frame of {} spectra", opt.nspec);

    let wavelengths: Vec<f64> = (0..400)
        .map(|i| WMIN + 50. + i as f64 * ANGSTROM_PER_PIXEL)
        .collect();
    let mut config = ExtractionConfig::new(0, opt.nspec, wavelengths)
        .bundlesize(opt.bundlesize)
        .nsubbundles(opt.nsubbundles)
        .wavesize(opt.wavesize)
        .regularize(opt.regularize)
        .ndecorr(opt.ndecorr)
        .full_output(opt.full_output);
    if opt.propagated {
        config = config.variance(VarianceFormula::Propagated);
    }
    if opt.dense {
        config = config.backend(BackendKind::DenseCpu);
    }

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    let progress = Progress(pb);
    let extraction = Extractor::new(&psf, config)
        .observer(&progress)
        .extract(&image)?;

    let mut file = File::create(&opt.output)?;
    serde_pickle::to_writer(
        &mut file,
        &Output {
            truth_wavelengths,
            truth,
            extraction,
        },
        Default::default(),
    )?;
    log::info!("extraction saved to {:?}", opt.output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_noise_statistics() {
        let mut rng = StdRng::seed_from_u64(5);
        let noiseless = DMatrix::from_fn(100, 100, |i, _| if i < 50 { 0. } else { 91. });
        let image = noisy_image(noiseless.clone(), 3., &mut rng).unwrap();
        // read noise only, then read and shot noise
        for (rows, variance) in [(0..50, 9.), (50..100, 100.)] {
            let residuals: Vec<f64> = rows
                .flat_map(|i| (0..100).map(move |j| (i, j)))
                .map(|ij| image.pixels()[ij] - noiseless[ij])
                .collect();
            let n = residuals.len() as f64;
            let mean = residuals.iter().sum::<f64>() / n;
            let var = residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
            assert!(mean.abs() < 5. * (variance / n).sqrt(), "{mean}");
            assert!((var / variance - 1.).abs() < 0.1, "{var}");
        }
        assert!((image.ivar()[(0, 0)] - 1. / 9.).abs() < 1e-12);
        assert!((image.ivar()[(99, 0)] - 1e-2).abs() < 1e-12);
    }
}
