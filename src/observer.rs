//! Extraction progress reporting

use std::ops::Range;

/// Summary of a solved patch
#[derive(Debug, Clone, PartialEq)]
pub struct PatchSummary {
    /// index of the patch in the plan
    pub index: usize,
    pub specrange: Range<usize>,
    /// core wavelength range [A]
    pub waverange: (f64, f64),
    /// number of flux bins
    pub nflux: usize,
    /// number of pixels
    pub npix: usize,
    /// number of regularized flux bins with too little weight
    pub n_underdetermined: usize,
}

/// Receives the progress of an extraction
///
/// `patch_done` is called from the worker threads, in no particular order
pub trait ExtractionObserver: Send + Sync {
    fn plan_ready(&self, _npatch: usize) {}
    fn patch_done(&self, _summary: &PatchSummary) {}
    fn finished(&self) {}
}

/// Ignores the extraction progress
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;
impl ExtractionObserver for Silent {}

/// Logs the extraction progress
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;
impl ExtractionObserver for LogObserver {
    fn plan_ready(&self, npatch: usize) {
        log::info!("extracting {npatch} patches");
    }
    fn patch_done(&self, summary: &PatchSummary) {
        let (wlo, whi) = summary.waverange;
        log::debug!(
            "patch #{}: spectra {:?} in [{wlo:.3}, {whi:.3}]A, {} flux bins ({} regularized) over {} pixels",
            summary.index,
            summary.specrange,
            summary.nflux,
            summary.n_underdetermined,
            summary.npix
        );
    }
    fn finished(&self) {
        log::info!("extraction completed");
    }
}
