use std::ops::Range;

/// Invalid extraction inputs, raised before any linear algebra is done
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("wavelength grid needs at least 2 samples, found {0}")]
    ShortGrid(usize),
    #[error("only linear wavelength grids are supported (step #{index} is {step}, expected {expected})")]
    NonUniformGrid {
        index: usize,
        step: f64,
        expected: f64,
    },
    #[error("n={n} should be less or equal to bundlesize={bundlesize}")]
    TooManySubbundles { n: usize, bundlesize: usize },
    #[error("the number of subbundles must be at least 1")]
    NoSubbundle,
    #[error("the list of spectral block sizes sums to {sum}, expected the matrix size {dim}")]
    DecorrBlocks { sum: usize, dim: usize },
    #[error("image is {pix:?} but inverse variance is {ivar:?}")]
    ShapeMismatch {
        pix: (usize, usize),
        ivar: (usize, usize),
    },
    #[error("negative inverse variance at pixel (x={x}, y={y})")]
    NegativeIvar { x: usize, y: usize },
    #[error("pixel box {0:?} is not contained in the image")]
    OutsideImage([usize; 4]),
    #[error("projection matrix is {found:?}, expected {expected:?}")]
    ProjectionShape {
        found: (usize, usize),
        expected: (usize, usize),
    },
    #[error("`{0}` must be strictly positive")]
    NotPositive(&'static str),
    #[error("`regularize` must be finite and non-negative, found {0}")]
    Regularize(f64),
    #[error("{wave} wavelengths but {phot} photon samples")]
    LengthMismatch { wave: usize, phot: usize },
}

/// Failures of the per-patch linear algebra
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum NumericalError {
    #[error("normal equations are singular")]
    Singular,
    #[error("solved flux has {0} non-finite values")]
    NonFiniteFlux(usize),
    #[error("eigen decomposition returned {0} non-finite eigenvalues")]
    NonFiniteEigenvalues(usize),
    #[error("resolution normalization vanishes or diverges at flux bin #{0}")]
    Normalization(usize),
    #[error("conjugate gradient did not converge after {iterations} iterations (relative residual {residual:e})")]
    NotConverged { iterations: usize, residual: f64 },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("patch has {nflux} flux bins, the limit is {limit}: decrease `wavesize` or `bundlesize`")]
    PatchTooLarge { nflux: usize, limit: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid extraction input")]
    Input(#[from] InputError),
    #[error("numerical failure")]
    Numerical(#[from] NumericalError),
    #[error("resource limit exceeded")]
    Resource(#[from] ResourceError),
    #[error("extraction of spectra {specrange:?} in [{wlo:.3}, {whi:.3}]A failed")]
    Patch {
        specrange: Range<usize>,
        wlo: f64,
        whi: f64,
        #[source]
        source: Box<Error>,
    },
}
impl Error {
    /// Attaches a patch spectral and wavelength range to the error
    pub fn in_patch(self, specrange: Range<usize>, waverange: (f64, f64)) -> Self {
        Error::Patch {
            specrange,
            wlo: waverange.0,
            whi: waverange.1,
            source: Box::new(self),
        }
    }
    /// Returns the error stripped of the patch context
    pub fn root(&self) -> &Error {
        match self {
            Error::Patch { source, .. } => source.root(),
            _ => self,
        }
    }
    /// True if the failure comes from the linear algebra, a caller may retry with
    /// a different regularization
    pub fn is_numerical(&self) -> bool {
        matches!(self.root(), Error::Numerical(_))
    }
    pub fn is_input(&self) -> bool {
        matches!(self.root(), Error::Input(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
