use nalgebra::{DMatrix, DVector};

use crate::{error::InputError, psf::PixelBox};

/// Detector image and its inverse variance
///
/// Both arrays are indexed `(row, column)`, i.e. `(y, x)`.
/// The image may be a cutout of the detector starting at pixel `origin = (xmin, ymin)`.
/// A null inverse variance flags a masked pixel.
#[derive(Debug, Clone)]
pub struct Image {
    pix: DMatrix<f64>,
    ivar: DMatrix<f64>,
    origin: (usize, usize),
}

/// Flattened pixels of a [PixelBox]
#[derive(Debug, Clone)]
pub struct SubImage {
    pub xyrange: PixelBox,
    pub pix: DVector<f64>,
    pub ivar: DVector<f64>,
}

impl Image {
    pub fn new(pix: DMatrix<f64>, ivar: DMatrix<f64>) -> Result<Self, InputError> {
        if pix.shape() != ivar.shape() {
            return Err(InputError::ShapeMismatch {
                pix: pix.shape(),
                ivar: ivar.shape(),
            });
        }
        if let Some(((y, x), _)) = ivar
            .iter()
            .enumerate()
            .map(|(i, v)| ((i % ivar.nrows(), i / ivar.nrows()), v))
            .find(|(_, v)| !(**v >= 0.))
        {
            return Err(InputError::NegativeIvar { x, y });
        }
        Ok(Self {
            pix,
            ivar,
            origin: (0, 0),
        })
    }
    /// Places the image at `(xmin, ymin)` on the detector
    pub fn origin(self, xmin: usize, ymin: usize) -> Self {
        Self {
            origin: (xmin, ymin),
            ..self
        }
    }
    /// `(rows, columns)`
    pub fn shape(&self) -> (usize, usize) {
        self.pix.shape()
    }
    /// Detector pixel box covered by the image
    pub fn xyrange(&self) -> PixelBox {
        let (ny, nx) = self.shape();
        let (x0, y0) = self.origin;
        PixelBox::new(x0, x0 + nx, y0, y0 + ny)
    }
    pub fn pixels(&self) -> &DMatrix<f64> {
        &self.pix
    }
    pub fn ivar(&self) -> &DMatrix<f64> {
        &self.ivar
    }
    /// Row-major copy of the pixels inside `xyrange`
    pub fn cutout(&self, xyrange: &PixelBox) -> Result<SubImage, InputError> {
        let full = self.xyrange();
        if xyrange.xmin < full.xmin
            || xyrange.xmax > full.xmax
            || xyrange.ymin < full.ymin
            || xyrange.ymax > full.ymax
        {
            return Err(InputError::OutsideImage(xyrange.as_array()));
        }
        let (x0, y0) = self.origin;
        let rows = xyrange.ymin - y0..xyrange.ymax - y0;
        let cols = xyrange.xmin - x0..xyrange.xmax - x0;
        let flatten = |m: &DMatrix<f64>| {
            DVector::from_iterator(
                xyrange.npix(),
                rows.clone()
                    .flat_map(|r| cols.clone().map(move |c| (r, c)))
                    .map(|(r, c)| m[(r, c)]),
            )
        };
        Ok(SubImage {
            xyrange: *xyrange,
            pix: flatten(&self.pix),
            ivar: flatten(&self.ivar),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutout_is_row_major() {
        let pix = DMatrix::from_fn(4, 5, |r, c| (10 * r + c) as f64);
        let image = Image::new(pix, DMatrix::repeat(4, 5, 1.))
            .unwrap()
            .origin(100, 200);
        let sub = image.cutout(&PixelBox::new(102, 104, 201, 203)).unwrap();
        assert_eq!(sub.pix.as_slice(), &[12., 13., 22., 23.]);
        assert!(image.cutout(&PixelBox::new(99, 104, 201, 203)).is_err());
    }

    #[test]
    fn reject_bad_inputs() {
        let e = Image::new(DMatrix::zeros(3, 3), DMatrix::zeros(3, 4)).unwrap_err();
        assert!(matches!(e, InputError::ShapeMismatch { .. }));
        let mut ivar = DMatrix::repeat(3, 4, 1.);
        ivar[(2, 1)] = -1.;
        let e = Image::new(DMatrix::zeros(3, 4), ivar).unwrap_err();
        assert_eq!(e, InputError::NegativeIvar { x: 1, y: 2 });
    }
}
