//! Owned pixel containers shared by the solver, the footprint selector and the
//! candidate fitter.
//!
//! Every plane stores its pixels row-major as `Array2` indexed `[row, col]`, i.e.
//! `[y, x]`, and carries the parent-frame coordinates of its first pixel. Footprints
//! and bounding boxes are always expressed in the parent frame; converting to local
//! array indices happens here and nowhere else.

use ndarray::{Array2, ArrayView2, ArrayViewMut2, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric pixel types the fitting code is generic over.
pub trait Pixel: Copy + Default + PartialOrd + Send + Sync + Into<f64> + 'static {
    fn from_f64(value: f64) -> Self;
}

impl Pixel for f32 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Pixel for f64 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }
}

/// Bit plane value of a mask pixel. Any non-zero value marks the pixel as unusable.
pub type MaskPixel = u32;

/// Conventional mask planes.
pub mod mask_planes {
    use super::MaskPixel;

    pub const BAD: MaskPixel = 1 << 0;
    pub const SAT: MaskPixel = 1 << 1;
    pub const INTRP: MaskPixel = 1 << 2;
    pub const CR: MaskPixel = 1 << 3;
    /// Pixels a convolution could not fully support.
    pub const EDGE: MaskPixel = 1 << 4;
}

/// An inclusive, integer bounding box in the parent frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl BBox {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Box of `width` x `height` pixels whose first pixel is `(x0, y0)`.
    pub fn from_origin(x0: i32, y0: i32, width: usize, height: usize) -> Self {
        Self {
            x0,
            y0,
            x1: x0 + width as i32 - 1,
            y1: y0 + height as i32 - 1,
        }
    }

    pub fn width(&self) -> usize {
        (self.x1 - self.x0 + 1).max(0) as usize
    }

    pub fn height(&self) -> usize {
        (self.y1 - self.y0 + 1).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.x1 < self.x0 || self.y1 < self.y0
    }

    pub fn shift(&self, dx: i32, dy: i32) -> Self {
        Self::new(self.x0 + dx, self.y0 + dy, self.x1 + dx, self.y1 + dy)
    }

    pub fn contains(&self, other: &BBox) -> bool {
        other.x0 >= self.x0 && other.x1 <= self.x1 && other.y0 >= self.y0 && other.y1 <= self.y1
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }

    /// Smallest box containing both `self` and `other`.
    pub fn union(&self, other: &BBox) -> Self {
        Self::new(
            self.x0.min(other.x0),
            self.y0.min(other.y0),
            self.x1.max(other.x1),
            self.y1.max(other.y1),
        )
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.x0 + self.x1) / 2, (self.y0 + self.y1) / 2)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImageError {
    #[error(
        "Sub-image {bbox:?} does not fit inside the {width}x{height} image with origin ({x0}, {y0})."
    )]
    OutOfBounds {
        bbox: BBox,
        width: usize,
        height: usize,
        x0: i32,
        y0: i32,
    },

    #[error("Image planes disagree in size: expected {expected:?}, found {found:?}.")]
    DimensionMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// Resolves a parent-frame box to local `(col_start, row_start)` inside a plane, or
/// reports why it does not fit.
fn local_window(
    bbox: &BBox,
    x0: i32,
    y0: i32,
    width: usize,
    height: usize,
) -> Result<(usize, usize), ImageError> {
    let extent = BBox::from_origin(x0, y0, width, height);
    if bbox.is_empty() || !extent.contains(bbox) {
        return Err(ImageError::OutOfBounds {
            bbox: *bbox,
            width,
            height,
            x0,
            y0,
        });
    }
    Ok(((bbox.x0 - x0) as usize, (bbox.y0 - y0) as usize))
}

/// A single image plane with a parent-frame origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Image<P> {
    pixels: Array2<P>,
    x0: i32,
    y0: i32,
}

impl<P: Pixel> Image<P> {
    /// Wraps a `[rows, cols]` array with its first pixel at the parent origin.
    pub fn new(pixels: Array2<P>) -> Self {
        Self::with_origin(pixels, 0, 0)
    }

    pub fn with_origin(pixels: Array2<P>, x0: i32, y0: i32) -> Self {
        Self { pixels, x0, y0 }
    }

    pub fn from_elem(width: usize, height: usize, value: P) -> Self {
        Self::new(Array2::from_elem((height, width), value))
    }

    /// Builds a plane by evaluating `f(x, y)` at every local pixel.
    pub fn from_fn<F: FnMut(usize, usize) -> P>(width: usize, height: usize, mut f: F) -> Self {
        Self::new(Array2::from_shape_fn((height, width), |(y, x)| f(x, y)))
    }

    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    /// `(width, height)`.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width(), self.height())
    }

    pub fn x0(&self) -> i32 {
        self.x0
    }

    pub fn y0(&self) -> i32 {
        self.y0
    }

    pub fn bbox(&self) -> BBox {
        BBox::from_origin(self.x0, self.y0, self.width(), self.height())
    }

    /// Pixel at local column `x`, row `y`.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> P {
        self.pixels[[y, x]]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: P) {
        self.pixels[[y, x]] = value;
    }

    pub fn view(&self) -> ArrayView2<'_, P> {
        self.pixels.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut2<'_, P> {
        self.pixels.view_mut()
    }

    pub fn into_array(self) -> Array2<P> {
        self.pixels
    }

    pub fn to_f64(&self) -> Array2<f64> {
        self.pixels.mapv(Into::into)
    }

    /// Copies the parent-frame window `bbox` into a new plane whose origin is the
    /// window's first pixel.
    pub fn sub_image(&self, bbox: &BBox) -> Result<Self, ImageError> {
        let (col, row) = local_window(bbox, self.x0, self.y0, self.width(), self.height())?;
        let window = self
            .pixels
            .slice(s![row..row + bbox.height(), col..col + bbox.width()])
            .to_owned();
        Ok(Self::with_origin(window, bbox.x0, bbox.y0))
    }
}

/// Bad-pixel plane aligned with an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    bits: Array2<MaskPixel>,
    x0: i32,
    y0: i32,
}

impl Mask {
    pub fn new(width: usize, height: usize) -> Self {
        Self::with_origin(Array2::zeros((height, width)), 0, 0)
    }

    pub fn with_origin(bits: Array2<MaskPixel>, x0: i32, y0: i32) -> Self {
        Self { bits, x0, y0 }
    }

    pub fn width(&self) -> usize {
        self.bits.ncols()
    }

    pub fn height(&self) -> usize {
        self.bits.nrows()
    }

    pub fn x0(&self) -> i32 {
        self.x0
    }

    pub fn y0(&self) -> i32 {
        self.y0
    }

    pub fn bbox(&self) -> BBox {
        BBox::from_origin(self.x0, self.y0, self.width(), self.height())
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> MaskPixel {
        self.bits[[y, x]]
    }

    /// ORs `bits` into the local pixel `(x, y)`.
    pub fn set_bits(&mut self, x: usize, y: usize, bits: MaskPixel) {
        self.bits[[y, x]] |= bits;
    }

    pub fn view(&self) -> ArrayView2<'_, MaskPixel> {
        self.bits.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut2<'_, MaskPixel> {
        self.bits.view_mut()
    }

    pub fn sub_mask(&self, bbox: &BBox) -> Result<Self, ImageError> {
        let (col, row) = local_window(bbox, self.x0, self.y0, self.width(), self.height())?;
        let window = self
            .bits
            .slice(s![row..row + bbox.height(), col..col + bbox.width()])
            .to_owned();
        Ok(Self::with_origin(window, bbox.x0, bbox.y0))
    }
}

/// Image, mask and variance planes sharing one geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedImage<P> {
    image: Image<P>,
    mask: Mask,
    variance: Image<P>,
}

impl<P: Pixel> MaskedImage<P> {
    pub fn new(image: Image<P>, mask: Mask, variance: Image<P>) -> Result<Self, ImageError> {
        let expected = image.dimensions();
        for found in [(mask.width(), mask.height()), variance.dimensions()] {
            if found != expected {
                return Err(ImageError::DimensionMismatch { expected, found });
            }
        }
        let (x0, y0) = (image.x0(), image.y0());
        let mask = Mask::with_origin(mask.bits, x0, y0);
        let variance = Image::with_origin(variance.pixels, x0, y0);
        Ok(Self {
            image,
            mask,
            variance,
        })
    }

    /// Image with a clean mask and a constant variance plane.
    pub fn from_image(image: Image<P>, variance: P) -> Self {
        let (width, height) = image.dimensions();
        let (x0, y0) = (image.x0(), image.y0());
        Self {
            mask: Mask::with_origin(Array2::zeros((height, width)), x0, y0),
            variance: Image::with_origin(Array2::from_elem((height, width), variance), x0, y0),
            image,
        }
    }

    pub fn image(&self) -> &Image<P> {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Image<P> {
        &mut self.image
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub fn mask_mut(&mut self) -> &mut Mask {
        &mut self.mask
    }

    pub fn variance(&self) -> &Image<P> {
        &self.variance
    }

    pub fn width(&self) -> usize {
        self.image.width()
    }

    pub fn height(&self) -> usize {
        self.image.height()
    }

    pub fn dimensions(&self) -> (usize, usize) {
        self.image.dimensions()
    }

    pub fn x0(&self) -> i32 {
        self.image.x0()
    }

    pub fn y0(&self) -> i32 {
        self.image.y0()
    }

    pub fn bbox(&self) -> BBox {
        self.image.bbox()
    }

    pub fn sub_image(&self, bbox: &BBox) -> Result<Self, ImageError> {
        Ok(Self {
            image: self.image.sub_image(bbox)?,
            mask: self.mask.sub_mask(bbox)?,
            variance: self.variance.sub_image(bbox)?,
        })
    }
}
