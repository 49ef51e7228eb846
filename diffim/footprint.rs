//! Span-based footprints, their growth, and the functors that scan image planes
//! through a footprint.

use crate::image::{BBox, Image, Mask, MaskPixel, Pixel};
use serde::{Deserialize, Serialize};

/// A horizontal run of pixels `x0..=x1` on row `y`, in the parent frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub y: i32,
    pub x0: i32,
    pub x1: i32,
}

impl Span {
    pub fn new(y: i32, x0: i32, x1: i32) -> Self {
        Self { y, x0, x1 }
    }

    pub fn len(&self) -> usize {
        (self.x1 - self.x0 + 1).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.x1 < self.x0
    }
}

/// A detected region: a set of pixels stored as sorted, non-overlapping spans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    spans: Vec<Span>,
    bbox: BBox,
}

impl Footprint {
    /// Builds a footprint from arbitrary spans; overlapping or touching spans on the
    /// same row are merged.
    pub fn new(spans: Vec<Span>) -> Self {
        let spans = normalize(spans);
        let bbox = spans
            .iter()
            .map(|s| BBox::new(s.x0, s.y, s.x1, s.y))
            .reduce(|a, b| a.union(&b))
            .unwrap_or(BBox::new(0, 0, -1, -1));
        Self { spans, bbox }
    }

    /// Every pixel of `bbox`.
    pub fn from_bbox(bbox: BBox) -> Self {
        Self::new(
            (bbox.y0..=bbox.y1)
                .map(|y| Span::new(y, bbox.x0, bbox.x1))
                .collect(),
        )
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    pub fn npix(&self) -> usize {
        self.spans.iter().map(Span::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.spans
            .iter()
            .any(|s| s.y == y && s.x0 <= x && x <= s.x1)
    }

    /// Dilates the footprint by `margin` pixels.
    ///
    /// The default (`isotropic == false`) is the fast Manhattan grow: a pixel is added
    /// when its L1 distance to the footprint is at most `margin`. Isotropic growth uses
    /// the Euclidean distance instead. Either way a single pixel grows to a box that is
    /// `margin` pixels larger on every side.
    pub fn grow(&self, margin: usize, isotropic: bool) -> Footprint {
        if margin == 0 {
            return self.clone();
        }
        let r = margin as i32;
        let mut grown = Vec::with_capacity(self.spans.len() * (2 * margin + 1));
        for span in &self.spans {
            for dy in -r..=r {
                let reach = if isotropic {
                    let (r, dy) = (i64::from(r), i64::from(dy));
                    ((r * r - dy * dy) as f64).sqrt().floor() as i32
                } else {
                    r - dy.abs()
                };
                grown.push(Span::new(span.y + dy, span.x0 - reach, span.x1 + reach));
            }
        }
        Footprint::new(grown)
    }

    /// Iterates over every pixel `(x, y)` of the footprint.
    pub fn pixels(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.spans
            .iter()
            .flat_map(|s| (s.x0..=s.x1).map(move |x| (x, s.y)))
    }
}

fn normalize(mut spans: Vec<Span>) -> Vec<Span> {
    spans.retain(|s| !s.is_empty());
    spans.sort_unstable();
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if last.y == span.y && span.x0 <= last.x1 + 1 => {
                last.x1 = last.x1.max(span.x1);
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// The part of `span` that lies inside `bbox`, as local column range and row.
fn clip_span(span: &Span, bbox: &BBox) -> Option<(usize, usize, usize)> {
    if span.y < bbox.y0 || span.y > bbox.y1 {
        return None;
    }
    let x0 = span.x0.max(bbox.x0);
    let x1 = span.x1.min(bbox.x1);
    if x1 < x0 {
        return None;
    }
    Some((
        (span.y - bbox.y0) as usize,
        (x0 - bbox.x0) as usize,
        (x1 - bbox.x0) as usize,
    ))
}

/// ORs together every mask value inside a footprint. Pixels of the footprint that
/// fall outside the mask are ignored.
#[derive(Debug)]
pub struct FindSetBits<'a> {
    mask: &'a Mask,
    bits: MaskPixel,
}

impl<'a> FindSetBits<'a> {
    pub fn new(mask: &'a Mask) -> Self {
        Self { mask, bits: 0 }
    }

    pub fn apply(&mut self, footprint: &Footprint) {
        let extent = self.mask.bbox();
        let view = self.mask.view();
        self.bits = footprint
            .spans()
            .iter()
            .filter_map(|span| clip_span(span, &extent))
            .flat_map(|(row, c0, c1)| (c0..=c1).map(move |col| (row, col)))
            .fold(0, |acc, (row, col)| acc | view[[row, col]]);
    }

    pub fn bits(&self) -> MaskPixel {
        self.bits
    }
}

/// Sums image values inside a footprint.
#[derive(Debug)]
pub struct FindCounts<'a, P> {
    image: &'a Image<P>,
    counts: f64,
}

impl<'a, P: Pixel> FindCounts<'a, P> {
    pub fn new(image: &'a Image<P>) -> Self {
        Self { image, counts: 0.0 }
    }

    pub fn apply(&mut self, footprint: &Footprint) {
        let extent = self.image.bbox();
        let view = self.image.view();
        self.counts = footprint
            .spans()
            .iter()
            .filter_map(|span| clip_span(span, &extent))
            .flat_map(|(row, c0, c1)| (c0..=c1).map(move |col| (row, col)))
            .map(|(row, col)| -> f64 { view[[row, col]].into() })
            .sum();
    }

    pub fn counts(&self) -> f64 {
        self.counts
    }
}
