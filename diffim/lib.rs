#![deny(dead_code)]
#![deny(unused_imports)]

pub mod background;
pub mod basis;
pub mod candidates;
pub mod config;
pub mod convolve;
pub mod detection;
pub mod footprint;
pub mod linalg;
pub mod selection;
pub mod solver;
pub mod statistics;

#[path = "../shared/image.rs"]
pub mod image;

pub use background::{Background, PolynomialBackground};
pub use basis::{
    BasisError, BasisKernel, KernelBasis, LinearCombinationKernel, alard_lupton_basis,
    delta_function_basis,
};
pub use candidates::{CandidateError, KernelCandidate, fit_candidates};
pub use config::{ConfigError, PsfMatchConfig};
pub use convolve::{Convolver, DirectConvolver, ValidRegion, convolve_and_subtract};
pub use detection::{Detector, Threshold, ThresholdType};
pub use footprint::{FindCounts, FindSetBits, Footprint, Span};
pub use image::{BBox, Image, ImageError, Mask, MaskPixel, MaskedImage, Pixel, mask_planes};
pub use linalg::{SOLVE_CHAIN, SolveChainExhausted, SolveStrategy};
pub use selection::{FootprintSelection, SelectionError, select_footprints};
pub use solver::{KernelSolver, NormalEquations, PsfMatchSolution, SolverError};
pub use statistics::ImageStatistics;
