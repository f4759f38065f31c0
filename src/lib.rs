//! hsicalib: wavelength and radiometric calibration for pushbroom hyperspectral sensors
//!
//! The calibration workflow finds the illuminated sensor window, fits a
//! pixel to wavelength mapping from an HgAr emission spectrum, measures the
//! cross-track smile and builds a DN to radiance fit from a calibrated
//! integrating sphere. The runtime [`FrameProcessor`] applies the stored
//! calibration to each captured line at the requested processing level.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use crate::types::{
    Frame, FrameStatistics, HsiError, HsiImage, HsiResult, PixelFormat, ProcessingLevel,
};

pub use crate::core::{
    crop_frame, derive_flat_field, FrameProcessor, GeometricWindower, LineMatcher, PeakDetector,
    RadianceCubeBuilder, RadianceFit, SmileCorrector, WavelengthFitter,
};
pub use crate::io::{CalibrationBundle, CalibrationStore, CalibrationUpdate, Settings};
