//! Calibration steps and the runtime frame processor

pub mod interp;
pub mod peaks;
pub mod line_matcher;
pub mod wavelength;
pub mod smile;
pub mod window;
pub mod radiance;
pub mod processor;

// Re-export main types
pub use interp::{ExtrapolationPolicy, InterpolationKind, Interpolator};
pub use peaks::{Peak, PeakDetectionParams, PeakDetector, PeakSet};
pub use line_matcher::{
    hgar_reference_lines, AutoAccept, LineMatch, LineMatchParams, LineMatcher, MatchOverride,
    MatchProposal, MatchReviewer, ReferenceLine,
};
pub use wavelength::{Polynomial, RowWavelengthFit, WavelengthFitParams, WavelengthFitter, WavelengthMap};
pub use smile::{shift_row, SmileCorrector, SmileParams, SmileShifts};
pub use window::{crop_frame, CropGeometry, GeometricWindower, SensorSpan, WindowGeometry, WindowParams};
pub use radiance::{
    CancelFlag, FrameSource, LuminanceSource, RadianceCube, RadianceCubeBuilder, RadianceCubeParams,
    ExposureKnot, RadianceFit, RadianceFitParams, RadianceModel, SourceSpectrum,
};
pub use processor::{derive_flat_field, FrameProcessor};
