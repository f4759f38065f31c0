//! Settings and calibration bundle persistence

pub mod settings;
pub mod bundle;

pub use settings::{NominalWavelengths, Settings};
pub use bundle::{CalibrationBundle, CalibrationStore, CalibrationUpdate, BUNDLE_SCHEMA_VERSION};
