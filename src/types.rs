use chrono::{DateTime, Utc};
use ndarray::Array2;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Floating point image (cross-track x spectral pixel)
pub type HsiImage = Array2<f64>;

/// Processing levels applied to captured lines, in increasing order of correction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProcessingLevel {
    /// Digital numbers straight from the sensor
    Raw,
    /// Dark reference subtracted
    DarkSubtracted,
    /// Smile aligned and divided by the flat field
    FlatFielded,
    /// Spectral radiance
    Radiance,
    /// Radiance normalized by a reference panel
    Reflectance,
}

impl ProcessingLevel {
    /// Parse the integer processing level used by the runtime parameter surface.
    /// Both -1 and 0 select raw output.
    pub fn from_code(code: i32) -> HsiResult<Self> {
        match code {
            -1 | 0 => Ok(ProcessingLevel::Raw),
            1 => Ok(ProcessingLevel::DarkSubtracted),
            2 => Ok(ProcessingLevel::FlatFielded),
            3 => Ok(ProcessingLevel::Radiance),
            4 => Ok(ProcessingLevel::Reflectance),
            other => Err(HsiError::Configuration(format!(
                "Processing level must be in -1..=4, got {}",
                other
            ))),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ProcessingLevel::Raw => 0,
            ProcessingLevel::DarkSubtracted => 1,
            ProcessingLevel::FlatFielded => 2,
            ProcessingLevel::Radiance => 3,
            ProcessingLevel::Reflectance => 4,
        }
    }
}

impl std::fmt::Display for ProcessingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingLevel::Raw => write!(f, "raw"),
            ProcessingLevel::DarkSubtracted => write!(f, "dark-subtracted"),
            ProcessingLevel::FlatFielded => write!(f, "flat-fielded"),
            ProcessingLevel::Radiance => write!(f, "radiance"),
            ProcessingLevel::Reflectance => write!(f, "reflectance"),
        }
    }
}

/// Sensor pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Mono10,
    Mono12,
    Mono16,
}

impl PixelFormat {
    pub fn bit_depth(&self) -> u32 {
        match self {
            PixelFormat::Mono8 => 8,
            PixelFormat::Mono10 => 10,
            PixelFormat::Mono12 => 12,
            PixelFormat::Mono16 => 16,
        }
    }

    /// Largest digital number the format can represent (the saturation level)
    pub fn max_dn(&self) -> f64 {
        ((1u32 << self.bit_depth()) - 1) as f64
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mono{}", self.bit_depth())
    }
}

/// One captured line image (cross-track x spectral pixel) with its capture metadata.
///
/// Frames are immutable: every correction produces a new frame tagged with the
/// level it was processed to, so a correction can never be applied twice.
#[derive(Debug, Clone)]
pub struct Frame {
    data: HsiImage,
    exposure_ms: f64,
    temperature_c: Option<f64>,
    timestamp: DateTime<Utc>,
    level: ProcessingLevel,
}

impl Frame {
    /// Wrap raw digital numbers captured at `exposure_ms`
    pub fn raw(data: HsiImage, exposure_ms: f64, timestamp: DateTime<Utc>) -> HsiResult<Self> {
        if !(exposure_ms > 0.0) {
            return Err(HsiError::InputData(format!(
                "Exposure must be positive, got {} ms",
                exposure_ms
            )));
        }
        if data.is_empty() {
            return Err(HsiError::InputData("Frame has no pixels".to_string()));
        }
        Ok(Self {
            data,
            exposure_ms,
            temperature_c: None,
            timestamp,
            level: ProcessingLevel::Raw,
        })
    }

    /// Convert an integer sensor buffer (u8/u16/...) into a raw frame
    pub fn from_dn<T>(dn: &Array2<T>, exposure_ms: f64, timestamp: DateTime<Utc>) -> HsiResult<Self>
    where
        T: ToPrimitive,
    {
        let values: Option<Vec<f64>> = dn.iter().map(|v| v.to_f64()).collect();
        let values = values.ok_or_else(|| {
            HsiError::InputData("Digital number not representable as f64".to_string())
        })?;
        Self::raw(Array2::from_shape_vec(dn.dim(), values)?, exposure_ms, timestamp)
    }

    pub fn with_temperature(mut self, temperature_c: f64) -> Self {
        self.temperature_c = Some(temperature_c);
        self
    }

    /// Build the corrected successor of this frame, keeping its capture metadata
    pub(crate) fn derive(&self, data: HsiImage, level: ProcessingLevel) -> Self {
        Self {
            data,
            exposure_ms: self.exposure_ms,
            temperature_c: self.temperature_c,
            timestamp: self.timestamp,
            level,
        }
    }

    pub fn data(&self) -> &HsiImage {
        &self.data
    }

    pub fn into_data(self) -> HsiImage {
        self.data
    }

    /// (cross-track rows, spectral pixels)
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn exposure_ms(&self) -> f64 {
        self.exposure_ms
    }

    pub fn temperature_c(&self) -> Option<f64> {
        self.temperature_c
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn level(&self) -> ProcessingLevel {
        self.level
    }

    /// Number of pixels at or above `max_dn`
    pub fn saturated_pixel_count(&self, max_dn: f64) -> usize {
        self.data.iter().filter(|&&v| v >= max_dn).count()
    }
}

/// Image statistics published for the external auto-exposure controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameStatistics {
    pub mean: f64,
    pub variance: f64,
    pub median: f64,
}

impl FrameStatistics {
    pub fn from_frame(frame: &Frame) -> Self {
        let data = frame.data();
        let n = data.len() as f64;
        let mean = data.sum() / n;
        let variance = data.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;

        let mut sorted: Vec<f64> = data.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            0.5 * (sorted[mid - 1] + sorted[mid])
        } else {
            sorted[mid]
        };

        Self { mean, variance, median }
    }
}

/// Error types for calibration and frame processing
#[derive(Debug, thiserror::Error)]
pub enum HsiError {
    /// Malformed, under- or over-exposed capture. The operator retries the step.
    #[error("Input data error: {0}")]
    InputData(String),

    /// A fit could not be produced; `detail` names the rows/points that failed
    #[error("Calibration fit error in {step}: {detail}")]
    CalibrationFit { step: String, detail: String },

    /// Requested processing is not supported by the loaded calibration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unreadable, corrupt or mismatched calibration/settings file
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HsiError {
    pub fn fit(step: &str, detail: impl Into<String>) -> Self {
        HsiError::CalibrationFit {
            step: step.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<ndarray::ShapeError> for HsiError {
    fn from(e: ndarray::ShapeError) -> Self {
        HsiError::Processing(format!("Shape error: {}", e))
    }
}

/// Result type for calibration operations
pub type HsiResult<T> = Result<T, HsiError>;
