use crate::core::window::{CropGeometry, WindowGeometry};
use crate::types::{HsiError, HsiResult, PixelFormat, ProcessingLevel};
use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Nominal wavelength axis used before (or without) a wavelength calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NominalWavelengths {
    /// One wavelength per spectral band
    Array { wavelengths_nm: Vec<f64> },
    /// Evenly spaced bands from `start_nm` to `end_nm` inclusive
    Range { start_nm: f64, end_nm: f64, bands: usize },
    /// Manufacturer dispersion model: `pixel0_nm + (offset_px + i) * dispersion_nm_px`
    Dispersion {
        pixel0_nm: f64,
        dispersion_nm_px: f64,
        offset_px: f64,
        bands: usize,
    },
}

/// Camera configuration stored next to the calibration bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub camera_id: String,
    pub model_number: String,
    /// Operating mode the calibration belongs to (e.g. binning preset name)
    pub mode: String,
    /// Hardware window (height, width) in sensor pixels
    pub win_resolution: (usize, usize),
    /// Hardware window (row, column) offset in sensor pixels
    pub win_offset: (usize, usize),
    pub binning: usize,
    pub pixel_format: PixelFormat,
    pub exposure_ms: f64,
    pub crop: CropGeometry,
    pub nominal_wavelengths: Option<NominalWavelengths>,
    pub calibration_date: Option<DateTime<Utc>>,
    /// Calibration bundle path, relative paths resolve against the settings file
    pub calibration_file: Option<PathBuf>,
    pub processing_level: ProcessingLevel,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            camera_id: String::new(),
            model_number: String::new(),
            mode: "default".to_string(),
            win_resolution: (0, 0),
            win_offset: (0, 0),
            binning: 1,
            pixel_format: PixelFormat::Mono12,
            exposure_ms: 10.0,
            crop: CropGeometry::default(),
            nominal_wavelengths: None,
            calibration_date: None,
            calibration_file: None,
            processing_level: ProcessingLevel::Raw,
        }
    }
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> HsiResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HsiError::Persistence(format!("Cannot read settings {}: {}", path.display(), e))
        })?;
        let settings: Settings = serde_json::from_str(&text).map_err(|e| {
            HsiError::Persistence(format!("Settings {} are invalid: {}", path.display(), e))
        })?;
        settings.validate()?;
        log::info!(
            "Loaded settings for camera {} ({}), window {:?} at {:?}",
            settings.camera_id,
            settings.model_number,
            settings.win_resolution,
            settings.win_offset
        );
        Ok(settings)
    }

    /// Write pretty JSON atomically
    pub fn save<P: AsRef<Path>>(&self, path: P) -> HsiResult<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
        }
        tmp.persist(path).map_err(|e| {
            HsiError::Persistence(format!("Cannot write settings {}: {}", path.display(), e.error))
        })?;
        log::debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Settings using the window found on the full sensor
    pub fn with_window(&self, window: &WindowGeometry) -> Settings {
        let mut next = self.clone();
        next.win_offset = (window.hw_offset, self.win_offset.1);
        next.win_resolution = (window.hw_height, self.win_resolution.1);
        next.crop = CropGeometry {
            offset_x: self.crop.offset_x,
            width: self.crop.width,
            ..window.crop
        };
        next
    }

    /// Settings stamped with a new calibration date
    pub fn with_calibration_date(&self, date: DateTime<Utc>) -> Settings {
        let mut next = self.clone();
        next.calibration_date = Some(date);
        next
    }

    /// Bundle path, resolved against `base_dir` when relative
    pub fn calibration_path(&self, base_dir: &Path) -> Option<PathBuf> {
        self.calibration_file.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                base_dir.join(p)
            }
        })
    }

    /// Coarse wavelength of each spectral band
    pub fn nominal_wavelengths(&self) -> HsiResult<Array1<f64>> {
        let description = self.nominal_wavelengths.as_ref().ok_or_else(|| {
            HsiError::Configuration("Settings have no nominal wavelength description".to_string())
        })?;

        let wavelengths = match description {
            NominalWavelengths::Array { wavelengths_nm } => Array1::from(wavelengths_nm.clone()),
            NominalWavelengths::Range { start_nm, end_nm, bands } => {
                if *bands < 2 {
                    return Err(HsiError::Configuration(format!(
                        "Wavelength range needs at least 2 bands, got {}",
                        bands
                    )));
                }
                Array1::linspace(*start_nm, *end_nm, *bands)
            }
            NominalWavelengths::Dispersion {
                pixel0_nm,
                dispersion_nm_px,
                offset_px,
                bands,
            } => Array1::from_shape_fn(*bands, |i| pixel0_nm + (offset_px + i as f64) * dispersion_nm_px),
        };

        if wavelengths.is_empty() {
            return Err(HsiError::Configuration("Nominal wavelength axis is empty".to_string()));
        }
        Ok(wavelengths)
    }

    fn validate(&self) -> HsiResult<()> {
        if !(self.exposure_ms > 0.0) {
            return Err(HsiError::Configuration(format!(
                "Exposure must be positive, got {} ms",
                self.exposure_ms
            )));
        }
        if self.binning == 0 {
            return Err(HsiError::Configuration("Binning must be at least 1".to_string()));
        }
        if let Some(height) = self.crop.height {
            if self.win_resolution.0 > 0 && self.crop.offset_y + height > self.win_resolution.0 {
                return Err(HsiError::Configuration(format!(
                    "Crop rows {}..{} exceed the {} row window",
                    self.crop.offset_y,
                    self.crop.offset_y + height,
                    self.win_resolution.0
                )));
            }
        }
        Ok(())
    }
}
