use crate::core::radiance::{RadianceCube, RadianceFit, RadianceModel, SourceSpectrum};
use crate::core::smile::SmileShifts;
use crate::core::wavelength::WavelengthMap;
use crate::types::{HsiError, HsiImage, HsiResult};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, Array3, Array4};
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Version written to and required from calibration files
pub const BUNDLE_SCHEMA_VERSION: u32 = 2;

/// Everything derived by the calibration workflow for one camera.
///
/// Fields fill in step by step; a missing field means that step has not run.
/// On disk the bundle is a flat JSON object, see [`CalibrationBundle::dump`].
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationBundle {
    pub schema_version: u32,
    pub camera_id: String,
    pub calibration_date: Option<DateTime<Utc>>,
    pub wavelengths: Option<WavelengthMap>,
    pub smile_shifts: Option<SmileShifts>,
    /// Dark-subtracted, smile-aligned flat field
    pub flat_field_pic: Option<HsiImage>,
    pub dark_pic: Option<HsiImage>,
    pub hgar_pic: Option<HsiImage>,
    pub rad_ref: Option<RadianceCube>,
    /// DN -> radiance fit carrying `sfit_x`, `sfit_y` and `spec_rad_ref_luminance`
    pub radiance_fit: Option<RadianceFit>,
}

impl CalibrationBundle {
    pub fn new(camera_id: &str) -> Self {
        Self {
            schema_version: BUNDLE_SCHEMA_VERSION,
            camera_id: camera_id.to_string(),
            calibration_date: None,
            wavelengths: None,
            smile_shifts: None,
            flat_field_pic: None,
            dark_pic: None,
            hgar_pic: None,
            rad_ref: None,
            radiance_fit: None,
        }
    }

    /// Smile-aligned wavelength axis
    pub fn wavelengths(&self) -> Option<Array1<f64>> {
        self.wavelengths.as_ref().map(|w| w.wavelengths())
    }

    /// Coarse linear wavelength axis
    pub fn wavelengths_linear(&self) -> Option<Array1<f64>> {
        self.wavelengths.as_ref().map(|w| w.linear_wavelengths())
    }

    pub fn sfit_x(&self) -> Option<&[f64]> {
        self.radiance_fit.as_ref().map(|f| f.sfit_x())
    }

    pub fn sfit_y(&self) -> Option<&[f64]> {
        self.radiance_fit.as_ref().map(|f| f.sfit_y())
    }

    pub fn spec_rad_ref_luminance(&self) -> Option<f64> {
        self.radiance_fit.as_ref().map(|f| f.spec_rad_ref_luminance())
    }

    /// Read a bundle. Any read, decode, version or consistency failure is a
    /// persistence error and nothing is returned.
    pub fn load<P: AsRef<Path>>(path: P) -> HsiResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HsiError::Persistence(format!("Cannot read calibration {}: {}", path.display(), e))
        })?;

        #[derive(Deserialize)]
        struct Header {
            schema_version: u32,
        }
        let header: Header = serde_json::from_str(&text).map_err(|e| {
            HsiError::Persistence(format!("Calibration {} has no schema version: {}", path.display(), e))
        })?;
        if header.schema_version != BUNDLE_SCHEMA_VERSION {
            return Err(HsiError::Persistence(format!(
                "Calibration {} has schema version {}, expected {}",
                path.display(),
                header.schema_version,
                BUNDLE_SCHEMA_VERSION
            )));
        }

        let file: BundleFile = serde_json::from_str(&text).map_err(|e| {
            HsiError::Persistence(format!("Calibration {} is corrupt: {}", path.display(), e))
        })?;
        let bundle = Self::try_from(file)
            .and_then(|bundle| bundle.validate().map(|_| bundle))
            .map_err(|e| HsiError::Persistence(format!("Calibration {} is inconsistent: {}", path.display(), e)))?;

        log::info!(
            "Loaded calibration for camera {} from {} (steps: {})",
            bundle.camera_id,
            path.display(),
            bundle.completed_steps().join(", ")
        );
        Ok(bundle)
    }

    /// Write the bundle atomically: serialize next to `path`, then rename.
    ///
    /// The file is one JSON object whose top-level keys are the named arrays
    /// `wavelengths`, `wavelengths_linear`, `smile_shifts`, `flat_field_pic`,
    /// `dark_pic`, `HgAr_pic`, `rad_ref` (cross-track x spectral x exposure x
    /// luminance), `sfit_x`, `sfit_y` and `spec_rad_ref_luminance`. The
    /// wavelength polynomials, the cube grid, validity mask and darks, and the
    /// fitted radiance model sit beside them under their own keys.
    pub fn dump<P: AsRef<Path>>(&self, path: P) -> HsiResult<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &BundleFile::from(self))?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| {
            HsiError::Persistence(format!("Cannot write calibration {}: {}", path.display(), e.error))
        })?;

        log::debug!("Dumped calibration to {}", path.display());
        Ok(())
    }

    /// Fold one calibration step's result into the bundle
    pub fn apply(&mut self, update: CalibrationUpdate) {
        log::info!("Applying {} calibration update", update.step());
        match update {
            CalibrationUpdate::Spectral {
                hgar_pic,
                wavelengths,
                smile_shifts,
            } => {
                if self.smile_shifts.as_ref().map_or(false, |old| *old != smile_shifts)
                    && (self.flat_field_pic.is_some() || self.radiance_fit.is_some())
                {
                    log::warn!("Smile changed; discarding flat field and radiance fit aligned to the old shifts");
                    self.flat_field_pic = None;
                    self.radiance_fit = None;
                }
                self.hgar_pic = Some(hgar_pic);
                self.wavelengths = Some(wavelengths);
                self.smile_shifts = Some(smile_shifts);
            }
            CalibrationUpdate::Dark(dark) => self.dark_pic = Some(dark),
            CalibrationUpdate::FlatField(flat) => self.flat_field_pic = Some(flat),
            CalibrationUpdate::Radiance { rad_ref, fit } => {
                self.rad_ref = Some(rad_ref);
                self.radiance_fit = Some(fit);
            }
        }
        self.calibration_date = Some(Utc::now());
    }

    /// Names of the arrays present
    pub fn completed_steps(&self) -> Vec<&'static str> {
        let mut steps = Vec::new();
        if self.dark_pic.is_some() {
            steps.push("dark_pic");
        }
        if self.hgar_pic.is_some() {
            steps.push("HgAr_pic");
        }
        if self.wavelengths.is_some() {
            steps.push("wavelengths");
        }
        if self.smile_shifts.is_some() {
            steps.push("smile_shifts");
        }
        if self.flat_field_pic.is_some() {
            steps.push("flat_field_pic");
        }
        if self.rad_ref.is_some() {
            steps.push("rad_ref");
        }
        if self.radiance_fit.is_some() {
            steps.push("radiance_fit");
        }
        steps
    }

    fn validate(&self) -> HsiResult<()> {
        if let Some(smile) = &self.smile_shifts {
            SmileShifts::new(smile.shifts().to_vec(), smile.reference_row())?;
        }
        if let Some(cube) = &self.rad_ref {
            cube.validate()?;
        }

        let shapes = [
            ("dark_pic", self.dark_pic.as_ref().map(|a| a.dim())),
            ("flat_field_pic", self.flat_field_pic.as_ref().map(|a| a.dim())),
            ("HgAr_pic", self.hgar_pic.as_ref().map(|a| a.dim())),
            ("rad_ref", self.rad_ref.as_ref().map(|c| c.frame_dim())),
            ("radiance_fit", self.radiance_fit.as_ref().map(|f| f.frame_dim())),
        ];
        let mut present = shapes.iter().filter_map(|(name, dim)| dim.map(|d| (*name, d)));
        if let Some((first_name, first_dim)) = present.next() {
            if let Some((name, dim)) = present.find(|(_, d)| *d != first_dim) {
                return Err(HsiError::Configuration(format!(
                    "{} is {:?} but {} is {:?}",
                    name, dim, first_name, first_dim
                )));
            }
        }
        Ok(())
    }
}

type Rows = Vec<Vec<f64>>;

/// On-disk layout of a [`CalibrationBundle`]. Named arrays are plain nested
/// lists, outermost axis first.
#[derive(Serialize, Deserialize)]
struct BundleFile {
    schema_version: u32,
    camera_id: String,
    calibration_date: Option<DateTime<Utc>>,
    wavelengths: Option<Vec<f64>>,
    wavelengths_linear: Option<Vec<f64>>,
    wavelength_polynomials: Option<WavelengthMap>,
    smile_shifts: Option<Vec<f64>>,
    smile_reference_row: Option<usize>,
    flat_field_pic: Option<Rows>,
    dark_pic: Option<Rows>,
    #[serde(rename = "HgAr_pic")]
    hgar_pic: Option<Rows>,
    /// (cross-track, spectral, exposure, luminance)
    rad_ref: Option<Vec<Vec<Rows>>>,
    rad_ref_exposures_ms: Option<Vec<f64>>,
    rad_ref_luminances: Option<Vec<f64>>,
    /// (exposure, luminance)
    rad_ref_valid: Option<Array2<bool>>,
    /// (cross-track, spectral, exposure)
    rad_ref_dark: Option<Array3<f64>>,
    sfit_x: Option<Vec<f64>>,
    sfit_y: Option<Vec<f64>>,
    spec_rad_ref_luminance: Option<f64>,
    radiance_model: Option<RadianceModel>,
}

impl From<&CalibrationBundle> for BundleFile {
    fn from(bundle: &CalibrationBundle) -> Self {
        let map = bundle.wavelengths.as_ref();
        let cube = bundle.rad_ref.as_ref();
        let fit = bundle.radiance_fit.as_ref();
        Self {
            schema_version: bundle.schema_version,
            camera_id: bundle.camera_id.clone(),
            calibration_date: bundle.calibration_date,
            wavelengths: map.map(|w| w.wavelengths().to_vec()),
            wavelengths_linear: map.map(|w| w.linear_wavelengths().to_vec()),
            wavelength_polynomials: map.cloned(),
            smile_shifts: bundle.smile_shifts.as_ref().map(|s| s.shifts().to_vec()),
            smile_reference_row: bundle.smile_shifts.as_ref().map(|s| s.reference_row()),
            flat_field_pic: bundle.flat_field_pic.as_ref().map(to_rows),
            dark_pic: bundle.dark_pic.as_ref().map(to_rows),
            hgar_pic: bundle.hgar_pic.as_ref().map(to_rows),
            rad_ref: cube.map(|c| c.data().outer_iter().map(|plane| plane.outer_iter().map(|m| to_rows(&m)).collect()).collect()),
            rad_ref_exposures_ms: cube.map(|c| c.exposures_ms().to_vec()),
            rad_ref_luminances: cube.map(|c| c.luminances().to_vec()),
            rad_ref_valid: cube.map(|c| c.valid_mask().clone()),
            rad_ref_dark: cube.map(|c| c.darks().clone()),
            sfit_x: fit.map(|f| f.sfit_x().to_vec()),
            sfit_y: fit.map(|f| f.sfit_y().to_vec()),
            spec_rad_ref_luminance: fit.map(|f| f.spec_rad_ref_luminance()),
            radiance_model: fit.map(|f| f.model().clone()),
        }
    }
}

impl TryFrom<BundleFile> for CalibrationBundle {
    type Error = HsiError;

    fn try_from(file: BundleFile) -> HsiResult<Self> {
        let wavelengths = match (file.wavelength_polynomials, file.wavelengths, file.wavelengths_linear) {
            (Some(map), Some(aligned), Some(linear)) => {
                check_axis("wavelengths", &aligned, &map.wavelengths())?;
                check_axis("wavelengths_linear", &linear, &map.linear_wavelengths())?;
                Some(map)
            }
            (None, None, None) => None,
            _ => return Err(incomplete("wavelengths")),
        };

        let smile_shifts = match (file.smile_shifts, file.smile_reference_row) {
            (Some(shifts), Some(reference_row)) => Some(SmileShifts::new(shifts, reference_row)?),
            (None, None) => None,
            _ => return Err(incomplete("smile_shifts")),
        };

        let rad_ref = match (
            file.rad_ref,
            file.rad_ref_exposures_ms,
            file.rad_ref_luminances,
            file.rad_ref_valid,
            file.rad_ref_dark,
        ) {
            (Some(data), Some(exposures), Some(luminances), Some(valid), Some(dark)) => {
                Some(RadianceCube::from_parts(exposures, luminances, from_nested4(data)?, valid, dark)?)
            }
            (None, None, None, None, None) => None,
            _ => return Err(incomplete("rad_ref")),
        };

        let radiance_fit = match (file.radiance_model, file.sfit_x, file.sfit_y, file.spec_rad_ref_luminance) {
            (Some(model), Some(sfit_x), Some(sfit_y), Some(reference)) => {
                let source = SourceSpectrum::new(sfit_x, sfit_y, reference)?;
                Some(RadianceFit::from_parts(model, source)?)
            }
            (None, None, None, None) => None,
            _ => return Err(incomplete("radiance fit")),
        };

        Ok(Self {
            schema_version: file.schema_version,
            camera_id: file.camera_id,
            calibration_date: file.calibration_date,
            wavelengths,
            smile_shifts,
            flat_field_pic: file.flat_field_pic.map(|r| from_rows("flat_field_pic", r)).transpose()?,
            dark_pic: file.dark_pic.map(|r| from_rows("dark_pic", r)).transpose()?,
            hgar_pic: file.hgar_pic.map(|r| from_rows("HgAr_pic", r)).transpose()?,
            rad_ref,
            radiance_fit,
        })
    }
}

fn incomplete(what: &str) -> HsiError {
    HsiError::Configuration(format!("{} is only partially present", what))
}

fn to_rows<S: ndarray::Data<Elem = f64>>(image: &ndarray::ArrayBase<S, ndarray::Ix2>) -> Rows {
    image.outer_iter().map(|row| row.to_vec()).collect()
}

fn from_rows(name: &str, rows: Rows) -> HsiResult<HsiImage> {
    let cols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != cols) {
        return Err(HsiError::Configuration(format!("{} has rows of different lengths", name)));
    }
    let n_rows = rows.len();
    Array2::from_shape_vec((n_rows, cols), rows.into_iter().flatten().collect())
        .map_err(|e| HsiError::Configuration(format!("{}: {}", name, e)))
}

fn from_nested4(planes: Vec<Vec<Rows>>) -> HsiResult<Array4<f64>> {
    let n_cross = planes.len();
    let n_spectral = planes.first().map_or(0, Vec::len);
    let mut blocks = Vec::with_capacity(n_cross * n_spectral);
    for plane in planes {
        if plane.len() != n_spectral {
            return Err(HsiError::Configuration("rad_ref planes have different lengths".to_string()));
        }
        for rows in plane {
            blocks.push(from_rows("rad_ref", rows)?);
        }
    }
    let (ne, nl) = blocks.first().map_or((0, 0), |b| b.dim());
    if blocks.iter().any(|b| b.dim() != (ne, nl)) {
        return Err(HsiError::Configuration("rad_ref grid blocks have different shapes".to_string()));
    }
    let values: Vec<f64> = blocks.iter().flat_map(|b| b.iter().copied()).collect();
    Array4::from_shape_vec((n_cross, n_spectral, ne, nl), values)
        .map_err(|e| HsiError::Configuration(format!("rad_ref: {}", e)))
}

/// Stored wavelength axes must agree with the polynomials they came from
fn check_axis(name: &str, stored: &[f64], expected: &Array1<f64>) -> HsiResult<()> {
    let agrees = stored.len() == expected.len()
        && stored
            .iter()
            .zip(expected.iter())
            .all(|(a, b)| (a - b).abs() <= 1e-9 * b.abs().max(1.0));
    if !agrees {
        return Err(HsiError::Configuration(format!(
            "{} disagrees with the stored wavelength polynomials",
            name
        )));
    }
    Ok(())
}

/// Result of one calibration step, applied to the bundle as a unit
#[derive(Debug, Clone)]
pub enum CalibrationUpdate {
    /// HgAr capture with the wavelength map and smile derived from it
    Spectral {
        hgar_pic: HsiImage,
        wavelengths: WavelengthMap,
        smile_shifts: SmileShifts,
    },
    Dark(HsiImage),
    FlatField(HsiImage),
    Radiance {
        rad_ref: RadianceCube,
        fit: RadianceFit,
    },
}

impl CalibrationUpdate {
    pub fn step(&self) -> &'static str {
        match self {
            CalibrationUpdate::Spectral { .. } => "spectral",
            CalibrationUpdate::Dark(_) => "dark",
            CalibrationUpdate::FlatField(_) => "flat-field",
            CalibrationUpdate::Radiance { .. } => "radiance",
        }
    }
}

/// Calibration bundle persisted after every committed step
pub struct CalibrationStore {
    bundle: CalibrationBundle,
    path: PathBuf,
}

impl CalibrationStore {
    /// Start an empty calibration and write it immediately
    pub fn create<P: AsRef<Path>>(path: P, camera_id: &str) -> HsiResult<Self> {
        let store = Self {
            bundle: CalibrationBundle::new(camera_id),
            path: path.as_ref().to_path_buf(),
        };
        store.bundle.dump(&store.path)?;
        Ok(store)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> HsiResult<Self> {
        Ok(Self {
            bundle: CalibrationBundle::load(&path)?,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn open_or_create<P: AsRef<Path>>(path: P, camera_id: &str) -> HsiResult<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path, camera_id)
        }
    }

    pub fn bundle(&self) -> &CalibrationBundle {
        &self.bundle
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a step's update and persist. If writing fails the in-memory
    /// bundle keeps its previous state.
    pub fn commit(&mut self, update: CalibrationUpdate) -> HsiResult<()> {
        let mut next = self.bundle.clone();
        next.apply(update);
        next.dump(&self.path)?;
        self.bundle = next;
        Ok(())
    }

    /// Read-only copy for the runtime pipeline
    pub fn snapshot(&self) -> Arc<CalibrationBundle> {
        Arc::new(self.bundle.clone())
    }
}
