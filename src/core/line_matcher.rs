use crate::core::peaks::{Peak, PeakSet};
use crate::types::{HsiError, HsiResult};
use serde::{Deserialize, Serialize};

/// A known emission line of the calibration lamp
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLine {
    pub wavelength_nm: f64,
    /// 1 = brightest line on a typical silicon sensor
    pub brightness_rank: usize,
}

/// Mercury-argon lamp lines visible to a VNIR silicon sensor
pub fn hgar_reference_lines() -> Vec<ReferenceLine> {
    [
        (404.656, 5),
        (435.833, 2),
        (546.074, 1),
        (576.960, 6),
        (579.066, 7),
        (696.543, 8),
        (706.722, 10),
        (738.398, 11),
        (763.511, 3),
        (772.376, 16),
        (794.818, 12),
        (800.616, 13),
        (811.531, 4),
        (826.452, 14),
        (842.465, 15),
        (912.297, 9),
    ]
    .iter()
    .map(|&(wavelength_nm, brightness_rank)| ReferenceLine {
        wavelength_nm,
        brightness_rank,
    })
    .collect()
}

/// Line matching parameters
#[derive(Debug, Clone)]
pub struct LineMatchParams {
    /// Number of brightest peaks used to seed the provisional linear scale
    pub top_k: usize,
    /// Expected wavelengths of the `top_k` brightest peaks, brightest first.
    /// Falls back to the reference table's brightness ranks when absent.
    pub hint_wavelengths: Option<Vec<f64>>,
    /// Largest accepted distance between predicted and reference wavelength (nm)
    pub max_error_nm: f64,
}

impl Default for LineMatchParams {
    fn default() -> Self {
        Self {
            top_k: 2,
            hint_wavelengths: None,
            max_error_nm: 3.0,   // ~1.5 px at typical VNIR dispersion
        }
    }
}

/// A detected peak assigned to a reference wavelength
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineMatch {
    pub pixel: f64,
    pub wavelength_nm: f64,
    pub intensity: f64,
    /// Predicted minus reference wavelength under the provisional scale
    pub residual_nm: f64,
}

/// Automated matching result for one row, offered to a reviewer
#[derive(Debug, Clone, Default)]
pub struct MatchProposal {
    pub row: usize,
    pub matches: Vec<LineMatch>,
    pub unmatched_peaks: Vec<Peak>,
    /// Provisional (slope nm/px, intercept nm)
    pub provisional_scale: Option<(f64, f64)>,
}

/// Operator correction to a proposed match set
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchOverride {
    /// Assign the peak nearest `pixel` to `wavelength_nm`
    Assign { pixel: f64, wavelength_nm: f64 },
    /// Drop the match of the peak nearest `pixel`
    Remove { pixel: f64 },
}

/// Human-in-the-loop review of ambiguous matches
pub trait MatchReviewer {
    /// Show the automated proposal to the operator
    fn propose(&mut self, proposal: &MatchProposal);

    /// Corrections the operator made to the last proposal
    fn overrides(&mut self) -> Vec<MatchOverride>;
}

/// Accepts every automated proposal unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAccept;

impl MatchReviewer for AutoAccept {
    fn propose(&mut self, _proposal: &MatchProposal) {}

    fn overrides(&mut self) -> Vec<MatchOverride> {
        Vec::new()
    }
}

/// Peaks further than this from an override pixel are not considered the same peak
const OVERRIDE_PIXEL_TOLERANCE: f64 = 0.5;

/// Matches detected peaks to a reference line table
pub struct LineMatcher {
    params: LineMatchParams,
    lines: Vec<ReferenceLine>,
}

impl LineMatcher {
    pub fn new(params: LineMatchParams, lines: Vec<ReferenceLine>) -> Self {
        Self { params, lines }
    }

    /// HgAr lamp with default parameters
    pub fn hgar() -> Self {
        Self::new(LineMatchParams::default(), hgar_reference_lines())
    }

    pub fn params(&self) -> &LineMatchParams {
        &self.params
    }

    /// Automated matching without operator review
    pub fn match_peaks(&self, row: usize, peaks: &PeakSet) -> HsiResult<Vec<LineMatch>> {
        self.match_with_review(row, peaks, &mut AutoAccept)
    }

    /// Propose matches, let `reviewer` correct them, and require at least two
    /// confident matches in the final set
    pub fn match_with_review(
        &self,
        row: usize,
        peaks: &PeakSet,
        reviewer: &mut dyn MatchReviewer,
    ) -> HsiResult<Vec<LineMatch>> {
        let proposal = self.propose(row, peaks)?;
        reviewer.propose(&proposal);
        let overrides = reviewer.overrides();
        if !overrides.is_empty() {
            log::info!("Row {}: applying {} operator override(s)", row, overrides.len());
        }

        let mut matches = apply_overrides(&proposal, peaks, &overrides)?;
        matches.sort_by(|a, b| a.pixel.total_cmp(&b.pixel));

        if matches.len() < 2 {
            return Err(HsiError::fit(
                "line matching",
                format!(
                    "row {}: only {} confident match(es) from {} peaks ({} unmatched); at least 2 required",
                    row,
                    matches.len(),
                    peaks.len(),
                    proposal.unmatched_peaks.len()
                ),
            ));
        }
        log::debug!("Row {}: matched {} of {} peaks", row, matches.len(), peaks.len());
        Ok(matches)
    }

    /// Seed a linear scale from the brightest peaks, then greedily match the rest
    pub fn propose(&self, row: usize, peaks: &PeakSet) -> HsiResult<MatchProposal> {
        let mut ranked: Vec<Peak> = peaks.clone();
        ranked.sort_by(|a, b| b.intensity.total_cmp(&a.intensity).then(a.index.cmp(&b.index)));

        let seed_wavelengths: Vec<f64> = match &self.params.hint_wavelengths {
            Some(hints) => hints.clone(),
            None => {
                let mut by_rank = self.lines.clone();
                by_rank.sort_by_key(|l| l.brightness_rank);
                by_rank.iter().map(|l| l.wavelength_nm).collect()
            }
        };

        let k = self.params.top_k.min(seed_wavelengths.len()).min(ranked.len());
        if k < 2 {
            return Ok(MatchProposal {
                row,
                matches: Vec::new(),
                unmatched_peaks: ranked,
                provisional_scale: None,
            });
        }

        let seeds: Vec<(f64, f64)> = ranked[..k]
            .iter()
            .zip(seed_wavelengths.iter())
            .map(|(p, &wl)| (p.position, wl))
            .collect();
        let (slope, intercept) = linear_least_squares(&seeds).ok_or_else(|| {
            HsiError::fit("line matching", format!("row {}: seed peaks share one pixel position", row))
        })?;
        if slope <= 0.0 {
            return Err(HsiError::fit(
                "line matching",
                format!(
                    "row {}: brightest peaks {:?} give a decreasing wavelength scale ({:.4} nm/px)",
                    row, seeds, slope
                ),
            ));
        }
        log::debug!("Row {}: provisional scale {:.4} nm/px + {:.2} nm", row, slope, intercept);

        let mut used = vec![false; self.lines.len()];
        let mut matches = Vec::new();
        let mut unmatched = Vec::new();

        for (i, peak) in ranked.iter().enumerate() {
            let predicted = slope * peak.position + intercept;

            if i < k {
                let target = seed_wavelengths[i];
                let residual = predicted - target;
                if residual.abs() <= self.params.max_error_nm {
                    if let Some(j) = self.lines.iter().position(|l| l.wavelength_nm == target) {
                        used[j] = true;
                    }
                    matches.push(LineMatch {
                        pixel: peak.position,
                        wavelength_nm: target,
                        intensity: peak.intensity,
                        residual_nm: residual,
                    });
                } else {
                    unmatched.push(*peak);
                }
                continue;
            }

            let nearest = self
                .lines
                .iter()
                .enumerate()
                .filter(|(j, _)| !used[*j])
                .filter(|(_, l)| !matches.iter().any(|m: &LineMatch| m.wavelength_nm == l.wavelength_nm))
                .min_by(|(_, a), (_, b)| {
                    (a.wavelength_nm - predicted)
                        .abs()
                        .total_cmp(&(b.wavelength_nm - predicted).abs())
                });

            match nearest {
                Some((j, line)) if (line.wavelength_nm - predicted).abs() <= self.params.max_error_nm => {
                    used[j] = true;
                    matches.push(LineMatch {
                        pixel: peak.position,
                        wavelength_nm: line.wavelength_nm,
                        intensity: peak.intensity,
                        residual_nm: predicted - line.wavelength_nm,
                    });
                }
                _ => unmatched.push(*peak),
            }
        }

        Ok(MatchProposal {
            row,
            matches,
            unmatched_peaks: unmatched,
            provisional_scale: Some((slope, intercept)),
        })
    }
}

fn apply_overrides(
    proposal: &MatchProposal,
    peaks: &PeakSet,
    overrides: &[MatchOverride],
) -> HsiResult<Vec<LineMatch>> {
    let mut matches = proposal.matches.clone();

    for ov in overrides {
        match *ov {
            MatchOverride::Assign { pixel, wavelength_nm } => {
                let peak = peaks
                    .iter()
                    .find(|p| (p.position - pixel).abs() <= OVERRIDE_PIXEL_TOLERANCE)
                    .ok_or_else(|| {
                        HsiError::fit(
                            "line matching",
                            format!("row {}: override refers to pixel {:.1} with no detected peak", proposal.row, pixel),
                        )
                    })?;
                matches.retain(|m| m.pixel != peak.position && m.wavelength_nm != wavelength_nm);
                matches.push(LineMatch {
                    pixel: peak.position,
                    wavelength_nm,
                    intensity: peak.intensity,
                    residual_nm: 0.0,
                });
            }
            MatchOverride::Remove { pixel } => {
                matches.retain(|m| (m.pixel - pixel).abs() > OVERRIDE_PIXEL_TOLERANCE);
            }
        }
    }
    Ok(matches)
}

/// Least-squares line y = a x + b through `(x, y)` pairs
pub(crate) fn linear_least_squares(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|p| p.0).sum();
    let sum_y: f64 = points.iter().map(|p| p.1).sum();
    let sum_xx: f64 = points.iter().map(|p| p.0 * p.0).sum();
    let sum_xy: f64 = points.iter().map(|p| p.0 * p.1).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < 1e-12 {
        return None;
    }
    let a = (n * sum_xy - sum_x * sum_y) / denom;
    let b = (sum_y * sum_xx - sum_x * sum_xy) / denom;
    Some((a, b))
}
