//! Range ablation and cross-range consistency.
//!
//! Each declared range is analysed as its own context: the covariance
//! sub-matrix is re-regularised and re-factorised, and the null uses the
//! range's own seed substream. Ranges below the minimum point count are
//! reported as skipped.

use std::f64::consts::TAU;

use comb_core::errors::AuditError;
use comb_data::{submatrix, Channel, Spectrum};
use comb_stat::{NullGenerator, ScoringStrategy, SignificanceReport};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::analysis::{
    context_seed, AnalysisContext, AnalysisSettings, CovarianceAudit, SeedContext,
};
use crate::config::AblationRange;

/// Execution status of one range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeStatus {
    /// Analysed.
    Executed,
    /// Below the minimum point count; carries no p-value.
    Skipped,
}

/// Outcome for one declared range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationResult {
    /// Range label.
    pub name: String,
    /// Inclusive lower multipole.
    pub ell_min: u32,
    /// Inclusive upper multipole.
    pub ell_max: u32,
    /// Samples falling inside the range.
    pub samples: usize,
    /// Executed or skipped.
    pub status: RangeStatus,
    /// Why the range was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Base seed of the range's null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_seed: Option<u64>,
    /// Covariance digests and regularisation for the range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covariance: Option<CovarianceAudit>,
    /// Significance of every period inside the range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub significance: Option<SignificanceReport>,
}

impl AblationResult {
    /// Best period and its phase, for executed ranges.
    pub fn best(&self) -> Option<(u32, f64)> {
        self.significance.as_ref().map(|report| {
            let best = report.best_period();
            (best.period, best.phase)
        })
    }
}

/// Overall verdict of the cross-range comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyVerdict {
    /// Same best period everywhere and phases within tolerance.
    Consistent,
    /// Best period or phase disagrees between ranges.
    Inconsistent,
    /// Fewer than two ranges were executed.
    Insufficient,
}

/// Cross-range consistency summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencySummary {
    /// Ranges analysed.
    pub executed: usize,
    /// Ranges skipped.
    pub skipped: usize,
    /// Every executed range picked the same best period.
    pub same_best_period: bool,
    /// Best-period phases agree pairwise within the tolerance.
    pub phases_within_tolerance: bool,
    /// Largest pairwise circular phase difference.
    pub max_phase_separation: f64,
    /// Declared tolerance in radians.
    pub phase_tolerance: f64,
    /// Verdict.
    pub verdict: ConsistencyVerdict,
}

/// All range outcomes, in declared order, plus the consistency summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationReport {
    /// One entry per declared range.
    pub ranges: Vec<AblationResult>,
    /// Cross-range summary.
    pub consistency: ConsistencySummary,
}

impl AblationReport {
    /// Outcome for the named range.
    pub fn get(&self, name: &str) -> Option<&AblationResult> {
        self.ranges.iter().find(|range| range.name == name)
    }
}

/// Everything the orchestrator needs besides the data.
#[derive(Debug, Clone)]
pub struct AblationSettings<'a> {
    /// Shared pre-registered analysis choices.
    pub analysis: &'a AnalysisSettings,
    /// Null mechanism for every range.
    pub strategy: ScoringStrategy,
    /// Null draws per range.
    pub draws: usize,
    /// Master seed of the run.
    pub master_seed: u64,
    /// Channel under analysis.
    pub channel: Channel,
    /// Minimum samples for a range to execute.
    pub min_points: usize,
    /// Pairwise phase tolerance in radians.
    pub phase_tolerance: f64,
}

/// Smallest angle between two phases, in `[0, π]`.
pub fn circular_distance(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(TAU);
    diff.min(TAU - diff)
}

/// Runs the analysis on every declared range.
pub fn run_ablation(
    spectrum: &Spectrum,
    covariance: Option<&DMatrix<f64>>,
    ranges: &[AblationRange],
    settings: &AblationSettings<'_>,
    generator: &NullGenerator,
) -> Result<AblationReport, AuditError> {
    let mut results = Vec::with_capacity(ranges.len());
    for (index, range) in ranges.iter().enumerate() {
        let indices = spectrum.range_indices(range.ell_min, range.ell_max);
        if indices.len() < settings.min_points {
            info!(
                range = %range.name,
                samples = indices.len(),
                min_points = settings.min_points,
                "ablation range skipped"
            );
            results.push(AblationResult {
                name: range.name.clone(),
                ell_min: range.ell_min,
                ell_max: range.ell_max,
                samples: indices.len(),
                status: RangeStatus::Skipped,
                reason: Some(format!(
                    "{} samples below the minimum of {}",
                    indices.len(),
                    settings.min_points
                )),
                base_seed: None,
                covariance: None,
                significance: None,
            });
            continue;
        }

        let sub_spectrum = spectrum.select(&indices);
        let sub_covariance = covariance.map(|matrix| submatrix(matrix, &indices));
        let base_seed = context_seed(
            settings.master_seed,
            settings.channel,
            SeedContext::Ablation(index),
        );
        let context =
            AnalysisContext::prepare(sub_spectrum, sub_covariance.as_ref(), settings.analysis)
                .map_err(|err| err.with_context("range", range.name.clone()))?;
        let (_, significance) = context
            .significance(
                generator,
                &settings.strategy,
                base_seed,
                settings.draws,
                &settings.analysis.correction,
            )
            .map_err(|err| err.with_context("range", range.name.clone()))?;
        let best = significance.best_period();
        info!(
            range = %range.name,
            samples = indices.len(),
            best_period = best.period,
            p_raw = best.p_raw,
            whitening = context.whitening().label(),
            "ablation range analysed"
        );
        results.push(AblationResult {
            name: range.name.clone(),
            ell_min: range.ell_min,
            ell_max: range.ell_max,
            samples: indices.len(),
            status: RangeStatus::Executed,
            reason: None,
            base_seed: Some(base_seed),
            covariance: context.covariance_audit(),
            significance: Some(significance),
        });
    }

    let consistency = summarize(&results, settings.phase_tolerance);
    if consistency.verdict == ConsistencyVerdict::Inconsistent {
        warn!(
            same_best_period = consistency.same_best_period,
            max_phase_separation = consistency.max_phase_separation,
            phase_tolerance = consistency.phase_tolerance,
            "ablation ranges disagree; evidence against a global periodicity"
        );
    }
    Ok(AblationReport {
        ranges: results,
        consistency,
    })
}

/// Cross-range comparison of executed ranges.
pub fn summarize(results: &[AblationResult], phase_tolerance: f64) -> ConsistencySummary {
    let bests: Vec<(u32, f64)> = results.iter().filter_map(AblationResult::best).collect();
    let executed = bests.len();
    let skipped = results.len() - executed;

    let same_best_period = bests.windows(2).all(|pair| pair[0].0 == pair[1].0);
    let mut max_phase_separation = 0.0f64;
    for (i, a) in bests.iter().enumerate() {
        for b in &bests[i + 1..] {
            max_phase_separation = max_phase_separation.max(circular_distance(a.1, b.1));
        }
    }
    let phases_within_tolerance = max_phase_separation <= phase_tolerance;
    let verdict = if executed < 2 {
        ConsistencyVerdict::Insufficient
    } else if same_best_period && phases_within_tolerance {
        ConsistencyVerdict::Consistent
    } else {
        ConsistencyVerdict::Inconsistent
    };
    ConsistencySummary {
        executed,
        skipped,
        same_best_period,
        phases_within_tolerance,
        max_phase_separation,
        phase_tolerance,
        verdict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::f64::consts::PI;

    #[test]
    fn circular_distance_wraps() {
        assert!((circular_distance(0.1, TAU - 0.1) - 0.2).abs() < 1e-12);
        assert!((circular_distance(1.0, 1.0 + PI) - PI).abs() < 1e-12);
    }
}
