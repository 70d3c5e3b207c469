//! False-positive calibration of the p-value machinery.
//!
//! Zero-signal synthetic spectra are drawn around the context's template
//! and each is tested against its own resampling null. Under a correct
//! null the fraction of trials with `p_raw < alpha` at any single period
//! matches `alpha` within binomial error.

use comb_core::errors::{AuditError, ErrorInfo};
use comb_core::{derive_substream_seed, draw_seed};
use comb_stat::{NullGenerator, ResampleMethod, ScoringStrategy};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::analysis::{AnalysisContext, AnalysisSettings};
use crate::config::CalibrationSpec;

/// Band, in binomial standard errors, inside which a rate is accepted.
pub const CALIBRATION_SIGMA_BAND: f64 = 3.0;

/// Empirical false-positive rate at one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodRate {
    /// Candidate period.
    pub period: u32,
    /// Trials with `p_raw < alpha`.
    pub hits: usize,
    /// `hits / trials`.
    pub rate: f64,
    /// `|rate - alpha|` in binomial standard errors.
    pub deviation_sigma: f64,
    /// Whether the deviation is inside the accepted band.
    pub within_band: bool,
}

/// Outcome of a calibration campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Synthetic trials.
    pub trials: usize,
    /// Null draws per trial.
    pub draws: usize,
    /// Nominal level.
    pub alpha: f64,
    /// Base seed of the campaign.
    pub base_seed: u64,
    /// Mechanism producing the trial spectra.
    pub trial_strategy: ScoringStrategy,
    /// Mechanism producing each trial's null.
    pub null_strategy: ScoringStrategy,
    /// Rate an exact resampling null attains: `ceil(alpha N) / (N + 1)`.
    pub exact_null_rate: f64,
    /// Binomial standard error of a rate at `alpha`.
    pub standard_error: f64,
    /// Per-period rates.
    pub per_period: Vec<PeriodRate>,
    /// Trials with `p_raw < alpha` at any period.
    pub any_period_hits: usize,
    /// `any_period_hits / trials`.
    pub any_period_rate: f64,
    /// Every per-period rate is inside the band.
    pub calibrated: bool,
}

/// Runs `spec.trials` zero-signal trials on the grid of `context`.
pub fn calibrate(
    context: &AnalysisContext,
    settings: &AnalysisSettings,
    spec: &CalibrationSpec,
    method: ResampleMethod,
    base_seed: u64,
    generator: &NullGenerator,
) -> Result<CalibrationReport, AuditError> {
    if spec.spec.injection.is_some() {
        return Err(AuditError::Config(
            ErrorInfo::new(
                "calibration_injection",
                "false-positive calibration requires zero injected signal",
            )
            .with_hint("remove `injection` from the calibration template"),
        ));
    }
    if spec.trials == 0 || spec.draws == 0 {
        return Err(AuditError::config(
            "calibration_counts",
            "calibration trials and draws must be positive",
        ));
    }
    let trial_strategy = ScoringStrategy::Synthetic(spec.spec);
    let null_strategy = ScoringStrategy::Resampled { method };

    let periods = &settings.periods;
    let mut hits = vec![0usize; periods.len()];
    let mut any_period_hits = 0usize;
    for trial in 0..spec.trials {
        let mock = context
            .synthesize(&spec.spec, draw_seed(base_seed, trial))
            .map_err(|err| err.with_context("trial", trial.to_string()))?;
        let (_, report) = context
            .significance_of(
                &mock,
                generator,
                &null_strategy,
                derive_substream_seed(base_seed, trial as u64),
                spec.draws,
                &settings.correction,
            )
            .map_err(|err| err.with_context("trial", trial.to_string()))?;
        let mut any = false;
        for (count, entry) in hits.iter_mut().zip(&report.periods) {
            if entry.p_raw < spec.alpha {
                *count += 1;
                any = true;
            }
        }
        if any {
            any_period_hits += 1;
        }
    }

    let trials = spec.trials as f64;
    let standard_error = (spec.alpha * (1.0 - spec.alpha) / trials).sqrt();
    let per_period: Vec<PeriodRate> = periods
        .iter()
        .zip(&hits)
        .map(|(&period, &count)| {
            let rate = count as f64 / trials;
            let deviation_sigma = (rate - spec.alpha).abs() / standard_error;
            PeriodRate {
                period,
                hits: count,
                rate,
                deviation_sigma,
                within_band: deviation_sigma <= CALIBRATION_SIGMA_BAND,
            }
        })
        .collect();
    let calibrated = per_period.iter().all(|entry| entry.within_band);
    let exact_null_rate = (spec.alpha * spec.draws as f64).ceil() / (spec.draws + 1) as f64;

    if calibrated {
        info!(
            trials = spec.trials,
            alpha = spec.alpha,
            any_period_rate = any_period_hits as f64 / trials,
            "false-positive calibration within band"
        );
    } else {
        warn!(
            trials = spec.trials,
            alpha = spec.alpha,
            "false-positive rate outside the binomial band at one or more periods"
        );
    }
    Ok(CalibrationReport {
        trials: spec.trials,
        draws: spec.draws,
        alpha: spec.alpha,
        base_seed,
        trial_strategy,
        null_strategy,
        exact_null_rate,
        standard_error,
        per_period,
        any_period_hits,
        any_period_rate: any_period_hits as f64 / trials,
        calibrated,
    })
}
