//! Empirical p-values and look-elsewhere correction.

use comb_core::errors::{AuditError, ErrorInfo};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::comb::CombScore;
use crate::null::{NullDistribution, ScoringStrategy};
use crate::whiten::WhiteningMode;

/// Fraction of `null` samples at least as large as `observed`.
///
/// The result is exactly `k/N`; no smoothing is applied, so `0` means no
/// draw reached the observed value and the true p-value is below `1/N`.
pub fn pvalue(observed: f64, null: &[f64]) -> Result<f64, AuditError> {
    let (exceedances, draws) = exceedances(observed, null)?;
    Ok(exceedances as f64 / draws as f64)
}

fn exceedances(observed: f64, null: &[f64]) -> Result<(usize, usize), AuditError> {
    if null.is_empty() {
        return Err(AuditError::config(
            "pvalue_empty_null",
            "p-value requested against an empty null distribution",
        ));
    }
    if !observed.is_finite() {
        return Err(AuditError::numerical(
            "pvalue_non_finite",
            "observed statistic is not finite",
        ));
    }
    Ok((null.iter().filter(|&&value| value >= observed).count(), null.len()))
}

/// Bonferroni correction over `tests` simultaneous tests, capped at 1.
pub fn bonferroni(p_raw: f64, tests: usize) -> f64 {
    (p_raw * tests as f64).min(1.0)
}

/// Multiple-comparison correction method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionMethod {
    /// `min(p · N_tests, 1)`.
    Bonferroni,
}

/// Look-elsewhere accounting for one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    /// Correction method.
    pub method: CorrectionMethod,
    /// Number of candidate periods.
    pub candidate_periods: usize,
    /// Declared multiplicity of extra search axes (ranges, channels, kernels).
    pub extra_axes: usize,
    /// Total number of tests, `candidate_periods · extra_axes`.
    pub tests: usize,
}

impl Correction {
    /// Bonferroni correction over `candidate_periods · extra_axes` tests.
    pub fn bonferroni(candidate_periods: usize, extra_axes: usize) -> Result<Self, AuditError> {
        if candidate_periods == 0 || extra_axes == 0 {
            return Err(AuditError::Config(
                ErrorInfo::new("correction_tests", "look-elsewhere factors must be positive")
                    .with_context("candidate_periods", candidate_periods.to_string())
                    .with_context("extra_axes", extra_axes.to_string()),
            ));
        }
        Ok(Self {
            method: CorrectionMethod::Bonferroni,
            candidate_periods,
            extra_axes,
            tests: candidate_periods * extra_axes,
        })
    }

    /// Applies the correction to a raw p-value.
    pub fn apply(&self, p_raw: f64) -> f64 {
        match self.method {
            CorrectionMethod::Bonferroni => bonferroni(p_raw, self.tests),
        }
    }
}

/// Interpolated quantiles of a null sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NullQuantiles {
    /// Median.
    pub q50: f64,
    /// 95th percentile.
    pub q95: f64,
    /// 99th percentile.
    pub q99: f64,
}

impl NullQuantiles {
    /// Quantiles of `values` (need not be sorted).
    pub fn of(values: &[f64]) -> Self {
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        Self {
            q50: percentile(&sorted, 0.50),
            q95: percentile(&sorted, 0.95),
            q99: percentile(&sorted, 0.99),
        }
    }
}

fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let position = quantile * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Significance of one candidate period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSignificance {
    /// Candidate period.
    pub period: u32,
    /// Observed strength.
    pub strength: f64,
    /// Observed phase in `[0, 2π)`.
    pub phase: f64,
    /// Observed amplitude in whitened units.
    pub amplitude: f64,
    /// Null draws at least as strong as the observation.
    pub exceedances: usize,
    /// Null draws.
    pub draws: usize,
    /// `exceedances / draws`.
    pub p_raw: f64,
    /// Look-elsewhere corrected p-value.
    pub p_corrected: f64,
    /// Smallest non-zero p-value the null can resolve, `1 / draws`.
    pub resolution: f64,
    /// No draw reached the observation; `p_raw` is an upper bound at resolution.
    pub at_resolution_limit: bool,
    /// Whitening applied before scoring.
    pub whitening: WhiteningMode,
    /// Correction applied to `p_raw`.
    pub correction: Correction,
    /// Null quantiles for context.
    pub null_quantiles: NullQuantiles,
}

/// Per-period significances of one context plus the max-statistic p-value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceReport {
    /// Whitening applied to observed and null residuals.
    pub whitening: WhiteningMode,
    /// Mechanism of the null.
    pub null_mechanism: ScoringStrategy,
    /// Base seed of the null context.
    pub base_seed: u64,
    /// Null draws.
    pub draws: usize,
    /// Digest of the null samples.
    pub null_digest: String,
    /// One entry per candidate period.
    pub periods: Vec<PeriodSignificance>,
    /// Index of the observed best period.
    pub best: usize,
    /// Fraction of draws whose best strength over all periods reached the observed best.
    pub p_global: f64,
}

impl SignificanceReport {
    /// Entry of the observed best period.
    pub fn best_period(&self) -> &PeriodSignificance {
        &self.periods[self.best]
    }
}

/// Compares an observed score against its null distribution.
pub fn assess(
    observed: &CombScore,
    null: &NullDistribution,
    whitening: WhiteningMode,
    correction: &Correction,
) -> Result<SignificanceReport, AuditError> {
    let observed_periods: Vec<u32> = observed.scores.iter().map(|s| s.period).collect();
    if observed_periods != null.periods {
        return Err(AuditError::Config(
            ErrorInfo::new("significance_periods", "observed and null period sets differ")
                .with_context("observed", format!("{observed_periods:?}"))
                .with_context("null", format!("{:?}", null.periods)),
        ));
    }
    if correction.candidate_periods != observed_periods.len() {
        return Err(AuditError::Config(
            ErrorInfo::new(
                "significance_correction",
                "correction was built for a different number of periods",
            )
            .with_context("correction", correction.candidate_periods.to_string())
            .with_context("periods", observed_periods.len().to_string()),
        ));
    }

    let mut periods = Vec::with_capacity(observed.scores.len());
    for (index, score) in observed.scores.iter().enumerate() {
        let samples = null.samples(index);
        let (hits, draws) = exceedances(score.strength, samples)?;
        let p_raw = hits as f64 / draws as f64;
        periods.push(PeriodSignificance {
            period: score.period,
            strength: score.strength,
            phase: score.phase,
            amplitude: score.amplitude,
            exceedances: hits,
            draws,
            p_raw,
            p_corrected: correction.apply(p_raw),
            resolution: 1.0 / draws as f64,
            at_resolution_limit: hits == 0,
            whitening,
            correction: *correction,
            null_quantiles: NullQuantiles::of(samples),
        });
    }
    let p_global = pvalue(observed.best_score().strength, &null.best)?;
    debug!(
        best_period = observed.best_score().period,
        p_global,
        whitening = whitening.label(),
        "significance assessed"
    );
    Ok(SignificanceReport {
        whitening,
        null_mechanism: null.mechanism,
        base_seed: null.base_seed,
        draws: null.draws,
        null_digest: null.digest(),
        periods,
        best: observed.best,
        p_global,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pvalue_counts_ties_as_exceedances() {
        let null = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(pvalue(3.0, &null).unwrap(), 0.5);
        assert_eq!(pvalue(5.0, &null).unwrap(), 0.0);
        assert_eq!(pvalue(0.0, &null).unwrap(), 1.0);
    }

    #[test]
    fn bonferroni_caps_at_one() {
        assert_eq!(bonferroni(0.2, 10), 1.0);
        assert!((bonferroni(0.01, 5) - 0.05).abs() < 1e-15);
    }

    #[test]
    fn percentile_interpolates() {
        let q = NullQuantiles::of(&[3.0, 1.0, 2.0]);
        assert_eq!(q.q50, 2.0);
        assert!((q.q95 - 2.9).abs() < 1e-12);
    }
}
