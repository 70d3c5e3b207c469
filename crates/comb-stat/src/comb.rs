//! Comb-signature statistics over a pre-registered period set.
//!
//! The harmonic kernel fits `a + b cos θ + c sin θ` with `θ = 2πℓ/P` by
//! least squares and reports the F-ratio of the sinusoidal component against
//! the residual variance. The folded kernel bins `ℓ mod P` and reports the
//! one-way ANOVA ratio of the bin means. Both are scale invariant, so any
//! whitening mode can feed them.

use std::f64::consts::TAU;

use comb_core::errors::{AuditError, ErrorInfo};
use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Smallest sample count the harmonic fit can score (three parameters plus one residual dof).
pub const MIN_SCORED_SAMPLES: usize = 4;

/// Default number of phase bins for the folded kernel.
pub const DEFAULT_FOLD_BINS: usize = 8;

// Relative eigenvalue floor below which a period's design is treated as degenerate.
const GRAM_RCOND: f64 = 1e-9;

/// Statistic used to score one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CombKernel {
    /// Least-squares sinusoid, F-ratio strength.
    Harmonic,
    /// Phase-folded bin means, ANOVA strength.
    Folded {
        /// Number of phase bins.
        #[serde(default = "default_fold_bins")]
        bins: usize,
    },
}

fn default_fold_bins() -> usize {
    DEFAULT_FOLD_BINS
}

impl Default for CombKernel {
    fn default() -> Self {
        CombKernel::Harmonic
    }
}

/// Strength and phase of the comb at one period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodScore {
    /// Candidate period in multipoles.
    pub period: u32,
    /// Non-negative signal strength.
    pub strength: f64,
    /// Phase in `[0, 2π)`: the comb peaks where `2πℓ/P ≡ phase`.
    pub phase: f64,
    /// Fitted amplitude in whitened units.
    pub amplitude: f64,
    /// The design could not resolve a phase at this period; strength is zero.
    pub degenerate: bool,
}

/// Scores of every candidate period for one residual vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombScore {
    /// Kernel that produced the scores.
    pub kernel: CombKernel,
    /// One entry per candidate period, in candidate order.
    pub scores: Vec<PeriodScore>,
    /// Index of the strongest period; ties go to the lowest index.
    pub best: usize,
}

impl CombScore {
    /// Score of the strongest period.
    pub fn best_score(&self) -> &PeriodScore {
        &self.scores[self.best]
    }

    /// Strengths in candidate order.
    pub fn strengths(&self) -> Vec<f64> {
        self.scores.iter().map(|score| score.strength).collect()
    }
}

#[derive(Debug, Clone)]
enum PeriodBasis {
    Harmonic {
        cos: Vec<f64>,
        sin: Vec<f64>,
        gram_inverse: Option<Matrix3<f64>>,
    },
    Folded {
        bin_of: Vec<usize>,
        bins: usize,
    },
}

/// Precomputed comb design for a fixed multipole grid and period set.
///
/// Building the engine is the expensive part; scoring a residual vector is
/// linear in the number of samples per period. One engine is shared
/// read-only by every draw of a context.
#[derive(Debug, Clone)]
pub struct CombEngine {
    ell: Vec<u32>,
    periods: Vec<u32>,
    kernel: CombKernel,
    bases: Vec<PeriodBasis>,
}

impl CombEngine {
    /// Builds the design for `ell` and `periods`.
    pub fn new(ell: &[u32], periods: &[u32], kernel: CombKernel) -> Result<Self, AuditError> {
        if periods.is_empty() {
            return Err(AuditError::config(
                "comb_no_periods",
                "candidate period set is empty",
            ));
        }
        if let Some(bad) = periods.iter().find(|&&period| period == 0) {
            return Err(AuditError::Config(
                ErrorInfo::new("comb_period", "candidate periods must be positive")
                    .with_context("period", bad.to_string()),
            ));
        }
        if ell.len() < MIN_SCORED_SAMPLES {
            return Err(AuditError::Format(
                ErrorInfo::new("comb_insufficient_samples", "too few samples to score a comb")
                    .with_context("samples", ell.len().to_string())
                    .with_context("minimum", MIN_SCORED_SAMPLES.to_string()),
            ));
        }
        if let CombKernel::Folded { bins } = kernel {
            if bins < 2 {
                return Err(AuditError::Config(
                    ErrorInfo::new("comb_fold_bins", "folded kernel needs at least two bins")
                        .with_context("bins", bins.to_string()),
                ));
            }
        }

        let bases = periods
            .iter()
            .map(|&period| match kernel {
                CombKernel::Harmonic => harmonic_basis(ell, period),
                CombKernel::Folded { bins } => folded_basis(ell, period, bins),
            })
            .collect();
        debug!(samples = ell.len(), periods = periods.len(), ?kernel, "comb engine built");
        Ok(Self {
            ell: ell.to_vec(),
            periods: periods.to_vec(),
            kernel,
            bases,
        })
    }

    /// Multipole grid the engine was built for.
    pub fn ell(&self) -> &[u32] {
        &self.ell
    }

    /// Candidate periods in order.
    pub fn periods(&self) -> &[u32] {
        &self.periods
    }

    /// Kernel in use.
    pub fn kernel(&self) -> CombKernel {
        self.kernel
    }

    /// Scores a whitened residual vector at every candidate period.
    pub fn score(&self, residuals: &[f64]) -> Result<CombScore, AuditError> {
        if residuals.len() != self.ell.len() {
            return Err(AuditError::Format(
                ErrorInfo::new("comb_dimension", "residual length does not match the comb grid")
                    .with_context("residuals", residuals.len().to_string())
                    .with_context("grid", self.ell.len().to_string()),
            ));
        }
        if residuals.iter().any(|value| !value.is_finite()) {
            return Err(AuditError::numerical(
                "comb_non_finite",
                "residuals contain non-finite values",
            ));
        }

        let scores: Vec<PeriodScore> = self
            .periods
            .iter()
            .zip(&self.bases)
            .map(|(&period, basis)| match basis {
                PeriodBasis::Harmonic {
                    cos,
                    sin,
                    gram_inverse,
                } => score_harmonic(period, cos, sin, gram_inverse.as_ref(), residuals),
                PeriodBasis::Folded { bin_of, bins } => {
                    score_folded(period, bin_of, *bins, residuals)
                }
            })
            .collect();

        let mut best = 0;
        for (idx, score) in scores.iter().enumerate().skip(1) {
            if score.strength > scores[best].strength {
                best = idx;
            }
        }
        Ok(CombScore {
            kernel: self.kernel,
            scores,
            best,
        })
    }
}

/// One-shot scoring without keeping the engine around.
pub fn score(
    ell: &[u32],
    residuals: &[f64],
    periods: &[u32],
    kernel: CombKernel,
) -> Result<CombScore, AuditError> {
    CombEngine::new(ell, periods, kernel)?.score(residuals)
}

fn harmonic_basis(ell: &[u32], period: u32) -> PeriodBasis {
    let (cos, sin): (Vec<f64>, Vec<f64>) = ell
        .iter()
        .map(|&l| {
            let theta = TAU * f64::from(l % period) / f64::from(period);
            (theta.cos(), theta.sin())
        })
        .unzip();

    let n = ell.len() as f64;
    let sc: f64 = cos.iter().sum();
    let ss: f64 = sin.iter().sum();
    let scc: f64 = cos.iter().map(|c| c * c).sum();
    let sss: f64 = sin.iter().map(|s| s * s).sum();
    let scs: f64 = cos.iter().zip(&sin).map(|(c, s)| c * s).sum();
    let gram = Matrix3::new(n, sc, ss, sc, scc, scs, ss, scs, sss);

    let eigen = SymmetricEigen::new(gram);
    let (lo, hi) = eigen
        .eigenvalues
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let gram_inverse = if lo > GRAM_RCOND * hi {
        gram.try_inverse()
    } else {
        None
    };
    if gram_inverse.is_none() {
        debug!(period, "harmonic design is degenerate");
    }
    PeriodBasis::Harmonic {
        cos,
        sin,
        gram_inverse,
    }
}

fn folded_basis(ell: &[u32], period: u32, bins: usize) -> PeriodBasis {
    let bin_of = ell
        .iter()
        .map(|&l| ((l % period) as usize * bins) / period as usize)
        .collect();
    PeriodBasis::Folded { bin_of, bins }
}

fn degenerate(period: u32) -> PeriodScore {
    PeriodScore {
        period,
        strength: 0.0,
        phase: 0.0,
        amplitude: 0.0,
        degenerate: true,
    }
}

// A perfect fit leaves zero residual variance; floor it relative to the data scale.
fn variance_floor(total: f64, n: f64) -> f64 {
    (f64::EPSILON * total / n).max(f64::MIN_POSITIVE)
}

fn score_harmonic(
    period: u32,
    cos: &[f64],
    sin: &[f64],
    gram_inverse: Option<&Matrix3<f64>>,
    x: &[f64],
) -> PeriodScore {
    let Some(gram_inverse) = gram_inverse else {
        return degenerate(period);
    };
    let n = x.len() as f64;
    let mut moment = Vector3::<f64>::zeros();
    let mut total = 0.0;
    for ((value, c), s) in x.iter().zip(cos).zip(sin) {
        moment[0] += value;
        moment[1] += value * c;
        moment[2] += value * s;
        total += value * value;
    }
    let beta = gram_inverse * moment;
    let explained = beta.dot(&moment);
    let mean_part = moment[0] * moment[0] / n;
    let fit = (explained - mean_part).max(0.0);
    let residual = (total - explained).max(0.0);
    let residual_variance = (residual / (n - 3.0)).max(variance_floor(total, n));

    PeriodScore {
        period,
        strength: (fit / 2.0) / residual_variance,
        phase: beta[2].atan2(beta[1]).rem_euclid(TAU),
        amplitude: beta[1].hypot(beta[2]),
        degenerate: false,
    }
}

fn score_folded(period: u32, bin_of: &[usize], bins: usize, x: &[f64]) -> PeriodScore {
    let mut sums = vec![0.0; bins];
    let mut counts = vec![0usize; bins];
    for (&bin, value) in bin_of.iter().zip(x) {
        sums[bin] += value;
        counts[bin] += 1;
    }
    let occupied = counts.iter().filter(|&&count| count > 0).count();
    let n = x.len();
    if occupied < 2 || n <= occupied {
        return degenerate(period);
    }
    let means: Vec<Option<f64>> = sums
        .iter()
        .zip(&counts)
        .map(|(sum, &count)| (count > 0).then(|| sum / count as f64))
        .collect();
    let grand = x.iter().sum::<f64>() / n as f64;

    let between: f64 = means
        .iter()
        .zip(&counts)
        .filter_map(|(mean, &count)| mean.map(|m| count as f64 * (m - grand).powi(2)))
        .sum();
    let within: f64 = bin_of
        .iter()
        .zip(x)
        .map(|(&bin, value)| (value - means[bin].unwrap_or(grand)).powi(2))
        .sum();
    let total: f64 = x.iter().map(|value| value * value).sum();
    let within_variance =
        (within / (n - occupied) as f64).max(variance_floor(total, n as f64));

    let mut peak = None::<(usize, f64)>;
    let mut trough = f64::INFINITY;
    for (bin, mean) in means.iter().enumerate() {
        if let Some(mean) = *mean {
            if peak.map_or(true, |(_, best)| mean > best) {
                peak = Some((bin, mean));
            }
            trough = trough.min(mean);
        }
    }
    let (peak_bin, peak_mean) = peak.unwrap_or((0, grand));

    PeriodScore {
        period,
        strength: (between / (occupied - 1) as f64) / within_variance,
        phase: TAU * (peak_bin as f64 + 0.5) / bins as f64,
        amplitude: (peak_mean - trough) / 2.0,
        degenerate: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: u32) -> Vec<u32> {
        (2..2 + n).collect()
    }

    #[test]
    fn harmonic_recovers_phase_and_amplitude() {
        let ell = grid(400);
        let phase = 1.2;
        let x: Vec<f64> = ell
            .iter()
            .map(|&l| 0.5 * (TAU * l as f64 / 40.0 - phase).cos() + 0.01 * ((l * 7919) % 13) as f64)
            .collect();
        let scored = score(&ell, &x, &[30, 40, 55], CombKernel::Harmonic).unwrap();
        assert_eq!(scored.best_score().period, 40);
        let best = scored.best_score();
        assert!((best.phase - phase).abs() < 0.05, "phase {}", best.phase);
        assert!((best.amplitude - 0.5).abs() < 0.05);
    }

    #[test]
    fn period_two_is_degenerate() {
        let ell = grid(50);
        let x: Vec<f64> = ell.iter().map(|&l| l as f64).collect();
        let scored = score(&ell, &x, &[2], CombKernel::Harmonic).unwrap();
        assert!(scored.scores[0].degenerate);
        assert_eq!(scored.scores[0].strength, 0.0);
    }

    #[test]
    fn ties_go_to_first_period() {
        let ell = grid(20);
        let zeros = vec![0.0; ell.len()];
        let scored = score(&ell, &zeros, &[5, 7, 9], CombKernel::Harmonic).unwrap();
        assert_eq!(scored.best, 0);
        assert!(scored.scores.iter().all(|s| s.strength == 0.0));
    }
}
