//! Null-distribution generation.
//!
//! Every draw is seeded with `base + index` and scored independently, so a
//! distribution is reproducible regardless of thread count and any single
//! draw can be replayed. A failing draw discards the whole distribution.

use std::f64::consts::TAU;

use comb_core::errors::AuditError;
use comb_core::{draw_seed, sha256_hex, RngHandle};
use comb_data::Spectrum;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::comb::{CombEngine, CombScore};
use crate::whiten::Whitener;

/// Resampling scheme applied to the whitened residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResampleMethod {
    /// Random permutation of the whitened residuals.
    Permute,
    /// Independent random sign per whitened residual.
    SignFlip,
}

/// Noise-free template around which synthetic spectra are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TemplateModel {
    /// The theory model column of the spectrum.
    Theory,
    /// `baseline + amplitude · exp(-ℓ/damping) · cos(2πℓ/period + phase)`.
    DampedOscillator {
        /// Constant offset.
        baseline: f64,
        /// Oscillation amplitude at ℓ = 0.
        amplitude: f64,
        /// Oscillation period in multipoles.
        period: f64,
        /// Exponential damping scale in multipoles.
        damping: f64,
        /// Phase offset in radians.
        phase: f64,
    },
}

impl TemplateModel {
    /// Evaluates the template on the spectrum grid.
    pub fn evaluate(&self, spectrum: &Spectrum) -> Vec<f64> {
        match *self {
            TemplateModel::Theory => spectrum.model().to_vec(),
            TemplateModel::DampedOscillator {
                baseline,
                amplitude,
                period,
                damping,
                phase,
            } => spectrum
                .ell()
                .iter()
                .map(|&l| {
                    let l = f64::from(l);
                    baseline + amplitude * (-l / damping).exp() * (TAU * l / period + phase).cos()
                })
                .collect(),
        }
    }

    fn validate(&self) -> Result<(), AuditError> {
        if let TemplateModel::DampedOscillator {
            baseline,
            amplitude,
            period,
            damping,
            phase,
        } = *self
        {
            let finite = [baseline, amplitude, period, damping, phase]
                .iter()
                .all(|value| value.is_finite());
            if !finite || period <= 0.0 || damping <= 0.0 {
                return Err(AuditError::config(
                    "synthetic_template",
                    "damped oscillator needs finite parameters with positive period and damping",
                ));
            }
        }
        Ok(())
    }
}

/// Comb injected into synthetic spectra: `amplitude · cos(2πℓ/period - phase)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalInjection {
    /// Injected period in multipoles.
    pub period: f64,
    /// Amplitude in spectrum units.
    pub amplitude: f64,
    /// Phase in radians.
    pub phase: f64,
}

impl SignalInjection {
    /// Injected values on the spectrum grid.
    pub fn evaluate(&self, ell: &[u32]) -> Vec<f64> {
        ell.iter()
            .map(|&l| self.amplitude * (TAU * f64::from(l) / self.period - self.phase).cos())
            .collect()
    }
}

/// Generator of synthetic spectra.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyntheticSpec {
    /// Template the noise is added to.
    pub model: TemplateModel,
    /// Optional comb added on top of template and noise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection: Option<SignalInjection>,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            model: TemplateModel::Theory,
            injection: None,
        }
    }
}

/// How a residual vector is produced for scoring.
///
/// `RealModel` scores the observed data; the other two produce null draws.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum ScoringStrategy {
    /// Observed spectrum against the theory model.
    RealModel,
    /// Resampled whitened residuals.
    Resampled {
        /// Resampling scheme.
        method: ResampleMethod,
    },
    /// Freshly drawn synthetic spectra pushed through the full pipeline.
    Synthetic(SyntheticSpec),
}

impl ScoringStrategy {
    /// Short label used in reports and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ScoringStrategy::RealModel => "real-model",
            ScoringStrategy::Resampled {
                method: ResampleMethod::Permute,
            } => "resampled-permute",
            ScoringStrategy::Resampled {
                method: ResampleMethod::SignFlip,
            } => "resampled-sign-flip",
            ScoringStrategy::Synthetic(_) => "synthetic",
        }
    }
}

/// Read-only state shared by every draw of one (dataset, channel, range) context.
#[derive(Debug)]
pub struct ScoringContext<'a> {
    spectrum: &'a Spectrum,
    whitener: &'a Whitener,
    engine: &'a CombEngine,
    whitened: Vec<f64>,
}

impl<'a> ScoringContext<'a> {
    /// Whitens the observed residuals once and checks the pieces line up.
    pub fn new(
        spectrum: &'a Spectrum,
        whitener: &'a Whitener,
        engine: &'a CombEngine,
    ) -> Result<Self, AuditError> {
        if engine.ell() != spectrum.ell() {
            return Err(AuditError::format(
                "context_grid",
                "comb engine grid differs from the spectrum grid",
            ));
        }
        let whitened = whitener.whiten(&spectrum.residuals())?;
        Ok(Self {
            spectrum,
            whitener,
            engine,
            whitened,
        })
    }

    /// Spectrum under test.
    pub fn spectrum(&self) -> &Spectrum {
        self.spectrum
    }

    /// Whitening transform of the context.
    pub fn whitener(&self) -> &Whitener {
        self.whitener
    }

    /// Comb engine of the context.
    pub fn engine(&self) -> &CombEngine {
        self.engine
    }

    /// Whitened observed residuals.
    pub fn whitened(&self) -> &[f64] {
        &self.whitened
    }

    /// Comb score of the observed data.
    pub fn observed(&self) -> Result<CombScore, AuditError> {
        self.engine.score(&self.whitened)
    }

    /// Draws one synthetic spectrum: template plus coloured noise plus injection
    /// in the observed column, with the theory model left in place.
    pub fn synthesize(&self, spec: &SyntheticSpec, seed: u64) -> Result<Spectrum, AuditError> {
        spec.model.validate()?;
        let mut rng = RngHandle::from_seed(seed);
        let unit: Vec<f64> = (0..self.spectrum.len())
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        let noise = self.whitener.color(&unit)?;
        let template = spec.model.evaluate(self.spectrum);
        let injected = spec
            .injection
            .map(|injection| injection.evaluate(self.spectrum.ell()))
            .unwrap_or_else(|| vec![0.0; self.spectrum.len()]);
        let observed = template
            .iter()
            .zip(&noise)
            .zip(&injected)
            .map(|((t, n), s)| t + n + s)
            .collect();
        // The mock is tested against the context's theory column, so any
        // template/theory mismatch survives into the residuals.
        self.spectrum.with_observed(observed)
    }

    /// Scores one draw of `strategy` seeded with `seed`.
    pub fn score_draw(
        &self,
        strategy: &ScoringStrategy,
        seed: u64,
    ) -> Result<CombScore, AuditError> {
        match strategy {
            ScoringStrategy::RealModel => self.observed(),
            ScoringStrategy::Resampled { method } => {
                let mut rng = RngHandle::from_seed(seed);
                let mut draw = self.whitened.clone();
                match method {
                    ResampleMethod::Permute => draw.shuffle(&mut rng),
                    ResampleMethod::SignFlip => {
                        for value in draw.iter_mut() {
                            if rng.gen::<bool>() {
                                *value = -*value;
                            }
                        }
                    }
                }
                self.engine.score(&draw)
            }
            ScoringStrategy::Synthetic(spec) => {
                let mock = self.synthesize(spec, seed)?;
                let whitened = self.whitener.whiten(&mock.residuals())?;
                self.engine.score(&whitened)
            }
        }
    }
}

/// Strength samples of a null distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullDistribution {
    /// Mechanism that produced the draws.
    pub mechanism: ScoringStrategy,
    /// Base seed of the context; draw `i` used `base_seed + i`.
    pub base_seed: u64,
    /// Number of draws.
    pub draws: usize,
    /// Candidate periods in order.
    pub periods: Vec<u32>,
    /// `per_period[p][i]` is the strength of period `p` in draw `i`.
    pub per_period: Vec<Vec<f64>>,
    /// Largest strength over all periods in each draw.
    pub best: Vec<f64>,
}

impl NullDistribution {
    /// Samples for the period at `index`.
    pub fn samples(&self, index: usize) -> &[f64] {
        &self.per_period[index]
    }

    /// SHA-256 over the little-endian bytes of every sample, for audit bookkeeping.
    pub fn digest(&self) -> String {
        let mut bytes = Vec::with_capacity(8 * (self.best.len() * (self.periods.len() + 1)));
        for samples in self.per_period.iter().chain(std::iter::once(&self.best)) {
            for value in samples {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        sha256_hex(&bytes)
    }
}

/// Parallel null generator owning its thread pool.
#[derive(Debug)]
pub struct NullGenerator {
    pool: rayon::ThreadPool,
    threads: usize,
}

impl NullGenerator {
    /// Builds a generator; `threads == 0` lets rayon pick the thread count.
    pub fn new(threads: usize) -> Result<Self, AuditError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|err| AuditError::config("thread_pool", err.to_string()))?;
        let threads = pool.current_num_threads();
        Ok(Self { pool, threads })
    }

    /// Worker threads in the pool.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Draws `draws` null samples for `strategy` in context `ctx`.
    pub fn generate(
        &self,
        ctx: &ScoringContext<'_>,
        strategy: &ScoringStrategy,
        base_seed: u64,
        draws: usize,
    ) -> Result<NullDistribution, AuditError> {
        if matches!(strategy, ScoringStrategy::RealModel) {
            return Err(AuditError::config(
                "null_strategy",
                "the real-model strategy scores observed data and cannot produce null draws",
            ));
        }
        if draws == 0 {
            return Err(AuditError::config(
                "null_draws",
                "null distribution needs at least one draw",
            ));
        }

        debug!(
            draws,
            base_seed,
            strategy = strategy.label(),
            threads = self.threads,
            "generating null"
        );
        let scored: Result<Vec<Vec<f64>>, AuditError> = self.pool.install(|| {
            (0..draws)
                .into_par_iter()
                .map(|index| {
                    ctx.score_draw(strategy, draw_seed(base_seed, index))
                        .map(|score| score.strengths())
                        .map_err(|err| err.with_context("draw", index.to_string()))
                })
                .collect()
        });
        let scored = scored.map_err(|err| {
            err.with_context("null", "discarded")
                .with_context("base_seed", base_seed.to_string())
        })?;

        let periods = ctx.engine().periods().to_vec();
        let mut per_period = vec![Vec::with_capacity(draws); periods.len()];
        let mut best = Vec::with_capacity(draws);
        for strengths in &scored {
            for (column, value) in per_period.iter_mut().zip(strengths) {
                column.push(*value);
            }
            best.push(strengths.iter().copied().fold(f64::NEG_INFINITY, f64::max));
        }
        info!(draws, strategy = strategy.label(), "null distribution complete");
        Ok(NullDistribution {
            mechanism: *strategy,
            base_seed,
            draws,
            periods,
            per_period,
            best,
        })
    }
}
