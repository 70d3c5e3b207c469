//! One analysis context: a spectrum slice with its cached whitener and comb design.

use comb_core::derive_substream_seed;
use comb_core::errors::AuditError;
use comb_data::{Channel, Spectrum};
use comb_stat::{
    assess, matrix_digest, prepare, CombEngine, CombKernel, CombScore, Correction, NullGenerator,
    PreparedWhitener, RegularizationDiagnostics, ScoringContext, ScoringStrategy,
    SignificanceReport, SyntheticSpec, WhiteningMode,
};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Randomness substream of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedContext {
    /// Baseline resampling null.
    Baseline,
    /// Baseline synthetic null.
    Synthetic,
    /// False-positive calibration.
    Calibration,
    /// Ablation range by declared index.
    Ablation(usize),
}

impl SeedContext {
    fn id(self) -> u64 {
        match self {
            SeedContext::Baseline => 0,
            SeedContext::Synthetic => 1,
            SeedContext::Calibration => 2,
            SeedContext::Ablation(index) => 0x100 + index as u64,
        }
    }
}

fn channel_id(channel: Channel) -> u64 {
    match channel {
        Channel::TT => 1,
        Channel::EE => 2,
        Channel::TE => 3,
        Channel::BB => 4,
    }
}

/// Base seed of a (channel, context) substream.
pub fn context_seed(master_seed: u64, channel: Channel, context: SeedContext) -> u64 {
    derive_substream_seed(
        derive_substream_seed(master_seed, channel_id(channel)),
        context.id(),
    )
}

/// Pre-registered choices every context shares.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSettings {
    /// Candidate periods.
    pub periods: Vec<u32>,
    /// Comb kernel.
    pub kernel: CombKernel,
    /// Condition-number bound for covariance regularisation.
    pub max_condition: f64,
    /// Look-elsewhere correction applied to every p-value.
    pub correction: Correction,
}

/// Covariance bookkeeping for the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceAudit {
    /// Digest of the aligned input matrix.
    pub original_hash: String,
    /// Digest of the matrix actually factorised.
    pub regularized_hash: String,
    /// Regularisation record.
    pub diagnostics: RegularizationDiagnostics,
}

/// Spectrum with its whitener and comb engine, built once and shared by all draws.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    spectrum: Spectrum,
    prepared: PreparedWhitener,
    engine: CombEngine,
}

impl AnalysisContext {
    /// Factorises the covariance (if any) and precomputes the comb design.
    pub fn prepare(
        spectrum: Spectrum,
        covariance: Option<&DMatrix<f64>>,
        settings: &AnalysisSettings,
    ) -> Result<Self, AuditError> {
        let prepared = prepare(&spectrum, covariance, settings.max_condition)?;
        let engine = CombEngine::new(spectrum.ell(), &settings.periods, settings.kernel)?;
        debug!(
            samples = spectrum.len(),
            whitening = prepared.whitener.mode().label(),
            "analysis context prepared"
        );
        Ok(Self {
            spectrum,
            prepared,
            engine,
        })
    }

    /// Spectrum under analysis.
    pub fn spectrum(&self) -> &Spectrum {
        &self.spectrum
    }

    /// Whitening rigor level.
    pub fn whitening(&self) -> WhiteningMode {
        self.prepared.whitener.mode()
    }

    /// Digests and diagnostics of the covariance, in covariance mode.
    pub fn covariance_audit(&self) -> Option<CovarianceAudit> {
        self.prepared
            .covariance
            .as_ref()
            .map(|covariance| CovarianceAudit {
                original_hash: matrix_digest(&covariance.original),
                regularized_hash: matrix_digest(&covariance.regularized),
                diagnostics: covariance.diagnostics.clone(),
            })
    }

    fn scoring(&self) -> Result<ScoringContext<'_>, AuditError> {
        ScoringContext::new(&self.spectrum, &self.prepared.whitener, &self.engine)
    }

    /// Comb score of the observed data.
    pub fn observed(&self) -> Result<CombScore, AuditError> {
        self.scoring()?.observed()
    }

    /// Draws a synthetic spectrum on this context's grid and whitener.
    pub fn synthesize(&self, spec: &SyntheticSpec, seed: u64) -> Result<Spectrum, AuditError> {
        self.scoring()?.synthesize(spec, seed)
    }

    /// Observed score assessed against a fresh null of `strategy`.
    pub fn significance(
        &self,
        generator: &NullGenerator,
        strategy: &ScoringStrategy,
        base_seed: u64,
        draws: usize,
        correction: &Correction,
    ) -> Result<(CombScore, SignificanceReport), AuditError> {
        self.significance_of(&self.spectrum, generator, strategy, base_seed, draws, correction)
    }

    /// Same as [`AnalysisContext::significance`] for another spectrum on the
    /// same grid, reusing the cached whitener and comb design.
    pub fn significance_of(
        &self,
        spectrum: &Spectrum,
        generator: &NullGenerator,
        strategy: &ScoringStrategy,
        base_seed: u64,
        draws: usize,
        correction: &Correction,
    ) -> Result<(CombScore, SignificanceReport), AuditError> {
        let scoring = ScoringContext::new(spectrum, &self.prepared.whitener, &self.engine)?;
        let observed = scoring.observed()?;
        let null = generator.generate(&scoring, strategy, base_seed, draws)?;
        let report = assess(&observed, &null, self.whitening(), correction)?;
        Ok((observed, report))
    }
}
