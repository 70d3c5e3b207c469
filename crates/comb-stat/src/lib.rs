#![deny(missing_docs)]
#![doc = "Statistical core of the comb audit: whitening, comb kernels, null distributions and significance."]

/// Comb kernels and the per-period engine.
pub mod comb;
/// Null-distribution strategies and the parallel generator.
pub mod null;
pub mod significance;
pub mod whiten;

pub use comb::{
    score, CombEngine, CombKernel, CombScore, PeriodScore, DEFAULT_FOLD_BINS, MIN_SCORED_SAMPLES,
};
pub use null::{
    NullDistribution, NullGenerator, ResampleMethod, ScoringContext, ScoringStrategy,
    SignalInjection, SyntheticSpec, TemplateModel,
};
pub use significance::{
    assess, bonferroni, pvalue, Correction, CorrectionMethod, NullQuantiles, PeriodSignificance,
    SignificanceReport,
};
pub use whiten::{
    cholesky_whitener, condition_number, matrix_digest, prepare, regularize,
    validate_and_regularize, whiten, PreparedWhitener, RegularizationDiagnostics,
    RegularizedCovariance, Whitener, WhiteningMode, DEFAULT_MAX_CONDITION,
};
