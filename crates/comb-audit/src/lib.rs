#![deny(missing_docs)]
#![doc = "Pre-registered comb audit: configuration, ablation, calibration, pipeline runner and sealed audit records."]

pub mod ablation;
/// Per-context analysis state and seed derivation.
pub mod analysis;
pub mod calibration;
/// YAML run configuration and the locked pre-registration.
pub mod config;
pub mod pipeline;
pub mod report;

pub use ablation::{
    circular_distance, run_ablation, summarize, AblationReport, AblationResult, AblationSettings,
    ConsistencySummary, ConsistencyVerdict, RangeStatus,
};
pub use analysis::{context_seed, AnalysisContext, AnalysisSettings, CovarianceAudit, SeedContext};
pub use calibration::{calibrate, CalibrationReport, PeriodRate, CALIBRATION_SIGMA_BAND};
pub use config::{
    load_config, AblationRange, AuditConfig, CalibrationSpec, CovarianceInput, InputSpec,
    LookElsewhereSpec, NullSpec, PreRegistration, SyntheticNullSpec, WhiteningSpec, MIN_PERIOD,
};
pub use pipeline::{write_reports, AuditRunner, ChannelInputs};
pub use report::{
    load_sealed, AuditRecord, BaselineRecord, InputRecord, MarkdownSummary, SealedAudit,
    WhiteningRecord, AUDIT_SCHEMA,
};
