use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use comb_core::errors::{AuditError, ErrorInfo};
use comb_core::stable_hash_string;
use comb_data::{Channel, SpectrumSource, UnitConvention, DEFAULT_MIN_POINTS};
use comb_stat::{CombKernel, ResampleMethod, SyntheticSpec, DEFAULT_MAX_CONDITION};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Smallest period a harmonic fit can assign a phase to.
pub const MIN_PERIOD: u32 = 3;

fn config_error(code: &str, message: impl Into<String>) -> AuditError {
    AuditError::Config(ErrorInfo::new(code, message))
}

/// Named multipole interval declared before any data are examined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AblationRange {
    /// Unique range label.
    pub name: String,
    /// Inclusive lower multipole.
    pub ell_min: u32,
    /// Inclusive upper multipole.
    pub ell_max: u32,
}

/// Versioned, locked pre-registration of every analysis choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreRegistration {
    /// Version label; any change of content requires a new version.
    pub version: String,
    /// Candidate periods in multipoles, in declared order.
    pub periods: Vec<u32>,
    /// Ablation ranges in declared order.
    #[serde(default)]
    pub ranges: Vec<AblationRange>,
    /// Pairwise phase agreement tolerance in radians.
    #[serde(default = "PreRegistration::default_phase_tolerance")]
    pub phase_tolerance: f64,
    /// Minimum samples for a spectrum or ablation range to be analysed.
    #[serde(default = "PreRegistration::default_min_points")]
    pub min_points: usize,
    /// Comb kernel used for every score.
    #[serde(default)]
    pub kernel: CombKernel,
    /// Who locked the record.
    pub locked_by: String,
    /// When the record was locked (RFC-3339).
    pub locked_at: String,
    /// SHA-256 of the canonical record without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_hash: Option<String>,
}

impl PreRegistration {
    fn default_phase_tolerance() -> f64 {
        PI / 2.0
    }

    fn default_min_points() -> usize {
        DEFAULT_MIN_POINTS
    }

    /// Hash of the canonical record with `lock_hash` cleared.
    pub fn payload_hash(&self) -> Result<String, AuditError> {
        let mut payload = self.clone();
        payload.lock_hash = None;
        stable_hash_string(&payload)
    }

    /// Returns the record with `lock_hash` filled in.
    pub fn locked(mut self) -> Result<Self, AuditError> {
        self.validate()?;
        self.lock_hash = Some(self.payload_hash()?);
        Ok(self)
    }

    /// Checks internal consistency of the declared choices.
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.version.trim().is_empty() {
            return Err(config_error(
                "prereg_version",
                "pre-registration version is empty",
            ));
        }
        if self.locked_by.trim().is_empty() || self.locked_at.trim().is_empty() {
            return Err(config_error(
                "prereg_unlocked",
                "pre-registration must record who locked it and when",
            ));
        }
        if chrono::DateTime::parse_from_rfc3339(&self.locked_at).is_err() {
            return Err(AuditError::Config(
                ErrorInfo::new("prereg_locked_at", "locked_at is not an RFC-3339 timestamp")
                    .with_context("locked_at", self.locked_at.clone()),
            ));
        }
        if self.periods.is_empty() {
            return Err(config_error("prereg_periods", "candidate period set is empty"));
        }
        let mut seen = BTreeSet::new();
        for &period in &self.periods {
            if period < MIN_PERIOD {
                return Err(AuditError::Config(
                    ErrorInfo::new("prereg_period", "candidate period is too short to carry a phase")
                        .with_context("period", period.to_string())
                        .with_context("minimum", MIN_PERIOD.to_string()),
                ));
            }
            if !seen.insert(period) {
                return Err(AuditError::Config(
                    ErrorInfo::new("prereg_period_duplicate", "candidate period listed twice")
                        .with_context("period", period.to_string()),
                ));
            }
        }
        let mut names = BTreeSet::new();
        for range in &self.ranges {
            if range.ell_min > range.ell_max {
                return Err(AuditError::Config(
                    ErrorInfo::new("prereg_range", "ablation range has ell_min > ell_max")
                        .with_context("range", range.name.clone()),
                ));
            }
            if !names.insert(range.name.as_str()) {
                return Err(AuditError::Config(
                    ErrorInfo::new("prereg_range_duplicate", "ablation range name listed twice")
                        .with_context("range", range.name.clone()),
                ));
            }
        }
        if !(self.phase_tolerance > 0.0 && self.phase_tolerance <= PI) {
            return Err(AuditError::Config(
                ErrorInfo::new("prereg_phase_tolerance", "phase tolerance must lie in (0, π]")
                    .with_context("phase_tolerance", self.phase_tolerance.to_string()),
            ));
        }
        if self.min_points < comb_stat::MIN_SCORED_SAMPLES {
            return Err(AuditError::Config(
                ErrorInfo::new("prereg_min_points", "min_points is below what the comb fit needs")
                    .with_context("min_points", self.min_points.to_string()),
            ));
        }
        Ok(())
    }

    /// Validates the record and, when a lock hash is present, checks it.
    ///
    /// Returns the hash that identifies the record in audit output.
    pub fn verify(&self) -> Result<String, AuditError> {
        self.validate()?;
        let actual = self.payload_hash()?;
        if let Some(expected) = &self.lock_hash {
            if !expected.eq_ignore_ascii_case(&actual) {
                error!(
                    version = %self.version,
                    expected = %expected,
                    actual = %actual,
                    "pre-registration lock hash mismatch"
                );
                return Err(AuditError::Config(
                    ErrorInfo::new(
                        "prereg_tampered",
                        "pre-registration content does not match its lock hash",
                    )
                    .with_context("version", self.version.clone())
                    .with_context("expected", expected.clone())
                    .with_context("actual", actual)
                    .with_hint("changes require a new, explicitly versioned pre-registration"),
                ));
            }
        }
        Ok(actual)
    }
}

/// Optional covariance for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovarianceInput {
    /// Channel the matrix belongs to.
    pub channel: Channel,
    /// Matrix file.
    pub path: PathBuf,
    /// Units the matrix is expressed in.
    #[serde(default)]
    pub units: UnitConvention,
}

/// Input file declarations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Observed spectrum file.
    pub observed: SpectrumSource,
    /// Theory model spectrum file.
    pub model: SpectrumSource,
    /// Per-channel covariance matrices.
    #[serde(default)]
    pub covariance: Vec<CovarianceInput>,
    /// Manifest gating every input file; without it inputs are fingerprinted only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
}

/// Synthetic null settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticNullSpec {
    /// Synthetic draws.
    #[serde(default = "SyntheticNullSpec::default_draws")]
    pub draws: usize,
    /// Template and optional injection.
    #[serde(default)]
    pub spec: SyntheticSpec,
}

impl SyntheticNullSpec {
    fn default_draws() -> usize {
        1_000
    }
}

/// Null-distribution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullSpec {
    /// Resampling draws for the baseline.
    #[serde(default = "NullSpec::default_draws")]
    pub draws: usize,
    /// Resampling draws per ablation range; defaults to `draws`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ablation_draws: Option<usize>,
    /// Resampling scheme.
    #[serde(default = "NullSpec::default_method")]
    pub method: ResampleMethod,
    /// Optional second, fully synthetic null for the baseline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<SyntheticNullSpec>,
}

impl NullSpec {
    fn default_draws() -> usize {
        10_000
    }

    fn default_method() -> ResampleMethod {
        ResampleMethod::Permute
    }

    /// Draws used for each ablation range.
    pub fn ablation_draws(&self) -> usize {
        self.ablation_draws.unwrap_or(self.draws)
    }
}

impl Default for NullSpec {
    fn default() -> Self {
        Self {
            draws: Self::default_draws(),
            ablation_draws: None,
            method: Self::default_method(),
            synthetic: None,
        }
    }
}

/// Whitening settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WhiteningSpec {
    /// Condition-number bound enforced by ridge regularisation.
    #[serde(default = "WhiteningSpec::default_max_condition")]
    pub max_condition: f64,
}

impl WhiteningSpec {
    fn default_max_condition() -> f64 {
        DEFAULT_MAX_CONDITION
    }
}

impl Default for WhiteningSpec {
    fn default() -> Self {
        Self {
            max_condition: DEFAULT_MAX_CONDITION,
        }
    }
}

/// Look-elsewhere multiplicity beyond the candidate periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookElsewhereSpec {
    /// Number of independent extra scan axes (channels, ranges, datasets) to correct for.
    #[serde(default = "LookElsewhereSpec::default_extra_axes")]
    pub extra_axes: usize,
}

impl LookElsewhereSpec {
    fn default_extra_axes() -> usize {
        1
    }
}

impl Default for LookElsewhereSpec {
    fn default() -> Self {
        Self { extra_axes: 1 }
    }
}

/// False-positive calibration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSpec {
    /// Zero-signal synthetic datasets.
    #[serde(default = "CalibrationSpec::default_trials")]
    pub trials: usize,
    /// Resampling draws per trial.
    #[serde(default = "CalibrationSpec::default_draws")]
    pub draws: usize,
    /// Nominal significance level.
    #[serde(default = "CalibrationSpec::default_alpha")]
    pub alpha: f64,
    /// Template the trial spectra are drawn around.
    #[serde(default)]
    pub spec: SyntheticSpec,
}

impl CalibrationSpec {
    fn default_trials() -> usize {
        200
    }

    fn default_draws() -> usize {
        199
    }

    fn default_alpha() -> f64 {
        0.01
    }
}

impl Default for CalibrationSpec {
    fn default() -> Self {
        Self {
            trials: Self::default_trials(),
            draws: Self::default_draws(),
            alpha: Self::default_alpha(),
            spec: SyntheticSpec::default(),
        }
    }
}

/// Full run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Dataset label carried into every record.
    pub dataset: String,
    /// Channels to audit; one record each.
    #[serde(default = "AuditConfig::default_channels")]
    pub channels: Vec<Channel>,
    /// Input files.
    pub inputs: InputSpec,
    /// Units every spectrum is normalised to before analysis.
    #[serde(default)]
    pub analysis_units: UnitConvention,
    /// Locked pre-registration.
    pub preregistration: PreRegistration,
    /// Master seed.
    pub seed: u64,
    /// Null settings.
    #[serde(default)]
    pub null: NullSpec,
    /// Whitening settings.
    #[serde(default)]
    pub whitening: WhiteningSpec,
    /// Look-elsewhere settings.
    #[serde(default)]
    pub look_elsewhere: LookElsewhereSpec,
    /// Optional false-positive calibration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationSpec>,
    /// Worker threads for null draws; `0` picks the machine default.
    #[serde(default)]
    pub threads: usize,
    /// Directory containing the configuration on disk (ignored when serializing).
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl AuditConfig {
    fn default_channels() -> Vec<Channel> {
        vec![Channel::TT]
    }

    /// Deterministic hash of the configuration contents.
    pub fn config_hash(&self) -> Result<String, AuditError> {
        stable_hash_string(self)
    }

    /// Resolves a configured path against the configuration directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Observed source with its path resolved.
    pub fn observed_source(&self) -> SpectrumSource {
        SpectrumSource {
            path: self.resolve(&self.inputs.observed.path),
            units: self.inputs.observed.units,
        }
    }

    /// Model source with its path resolved.
    pub fn model_source(&self) -> SpectrumSource {
        SpectrumSource {
            path: self.resolve(&self.inputs.model.path),
            units: self.inputs.model.units,
        }
    }

    /// Covariance declared for `channel`, path resolved.
    pub fn covariance_for(&self, channel: Channel) -> Option<CovarianceInput> {
        self.inputs
            .covariance
            .iter()
            .find(|input| input.channel == channel)
            .map(|input| CovarianceInput {
                channel,
                path: self.resolve(&input.path),
                units: input.units,
            })
    }

    /// Manifest path, resolved.
    pub fn manifest_path(&self) -> Option<PathBuf> {
        self.inputs.manifest.as_deref().map(|path| self.resolve(path))
    }

    /// Checks every option and the pre-registration lock.
    ///
    /// Returns the pre-registration hash.
    pub fn validate(&self) -> Result<String, AuditError> {
        if self.dataset.trim().is_empty() {
            return Err(config_error("config_dataset", "dataset label is empty"));
        }
        if self.channels.is_empty() {
            return Err(config_error("config_channels", "no channel selected"));
        }
        let unique: BTreeSet<_> = self.channels.iter().collect();
        if unique.len() != self.channels.len() {
            return Err(config_error("config_channels", "channel listed twice"));
        }
        if self.null.draws == 0 || self.null.ablation_draws() == 0 {
            return Err(config_error(
                "config_null_draws",
                "null draw counts must be positive",
            ));
        }
        if self.null.synthetic.as_ref().is_some_and(|s| s.draws == 0) {
            return Err(config_error(
                "config_null_draws",
                "synthetic draw count must be positive",
            ));
        }
        if !(self.whitening.max_condition.is_finite() && self.whitening.max_condition > 1.0) {
            return Err(config_error(
                "config_max_condition",
                "max_condition must be finite and > 1",
            ));
        }
        if self.look_elsewhere.extra_axes == 0 {
            return Err(config_error("config_extra_axes", "extra_axes must be at least 1"));
        }
        if let Some(calibration) = &self.calibration {
            if calibration.trials == 0 || calibration.draws == 0 {
                return Err(config_error(
                    "config_calibration",
                    "calibration trials and draws must be positive",
                ));
            }
            if !(calibration.alpha > 0.0 && calibration.alpha < 1.0) {
                return Err(config_error("config_calibration", "alpha must lie in (0, 1)"));
            }
        }
        self.preregistration.verify()
    }
}

/// Loads a configuration from YAML on disk and validates it.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AuditConfig, AuditError> {
    let config_path = path.as_ref();
    let bytes = fs::read(config_path).map_err(|err| {
        AuditError::Config(
            ErrorInfo::new("config_read", err.to_string())
                .with_context("path", config_path.display().to_string()),
        )
    })?;
    let mut config: AuditConfig = serde_yaml::from_slice(&bytes).map_err(|err| {
        AuditError::Config(
            ErrorInfo::new("config_parse", err.to_string())
                .with_context("path", config_path.display().to_string()),
        )
    })?;
    config.base_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let prereg_hash = config.validate()?;
    info!(
        dataset = %config.dataset,
        prereg = %config.preregistration.version,
        prereg_hash = %prereg_hash,
        "configuration loaded"
    );
    Ok(config)
}
