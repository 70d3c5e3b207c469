//! Top-level runner: provenance gate, loading, analysis and sealing for each channel.
//!
//! Component errors propagate unchanged in family; the runner only attaches
//! the stage, dataset and channel before handing them to the caller.

use std::path::{Path, PathBuf};
use std::time::Instant;

use comb_core::errors::AuditError;
use comb_core::RunProvenance;
use comb_data::{
    align_to_ell, convert_units, fingerprint, load, load_covariance, load_manifest, Channel,
    Manifest, Spectrum,
};
use comb_stat::{Correction, NullGenerator, ScoringStrategy, WhiteningMode};
use nalgebra::DMatrix;
use tracing::{info, warn};

use crate::ablation::{run_ablation, AblationSettings};
use crate::analysis::{context_seed, AnalysisContext, AnalysisSettings, SeedContext};
use crate::calibration::calibrate;
use crate::config::AuditConfig;
use crate::report::{AuditRecord, BaselineRecord, InputRecord, SealedAudit, WhiteningRecord};

/// Spectrum and covariance of one channel, loaded after the provenance gate.
#[derive(Debug, Clone)]
pub struct ChannelInputs {
    /// Aligned spectrum in analysis units.
    pub spectrum: Spectrum,
    /// Covariance aligned to the spectrum grid, in analysis units.
    pub covariance: Option<DMatrix<f64>>,
    /// Hash checks of every file read.
    pub inputs: Vec<InputRecord>,
    /// Whether the checks came from a manifest.
    pub manifest_verified: bool,
}

/// Runs the configured audit over every selected channel.
#[derive(Debug)]
pub struct AuditRunner {
    config: AuditConfig,
    config_hash: String,
    prereg_hash: String,
    generator: NullGenerator,
}

impl AuditRunner {
    /// Validates the configuration and builds the worker pool.
    pub fn new(config: AuditConfig) -> Result<Self, AuditError> {
        let prereg_hash = config.validate().map_err(|err| err.stage("config"))?;
        let config_hash = config.config_hash()?;
        let generator = NullGenerator::new(config.threads).map_err(|err| err.stage("config"))?;
        info!(
            dataset = %config.dataset,
            threads = generator.threads(),
            config_hash = %config_hash,
            "audit runner ready"
        );
        Ok(Self {
            config,
            config_hash,
            prereg_hash,
            generator,
        })
    }

    /// Configuration in force.
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Worker pool shared by every null in the run.
    pub fn generator(&self) -> &NullGenerator {
        &self.generator
    }

    /// Hash of the locked pre-registration.
    pub fn preregistration_hash(&self) -> &str {
        &self.prereg_hash
    }

    /// Pre-registered analysis choices.
    pub fn settings(&self) -> Result<AnalysisSettings, AuditError> {
        let prereg = &self.config.preregistration;
        Ok(AnalysisSettings {
            periods: prereg.periods.clone(),
            kernel: prereg.kernel,
            max_condition: self.config.whitening.max_condition,
            correction: Correction::bonferroni(
                prereg.periods.len(),
                self.config.look_elsewhere.extra_axes,
            )?,
        })
    }

    fn tag(&self, err: AuditError, stage: &str, channel: Channel) -> AuditError {
        err.stage(stage)
            .with_context("dataset", self.config.dataset.clone())
            .with_context("channel", channel.label())
    }

    /// Hashes every input file of `channel`; with a manifest, any mismatch aborts.
    pub fn gate_inputs(&self, channel: Channel) -> Result<(Vec<InputRecord>, bool), AuditError> {
        let mut files: Vec<(&str, PathBuf)> = vec![
            ("observed", self.config.observed_source().path),
            ("model", self.config.model_source().path),
        ];
        if let Some(covariance) = self.config.covariance_for(channel) {
            files.push(("covariance", covariance.path));
        }

        let manifest: Option<Manifest> = match self.config.manifest_path() {
            Some(path) => Some(load_manifest(&path)?),
            None => None,
        };
        let mut records = Vec::with_capacity(files.len());
        for (role, path) in files {
            let check = match &manifest {
                Some(manifest) => manifest.verify_input(&path)?,
                None => fingerprint(&path)?,
            };
            records.push(InputRecord {
                role: role.to_string(),
                check,
            });
        }
        if manifest.is_none() {
            warn!(
                dataset = %self.config.dataset,
                channel = %channel,
                "no manifest configured; inputs fingerprinted but not verified"
            );
        }
        Ok((records, manifest.is_some()))
    }

    /// Gates, loads and aligns one channel's inputs.
    pub fn load_channel(&self, channel: Channel) -> Result<ChannelInputs, AuditError> {
        let (inputs, manifest_verified) = self
            .gate_inputs(channel)
            .map_err(|err| self.tag(err, "provenance", channel))?;

        let units = self.config.analysis_units;
        let spectrum = load(
            &self.config.observed_source(),
            &self.config.model_source(),
            channel,
            units,
            self.config.preregistration.min_points,
        )
        .map_err(|err| self.tag(err, "load", channel))?;

        let covariance = match self.config.covariance_for(channel) {
            Some(input) => {
                let raw = load_covariance(&input.path)
                    .map_err(|err| self.tag(err, "load", channel))?;
                let aligned = align_to_ell(&raw.matrix, raw.ell.as_deref(), spectrum.ell())
                    .map_err(|err| self.tag(err, "load", channel))?;
                let converted = convert_units(&aligned, spectrum.ell(), input.units, units)
                    .map_err(|err| self.tag(err, "load", channel))?;
                Some(converted)
            }
            None => None,
        };
        info!(
            channel = %channel,
            samples = spectrum.len(),
            covariance = covariance.is_some(),
            "channel inputs loaded"
        );
        Ok(ChannelInputs {
            spectrum,
            covariance,
            inputs,
            manifest_verified,
        })
    }

    fn provenance(&self) -> RunProvenance {
        let mut provenance = RunProvenance {
            config_hash: self.config_hash.clone(),
            preregistration_hash: self.prereg_hash.clone(),
            seed: self.config.seed,
            created_at: chrono::Utc::now().to_rfc3339(),
            ..RunProvenance::default()
        };
        provenance.tool_versions.insert(
            env!("CARGO_PKG_NAME").to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        provenance
    }

    /// Runs every stage on already-loaded inputs and seals the record.
    pub fn analyze(&self, inputs: ChannelInputs) -> Result<SealedAudit, AuditError> {
        let ChannelInputs {
            spectrum,
            covariance,
            inputs,
            manifest_verified,
        } = inputs;
        let channel = spectrum.channel();
        let prereg = &self.config.preregistration;
        let master_seed = self.config.seed;
        let mut record = AuditRecord::new(
            self.config.dataset.clone(),
            channel,
            self.provenance(),
            prereg.clone(),
            self.config.analysis_units,
        );
        record.record_inputs(inputs, manifest_verified);
        if !manifest_verified {
            record.note("inputs were fingerprinted without a manifest and are unverified");
        }
        let settings = self
            .settings()
            .map_err(|err| self.tag(err, "config", channel))?;

        let started = Instant::now();
        let context = AnalysisContext::prepare(spectrum.clone(), covariance.as_ref(), &settings)
            .map_err(|err| self.tag(err, "whitening", channel))?;
        record.record_timing("whitening", started.elapsed());
        let mode = context.whitening();
        let covariance_audit = context.covariance_audit();
        if let Some(audit) = &covariance_audit {
            if audit.diagnostics.regularized {
                record.note(format!(
                    "covariance regularised: lambda = {:.3e}, condition number after = {:.3e}",
                    audit.diagnostics.lambda, audit.diagnostics.condition_after
                ));
            }
        }
        if mode != WhiteningMode::Cov {
            record.note(format!(
                "no covariance supplied; residuals whitened in `{}` mode",
                mode.label()
            ));
        }
        record.whitening = Some(WhiteningRecord {
            mode,
            covariance: covariance_audit,
        });

        let resampled_strategy = ScoringStrategy::Resampled {
            method: self.config.null.method,
        };
        let baseline_seed = context_seed(master_seed, channel, SeedContext::Baseline);
        record.record_seed("baseline", baseline_seed);
        let started = Instant::now();
        let (observed, resampled) = context
            .significance(
                &self.generator,
                &resampled_strategy,
                baseline_seed,
                self.config.null.draws,
                &settings.correction,
            )
            .map_err(|err| self.tag(err, "baseline", channel))?;
        record.record_timing("baseline", started.elapsed());
        let best = resampled.best_period();
        info!(
            channel = %channel,
            best_period = best.period,
            p_raw = best.p_raw,
            p_corrected = best.p_corrected,
            p_global = resampled.p_global,
            whitening = mode.label(),
            "baseline significance"
        );

        let synthetic = match &self.config.null.synthetic {
            Some(null) => {
                let seed = context_seed(master_seed, channel, SeedContext::Synthetic);
                record.record_seed("synthetic", seed);
                let started = Instant::now();
                let (_, report) = context
                    .significance(
                        &self.generator,
                        &ScoringStrategy::Synthetic(null.spec),
                        seed,
                        null.draws,
                        &settings.correction,
                    )
                    .map_err(|err| self.tag(err, "synthetic-null", channel))?;
                record.record_timing("synthetic-null", started.elapsed());
                Some(report)
            }
            None => None,
        };
        record.baseline = Some(BaselineRecord {
            strategy: ScoringStrategy::RealModel,
            samples: spectrum.len(),
            ell_min: spectrum.ell().first().copied().unwrap_or_default(),
            ell_max: spectrum.ell().last().copied().unwrap_or_default(),
            observed,
            resampled,
            synthetic,
        });

        if !prereg.ranges.is_empty() {
            let ablation_settings = AblationSettings {
                analysis: &settings,
                strategy: resampled_strategy,
                draws: self.config.null.ablation_draws(),
                master_seed,
                channel,
                min_points: prereg.min_points,
                phase_tolerance: prereg.phase_tolerance,
            };
            let started = Instant::now();
            let ablation = run_ablation(
                &spectrum,
                covariance.as_ref(),
                &prereg.ranges,
                &ablation_settings,
                &self.generator,
            )
            .map_err(|err| self.tag(err, "ablation", channel))?;
            record.record_timing("ablation", started.elapsed());
            for range in &ablation.ranges {
                if let Some(seed) = range.base_seed {
                    record.record_seed(format!("ablation:{}", range.name), seed);
                }
            }
            record.ablation = Some(ablation);
        }

        if let Some(spec) = &self.config.calibration {
            let seed = context_seed(master_seed, channel, SeedContext::Calibration);
            record.record_seed("calibration", seed);
            let started = Instant::now();
            let report = calibrate(
                &context,
                &settings,
                spec,
                self.config.null.method,
                seed,
                &self.generator,
            )
            .map_err(|err| self.tag(err, "calibration", channel))?;
            record.record_timing("calibration", started.elapsed());
            if !report.calibrated {
                record.note("false-positive rate outside the binomial band; p-values are suspect");
            }
            record.calibration = Some(report);
        }

        record
            .seal()
            .map_err(|err| self.tag(err, "report", channel))
    }

    /// Audits every configured channel in order.
    pub fn run(&self) -> Result<Vec<SealedAudit>, AuditError> {
        let mut audits = Vec::with_capacity(self.config.channels.len());
        for &channel in &self.config.channels {
            let inputs = self.load_channel(channel)?;
            audits.push(self.analyze(inputs)?);
        }
        Ok(audits)
    }
}

/// Writes the JSON record and markdown summary of every audit.
pub fn write_reports(audits: &[SealedAudit], out_dir: &Path) -> Result<Vec<PathBuf>, AuditError> {
    let mut written = Vec::with_capacity(audits.len() * 2);
    for audit in audits {
        let (json, markdown) = audit
            .write(out_dir)
            .map_err(|err| err.stage("report").with_context("channel", audit.channel().label()))?;
        written.push(json);
        written.push(markdown);
    }
    Ok(written)
}
