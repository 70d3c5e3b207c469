//! Audit record assembly, sealing and rendering.
//!
//! An [`AuditRecord`] is filled in stage by stage while a run progresses and
//! sealed once into a [`SealedAudit`]. The sealed form has no mutators; its
//! `record_hash` is the SHA-256 of the canonical JSON of the record.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use comb_core::errors::{AuditError, ErrorInfo};
use comb_core::{stable_hash_string, to_canonical_json_pretty, RunProvenance, SchemaVersion};
use comb_data::{Channel, FileCheck, UnitConvention};
use comb_stat::{CombScore, PeriodSignificance, ScoringStrategy, SignificanceReport, WhiteningMode};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ablation::{AblationReport, RangeStatus};
use crate::analysis::CovarianceAudit;
use crate::calibration::CalibrationReport;
use crate::config::PreRegistration;

/// Schema of serialized audit records.
pub const AUDIT_SCHEMA: SchemaVersion = SchemaVersion::new(1, 0, 0);

fn io_error(code: &str, path: &Path, err: impl ToString) -> AuditError {
    AuditError::Serde(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

/// One input file and the role it played.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    /// Role label (`observed`, `model`, `covariance`).
    pub role: String,
    /// Hash check outcome.
    pub check: FileCheck,
}

/// Whitening used for the full-range baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteningRecord {
    /// Rigor level.
    pub mode: WhiteningMode,
    /// Covariance digests and regularisation, in covariance mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covariance: Option<CovarianceAudit>,
}

/// Full-range analysis of the observed data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRecord {
    /// Strategy of the observed score.
    pub strategy: ScoringStrategy,
    /// Aligned samples.
    pub samples: usize,
    /// First multipole.
    pub ell_min: u32,
    /// Last multipole.
    pub ell_max: u32,
    /// Observed scores.
    pub observed: CombScore,
    /// Significance against the resampling null.
    pub resampled: SignificanceReport,
    /// Significance against the synthetic null, when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<SignificanceReport>,
}

/// Mutable record populated during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record schema.
    pub schema: SchemaVersion,
    /// Dataset label.
    pub dataset: String,
    /// Channel audited.
    pub channel: Channel,
    /// Hashes, seed and tool versions.
    pub provenance: RunProvenance,
    /// Pre-registration in force.
    pub preregistration: PreRegistration,
    /// Units used for analysis.
    pub analysis_units: UnitConvention,
    /// Input files.
    pub inputs: Vec<InputRecord>,
    /// Inputs were gated by a manifest (rather than only fingerprinted).
    pub manifest_verified: bool,
    /// Baseline whitening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitening: Option<WhiteningRecord>,
    /// Base seed of every context.
    pub seeds: BTreeMap<String, u64>,
    /// Baseline analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineRecord>,
    /// Range ablation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ablation: Option<AblationReport>,
    /// False-positive calibration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationReport>,
    /// Wall-clock time per stage in milliseconds.
    pub timings_ms: BTreeMap<String, f64>,
    /// Free-form operator notes (unverified inputs, regularisation events).
    pub notes: Vec<String>,
}

impl AuditRecord {
    /// Opens a record at run start.
    pub fn new(
        dataset: impl Into<String>,
        channel: Channel,
        provenance: RunProvenance,
        preregistration: PreRegistration,
        analysis_units: UnitConvention,
    ) -> Self {
        Self {
            schema: AUDIT_SCHEMA,
            dataset: dataset.into(),
            channel,
            provenance,
            preregistration,
            analysis_units,
            inputs: Vec::new(),
            manifest_verified: false,
            whitening: None,
            seeds: BTreeMap::new(),
            baseline: None,
            ablation: None,
            calibration: None,
            timings_ms: BTreeMap::new(),
            notes: Vec::new(),
        }
    }

    /// Records input checks and their hashes.
    pub fn record_inputs(&mut self, inputs: Vec<InputRecord>, manifest_verified: bool) {
        for input in &inputs {
            self.provenance
                .input_hashes
                .insert(input.role.clone(), input.check.actual_hash.clone());
        }
        self.inputs = inputs;
        self.manifest_verified = manifest_verified;
    }

    /// Records a context base seed.
    pub fn record_seed(&mut self, context: impl Into<String>, seed: u64) {
        self.seeds.insert(context.into(), seed);
    }

    /// Records the duration of a stage.
    pub fn record_timing(&mut self, stage: impl Into<String>, elapsed: Duration) {
        self.timings_ms
            .insert(stage.into(), elapsed.as_secs_f64() * 1_000.0);
    }

    /// Adds an operator note.
    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Seals the record. A record without a baseline cannot be sealed.
    pub fn seal(self) -> Result<SealedAudit, AuditError> {
        if self.baseline.is_none() || self.whitening.is_none() {
            return Err(AuditError::Config(
                ErrorInfo::new("audit_incomplete", "audit record has no baseline analysis")
                    .with_context("dataset", self.dataset.clone())
                    .with_context("channel", self.channel.label()),
            ));
        }
        let record_hash = stable_hash_string(&self)?;
        info!(
            dataset = %self.dataset,
            channel = %self.channel,
            record_hash = %record_hash,
            "audit record sealed"
        );
        Ok(SealedAudit {
            record: self,
            record_hash,
        })
    }
}

/// Read-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedAudit {
    record: AuditRecord,
    record_hash: String,
}

impl SealedAudit {
    /// Full record.
    pub fn record(&self) -> &AuditRecord {
        &self.record
    }

    /// SHA-256 of the canonical record.
    pub fn record_hash(&self) -> &str {
        &self.record_hash
    }

    /// Dataset label.
    pub fn dataset(&self) -> &str {
        &self.record.dataset
    }

    /// Channel audited.
    pub fn channel(&self) -> Channel {
        self.record.channel
    }

    /// Baseline analysis; always present once sealed.
    pub fn baseline(&self) -> Option<&BaselineRecord> {
        self.record.baseline.as_ref()
    }

    /// Range ablation.
    pub fn ablation(&self) -> Option<&AblationReport> {
        self.record.ablation.as_ref()
    }

    /// False-positive calibration.
    pub fn calibration(&self) -> Option<&CalibrationReport> {
        self.record.calibration.as_ref()
    }

    /// Recomputes the hash of a deserialized record.
    pub fn verify(&self) -> Result<(), AuditError> {
        let actual = stable_hash_string(&self.record)?;
        if actual != self.record_hash {
            return Err(AuditError::Provenance(
                ErrorInfo::new("audit_hash_mismatch", "sealed audit record was modified")
                    .with_context("expected", self.record_hash.clone())
                    .with_context("actual", actual),
            ));
        }
        Ok(())
    }

    /// Key-sorted, indented JSON.
    pub fn to_json(&self) -> Result<String, AuditError> {
        to_canonical_json_pretty(self)
    }

    /// Human-readable summary.
    pub fn summary(&self) -> MarkdownSummary<'_> {
        MarkdownSummary { audit: self }
    }

    /// Writes `audit_<channel>.json` and `audit_<channel>.md` under `out_dir`.
    pub fn write(&self, out_dir: &Path) -> Result<(PathBuf, PathBuf), AuditError> {
        fs::create_dir_all(out_dir).map_err(|err| io_error("report_out_dir", out_dir, err))?;
        let stem = format!("audit_{}", self.channel().label());
        let json_path = out_dir.join(format!("{stem}.json"));
        let md_path = out_dir.join(format!("{stem}.md"));
        fs::write(&json_path, self.to_json()?)
            .map_err(|err| io_error("report_write", &json_path, err))?;
        fs::write(&md_path, self.summary().to_string())
            .map_err(|err| io_error("report_write", &md_path, err))?;
        info!(json = %json_path.display(), markdown = %md_path.display(), "audit written");
        Ok((json_path, md_path))
    }
}

/// Loads a sealed record and checks its hash.
pub fn load_sealed(path: &Path) -> Result<SealedAudit, AuditError> {
    let bytes = fs::read(path).map_err(|err| io_error("report_read", path, err))?;
    let audit: SealedAudit = comb_core::from_json_slice(&bytes)?;
    audit.verify()?;
    Ok(audit)
}

fn format_p(p: f64, at_limit: bool, resolution: f64) -> String {
    if at_limit {
        format!("0 (< {resolution:.1e})")
    } else {
        format!("{p:.4}")
    }
}

fn correction_label(entry: &PeriodSignificance) -> String {
    format!(
        "bonferroni x{} ({} periods x {} axes)",
        entry.correction.tests, entry.correction.candidate_periods, entry.correction.extra_axes
    )
}

fn write_significance_table(
    f: &mut fmt::Formatter<'_>,
    report: &SignificanceReport,
) -> fmt::Result {
    writeln!(
        f,
        "| period | strength | phase | p_raw | p_corrected | whitening | correction |"
    )?;
    writeln!(f, "|---|---|---|---|---|---|---|")?;
    for (index, entry) in report.periods.iter().enumerate() {
        let marker = if index == report.best { " *" } else { "" };
        writeln!(
            f,
            "| {}{} | {:.3} | {:.3} | {} | {} | {} | {} |",
            entry.period,
            marker,
            entry.strength,
            entry.phase,
            format_p(entry.p_raw, entry.at_resolution_limit, entry.resolution),
            format_p(
                entry.p_corrected,
                entry.at_resolution_limit,
                entry.resolution * entry.correction.tests as f64
            ),
            entry.whitening.label(),
            correction_label(entry),
        )?;
    }
    writeln!(
        f,
        "\nNull: {} draws ({}), base seed {}. Max-statistic p_global = {:.4}.",
        report.draws,
        report.null_mechanism.label(),
        report.base_seed,
        report.p_global
    )
}

/// Markdown rendering of a sealed record.
#[derive(Debug, Clone, Copy)]
pub struct MarkdownSummary<'a> {
    audit: &'a SealedAudit,
}

impl Display for MarkdownSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.audit.record();
        let prereg = &record.preregistration;
        writeln!(f, "# Comb audit: {} / {}", record.dataset, record.channel)?;
        writeln!(f)?;
        writeln!(f, "- Record hash: `{}`", self.audit.record_hash())?;
        writeln!(
            f,
            "- Schema: {}.{}.{}",
            record.schema.major, record.schema.minor, record.schema.patch
        )?;
        writeln!(f, "- Created: {}", record.provenance.created_at)?;
        writeln!(f, "- Config hash: `{}`", record.provenance.config_hash)?;
        writeln!(
            f,
            "- Pre-registration: {} (locked by {} at {}), hash `{}`",
            prereg.version, prereg.locked_by, prereg.locked_at, record.provenance.preregistration_hash
        )?;
        writeln!(f, "- Master seed: {}", record.provenance.seed)?;
        writeln!(
            f,
            "- Inputs verified against manifest: {}",
            if record.manifest_verified { "yes" } else { "no" }
        )?;

        writeln!(f, "\n## Inputs\n")?;
        writeln!(f, "| role | path | bytes | sha256 |")?;
        writeln!(f, "|---|---|---|---|")?;
        for input in &record.inputs {
            writeln!(
                f,
                "| {} | {} | {} | `{}` |",
                input.role, input.check.path, input.check.size, input.check.actual_hash
            )?;
        }

        if let Some(whitening) = &record.whitening {
            writeln!(f, "\n## Whitening\n")?;
            writeln!(f, "- Mode: `{}`", whitening.mode.label())?;
            if let Some(covariance) = &whitening.covariance {
                let diag = &covariance.diagnostics;
                let before = diag
                    .condition_before
                    .map(|cond| format!("{cond:.3e}"))
                    .unwrap_or_else(|| "not positive definite".to_string());
                writeln!(f, "- Condition number before: {before}")?;
                writeln!(f, "- Condition number after: {:.3e}", diag.condition_after)?;
                writeln!(f, "- Ridge lambda: {:.3e}", diag.lambda)?;
                writeln!(f, "- Max asymmetry: {:.3e}", diag.max_asymmetry)?;
            }
        }

        if let Some(baseline) = &record.baseline {
            writeln!(
                f,
                "\n## Baseline (ell {}-{}, {} samples)\n",
                baseline.ell_min, baseline.ell_max, baseline.samples
            )?;
            write_significance_table(f, &baseline.resampled)?;
            if let Some(synthetic) = &baseline.synthetic {
                writeln!(f, "\n### Synthetic null\n")?;
                write_significance_table(f, synthetic)?;
            }
        }

        if let Some(ablation) = &record.ablation {
            let summary = &ablation.consistency;
            writeln!(f, "\n## Ablation\n")?;
            writeln!(
                f,
                "**Consistency: {:?}** (same best period: {}, max phase separation {:.3} rad, tolerance {:.3} rad, {} executed, {} skipped)\n",
                summary.verdict,
                summary.same_best_period,
                summary.max_phase_separation,
                summary.phase_tolerance,
                summary.executed,
                summary.skipped
            )?;
            writeln!(
                f,
                "| range | ell | samples | status | best period | phase | p_raw | p_corrected | whitening |"
            )?;
            writeln!(f, "|---|---|---|---|---|---|---|---|---|")?;
            for range in &ablation.ranges {
                match (&range.status, &range.significance) {
                    (RangeStatus::Executed, Some(report)) => {
                        let best = report.best_period();
                        writeln!(
                            f,
                            "| {} | {}-{} | {} | executed | {} | {:.3} | {} | {:.4} | {} |",
                            range.name,
                            range.ell_min,
                            range.ell_max,
                            range.samples,
                            best.period,
                            best.phase,
                            format_p(best.p_raw, best.at_resolution_limit, best.resolution),
                            best.p_corrected,
                            best.whitening.label()
                        )?;
                    }
                    _ => {
                        writeln!(
                            f,
                            "| {} | {}-{} | {} | skipped | - | - | - | - | - |",
                            range.name, range.ell_min, range.ell_max, range.samples
                        )?;
                    }
                }
            }
        }

        if let Some(calibration) = &record.calibration {
            writeln!(f, "\n## False-positive calibration\n")?;
            writeln!(
                f,
                "{} trials x {} draws, alpha {}, exact null rate {:.4}, standard error {:.4}. Calibrated: {}.\n",
                calibration.trials,
                calibration.draws,
                calibration.alpha,
                calibration.exact_null_rate,
                calibration.standard_error,
                if calibration.calibrated { "yes" } else { "no" }
            )?;
            writeln!(f, "| period | hits | rate | deviation (sigma) |")?;
            writeln!(f, "|---|---|---|---|")?;
            for entry in &calibration.per_period {
                writeln!(
                    f,
                    "| {} | {} | {:.4} | {:.2} |",
                    entry.period, entry.hits, entry.rate, entry.deviation_sigma
                )?;
            }
            writeln!(
                f,
                "| any | {} | {:.4} | - |",
                calibration.any_period_hits, calibration.any_period_rate
            )?;
        }

        if !record.seeds.is_empty() {
            writeln!(f, "\n## Seeds\n")?;
            for (context, seed) in &record.seeds {
                writeln!(f, "- {context}: {seed}")?;
            }
        }
        if !record.timings_ms.is_empty() {
            writeln!(f, "\n## Timings\n")?;
            for (stage, ms) in &record.timings_ms {
                writeln!(f, "- {stage}: {ms:.1} ms")?;
            }
        }
        if !record.notes.is_empty() {
            writeln!(f, "\n## Notes\n")?;
            for note in &record.notes {
                writeln!(f, "- {note}")?;
            }
        }
        Ok(())
    }
}
