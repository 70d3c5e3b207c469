use std::path::PathBuf;

use clap::Args;
use comb_audit::{load_config, write_reports, AuditRunner};
use comb_core::AuditError;
use tracing::info;

use super::parse_channel;

#[derive(Args, Debug)]
pub struct AuditArgs {
    /// YAML run configuration.
    #[arg(long)]
    pub config: PathBuf,
    /// Output directory for audit records and summaries.
    #[arg(long)]
    pub out: PathBuf,
    /// Restrict the run to these channels instead of the configured set.
    #[arg(long = "channel", value_name = "CHANNEL")]
    pub channels: Vec<String>,
    /// Override the worker thread count (0 = machine default).
    #[arg(long)]
    pub threads: Option<usize>,
}

pub fn run(args: &AuditArgs) -> Result<(), AuditError> {
    let mut config = load_config(&args.config)?;
    if !args.channels.is_empty() {
        config.channels = args
            .channels
            .iter()
            .map(|label| parse_channel(label))
            .collect::<Result<_, _>>()?;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    let runner = AuditRunner::new(config)?;
    let audits = runner.run()?;
    let written = write_reports(&audits, &args.out)?;

    for audit in &audits {
        let Some(baseline) = audit.baseline() else {
            continue;
        };
        let best = baseline.resampled.best_period();
        let verdict = audit
            .ablation()
            .map(|ablation| format!("{:?}", ablation.consistency.verdict).to_lowercase())
            .unwrap_or_else(|| "not run".to_string());
        println!(
            "{} {}: best period {} (p_raw {:.4}, p_corrected {:.4}, whitening {}), p_global {:.4}, ablation {}",
            audit.dataset(),
            audit.channel(),
            best.period,
            best.p_raw,
            best.p_corrected,
            best.whitening.label(),
            baseline.resampled.p_global,
            verdict
        );
        println!("  record hash {}", audit.record_hash());
    }
    for path in &written {
        println!("wrote {}", path.display());
    }
    info!(records = audits.len(), out = %args.out.display(), "audit complete");
    Ok(())
}
