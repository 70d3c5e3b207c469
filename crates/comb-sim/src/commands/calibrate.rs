use std::path::PathBuf;

use clap::Args;
use comb_audit::{calibrate, context_seed, load_config, AnalysisContext, AuditRunner, SeedContext};
use comb_core::{to_canonical_json_pretty, AuditError};

use super::{parse_channel, write_text};

#[derive(Args, Debug)]
pub struct CalibrateArgs {
    /// YAML run configuration.
    #[arg(long)]
    pub config: PathBuf,
    /// Channel to calibrate; defaults to the first configured channel.
    #[arg(long)]
    pub channel: Option<String>,
    /// Override the number of synthetic trials.
    #[arg(long)]
    pub trials: Option<usize>,
    /// Override the null draws per trial.
    #[arg(long)]
    pub draws: Option<usize>,
    /// Override the nominal significance level.
    #[arg(long)]
    pub alpha: Option<f64>,
    /// Optional JSON output for the calibration report.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub fn run(args: &CalibrateArgs) -> Result<(), AuditError> {
    let mut config = load_config(&args.config)?;
    let mut spec = config.calibration.clone().unwrap_or_default();
    if let Some(trials) = args.trials {
        spec.trials = trials;
    }
    if let Some(draws) = args.draws {
        spec.draws = draws;
    }
    if let Some(alpha) = args.alpha {
        spec.alpha = alpha;
    }
    config.calibration = Some(spec.clone());
    let channel = match &args.channel {
        Some(label) => parse_channel(label)?,
        None => config
            .channels
            .first()
            .copied()
            .ok_or_else(|| AuditError::config("config_channels", "no channel selected"))?,
    };

    let runner = AuditRunner::new(config)?;
    let inputs = runner.load_channel(channel)?;
    let settings = runner.settings()?;
    let context = AnalysisContext::prepare(inputs.spectrum, inputs.covariance.as_ref(), &settings)
        .map_err(|err| err.stage("whitening"))?;
    let seed = context_seed(runner.config().seed, channel, SeedContext::Calibration);
    let report = calibrate(
        &context,
        &settings,
        &spec,
        runner.config().null.method,
        seed,
        runner.generator(),
    )
    .map_err(|err| err.stage("calibration"))?;

    println!(
        "{} trials x {} draws at alpha {} (exact null rate {:.4}, standard error {:.4})",
        report.trials, report.draws, report.alpha, report.exact_null_rate, report.standard_error
    );
    for entry in &report.per_period {
        println!(
            "  period {:>5}: rate {:.4} ({} hits, {:.2} sigma){}",
            entry.period,
            entry.rate,
            entry.hits,
            entry.deviation_sigma,
            if entry.within_band { "" } else { "  OUTSIDE BAND" }
        );
    }
    println!(
        "  any period : rate {:.4} ({} hits); calibrated: {}",
        report.any_period_rate, report.any_period_hits, report.calibrated
    );
    if let Some(path) = &args.out {
        write_text(path, &to_canonical_json_pretty(&report)?)?;
        println!("wrote {}", path.display());
    }
    Ok(())
}
