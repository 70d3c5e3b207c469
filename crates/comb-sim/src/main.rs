use std::process::ExitCode;

use clap::{Parser, Subcommand};
use comb_core::AuditError;
use commands::{
    audit::{self, AuditArgs},
    calibrate::{self, CalibrateArgs},
    lock::{self, LockArgs},
    verify::{self, VerifyArgs},
};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "comb-sim", about = "Pre-registered comb-signature audit CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full audit described by a YAML configuration.
    Audit(AuditArgs),
    /// Check sealed audit records and manifest-listed inputs.
    Verify(VerifyArgs),
    /// Run only the false-positive calibration for a configuration.
    Calibrate(CalibrateArgs),
    /// Seal a pre-registration record with its lock hash.
    Lock(LockArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Status for a rejected command line, kept apart from every error family.
const USAGE_EXIT: u8 = 64;

fn usage_code(err: &clap::Error) -> u8 {
    if err.use_stderr() {
        USAGE_EXIT
    } else {
        0
    }
}

/// Process status for each error family; 0 is reserved for completed runs.
fn exit_code(err: &AuditError) -> u8 {
    match err {
        AuditError::Provenance(_) => 2,
        AuditError::Numerical(_) => 3,
        AuditError::Format(_) => 4,
        AuditError::Config(_) => 5,
        AuditError::Serde(_) => 6,
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version requests print to stdout and succeed.
            let _ = err.print();
            return ExitCode::from(usage_code(&err));
        }
    };
    init_tracing();
    let outcome = match cli.command {
        Command::Audit(args) => audit::run(&args),
        Command::Verify(args) => verify::run(&args),
        Command::Calibrate(args) => calibrate::run(&args),
        Command::Lock(args) => lock::run(&args),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(family = err.family(), code = %err.info().code, "run aborted");
            eprintln!("comb-sim: {err}");
            ExitCode::from(exit_code(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;
    use comb_core::ErrorInfo;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn families_map_to_distinct_nonzero_codes() {
        let codes = [
            exit_code(&AuditError::Provenance(ErrorInfo::new("p", "p"))),
            exit_code(&AuditError::numerical("n", "n")),
            exit_code(&AuditError::format("f", "f")),
            exit_code(&AuditError::config("c", "c")),
            exit_code(&AuditError::serde("s", "s")),
        ];
        assert_eq!(codes, [2, 3, 4, 5, 6]);
        assert!(!codes.contains(&USAGE_EXIT));
    }

    #[test]
    fn usage_errors_do_not_collide_with_provenance() {
        let missing = Cli::try_parse_from(["comb-sim", "audit", "--out", "reports"]).unwrap_err();
        assert_eq!(usage_code(&missing), USAGE_EXIT);
        let unknown = Cli::try_parse_from(["comb-sim", "replay"]).unwrap_err();
        assert_eq!(usage_code(&unknown), USAGE_EXIT);
        let help = Cli::try_parse_from(["comb-sim", "--help"]).unwrap_err();
        assert_eq!(usage_code(&help), 0);
    }
}
