use std::fs;
use std::path::PathBuf;

use clap::Args;
use comb_audit::PreRegistration;
use comb_core::{AuditError, ErrorInfo};

use super::write_text;

#[derive(Args, Debug)]
pub struct LockArgs {
    /// YAML pre-registration record.
    #[arg(long)]
    pub prereg: PathBuf,
    /// Where to write the locked record; printed to stdout when omitted.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub fn run(args: &LockArgs) -> Result<(), AuditError> {
    let text = fs::read_to_string(&args.prereg).map_err(|err| {
        AuditError::Config(
            ErrorInfo::new("prereg_read", err.to_string())
                .with_context("path", args.prereg.display().to_string()),
        )
    })?;
    let record: PreRegistration = serde_yaml::from_str(&text).map_err(|err| {
        AuditError::Config(
            ErrorInfo::new("prereg_parse", err.to_string())
                .with_context("path", args.prereg.display().to_string()),
        )
    })?;

    if record.lock_hash.is_some() {
        let hash = record.verify()?;
        println!("pre-registration {} already locked; hash {hash} verified", record.version);
        return Ok(());
    }
    let locked = record.locked()?;
    let yaml = serde_yaml::to_string(&locked)
        .map_err(|err| AuditError::serde("prereg_serialize", err))?;
    match &args.out {
        Some(path) => {
            write_text(path, &yaml)?;
            println!("wrote {}", path.display());
        }
        None => print!("{yaml}"),
    }
    if let Some(hash) = &locked.lock_hash {
        eprintln!("lock hash {hash}");
    }
    Ok(())
}
