use std::path::PathBuf;

use clap::Args;
use comb_audit::load_sealed;
use comb_core::AuditError;
use comb_data::load_manifest;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Sealed audit records (`audit_<channel>.json`) to re-hash.
    #[arg(long = "record", value_name = "PATH", required_unless_present = "manifest")]
    pub records: Vec<PathBuf>,
    /// Manifest whose listed files are checked against their hashes.
    #[arg(long)]
    pub manifest: Option<PathBuf>,
}

pub fn run(args: &VerifyArgs) -> Result<(), AuditError> {
    for path in &args.records {
        let audit = load_sealed(path)?;
        println!(
            "record {} ok ({} / {}, hash {})",
            path.display(),
            audit.dataset(),
            audit.channel(),
            audit.record_hash()
        );
    }
    if let Some(path) = &args.manifest {
        let manifest = load_manifest(path)?;
        for check in manifest.validate_all()? {
            println!("input {} ok ({} bytes, sha256 {})", check.path, check.size, check.actual_hash);
        }
    }
    Ok(())
}
