pub mod audit;
pub mod calibrate;
pub mod lock;
pub mod verify;

use std::fs;
use std::path::Path;

use comb_core::{AuditError, ErrorInfo};
use comb_data::Channel;

pub(crate) fn parse_channel(label: &str) -> Result<Channel, AuditError> {
    match label.to_ascii_uppercase().as_str() {
        "TT" => Ok(Channel::TT),
        "EE" => Ok(Channel::EE),
        "TE" => Ok(Channel::TE),
        "BB" => Ok(Channel::BB),
        _ => Err(AuditError::Config(
            ErrorInfo::new("cli_channel", "unknown channel")
                .with_context("channel", label.to_string())
                .with_hint("expected one of TT, EE, TE, BB"),
        )),
    }
}

pub(crate) fn write_text(path: &Path, contents: &str) -> Result<(), AuditError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            AuditError::Serde(
                ErrorInfo::new("cli_write", err.to_string())
                    .with_context("path", parent.display().to_string()),
            )
        })?;
    }
    fs::write(path, contents).map_err(|err| {
        AuditError::Serde(
            ErrorInfo::new("cli_write", err.to_string())
                .with_context("path", path.display().to_string()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_labels_are_case_insensitive() {
        assert_eq!(parse_channel("te").unwrap(), Channel::TE);
        assert_eq!(parse_channel("BB").unwrap(), Channel::BB);
        assert_eq!(parse_channel("XX").unwrap_err().info().code, "cli_channel");
    }
}
