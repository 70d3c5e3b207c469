//! Columnar spectrum parsing, unit normalisation and observed/model alignment.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use comb_core::errors::{AuditError, ErrorInfo};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default minimum number of aligned samples for any analysis context.
pub const DEFAULT_MIN_POINTS: usize = 50;

/// Spectrum channel selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    /// Temperature auto-spectrum.
    TT,
    /// E-mode polarization auto-spectrum.
    EE,
    /// Temperature/E-mode cross-spectrum.
    TE,
    /// B-mode polarization auto-spectrum.
    BB,
}

impl Channel {
    /// Column label used in spectrum headers.
    pub fn label(&self) -> &'static str {
        match self {
            Channel::TT => "TT",
            Channel::EE => "EE",
            Channel::TE => "TE",
            Channel::BB => "BB",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Unit convention declared by a spectrum source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UnitConvention {
    /// `D_ℓ = ℓ(ℓ+1) C_ℓ / 2π`.
    #[default]
    Power,
    /// Bare `C_ℓ`.
    Raw,
}

/// Multiplicative factor taking a value at multipole `ell` from `from` to `to`.
pub fn unit_factor(ell: u32, from: UnitConvention, to: UnitConvention) -> Result<f64, AuditError> {
    let l = f64::from(ell);
    let power_over_raw = l * (l + 1.0) / (2.0 * PI);
    match (from, to) {
        (UnitConvention::Power, UnitConvention::Power)
        | (UnitConvention::Raw, UnitConvention::Raw) => Ok(1.0),
        (UnitConvention::Raw, UnitConvention::Power) => Ok(power_over_raw),
        (UnitConvention::Power, UnitConvention::Raw) => {
            if ell == 0 {
                Err(AuditError::Format(
                    ErrorInfo::new(
                        "spectrum_unit_monopole",
                        "cannot convert D_ell to C_ell at ell = 0",
                    )
                    .with_hint("drop the monopole row or declare the source as raw"),
                ))
            } else {
                Ok(1.0 / power_over_raw)
            }
        }
    }
}

/// Declared location and units of a spectrum file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectrumSource {
    /// Path to the columnar text file.
    pub path: PathBuf,
    /// Unit convention the file is written in.
    #[serde(default)]
    pub units: UnitConvention,
}

/// One channel's column triple as read from a single file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSeries {
    /// Channel the values belong to.
    pub channel: Channel,
    /// Units the values are expressed in.
    pub units: UnitConvention,
    /// Strictly increasing multipoles.
    pub ell: Vec<u32>,
    /// Spectrum values.
    pub value: Vec<f64>,
    /// Optional one-sigma uncertainties.
    pub sigma: Option<Vec<f64>>,
}

impl ChannelSeries {
    /// Re-expresses values (and uncertainties) in the requested convention.
    pub fn to_units(&self, target: UnitConvention) -> Result<ChannelSeries, AuditError> {
        let factors = self
            .ell
            .iter()
            .map(|&ell| unit_factor(ell, self.units, target))
            .collect::<Result<Vec<_>, _>>()?;
        let scale = |values: &[f64]| -> Vec<f64> {
            values.iter().zip(&factors).map(|(v, f)| v * f).collect()
        };
        Ok(ChannelSeries {
            channel: self.channel,
            units: target,
            ell: self.ell.clone(),
            value: scale(&self.value),
            sigma: self.sigma.as_deref().map(scale),
        })
    }
}

/// Observed and model values aligned on a common multipole grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    channel: Channel,
    units: UnitConvention,
    ell: Vec<u32>,
    observed: Vec<f64>,
    model: Vec<f64>,
    sigma: Option<Vec<f64>>,
}

impl Spectrum {
    /// Builds a spectrum, enforcing the grid and finiteness invariants.
    pub fn new(
        channel: Channel,
        units: UnitConvention,
        ell: Vec<u32>,
        observed: Vec<f64>,
        model: Vec<f64>,
        sigma: Option<Vec<f64>>,
    ) -> Result<Self, AuditError> {
        let n = ell.len();
        if observed.len() != n || model.len() != n || sigma.as_ref().is_some_and(|s| s.len() != n)
        {
            return Err(AuditError::Format(
                ErrorInfo::new("spectrum_length", "spectrum columns have different lengths")
                    .with_context("ell", n.to_string())
                    .with_context("observed", observed.len().to_string())
                    .with_context("model", model.len().to_string()),
            ));
        }
        check_strictly_increasing(&ell, "spectrum")?;
        check_finite(&observed, "observed")?;
        check_finite(&model, "model")?;
        if let Some(sigma) = &sigma {
            check_sigma(&ell, sigma)?;
        }
        Ok(Self {
            channel,
            units,
            ell,
            observed,
            model,
            sigma,
        })
    }

    /// Channel of the spectrum.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Units of the observed and model values.
    pub fn units(&self) -> UnitConvention {
        self.units
    }

    /// Multipole grid.
    pub fn ell(&self) -> &[u32] {
        &self.ell
    }

    /// Observed values.
    pub fn observed(&self) -> &[f64] {
        &self.observed
    }

    /// Model values.
    pub fn model(&self) -> &[f64] {
        &self.model
    }

    /// Diagonal uncertainties, if the source carried them.
    pub fn sigma(&self) -> Option<&[f64]> {
        self.sigma.as_deref()
    }

    /// Number of aligned samples.
    pub fn len(&self) -> usize {
        self.ell.len()
    }

    /// Whether the spectrum has no samples.
    pub fn is_empty(&self) -> bool {
        self.ell.is_empty()
    }

    /// Observed minus model.
    pub fn residuals(&self) -> Vec<f64> {
        self.observed
            .iter()
            .zip(&self.model)
            .map(|(o, m)| o - m)
            .collect()
    }

    /// Positions of the samples with `ell_min <= ℓ <= ell_max`.
    pub fn range_indices(&self, ell_min: u32, ell_max: u32) -> Vec<usize> {
        self.ell
            .iter()
            .enumerate()
            .filter(|(_, &ell)| ell >= ell_min && ell <= ell_max)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Sub-spectrum made of the given sample positions.
    pub fn select(&self, indices: &[usize]) -> Spectrum {
        let pick = |values: &[f64]| indices.iter().map(|&idx| values[idx]).collect::<Vec<_>>();
        Spectrum {
            channel: self.channel,
            units: self.units,
            ell: indices.iter().map(|&idx| self.ell[idx]).collect(),
            observed: pick(&self.observed),
            model: pick(&self.model),
            sigma: self.sigma.as_deref().map(pick),
        }
    }

    /// Replaces the observed column, keeping grid, model and uncertainties.
    pub fn with_observed(&self, observed: Vec<f64>) -> Result<Spectrum, AuditError> {
        Spectrum::new(
            self.channel,
            self.units,
            self.ell.clone(),
            observed,
            self.model.clone(),
            self.sigma.clone(),
        )
    }
}

fn check_strictly_increasing(ell: &[u32], what: &str) -> Result<(), AuditError> {
    for pair in ell.windows(2) {
        if pair[1] <= pair[0] {
            return Err(AuditError::Format(
                ErrorInfo::new(
                    "spectrum_ell_order",
                    "multipoles must be strictly increasing and unique",
                )
                .with_context("source", what.to_string())
                .with_context("previous", pair[0].to_string())
                .with_context("next", pair[1].to_string()),
            ));
        }
    }
    Ok(())
}

fn check_finite(values: &[f64], what: &str) -> Result<(), AuditError> {
    if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
        return Err(AuditError::Format(
            ErrorInfo::new("spectrum_non_finite", "spectrum contains a non-finite value")
                .with_context("column", what.to_string())
                .with_context("index", idx.to_string()),
        ));
    }
    Ok(())
}

fn check_sigma(ell: &[u32], sigma: &[f64]) -> Result<(), AuditError> {
    if let Some(idx) = sigma.iter().position(|s| !(s.is_finite() && *s > 0.0)) {
        return Err(AuditError::Format(
            ErrorInfo::new("spectrum_sigma", "uncertainties must be finite and positive")
                .with_context("ell", ell[idx].to_string())
                .with_context("sigma", sigma[idx].to_string()),
        ));
    }
    Ok(())
}

struct Columns {
    ell: usize,
    value: usize,
    sigma: Option<usize>,
    // Headerless layouts pin every row to the first row's width.
    width: Option<usize>,
}

fn header_columns(names: &[String], channel: Channel) -> Option<Columns> {
    let find = |candidates: &[String]| {
        names
            .iter()
            .position(|name| candidates.iter().any(|c| c.eq_ignore_ascii_case(name)))
    };
    let ell = find(&["ell".to_string(), "l".to_string()])?;
    let label = channel.label();
    let value = find(&[label.to_string()])?;
    let sigma = find(&[
        format!("d{label}"),
        format!("{label}_err"),
        format!("sigma_{label}"),
        format!("err_{label}"),
    ]);
    Some(Columns {
        ell,
        value,
        sigma,
        width: None,
    })
}

fn parse_ell(token: &str, line_no: usize, origin: &str) -> Result<u32, AuditError> {
    let value: f64 = parse_number(token, line_no, origin)?;
    if value < 0.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
        return Err(AuditError::Format(
            ErrorInfo::new("spectrum_ell_value", "multipole must be a non-negative integer")
                .with_context("origin", origin.to_string())
                .with_context("line", line_no.to_string())
                .with_context("token", token.to_string()),
        ));
    }
    Ok(value as u32)
}

fn parse_number(token: &str, line_no: usize, origin: &str) -> Result<f64, AuditError> {
    token.parse::<f64>().map_err(|err| {
        AuditError::Format(
            ErrorInfo::new("spectrum_number", err.to_string())
                .with_context("origin", origin.to_string())
                .with_context("line", line_no.to_string())
                .with_context("token", token.to_string()),
        )
    })
}

/// Parses one channel out of columnar spectrum text.
///
/// Lines starting with `#` are comments. A comment whose first word is `ell`
/// (or `l`) names the columns; the value column is the channel label and the
/// uncertainty column is `dXX`, `XX_err`, `sigma_XX` or `err_XX`. Without a
/// header the layout is `ell value [sigma]`.
pub fn parse_channel(
    text: &str,
    channel: Channel,
    units: UnitConvention,
    origin: &str,
) -> Result<ChannelSeries, AuditError> {
    let mut columns: Option<Columns> = None;
    let mut saw_header = false;
    let mut ell = Vec::new();
    let mut value = Vec::new();
    let mut sigma = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            let names: Vec<String> = comment
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect();
            let names_header = names
                .first()
                .is_some_and(|first| first.eq_ignore_ascii_case("ell") || first.eq_ignore_ascii_case("l"));
            if names_header && !saw_header && ell.is_empty() {
                saw_header = true;
                columns = Some(header_columns(&names, channel).ok_or_else(|| {
                    AuditError::Format(
                        ErrorInfo::new("spectrum_channel_missing", "header lacks the requested channel")
                            .with_context("origin", origin.to_string())
                            .with_context("channel", channel.label()),
                    )
                })?);
            }
            continue;
        }

        let tokens: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .collect();
        let layout = columns.get_or_insert_with(|| Columns {
            ell: 0,
            value: 1,
            sigma: (tokens.len() >= 3).then_some(2),
            width: Some(tokens.len()),
        });
        if let Some(width) = layout.width {
            if tokens.len() != width {
                return Err(AuditError::Format(
                    ErrorInfo::new("spectrum_ragged", "headerless rows must all have the same columns")
                        .with_context("origin", origin.to_string())
                        .with_context("line", line_no.to_string())
                        .with_context("expected", width.to_string())
                        .with_context("found", tokens.len().to_string()),
                ));
            }
        }
        let needed = layout.ell.max(layout.value).max(layout.sigma.unwrap_or(0));
        if tokens.len() <= needed {
            return Err(AuditError::Format(
                ErrorInfo::new("spectrum_columns", "row has fewer columns than declared")
                    .with_context("origin", origin.to_string())
                    .with_context("line", line_no.to_string())
                    .with_context("expected", (needed + 1).to_string())
                    .with_context("found", tokens.len().to_string()),
            ));
        }
        ell.push(parse_ell(tokens[layout.ell], line_no, origin)?);
        value.push(parse_number(tokens[layout.value], line_no, origin)?);
        if let Some(col) = layout.sigma {
            sigma.push(parse_number(tokens[col], line_no, origin)?);
        }
    }

    if ell.is_empty() {
        return Err(AuditError::Format(
            ErrorInfo::new("spectrum_empty", "spectrum file contains no data rows")
                .with_context("origin", origin.to_string()),
        ));
    }
    check_strictly_increasing(&ell, origin)?;
    check_finite(&value, origin)?;
    let sigma = if sigma.is_empty() {
        None
    } else {
        check_sigma(&ell, &sigma)?;
        Some(sigma)
    };
    debug!(origin, channel = %channel, rows = ell.len(), "parsed spectrum channel");
    Ok(ChannelSeries {
        channel,
        units,
        ell,
        value,
        sigma,
    })
}

/// Reads one channel from a spectrum file on disk.
pub fn load_channel(source: &SpectrumSource, channel: Channel) -> Result<ChannelSeries, AuditError> {
    let text = fs::read_to_string(&source.path).map_err(|err| {
        AuditError::Format(
            ErrorInfo::new("spectrum_read", err.to_string())
                .with_context("path", source.path.display().to_string()),
        )
    })?;
    parse_channel(
        &text,
        channel,
        source.units,
        &source.path.display().to_string(),
    )
}

/// Aligns observed and model series on their common multipoles.
///
/// Both inputs are first converted to `units`. Uncertainties come from the
/// observed series. Fails when the intersection holds fewer than
/// `min_points` samples.
pub fn align(
    observed: &ChannelSeries,
    model: &ChannelSeries,
    units: UnitConvention,
    min_points: usize,
) -> Result<Spectrum, AuditError> {
    if observed.channel != model.channel {
        return Err(AuditError::Format(
            ErrorInfo::new("spectrum_channel_mismatch", "observed and model channels differ")
                .with_context("observed", observed.channel.label())
                .with_context("model", model.channel.label()),
        ));
    }
    let observed = observed.to_units(units)?;
    let model = model.to_units(units)?;
    let model_index: BTreeMap<u32, usize> = model
        .ell
        .iter()
        .enumerate()
        .map(|(idx, &ell)| (ell, idx))
        .collect();

    let mut ell = Vec::new();
    let mut obs = Vec::new();
    let mut mdl = Vec::new();
    let mut sigma = observed.sigma.as_ref().map(|_| Vec::new());
    for (idx, &l) in observed.ell.iter().enumerate() {
        if let Some(&midx) = model_index.get(&l) {
            ell.push(l);
            obs.push(observed.value[idx]);
            mdl.push(model.value[midx]);
            if let (Some(out), Some(src)) = (sigma.as_mut(), observed.sigma.as_ref()) {
                out.push(src[idx]);
            }
        }
    }
    if ell.len() < min_points {
        return Err(AuditError::Format(
            ErrorInfo::new(
                "spectrum_alignment",
                "observed/model multipole intersection is below the minimum point count",
            )
            .with_context("intersection", ell.len().to_string())
            .with_context("min_points", min_points.to_string())
            .with_context("observed", observed.ell.len().to_string())
            .with_context("model", model.ell.len().to_string()),
        ));
    }
    Spectrum::new(observed.channel, units, ell, obs, mdl, sigma)
}

/// Loads and aligns an observed/model pair for one channel.
pub fn load(
    observed: &SpectrumSource,
    model: &SpectrumSource,
    channel: Channel,
    units: UnitConvention,
    min_points: usize,
) -> Result<Spectrum, AuditError> {
    let obs = load_channel(observed, channel)?;
    let mdl = load_channel(model, channel)?;
    align(&obs, &mdl, units, min_points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_factor_round_trip() {
        let up = unit_factor(10, UnitConvention::Raw, UnitConvention::Power).unwrap();
        let down = unit_factor(10, UnitConvention::Power, UnitConvention::Raw).unwrap();
        assert!((up * down - 1.0).abs() < 1e-12);
        assert!((up - 110.0 / (2.0 * PI)).abs() < 1e-12);
        assert!(unit_factor(0, UnitConvention::Power, UnitConvention::Raw).is_err());
    }

    #[test]
    fn headerless_layout_detects_sigma() {
        let text = "2 1.0 0.1\n3 2.0 0.2\n";
        let series = parse_channel(text, Channel::TT, UnitConvention::Raw, "inline").unwrap();
        assert_eq!(series.ell, vec![2, 3]);
        assert_eq!(series.sigma, Some(vec![0.1, 0.2]));
    }
}
