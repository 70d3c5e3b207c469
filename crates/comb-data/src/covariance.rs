//! Dense covariance file parsing and multipole alignment.
//!
//! Text format: whitespace (or comma) separated rows of a square matrix.
//! An optional `# ell: l1 l2 ...` comment declares the explicit multipole
//! index; without it the row order is assumed to match the target spectrum.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use comb_core::errors::{AuditError, ErrorInfo};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::spectrum::{unit_factor, UnitConvention};

/// Covariance as read from disk, before any validation or regularisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCovariance {
    /// Explicit multipole index, when the file declares one.
    pub ell: Option<Vec<u32>>,
    /// Square matrix entries.
    pub matrix: DMatrix<f64>,
}

fn format_error(code: &str, message: impl Into<String>, origin: &str) -> AuditError {
    AuditError::Format(ErrorInfo::new(code, message).with_context("origin", origin.to_string()))
}

/// Parses covariance text.
pub fn parse_covariance(text: &str, origin: &str) -> Result<RawCovariance, AuditError> {
    let mut ell: Option<Vec<u32>> = None;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim();
            if let Some(index) = comment
                .strip_prefix("ell:")
                .or_else(|| comment.strip_prefix("ell ="))
            {
                let parsed = index
                    .split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|token| !token.is_empty())
                    .map(|token| token.parse::<u32>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| {
                        format_error("covariance_ell_index", err.to_string(), origin)
                            .with_context("line", (idx + 1).to_string())
                    })?;
                ell = Some(parsed);
            }
            continue;
        }
        let row = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .map(|token| token.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                format_error("covariance_number", err.to_string(), origin)
                    .with_context("line", (idx + 1).to_string())
            })?;
        rows.push(row);
    }

    let n = rows.len();
    if n == 0 {
        return Err(format_error("covariance_empty", "covariance file has no rows", origin));
    }
    if let Some(bad) = rows.iter().position(|row| row.len() != n) {
        return Err(
            format_error("covariance_not_square", "covariance matrix is not square", origin)
                .with_context("rows", n.to_string())
                .with_context("row", bad.to_string())
                .with_context("columns", rows[bad].len().to_string()),
        );
    }
    if let Some(index) = &ell {
        if index.len() != n {
            return Err(format_error(
                "covariance_ell_dimension",
                "declared multipole index does not match matrix dimension",
                origin,
            )
            .with_context("index", index.len().to_string())
            .with_context("dimension", n.to_string()));
        }
        if index.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(format_error(
                "covariance_ell_order",
                "covariance multipole index must be strictly increasing",
                origin,
            ));
        }
    }
    if rows.iter().flatten().any(|value| !value.is_finite()) {
        return Err(format_error(
            "covariance_non_finite",
            "covariance contains a non-finite entry",
            origin,
        ));
    }
    let matrix = DMatrix::from_fn(n, n, |i, j| rows[i][j]);
    debug!(origin, dim = n, explicit_index = ell.is_some(), "parsed covariance");
    Ok(RawCovariance { ell, matrix })
}

/// Reads a covariance file from disk.
pub fn load_covariance(path: &Path) -> Result<RawCovariance, AuditError> {
    let text = fs::read_to_string(path).map_err(|err| {
        AuditError::Format(
            ErrorInfo::new("covariance_read", err.to_string())
                .with_context("path", path.display().to_string()),
        )
    })?;
    parse_covariance(&text, &path.display().to_string())
}

/// Reorders and subsets `matrix` so its rows follow `ell_target` exactly.
///
/// With no explicit index the matrix must already have one row per target
/// multipole. Every target multipole must be present in the index.
pub fn align_to_ell(
    matrix: &DMatrix<f64>,
    ell_cov: Option<&[u32]>,
    ell_target: &[u32],
) -> Result<DMatrix<f64>, AuditError> {
    if matrix.nrows() != matrix.ncols() {
        return Err(AuditError::format(
            "covariance_not_square",
            "covariance matrix is not square",
        ));
    }
    let Some(ell_cov) = ell_cov else {
        if matrix.nrows() != ell_target.len() {
            return Err(AuditError::Format(
                ErrorInfo::new(
                    "covariance_dimension",
                    "implicit covariance index does not match the spectrum length",
                )
                .with_context("dimension", matrix.nrows().to_string())
                .with_context("spectrum", ell_target.len().to_string())
                .with_hint("declare the covariance multipoles with a `# ell:` header"),
            ));
        }
        return Ok(matrix.clone());
    };
    if ell_cov.len() != matrix.nrows() {
        return Err(AuditError::Format(
            ErrorInfo::new(
                "covariance_ell_dimension",
                "covariance index length does not match matrix dimension",
            )
            .with_context("index", ell_cov.len().to_string())
            .with_context("dimension", matrix.nrows().to_string()),
        ));
    }
    let position: BTreeMap<u32, usize> = ell_cov
        .iter()
        .enumerate()
        .map(|(idx, &ell)| (ell, idx))
        .collect();
    let mut picks = Vec::with_capacity(ell_target.len());
    for &ell in ell_target {
        let idx = position.get(&ell).ok_or_else(|| {
            AuditError::Format(
                ErrorInfo::new(
                    "covariance_missing_ell",
                    "target multipole missing from covariance index",
                )
                .with_context("ell", ell.to_string()),
            )
        })?;
        picks.push(*idx);
    }
    let n = picks.len();
    Ok(DMatrix::from_fn(n, n, |i, j| matrix[(picks[i], picks[j])]))
}

/// Rescales a covariance aligned on `ell` from one unit convention to another.
pub fn convert_units(
    matrix: &DMatrix<f64>,
    ell: &[u32],
    from: UnitConvention,
    to: UnitConvention,
) -> Result<DMatrix<f64>, AuditError> {
    if ell.len() != matrix.nrows() || !matrix.is_square() {
        return Err(AuditError::Format(
            ErrorInfo::new(
                "covariance_unit_grid",
                "covariance is not aligned on the multipole grid being converted",
            )
            .with_context("ell", ell.len().to_string())
            .with_context("rows", matrix.nrows().to_string())
            .with_context("cols", matrix.ncols().to_string()),
        ));
    }
    if from == to {
        return Ok(matrix.clone());
    }
    let factors = ell
        .iter()
        .map(|&l| unit_factor(l, from, to))
        .collect::<Result<Vec<_>, _>>()?;
    let n = matrix.nrows();
    Ok(DMatrix::from_fn(n, n, |i, j| {
        matrix[(i, j)] * factors[i] * factors[j]
    }))
}

/// Principal sub-matrix on the given positions.
pub fn submatrix(matrix: &DMatrix<f64>, indices: &[usize]) -> DMatrix<f64> {
    let n = indices.len();
    DMatrix::from_fn(n, n, |i, j| matrix[(indices[i], indices[j])])
}
