//! Covariance validation, ridge regularisation and Cholesky whitening.
//!
//! Residuals are whitened by forward substitution against the Cholesky
//! factor `L` of the regularised covariance. The inverse covariance is never
//! formed.

use comb_core::errors::{AuditError, ErrorInfo};
use comb_core::sha256_hex;
use comb_data::Spectrum;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Upper bound on the condition number of any covariance used downstream.
pub const DEFAULT_MAX_CONDITION: f64 = 1e8;

// Closed-form ridge targets slightly inside the bound so that the recomputed
// eigenvalues of the regularised matrix still satisfy it.
const CONDITION_MARGIN: f64 = 1e-6;
const MAX_RIDGE_ATTEMPTS: usize = 16;

/// Rigor level of the whitening applied to a residual vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhiteningMode {
    /// Full covariance, Cholesky whitening.
    Cov,
    /// Per-point division by the diagonal uncertainty.
    Diag,
    /// Residuals used as-is.
    None,
}

impl WhiteningMode {
    /// Label written into reports.
    pub fn label(&self) -> &'static str {
        match self {
            WhiteningMode::Cov => "cov",
            WhiteningMode::Diag => "diag",
            WhiteningMode::None => "none",
        }
    }
}

/// Record of one `validate_and_regularize` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegularizationDiagnostics {
    /// Matrix dimension.
    pub dimension: usize,
    /// Largest `|C_ij - C_ji|` before symmetrisation.
    pub max_asymmetry: f64,
    /// Smallest eigenvalue of the symmetrised input.
    pub min_eigenvalue_before: f64,
    /// Largest eigenvalue of the symmetrised input.
    pub max_eigenvalue_before: f64,
    /// Condition number of the symmetrised input; `None` when not positive definite.
    pub condition_before: Option<f64>,
    /// Ridge added to the diagonal (`0` when the input already satisfied the bound).
    pub lambda: f64,
    /// Smallest eigenvalue after regularisation.
    pub min_eigenvalue_after: f64,
    /// Largest eigenvalue after regularisation.
    pub max_eigenvalue_after: f64,
    /// Condition number after regularisation.
    pub condition_after: f64,
    /// Bound that was enforced.
    pub max_condition: f64,
    /// Whether a non-zero ridge was applied.
    pub regularized: bool,
}

/// Validated covariance keeping both the input and the matrix used downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularizedCovariance {
    /// Matrix exactly as aligned from the input file.
    pub original: DMatrix<f64>,
    /// Symmetrised and ridge-regularised matrix.
    pub regularized: DMatrix<f64>,
    /// Diagnostics of the regularisation step.
    pub diagnostics: RegularizationDiagnostics,
}

/// Stable digest of a matrix's shape and little-endian entries (column-major).
pub fn matrix_digest(matrix: &DMatrix<f64>) -> String {
    let mut bytes = Vec::with_capacity(16 + matrix.len() * 8);
    bytes.extend_from_slice(&(matrix.nrows() as u64).to_le_bytes());
    bytes.extend_from_slice(&(matrix.ncols() as u64).to_le_bytes());
    for value in matrix.iter() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    sha256_hex(&bytes)
}

fn eigen_extremes(matrix: &DMatrix<f64>) -> (f64, f64) {
    let eigen = SymmetricEigen::new(matrix.clone());
    eigen
        .eigenvalues
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &value| {
            (lo.min(value), hi.max(value))
        })
}

/// Condition number of a symmetric matrix, `None` when not positive definite.
pub fn condition_number(matrix: &DMatrix<f64>) -> Option<f64> {
    let (lo, hi) = eigen_extremes(matrix);
    (lo > 0.0).then(|| hi / lo)
}

/// Symmetrises, checks and ridge-regularises a covariance matrix.
///
/// When the smallest eigenvalue is non-positive or the condition number
/// exceeds `max_condition`, `λI` is added with
/// `λ = (λ_max - κ λ_min) / (κ - 1)`, the smallest ridge for which
/// `(λ_max + λ) / (λ_min + λ) <= κ`.
pub fn validate_and_regularize(
    matrix: &DMatrix<f64>,
    max_condition: f64,
) -> Result<(DMatrix<f64>, RegularizationDiagnostics), AuditError> {
    let n = matrix.nrows();
    if n == 0 || matrix.ncols() != n {
        return Err(AuditError::Format(
            ErrorInfo::new("covariance_shape", "covariance must be a non-empty square matrix")
                .with_context("rows", n.to_string())
                .with_context("columns", matrix.ncols().to_string()),
        ));
    }
    if !(max_condition.is_finite() && max_condition > 1.0) {
        return Err(AuditError::Config(
            ErrorInfo::new("whitening_max_condition", "condition bound must be finite and > 1")
                .with_context("max_condition", max_condition.to_string()),
        ));
    }
    if matrix.iter().any(|value| !value.is_finite()) {
        return Err(AuditError::numerical(
            "covariance_non_finite",
            "covariance contains a non-finite entry",
        ));
    }

    let transpose = matrix.transpose();
    let max_asymmetry = matrix
        .iter()
        .zip(transpose.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max);
    let symmetric = (matrix + &transpose) * 0.5;

    let (min_before, max_before) = eigen_extremes(&symmetric);
    if max_before <= 0.0 {
        error!(
            min_eigenvalue = min_before,
            max_eigenvalue = max_before,
            "covariance has no positive eigenvalue"
        );
        return Err(AuditError::Numerical(
            ErrorInfo::new(
                "covariance_not_positive",
                "covariance has no positive eigenvalue; a ridge cannot restore it",
            )
            .with_context("min_eigenvalue", min_before.to_string())
            .with_context("max_eigenvalue", max_before.to_string()),
        ));
    }
    let condition_before = (min_before > 0.0).then(|| max_before / min_before);

    if condition_before.is_some_and(|cond| cond <= max_condition) {
        debug!(dim = n, condition = ?condition_before, "covariance within condition bound");
        let diagnostics = RegularizationDiagnostics {
            dimension: n,
            max_asymmetry,
            min_eigenvalue_before: min_before,
            max_eigenvalue_before: max_before,
            condition_before,
            lambda: 0.0,
            min_eigenvalue_after: min_before,
            max_eigenvalue_after: max_before,
            condition_after: max_before / min_before,
            max_condition,
            regularized: false,
        };
        return Ok((symmetric, diagnostics));
    }

    let target = max_condition * (1.0 - CONDITION_MARGIN);
    let mut lambda = ((max_before - target * min_before) / (target - 1.0)).max(0.0);
    for attempt in 0..MAX_RIDGE_ATTEMPTS {
        let regularized = &symmetric + DMatrix::<f64>::identity(n, n) * lambda;
        let (min_after, max_after) = eigen_extremes(&regularized);
        if min_after > 0.0 && max_after / min_after <= max_condition {
            warn!(
                dim = n,
                lambda,
                attempt,
                condition_before = ?condition_before,
                condition_after = max_after / min_after,
                "covariance regularized with ridge"
            );
            let diagnostics = RegularizationDiagnostics {
                dimension: n,
                max_asymmetry,
                min_eigenvalue_before: min_before,
                max_eigenvalue_before: max_before,
                condition_before,
                lambda,
                min_eigenvalue_after: min_after,
                max_eigenvalue_after: max_after,
                condition_after: max_after / min_after,
                max_condition,
                regularized: true,
            };
            return Ok((regularized, diagnostics));
        }
        lambda = lambda * (1.0 + 1e-3) + f64::EPSILON * max_before.abs();
    }

    error!(
        min_eigenvalue = min_before,
        max_eigenvalue = max_before,
        lambda,
        "ridge regularization failed to bound the condition number"
    );
    Err(AuditError::Numerical(
        ErrorInfo::new(
            "covariance_regularization_failed",
            "ridge regularization could not bound the condition number",
        )
        .with_context("min_eigenvalue", min_before.to_string())
        .with_context("max_eigenvalue", max_before.to_string())
        .with_context("lambda", lambda.to_string())
        .with_context("max_condition", max_condition.to_string()),
    ))
}

/// Validates, regularises and keeps both copies for the audit trail.
pub fn regularize(
    matrix: &DMatrix<f64>,
    max_condition: f64,
) -> Result<RegularizedCovariance, AuditError> {
    let (regularized, diagnostics) = validate_and_regularize(matrix, max_condition)?;
    Ok(RegularizedCovariance {
        original: matrix.clone(),
        regularized,
        diagnostics,
    })
}

/// Lower-triangular `L` with `C_reg = L Lᵗ`.
pub fn cholesky_whitener(regularized: &DMatrix<f64>) -> Result<DMatrix<f64>, AuditError> {
    let factor = nalgebra::Cholesky::new(regularized.clone())
        .map(|chol| chol.l())
        .ok_or_else(|| {
            let (lo, hi) = eigen_extremes(regularized);
            error!(min_eigenvalue = lo, max_eigenvalue = hi, "cholesky factorization failed");
            AuditError::Numerical(
                ErrorInfo::new("cholesky_failed", "cholesky factorization did not succeed")
                    .with_context("min_eigenvalue", lo.to_string())
                    .with_context("max_eigenvalue", hi.to_string()),
            )
        })?;
    if factor.iter().any(|value| !value.is_finite()) {
        return Err(AuditError::numerical(
            "cholesky_non_finite",
            "cholesky factor contains non-finite entries",
        ));
    }
    Ok(factor)
}

/// Solves `L x = r` by forward substitution.
pub fn whiten(residual: &[f64], factor: &DMatrix<f64>) -> Result<Vec<f64>, AuditError> {
    if factor.nrows() != residual.len() || factor.ncols() != residual.len() {
        return Err(AuditError::Format(
            ErrorInfo::new("whiten_dimension", "residual length does not match whitener")
                .with_context("residual", residual.len().to_string())
                .with_context("whitener", factor.nrows().to_string()),
        ));
    }
    let rhs = DVector::from_column_slice(residual);
    let solved = factor.solve_lower_triangular(&rhs).ok_or_else(|| {
        AuditError::numerical("whiten_singular", "triangular factor has a zero pivot")
    })?;
    if solved.iter().any(|value| !value.is_finite()) {
        return Err(AuditError::numerical(
            "whiten_non_finite",
            "whitened residuals contain non-finite values",
        ));
    }
    Ok(solved.iter().copied().collect())
}

/// Immutable whitening transform for one (dataset, channel, range) context.
#[derive(Debug, Clone, PartialEq)]
pub struct Whitener {
    mode: WhiteningMode,
    dim: usize,
    factor: Option<DMatrix<f64>>,
    sigma: Option<Vec<f64>>,
}

impl Whitener {
    /// Factorises a regularised covariance.
    pub fn from_covariance(regularized: &DMatrix<f64>) -> Result<Self, AuditError> {
        let factor = cholesky_whitener(regularized)?;
        Ok(Self {
            mode: WhiteningMode::Cov,
            dim: factor.nrows(),
            factor: Some(factor),
            sigma: None,
        })
    }

    /// Diagonal fallback from per-point uncertainties.
    pub fn diagonal(sigma: &[f64]) -> Result<Self, AuditError> {
        if let Some(idx) = sigma.iter().position(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(AuditError::Format(
                ErrorInfo::new("whiten_sigma", "diagonal uncertainties must be finite and positive")
                    .with_context("index", idx.to_string()),
            ));
        }
        Ok(Self {
            mode: WhiteningMode::Diag,
            dim: sigma.len(),
            factor: None,
            sigma: Some(sigma.to_vec()),
        })
    }

    /// Pass-through transform.
    pub fn identity(dim: usize) -> Self {
        Self {
            mode: WhiteningMode::None,
            dim,
            factor: None,
            sigma: None,
        }
    }

    /// Rigor level of this transform.
    pub fn mode(&self) -> WhiteningMode {
        self.mode
    }

    /// Number of samples the transform applies to.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Cholesky factor in covariance mode.
    pub fn factor(&self) -> Option<&DMatrix<f64>> {
        self.factor.as_ref()
    }

    fn check_len(&self, len: usize) -> Result<(), AuditError> {
        if len != self.dim {
            return Err(AuditError::Format(
                ErrorInfo::new("whiten_dimension", "vector length does not match whitener")
                    .with_context("vector", len.to_string())
                    .with_context("whitener", self.dim.to_string()),
            ));
        }
        Ok(())
    }

    /// Maps residuals into the unit-covariance basis.
    pub fn whiten(&self, residual: &[f64]) -> Result<Vec<f64>, AuditError> {
        self.check_len(residual.len())?;
        match (&self.factor, &self.sigma) {
            (Some(factor), _) => whiten(residual, factor),
            (None, Some(sigma)) => Ok(residual.iter().zip(sigma).map(|(r, s)| r / s).collect()),
            (None, None) => Ok(residual.to_vec()),
        }
    }

    /// Inverse transform: maps unit-variance draws to the residual basis.
    pub fn color(&self, unit: &[f64]) -> Result<Vec<f64>, AuditError> {
        self.check_len(unit.len())?;
        match (&self.factor, &self.sigma) {
            (Some(factor), _) => {
                let colored = factor * DVector::from_column_slice(unit);
                Ok(colored.iter().copied().collect())
            }
            (None, Some(sigma)) => Ok(unit.iter().zip(sigma).map(|(z, s)| z * s).collect()),
            (None, None) => Ok(unit.to_vec()),
        }
    }
}

/// Whitener plus the regularisation record that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedWhitener {
    /// Transform shared read-only by every draw of the context.
    pub whitener: Whitener,
    /// Present in covariance mode.
    pub covariance: Option<RegularizedCovariance>,
}

/// Chooses the strongest available whitening for a spectrum.
///
/// `covariance`, when given, must already be aligned on the spectrum's
/// multipoles.
pub fn prepare(
    spectrum: &Spectrum,
    covariance: Option<&DMatrix<f64>>,
    max_condition: f64,
) -> Result<PreparedWhitener, AuditError> {
    match covariance {
        Some(matrix) => {
            if matrix.nrows() != spectrum.len() {
                return Err(AuditError::Format(
                    ErrorInfo::new(
                        "covariance_dimension",
                        "covariance is not aligned with the spectrum",
                    )
                    .with_context("dimension", matrix.nrows().to_string())
                    .with_context("spectrum", spectrum.len().to_string()),
                ));
            }
            let regularized = regularize(matrix, max_condition)?;
            let whitener = Whitener::from_covariance(&regularized.regularized)?;
            Ok(PreparedWhitener {
                whitener,
                covariance: Some(regularized),
            })
        }
        None => {
            let whitener = match spectrum.sigma() {
                Some(sigma) => Whitener::diagonal(sigma)?,
                None => Whitener::identity(spectrum.len()),
            };
            Ok(PreparedWhitener {
                whitener,
                covariance: None,
            })
        }
    }
}
