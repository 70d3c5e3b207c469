use comb_data::{align_to_ell, parse_covariance, submatrix, convert_units, UnitConvention};
use nalgebra::DMatrix;

#[test]
fn explicit_index_is_reordered_to_target() {
    let text = "\
# ell: 2 3 4
4 1 0
1 5 2
0 2 6
";
    let raw = parse_covariance(text, "inline").expect("parse");
    assert_eq!(raw.ell.as_deref(), Some(&[2, 3, 4][..]));
    let aligned = align_to_ell(&raw.matrix, raw.ell.as_deref(), &[4, 2]).expect("align");
    assert_eq!(aligned, DMatrix::from_row_slice(2, 2, &[6.0, 0.0, 0.0, 4.0]));
}

#[test]
fn missing_target_ell_fails() {
    let raw = parse_covariance("# ell: 2 3\n1 0\n0 1\n", "inline").expect("parse");
    let err = align_to_ell(&raw.matrix, raw.ell.as_deref(), &[2, 5]).expect_err("missing");
    assert_eq!(err.info().code, "covariance_missing_ell");
}

#[test]
fn non_square_and_implicit_mismatch_fail() {
    let err = parse_covariance("1 0 0\n0 1 0\n", "inline").expect_err("not square");
    assert_eq!(err.info().code, "covariance_not_square");

    let raw = parse_covariance("1 0\n0 1\n", "inline").expect("parse");
    let err = align_to_ell(&raw.matrix, None, &[2, 3, 4]).expect_err("implicit mismatch");
    assert_eq!(err.info().code, "covariance_dimension");
    let same = align_to_ell(&raw.matrix, None, &[2, 3]).expect("implicit ok");
    assert_eq!(same, raw.matrix);
}

#[test]
fn unit_conversion_scales_both_indices() {
    let matrix = DMatrix::from_element(2, 2, 1.0);
    let converted =
        convert_units(&matrix, &[1, 2], UnitConvention::Raw, UnitConvention::Power).expect("units");
    let f1 = 2.0 / (2.0 * std::f64::consts::PI);
    let f2 = 6.0 / (2.0 * std::f64::consts::PI);
    assert!((converted[(0, 1)] - f1 * f2).abs() < 1e-12);
    assert!((converted[(1, 1)] - f2 * f2).abs() < 1e-12);
    assert_eq!(submatrix(&converted, &[1]).nrows(), 1);
}

#[test]
fn unit_conversion_rejects_a_grid_of_the_wrong_length() {
    let matrix = DMatrix::<f64>::identity(3, 3);
    let err = convert_units(&matrix, &[2, 3], UnitConvention::Power, UnitConvention::Raw)
        .expect_err("short grid");
    assert_eq!(err.info().code, "covariance_unit_grid");
    assert_eq!(err.family(), "format");
    let err = convert_units(&matrix, &[2, 3], UnitConvention::Raw, UnitConvention::Raw)
        .expect_err("same units still need a matching grid");
    assert_eq!(err.info().code, "covariance_unit_grid");
}
