use std::f64::consts::PI;
use std::fs;

use comb_data::{
    align, load, parse_channel, Channel, ChannelSeries, SpectrumSource, UnitConvention,
};

const MULTI_CHANNEL: &str = "\
# Planck-like export
# ell TT dTT EE dEE
2 100.0 10.0 1.0 0.5
3 110.0 11.0 1.1 0.5
4 120.0 12.0 1.2 0.5
";

#[test]
fn header_selects_channel_columns() {
    let ee = parse_channel(MULTI_CHANNEL, Channel::EE, UnitConvention::Power, "inline")
        .expect("parse EE");
    assert_eq!(ee.ell, vec![2, 3, 4]);
    assert_eq!(ee.value, vec![1.0, 1.1, 1.2]);
    assert_eq!(ee.sigma, Some(vec![0.5, 0.5, 0.5]));

    let err = parse_channel(MULTI_CHANNEL, Channel::BB, UnitConvention::Power, "inline")
        .expect_err("no BB column");
    assert_eq!(err.info().code, "spectrum_channel_missing");
}

#[test]
fn non_monotonic_ell_is_rejected() {
    let err = parse_channel("2 1.0\n4 1.0\n3 1.0\n", Channel::TT, UnitConvention::Raw, "inline")
        .expect_err("order");
    assert_eq!(err.info().code, "spectrum_ell_order");
    let err = parse_channel("2 1.0\n2 1.0\n", Channel::TT, UnitConvention::Raw, "inline")
        .expect_err("duplicate");
    assert_eq!(err.info().code, "spectrum_ell_order");
}

#[test]
fn headerless_rows_must_share_a_width() {
    let err = parse_channel("2 1.0\n3 1.0 0.1\n", Channel::TT, UnitConvention::Raw, "inline")
        .expect_err("sigma appears late");
    assert_eq!(err.info().code, "spectrum_ragged");
    assert_eq!(err.info().context.get("line").map(String::as_str), Some("2"));

    let err = parse_channel("2 1.0 0.1\n3 1.0\n", Channel::TT, UnitConvention::Raw, "inline")
        .expect_err("sigma disappears");
    assert_eq!(err.info().code, "spectrum_ragged");

    let series = parse_channel(
        "# plain columns\n2 1.0 0.1\n3 2.0 0.2\n",
        Channel::TT,
        UnitConvention::Raw,
        "inline",
    )
    .expect("consistent rows");
    assert_eq!(series.sigma, Some(vec![0.1, 0.2]));
}

#[test]
fn power_to_raw_conversion_scales_values_and_sigma() {
    let series = ChannelSeries {
        channel: Channel::TT,
        units: UnitConvention::Power,
        ell: vec![10],
        value: vec![110.0 / (2.0 * PI)],
        sigma: Some(vec![110.0 / (2.0 * PI)]),
    };
    let raw = series.to_units(UnitConvention::Raw).expect("convert");
    assert!((raw.value[0] - 1.0).abs() < 1e-12);
    assert!((raw.sigma.as_ref().expect("sigma")[0] - 1.0).abs() < 1e-12);
}

#[test]
fn alignment_uses_intersection_and_enforces_minimum() {
    let observed = ChannelSeries {
        channel: Channel::TT,
        units: UnitConvention::Raw,
        ell: (2..12).collect(),
        value: (2..12).map(f64::from).collect(),
        sigma: Some(vec![1.0; 10]),
    };
    let model = ChannelSeries {
        channel: Channel::TT,
        units: UnitConvention::Raw,
        ell: (5..20).collect(),
        value: vec![0.0; 15],
        sigma: None,
    };
    let spectrum = align(&observed, &model, UnitConvention::Raw, 5).expect("align");
    assert_eq!(spectrum.ell(), &[5, 6, 7, 8, 9, 10, 11]);
    assert_eq!(spectrum.residuals()[0], 5.0);
    assert_eq!(spectrum.sigma().map(<[f64]>::len), Some(7));

    let err = align(&observed, &model, UnitConvention::Raw, 8).expect_err("too few");
    assert_eq!(err.info().code, "spectrum_alignment");
}

#[test]
fn loading_is_deterministic_for_identical_bytes() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let obs_path = dir.path().join("obs.txt");
    let mdl_path = dir.path().join("model.txt");
    let rows: String = (2..80).map(|l| format!("{l} {} 0.5\n", l as f64 * 0.1)).collect();
    fs::write(&obs_path, &rows).expect("write obs");
    fs::write(&mdl_path, &rows).expect("write model");
    let observed = SpectrumSource {
        path: obs_path,
        units: UnitConvention::Power,
    };
    let model = SpectrumSource {
        path: mdl_path,
        units: UnitConvention::Power,
    };
    let a = load(&observed, &model, Channel::TT, UnitConvention::Power, 50).expect("load a");
    let b = load(&observed, &model, Channel::TT, UnitConvention::Power, 50).expect("load b");
    assert_eq!(a, b);
    assert_eq!(a.len(), 78);
    assert!(a.residuals().iter().all(|r| *r == 0.0));
}
