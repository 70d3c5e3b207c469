use std::f64::consts::{PI, TAU};

use comb_audit::{
    circular_distance, run_ablation, AblationRange, AblationSettings, AnalysisContext,
    AnalysisSettings, ConsistencyVerdict, RangeStatus,
};
use comb_core::RngHandle;
use comb_data::{Channel, Spectrum, UnitConvention};
use comb_stat::{
    CombKernel, Correction, NullGenerator, ResampleMethod, ScoringStrategy, WhiteningMode,
    DEFAULT_MAX_CONDITION,
};
use rand::Rng;
use rand_distr::StandardNormal;

const PERIODS: [u32; 6] = [8, 16, 32, 64, 128, 255];

fn flat_spectrum(seed: u64, injection: Option<(f64, f64)>) -> Spectrum {
    let ell: Vec<u32> = (2..1202).collect();
    let model = vec![1.0; ell.len()];
    let mut rng = RngHandle::from_seed(seed);
    let observed = ell
        .iter()
        .map(|&l| {
            let noise: f64 = rng.sample(StandardNormal);
            let signal = injection
                .map(|(amplitude, phase)| amplitude * (TAU * l as f64 / 255.0 - phase).cos())
                .unwrap_or(0.0);
            1.0 + noise + signal
        })
        .collect();
    Spectrum::new(
        Channel::TT,
        UnitConvention::Power,
        ell.clone(),
        observed,
        model,
        Some(vec![1.0; ell.len()]),
    )
    .unwrap()
}

fn settings() -> AnalysisSettings {
    AnalysisSettings {
        periods: PERIODS.to_vec(),
        kernel: CombKernel::Harmonic,
        max_condition: DEFAULT_MAX_CONDITION,
        correction: Correction::bonferroni(PERIODS.len(), 1).unwrap(),
    }
}

fn ranges() -> Vec<AblationRange> {
    let mut ranges: Vec<AblationRange> = [(2, 240), (241, 480), (481, 720), (721, 960), (961, 1201)]
        .iter()
        .enumerate()
        .map(|(i, &(ell_min, ell_max))| AblationRange {
            name: format!("band{i}"),
            ell_min,
            ell_max,
        })
        .collect();
    ranges.push(AblationRange {
        name: "sliver".to_string(),
        ell_min: 1190,
        ell_max: 1250,
    });
    ranges
}

const PERMUTE: ScoringStrategy = ScoringStrategy::Resampled {
    method: ResampleMethod::Permute,
};

#[test]
fn pure_noise_reports_no_detection() {
    let spectrum = flat_spectrum(7, None);
    let settings = settings();
    let generator = NullGenerator::new(0).unwrap();
    let context = AnalysisContext::prepare(spectrum.clone(), None, &settings).unwrap();
    assert_eq!(context.whitening(), WhiteningMode::Diag);

    let (_, report) = context
        .significance(&generator, &PERMUTE, 2024, 10_000, &settings.correction)
        .unwrap();
    assert_eq!(report.draws, 10_000);
    assert_eq!(report.periods.len(), PERIODS.len());
    for entry in &report.periods {
        assert!(entry.p_corrected >= entry.p_raw);
        assert!(
            entry.p_corrected > 1e-3,
            "period {} looks significant under the null: {}",
            entry.period,
            entry.p_corrected
        );
        assert_eq!(entry.whitening, WhiteningMode::Diag);
        assert_eq!(entry.correction.tests, PERIODS.len());
    }
    assert!(report.p_global > 1e-3);

    let ablation = run_ablation(
        &spectrum,
        None,
        &ranges(),
        &AblationSettings {
            analysis: &settings,
            strategy: PERMUTE,
            draws: 1_000,
            master_seed: 2024,
            channel: Channel::TT,
            min_points: 50,
            phase_tolerance: PI / 2.0,
        },
        &generator,
    )
    .unwrap();
    assert_eq!(ablation.ranges.len(), 6);
    assert_eq!(ablation.consistency.executed, 5);
    assert_eq!(ablation.consistency.skipped, 1);
    assert_ne!(ablation.consistency.verdict, ConsistencyVerdict::Consistent);
}

#[test]
fn short_ranges_are_skipped_not_dropped() {
    let spectrum = flat_spectrum(8, None);
    let settings = settings();
    let generator = NullGenerator::new(2).unwrap();
    let ablation = run_ablation(
        &spectrum,
        None,
        &ranges(),
        &AblationSettings {
            analysis: &settings,
            strategy: PERMUTE,
            draws: 50,
            master_seed: 1,
            channel: Channel::TT,
            min_points: 50,
            phase_tolerance: PI / 2.0,
        },
        &generator,
    )
    .unwrap();

    let sliver = ablation.get("sliver").unwrap();
    assert_eq!(sliver.status, RangeStatus::Skipped);
    assert_eq!(sliver.samples, 12);
    assert!(sliver.significance.is_none());
    assert!(sliver.base_seed.is_none());
    assert!(sliver.reason.as_deref().unwrap().contains("below the minimum"));

    let band = ablation.get("band0").unwrap();
    assert_eq!(band.status, RangeStatus::Executed);
    assert_eq!(band.samples, 239);
    assert!(band.significance.is_some());

    // Every range gets its own substream.
    let seeds: std::collections::BTreeSet<u64> =
        ablation.ranges.iter().filter_map(|r| r.base_seed).collect();
    assert_eq!(seeds.len(), 5);

    let json = serde_json::to_value(sliver).unwrap();
    assert_eq!(json["status"], "skipped");
}

#[test]
fn injected_period_is_recovered_and_survives_correction() {
    let spectrum = flat_spectrum(7, Some((3.0, 1.0)));
    let settings = settings();
    let generator = NullGenerator::new(0).unwrap();
    let context = AnalysisContext::prepare(spectrum, None, &settings).unwrap();
    let (observed, report) = context
        .significance(&generator, &PERMUTE, 99, 2_000, &settings.correction)
        .unwrap();

    assert_eq!(observed.best_score().period, 255);
    let best = report.best_period();
    assert_eq!(best.period, 255);
    assert_eq!(best.p_raw, 0.0);
    assert!(best.at_resolution_limit);
    assert!(best.p_corrected < 0.05);
    assert_eq!(report.p_global, 0.0);
    assert!(circular_distance(best.phase, 1.0) < 0.2);
    assert!((best.amplitude - 3.0).abs() < 0.3);
}

#[test]
fn ablation_rejects_non_positive_sub_covariance_with_range_context() {
    let ell: Vec<u32> = (2..122).collect();
    let n = ell.len();
    let spectrum = Spectrum::new(
        Channel::EE,
        UnitConvention::Power,
        ell,
        vec![0.5; n],
        vec![0.0; n],
        None,
    )
    .unwrap();
    // Negative-definite on the first block only.
    let covariance =
        nalgebra::DMatrix::from_fn(n, n, |i, j| match (i == j, i < 60) {
            (true, true) => -1.0,
            (true, false) => 1.0,
            _ => 0.0,
        });
    let settings = settings();
    let err = run_ablation(
        &spectrum,
        Some(&covariance),
        &[
            AblationRange {
                name: "bad".to_string(),
                ell_min: 2,
                ell_max: 61,
            },
        ],
        &AblationSettings {
            analysis: &settings,
            strategy: PERMUTE,
            draws: 10,
            master_seed: 3,
            channel: Channel::EE,
            min_points: 50,
            phase_tolerance: PI / 2.0,
        },
        &NullGenerator::new(1).unwrap(),
    )
    .unwrap_err();
    assert_eq!(err.family(), "numerical");
    assert_eq!(err.info().context.get("range").map(String::as_str), Some("bad"));
}
