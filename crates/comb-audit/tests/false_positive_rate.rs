use comb_audit::{calibrate, AnalysisContext, AnalysisSettings, CalibrationSpec};
use comb_data::{Channel, Spectrum, UnitConvention};
use comb_stat::{
    CombKernel, Correction, NullGenerator, ResampleMethod, ScoringStrategy, SignalInjection,
    SyntheticSpec, TemplateModel, DEFAULT_MAX_CONDITION,
};

const OSCILLATOR: TemplateModel = TemplateModel::DampedOscillator {
    baseline: 10.0,
    amplitude: 4.0,
    period: 220.0,
    damping: 400.0,
    phase: 0.3,
};

fn context_with_model(
    periods: &[u32],
    model: impl Fn(&[u32]) -> Vec<f64>,
) -> (AnalysisContext, AnalysisSettings) {
    let ell: Vec<u32> = (30..230).collect();
    let n = ell.len();
    let theory = model(&ell);
    let spectrum = Spectrum::new(
        Channel::TT,
        UnitConvention::Power,
        ell,
        theory.clone(),
        theory,
        Some(vec![0.5; n]),
    )
    .unwrap();
    let settings = AnalysisSettings {
        periods: periods.to_vec(),
        kernel: CombKernel::Harmonic,
        max_condition: DEFAULT_MAX_CONDITION,
        correction: Correction::bonferroni(periods.len(), 1).unwrap(),
    };
    let context = AnalysisContext::prepare(spectrum, None, &settings).unwrap();
    (context, settings)
}

fn context(periods: &[u32]) -> (AnalysisContext, AnalysisSettings) {
    context_with_model(periods, |ell| vec![10.0; ell.len()])
}

#[test]
fn zero_signal_rate_matches_alpha() {
    // Theory column equal to the template: every trial is pure noise.
    let (context, settings) = context_with_model(&[8, 16, 32], |ell| {
        let grid = Spectrum::new(
            Channel::TT,
            UnitConvention::Power,
            ell.to_vec(),
            vec![0.0; ell.len()],
            vec![0.0; ell.len()],
            None,
        )
        .unwrap();
        OSCILLATOR.evaluate(&grid)
    });
    let spec = CalibrationSpec {
        trials: 1000,
        draws: 199,
        alpha: 0.01,
        spec: SyntheticSpec {
            model: OSCILLATOR,
            injection: None,
        },
    };
    let report = calibrate(
        &context,
        &settings,
        &spec,
        ResampleMethod::Permute,
        17,
        &NullGenerator::new(0).unwrap(),
    )
    .unwrap();

    assert_eq!(report.trials, 1000);
    assert!((report.exact_null_rate - 0.01).abs() < 1e-12);
    assert!((report.standard_error - (0.01f64 * 0.99 / 1000.0).sqrt()).abs() < 1e-15);
    assert!(matches!(report.trial_strategy, ScoringStrategy::Synthetic(_)));
    assert_eq!(
        report.null_strategy,
        ScoringStrategy::Resampled {
            method: ResampleMethod::Permute
        }
    );
    assert_eq!(report.per_period.len(), 3);
    for entry in &report.per_period {
        assert!(entry.hits > 0, "period {} never fired", entry.period);
        assert!(entry.rate > 0.0);
        assert!(
            entry.within_band,
            "period {} rate {} is {:.2} sigma from alpha",
            entry.period,
            entry.rate,
            entry.deviation_sigma
        );
    }
    assert!(report.calibrated);
    assert!(report.any_period_hits >= report.per_period.iter().map(|e| e.hits).max().unwrap());
    assert!(report.any_period_hits <= report.per_period.iter().map(|e| e.hits).sum());
}

#[test]
fn template_off_theory_is_flagged_by_calibration() {
    // Flat theory against an oscillating template at one candidate period.
    let (context, settings) = context(&[8, 16]);
    let spec = CalibrationSpec {
        trials: 40,
        draws: 99,
        alpha: 0.05,
        spec: SyntheticSpec {
            model: TemplateModel::DampedOscillator {
                baseline: 10.0,
                amplitude: 3.0,
                period: 16.0,
                damping: 1.0e6,
                phase: 0.0,
            },
            injection: None,
        },
    };
    let report = calibrate(
        &context,
        &settings,
        &spec,
        ResampleMethod::Permute,
        3,
        &NullGenerator::new(2).unwrap(),
    )
    .unwrap();
    let at_16 = report.per_period.iter().find(|e| e.period == 16).unwrap();
    assert_eq!(at_16.hits, 40);
    assert!(!at_16.within_band);
    assert!(!report.calibrated);
}

#[test]
fn calibration_is_reproducible() {
    let (context, settings) = context(&[8, 16]);
    let spec = CalibrationSpec {
        trials: 20,
        draws: 19,
        alpha: 0.1,
        spec: SyntheticSpec::default(),
    };
    let one = calibrate(
        &context,
        &settings,
        &spec,
        ResampleMethod::SignFlip,
        5,
        &NullGenerator::new(1).unwrap(),
    )
    .unwrap();
    let two = calibrate(
        &context,
        &settings,
        &spec,
        ResampleMethod::SignFlip,
        5,
        &NullGenerator::new(3).unwrap(),
    )
    .unwrap();
    assert_eq!(one, two);
}

#[test]
fn calibration_refuses_injected_signal() {
    let (context, settings) = context(&[8]);
    let spec = CalibrationSpec {
        spec: SyntheticSpec {
            model: TemplateModel::Theory,
            injection: Some(SignalInjection {
                period: 8.0,
                amplitude: 1.0,
                phase: 0.0,
            }),
        },
        ..CalibrationSpec::default()
    };
    let err = calibrate(
        &context,
        &settings,
        &spec,
        ResampleMethod::Permute,
        0,
        &NullGenerator::new(1).unwrap(),
    )
    .unwrap_err();
    assert_eq!(err.info().code, "calibration_injection");
    assert_eq!(err.family(), "config");
}
