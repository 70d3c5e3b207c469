use std::f64::consts::TAU;

use comb_core::RngHandle;
use comb_data::{Channel, Spectrum, UnitConvention};
use comb_stat::{
    assess, prepare, CombEngine, CombKernel, Correction, NullGenerator, ResampleMethod,
    ScoringContext, ScoringStrategy, SignalInjection, SyntheticSpec, TemplateModel, Whitener,
    WhiteningMode, DEFAULT_MAX_CONDITION,
};
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::StandardNormal;

const PERIODS: [u32; 5] = [25, 33, 40, 51, 64];

fn spectrum(seed: u64, injected_amplitude: f64) -> Spectrum {
    let ell: Vec<u32> = (2..602).collect();
    let model: Vec<f64> = ell.iter().map(|&l| 1000.0 + 500.0 * (-(l as f64) / 300.0).exp()).collect();
    let mut rng = RngHandle::from_seed(seed);
    let observed = ell
        .iter()
        .zip(&model)
        .map(|(&l, m)| {
            let noise: f64 = rng.sample(StandardNormal);
            m + noise + injected_amplitude * (TAU * l as f64 / 40.0).cos()
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

#[test]
fn null_is_identical_across_thread_counts() {
    let spec = spectrum(11, 0.0);
    let prepared = prepare(&spec, None, DEFAULT_MAX_CONDITION).unwrap();
    let engine = CombEngine::new(spec.ell(), &PERIODS, CombKernel::Harmonic).unwrap();
    let ctx = ScoringContext::new(&spec, &prepared.whitener, &engine).unwrap();
    let strategy = ScoringStrategy::Resampled {
        method: ResampleMethod::Permute,
    };

    let single = NullGenerator::new(1).unwrap().generate(&ctx, &strategy, 99, 64).unwrap();
    let pooled = NullGenerator::new(4).unwrap().generate(&ctx, &strategy, 99, 64).unwrap();
    assert_eq!(single, pooled);
    assert_eq!(single.digest(), pooled.digest());

    let other = NullGenerator::new(4).unwrap().generate(&ctx, &strategy, 100, 64).unwrap();
    assert_ne!(single.digest(), other.digest());
    // Draw i of base b is draw i-1 of base b+1.
    assert_eq!(single.samples(0)[1], other.samples(0)[0]);
}

#[test]
fn injected_comb_is_recovered() {
    let spec = spectrum(5, 0.6);
    let prepared = prepare(&spec, None, DEFAULT_MAX_CONDITION).unwrap();
    assert_eq!(prepared.whitener.mode(), WhiteningMode::Diag);
    let engine = CombEngine::new(spec.ell(), &PERIODS, CombKernel::Harmonic).unwrap();
    let ctx = ScoringContext::new(&spec, &prepared.whitener, &engine).unwrap();
    let observed = ctx.observed().unwrap();
    assert_eq!(observed.best_score().period, 40);

    let strategy = ScoringStrategy::Resampled {
        method: ResampleMethod::SignFlip,
    };
    let null = NullGenerator::new(0).unwrap().generate(&ctx, &strategy, 1, 400).unwrap();
    let correction = Correction::bonferroni(PERIODS.len(), 1).unwrap();
    let report = assess(&observed, &null, WhiteningMode::Diag, &correction).unwrap();
    let best = report.best_period();
    assert_eq!(best.period, 40);
    assert!(best.p_corrected < 0.05);
    assert!(best.at_resolution_limit);
    assert_eq!(best.resolution, 1.0 / 400.0);
    assert_eq!(best.whitening, WhiteningMode::Diag);
    assert_eq!(report.p_global, 0.0);
}

#[test]
fn synthetic_draws_are_reproducible_and_follow_the_template() {
    let spec = spectrum(3, 0.0);
    let whitener = Whitener::diagonal(spec.sigma().unwrap()).unwrap();
    let engine = CombEngine::new(spec.ell(), &PERIODS, CombKernel::Harmonic).unwrap();
    let ctx = ScoringContext::new(&spec, &whitener, &engine).unwrap();
    let synthetic = SyntheticSpec {
        model: TemplateModel::DampedOscillator {
            baseline: 900.0,
            amplitude: 50.0,
            period: 220.0,
            damping: 800.0,
            phase: 0.3,
        },
        injection: Some(SignalInjection {
            period: 40.0,
            amplitude: 2.0,
            phase: 0.0,
        }),
    };

    let first = ctx.synthesize(&synthetic, 77).unwrap();
    let second = ctx.synthesize(&synthetic, 77).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.model(), spec.model());
    assert_eq!(first.ell(), spec.ell());
    assert_ne!(first, ctx.synthesize(&synthetic, 78).unwrap());

    let template = synthetic.model.evaluate(&spec);
    let injected = synthetic.injection.unwrap().evaluate(spec.ell());
    let noise_scale = first
        .observed()
        .iter()
        .zip(&template)
        .zip(&injected)
        .map(|((o, t), s)| (o - t - s).abs())
        .fold(0.0, f64::max);
    assert!(noise_scale < 6.0, "noise around the template reached {noise_scale}");

    let theory = SyntheticSpec {
        model: TemplateModel::Theory,
        ..synthetic
    };
    let scored = ctx
        .score_draw(&ScoringStrategy::Synthetic(theory), 77)
        .unwrap();
    assert_eq!(scored.best_score().period, 40);
}

fn flat_spectrum(level: f64) -> Spectrum {
    let ell: Vec<u32> = (2..602).collect();
    let n = ell.len();
    Spectrum::new(
        Channel::TT,
        UnitConvention::Power,
        ell,
        vec![level; n],
        vec![level; n],
        Some(vec![1.0; n]),
    )
    .unwrap()
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted[sorted.len() / 2]
}

#[test]
fn oscillating_template_moves_the_synthetic_null_at_its_period() {
    let spec = flat_spectrum(1000.0);
    let whitener = Whitener::diagonal(spec.sigma().unwrap()).unwrap();
    let engine = CombEngine::new(spec.ell(), &PERIODS, CombKernel::Harmonic).unwrap();
    let ctx = ScoringContext::new(&spec, &whitener, &engine).unwrap();
    let generator = NullGenerator::new(2).unwrap();

    let theory = ScoringStrategy::Synthetic(SyntheticSpec::default());
    let oscillator = ScoringStrategy::Synthetic(SyntheticSpec {
        model: TemplateModel::DampedOscillator {
            baseline: 1000.0,
            amplitude: 5.0,
            period: 33.0,
            damping: 1.0e6,
            phase: 0.0,
        },
        injection: None,
    });
    let flat = generator.generate(&ctx, &theory, 40, 200).unwrap();
    let moved = generator.generate(&ctx, &oscillator, 40, 200).unwrap();

    let at = PERIODS.iter().position(|&p| p == 33).unwrap();
    let flat_median = median(flat.samples(at));
    let moved_median = median(moved.samples(at));
    assert!(
        moved_median > 10.0 * flat_median,
        "template left the period-33 null at {moved_median} against {flat_median}"
    );
    for (index, _) in PERIODS.iter().enumerate().filter(|(i, _)| *i != at) {
        assert!(median(moved.samples(index)) < moved_median);
    }
    assert_ne!(flat.digest(), moved.digest());
}

#[test]
fn covariance_context_generates_a_synthetic_null() {
    let spec = spectrum(21, 0.0);
    let n = spec.len();
    let cov = DMatrix::from_fn(n, n, |i, j| 0.5f64.powi((i as i32 - j as i32).abs()));
    let prepared = prepare(&spec, Some(&cov), DEFAULT_MAX_CONDITION).unwrap();
    assert_eq!(prepared.whitener.mode(), WhiteningMode::Cov);
    assert!(!prepared.covariance.as_ref().unwrap().diagnostics.regularized);

    let engine = CombEngine::new(spec.ell(), &PERIODS, CombKernel::Folded { bins: 6 }).unwrap();
    let ctx = ScoringContext::new(&spec, &prepared.whitener, &engine).unwrap();
    let strategy = ScoringStrategy::Synthetic(SyntheticSpec::default());
    let null = NullGenerator::new(2).unwrap().generate(&ctx, &strategy, 5, 50).unwrap();
    assert_eq!(null.per_period.len(), PERIODS.len());
    assert!(null.best.iter().all(|value| value.is_finite() && *value >= 0.0));

    let observed = ctx.observed().unwrap();
    let correction = Correction::bonferroni(PERIODS.len(), 2).unwrap();
    let report = assess(&observed, &null, WhiteningMode::Cov, &correction).unwrap();
    for entry in &report.periods {
        assert!((0.0..=1.0).contains(&entry.p_raw));
        assert!(entry.p_corrected >= entry.p_raw);
        assert_eq!(entry.correction.tests, 10);
    }
}

#[test]
fn real_model_cannot_be_a_null() {
    let spec = spectrum(1, 0.0);
    let whitener = Whitener::identity(spec.len());
    let engine = CombEngine::new(spec.ell(), &PERIODS, CombKernel::Harmonic).unwrap();
    let ctx = ScoringContext::new(&spec, &whitener, &engine).unwrap();
    let err = NullGenerator::new(1)
        .unwrap()
        .generate(&ctx, &ScoringStrategy::RealModel, 0, 10)
        .unwrap_err();
    assert_eq!(err.family(), "config");
}

#[test]
fn strategy_serializes_with_a_tag() {
    let strategy = ScoringStrategy::Resampled {
        method: ResampleMethod::SignFlip,
    };
    let json = serde_json::to_string(&strategy).unwrap();
    assert_eq!(json, r#"{"strategy":"resampled","method":"sign-flip"}"#);
    let back: ScoringStrategy = serde_json::from_str(&json).unwrap();
    assert_eq!(back, strategy);
}
