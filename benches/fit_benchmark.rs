// ========================================================================================
//
//                     LOG-PSPLINES MODEL CONSTRUCTION BENCHMARK
//
// ========================================================================================
//
// Measures how model construction scales with the number of knots: knot
// placement plus basis and penalty construction, and the full build including
// the Adam weight fit.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use logpsplines::basis::{DEFAULT_PENALTY_EPSILON, init_basis_and_penalty};
use logpsplines::initialisation::WeightInitConfig;
use logpsplines::knots::{KnotOptions, init_knots};
use logpsplines::{FitConfig, LogPSplines, Periodogram};
use ndarray::Array;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Exp};

/// Number of frequency bins in the simulated periodogram.
const N_FREQS: usize = 2048;
/// Knot counts to sweep.
const KNOT_COUNTS: [usize; 5] = [10, 20, 40, 80, 160];
/// Adam steps for the full build; kept short so the sweep finishes quickly.
const FIT_STEPS: usize = 500;

fn simulated_periodogram() -> Periodogram {
    let freqs = Array::linspace(0.5, 512.0, N_FREQS);
    let mut rng = StdRng::seed_from_u64(7);
    let noise = Exp::new(1.0).unwrap();
    let power = freqs.mapv(|f: f64| noise.sample(&mut rng) * 1e3 / (1.0 + (f / 30.0).powi(2)));
    Periodogram::new(freqs, power).unwrap()
}

fn bench_basis_construction(c: &mut Criterion) {
    let periodogram = simulated_periodogram();
    let options = KnotOptions::default();
    let mut group = c.benchmark_group("knots_basis_penalty");

    for &n_knots in &KNOT_COUNTS {
        group.bench_with_input(BenchmarkId::from_parameter(n_knots), &n_knots, |b, &n_knots| {
            b.iter(|| {
                let knots = init_knots(&periodogram, n_knots, &options).unwrap();
                let out = init_basis_and_penalty(
                    knots.view(),
                    3,
                    periodogram.n(),
                    2,
                    DEFAULT_PENALTY_EPSILON,
                )
                .unwrap();
                black_box(out)
            })
        });
    }
    group.finish();
}

fn bench_full_build(c: &mut Criterion) {
    let periodogram = simulated_periodogram();
    let mut group = c.benchmark_group("from_periodogram");
    group.sample_size(10);

    for &n_knots in &KNOT_COUNTS {
        let config = FitConfig {
            n_knots,
            weights: WeightInitConfig {
                num_steps: FIT_STEPS,
                ..WeightInitConfig::default()
            },
            ..FitConfig::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(n_knots), &config, |b, config| {
            b.iter(|| black_box(LogPSplines::from_periodogram(&periodogram, config, None).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_basis_construction, bench_full_build);
criterion_main!(benches);
