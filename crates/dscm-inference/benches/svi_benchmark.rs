use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use dscm_inference::{ExperimentConfig, Overrides, ScmConfig, ScmKind, Svi, build_scm};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::hint::black_box;

fn config(side: usize) -> ExperimentConfig {
    ExperimentConfig {
        scm: ScmConfig {
            kind: ScmKind::Conditional,
            latent_dim: 8,
            enc_filters: "32,16".to_string(),
            dec_filters: "16,32".to_string(),
            num_convolutions: 1,
            image_height: side,
            image_width: side,
            flow_hidden: vec![8, 16],
            ..ScmConfig::default()
        },
        num_svi_particles: 1,
        ..ExperimentConfig::default()
    }
}

fn bench_svi_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("svi_step");
    group.sample_size(20);

    for side in [4usize, 8, 16] {
        let cfg = config(side);
        let mut svi = Svi::new(build_scm(&cfg.scm).unwrap(), &cfg).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let obs = svi.model().sample(16, &Overrides::new(), &mut rng).unwrap().observation().unwrap();

        group.bench_with_input(BenchmarkId::new("conditional", side * side), &obs, |b, obs| {
            b.iter(|| black_box(svi.step(obs, &mut rng).unwrap()))
        });
    }

    group.finish();
}

fn bench_counterfactual(c: &mut Criterion) {
    let cfg = config(8);
    let scm = build_scm(&cfg.scm).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let obs = scm.sample(16, &Overrides::new(), &mut rng).unwrap().observation().unwrap().to_values();
    let condition = dscm_inference::Values::new().with("sex", nalgebra::DMatrix::zeros(1, 1));

    let mut group = c.benchmark_group("counterfactual");
    for particles in [1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::new("sex_intervention", particles), &particles, |b, &k| {
            b.iter(|| black_box(scm.counterfactual(&obs, &condition, k, &mut rng).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_svi_step, bench_counterfactual);
criterion_main!(benches);
