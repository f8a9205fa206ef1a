use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;
use towerrec::algorithms::initializer::normal;
use towerrec::algorithms::loss::{bpr, in_batch_softmax};
use towerrec::services::dataset::synthetic;
use towerrec::utils::l2_normalize_rows;
use towerrec::*;

fn bench_config(loss: LossType, deep: bool) -> Config {
    let mut config = Config::default();
    config.model.use_deep_tower = deep;
    config.training.loss = loss;
    config.training.batch_size = 256;
    config.training.seed = Some(7);
    config
}

fn unit_rows(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
    l2_normalize_rows(&normal(rows, cols, 0.0, 1.0, &mut StdRng::seed_from_u64(seed)))
}

fn benchmark_training_step(c: &mut Criterion) {
    let dataset = Arc::new(synthetic::random(943, 1682, 20, 19, 1).expect("synthetic dataset"));

    for (name, loss, deep) in [
        ("train_step_softmax_lookup", LossType::Softmax, false),
        ("train_step_bpr_lookup", LossType::Bpr, false),
        ("train_step_softmax_mlp", LossType::Softmax, true),
    ] {
        let config = bench_config(loss, deep);
        let mut trainer = Trainer::new(&config, dataset.clone()).expect("trainer");
        c.bench_function(name, |b| {
            b.iter(|| {
                black_box(trainer.step().expect("step"));
            });
        });
    }
}

fn benchmark_losses(c: &mut Criterion) {
    let users = unit_rows(256, 32, 1);
    let items = unit_rows(256, 32, 2);
    let negatives = unit_rows(256, 32, 3);

    c.bench_function("in_batch_softmax_256", |b| {
        b.iter(|| black_box(in_batch_softmax(&users, &items, 0.1).expect("softmax")));
    });

    c.bench_function("bpr_256", |b| {
        b.iter(|| black_box(bpr(&users, &items, &negatives).expect("bpr")));
    });
}

fn benchmark_retrieval(c: &mut Criterion) {
    let dataset = synthetic::random(100, 10_000, 10, 19, 3).expect("synthetic dataset");
    let mut rng = StdRng::seed_from_u64(5);
    let config = ModelConfig::default();
    let model = TwoTowerModel::from_dataset(&config, &dataset, &mut rng).expect("model");
    let exclude: HashSet<usize> = dataset.rated_items()[0].clone();

    for batch_size in [128, 512, 4096] {
        let retriever = TopKRetriever::new(batch_size);
        c.bench_function(&format!("top_k_full_catalog_chunk_{batch_size}"), |b| {
            b.iter(|| black_box(retriever.recommend(&model, 0, &exclude, 10).expect("recommend")));
        });
    }
}

criterion_group!(benches, benchmark_training_step, benchmark_losses, benchmark_retrieval);
criterion_main!(benches);
