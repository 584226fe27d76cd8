use criterion::{criterion_group, criterion_main, Criterion};

use skillmodels_rs::data::{PanelData, PanelRecord};
use skillmodels_rs::{LikelihoodProblem, ModelSpec, ProcessedModel};

fn fixture_problem(n_obs: usize) -> LikelihoodProblem {
    let path = format!("{}/tests/fixtures/model.json", env!("CARGO_MANIFEST_DIR"));
    let json = std::fs::read_to_string(path).expect("fixture not found");
    let model = ProcessedModel::from_spec(&ModelSpec::from_json(&json).unwrap()).unwrap();

    let mut records = Vec::with_capacity(3 * n_obs);
    for i in 0..n_obs {
        for t in 0..3 {
            let mut values: Vec<(String, Option<f64>)> = (1..=9)
                .map(|m| (format!("y{}", m), Some(((i * 13 + t * 5 + m) as f64).sin())))
                .collect();
            values.push(("x1".into(), Some((i as f64 * 0.3).cos())));
            values.push(("income".into(), Some(1.0 + 0.1 * t as f64)));
            values.push(("q1".into(), Some(((i + t) as f64).sin())));
            records.push(PanelRecord {
                id: i.to_string(),
                period: t,
                values: values.into_iter().collect(),
            });
        }
    }
    let data = PanelData::from_records(&records, &model).unwrap();
    LikelihoodProblem::new(model, data).unwrap()
}

fn bench_loglike(c: &mut Criterion) {
    let problem = fixture_problem(500);
    let params = problem.template.start_values();
    c.bench_function("loglike_3_factors_2_mixtures_500_obs", |b| {
        b.iter(|| std::hint::black_box(problem.log_likelihood(&params).unwrap()))
    });
}

criterion_group!(benches, bench_loglike);
criterion_main!(benches);
