use super::{get_store, random_walk};
use criterion::{black_box, criterion_group, Criterion};
use quadtrail_storage::trace::{Error, Quadrant};

fn bench_runs(c: &mut Criterion) {
    for n in [1_000, 10_000] {
        // Populate the trail
        let mut store = get_store();
        for fix in random_walk(n) {
            match store.record_fix(&fix) {
                Ok(_) | Err(Error::RouterFull(_, _)) => {}
                Err(err) => panic!("failed to record fix: {err}"),
            }
        }

        c.bench_function(&format!("{}/n={}", module_path!(), n), |b| {
            b.iter(|| {
                for x in -3..=3 {
                    for y in -3..=3 {
                        black_box(store.runs(Quadrant::new(x, y)).unwrap());
                    }
                }
            });
        });
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_runs
}
