use criterion::{black_box, criterion_group, criterion_main, Criterion};
use egobox_bcm::{Blocker, CovSpec, EvalOptions, MultiSharedBcm, Observations};
use ndarray::{Array, Array2};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

fn grid_centers(n: usize) -> Array2<f64> {
    let step = 1. / n as f64;
    Array2::from_shape_fn((n * n, 2), |(k, d)| {
        let idx = if d == 0 { k % n } else { k / n };
        (idx as f64 + 0.5) * step
    })
}

fn criterion_bcm(c: &mut Criterion) {
    let grids = vec![2, 4, 6];
    let nt = 600;

    let mut group = c.benchmark_group("bcm");
    group.sample_size(20);
    for n in grids {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x = Array::random_using((nt, 2), Uniform::new(0., 1.), &mut rng);
        let y = x.map_axis(ndarray::Axis(1), |p| (6. * p[0]).sin() * (4. * p[1]).cos());
        let y = y.into_shape((nt, 1)).unwrap();
        let blocker = Blocker::new(grid_centers(n)).unwrap();
        let (bcm, _) = MultiSharedBcm::params(CovSpec::squared_exponential(0.2, 1., 0.01))
            .geometric_neighbors(grid_centers(n), true)
            .build_blocked(&blocker, &x, &Observations::Raw(y))
            .unwrap();

        group.bench_function(format!("bcm-serial-{}x{}", n, n), |b| {
            b.iter(|| black_box(bcm.evaluate(&EvalOptions::default())))
        });
        group.bench_function(format!("bcm-parallel-{}x{}", n, n), |b| {
            b.iter(|| {
                black_box(bcm.evaluate(&EvalOptions {
                    parallel: true,
                    ..Default::default()
                }))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_bcm);
criterion_main!(benches);
