use criterion::{criterion_group, criterion_main, Criterion};
use mttsweep::cancel::CancellationToken;
use mttsweep::connection::local::LocalProvider;
use mttsweep::connection::Transport;
use mttsweep::endpoint::{bring_up, Endpoint};
use mttsweep::exchange::{ConnectionInfo, RegionDescriptor};
use mttsweep::sweep::layout::BucketLayout;
use mttsweep::sweep::params::{StepPolicy, SweepParams, MLX_CONNECTX};
use mttsweep::sweep::{IterationSample, SweepEngine, SweepPlan, SweepSession};

fn layout_regions() -> Vec<RegionDescriptor> {
    BucketLayout::default()
        .addresses()
        .unwrap()
        .into_iter()
        .map(|a| RegionDescriptor {
            remote_base_address: a,
            remote_key: 1,
            size_bytes: 4096,
        })
        .collect()
}

pub fn plan_bench(c: &mut Criterion) {
    let regions = layout_regions();
    let step = StepPolicy::FinePage.step(&MLX_CONNECTX);

    c.bench_function("plan over bucket layout", |b| {
        b.iter(|| SweepPlan::new(&regions, step, 1).unwrap())
    });
}

pub fn dispatch_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("Sweep dispatch");
    group.sample_size(20);

    let params = SweepParams {
        policy: StepPolicy::FinePage,
        ..Default::default()
    };
    let plan = SweepPlan::new(&layout_regions(), params.step(), params.read_len).unwrap();

    let mut transport = Transport::new(LocalProvider::new().without_history());
    let scratch = transport.register_region(4096, None).unwrap();
    let ep = Endpoint::create(&mut transport).unwrap();
    let endpoint = bring_up(&mut transport, ep, &ConnectionInfo::new(1, 1, vec![])).unwrap();
    let session = SweepSession {
        scratch,
        plan,
        endpoint,
    };
    let token = CancellationToken::new();

    group.bench_function("one iteration against the local provider", |b| {
        b.iter(|| {
            let mut samples: Vec<IterationSample> = Vec::new();
            SweepEngine::new(&mut transport, &session, &params)
                .unwrap()
                .run(&token, Some(1), &mut samples)
                .unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, plan_bench, dispatch_bench);
criterion_main!(benches);
