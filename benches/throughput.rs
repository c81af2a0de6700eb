use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use beliefstream::{
    AutoUpdateRule, Belief, BeliefState, Inputs, Observation, ObservationSource, ReactiveEngine,
    ReplaySubject, RetentionPolicy, StepError, StepOutput, Value,
};

// Conjugate-ish update of a Gaussian mean towards the observation.
fn gaussian_step(inputs: &Inputs, beliefs: &BeliefState) -> Result<StepOutput, StepError> {
    let y = inputs.float("y").ok_or_else(|| StepError::new("missing y"))?;
    let (mean, variance) = match beliefs.get("x") {
        Some(Belief::Gaussian { mean, variance }) => (*mean, *variance),
        _ => (0.0, 1.0),
    };
    let noise = inputs.float("noise").unwrap_or(1.0);
    let gain = variance / (variance + noise);
    let next_mean = mean + gain * (y - mean);
    let next_var = (1.0 - gain) * variance;
    Ok(StepOutput::new()
        .with_belief("x", Belief::gaussian(next_mean, next_var))
        .with_energy((y - next_mean).powi(2)))
}

fn make_engine(
    subject: &Arc<ReplaySubject>,
    iterations: u32,
    policy: RetentionPolicy,
) -> ReactiveEngine {
    let engine = ReactiveEngine::builder()
        .name("bench")
        .source(Arc::clone(subject) as Arc<dyn ObservationSource>)
        .step(gaussian_step)
        .initial_belief("x", Belief::gaussian(0.0, 10.0))
        .initial_belief("tau", Belief::gamma(2.0, 2.0))
        .autoupdate(AutoUpdateRule::mean("noise", "tau"))
        .iterations(iterations)
        .track_energy(true)
        .history_capacity(1024)
        .track("x", policy)
        .build()
        .unwrap();
    engine.start().unwrap();
    engine
}

fn bench_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("pass");
    group.throughput(Throughput::Elements(1));

    for iterations in [1u32, 10, 50] {
        for (label, policy) in [
            ("last_only", RetentionPolicy::LastOnly),
            ("every_iteration", RetentionPolicy::EveryIteration),
        ] {
            let subject = Arc::new(ReplaySubject::with_replay("y", false));
            let engine = make_engine(&subject, iterations, policy);
            let mut y = 0.0f64;
            group.bench_with_input(BenchmarkId::new(label, iterations), &iterations, |b, _| {
                b.iter(|| {
                    y += 0.1;
                    subject.next(Observation::single("y", Value::Float(y))).unwrap();
                });
            });
            engine.stop();
        }
    }
    group.finish();
}

fn bench_listeners(c: &mut Criterion) {
    let subject = Arc::new(ReplaySubject::with_replay("y", false));
    let engine = make_engine(&subject, 1, RetentionPolicy::LastOnly);
    for _ in 0..8 {
        engine.subscribe_belief("x", |_| Ok(())).unwrap();
    }
    engine.subscribe_energy(|_| Ok(())).unwrap();
    engine.subscribe_events(|_| Ok(()));

    c.bench_function("pass/with_listeners", |b| {
        b.iter(|| engine.feed(Observation::single("y", 1.0)).unwrap());
    });
    engine.stop();
}

criterion_group!(benches, bench_pass, bench_listeners);
criterion_main!(benches);
