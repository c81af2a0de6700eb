use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};

use beliefstream::{
    Belief, BeliefState, ChannelSource, EngineError, EngineEvent, EngineState, ExecutionError,
    Inputs, Observation, ObservationSource, OverflowPolicy, QueueConfig, ReactiveEngine,
    ReplaySubject, RetentionPolicy, StepError, StepOutput, Value,
};

fn obs(y: f64) -> Observation {
    Observation::single("y", Value::Float(y))
}

fn follow(inputs: &Inputs, _: &BeliefState) -> Result<StepOutput, StepError> {
    let y = inputs.float("y").ok_or_else(|| StepError::new("missing y"))?;
    Ok(StepOutput::new()
        .with_belief("x", Belief::point(y))
        .with_energy(y.abs()))
}

fn build(source: Arc<dyn ObservationSource>) -> ReactiveEngine {
    ReactiveEngine::builder()
        .name("lifecycle")
        .source(source)
        .step(follow)
        .initial_belief("x", Belief::point(0.0))
        .history_capacity(64)
        .track("x", RetentionPolicy::LastOnly)
        .build()
        .unwrap()
}

fn counter(engine: &ReactiveEngine) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    engine
        .subscribe_belief("x", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    calls
}

#[test]
fn restart_resumes_without_replaying_consumed_events() {
    let subject = Arc::new(ReplaySubject::with_replay("y", false));
    let engine = build(Arc::clone(&subject) as Arc<dyn ObservationSource>);
    let calls = counter(&engine);

    engine.start().unwrap();
    subject.next(obs(1.0)).unwrap();
    subject.next(obs(2.0)).unwrap();
    assert!(engine.stop());

    subject.next(obs(99.0)).unwrap();
    assert_eq!(
        engine.feed(obs(98.0)).unwrap_err(),
        EngineError::Execution(ExecutionError::NotRunning)
    );
    assert_eq!(engine.belief("x"), Some(Belief::point(2.0)));

    engine.start().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    subject.next(obs(3.0)).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.belief("x"), Some(Belief::point(3.0)));
    assert_eq!(engine.history_len("x").unwrap(), 3);
}

#[test]
fn restart_on_replay_source_sees_its_replay() {
    let subject = Arc::new(ReplaySubject::new("y"));
    let engine = build(Arc::clone(&subject) as Arc<dyn ObservationSource>);
    let calls = counter(&engine);

    engine.start().unwrap();
    subject.next(obs(1.0)).unwrap();
    engine.stop();
    engine.start().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.history_len("x").unwrap(), 2);
}

#[test]
fn start_twice_and_stop_twice() {
    let subject = Arc::new(ReplaySubject::new("y"));
    let engine = build(Arc::clone(&subject) as Arc<dyn ObservationSource>);

    engine.start().unwrap();
    assert_eq!(
        engine.start().unwrap_err(),
        EngineError::Execution(ExecutionError::AlreadyRunning)
    );
    assert_eq!(subject.listener_count(), 1);

    assert!(engine.stop());
    assert!(!engine.stop());
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(subject.listener_count(), 0);
}

#[test]
fn stop_inside_listener_suppresses_rest_of_pass() {
    let subject = Arc::new(ReplaySubject::with_replay("y", false));
    let engine = Arc::new(build(Arc::clone(&subject) as Arc<dyn ObservationSource>));

    let slot: Arc<Mutex<Option<Arc<ReactiveEngine>>>> = Arc::new(Mutex::new(None));
    let s = Arc::clone(&slot);
    let stopped = Arc::new(AtomicBool::new(false));
    let st = Arc::clone(&stopped);
    engine
        .subscribe_belief("x", move |_| {
            let engine = s.lock().unwrap().clone();
            if let Some(engine) = engine {
                st.store(engine.stop(), Ordering::SeqCst);
            }
            Ok(())
        })
        .unwrap();
    let later = counter(&engine);

    let events = Arc::new(Mutex::new(Vec::new()));
    let ev = Arc::clone(&events);
    engine.subscribe_events(move |e| {
        ev.lock().unwrap().push(*e);
        Ok(())
    });

    *slot.lock().unwrap() = Some(Arc::clone(&engine));
    engine.start().unwrap();
    engine.feed(obs(1.0)).unwrap();

    assert!(stopped.load(Ordering::SeqCst));
    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.belief("x"), Some(Belief::point(1.0)));
    assert_eq!(engine.history_len("x").unwrap(), 1);

    let events = events.lock().unwrap();
    assert_eq!(events.last(), Some(&EngineEvent::AfterStop));

    slot.lock().unwrap().take();
}

#[test]
fn stop_waits_for_in_flight_pass_and_discards_it() {
    let subject = Arc::new(ReplaySubject::with_replay("y", false));
    let (started_tx, started_rx) = bounded::<()>(1);
    let engine = Arc::new(
        ReactiveEngine::builder()
            .source(Arc::clone(&subject) as Arc<dyn ObservationSource>)
            .step(move |inputs: &Inputs, _: &BeliefState| -> Result<StepOutput, StepError> {
                let _ = started_tx.try_send(());
                thread::sleep(Duration::from_millis(100));
                follow(inputs, &BeliefState::new())
            })
            .initial_belief("x", Belief::point(0.0))
            .history_capacity(8)
            .track("x", RetentionPolicy::LastOnly)
            .build()
            .unwrap(),
    );
    let calls = counter(&engine);
    engine.start().unwrap();

    let feeder = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.feed(obs(5.0)))
    };
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(engine.stop());

    let history_at_stop = engine.history_len("x").unwrap();
    feeder.join().unwrap().unwrap();
    thread::sleep(Duration::from_millis(20));

    assert_eq!(history_at_stop, 0);
    assert_eq!(engine.history_len("x").unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.belief("x"), Some(Belief::point(0.0)));
    assert_eq!(engine.stats().discarded, 1);
}

#[test]
fn listener_failures_are_isolated() {
    let subject = Arc::new(ReplaySubject::with_replay("y", false));
    let engine = build(Arc::clone(&subject) as Arc<dyn ObservationSource>);

    engine
        .subscribe_belief("x", |_| Err("rejected".to_string()))
        .unwrap();
    engine
        .subscribe_belief("x", |_| panic!("listener blew up"))
        .unwrap();
    let calls = counter(&engine);

    let faults = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::clone(&faults);
    engine.subscribe_errors(move |fault| {
        f.lock().unwrap().push(fault.error.clone());
        Ok(())
    });
    engine.subscribe_errors(|_| Err("error listener also fails".to_string()));

    engine.start().unwrap();
    engine.feed(obs(1.0)).unwrap();
    engine.feed(obs(2.0)).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.belief("x"), Some(Belief::point(2.0)));
    assert!(engine.is_running());

    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 4);
    assert!(faults
        .iter()
        .all(|e| matches!(e, ExecutionError::ListenerFailure { .. })));
    let ExecutionError::ListenerFailure { message, .. } = &faults[1] else {
        panic!("expected listener failure");
    };
    assert!(message.contains("listener blew up"));

    // 4 belief listener failures plus 4 failed error-listener calls.
    assert_eq!(engine.stats().listener_failures, 8);
}

#[test]
fn concurrent_feeds_are_serialized() {
    let subject = Arc::new(ReplaySubject::with_replay("y", false));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicBool::new(false));
    let (i, o) = (Arc::clone(&in_flight), Arc::clone(&overlap));

    let engine = Arc::new(
        ReactiveEngine::builder()
            .source(Arc::clone(&subject) as Arc<dyn ObservationSource>)
            .step(move |inputs: &Inputs, beliefs: &BeliefState| -> Result<StepOutput, StepError> {
                if i.fetch_add(1, Ordering::SeqCst) != 0 {
                    o.store(true, Ordering::SeqCst);
                }
                thread::yield_now();
                let out = follow(inputs, beliefs);
                i.fetch_sub(1, Ordering::SeqCst);
                out
            })
            .initial_belief("x", Belief::point(0.0))
            .build()
            .unwrap(),
    );

    let sequences = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&sequences);
    engine
        .subscribe_belief("x", move |u| {
            s.lock().unwrap().push(u.sequence);
            Ok(())
        })
        .unwrap();
    engine.start().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for n in 0..50 {
                    engine.feed(obs(f64::from(t * 100 + n))).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(!overlap.load(Ordering::SeqCst));
    let sequences = sequences.lock().unwrap();
    assert_eq!(sequences.len(), 200);
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(engine.stats().processed, 200);
}

#[test]
fn channel_source_drives_engine() {
    let (tx, rx) = unbounded();
    let source = Arc::new(ChannelSource::spawn("sensor", rx, false).unwrap());
    let engine = build(Arc::clone(&source) as Arc<dyn ObservationSource>);
    engine.start().unwrap();

    let producers: Vec<_> = (0..2)
        .map(|p| {
            let tx = tx.clone();
            thread::spawn(move || {
                for n in 0..10 {
                    tx.send(obs(f64::from(p * 10 + n))).unwrap();
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }
    drop(tx);

    assert_eq!(source.join().unwrap(), 20);
    assert_eq!(engine.history_len("x").unwrap(), 20);
    assert_eq!(engine.stats().processed, 20);
}

fn blocking_engine(queue: QueueConfig) -> (Arc<ReactiveEngine>, crossbeam_channel::Receiver<()>, crossbeam_channel::Sender<()>) {
    let subject = Arc::new(ReplaySubject::with_replay("y", false));
    let (started_tx, started_rx) = unbounded::<()>();
    let (gate_tx, gate_rx) = unbounded::<()>();
    let engine = ReactiveEngine::builder()
        .source(subject as Arc<dyn ObservationSource>)
        .step(move |inputs: &Inputs, beliefs: &BeliefState| -> Result<StepOutput, StepError> {
            let _ = started_tx.send(());
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            follow(inputs, beliefs)
        })
        .initial_belief("x", Belief::point(0.0))
        .queue(queue)
        .build()
        .unwrap();
    (Arc::new(engine), started_rx, gate_tx)
}

#[test]
fn full_queue_drops_newest() {
    let (engine, started, gate) = blocking_engine(QueueConfig {
        capacity: Some(1),
        overflow: OverflowPolicy::DropNewest,
    });
    let faults = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::clone(&faults);
    engine.subscribe_errors(move |fault| {
        f.lock().unwrap().push(fault.error.clone());
        Ok(())
    });
    engine.start().unwrap();

    let drainer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.feed(obs(1.0)))
    };
    started.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(engine.feed(obs(2.0)).unwrap(), 1);
    assert_eq!(
        engine.feed(obs(3.0)).unwrap_err(),
        EngineError::Execution(ExecutionError::QueueFull { capacity: 1 })
    );

    gate.send(()).unwrap();
    gate.send(()).unwrap();
    drainer.join().unwrap().unwrap();

    assert_eq!(engine.belief("x"), Some(Belief::point(2.0)));
    let stats = engine.stats();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.dropped, 1);
    assert_eq!(
        *faults.lock().unwrap(),
        vec![ExecutionError::QueueFull { capacity: 1 }]
    );
}

#[test]
fn full_queue_drops_oldest() {
    let (engine, started, gate) = blocking_engine(QueueConfig {
        capacity: Some(1),
        overflow: OverflowPolicy::DropOldest,
    });
    engine.start().unwrap();

    let drainer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.feed(obs(1.0)))
    };
    started.recv_timeout(Duration::from_secs(5)).unwrap();

    engine.feed(obs(2.0)).unwrap();
    engine.feed(obs(3.0)).unwrap();

    gate.send(()).unwrap();
    gate.send(()).unwrap();
    drainer.join().unwrap().unwrap();

    assert_eq!(engine.belief("x"), Some(Belief::point(3.0)));
    let stats = engine.stats();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.dropped, 1);
}

#[test]
fn history_before_first_start_is_an_error() {
    let subject = Arc::new(ReplaySubject::new("y"));
    let engine = build(Arc::clone(&subject) as Arc<dyn ObservationSource>);
    assert_eq!(
        engine.history("x").unwrap_err(),
        EngineError::Execution(ExecutionError::NeverStarted)
    );
    engine.start().unwrap();
    engine.stop();
    assert!(engine.history("x").unwrap().is_empty());
}
