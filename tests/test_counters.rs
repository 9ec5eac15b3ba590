use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use taskhost::{Aggregate, Counter, CounterSet, ManualClock, Samples};

#[test]
fn test_sum_and_reset() {
    let sum = Counter::sum();
    assert_eq!(sum.value(), Some(0.0));
    sum.increment();
    sum.increment_by(10.0);
    sum.add(10.0);
    assert_eq!(sum.value(), Some(21.0));
    assert_eq!(sum.to_string(), "21.0");

    sum.reset(0.5);
    assert_eq!(sum.value(), Some(0.5));
}

#[test]
fn test_count_ignores_values() {
    let count = Counter::count();
    assert_eq!(count.value(), Some(0.0));
    count.add(7.5);
    count.add(-3.0);
    assert_eq!(count.value(), Some(2.0));

    count.reset(4.9);
    assert_eq!(count.value(), Some(4.0));
}

#[test]
fn test_average_max_min() {
    let average = Counter::average();
    let max = Counter::max();
    let min = Counter::min();
    for counter in [&average, &max, &min] {
        assert_eq!(counter.value(), None);
        assert_eq!(counter.to_string(), "__None__");
    }

    for value in [4.0, 1.0, 7.0] {
        average.add(value);
        max.add(value);
        min.add(value);
    }
    assert_eq!(average.value(), Some(4.0));
    assert_eq!(max.value(), Some(7.0));
    assert_eq!(min.value(), Some(1.0));

    average.reset(2.0);
    average.add(4.0);
    assert_eq!(average.value(), Some(3.0));
    assert_eq!(max.kind(), Aggregate::Max);
}

#[test]
fn test_samples_respect_windows() {
    let start = 1_700_000_000.0;
    let clock = Arc::new(ManualClock::new(start));
    let samples = Samples::new(&[Aggregate::Count, Aggregate::Sum], &[1000, 100])
        .named("requests")
        .with_clock(clock.clone());
    assert_eq!(samples.windows(), [100, 1000]);

    samples.add(1.0);
    clock.set(start + 10.0);
    samples.add(2.0);

    clock.set(start + 101.0);
    let counters = samples.counters();
    assert_eq!(counters["requests.count.100"], Some(1.0));
    assert_eq!(counters["requests.sum.100"], Some(2.0));
    assert_eq!(counters["requests.count.1000"], Some(2.0));
    assert_eq!(counters["requests.sum.1000"], Some(3.0));

    clock.set(start + 1011.5);
    assert_eq!(samples.counter("requests.count.1000"), Some(0.0));
    assert_eq!(samples.counter("requests.sum.100"), Some(0.0));
    assert_eq!(samples.counter("requests.avg.100"), None);
}

#[test]
fn test_samples_average_without_values_is_none() {
    let clock = Arc::new(ManualClock::new(100.0));
    let samples = Samples::new(&[], &[]).with_clock(clock.clone());
    assert_eq!(
        samples.keys(),
        ["avg.60", "avg.3600"].map(String::from).to_vec()
    );
    assert_eq!(samples.counter("avg.60"), None);

    samples.add(3.0);
    samples.add(5.0);
    clock.advance(1.0);
    assert_eq!(samples.counter("avg.60"), Some(4.0));
}

#[test]
fn test_counter_set_snapshot() {
    let set = CounterSet::new();
    let hits = set.sum("hits");
    let depth = Arc::new(AtomicU64::new(3));
    let read = depth.clone();
    set.callback("depth", move || Some(read.load(Ordering::SeqCst) as f64));
    let clock = Arc::new(ManualClock::new(50.0));
    let latency = set.register_samples(
        "latency",
        Samples::new(&[Aggregate::Max], &[60]).with_clock(clock),
    );

    hits.increment_by(2.0);
    latency.add(12.5);
    depth.store(5, Ordering::SeqCst);

    let snapshot = set.snapshot();
    assert_eq!(
        snapshot.keys().collect::<Vec<_>>(),
        ["depth", "hits", "latency.max.60"]
    );
    assert_eq!(snapshot["hits"], Some(2.0));
    assert_eq!(snapshot["depth"], Some(5.0));
    assert_eq!(set.get("latency.max.60"), Some(12.5));
    assert_eq!(set.get("missing"), None);

    let replaced = set.sum("hits");
    assert_eq!(replaced.value(), Some(0.0));
    assert_eq!(set.names().len(), 3);
}
