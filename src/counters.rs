//! Running aggregates and windowed time series.
//!
//! Tasks register their counters in a [`CounterSet`] when they are created.
//! The set is the task's counter table: the service walks it to export every
//! value as `<task-name>.<counter-name>`.
//!
//! All counters take `&self` and lock internally, so several workers of the
//! same task may update one counter concurrently.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

/// Source of wall-clock seconds for [`Samples`].
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(now: f64) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: f64) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// How a series of values is reduced to one number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregate {
    Count,
    Sum,
    Average,
    Max,
    Min,
}

impl Aggregate {
    /// Name used in exported counter keys.
    pub fn suffix(&self) -> &'static str {
        match self {
            Aggregate::Count => "count",
            Aggregate::Sum => "sum",
            Aggregate::Average => "avg",
            Aggregate::Max => "max",
            Aggregate::Min => "min",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Accumulator {
    Sum(f64),
    Count(u64),
    Average { total: f64, count: u64 },
    Max(Option<f64>),
    Min(Option<f64>),
}

impl Accumulator {
    fn new(kind: Aggregate) -> Self {
        match kind {
            Aggregate::Sum => Accumulator::Sum(0.0),
            Aggregate::Count => Accumulator::Count(0),
            Aggregate::Average => Accumulator::Average {
                total: 0.0,
                count: 0,
            },
            Aggregate::Max => Accumulator::Max(None),
            Aggregate::Min => Accumulator::Min(None),
        }
    }

    fn add(&mut self, value: f64) {
        match self {
            Accumulator::Sum(sum) => *sum += value,
            Accumulator::Count(count) => *count += 1,
            Accumulator::Average { total, count } => {
                *total += value;
                *count += 1;
            }
            Accumulator::Max(max) => {
                if max.map_or(true, |m| value > m) {
                    *max = Some(value);
                }
            }
            Accumulator::Min(min) => {
                if min.map_or(true, |m| value < m) {
                    *min = Some(value);
                }
            }
        }
    }

    fn value(&self) -> Option<f64> {
        match *self {
            Accumulator::Sum(sum) => Some(sum),
            Accumulator::Count(count) => Some(count as f64),
            Accumulator::Average { count: 0, .. } => None,
            Accumulator::Average { total, count } => Some(total / count as f64),
            Accumulator::Max(v) | Accumulator::Min(v) => v,
        }
    }

    fn reset(&mut self, value: f64) {
        *self = match self {
            Accumulator::Sum(_) => Accumulator::Sum(value),
            Accumulator::Count(_) => Accumulator::Count(value.max(0.0) as u64),
            Accumulator::Average { .. } => Accumulator::Average {
                total: value,
                count: 1,
            },
            Accumulator::Max(_) => Accumulator::Max(Some(value)),
            Accumulator::Min(_) => Accumulator::Min(Some(value)),
        };
    }
}

/// A running aggregate: sum, count, average, maximum or minimum.
///
/// ```
/// use taskhost::Counter;
///
/// let c = Counter::sum();
/// c.increment();
/// c.increment_by(10.0);
/// c.add(10.0);
/// assert_eq!(c.value(), Some(21.0));
/// ```
pub struct Counter {
    kind: Aggregate,
    state: Mutex<Accumulator>,
}

impl Counter {
    pub fn new(kind: Aggregate) -> Self {
        Self {
            kind,
            state: Mutex::new(Accumulator::new(kind)),
        }
    }

    pub fn sum() -> Self {
        Self::new(Aggregate::Sum)
    }

    pub fn count() -> Self {
        Self::new(Aggregate::Count)
    }

    pub fn average() -> Self {
        Self::new(Aggregate::Average)
    }

    pub fn max() -> Self {
        Self::new(Aggregate::Max)
    }

    pub fn min() -> Self {
        Self::new(Aggregate::Min)
    }

    pub fn kind(&self) -> Aggregate {
        self.kind
    }

    pub fn add(&self, value: f64) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(value);
    }

    pub fn increment(&self) {
        self.add(1.0);
    }

    pub fn increment_by(&self, value: f64) {
        self.add(value);
    }

    /// Replaces the accumulated state so that [`Counter::value`] returns `value`.
    pub fn reset(&self, value: f64) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset(value);
    }

    /// The current reduction; `None` for an average, max or min without samples.
    pub fn value(&self) -> Option<f64> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .value()
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(v) => write!(f, "{v:?}"),
            None => f.write_str("__None__"),
        }
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("kind", &self.kind)
            .field("value", &self.value())
            .finish()
    }
}

#[derive(Debug, Default)]
struct SamplesState {
    samples: VecDeque<(f64, f64)>,
    dirty: bool,
    cache: BTreeMap<String, Option<f64>>,
    cached_at: Option<i64>,
}

/// Windowed time series exporting one counter per (aggregate, window) pair.
///
/// With types `[Average, Max]` and windows `[60, 3600]`, a series named
/// `latency` exports `latency.avg.60`, `latency.avg.3600`, `latency.max.60`
/// and `latency.max.3600`. Samples older than the widest window are dropped
/// as new ones arrive.
pub struct Samples {
    name: Option<String>,
    types: Vec<Aggregate>,
    windows: Vec<u64>,
    clock: Arc<dyn Clock>,
    state: Mutex<SamplesState>,
}

impl Samples {
    /// Empty `types` means `[Average]`, empty `windows` means `[60, 3600]`.
    pub fn new(types: &[Aggregate], windows: &[u64]) -> Self {
        let types = if types.is_empty() {
            vec![Aggregate::Average]
        } else {
            types.to_vec()
        };
        let mut windows = if windows.is_empty() {
            vec![60, 3600]
        } else {
            windows.to_vec()
        };
        windows.sort_unstable();
        windows.dedup();

        Self {
            name: None,
            types,
            windows,
            clock: Arc::new(SystemClock),
            state: Mutex::new(SamplesState {
                dirty: true,
                ..SamplesState::default()
            }),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn windows(&self) -> &[u64] {
        &self.windows
    }

    fn max_window(&self) -> f64 {
        self.windows.last().copied().unwrap_or_default() as f64
    }

    fn key(&self, kind: Aggregate, window: u64) -> String {
        match &self.name {
            Some(name) => format!("{name}.{}.{window}", kind.suffix()),
            None => format!("{}.{window}", kind.suffix()),
        }
    }

    pub fn add(&self, value: f64) {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.samples.push_back((now, value));

        let horizon = now - self.max_window();
        while state.samples.front().is_some_and(|(ts, _)| horizon > *ts) {
            state.samples.pop_front();
        }
        state.dirty = true;
    }

    /// Every exported key with its current value.
    ///
    /// Samples are time ordered and windows sorted ascending, so a single
    /// scan from the newest sample backwards fills all windows. The result is
    /// cached until the next `add()` or until the clock enters a new second.
    pub fn counters(&self) -> BTreeMap<String, Option<f64>> {
        let now = self.clock.now();
        let second = now.floor() as i64;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.dirty && state.cached_at == Some(second) {
            return state.cache.clone();
        }

        let mut ops: Vec<Accumulator> = self.types.iter().map(|t| Accumulator::new(*t)).collect();
        let mut result = BTreeMap::new();
        let mut save = |window: u64, ops: &[Accumulator]| {
            for (kind, op) in self.types.iter().zip(ops) {
                result.insert(self.key(*kind, window), op.value());
            }
        };

        let mut windows = self.windows.iter().copied();
        let mut window = windows.next();
        for &(ts, value) in state.samples.iter().rev() {
            while let Some(w) = window {
                if now - w as f64 > ts {
                    save(w, &ops);
                    window = windows.next();
                } else {
                    break;
                }
            }
            if window.is_none() {
                break;
            }
            for op in ops.iter_mut() {
                op.add(value);
            }
        }
        while let Some(w) = window {
            save(w, &ops);
            window = windows.next();
        }

        state.cache = result.clone();
        state.cached_at = Some(second);
        state.dirty = false;
        result
    }

    /// The value of one exported key; `None` if unknown or without samples.
    pub fn counter(&self, key: &str) -> Option<f64> {
        self.counters().get(key).copied().flatten()
    }

    pub fn keys(&self) -> Vec<String> {
        self.types
            .iter()
            .flat_map(|t| self.windows.iter().map(move |w| self.key(*t, *w)))
            .collect()
    }
}

impl fmt::Debug for Samples {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Samples")
            .field("name", &self.name)
            .field("types", &self.types)
            .field("windows", &self.windows)
            .finish()
    }
}

type Callback = Arc<dyn Fn() -> Option<f64> + Send + Sync>;

#[derive(Clone)]
enum Source {
    Counter(Arc<Counter>),
    Samples(Arc<Samples>),
    Callback(Callback),
}

/// The counter table of one task or service.
#[derive(Default)]
pub struct CounterSet {
    entries: Mutex<Vec<(String, Source)>>,
}

impl CounterSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, name: String, source: Source) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = source,
            None => entries.push((name, source)),
        }
    }

    /// Registers a new counter under `name`, replacing any previous one.
    pub fn counter(&self, name: impl Into<String>, kind: Aggregate) -> Arc<Counter> {
        let counter = Arc::new(Counter::new(kind));
        self.insert(name.into(), Source::Counter(counter.clone()));
        counter
    }

    pub fn sum(&self, name: impl Into<String>) -> Arc<Counter> {
        self.counter(name, Aggregate::Sum)
    }

    /// Registers a windowed series; its keys are prefixed with `name`.
    pub fn samples(
        &self,
        name: impl Into<String>,
        types: &[Aggregate],
        windows: &[u64],
    ) -> Arc<Samples> {
        self.register_samples(name, Samples::new(types, windows))
    }

    /// Registers an already configured series, e.g. one with a custom clock.
    pub fn register_samples(&self, name: impl Into<String>, samples: Samples) -> Arc<Samples> {
        let name = name.into();
        let samples = Arc::new(samples.named(name.clone()));
        self.insert(name, Source::Samples(samples.clone()));
        samples
    }

    /// Registers a counter whose value is computed on every read.
    pub fn callback<F>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn() -> Option<f64> + Send + Sync + 'static,
    {
        self.insert(name.into(), Source::Callback(Arc::new(callback)));
    }

    /// Every exported key and value, series expanded into their windows.
    pub fn snapshot(&self) -> BTreeMap<String, Option<f64>> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut out = BTreeMap::new();
        for (name, source) in entries {
            match source {
                Source::Counter(c) => {
                    out.insert(name, c.value());
                }
                Source::Callback(f) => {
                    out.insert(name, f());
                }
                Source::Samples(s) => out.extend(s.counters()),
            }
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.snapshot().get(key).copied().flatten()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().into_keys().collect()
    }
}

impl fmt::Debug for CounterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}
