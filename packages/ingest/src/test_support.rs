//! Deterministic in-process [`EventSource`] for pipeline tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use eventsync_source::{EventSource, EventStream, SourceError};
use eventsync_source_models::{FetchFilters, RawEvent};
use futures::{FutureExt as _, StreamExt as _, stream};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Error,
    Panic,
}

#[derive(Debug)]
struct Injection {
    from: NaiveDate,
    to: NaiveDate,
    fault: Fault,
    /// `None` fails forever.
    remaining: Option<usize>,
}

/// Emits `events_per_day` events for every day of the requested range.
///
/// Ranges overlapping an injected fault fail with HTTP 503 (after
/// emitting one event) or panic.
pub struct StubSource {
    events_per_day: usize,
    omit_time: bool,
    reject_credentials: bool,
    delay: Option<Duration>,
    injections: Mutex<Vec<Injection>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

impl StubSource {
    pub fn new(events_per_day: usize) -> Self {
        Self {
            events_per_day,
            omit_time: false,
            reject_credentials: false,
            delay: None,
            injections: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    fn inject(self, from: &str, to: &str, fault: Fault, remaining: Option<usize>) -> Self {
        self.injections.lock().unwrap().push(Injection {
            from: date(from),
            to: date(to),
            fault,
            remaining,
        });
        self
    }

    /// Every request overlapping `[from, to]` fails.
    pub fn fail_range(self, from: &str, to: &str) -> Self {
        self.inject(from, to, Fault::Error, None)
    }

    /// The first `times` requests overlapping `[from, to]` fail.
    pub fn fail_range_times(self, from: &str, to: &str, times: usize) -> Self {
        self.inject(from, to, Fault::Error, Some(times))
    }

    /// Every request overlapping `[from, to]` panics.
    pub fn panic_range(self, from: &str, to: &str) -> Self {
        self.inject(from, to, Fault::Panic, None)
    }

    /// Emits events without a `time` property.
    pub const fn without_time(mut self) -> Self {
        self.omit_time = true;
        self
    }

    /// Fails the credential pre-flight.
    pub const fn rejecting_credentials(mut self) -> Self {
        self.reject_credentials = true;
        self
    }

    /// Delays every request by `delay`.
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `stream` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most requests observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Number of events the source holds for `[from, to]`.
    pub fn expected_rows(&self, from: &str, to: &str) -> u64 {
        let days = (date(to) - date(from)).num_days() + 1;
        u64::try_from(days).unwrap() * self.events_per_day as u64
    }

    fn take_fault(&self, from: NaiveDate, to: NaiveDate) -> Option<Fault> {
        let mut injections = self.injections.lock().unwrap();
        let hit = injections
            .iter_mut()
            .find(|i| i.from <= to && from <= i.to && i.remaining != Some(0))?;
        if let Some(remaining) = &mut hit.remaining {
            *remaining -= 1;
        }
        Some(hit.fault)
    }

    fn events(&self, from: NaiveDate, to: NaiveDate) -> Vec<Result<RawEvent, SourceError>> {
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        from.iter_days()
            .take_while(|day| *day <= to)
            .flat_map(|day| {
                let base = day.and_time(noon).and_utc().timestamp();
                (0..self.events_per_day).map(move |i| {
                    let mut properties = Map::new();
                    if !self.omit_time {
                        properties.insert("time".to_string(), json!(base + i as i64));
                    }
                    properties.insert("distinct_id".to_string(), json!(format!("user-{i}")));
                    properties.insert("$insert_id".to_string(), json!(format!("{day}-{i}")));
                    properties.insert("plan".to_string(), Value::from("pro"));
                    Ok(RawEvent::new("Purchase", properties))
                })
            })
            .collect()
    }
}

#[async_trait]
impl EventSource for StubSource {
    fn name(&self) -> &str {
        "stub"
    }

    async fn preflight(&self) -> Result<(), SourceError> {
        if self.reject_credentials {
            return Err(SourceError::Auth {
                message: "invalid secret".to_string(),
            });
        }
        Ok(())
    }

    fn stream<'a>(
        &'a self,
        from: NaiveDate,
        to: NaiveDate,
        _filters: &'a FetchFilters,
    ) -> EventStream<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fault = self.take_fault(from, to);

        async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut items = self.events(from, to);
            match fault {
                None => {}
                Some(Fault::Error) => {
                    items.truncate(1);
                    items.push(Err(SourceError::Status {
                        status: 503,
                        message: "service unavailable".to_string(),
                    }));
                }
                Some(Fault::Panic) => panic!("stub source panicked for {from}..{to}"),
            }
            items
        }
        .into_stream()
        .flat_map(stream::iter)
        .boxed()
    }
}
