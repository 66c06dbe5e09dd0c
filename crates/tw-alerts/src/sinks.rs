//! Notification transports and priority routing with retry.
//!
//! Sinks receive immutable alert snapshots by value. Each configured sink
//! takes alerts at or above its priority. A failed delivery is rescheduled
//! with bounded exponential backoff; after `retry.max` failed attempts the
//! delivery is given up and reported so the alert can be flagged.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use tw_types::{Alert, Counters, Priority, RetryConfig, SinkConfig, SinkError, TransportKind};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);
const JITTER_FACTOR: f64 = 0.1;

pub trait AlertSink: Send {
    fn name(&self) -> &str;
    fn deliver(&mut self, alert: &Alert) -> Result<(), SinkError>;
}

/// One JSON line per alert on standard error.
pub struct StderrSink;

impl AlertSink for StderrSink {
    fn name(&self) -> &str {
        "stderr"
    }

    fn deliver(&mut self, alert: &Alert) -> Result<(), SinkError> {
        let line = serde_json::to_string(alert).map_err(|e| transport("stderr", e))?;
        let mut err = io::stderr().lock();
        writeln!(err, "{}", line).map_err(|e| transport("stderr", e))
    }
}

/// POSTs the alert as JSON.
pub struct WebhookSink {
    name: String,
    url: String,
    client: reqwest::blocking::Client,
}

impl WebhookSink {
    pub fn new(url: &str) -> Result<Self, SinkError> {
        let name = format!("webhook:{}", url);
        let client = reqwest::blocking::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| transport(&name, e))?;
        Ok(Self {
            name,
            url: url.to_string(),
            client,
        })
    }
}

impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, alert: &Alert) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .map_err(|e| transport(&self.name, e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(transport(&self.name, format!("status {}", response.status())))
        }
    }
}

/// Appends alerts as JSON lines to a file.
pub struct FileSink {
    name: String,
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let name = format!("journal:{}", path.display());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| transport(&name, e))?;
        Ok(Self {
            name,
            writer: BufWriter::new(file),
        })
    }
}

impl AlertSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, alert: &Alert) -> Result<(), SinkError> {
        let line = serde_json::to_string(alert).map_err(|e| transport(&self.name, e))?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush())
            .map_err(|e| transport(&self.name, e))
    }
}

pub fn build_sink(config: &SinkConfig) -> Result<Box<dyn AlertSink>, SinkError> {
    Ok(match config.transport {
        TransportKind::Stderr => Box::new(StderrSink),
        TransportKind::Webhook => Box::new(WebhookSink::new(&config.target)?),
        TransportKind::Journal => Box::new(FileSink::open(&config.target)?),
    })
}

fn transport(sink: &str, e: impl std::fmt::Display) -> SinkError {
    SinkError::Transport {
        sink: sink.to_string(),
        message: e.to_string(),
    }
}

// --- routing ---

struct Route {
    min_priority: Priority,
    retry: RetryConfig,
    sink: Box<dyn AlertSink>,
}

struct Delivery {
    alert: Alert,
    route: usize,
    attempts: u32,
    due: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { alert_id: Uuid, sink: String },
    /// Retries exhausted.
    Failed { alert_id: Uuid, sink: String },
}

/// Result of the shutdown flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub outcomes: Vec<DeliveryOutcome>,
    /// `(alert_id, sink)` still undelivered at the deadline.
    pub abandoned: Vec<(Uuid, String)>,
}

pub struct Notifier {
    routes: Vec<Route>,
    queue: Vec<Delivery>,
    counters: Counters,
    jitter: f64,
}

impl Notifier {
    pub fn new(counters: Counters) -> Self {
        Self {
            routes: Vec::new(),
            queue: Vec::new(),
            counters,
            jitter: JITTER_FACTOR,
        }
    }

    pub fn from_config(sinks: &[SinkConfig], counters: Counters) -> Result<Self, SinkError> {
        let mut notifier = Self::new(counters);
        for config in sinks {
            notifier.add_route(config.priority, config.retry, build_sink(config)?);
        }
        Ok(notifier)
    }

    /// Deterministic backoff, for tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    pub fn add_route(&mut self, min_priority: Priority, retry: RetryConfig, sink: Box<dyn AlertSink>) {
        self.routes.push(Route {
            min_priority,
            retry,
            sink,
        });
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queues the alert for every sink routed at its priority.
    pub fn dispatch(&mut self, alert: &Alert, now: DateTime<Utc>) {
        let mut routed = 0;
        for (idx, route) in self.routes.iter().enumerate() {
            if alert.priority >= route.min_priority {
                self.queue.push(Delivery {
                    alert: alert.clone(),
                    route: idx,
                    attempts: 0,
                    due: now,
                });
                routed += 1;
            }
        }
        if routed == 0 {
            debug!(alert_id = %alert.alert_id, priority = %alert.priority, "no sink routed");
        }
    }

    /// Attempts every delivery that is due.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<DeliveryOutcome> {
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|d| d.due <= now);
        self.queue = later;
        let mut outcomes = Vec::new();
        for delivery in due {
            if let Some(outcome) = self.attempt(delivery, now) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Drains the queue ignoring backoff schedules, sleeping between rounds,
    /// until it is empty or `budget` has elapsed.
    pub fn flush(&mut self, budget: Duration) -> FlushReport {
        let deadline = Instant::now() + budget;
        let mut report = FlushReport::default();
        while !self.queue.is_empty() && Instant::now() < deadline {
            let round = std::mem::take(&mut self.queue);
            let now = Utc::now();
            for delivery in round {
                if let Some(outcome) = self.attempt(delivery, now) {
                    report.outcomes.push(outcome);
                }
            }
            if self.queue.is_empty() {
                break;
            }
            let pause = self
                .queue
                .iter()
                .map(|d| d.due - now)
                .min()
                .and_then(|d| d.to_std().ok())
                .unwrap_or(Duration::from_millis(1));
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(pause.min(remaining));
        }
        for delivery in self.queue.drain(..) {
            let sink = self.routes[delivery.route].sink.name().to_string();
            error!(alert_id = %delivery.alert.alert_id, sink = %sink, "notification abandoned at shutdown");
            report.abandoned.push((delivery.alert.alert_id, sink));
        }
        report
    }

    fn attempt(&mut self, mut delivery: Delivery, now: DateTime<Utc>) -> Option<DeliveryOutcome> {
        let route = &mut self.routes[delivery.route];
        let alert_id = delivery.alert.alert_id;
        match route.sink.deliver(&delivery.alert) {
            Ok(()) => {
                self.counters.notifications_sent.inc();
                Some(DeliveryOutcome::Delivered {
                    alert_id,
                    sink: route.sink.name().to_string(),
                })
            }
            Err(e) => {
                delivery.attempts += 1;
                if delivery.attempts >= route.retry.max {
                    self.counters.notification_failed.inc();
                    warn!(alert_id = %alert_id, attempts = delivery.attempts, error = %e, "notification failed");
                    return Some(DeliveryOutcome::Failed {
                        alert_id,
                        sink: route.sink.name().to_string(),
                    });
                }
                let delay = backoff(&route.retry, delivery.attempts, self.jitter);
                self.counters.notification_retries.inc();
                warn!(
                    alert_id = %alert_id,
                    attempt = delivery.attempts,
                    retry_in_ms = delay.num_milliseconds(),
                    error = %e,
                    "notification failed, retrying"
                );
                delivery.due = now + delay;
                self.queue.push(delivery);
                None
            }
        }
    }
}

/// `base_ms * 2^(attempts-1)`, capped at `max_delay_ms`, with +/- jitter.
fn backoff(retry: &RetryConfig, attempts: u32, jitter: f64) -> ChronoDuration {
    let exp = attempts.saturating_sub(1).min(32);
    let raw = retry.base_ms.saturating_mul(1u64 << exp).min(retry.max_delay_ms);
    let mut ms = raw as f64;
    if jitter > 0.0 && ms > 0.0 {
        let range = ms * jitter;
        ms += rand::rng().random_range(-range..=range);
    }
    ChronoDuration::milliseconds(ms.max(1.0) as i64)
}
