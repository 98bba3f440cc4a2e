//! Measurement identifiers, gauge baselines and the statsd sink

use crate::config::StatsdTarget;
use crate::error::MetricsError;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::UdpSocket;
use tracing::{debug, error};

/// Destination for raw measurements.
///
/// Implementations must not block: they are called from the AMI read loop.
pub trait MetricsSink: Send + Sync {
    /// Set a gauge to an absolute value.
    fn gauge(&self, id: &str, value: u64) -> Result<(), MetricsError>;
    /// Move a gauge by `delta`.
    fn gauge_delta(&self, id: &str, delta: i64) -> Result<(), MetricsError>;
    fn incr(&self, id: &str, count: u64) -> Result<(), MetricsError>;
    fn timing(&self, id: &str, millis: u64) -> Result<(), MetricsError>;
}

/// Sink used when metrics are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn gauge(&self, _id: &str, _value: u64) -> Result<(), MetricsError> {
        Ok(())
    }

    fn gauge_delta(&self, _id: &str, _delta: i64) -> Result<(), MetricsError> {
        Ok(())
    }

    fn incr(&self, _id: &str, _count: u64) -> Result<(), MetricsError> {
        Ok(())
    }

    fn timing(&self, _id: &str, _millis: u64) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Fire-and-forget statsd client over UDP.
///
/// Each measurement is one datagram, sent with `try_send`; a full socket
/// buffer surfaces as an error instead of blocking the caller.
#[derive(Debug)]
pub struct StatsdSink {
    socket: UdpSocket,
    prefix: String,
}

impl StatsdSink {
    /// Resolve `target` and connect a UDP socket to it.
    pub async fn connect(target: &StatsdTarget) -> Result<Self, MetricsError> {
        let remote = tokio::net::lookup_host(target.address())
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {}", target.address()),
                )
            })?;
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket
            .connect(remote)
            .await?;
        debug!("statsd sink connected to {}", remote);

        Ok(Self {
            socket,
            prefix: target
                .prefix
                .clone(),
        })
    }

    fn line(&self, id: &str, value: &str, kind: &str) -> String {
        let mut line = String::with_capacity(self.prefix.len() + id.len() + value.len() + 4);
        let _ = write!(line, "{}{}:{}|{}", self.prefix, id, value, kind);
        line
    }

    fn send(&self, line: String) -> Result<(), MetricsError> {
        self.socket
            .try_send(line.as_bytes())?;
        Ok(())
    }
}

impl MetricsSink for StatsdSink {
    fn gauge(&self, id: &str, value: u64) -> Result<(), MetricsError> {
        self.send(self.line(id, &value.to_string(), "g"))
    }

    fn gauge_delta(&self, id: &str, delta: i64) -> Result<(), MetricsError> {
        self.send(self.line(id, &format!("{:+}", delta), "g"))
    }

    fn incr(&self, id: &str, count: u64) -> Result<(), MetricsError> {
        self.send(self.line(id, &count.to_string(), "c"))
    }

    fn timing(&self, id: &str, millis: u64) -> Result<(), MetricsError> {
        self.send(self.line(id, &millis.to_string(), "ms"))
    }
}

/// A measurement name plus tags, rendered as `name,k1=v1,k2=v2`.
///
/// ```
/// use ami_statsd::Measure;
///
/// let m = Measure::new("concurrent").tag("trunk", "All").tag("cause", "16");
/// assert_eq!(m.identifier(), "concurrent,cause=16,trunk=All");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measure {
    name: String,
    tags: BTreeMap<String, String>,
}

impl Measure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add or replace a tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags
            .insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> String {
        MetricsEmitter::build_identifier(&self.name, &self.tags)
    }
}

/// Front end to a [`MetricsSink`] that baselines each gauge once.
///
/// statsd gauges persist on the server across restarts of this process, so
/// the first time a gauge identifier is touched it is set to an absolute 0
/// before any `+1`/`-1` delta is sent. The seen-set is cleared only by
/// [`reset_all`](Self::reset_all).
pub struct MetricsEmitter {
    sink: Arc<dyn MetricsSink>,
    gauges: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for MetricsEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsEmitter")
            .field("gauges", &self.gauge_count())
            .finish()
    }
}

impl MetricsEmitter {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            gauges: Mutex::new(HashSet::new()),
        }
    }

    /// Emitter that discards everything.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    fn gauges(&self) -> MutexGuard<'_, HashSet<String>> {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// `name` followed by `,key=value` per tag, in key order.
    pub fn build_identifier(name: &str, tags: &BTreeMap<String, String>) -> String {
        let mut id = String::from(name);
        for (key, value) in tags {
            let _ = write!(id, ",{}={}", key, value);
        }
        id
    }

    /// Mark `id` as baselined without publishing anything.
    pub fn register_gauge(&self, id: &str) -> Result<(), MetricsError> {
        if !self
            .gauges()
            .insert(id.to_string())
        {
            return Err(MetricsError::GaugeAlreadyRegistered(id.to_string()));
        }
        Ok(())
    }

    /// Publish an absolute 0 for `id` the first time it is seen.
    ///
    /// Returns whether a baseline was published. The set stays locked while
    /// the baseline is sent so no delta for `id` can overtake it.
    pub fn ensure_gauge_baseline(&self, id: &str) -> bool {
        let mut gauges = self.gauges();
        if gauges.contains(id) {
            return false;
        }
        gauges.insert(id.to_string());
        if let Err(e) = self
            .sink
            .gauge(id, 0)
        {
            error!("failed to baseline gauge {}: {}", id, e);
        }
        true
    }

    /// Forget every baselined gauge; the next touch baselines again.
    pub fn reset_all(&self) {
        self.gauges()
            .clear();
    }

    pub fn increment_gauge(&self, measure: &Measure) {
        self.gauge_delta(measure, 1);
    }

    pub fn decrement_gauge(&self, measure: &Measure) {
        self.gauge_delta(measure, -1);
    }

    fn gauge_delta(&self, measure: &Measure, delta: i64) {
        let id = measure.identifier();
        self.ensure_gauge_baseline(&id);
        if let Err(e) = self
            .sink
            .gauge_delta(&id, delta)
        {
            error!("failed to update gauge {}: {}", id, e);
        }
    }

    pub fn increment_counter(&self, measure: &Measure) {
        let id = measure.identifier();
        if let Err(e) = self
            .sink
            .incr(&id, 1)
        {
            error!("failed to increment counter {}: {}", id, e);
        }
    }

    pub fn timing(&self, measure: &Measure, millis: u64) {
        let id = measure.identifier();
        if let Err(e) = self
            .sink
            .timing(&id, millis)
        {
            error!("failed to record timing {}: {}", id, e);
        }
    }

    pub fn gauge_count(&self) -> usize {
        self.gauges()
            .len()
    }

    /// Baselined gauge identifiers, sorted.
    pub fn registered_gauges(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .gauges()
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
