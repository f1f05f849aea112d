//! Connection and rewrite events.
//!
//! Forwarding tasks never wait on bookkeeping: [`EventSink::emit`] uses a
//! bounded channel and drops the event when it is full. A [`Recorder`]
//! task drains the channel into prometheus metrics and per-host counters.

use crate::connection::Protocol;
use dashmap::DashMap;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ProtocolDetected {
        src: String,
        dest: String,
        protocol: Protocol,
    },
    ConnectionClosed {
        src: String,
        dest: String,
        protocol: Protocol,
        duration: Duration,
    },
    Rewrite {
        host: String,
        src: String,
        header: String,
        original: String,
        rewritten: String,
    },
    PassThrough {
        host: String,
        src: String,
        user_agent: String,
    },
}

/// Sending half handed to every connection.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<Event>>,
    dropped: Arc<AtomicU64>,
    dropped_metric: Option<IntCounter>,
}

impl EventSink {
    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
            dropped_metric: None,
        }
    }

    pub fn channel(
        capacity: usize,
        registry: Option<&Registry>,
    ) -> Result<(Self, mpsc::Receiver<Event>), prometheus::Error> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped_metric = match registry {
            Some(registry) => {
                let counter = IntCounter::new(
                    "uaproxy_events_dropped_total",
                    "Events discarded because the event queue was full",
                )?;
                registry.register(Box::new(counter.clone()))?;
                Some(counter)
            }
            None => None,
        };

        let sink = Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
            dropped_metric,
        };
        Ok((sink, rx))
    }

    /// Queues an event without waiting.
    pub fn emit(&self, event: Event) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(ref counter) = self.dropped_metric {
                    counter.inc();
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Rewrite counters for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStats {
    pub host: String,
    pub rewrites: u64,
    pub pass_throughs: u64,
    pub last_user_agent: String,
    pub last_seen: SystemTime,
}

struct RecorderMetrics {
    connections_total: IntCounterVec,
    connection_duration: Histogram,
    rewrites_total: IntCounterVec,
    pass_through_total: IntCounter,
}

impl RecorderMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections_total = IntCounterVec::new(
            Opts::new(
                "uaproxy_connections_total",
                "Connections classified, by protocol",
            ),
            &["protocol"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connection_duration = Histogram::with_opts(
            HistogramOpts::new(
                "uaproxy_connection_duration_seconds",
                "Connection duration in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        )?;
        registry.register(Box::new(connection_duration.clone()))?;

        let rewrites_total = IntCounterVec::new(
            Opts::new("uaproxy_rewrites_total", "Header rewrites, by header name"),
            &["header"],
        )?;
        registry.register(Box::new(rewrites_total.clone()))?;

        let pass_through_total = IntCounter::new(
            "uaproxy_pass_through_total",
            "HTTP requests forwarded without modification",
        )?;
        registry.register(Box::new(pass_through_total.clone()))?;

        Ok(Self {
            connections_total,
            connection_duration,
            rewrites_total,
            pass_through_total,
        })
    }
}

pub struct Recorder {
    hosts: DashMap<String, HostStats>,
    metrics: Option<RecorderMetrics>,
}

impl Recorder {
    pub fn new(registry: Option<&Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            hosts: DashMap::new(),
            metrics: registry.map(RecorderMetrics::new).transpose()?,
        })
    }

    pub fn record(&self, event: &Event) {
        match event {
            Event::ProtocolDetected { protocol, .. } => {
                if let Some(ref metrics) = self.metrics {
                    metrics
                        .connections_total
                        .with_label_values(&[protocol.as_str()])
                        .inc();
                }
            }
            Event::ConnectionClosed { duration, .. } => {
                if let Some(ref metrics) = self.metrics {
                    metrics.connection_duration.observe(duration.as_secs_f64());
                }
            }
            Event::Rewrite {
                host,
                header,
                rewritten,
                ..
            } => {
                let mut entry = self.entry(host);
                entry.rewrites += 1;
                if header.eq_ignore_ascii_case("User-Agent") {
                    entry.last_user_agent.clone_from(rewritten);
                }
                drop(entry);
                if let Some(ref metrics) = self.metrics {
                    metrics.rewrites_total.with_label_values(&[header.as_str()]).inc();
                }
            }
            Event::PassThrough {
                host, user_agent, ..
            } => {
                let mut entry = self.entry(host);
                entry.pass_throughs += 1;
                entry.last_user_agent.clone_from(user_agent);
                drop(entry);
                if let Some(ref metrics) = self.metrics {
                    metrics.pass_through_total.inc();
                }
            }
        }
    }

    fn entry(&self, host: &str) -> dashmap::mapref::one::RefMut<'_, String, HostStats> {
        let mut entry = self.hosts.entry(host.to_string()).or_insert_with(|| HostStats {
            host: host.to_string(),
            rewrites: 0,
            pass_throughs: 0,
            last_user_agent: String::new(),
            last_seen: SystemTime::now(),
        });
        entry.last_seen = SystemTime::now();
        entry
    }

    /// Per-host statistics, busiest hosts first.
    pub fn snapshot(&self) -> Vec<HostStats> {
        let mut stats: Vec<HostStats> = self.hosts.iter().map(|e| e.value().clone()).collect();
        stats.sort_by(|a, b| {
            (b.rewrites + b.pass_throughs)
                .cmp(&(a.rewrites + a.pass_throughs))
                .then_with(|| a.host.cmp(&b.host))
        });
        stats
    }

    /// Drains `rx` until every sender is gone.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.record(&event);
            }
            debug!("Event channel closed, recorder stopping");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(host: &str) -> Event {
        Event::Rewrite {
            host: host.to_string(),
            src: "127.0.0.1:5000".to_string(),
            header: "User-Agent".to_string(),
            original: "curl/8".to_string(),
            rewritten: "FFF".to_string(),
        }
    }

    #[test]
    fn test_full_channel_drops() {
        let (sink, _rx) = EventSink::channel(2, None).unwrap();
        for _ in 0..5 {
            sink.emit(rewrite("a.com"));
        }
        assert_eq!(sink.dropped(), 3);
    }

    #[test]
    fn test_disabled_sink() {
        let sink = EventSink::disabled();
        sink.emit(rewrite("a.com"));
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_recorder_host_stats() {
        let recorder = Recorder::new(None).unwrap();
        recorder.record(&rewrite("a.com"));
        recorder.record(&rewrite("a.com"));
        recorder.record(&Event::PassThrough {
            host: "b.com".to_string(),
            src: "127.0.0.1:5001".to_string(),
            user_agent: "MicroMessenger Client".to_string(),
        });

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].host, "a.com");
        assert_eq!(snapshot[0].rewrites, 2);
        assert_eq!(snapshot[0].last_user_agent, "FFF");
        assert_eq!(snapshot[1].pass_throughs, 1);
    }

    #[tokio::test]
    async fn test_recorder_task_drains_channel() {
        let registry = Registry::new();
        let (sink, rx) = EventSink::channel(16, Some(&registry)).unwrap();
        let recorder = Arc::new(Recorder::new(Some(&registry)).unwrap());
        let handle = recorder.clone().spawn(rx);

        sink.emit(Event::ProtocolDetected {
            src: "127.0.0.1:1".to_string(),
            dest: "a.com:80".to_string(),
            protocol: Protocol::Http,
        });
        sink.emit(rewrite("a.com"));
        drop(sink);

        handle.await.unwrap();
        assert_eq!(recorder.snapshot()[0].rewrites, 1);
    }
}
