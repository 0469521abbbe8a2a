//! Benchmark output: measures how long messages took to travel from the producer to the output and
//! periodically logs throughput and latency.
//!
//! A benchmark message carries its send time in the first part, as decimal nanoseconds since the
//! Unix epoch. Every other part is payload and only counts towards the byte rate.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use crate::config::OutputConfig;
use crate::error::{Error, Result};
use crate::measure::{Measure, Reporter, Timed};
use crate::message::Message;
use crate::output::Output;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Output that reports benchmark statistics.
pub type BenchOutput = Output<Bench>;

impl BenchOutput {
    pub fn bench(config: OutputConfig) -> Result<Self> {
        Output::new(config, Bench)
    }
}

/// Builds a benchmark message sent at `sent_at` followed by the payload parts.
pub fn timestamped_message(
    sent_at: DateTime<Utc>,
    payload: impl IntoIterator<Item = Bytes>,
) -> Message {
    let stamp = sent_at.timestamp_nanos_opt().unwrap_or_default();
    let mut parts = vec![Bytes::from(stamp.to_string())];
    parts.extend(payload);
    Message::new(parts)
}

/// BenchRecord is derived from a single benchmark message.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchRecord {
    /// Time between the send time stamped in the message and the derivation.
    pub latency: Duration,
    /// Size of the whole message, timestamp included.
    pub bytes: usize,
    pub parts: usize,
}

impl BenchRecord {
    pub fn from_message(message: &Message) -> Result<Self> {
        Self::from_message_at(message, Utc::now())
    }

    fn from_message_at(message: &Message, now: DateTime<Utc>) -> Result<Self> {
        let first = message.parts.first().ok_or_else(|| {
            Error::Derivation("benchmark requires at least one message part".to_string())
        })?;

        let stamp = std::str::from_utf8(first)
            .map_err(|e| Error::Derivation(format!("timestamp is not valid utf-8: {e}")))?
            .trim()
            .parse::<i64>()
            .map_err(|e| Error::Derivation(format!("failed to parse timestamp: {e}")))?;

        // a sender clock ahead of ours shows up as zero latency
        let latency = (now - DateTime::from_timestamp_nanos(stamp))
            .to_std()
            .unwrap_or(Duration::ZERO);

        Ok(Self {
            latency,
            bytes: message.len_bytes(),
            parts: message.parts.len(),
        })
    }
}

impl Timed for BenchRecord {
    fn latency(&self) -> Duration {
        self.latency
    }
}

/// Summary of the records seen over some elapsed time.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchSummary {
    pub messages: u64,
    pub bytes: u64,
    pub messages_per_sec: f64,
    pub mb_per_sec: f64,
    pub mean_latency: Duration,
    /// Percentiles are only known for a window, the totals do not keep every latency.
    pub p50_latency: Option<Duration>,
    pub p99_latency: Option<Duration>,
    pub max_latency: Duration,
}

/// Accumulates records, either for a single reporting window or for the whole run.
#[derive(Debug, Default)]
struct BenchStats {
    messages: u64,
    bytes: u64,
    latency_sum: Duration,
    max_latency: Duration,
    latencies: Vec<Duration>,
}

impl BenchStats {
    fn record(&mut self, record: &BenchRecord) {
        self.messages += 1;
        self.bytes += record.bytes as u64;
        self.latency_sum += record.latency;
        self.max_latency = self.max_latency.max(record.latency);
        self.latencies.push(record.latency);
    }

    /// Folds a finished window into these totals, dropping the individual latencies.
    fn absorb(&mut self, window: &BenchStats) {
        self.messages += window.messages;
        self.bytes += window.bytes;
        self.latency_sum += window.latency_sum;
        self.max_latency = self.max_latency.max(window.max_latency);
    }

    fn summary(&mut self, elapsed: Duration) -> BenchSummary {
        let secs = elapsed.as_secs_f64();
        let (messages_per_sec, mb_per_sec) = if secs > 0.0 {
            (
                self.messages as f64 / secs,
                self.bytes as f64 / BYTES_PER_MB / secs,
            )
        } else {
            (0.0, 0.0)
        };

        let mean_latency = if self.messages > 0 {
            let mean = self.latency_sum.as_nanos() / u128::from(self.messages);
            Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX))
        } else {
            Duration::ZERO
        };

        self.latencies.sort_unstable();
        BenchSummary {
            messages: self.messages,
            bytes: self.bytes,
            messages_per_sec,
            mb_per_sec,
            mean_latency,
            p50_latency: percentile(&self.latencies, 0.50),
            p99_latency: percentile(&self.latencies, 0.99),
            max_latency: self.max_latency,
        }
    }
}

/// Nearest-rank percentile of already sorted latencies.
fn percentile(sorted: &[Duration], p: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted.get(rank.saturating_sub(1)).copied()
}

/// Handle of the benchmark reporter actor. Dropping every handle stops the actor, which then logs
/// the overall summary.
#[derive(Clone)]
pub struct BenchReporter {
    sender: mpsc::Sender<BenchRecord>,
}

impl BenchReporter {
    /// Spawns the actor. The join handle resolves to the overall summary once the actor stops.
    pub fn start(period: Duration, buffer: usize) -> (Self, JoinHandle<BenchSummary>) {
        let (sender, receiver) = mpsc::channel(buffer);
        let actor = BenchReporterActor::new(receiver, period);
        let handle = tokio::spawn(actor.run());
        (Self { sender }, handle)
    }
}

impl Reporter<BenchRecord> for BenchReporter {
    async fn report(&mut self, record: BenchRecord) -> Result<()> {
        self.sender
            .send(record)
            .await
            .map_err(|_| Error::Reporter("bench reporter has stopped".to_string()))
    }
}

struct BenchReporterActor {
    records: mpsc::Receiver<BenchRecord>,
    period: Duration,
    window: BenchStats,
    totals: BenchStats,
    started_at: Instant,
    window_started_at: Instant,
}

impl BenchReporterActor {
    fn new(records: mpsc::Receiver<BenchRecord>, period: Duration) -> Self {
        let now = Instant::now();
        Self {
            records,
            period,
            window: BenchStats::default(),
            totals: BenchStats::default(),
            started_at: now,
            window_started_at: now,
        }
    }

    async fn run(mut self) -> BenchSummary {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                record = self.records.recv() => match record {
                    Some(record) => self.window.record(&record),
                    None => break,
                },
                _ = ticker.tick() => self.flush_window(),
            }
        }
        self.flush_window();

        let summary = self.totals.summary(self.started_at.elapsed());
        info!(
            messages = summary.messages,
            bytes = summary.bytes,
            messages_per_sec = summary.messages_per_sec,
            mb_per_sec = summary.mb_per_sec,
            mean_latency = ?summary.mean_latency,
            max_latency = ?summary.max_latency,
            "Benchmark finished"
        );
        summary
    }

    /// Logs the current window and starts a new one. Empty windows are not logged.
    fn flush_window(&mut self) {
        let elapsed = self.window_started_at.elapsed();
        self.window_started_at = Instant::now();
        if self.window.messages == 0 {
            return;
        }

        let summary = self.window.summary(elapsed);
        info!(
            messages_per_sec = summary.messages_per_sec,
            mb_per_sec = summary.mb_per_sec,
            mean_latency = ?summary.mean_latency,
            p50_latency = ?summary.p50_latency,
            p99_latency = ?summary.p99_latency,
            max_latency = ?summary.max_latency,
            "Benchmark stats"
        );

        let window = std::mem::take(&mut self.window);
        self.totals.absorb(&window);
    }
}

/// Bench derives [BenchRecord]s and reports them through a [BenchReporter].
#[derive(Debug, Clone, Copy, Default)]
pub struct Bench;

impl Measure for Bench {
    type Record = BenchRecord;
    type Reporter = BenchReporter;

    fn derive(&self, message: &Message) -> Result<BenchRecord> {
        BenchRecord::from_message(message)
    }

    fn reporter(&self, config: &OutputConfig) -> BenchReporter {
        // the actor logs its own summary, nobody needs to join it
        let (reporter, _handle) = BenchReporter::start(config.report_period, config.reporter_buffer);
        reporter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Response;

    fn record(latency_ms: u64, bytes: usize) -> BenchRecord {
        BenchRecord {
            latency: Duration::from_millis(latency_ms),
            bytes,
            parts: 1,
        }
    }

    #[test]
    fn test_from_message() {
        let sent_at = Utc::now();
        let now = sent_at + chrono::Duration::milliseconds(42);
        let message = timestamped_message(sent_at, [Bytes::from_static(b"hello world")]);

        let record = BenchRecord::from_message_at(&message, now).unwrap();
        assert_eq!(record.latency, Duration::from_millis(42));
        assert_eq!(record.parts, 2);
        assert_eq!(record.bytes, message.len_bytes());
        assert_eq!(record.bytes, message.parts[0].len() + 11);
    }

    #[test]
    fn test_from_message_clock_skew() {
        let now = Utc::now();
        let message = timestamped_message(now + chrono::Duration::seconds(5), []);
        let record = BenchRecord::from_message_at(&message, now).unwrap();
        assert_eq!(record.latency, Duration::ZERO);
        assert_eq!(record.parts, 1);
    }

    #[test]
    fn test_from_message_invalid() {
        let empty = Message::default();
        assert!(matches!(
            BenchRecord::from_message(&empty),
            Err(Error::Derivation(_))
        ));

        let garbage = Message::from(vec![b"yesterday".to_vec()]);
        assert!(matches!(
            BenchRecord::from_message(&garbage),
            Err(Error::Derivation(_))
        ));

        let not_utf8 = Message::from(vec![vec![0xff, 0xfe, 0xfd]]);
        assert!(matches!(
            BenchRecord::from_message(&not_utf8),
            Err(Error::Derivation(_))
        ));
    }

    #[test]
    fn test_stats_summary() {
        let mut stats = BenchStats::default();
        for latency_ms in (1..=100).rev() {
            stats.record(&record(latency_ms, 1024));
        }

        let summary = stats.summary(Duration::from_secs(2));
        assert_eq!(summary.messages, 100);
        assert_eq!(summary.bytes, 100 * 1024);
        assert_eq!(summary.messages_per_sec, 50.0);
        assert!((summary.mb_per_sec - 100.0 / 1024.0 / 2.0).abs() < f64::EPSILON);
        assert_eq!(summary.mean_latency, Duration::from_micros(50_500));
        assert_eq!(summary.p50_latency, Some(Duration::from_millis(50)));
        assert_eq!(summary.p99_latency, Some(Duration::from_millis(99)));
        assert_eq!(summary.max_latency, Duration::from_millis(100));
    }

    #[test]
    fn test_stats_absorb() {
        let mut totals = BenchStats::default();
        let mut window = BenchStats::default();
        window.record(&record(10, 10));
        window.record(&record(30, 20));
        totals.absorb(&window);
        totals.absorb(&window);

        let summary = totals.summary(Duration::ZERO);
        assert_eq!(summary.messages, 4);
        assert_eq!(summary.bytes, 60);
        assert_eq!(summary.mean_latency, Duration::from_millis(20));
        assert_eq!(summary.max_latency, Duration::from_millis(30));
        assert_eq!(summary.messages_per_sec, 0.0);
        assert_eq!(summary.p50_latency, None);
    }

    #[test]
    fn test_percentile_edges() {
        assert_eq!(percentile(&[], 0.5), None);
        let one = [Duration::from_millis(7)];
        assert_eq!(percentile(&one, 0.0), Some(Duration::from_millis(7)));
        assert_eq!(percentile(&one, 0.99), Some(Duration::from_millis(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_totals() {
        let (mut reporter, handle) = BenchReporter::start(Duration::from_secs(1), 10);

        reporter.report(record(5, 100)).await.unwrap();
        reporter.report(record(15, 100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        reporter.report(record(10, 100)).await.unwrap();
        drop(reporter);

        let summary = handle.await.unwrap();
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.bytes, 300);
        assert_eq!(summary.mean_latency, Duration::from_millis(10));
        assert_eq!(summary.max_latency, Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_reporter_stopped() {
        let (mut reporter, handle) = BenchReporter::start(Duration::from_secs(1), 1);
        handle.abort();
        let _ = handle.await;

        assert!(matches!(
            reporter.report(record(1, 1)).await,
            Err(Error::Reporter(_))
        ));
    }

    #[tokio::test]
    async fn test_bench_output() {
        let config = OutputConfig {
            name: "bench-output".to_string(),
            report_period: Duration::from_millis(10),
            ..Default::default()
        };
        let output = BenchOutput::bench(config).unwrap();
        let mut acks = output.acknowledgment_channel().unwrap();

        let (tx, rx) = mpsc::channel(10);
        output.start_receiving(rx).unwrap();
        for _ in 0..5 {
            tx.send(timestamped_message(Utc::now(), [Bytes::from_static(b"data")]))
                .await
                .unwrap();
            assert_eq!(acks.recv().await, Some(Response::Success));
        }
        drop(tx);

        assert_eq!(acks.recv().await, None);
        output
            .wait_for_close(Duration::from_secs(1))
            .await
            .unwrap();
    }
}
