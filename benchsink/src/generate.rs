use std::time::Duration;

use benchsink_core::bench::timestamped_message;
use benchsink_core::message::Message;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shape of the generated messages.
#[derive(Debug, Clone)]
pub(crate) struct GeneratorConfig {
    /// Messages per second, at least 1.
    pub(crate) rate: u64,
    pub(crate) parts: usize,
    pub(crate) size: usize,
    /// Generate for this long then close the upstream queue, forever when unset.
    pub(crate) duration: Option<Duration>,
}

/// Spawns the generator. It writes timestamped messages to `messages` until the duration elapses,
/// the token is cancelled or the output stops reading. Dropping the sender on exit is the
/// end-of-stream signal for the output. Resolves to the number of messages sent.
pub(crate) fn start(
    config: GeneratorConfig,
    messages: mpsc::Sender<Message>,
    cln_token: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let payload = Bytes::from(vec![b'x'; config.size]);
        let mut ticker = time::interval(Duration::from_nanos(1_000_000_000 / config.rate.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let deadline = config.duration.map(|d| Instant::now() + d);
        let until_deadline = async {
            match deadline {
                Some(deadline) => time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(until_deadline);

        let mut sent: u64 = 0;
        loop {
            tokio::select! {
                biased;

                _ = cln_token.cancelled() => {
                    debug!("Generator cancelled");
                    break;
                }

                _ = &mut until_deadline => {
                    info!(sent, "Generation duration elapsed, closing upstream");
                    break;
                }

                _ = ticker.tick() => {
                    let message = timestamped_message(
                        Utc::now(),
                        std::iter::repeat_n(payload.clone(), config.parts),
                    );
                    // a full queue must not hold off cancellation
                    tokio::select! {
                        biased;
                        _ = cln_token.cancelled() => break,
                        result = messages.send(message) => {
                            if result.is_err() {
                                debug!("Output stopped reading, stopping generator");
                                break;
                            }
                        }
                    }
                    sent += 1;
                }
            }
        }
        sent
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchsink_core::bench::BenchRecord;

    #[tokio::test]
    async fn test_generator_duration() {
        let (tx, mut rx) = mpsc::channel(1000);
        let handle = start(
            GeneratorConfig {
                rate: 1000,
                parts: 2,
                size: 8,
                duration: Some(Duration::from_millis(50)),
            },
            tx,
            CancellationToken::new(),
        );

        let mut received = 0;
        while let Some(message) = rx.recv().await {
            let record = BenchRecord::from_message(&message).unwrap();
            assert_eq!(record.parts, 3);
            assert_eq!(message.parts.iter().skip(1).map(|p| p.len()).sum::<usize>(), 16);
            received += 1;
        }

        let sent = handle.await.unwrap();
        assert_eq!(sent, received);
        assert!(sent > 0);
    }

    #[tokio::test]
    async fn test_generator_cancelled_on_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let cln_token = CancellationToken::new();
        let handle = start(
            GeneratorConfig {
                rate: 1000,
                parts: 0,
                size: 0,
                duration: None,
            },
            tx,
            cln_token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        cln_token.cancel();
        let sent = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent, 1);
    }
}
