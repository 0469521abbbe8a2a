//! The output consumes messages from an upstream queue, derives a record from each one, forwards
//! the record to a reporter and acknowledges the message back to the producer.
//!
//! ```text
//! upstream --Message--> [ConsumeLoop] --record--> [Reporter]
//!                             |
//!                             +--Response--> acknowledgment queue
//! ```
//!
//! Shutdown is cooperative. [Output::close_async] cancels the stop token exactly once, every await
//! point of the consume loop races that token, and the loop fires the stopped token after it has
//! released its resources. [Output::wait_for_close] waits on the stopped token.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DerivationFailureAck, OutputConfig};
use crate::error::{Error, Result};
use crate::measure::{Measure, Reporter, Timed};
use crate::message::{Message, Response};
use crate::metrics::{output_metrics, output_metrics_labels};

/// Capacity of the acknowledgment queue. The loop reserves the slot before it accepts a message,
/// so at most one message is in flight between upstream and the producer.
const RESPONSE_BUFFER: usize = 1;

const RUNNING: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Observable lifecycle of an [Output]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// No upstream queue attached yet.
    Created,
    /// Upstream queue attached, the consume loop is running.
    Receiving,
    /// Stop requested, the consume loop is finishing its current step.
    Closing,
    /// The consume loop has released everything.
    Closed,
}

/// Tri-state run flag shared by the output and its consume loop.
struct RunFlag(AtomicU8);

impl RunFlag {
    fn new() -> Self {
        Self(AtomicU8::new(RUNNING))
    }

    fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }

    /// Moves Running to Closing, returns true only for the caller that made the move.
    fn request_close(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn mark_closed(&self) {
        self.0.store(CLOSED, Ordering::Release);
    }

    fn load(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

/// Output is the lifecycle controller. Every method takes `&self` and can be called concurrently,
/// wrap it in an [Arc] to share it between tasks.
pub struct Output<M: Measure> {
    config: OutputConfig,
    measure: Arc<M>,
    run_flag: Arc<RunFlag>,
    /// Set once the upstream queue has been attached.
    receiving: AtomicBool,
    // Both ends are handed over exactly once, the locks are never held across an await.
    response_tx: parking_lot::Mutex<Option<mpsc::Sender<Response>>>,
    response_rx: parking_lot::Mutex<Option<mpsc::Receiver<Response>>>,
    stop_token: CancellationToken,
    stopped_token: CancellationToken,
}

impl<M: Measure> Output<M> {
    pub fn new(config: OutputConfig, measure: M) -> Result<Self> {
        config.validate()?;
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_BUFFER);
        Ok(Self {
            config,
            measure: Arc::new(measure),
            run_flag: Arc::new(RunFlag::new()),
            receiving: AtomicBool::new(false),
            response_tx: parking_lot::Mutex::new(Some(response_tx)),
            response_rx: parking_lot::Mutex::new(Some(response_rx)),
            stop_token: CancellationToken::new(),
            stopped_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Attaches the upstream queue and spawns the consume loop on the current tokio runtime.
    /// Only the first call succeeds, later calls return [Error::AlreadyStarted] and change
    /// nothing.
    pub fn start_receiving(&self, messages: mpsc::Receiver<Message>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("start_receiving needs a tokio runtime: {e}")))?;

        if self
            .receiving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }

        let Some(responses) = self.response_tx.lock().take() else {
            return Err(Error::AlreadyStarted);
        };

        info!(
            output = %self.config.name,
            report_period = ?self.config.report_period,
            derivation_failure_ack = %self.config.derivation_failure_ack,
            "Starting consume loop"
        );

        let labels = output_metrics_labels(&self.config.name);
        let consume_loop = ConsumeLoop {
            messages,
            _running: RunningGauge::inc(labels.clone()),
            reporter: self.measure.reporter(&self.config),
            responses,
            _stopped: StoppedSignal {
                run_flag: Arc::clone(&self.run_flag),
                stopped_token: self.stopped_token.clone(),
            },
            measure: Arc::clone(&self.measure),
            run_flag: Arc::clone(&self.run_flag),
            stop_token: self.stop_token.clone(),
            failure_ack: self.config.derivation_failure_ack,
            labels,
        };
        runtime.spawn(consume_loop.run());
        Ok(())
    }

    /// Requests the consume loop to stop without waiting for it. Idempotent, returns true only for
    /// the call that triggered the shutdown.
    pub fn close_async(&self) -> bool {
        if self.run_flag.request_close() {
            debug!(output = %self.config.name, "Close requested");
            self.stop_token.cancel();
            return true;
        }
        false
    }

    /// Waits until the consume loop has stopped and released its resources, or returns
    /// [Error::Timeout] once `timeout` elapses. Does not request the stop by itself.
    pub async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.stopped_token.cancelled())
            .await
            .map_err(|_| Error::Timeout)
    }

    /// Hands out the read side of the acknowledgment queue. The queue has a single consumer, only
    /// the first call gets it.
    pub fn acknowledgment_channel(&self) -> Option<mpsc::Receiver<Response>> {
        self.response_rx.lock().take()
    }

    pub fn state(&self) -> OutputState {
        match self.run_flag.load() {
            CLOSED => OutputState::Closed,
            CLOSING => OutputState::Closing,
            _ if self.receiving.load(Ordering::Acquire) => OutputState::Receiving,
            _ => OutputState::Created,
        }
    }
}

/// Increments the running gauge on creation and decrements it on drop.
struct RunningGauge {
    labels: Vec<(String, String)>,
}

impl RunningGauge {
    fn inc(labels: Vec<(String, String)>) -> Self {
        output_metrics().running.get_or_create(&labels).inc();
        Self { labels }
    }
}

impl Drop for RunningGauge {
    fn drop(&mut self) {
        output_metrics().running.get_or_create(&self.labels).dec();
    }
}

/// Marks the output closed and fires the stopped token on drop.
struct StoppedSignal {
    run_flag: Arc<RunFlag>,
    stopped_token: CancellationToken,
}

impl Drop for StoppedSignal {
    fn drop(&mut self) {
        self.run_flag.mark_closed();
        self.stopped_token.cancel();
        debug!("Consume loop stopped");
    }
}

/// The single task that moves messages from upstream to the reporter and the acknowledgment
/// queue.
///
/// Teardown is the drop of this struct. Fields drop in declaration order, so whichever way `run`
/// ends the running gauge goes down, the reporter is released, the acknowledgment queue closes and
/// only then the stopped token fires.
struct ConsumeLoop<M: Measure> {
    messages: mpsc::Receiver<Message>,
    _running: RunningGauge,
    reporter: M::Reporter,
    responses: mpsc::Sender<Response>,
    _stopped: StoppedSignal,

    measure: Arc<M>,
    run_flag: Arc<RunFlag>,
    stop_token: CancellationToken,
    failure_ack: DerivationFailureAck,
    labels: Vec<(String, String)>,
}

impl<M: Measure> ConsumeLoop<M> {
    async fn run(mut self) {
        while self.run_flag.is_running() {
            // the previous response has to be read before the next message is accepted
            let permit = tokio::select! {
                biased;

                _ = self.stop_token.cancelled() => return,

                permit = self.responses.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Acknowledgment receiver dropped, stopping consume loop");
                        return;
                    }
                },
            };

            let message = tokio::select! {
                biased;

                _ = self.stop_token.cancelled() => return,

                message = self.messages.recv() => match message {
                    Some(message) => message,
                    None => {
                        info!("Upstream queue closed, stopping consume loop");
                        return;
                    }
                },
            };
            output_metrics().count.get_or_create(&self.labels).inc();

            let response = match self.measure.derive(&message) {
                Ok(record) => {
                    output_metrics()
                        .latency
                        .get_or_create(&self.labels)
                        .observe(record.latency().as_micros() as f64);

                    tokio::select! {
                        biased;

                        _ = self.stop_token.cancelled() => return,

                        reported = self.reporter.report(record) => {
                            if let Err(e) = reported {
                                warn!(?e, "Reporter did not accept the record");
                            }
                        }
                    }
                    Response::Success
                }
                Err(e) => {
                    error!(?e, "Failed to derive record from message");
                    output_metrics().error.get_or_create(&self.labels).inc();
                    match self.failure_ack {
                        DerivationFailureAck::Success => Response::Success,
                        DerivationFailureAck::Failure => Response::Failed(e.to_string()),
                    }
                }
            };

            output_metrics().success.get_or_create(&self.labels).inc();
            permit.send(response);
        }
    }
}
