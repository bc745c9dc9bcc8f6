//! Sequential fallback submission

use super::{
    ChannelError, ChannelFailure, FailureClass, SubmissionChannel, SubmissionError,
    SubmissionReceipt, SubmissionState,
};
use crate::tx::SignedTransaction;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Default per-channel timeout
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller side of a cancellation pair
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Stop before the next attempt. An attempt already in flight runs to
    /// completion, and an acceptance it returns still counts.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that is never raised
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

#[derive(Debug, Clone)]
pub struct SubmissionCoordinator {
    channel_timeout: Duration,
}

impl Default for SubmissionCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_TIMEOUT)
    }
}

impl SubmissionCoordinator {
    pub fn new(channel_timeout: Duration) -> Self {
        Self { channel_timeout }
    }

    pub fn channel_timeout(&self) -> Duration {
        self.channel_timeout
    }

    /// Offer `signed` to each channel in order until one accepts.
    ///
    /// Channels are never raced. A hung channel is cut off after the
    /// configured timeout and treated as a transient failure.
    pub async fn submit(
        &self,
        signed: &SignedTransaction,
        channels: &[Arc<dyn SubmissionChannel>],
        cancel: &CancelSignal,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        if channels.is_empty() {
            return Err(SubmissionError::NoChannels);
        }

        let expected = signed.tx_id();
        let mut trail = vec![SubmissionState::Pending];
        let mut failures: Vec<ChannelFailure> = Vec::new();

        for (index, channel) in channels.iter().enumerate() {
            if cancel.is_cancelled() {
                trail.push(SubmissionState::Cancelled);
                tracing::warn!(
                    tx_id = %expected,
                    attempted = failures.len(),
                    trail = ?trail,
                    "Submission cancelled"
                );
                return Err(SubmissionError::Cancelled { failures });
            }

            let name = channel.name().to_string();
            trail.push(SubmissionState::Trying {
                index,
                channel: name.clone(),
            });
            tracing::debug!(tx_id = %expected, channel = %name, index, "Submitting");

            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.channel_timeout, channel.submit(signed))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ChannelError::transient(format!(
                    "no response within {}ms",
                    self.channel_timeout.as_millis()
                ))),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(tx_id) => {
                    if tx_id != expected {
                        tracing::warn!(
                            channel = %name,
                            expected = %expected,
                            reported = %tx_id,
                            "Channel reported a different transaction id"
                        );
                    }
                    tracing::info!(
                        tx_id = %tx_id,
                        channel = %name,
                        elapsed_ms,
                        failed_attempts = failures.len(),
                        "Transaction accepted"
                    );
                    trail.push(SubmissionState::Accepted {
                        channel: name.clone(),
                        tx_id: tx_id.clone(),
                    });
                    return Ok(SubmissionReceipt {
                        tx_id,
                        channel: name,
                        attempts: failures,
                        trail,
                    });
                }
                Err(err) => {
                    let failure = ChannelFailure {
                        channel: name.clone(),
                        class: err.class,
                        message: err.message,
                        elapsed_ms,
                    };
                    match failure.class {
                        FailureClass::Transient => {
                            tracing::warn!(
                                channel = %name,
                                error = %failure.message,
                                elapsed_ms,
                                "Channel failed transiently, falling through"
                            );
                            failures.push(failure);
                        }
                        FailureClass::Permanent => {
                            trail.push(SubmissionState::Aborted {
                                channel: name.clone(),
                            });
                            tracing::error!(
                                channel = %name,
                                error = %failure.message,
                                trail = ?trail,
                                "Channel rejected transaction permanently, aborting"
                            );
                            return Err(SubmissionError::Permanent {
                                failure,
                                prior: failures,
                            });
                        }
                    }
                }
            }
        }

        trail.push(SubmissionState::Exhausted);
        tracing::error!(
            tx_id = %expected,
            attempts = failures.len(),
            trail = ?trail,
            "Every submission channel failed"
        );
        Err(SubmissionError::Exhausted { failures })
    }
}
