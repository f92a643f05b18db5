use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::classify::{Classification, classify};
use crate::config::Config;
use crate::decode::stream::decode_stream;
use crate::decode::{Extracted, decode_response};
use crate::dispatch::{DecodedImage, GenerationRequest, RawResponse, Transport};
use crate::error::{DecodeError, ErrorRecord, GenerationError};
use crate::status::{StatusEvent, StatusSink};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1500);

/// Attempt budget and linear backoff. Tuned per deployment, not per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RetryAfter(Duration),
    /// Non-retryable class; remaining budget is irrelevant.
    Permanent,
    Exhausted,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before the attempt following `attempt_index` (0-based): `base * (index + 1)`.
    pub fn backoff(&self, attempt_index: u32) -> Duration {
        self.base_delay.saturating_mul(attempt_index.saturating_add(1))
    }

    pub fn decide(&self, attempt_index: u32, classification: &Classification) -> Decision {
        if !classification.retryable {
            Decision::Permanent
        } else if attempt_index.saturating_add(1) >= self.max_attempts {
            Decision::Exhausted
        } else {
            Decision::RetryAfter(self.backoff(attempt_index))
        }
    }
}

/// Everything an attempt loop needs besides the transport.
#[derive(Debug, Clone)]
pub struct AttemptSettings {
    pub model: String,
    /// Per-attempt timeout unless the request overrides it.
    pub timeout: Duration,
    pub policy: RetryPolicy,
    pub fetch_remote_images: bool,
}

impl AttemptSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            timeout: config.request_timeout,
            policy: config.retry_policy(),
            fetch_remote_images: config.fetch_remote_images,
        }
    }
}

/// Loop position. Terminal positions are expressed as a [`LoopOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Pending,
    Attempting(u32),
    RetryWait { attempt: u32, delay: Duration },
}

#[derive(Debug, Clone, Copy)]
struct AttemptRecord {
    index: u32,
    succeeded: bool,
    elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Succeeded(DecodedImage),
    PermanentlyFailed(ErrorRecord),
    Cancelled,
}

/// Drives one logical request through sequential attempts.
pub struct RequestAttemptLoop<'a, T> {
    transport: &'a T,
    settings: &'a AttemptSettings,
    status: &'a StatusSink,
    cancel: CancellationToken,
}

impl<'a, T: Transport> RequestAttemptLoop<'a, T> {
    pub fn new(
        transport: &'a T,
        settings: &'a AttemptSettings,
        status: &'a StatusSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            settings,
            status,
            cancel,
        }
    }

    pub async fn run(&self, request: &GenerationRequest) -> LoopOutcome {
        let timeout = request.timeout.unwrap_or(self.settings.timeout);
        let policy = self.settings.policy;
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut state = LoopState::Pending;

        let outcome = loop {
            state = match state {
                LoopState::Pending => LoopState::Attempting(0),

                LoopState::Attempting(index) => {
                    if self.cancel.is_cancelled() {
                        break LoopOutcome::Cancelled;
                    }
                    self.status.emit(StatusEvent::Attempt {
                        id: request.id.clone(),
                        index,
                    });

                    let started = Instant::now();
                    let result = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => None,
                        r = self.attempt_once(request, timeout) => Some(r),
                    };
                    // In-flight work is dropped on cancellation; its result is discarded.
                    let Some(result) = result else {
                        break LoopOutcome::Cancelled;
                    };
                    history.push(AttemptRecord {
                        index,
                        succeeded: result.is_ok(),
                        elapsed: started.elapsed(),
                    });

                    let err = match result {
                        Ok(image) => break LoopOutcome::Succeeded(image),
                        Err(err) => err,
                    };
                    let classification = classify(&err);
                    match policy.decide(index, &classification) {
                        Decision::RetryAfter(delay) => {
                            tracing::warn!(
                                attempt = index,
                                class = %classification.class,
                                ?delay,
                                "attempt failed, retrying: {err}"
                            );
                            self.status.emit(StatusEvent::Retrying {
                                id: request.id.clone(),
                                index,
                                class: classification.class,
                                delay,
                            });
                            LoopState::RetryWait {
                                attempt: index,
                                delay,
                            }
                        }
                        decision => {
                            tracing::warn!(
                                attempt = index,
                                class = %classification.class,
                                exhausted = decision == Decision::Exhausted,
                                "request failed: {err}"
                            );
                            break LoopOutcome::PermanentlyFailed(error_record(
                                request,
                                &err,
                                &classification,
                            ));
                        }
                    }
                }

                LoopState::RetryWait { attempt, delay } => {
                    let cancelled = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        break LoopOutcome::Cancelled;
                    }
                    LoopState::Attempting(attempt + 1)
                }
            };
        };

        let total: Duration = history.iter().map(|r| r.elapsed).sum();
        tracing::debug!(
            attempts = history.len(),
            last_attempt = history.last().map(|r| r.index),
            last_succeeded = history.last().is_some_and(|r| r.succeeded),
            ?total,
            "attempt loop finished"
        );
        outcome
    }

    /// One physical attempt, bounded as a whole by `timeout`.
    async fn attempt_once(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<DecodedImage, GenerationError> {
        tokio::time::timeout(timeout, self.exchange(request, timeout))
            .await
            .map_err(|_| GenerationError::Timeout(timeout))?
    }

    /// Send, extract, and fetch if the image is remote.
    async fn exchange(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<DecodedImage, GenerationError> {
        let raw = self
            .transport
            .send(request, &self.settings.model, timeout)
            .await?;
        let extracted = match raw {
            RawResponse::Complete(doc) => decode_response(&doc)?,
            RawResponse::Stream(fragments) => {
                decode_stream(fragments, |text| {
                    self.status.emit(StatusEvent::Text {
                        id: request.id.clone(),
                        text: text.to_string(),
                    })
                })
                .await?
            }
        };
        match extracted {
            Extracted::Image(image) => Ok(image),
            Extracted::Remote(url) if self.settings.fetch_remote_images => {
                self.transport.fetch_image(&url, timeout).await
            }
            Extracted::Remote(url) => Err(DecodeError::RemoteDisabled(url).into()),
        }
    }
}

fn error_record(
    request: &GenerationRequest,
    err: &GenerationError,
    classification: &Classification,
) -> ErrorRecord {
    ErrorRecord {
        request_id: request.id.clone(),
        class: classification.class,
        message: err.user_message(),
        retryable: classification.retryable,
        retry_after_ms: classification
            .retry_after
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
    }
}
