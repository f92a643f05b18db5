use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::attempt::{AttemptSettings, LoopOutcome, RequestAttemptLoop};
use crate::classify::ErrorClass;
use crate::config::Config;
use crate::dispatch::{GenerationRequest, RequestId, Transport};
use crate::error::{ErrorRecord, SchedulerError, StoreError};
use crate::status::{StatusEvent, StatusSink};
use crate::store::{Entry, RequestState, ResultStore};

/// Runs batches of generation requests on a fixed-size worker pool.
///
/// Request ids are unique per scheduler: every batch registers its ids in the
/// shared [`ResultStore`], and an id that was already used is rejected.
pub struct GenerationScheduler<T> {
    transport: Arc<T>,
    settings: Arc<AttemptSettings>,
    max_concurrency: usize,
    store: Arc<ResultStore>,
    span: Option<Span>,
}

impl<T: Transport> GenerationScheduler<T> {
    pub fn new(transport: T, settings: AttemptSettings, max_concurrency: usize) -> Self {
        if max_concurrency == 0 {
            tracing::warn!("max_concurrency 0 clamped to 1");
        }
        Self {
            transport: Arc::new(transport),
            settings: Arc::new(settings),
            max_concurrency: max_concurrency.max(1),
            store: Arc::new(ResultStore::new()),
            span: None,
        }
    }

    pub fn from_config(transport: T, config: &Config) -> Self {
        Self::new(
            transport,
            AttemptSettings::from_config(config),
            config.max_concurrency,
        )
    }

    /// Parent span for batch, worker and request spans. Defaults to the span
    /// current at submission.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn store(&self) -> Arc<ResultStore> {
        Arc::clone(&self.store)
    }

    /// Validate and enqueue a batch, then start its workers in the background.
    ///
    /// Either every request is registered as Queued or none is. Outside a Tokio
    /// runtime nothing is registered and [`SchedulerError::NoRuntime`] is returned.
    pub fn submit(&self, requests: Vec<GenerationRequest>) -> Result<BatchHandle, SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let mut seen = HashSet::with_capacity(requests.len());
        for request in &requests {
            if !seen.insert(&request.id) {
                return Err(SchedulerError::DuplicateRequestId(request.id.clone()));
            }
            if request.prompt.trim().is_empty() {
                return Err(SchedulerError::BlankPrompt(request.id.clone()));
            }
        }
        let ids: Vec<RequestId> = requests.iter().map(|r| r.id.clone()).collect();
        self.store.register_all(&ids).map_err(|e| match e {
            StoreError::AlreadyRegistered(id) => SchedulerError::AlreadySubmitted(id),
            other => SchedulerError::Store(other),
        })?;

        let (status, events) = StatusSink::channel();
        for id in &ids {
            status.emit(StatusEvent::State {
                id: id.clone(),
                state: RequestState::Queued,
            });
        }

        let cancel = CancellationToken::new();
        let tokens: Arc<HashMap<RequestId, CancellationToken>> = Arc::new(
            ids.iter()
                .map(|id| (id.clone(), cancel.child_token()))
                .collect(),
        );
        let workers = self.max_concurrency.min(requests.len());
        let parent = self.span.clone().unwrap_or_else(Span::current);
        let span = tracing::info_span!(parent: &parent, "batch", size = ids.len(), workers);

        let ctx = Arc::new(BatchContext {
            transport: Arc::clone(&self.transport),
            settings: Arc::clone(&self.settings),
            store: Arc::clone(&self.store),
            status,
            tokens: Arc::clone(&tokens),
            queue: Mutex::new(requests.into_iter().map(Arc::new).collect()),
        });

        let supervisor = runtime.spawn(supervise(ctx, ids.clone(), workers).instrument(span));

        Ok(BatchHandle {
            ids,
            store: Arc::clone(&self.store),
            cancel,
            tokens,
            events: Some(events),
            supervisor,
        })
    }
}

/// Totals for one finished batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }
}

/// Caller's side of a running batch. Dropping it does not stop the batch.
#[derive(Debug)]
pub struct BatchHandle {
    ids: Vec<RequestId>,
    store: Arc<ResultStore>,
    cancel: CancellationToken,
    tokens: Arc<HashMap<RequestId, CancellationToken>>,
    events: Option<UnboundedReceiver<StatusEvent>>,
    supervisor: JoinHandle<BatchReport>,
}

impl BatchHandle {
    pub fn ids(&self) -> &[RequestId] {
        &self.ids
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn state(&self, id: &RequestId) -> Option<RequestState> {
        self.store.state(id)
    }

    /// Queued requests become Cancelled; in-flight attempts are abandoned.
    pub fn cancel_all(&self) {
        tracing::info!(size = self.ids.len(), "cancelling batch");
        self.cancel.cancel();
    }

    /// Token that cancels the whole batch, for wiring to signals.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel one request. Returns false if the id is not in this batch or
    /// has already finished.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let Some(token) = self.tokens.get(id) else {
            return false;
        };
        if self.store.state(id).is_none_or(RequestState::is_terminal) {
            return false;
        }
        token.cancel();
        true
    }

    /// Status stream for this batch. Available once; closes when the batch finishes.
    ///
    /// Events are buffered without bound until taken, so a caller that never
    /// watches progress should call [`BatchHandle::discard_events`].
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<StatusEvent>> {
        self.events.take()
    }

    /// Close the status stream; later events are dropped at the sender.
    pub fn discard_events(&mut self) {
        self.events = None;
    }

    /// Wait until every request in the batch is terminal.
    pub async fn wait(self) -> Result<BatchReport, SchedulerError> {
        self.supervisor.await.map_err(SchedulerError::from)
    }
}

struct BatchContext<T> {
    transport: Arc<T>,
    settings: Arc<AttemptSettings>,
    store: Arc<ResultStore>,
    status: StatusSink,
    tokens: Arc<HashMap<RequestId, CancellationToken>>,
    queue: Mutex<VecDeque<Arc<GenerationRequest>>>,
}

impl<T> BatchContext<T> {
    fn next_request(&self) -> Option<Arc<GenerationRequest>> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn token(&self, id: &RequestId) -> CancellationToken {
        self.tokens.get(id).cloned().unwrap_or_default()
    }

    /// Move `id` to `entry` and announce it. A refused transition is logged, never applied.
    fn publish(&self, id: &RequestId, entry: Entry) {
        let state = entry.state();
        match self.store.transition(id, entry) {
            Ok(()) => self.status.emit(StatusEvent::State {
                id: id.clone(),
                state,
            }),
            Err(e) => tracing::warn!("dropping update: {e}"),
        }
    }
}

async fn supervise<T: Transport>(
    ctx: Arc<BatchContext<T>>,
    ids: Vec<RequestId>,
    workers: usize,
) -> BatchReport {
    let started = Instant::now();
    tracing::info!("batch started");

    let mut set = JoinSet::new();
    for worker in 0..workers {
        let span = tracing::debug_span!("worker", worker);
        set.spawn(run_worker(Arc::clone(&ctx)).instrument(span));
    }
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            tracing::error!("worker task failed: {e}");
        }
    }

    // Anything still queued here was never picked up by a worker.
    while let Some(request) = ctx.next_request() {
        ctx.publish(&request.id, Entry::Cancelled);
    }

    let count = |state: RequestState| {
        ids.iter()
            .filter(|id| ctx.store.state(id) == Some(state))
            .count()
    };
    let report = BatchReport {
        succeeded: count(RequestState::Succeeded),
        failed: count(RequestState::Failed),
        cancelled: count(RequestState::Cancelled),
        elapsed: started.elapsed(),
    };
    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        cancelled = report.cancelled,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "batch finished"
    );
    report
}

/// Pull requests until the queue is empty. Each request runs to a terminal
/// state before the next one is taken.
async fn run_worker<T: Transport>(ctx: Arc<BatchContext<T>>) {
    while let Some(request) = ctx.next_request() {
        let id = &request.id;
        let token = ctx.token(id);
        if token.is_cancelled() {
            ctx.publish(id, Entry::Cancelled);
            continue;
        }
        if let Err(e) = ctx.store.transition(id, Entry::InFlight) {
            tracing::warn!("skipping request: {e}");
            continue;
        }
        ctx.status.emit(StatusEvent::State {
            id: id.clone(),
            state: RequestState::InFlight,
        });

        let attempts = RequestAttemptLoop::new(&*ctx.transport, &ctx.settings, &ctx.status, token);
        let span = tracing::info_span!("request", request_id = %id);
        let outcome = AssertUnwindSafe(attempts.run(&request))
            .catch_unwind()
            .instrument(span)
            .await;

        let entry = match outcome {
            Ok(LoopOutcome::Succeeded(image)) => {
                tracing::debug!(request_id = %id, mime_type = %image.mime_type, "request succeeded");
                Entry::Succeeded(Arc::new(image))
            }
            Ok(LoopOutcome::PermanentlyFailed(record)) => Entry::Failed(record),
            Ok(LoopOutcome::Cancelled) => Entry::Cancelled,
            Err(_) => {
                tracing::error!(request_id = %id, "attempt loop panicked");
                Entry::Failed(ErrorRecord {
                    request_id: id.clone(),
                    class: ErrorClass::Unknown,
                    message: "internal error while generating image".to_string(),
                    retryable: false,
                    retry_after_ms: None,
                })
            }
        };
        ctx.publish(id, entry);
    }
}
