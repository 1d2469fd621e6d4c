//! Top-level batch orchestration.

use super::aggregator::ResponseAggregator;
use super::handle::{BatchHandle, StatePublisher};
use super::turns::RequestTurns;
use crate::cancel::{CancelHandle, CancellationController};
use crate::config::DispatchConfig;
use crate::progress::{report_isolated, ProgressEvent, ProgressSink};
use crate::provider::{ProviderPort, ProviderRegistry};
use crate::resilience::rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
use crate::resilience::retry::{RetryExecutor, RetryState};
use crate::template::TemplateExpander;
use crate::types::{BatchState, BatchStatus, Request, Response};
use crate::{Error, Result};
use arc_swap::ArcSwap;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CANCELLED_MESSAGE: &str = "CANCELLED: batch cancelled";

/// Concurrency usage across every batch of the dispatcher, including calls
/// still running for a cancelled batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InflightSnapshot {
    pub max: usize,
    pub available: usize,
    pub in_use: usize,
}

/// Point-in-time view of the dispatcher's shared limits.
#[derive(Debug, Clone)]
pub struct DispatchSignals {
    pub batch_id: Option<String>,
    pub inflight: InflightSnapshot,
    pub rate_limiter: RateLimiterSnapshot,
}

struct ActiveBatch {
    id: String,
    cancel: Arc<CancellationController>,
}

/// Orchestrates batches of requests against one provider.
///
/// The concurrency semaphore, the rate-limit window, per-request retry
/// bookkeeping and per-id turns live as long as the dispatcher, so provider
/// calls left running by a cancelled batch still count against the ceiling
/// and still block a re-run of their id. Cancellation and the response map
/// are created fresh for every batch.
pub struct BatchDispatcher {
    config: DispatchConfig,
    provider: ArcSwap<Arc<dyn ProviderPort>>,
    registry: ProviderRegistry,
    semaphore: Arc<Semaphore>,
    turns: Arc<RequestTurns>,
    rate_limiter: Arc<RateLimiter>,
    retry: Arc<RetryExecutor>,
    active: Mutex<Option<ActiveBatch>>,
}

impl BatchDispatcher {
    pub fn new(config: DispatchConfig, provider: Arc<dyn ProviderPort>) -> Result<Self> {
        config.validate()?;
        let rate_limiter = RateLimiter::new(
            RateLimiterConfig::per_minute(config.requests_per_minute)
                .with_window(config.rate_window())
                .with_poll_interval(config.poll_interval()),
        );
        let retry = RetryExecutor::new(config.retry_policy()).with_poll_interval(config.poll_interval());
        let semaphore = Semaphore::new(config.max_concurrent_requests);
        Ok(Self {
            config,
            provider: ArcSwap::from_pointee(provider),
            registry: ProviderRegistry::new(),
            semaphore: Arc::new(semaphore),
            turns: Arc::new(RequestTurns::new()),
            rate_limiter: Arc::new(rate_limiter),
            retry: Arc::new(retry),
            active: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Provider used by the next batch.
    pub fn provider(&self) -> Arc<dyn ProviderPort> {
        let guard = self.provider.load();
        Arc::clone(&**guard)
    }

    /// Swap the provider. Batches already running keep the one they started with.
    pub fn set_provider(&self, provider: Arc<dyn ProviderPort>) {
        debug!(provider = provider.name(), "provider swapped");
        self.provider.store(Arc::new(provider));
    }

    /// Make the registry's provider under `key` active, creating it on first use.
    pub fn use_provider<F>(&self, key: &str, create: F) -> Result<Arc<dyn ProviderPort>>
    where
        F: FnOnce() -> Result<Arc<dyn ProviderPort>>,
    {
        let provider = self.registry.get_or_try_insert_with(key, create)?;
        self.set_provider(Arc::clone(&provider));
        Ok(provider)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Retry bookkeeping of a request whose last run was interrupted.
    pub fn retry_state(&self, id: &str) -> Option<RetryState> {
        self.retry.state(id)
    }

    /// Dispatch `requests` and return a handle observing the batch.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn dispatch(&self, requests: Vec<Request>, sink: Arc<dyn ProgressSink>) -> BatchHandle {
        let batch_id = new_batch_id();
        let total = requests.len();
        let initial = BatchState::new(batch_id.clone(), BatchStatus::SendingRequests, total);
        if let Some(handle) = self.reject_invalid(&batch_id, &requests, total) {
            return handle;
        }
        let (publisher, latest, events) = StatePublisher::channel(initial);
        self.launch(
            batch_id,
            requests,
            total,
            ResponseAggregator::new(),
            publisher,
            latest,
            events,
            sink,
        )
    }

    /// Expand a template and dispatch the result.
    ///
    /// Expansion failures and oversized expansions end the batch as
    /// [`BatchStatus::Error`] without sending anything.
    pub fn dispatch_template(
        &self,
        expander: &dyn TemplateExpander,
        template: &str,
        variables: &HashMap<String, Vec<String>>,
        sink: Arc<dyn ProgressSink>,
    ) -> BatchHandle {
        let batch_id = new_batch_id();
        let (publisher, latest, events) =
            StatePublisher::channel(BatchState::new(batch_id.clone(), BatchStatus::Preparing, 0));
        publisher.publish(BatchState::new(
            batch_id.clone(),
            BatchStatus::ProcessingTemplate,
            0,
        ));

        let max = self.config.max_combinations;
        let expanded = expander
            .expand(template, variables, max)
            .and_then(|requests| {
                if requests.len() > max {
                    Err(Error::validation_with_context(
                        format!(
                            "template expanded to {} requests, exceeding max_combinations {}",
                            requests.len(),
                            max
                        ),
                        crate::ErrorContext::new()
                            .with_field_path("max_combinations")
                            .with_source("batch_dispatcher"),
                    ))
                } else {
                    Ok(requests)
                }
            })
            .and_then(|requests| validate_ids(&requests).map(|_| requests));

        let requests = match expanded {
            Ok(requests) => requests,
            Err(e) => {
                warn!(batch_id = batch_id.as_str(), error = %e, "template expansion failed");
                publisher.publish(
                    BatchState::new(batch_id.clone(), BatchStatus::Error, 0)
                        .with_error(e.to_string()),
                );
                return BatchHandle::new(
                    batch_id,
                    latest,
                    events,
                    Arc::new(CancellationController::new()),
                );
            }
        };

        let total = requests.len();
        if total == 0 {
            publisher.publish(BatchState::new(batch_id.clone(), BatchStatus::Completed, 0));
            return BatchHandle::new(
                batch_id,
                latest,
                events,
                Arc::new(CancellationController::new()),
            );
        }
        publisher.publish(BatchState::new(
            batch_id.clone(),
            BatchStatus::SendingRequests,
            total,
        ));
        self.launch(
            batch_id,
            requests,
            total,
            ResponseAggregator::new(),
            publisher,
            latest,
            events,
            sink,
        )
    }

    /// Re-run the requests whose response in `previous` carries an error.
    ///
    /// New outcomes are merged into the previous map. Each retried request's
    /// backoff restarts at attempt 0.
    pub fn retry_failed(
        &self,
        previous: &BatchState,
        requests: &[Request],
        sink: Arc<dyn ProgressSink>,
    ) -> BatchHandle {
        let failed: HashSet<String> = previous.failed_ids().into_iter().collect();
        let subset: Vec<Request> = requests
            .iter()
            .filter(|r| failed.contains(&r.id))
            .cloned()
            .collect();

        if subset.is_empty() {
            debug!(batch_id = previous.id.as_str(), "nothing to retry");
            let completed = previous.responses.len();
            return BatchHandle::finished(
                BatchState::new(new_batch_id(), BatchStatus::Completed, previous.total_count)
                    .with_responses(previous.responses.clone(), completed),
            );
        }
        self.relaunch(previous, subset, sink)
    }

    /// Re-run one request, leaving every other result of `previous` untouched.
    pub fn retry_one(
        &self,
        previous: &BatchState,
        request: Request,
        sink: Arc<dyn ProgressSink>,
    ) -> BatchHandle {
        self.relaunch(previous, vec![request], sink)
    }

    fn relaunch(
        &self,
        previous: &BatchState,
        subset: Vec<Request>,
        sink: Arc<dyn ProgressSink>,
    ) -> BatchHandle {
        let batch_id = new_batch_id();
        if let Err(e) = validate_ids(&subset) {
            return BatchHandle::finished(
                BatchState::new(batch_id, BatchStatus::Error, previous.total_count)
                    .with_error(e.to_string()),
            );
        }

        let aggregator =
            ResponseAggregator::seeded(&previous.responses, subset.iter().map(|r| r.id.as_str()));
        let (responses, completed) =
            aggregator.with_snapshot(|responses, completed| (responses.clone(), completed));
        let total = previous.total_count.max(completed + subset.len());
        let initial = BatchState::new(batch_id.clone(), BatchStatus::SendingRequests, total)
            .with_responses(responses, completed);

        let (publisher, latest, events) = StatePublisher::channel(initial);
        info!(
            batch_id = batch_id.as_str(),
            previous_batch_id = previous.id.as_str(),
            retrying = subset.len(),
            "retrying requests"
        );
        self.launch(
            batch_id, subset, total, aggregator, publisher, latest, events, sink,
        )
    }

    /// Cancel the running batch and interrupt the provider's in-flight calls.
    pub fn cancel(&self) {
        if let Some(active) = self.lock_active().as_ref() {
            info!(batch_id = active.id.as_str(), "cancelling batch");
            active.cancel.cancel_all();
        }
        self.provider().cancel();
    }

    pub fn signals(&self) -> DispatchSignals {
        let max = self.config.max_concurrent_requests;
        let available = self.semaphore.available_permits().min(max);
        DispatchSignals {
            batch_id: self.lock_active().as_ref().map(|a| a.id.clone()),
            inflight: InflightSnapshot {
                max,
                available,
                in_use: max - available,
            },
            rate_limiter: self.rate_limiter.snapshot(),
        }
    }

    /// Cancel any running batch and close every provider this dispatcher knows.
    pub async fn close(&self) {
        let cancel = self.lock_active().take().map(|a| a.cancel);
        if let Some(cancel) = cancel {
            cancel.cancel_all();
        }
        let current = self.provider();
        current.close().await;
        self.registry.close_all().await;
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveBatch>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reject_invalid(
        &self,
        batch_id: &str,
        requests: &[Request],
        total: usize,
    ) -> Option<BatchHandle> {
        if requests.is_empty() {
            debug!(batch_id, "empty batch");
            return Some(BatchHandle::finished(BatchState::new(
                batch_id,
                BatchStatus::Completed,
                0,
            )));
        }
        if let Err(e) = validate_ids(requests) {
            warn!(batch_id, error = %e, "batch rejected");
            return Some(BatchHandle::finished(
                BatchState::new(batch_id, BatchStatus::Error, total).with_error(e.to_string()),
            ));
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        batch_id: String,
        requests: Vec<Request>,
        total: usize,
        aggregator: ResponseAggregator,
        publisher: StatePublisher,
        latest: tokio::sync::watch::Receiver<BatchState>,
        events: tokio::sync::mpsc::UnboundedReceiver<BatchState>,
        sink: Arc<dyn ProgressSink>,
    ) -> BatchHandle {
        let cancel = Arc::new(CancellationController::new());
        *self.lock_active() = Some(ActiveBatch {
            id: batch_id.clone(),
            cancel: Arc::clone(&cancel),
        });

        let run = Arc::new(BatchRun {
            id: batch_id.clone(),
            total,
            provider: self.provider(),
            cancel: Arc::clone(&cancel),
            semaphore: Arc::clone(&self.semaphore),
            turns: Arc::clone(&self.turns),
            rate_limiter: Arc::clone(&self.rate_limiter),
            retry: Arc::clone(&self.retry),
            aggregator,
            publisher,
            sink,
            per_request_timeout: self.config.per_request_timeout(),
            batch_timeout: self.config.batch_timeout(),
            cancel_grace: self.config.poll_interval() * 3,
            max_attempts: self.retry.policy().max_attempts(),
        });

        info!(
            batch_id = batch_id.as_str(),
            total,
            provider = run.provider.name(),
            "batch started"
        );
        tokio::spawn(coordinate(run, requests));
        BatchHandle::new(batch_id, latest, events, cancel)
    }
}

impl std::fmt::Debug for BatchDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDispatcher")
            .field("config", &self.config)
            .field("provider", &self.provider().name().to_string())
            .finish()
    }
}

fn new_batch_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Whole seconds as `"5s"`, anything finer as `"1500ms"`.
fn display_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn validate_ids(requests: &[Request]) -> Result<()> {
    let mut seen = HashSet::with_capacity(requests.len());
    for r in requests {
        if !seen.insert(r.id.as_str()) {
            return Err(Error::validation_with_context(
                format!("duplicate request id '{}'", r.id),
                crate::ErrorContext::new()
                    .with_field_path("id")
                    .with_source("batch_dispatcher"),
            ));
        }
    }
    Ok(())
}

/// Everything one batch's tasks share.
struct BatchRun {
    id: String,
    total: usize,
    provider: Arc<dyn ProviderPort>,
    cancel: Arc<CancellationController>,
    semaphore: Arc<Semaphore>,
    turns: Arc<RequestTurns>,
    rate_limiter: Arc<RateLimiter>,
    retry: Arc<RetryExecutor>,
    aggregator: ResponseAggregator,
    publisher: StatePublisher,
    sink: Arc<dyn ProgressSink>,
    per_request_timeout: Duration,
    batch_timeout: Duration,
    cancel_grace: Duration,
    max_attempts: u32,
}

enum UnitOutcome {
    Succeeded(String),
    Failed(String),
    Cancelled,
}

impl BatchRun {
    fn state(
        &self,
        status: BatchStatus,
        responses: &HashMap<String, Response>,
        completed: usize,
    ) -> BatchState {
        BatchState::new(self.id.clone(), status, self.total).with_responses(responses.clone(), completed)
    }

    fn publish_terminal(&self, status: BatchStatus, error: Option<String>) -> BatchState {
        self.aggregator.with_snapshot(|responses, completed| {
            let mut state = self.state(status, responses, completed);
            state.error = error;
            self.publisher.publish(state.clone());
            state
        })
    }

    /// Human-readable failure recorded in `Response::error`.
    fn describe_failure(&self, err: &Error) -> String {
        let kind = err.kind();
        if err.is_retryable() {
            let noun = if self.max_attempts == 1 { "attempt" } else { "attempts" };
            format!(
                "{}: {} (gave up after {} {})",
                kind, err, self.max_attempts, noun
            )
        } else {
            format!("{}: {} (not retried)", kind, err)
        }
    }
}

async fn coordinate(run: Arc<BatchRun>, requests: Vec<Request>) {
    let started = Instant::now();
    let mut units = JoinSet::new();
    for request in requests {
        units.spawn(run_unit(Arc::clone(&run), request));
    }

    let deadline = tokio::time::sleep(run.batch_timeout);
    tokio::pin!(deadline);

    let mut deadline_hit = false;
    loop {
        tokio::select! {
            biased;
            _ = run.cancel.cancelled() => break,
            _ = &mut deadline => {
                warn!(batch_id = run.id.as_str(), "batch deadline exceeded, cancelling");
                deadline_hit = true;
                run.cancel.cancel_all();
                break;
            }
            joined = units.join_next() => match joined {
                Some(Err(e)) if e.is_panic() => {
                    warn!(batch_id = run.id.as_str(), "request task panicked outside its guard");
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    let state = if run.cancel.is_set() {
        // Units parked at a checkpoint exit within one poll increment; give
        // them that long, then finalise without waiting on provider calls.
        let drain = async { while units.join_next().await.is_some() {} };
        if tokio::time::timeout(run.cancel_grace, drain).await.is_err() {
            debug!(
                batch_id = run.id.as_str(),
                detached = units.len(),
                "finalising with requests still in flight"
            );
        }
        units.detach_all();
        let error = if deadline_hit {
            format!(
                "batch deadline exceeded after {}",
                display_duration(run.batch_timeout)
            )
        } else {
            "batch cancelled".to_string()
        };
        run.publish_terminal(BatchStatus::Cancelled, Some(error))
    } else {
        run.publish_terminal(BatchStatus::Completed, None)
    };

    info!(
        batch_id = run.id.as_str(),
        status = ?state.status,
        total = state.total_count,
        completed = state.completed_count,
        failed = state.failed_count(),
        duration_ms = started.elapsed().as_millis() as u64,
        "batch finished"
    );
}

async fn run_unit(run: Arc<BatchRun>, request: Request) {
    let handle = run.cancel.register(&request.id);
    let outcome = AssertUnwindSafe(execute(&run, &handle, &request))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            warn!(request_id = request.id.as_str(), "request task panicked");
            UnitOutcome::Failed("UNKNOWN: request task panicked (not retried)".to_string())
        });
    run.cancel.unregister(&request.id);
    finish(&run, request.id, outcome).await;
}

/// Admission, rate limiting and the retried provider call. The id's turn and
/// the concurrency permit are released when this returns.
async fn execute(run: &BatchRun, handle: &CancelHandle, request: &Request) -> UnitOutcome {
    let _turn = tokio::select! {
        biased;
        _ = handle.cancelled() => return UnitOutcome::Cancelled,
        turn = run.turns.acquire(&request.id) => turn,
    };
    // Any earlier run of this id has ended; backoff restarts at attempt 0.
    run.retry.reset(&request.id);

    let _permit = tokio::select! {
        biased;
        _ = handle.cancelled() => return UnitOutcome::Cancelled,
        permit = Arc::clone(&run.semaphore).acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return UnitOutcome::Cancelled,
        },
    };

    if run.cancel.checkpoint().is_err() {
        return UnitOutcome::Cancelled;
    }
    if let Err(e) = run.rate_limiter.acquire_slot(&run.cancel).await {
        return if e.is_cancelled() {
            UnitOutcome::Cancelled
        } else {
            UnitOutcome::Failed(run.describe_failure(&e))
        };
    }
    if run.cancel.checkpoint().is_err() {
        return UnitOutcome::Cancelled;
    }

    debug!(request_id = request.id.as_str(), "sending request");
    let provider = &run.provider;
    let cancel: &CancellationController = &run.cancel;
    let attempts = run.retry.run(&request.id, cancel, move || async move {
        if let Err(e) = cancel.checkpoint() {
            return Err(e);
        }
        match provider.send(request).await {
            Err(e) if cancel.is_set() && !e.is_cancelled() => {
                debug!(request_id = request.id.as_str(), error = %e, "failure after cancellation");
                Err(Error::Cancelled)
            }
            other => other,
        }
    });

    match tokio::time::timeout(run.per_request_timeout, attempts).await {
        Ok(Ok(content)) => UnitOutcome::Succeeded(content),
        Ok(Err(e)) if e.is_cancelled() => UnitOutcome::Cancelled,
        Ok(Err(e)) => UnitOutcome::Failed(run.describe_failure(&e)),
        Err(_) => {
            let used = run.retry.state(&request.id).map_or(0, |st| st.attempt);
            run.retry.reset(&request.id);
            let err = Error::Timeout {
                after: run.per_request_timeout,
            };
            debug!(request_id = request.id.as_str(), attempts = used, error = %err, "request timed out");
            UnitOutcome::Failed(format!(
                "{}: request exceeded {} (attempts remaining: {} of {})",
                err.kind(),
                display_duration(run.per_request_timeout),
                run.max_attempts.saturating_sub(used),
                run.max_attempts
            ))
        }
    }
}

async fn finish(run: &BatchRun, id: String, outcome: UnitOutcome) {
    let (content, error, response) = match outcome {
        UnitOutcome::Succeeded(content) => (
            content.clone(),
            None,
            Some(Response::success(id.clone(), content)),
        ),
        UnitOutcome::Failed(error) => (
            String::new(),
            Some(error.clone()),
            Some(Response::failure(id.clone(), error)),
        ),
        UnitOutcome::Cancelled => (String::new(), Some(CANCELLED_MESSAGE.to_string()), None),
    };

    let completed = match response {
        Some(response) => {
            debug!(
                request_id = id.as_str(),
                success = response.is_success(),
                "request finished"
            );
            run.aggregator.record_with(response, |responses, completed| {
                run.publisher
                    .publish(run.state(BatchStatus::SendingRequests, responses, completed));
                completed
            })
        }
        None => {
            debug!(request_id = id.as_str(), "request cancelled");
            run.aggregator.completed_count()
        }
    };

    let event = ProgressEvent::new(id, content, error).with_counts(completed, run.total);
    report_isolated(run.sink.as_ref(), event).await;
}
