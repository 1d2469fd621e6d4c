mod common;

use ai_batch_dispatch::progress::{noop_sink, InMemoryProgressSink, ProgressEvent};
use ai_batch_dispatch::{
    BatchDispatcher, BatchState, BatchStatus, DispatchConfig, Error, FailureKind, ProgressSink,
    ProviderPort, Request, Result,
};
use async_trait::async_trait;
use common::{requests, ScriptedProvider};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn config() -> DispatchConfig {
    DispatchConfig::default()
        .with_requests_per_minute(1_000)
        .with_initial_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(1))
}

fn dispatcher(cfg: DispatchConfig, provider: &Arc<ScriptedProvider>) -> BatchDispatcher {
    let provider: Arc<dyn ProviderPort> = Arc::clone(provider) as Arc<dyn ProviderPort>;
    BatchDispatcher::new(cfg, provider).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_five_requests_with_concurrency_two_complete() {
    let provider = Arc::new(ScriptedProvider::with_latency(Duration::from_millis(50)));
    let d = dispatcher(config().with_max_concurrent_requests(2), &provider);

    let state = d.dispatch(requests(5), noop_sink()).wait().await;

    assert_eq!(state.status, BatchStatus::Completed);
    assert!(state.is_complete);
    assert_eq!(state.responses.len(), 5);
    assert_eq!(state.completed_count, 5);
    assert_eq!(state.total_count, 5);
    assert!(state.responses.values().all(|r| r.error.is_none()));
    assert_eq!(state.responses["r3"].content, "echo: prompt 3");
    assert!(provider.peak_concurrency() <= 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_ceiling_is_never_exceeded() {
    let provider = Arc::new(ScriptedProvider::with_latency(Duration::from_millis(100)));
    let d = dispatcher(config().with_max_concurrent_requests(3), &provider);

    let state = d.dispatch(requests(12), noop_sink()).wait().await;

    assert_eq!(state.completed_count, 12);
    assert_eq!(provider.peak_concurrency(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let provider = Arc::new(ScriptedProvider::new());
    provider
        .fail("r0", "429 too many requests")
        .fail("r0", "429 too many requests");
    let d = dispatcher(config().with_max_retries(3), &provider);

    let state = d.dispatch(requests(1), noop_sink()).wait().await;

    assert_eq!(state.status, BatchStatus::Completed);
    assert!(state.responses["r0"].error.is_none());
    assert_eq!(provider.calls("r0"), 3);
    assert!(d.retry_state("r0").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_failure_is_classified_once() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.fail("r0", "invalid api key");
    let d = dispatcher(config(), &provider);

    let state = d.dispatch(requests(1), noop_sink()).wait().await;

    let error = state.responses["r0"].error.clone().unwrap();
    assert_eq!(error, "AUTHORIZATION: invalid api key (not retried)");
    assert_eq!(
        FailureKind::from_recorded(&error),
        Some(FailureKind::Authorization)
    );
    assert_eq!(provider.calls("r0"), 1);
    assert_eq!(state.status, BatchStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_attempts() {
    let provider = Arc::new(ScriptedProvider::new());
    for _ in 0..3 {
        provider.fail("r0", "503 service unavailable");
    }
    let d = dispatcher(config().with_max_retries(3), &provider);

    let state = d.dispatch(requests(1), noop_sink()).wait().await;

    assert_eq!(
        state.responses["r0"].error.as_deref(),
        Some("CONNECTION: 503 service unavailable (gave up after 3 attempts)")
    );
    assert_eq!(provider.calls("r0"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_one_failure_does_not_affect_siblings() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.fail("r1", "model exploded");
    let d = dispatcher(config(), &provider);

    let state = d.dispatch(requests(4), noop_sink()).wait().await;

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(state.failed_ids(), vec!["r1".to_string()]);
    assert_eq!(state.succeeded_count(), 3);
    assert_eq!(
        state.responses["r1"].error.as_deref(),
        Some("UNKNOWN: model exploded (not retried)")
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_window_bounds_dispatch_starts() {
    let provider = Arc::new(ScriptedProvider::new());
    let d = dispatcher(config().with_requests_per_minute(2), &provider);

    let state = d.dispatch(requests(5), noop_sink()).wait().await;
    assert_eq!(state.completed_count, 5);

    let mut starts = provider.start_times();
    starts.sort();
    assert_eq!(starts.len(), 5);
    for w in starts.windows(3) {
        assert!(w[2].duration_since(w[0]) >= Duration::from_secs(60));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_keeps_completed_responses() {
    let provider = Arc::new(ScriptedProvider::new());
    let d = dispatcher(config().with_requests_per_minute(1), &provider);
    let sink = Arc::new(InMemoryProgressSink::default());

    let mut handle = d.dispatch(requests(3), sink.clone());
    let mut states = handle.states();
    while let Some(state) = states.next().await {
        if state.completed_count == 1 {
            break;
        }
    }

    let cancelled_at = Instant::now();
    handle.cancel();
    let mut last = None;
    while let Some(state) = states.next().await {
        last = Some(state);
    }
    let last = last.unwrap();

    assert_eq!(last.status, BatchStatus::Cancelled);
    assert!(last.is_complete);
    assert_eq!(last.responses.len(), 1);
    assert_eq!(last.completed_count, 1);
    assert_eq!(last.total_count, 3);
    assert_eq!(last.error.as_deref(), Some("batch cancelled"));
    assert!(cancelled_at.elapsed() < Duration::from_secs(1));
    assert_eq!(provider.total_calls(), 1);

    let cancelled: Vec<ProgressEvent> = sink
        .events()
        .into_iter()
        .filter(|e| e.error.as_deref() == Some("CANCELLED: batch cancelled"))
        .collect();
    assert_eq!(cancelled.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dispatcher_cancel_reaches_running_batch() {
    let provider = Arc::new(ScriptedProvider::new());
    let d = dispatcher(config().with_requests_per_minute(1), &provider);

    let handle = d.dispatch(requests(4), noop_sink());
    tokio::time::sleep(Duration::from_secs(1)).await;
    d.cancel();

    let state = handle.wait().await;
    assert_eq!(state.status, BatchStatus::Cancelled);
    assert_eq!(state.responses.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_batch_deadline_cancels_with_narrative() {
    let provider = Arc::new(ScriptedProvider::with_latency(Duration::from_secs(60)));
    let d = dispatcher(config().with_batch_timeout(Duration::from_secs(5)), &provider);

    let started = Instant::now();
    let state = d.dispatch(requests(2), noop_sink()).wait().await;

    assert_eq!(state.status, BatchStatus::Cancelled);
    assert_eq!(
        state.error.as_deref(),
        Some("batch deadline exceeded after 5s")
    );
    assert!(state.responses.is_empty());
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_per_request_timeout_is_terminal() {
    let provider = Arc::new(ScriptedProvider::with_latency(Duration::from_secs(10)));
    let d = dispatcher(
        config().with_per_request_timeout(Duration::from_secs(1)),
        &provider,
    );

    let state = d.dispatch(requests(1), noop_sink()).wait().await;

    assert_eq!(
        state.responses["r0"].error.as_deref(),
        Some("TIMEOUT: request exceeded 1s (attempts remaining: 2 of 3)")
    );
    assert_eq!(provider.calls("r0"), 1);
    assert!(d.retry_state("r0").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_snapshots_are_monotone_with_one_terminal() {
    let provider = Arc::new(ScriptedProvider::with_latency(Duration::from_millis(10)));
    let d = dispatcher(config().with_max_concurrent_requests(4), &provider);

    let states: Vec<BatchState> = d
        .dispatch(requests(20), noop_sink())
        .into_stream()
        .collect()
        .await;

    assert_eq!(states.first().unwrap().status, BatchStatus::SendingRequests);
    assert_eq!(states.iter().filter(|s| s.is_complete).count(), 1);
    assert!(states.last().unwrap().is_complete);
    for w in states.windows(2) {
        assert!(w[1].completed_count >= w[0].completed_count);
        assert!(w[1].responses.len() >= w[0].responses.len());
    }
    assert_eq!(states.last().unwrap().completed_count, 20);
}

struct PanickingSink;

#[async_trait]
impl ProgressSink for PanickingSink {
    async fn report(&self, event: ProgressEvent) -> Result<()> {
        if event.request_id == "r0" {
            panic!("observer bug");
        }
        Err(Error::runtime("observer unavailable"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_failing_progress_sink_does_not_abort_batch() {
    let provider = Arc::new(ScriptedProvider::new());
    let d = dispatcher(config(), &provider);

    let state = d.dispatch(requests(3), Arc::new(PanickingSink)).wait().await;

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(state.succeeded_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_progress_sink_sees_every_request() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.fail("r2", "invalid api key");
    let d = dispatcher(config(), &provider);
    let sink = Arc::new(InMemoryProgressSink::default());

    d.dispatch(requests(3), sink.clone()).wait().await;

    let events = sink.events();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.total == 3));
    assert!(sink.events_for("r2")[0].error.is_some());
    assert_eq!(sink.events_for("r0")[0].content, "echo: prompt 0");
}

#[tokio::test(start_paused = true)]
async fn test_retry_failed_merges_into_previous_results() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.fail("r1", "invalid api key");
    let d = dispatcher(config(), &provider);
    let reqs = requests(3);

    let first = d.dispatch(reqs.clone(), noop_sink()).wait().await;
    assert_eq!(first.failed_ids(), vec!["r1".to_string()]);

    let handle = d.retry_failed(&first, &reqs, noop_sink());
    let initial = handle.latest();
    assert_eq!(initial.completed_count, 2);
    assert_eq!(initial.total_count, 3);

    let second = handle.wait().await;
    assert_eq!(second.status, BatchStatus::Completed);
    assert!(second.failed_ids().is_empty());
    assert_eq!(second.completed_count, 3);
    assert_eq!(second.responses.len(), 3);
    assert!(second.responses["r1"].error.is_none());
    assert_eq!(provider.calls("r0"), 1);
    assert_eq!(provider.calls("r1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_failed_with_nothing_to_retry() {
    let provider = Arc::new(ScriptedProvider::new());
    let d = dispatcher(config(), &provider);
    let reqs = requests(2);

    let first = d.dispatch(reqs.clone(), noop_sink()).wait().await;
    let again = d.retry_failed(&first, &reqs, noop_sink()).wait().await;

    assert_eq!(again.status, BatchStatus::Completed);
    assert_eq!(again.responses, first.responses);
    assert_eq!(provider.total_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_one_leaves_other_results() {
    let provider = Arc::new(ScriptedProvider::new());
    let d = dispatcher(config(), &provider);
    let reqs = requests(3);

    let first = d.dispatch(reqs.clone(), noop_sink()).wait().await;
    provider.reply("r2", "regenerated");
    let second = d
        .retry_one(&first, reqs[2].clone(), noop_sink())
        .wait()
        .await;

    assert_eq!(second.responses["r2"].content, "regenerated");
    assert_eq!(second.responses["r0"], first.responses["r0"]);
    assert_eq!(second.completed_count, 3);
    assert_eq!(provider.calls("r1"), 1);
    assert_eq!(provider.calls("r2"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_calls_left_by_cancelled_batch_count_against_ceiling() {
    let provider = Arc::new(ScriptedProvider::with_latency(Duration::from_secs(10)));
    let d = dispatcher(config().with_max_concurrent_requests(1), &provider);

    let handle = d.dispatch(requests(1), noop_sink());
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.cancel();
    assert_eq!(handle.wait().await.status, BatchStatus::Cancelled);
    assert_eq!(d.signals().inflight.in_use, 1);

    let next = d
        .dispatch(vec![Request::new("late", "after cancel")], noop_sink())
        .wait()
        .await;

    assert_eq!(next.status, BatchStatus::Completed);
    assert!(next.responses["late"].error.is_none());
    assert_eq!(provider.peak_concurrency(), 1);
    let starts = provider.start_times();
    assert_eq!(starts.len(), 2);
    assert!(starts[1].duration_since(starts[0]) >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_rerun_waits_for_call_left_by_cancelled_batch() {
    let provider = Arc::new(ScriptedProvider::with_latency(Duration::from_secs(10)));
    let d = dispatcher(config(), &provider);
    let reqs = requests(1);

    let handle = d.dispatch(reqs.clone(), noop_sink());
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.cancel();
    let cancelled = handle.wait().await;
    assert_eq!(cancelled.status, BatchStatus::Cancelled);
    assert!(cancelled.responses.is_empty());

    let second = d
        .retry_one(&cancelled, reqs[0].clone(), noop_sink())
        .wait()
        .await;

    assert_eq!(second.status, BatchStatus::Completed);
    assert!(second.responses["r0"].error.is_none());
    assert_eq!(provider.calls("r0"), 2);
    assert_eq!(provider.peak_concurrency(), 1);
    let starts = provider.start_times();
    assert!(starts[1].duration_since(starts[0]) >= Duration::from_secs(10));
    assert!(d.retry_state("r0").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_retry_restarts_backoff_of_interrupted_request() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.fail("r0", "429 too many requests");
    let d = dispatcher(
        config()
            .with_max_retries(3)
            .with_initial_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(30)),
        &provider,
    );
    let reqs = requests(1);

    let handle = d.dispatch(reqs.clone(), noop_sink());
    tokio::time::sleep(Duration::from_secs(1)).await;
    let interrupted = d.retry_state("r0").unwrap();
    assert_eq!(interrupted.attempt, 1);
    assert!(interrupted.backoff >= Duration::from_secs(10));

    handle.cancel();
    let cancelled = handle.wait().await;
    assert_eq!(cancelled.status, BatchStatus::Cancelled);
    assert_eq!(d.retry_state("r0").unwrap().attempt, 1);

    for _ in 0..3 {
        provider.fail("r0", "429 too many requests");
    }
    let retried = d
        .retry_one(&cancelled, reqs[0].clone(), noop_sink())
        .wait()
        .await;

    assert_eq!(provider.calls("r0"), 4);
    assert_eq!(
        retried.responses["r0"].error.as_deref(),
        Some("RATE_LIMIT: 429 too many requests (gave up after 3 attempts)")
    );
    assert!(d.retry_state("r0").is_none());
}

#[tokio::test]
async fn test_empty_batch_terminates_immediately() {
    let provider = Arc::new(ScriptedProvider::new());
    let d = dispatcher(config(), &provider);

    let states: Vec<BatchState> = d.dispatch(Vec::new(), noop_sink()).into_stream().collect().await;

    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status, BatchStatus::Completed);
    assert_eq!(states[0].total_count, 0);
}

#[tokio::test]
async fn test_duplicate_ids_are_rejected() {
    let provider = Arc::new(ScriptedProvider::new());
    let d = dispatcher(config(), &provider);

    let state = d
        .dispatch(
            vec![Request::new("same", "a"), Request::new("same", "b")],
            noop_sink(),
        )
        .wait()
        .await;

    assert_eq!(state.status, BatchStatus::Error);
    assert!(state.error.unwrap().contains("duplicate request id 'same'"));
    assert_eq!(provider.total_calls(), 0);
}

fn fan_out(
    template: &str,
    variables: &HashMap<String, Vec<String>>,
    _max: usize,
) -> Result<Vec<Request>> {
    let names = variables.get("name").cloned().unwrap_or_default();
    Ok(names
        .iter()
        .enumerate()
        .map(|(i, n)| Request::new(format!("t{i}"), template.replace("{name}", n)))
        .collect())
}

fn names(n: usize) -> HashMap<String, Vec<String>> {
    let mut vars = HashMap::new();
    vars.insert(
        "name".to_string(),
        (0..n).map(|i| format!("n{i}")).collect(),
    );
    vars
}

#[tokio::test(start_paused = true)]
async fn test_template_batch_walks_the_lifecycle() {
    let provider = Arc::new(ScriptedProvider::new());
    let d = dispatcher(config(), &provider);

    let states: Vec<BatchState> = d
        .dispatch_template(&fan_out, "hello {name}", &names(3), noop_sink())
        .into_stream()
        .collect()
        .await;

    let statuses: Vec<BatchStatus> = states.iter().map(|s| s.status).collect();
    assert_eq!(statuses[0], BatchStatus::Preparing);
    assert_eq!(statuses[1], BatchStatus::ProcessingTemplate);
    assert_eq!(statuses[2], BatchStatus::SendingRequests);
    assert_eq!(*statuses.last().unwrap(), BatchStatus::Completed);

    let last = states.last().unwrap();
    assert_eq!(last.total_count, 3);
    assert_eq!(last.responses["t1"].content, "echo: hello n1");
}

#[tokio::test]
async fn test_template_over_max_combinations_is_an_error() {
    let provider = Arc::new(ScriptedProvider::new());
    let d = dispatcher(config().with_max_combinations(2), &provider);

    let state = d
        .dispatch_template(&fan_out, "hello {name}", &names(3), noop_sink())
        .wait()
        .await;

    assert_eq!(state.status, BatchStatus::Error);
    assert!(state.error.unwrap().contains("max_combinations"));
    assert_eq!(provider.total_calls(), 0);
}

#[tokio::test]
async fn test_template_expansion_failure_is_an_error() {
    let provider = Arc::new(ScriptedProvider::new());
    let d = dispatcher(config(), &provider);
    let broken = |_: &str, _: &HashMap<String, Vec<String>>, _: usize| -> Result<Vec<Request>> {
        Err(Error::runtime("unknown placeholder {age}"))
    };

    let state = d
        .dispatch_template(&broken, "{age}", &HashMap::new(), noop_sink())
        .wait()
        .await;

    assert_eq!(state.status, BatchStatus::Error);
    assert!(state.error.unwrap().contains("unknown placeholder"));
}
