#![allow(dead_code)]

use ai_batch_dispatch::{Error, ProviderPort, Request, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Provider whose replies are scripted per request id.
///
/// Unscripted calls echo the request content. Each call sleeps for `latency`
/// and records its start time and the number of calls in flight.
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<std::result::Result<String, String>>>>,
    calls: Mutex<HashMap<String, usize>>,
    starts: Mutex<Vec<Instant>>,
    latency: Duration,
    inflight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            starts: Mutex::new(Vec::new()),
            latency,
            inflight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Queue a failure message for the next call with `id`.
    pub fn fail(&self, id: &str, message: &str) -> &Self {
        self.push(id, Err(message.to_string()))
    }

    /// Queue a success reply for the next call with `id`.
    pub fn reply(&self, id: &str, content: &str) -> &Self {
        self.push(id, Ok(content.to_string()))
    }

    fn push(&self, id: &str, outcome: std::result::Result<String, String>) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn calls(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderPort for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: &Request) -> Result<String> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(request.id.clone())
            .or_default() += 1;
        self.starts.lock().unwrap().push(Instant::now());

        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.id)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(Ok(content)) => Ok(content),
            Some(Err(message)) => Err(Error::provider(message)),
            None => Ok(format!("echo: {}", request.content)),
        }
    }
}

pub fn requests(n: usize) -> Vec<Request> {
    (0..n)
        .map(|i| Request::new(format!("r{i}"), format!("prompt {i}")))
        .collect()
}
