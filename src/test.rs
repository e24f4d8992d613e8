#![cfg(any(test, feature = "test"))]
//! Helpers for testing code that uses the cache: a scriptable data source and tracing setup.

use crate::{error::FetchError, traits::DataSource, types::{QueryPage, QueryRequest}};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{fmt::Debug, sync::atomic::{AtomicUsize, Ordering}, time::Duration};
use tokio::sync::{oneshot, Notify};

type Responder<I> = Box<dyn Fn(&QueryRequest) -> Result<QueryPage<I>, FetchError> + Send + Sync + 'static>;
type Gate<I> = oneshot::Sender<Result<QueryPage<I>, FetchError>>;

/// Data source answering from a closure, or holding every call until the test releases it.
///
/// Each call is recorded, so tests can assert on how many reached the "backend" and what they asked for.
pub struct MockSource<I> {
    responder:   Option<Responder<I>>,
    delay:       Option<Duration>,
    calls:       AtomicUsize,
    requests:    Mutex<Vec<QueryRequest>>,
    gates:       Mutex<Vec<Option<Gate<I>>>>,
    call_notify: Notify,
}

impl<I> MockSource<I>
where
    I: Debug + Clone + Send + Sync + 'static,
{
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&QueryRequest) -> Result<QueryPage<I>, FetchError> + Send + Sync + 'static,
    {
        Self {
            responder:   Some(Box::new(responder)),
            delay:       None,
            calls:       AtomicUsize::new(0),
            requests:    Mutex::new(Vec::new()),
            gates:       Mutex::new(Vec::new()),
            call_notify: Notify::new(),
        }
    }

    /// Every call waits until [`release`](Self::release) is called for it.
    pub fn gated() -> Self {
        Self {
            responder:   None,
            delay:       None,
            calls:       AtomicUsize::new(0),
            requests:    Mutex::new(Vec::new()),
            gates:       Mutex::new(Vec::new()),
            call_notify: Notify::new(),
        }
    }

    /// Always answers with `items`, reporting `total_count` rows.
    pub fn fixed(items: Vec<I>, total_count: u64) -> Self {
        Self::new(move |_| Ok(QueryPage::new(items.clone(), total_count)))
    }

    /// Answer only after `delay` has passed.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().clone()
    }

    /// Complete the `idx`-th call (0-based) with `result`. Returns false if there is no such pending call.
    pub fn release(&self, idx: usize, result: Result<QueryPage<I>, FetchError>) -> bool {
        let gate = self.gates.lock().get_mut(idx).and_then(Option::take);
        gate.is_some_and(|gate| gate.send(result).is_ok())
    }

    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let notified = self.call_notify.notified();
            if self.call_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl<I> DataSource for MockSource<I>
where
    I: Debug + Clone + Send + Sync + 'static,
{
    type Item = I;

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage<I>, FetchError> {
        self.requests.lock().push(request.clone());
        let gate = if self.responder.is_none() {
            let (sender, receiver) = oneshot::channel();
            self.gates.lock().push(Some(sender));
            Some(receiver)
        }
        else {
            None
        };
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_notify.notify_waiters();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match (gate, &self.responder) {
            (Some(receiver), _) => receiver
                .await
                .unwrap_or_else(|_| Err(FetchError::Aborted("gate dropped without release".into()))),
            (None, Some(responder)) => responder(request),
            (None, None) => Err(FetchError::permanent("mock source has no responder")),
        }
    }
}

impl<I> Debug for MockSource<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSource")
            .field("gated", &self.responder.is_none())
            .field("calls", &self.calls.load(Ordering::SeqCst))
            .finish()
    }
}

/// Install an `EnvFilter`-driven subscriber writing to the test output. Safe to call more than once.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::from_default_env();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub fn init_tracing() {}
