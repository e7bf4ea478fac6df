//! Single-flight token refresh
//!
//! Any number of requests may discover at the same moment that the access
//! token has expired. Only the first one starts a refresh exchange; the rest
//! join it and receive the same outcome.
//!
//! The exchange runs on its own task, so it completes even if the request
//! that started it is dropped. The task clears the in-flight marker before
//! publishing the outcome, which means a trigger arriving after settlement
//! always starts a new exchange instead of reusing a stale result. The marker
//! is cleared as well when the task dies without an outcome (a panicking
//! exchange); waiters then get [`RefreshError::Aborted`].

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::RefreshError;

pub type RefreshOutcome = Result<(), RefreshError>;

type OutcomeRx = watch::Receiver<Option<RefreshOutcome>>;
type OutcomeTx = watch::Sender<Option<RefreshOutcome>>;
type Marker = Arc<Mutex<Option<OutcomeRx>>>;

/// Owner of the "refresh in flight" marker
#[derive(Debug, Clone, Default)]
pub struct RefreshCoordinator {
    in_flight: Marker,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an exchange is currently outstanding
    pub fn is_refreshing(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Join the in-flight refresh, or start one with `exchange` if none is
    /// outstanding. `exchange` is only called when this caller becomes the
    /// leader.
    pub async fn refresh<F, Fut>(&self, exchange: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome> + Send + 'static,
    {
        let mut rx = {
            let mut slot = lock(&self.in_flight);
            match slot.as_ref() {
                Some(rx) => {
                    tracing::debug!("Joining in-flight token refresh");
                    rx.clone()
                }
                None => {
                    let exchange = exchange();
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());

                    let settlement = Settlement {
                        in_flight: Arc::clone(&self.in_flight),
                        tx: Some(tx),
                    };
                    tokio::spawn(async move {
                        let outcome = exchange.await;
                        settlement.publish(outcome);
                    });
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(RefreshError::Aborted))
    }
}

/// Settles one exchange: clears the marker, then wakes the waiters.
///
/// Dropped without publishing, it still clears the marker before the sender
/// goes away.
struct Settlement {
    in_flight: Marker,
    tx: Option<OutcomeTx>,
}

impl Settlement {
    fn publish(mut self, outcome: RefreshOutcome) {
        if let Some(tx) = self.tx.take() {
            lock(&self.in_flight).take();
            tx.send_replace(Some(outcome));
        }
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::warn!("Token refresh ended without an outcome");
            lock(&self.in_flight).take();
            drop(tx);
        }
    }
}

fn lock(marker: &Mutex<Option<OutcomeRx>>) -> MutexGuard<'_, Option<OutcomeRx>> {
    marker.lock().unwrap_or_else(|e| e.into_inner())
}
