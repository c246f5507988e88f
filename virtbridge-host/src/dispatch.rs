//! Bounded dispatch of blocking host calls.
//!
//! Host calls block their thread for as long as the hypervisor takes to
//! answer. They run on tokio's blocking pool, and a semaphore caps how many
//! may be in flight at once.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::Semaphore;
use virtbridge_core::BridgeError;

/// Runs blocking closures with at most `limit` in flight.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl BlockingPool {
    /// Create a pool allowing `limit` concurrent blocking calls.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(limit)), limit }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of calls that could start right now without waiting.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` on the blocking pool once a slot is free.
    ///
    /// # Errors
    /// Returns whatever `f` returns, [`BridgeError::Internal`] if `f`
    /// panics, or [`BridgeError::Allocation`] if no worker slot can be
    /// obtained (the runtime is shutting down).
    pub async fn run<T, F>(&self, f: F) -> Result<T, BridgeError>
    where
        F: FnOnce() -> Result<T, BridgeError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::Allocation { what: "blocking worker slot" })?;

        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let detail = panic_message(e.into_panic().as_ref());
                tracing::error!(%detail, "blocking host call panicked");
                Err(BridgeError::Internal { detail })
            }
            Err(e) => {
                tracing::warn!(error = %e, "blocking host call was cancelled");
                Err(BridgeError::Allocation { what: "blocking worker" })
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
