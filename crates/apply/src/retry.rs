use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{Resource, Result};
use keel_kubehub::{ClusterGateway, ListOpts, PatchType};
use tracing::warn;

/// Backoff before the second attempt of a retried gateway call.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Runs `op` up to `attempts` times, sleeping `base * 2^(n-1)` between
/// attempts while the error stays retryable.
pub async fn with_retries<T, F, Fut>(what: &str, attempts: u32, base: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts && e.is_retryable() => {
                let delay = base * 2u32.pow(attempt - 1);
                warn!(what, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retries each retryable gateway call on its own, so a failure late in an
/// apply never repeats the calls that already went through.
#[derive(Clone)]
pub struct RetryingGateway {
    inner: Arc<dyn ClusterGateway>,
    attempts: u32,
    base: Duration,
}

impl RetryingGateway {
    pub fn new(inner: Arc<dyn ClusterGateway>, attempts: u32, base: Duration) -> Self { Self { inner, attempts, base } }
}

#[async_trait]
impl ClusterGateway for RetryingGateway {
    async fn create(&self, res: &Resource) -> Result<Resource> {
        let inner = self.inner.as_ref();
        with_retries("create", self.attempts, self.base, move || inner.create(res)).await
    }

    async fn update(&self, res: &Resource) -> Result<Resource> {
        let inner = self.inner.as_ref();
        with_retries("update", self.attempts, self.base, move || inner.update(res)).await
    }

    async fn patch(&self, res: &Resource, patch_type: PatchType, data: &[u8]) -> Result<Resource> {
        let inner = self.inner.as_ref();
        with_retries("patch", self.attempts, self.base, move || inner.patch(res, patch_type, data)).await
    }

    async fn delete(&self, res: &Resource) -> Result<()> {
        let inner = self.inner.as_ref();
        with_retries("delete", self.attempts, self.base, move || inner.delete(res)).await
    }

    async fn get(&self, res: &Resource) -> Result<Resource> {
        let inner = self.inner.as_ref();
        with_retries("get", self.attempts, self.base, move || inner.get(res)).await
    }

    async fn exists(&self, res: &Resource) -> Result<bool> {
        let inner = self.inner.as_ref();
        with_retries("exists", self.attempts, self.base, move || inner.exists(res)).await
    }

    async fn list(&self, selector: &str, opts: &ListOpts) -> Result<Vec<Resource>> {
        let inner = self.inner.as_ref();
        with_retries("list", self.attempts, self.base, move || inner.list(selector, opts)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transport_errors_with_backoff() {
        let calls = &AtomicU32::new(0);
        let t0 = tokio::time::Instant::now();
        let out = with_retries("get", 3, Duration::from_millis(100), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Transport("connection reset".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(t0.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_calls_are_retried_one_by_one() {
        use keel_kubehub::memory::Verb;
        use keel_kubehub::MemoryGateway;
        use serde_json::json;

        let mem = Arc::new(MemoryGateway::new());
        let cm = mem.insert(Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "namespace": "ns"}})).unwrap());
        mem.fail_next(Verb::Get, "c", Error::Transport("connection reset".into()));
        mem.fail_next(Verb::Get, "c", Error::Transport("connection reset".into()));
        let gw = RetryingGateway::new(mem.clone(), 3, Duration::from_millis(100));

        let t0 = tokio::time::Instant::now();
        assert_eq!(gw.get(&cm).await.unwrap().name(), "c");
        assert_eq!(t0.elapsed(), Duration::from_millis(300));
        assert_eq!(mem.count(Verb::Get), 3);

        mem.fail_next(Verb::Delete, "c", Error::Invalid(keel_core::ApiFailure::new(422, "Invalid", "nope")));
        assert!(gw.delete(&cm).await.unwrap_err().is_invalid());
        assert_eq!(mem.count(Verb::Delete), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_on_other_errors() {
        let calls = &AtomicU32::new(0);
        let err = with_retries("get", 5, Duration::from_millis(100), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Validation("bad".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
