//! Step execution context
//!
//! A [`StepContext`] is threaded through every `prepare`, `execute` and
//! `rollback` call. It carries the cancellation token, an optional deadline,
//! the notification sink, and string values that `prepare` may add for the
//! step that follows.

use crate::error::StepError;
use crate::notify::{Notifier, TracingNotifier};
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why guarded work stopped before completing
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Interrupt {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl From<Interrupt> for StepError {
    fn from(interrupt: Interrupt) -> Self {
        StepError::from_cause(crate::error::ErrorKind::Internal, interrupt)
    }
}

/// Context passed to steps
#[derive(Clone)]
pub struct StepContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    notifier: Arc<dyn Notifier>,
    values: BTreeMap<String, String>,
}

impl Default for StepContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .field("values", &self.values)
            .finish()
    }
}

impl StepContext {
    /// New context with a fresh token, no deadline and a tracing notifier
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            notifier: Arc::new(TracingNotifier),
            values: BTreeMap::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the context is already cancelled or past its deadline
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(Interrupt::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Context for rollback calls
    ///
    /// Same notifier and values, but a fresh token and no deadline, so undo
    /// work still runs after the forward run was cancelled.
    pub fn detached(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            notifier: self.notifier.clone(),
            values: self.values.clone(),
        }
    }

    /// Race `fut` against cancellation and the deadline
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        let deadline = self.deadline;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = sleep_until(deadline) => Err(Interrupt::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration`, waking early on cancellation or deadline
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        self.guard(tokio::time::sleep(duration)).await
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

type Factory<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<T>, StepError>> + Send + Sync>;

/// Lazily constructed collaborator shared by the steps of one build
///
/// The factory runs at most once, on first [`Provider::get`]; every clone
/// of the provider sees the same instance.
pub struct Provider<T: ?Sized> {
    cell: Arc<OnceCell<Arc<T>>>,
    factory: Option<Factory<T>>,
}

impl<T: ?Sized> Clone for Provider<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for Provider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("initialized", &self.cell.initialized())
            .finish()
    }
}

impl<T: ?Sized + Send + Sync + 'static> Provider<T> {
    /// Provider that builds its instance with `factory` on first use
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<T>, StepError>> + Send + 'static,
    {
        let factory: Factory<T> = Arc::new(move || factory().boxed());
        Self {
            cell: Arc::new(OnceCell::new()),
            factory: Some(factory),
        }
    }

    /// Provider around an existing instance
    pub fn ready(value: Arc<T>) -> Self {
        Self {
            cell: Arc::new(OnceCell::new_with(Some(value))),
            factory: None,
        }
    }

    /// Get the instance, constructing it on first call
    pub async fn get(&self) -> Result<Arc<T>, StepError> {
        let value = self
            .cell
            .get_or_try_init(|| async {
                match &self.factory {
                    Some(factory) => factory().await,
                    None => Err(StepError::internal("provider has no factory")),
                }
            })
            .await?;
        Ok(value.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_guard_completes() {
        let ctx = StepContext::new();
        assert_eq!(ctx.guard(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_guard_cancelled() {
        let ctx = StepContext::new();
        ctx.cancellation().cancel();

        let result = ctx.guard(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupt::Cancelled));
        assert_eq!(ctx.check(), Err(Interrupt::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_deadline() {
        let ctx = StepContext::new().with_timeout(Duration::from_secs(5));

        let result = ctx.sleep(Duration::from_secs(60)).await;
        assert_eq!(result, Err(Interrupt::DeadlineExceeded));
        assert_eq!(ctx.check(), Err(Interrupt::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_detached_ignores_parent_cancellation() {
        let ctx = StepContext::new()
            .with_timeout(Duration::from_secs(1))
            .with_value("node", "worker-1");
        ctx.cancellation().cancel();

        let detached = ctx.detached();
        assert!(!detached.is_cancelled());
        assert!(detached.deadline().is_none());
        assert_eq!(detached.value("node"), Some("worker-1"));
        assert!(detached.check().is_ok());
    }

    #[test]
    fn test_interrupt_maps_to_internal() {
        let err: StepError = Interrupt::Cancelled.into();
        assert!(err.is(ErrorKind::Internal));
        assert_eq!(err.message(), "operation cancelled");
    }

    #[tokio::test]
    async fn test_provider_builds_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let provider: Provider<String> = Provider::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new("client".to_string()))
            }
        });

        let clone = provider.clone();
        assert!(!provider.is_initialized());
        assert_eq!(*provider.get().await.unwrap(), "client");
        assert_eq!(*clone.get().await.unwrap(), "client");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_factory_error_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let provider: Provider<String> = Provider::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StepError::internal("no kubeconfig"))
            }
        });

        assert!(provider.get().await.is_err());
        assert!(provider.get().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_provider_ready() {
        let provider = Provider::ready(Arc::new(5u32));
        assert!(provider.is_initialized());
        assert_eq!(*provider.get().await.unwrap(), 5);
    }
}
