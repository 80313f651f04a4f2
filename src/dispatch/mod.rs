//! Dispatcher Boundary
//!
//! The coordinator hands intents to a [`Dispatcher`] and awaits outcomes;
//! it never assumes execution is synchronous.
//!
//! ```text
//! Coordinator ── submit(Intent) ──▶ RetryingDispatcher ──▶ LocalDispatcher / external
//!      ▲                               (backoff, breaker)          │
//!      └──────────── IntentOutcome ◀───────────────────────────────┘
//! ```

pub mod local;
pub mod recovery;

pub use local::LocalDispatcher;
pub use recovery::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RecoveryStats, RetryPolicy, RetryingDispatcher};

use crate::intent::{Intent, IntentId, IntentOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Transport-level dispatch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher unavailable: {0}")]
    Unavailable(String),

    #[error("dispatcher circuit open")]
    CircuitOpen,

    #[error("unknown intent: {0}")]
    UnknownIntent(IntentId),
}

impl DispatchError {
    /// Whether backing off and resubmitting can help
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Unavailable(_))
    }
}

/// Executes intents asynchronously
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Run an intent to its outcome. Resubmitting the same id must not
    /// execute it twice.
    async fn submit(&self, intent: Intent) -> Result<IntentOutcome, DispatchError>;

    /// Ask for cooperative cancellation; acknowledged even if already done
    async fn cancel(&self, id: &IntentId) -> Result<(), DispatchError>;

    /// `plan` is finished; outcomes kept for its redeliveries can go
    fn forget_plan(&self, _plan: Uuid) {}
}

#[async_trait]
impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    async fn submit(&self, intent: Intent) -> Result<IntentOutcome, DispatchError> {
        (**self).submit(intent).await
    }

    async fn cancel(&self, id: &IntentId) -> Result<(), DispatchError> {
        (**self).cancel(id).await
    }

    fn forget_plan(&self, plan: Uuid) {
        (**self).forget_plan(plan)
    }
}
