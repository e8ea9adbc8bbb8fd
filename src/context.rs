//! Per-call context: the acting user and a cancellation signal
//!
//! Every store operation takes a `QueryContext`. The actor is handed to the
//! permission filter; the token aborts in-flight statements when fired.

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Who is performing an operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Actor {
    /// Authenticated user, if any
    pub user_id: Option<i32>,
    /// Internal actors bypass per-user restrictions
    pub internal: bool,
}

impl Actor {
    /// Internal actor with no user
    pub fn internal() -> Self {
        Self {
            user_id: None,
            internal: true,
        }
    }

    /// Actor for an authenticated user
    pub fn user(user_id: i32) -> Self {
        Self {
            user_id: Some(user_id),
            internal: false,
        }
    }
}

/// Context passed to every store operation
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Acting user
    pub actor: Actor,
    cancel: CancellationToken,
}

impl QueryContext {
    /// Context for internal background work that is never cancelled
    pub fn background() -> Self {
        Self {
            actor: Actor::internal(),
            cancel: CancellationToken::new(),
        }
    }

    /// Context for a user
    pub fn for_user(user_id: i32) -> Self {
        Self {
            actor: Actor::user(user_id),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The cancellation token; cancelling it aborts operations using this context
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Fail with `Error::Cancelled` if cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::background()
    }
}
