use crate::error::ProviderError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The Rust stand-in for a Go `context.Context`: an optional deadline paired
/// with a cancellation token. Threaded through every cancellable operation
/// in this crate so a single authority (the caller) decides when work stops.
#[derive(Clone)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// A context with neither a deadline nor an external cancel source.
    pub fn background() -> Self {
        Context { deadline: None, cancel: CancellationToken::new() }
    }

    /// A context that is done once `token` is cancelled.
    pub fn with_cancel(token: CancellationToken) -> Self {
        Context { deadline: None, cancel: token }
    }

    /// A context that is done once `deadline` elapses, in addition to
    /// whatever cancellation source it already carries.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = match self.deadline {
            Some(existing) if existing <= deadline => Some(existing),
            _ => Some(deadline),
        };
        self
    }

    /// A context with a deadline `timeout` from now and a fresh cancel token.
    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        Context::background().with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the context is done, for racing in `tokio::select!`.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {}
                    () = self.cancel.cancelled() => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// The reason the context is done. Panics if called before `done()`
    /// would resolve; callers should only consult this from the `done()`
    /// branch of a `select!`.
    pub fn err(&self) -> ProviderError {
        if self.cancel.is_cancelled() {
            ProviderError::Cancelled
        } else {
            match self.deadline {
                Some(deadline) if Instant::now() >= deadline => ProviderError::DeadlineExceeded,
                _ => ProviderError::Cancelled,
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::background()
    }
}
