use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

/// Cooperative cancellation capability handed to the transport
///
/// Clones share the same signal; cancelling any clone cancels all of them.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the handle is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// A handle that is cancelled together with this one but can also be
    /// cancelled on its own
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Run `fut` until it finishes or the handle fires, whichever is first
    pub async fn abortable<T, F>(&self, fut: F) -> Result<T, FetchError>
    where
        F: Future<Output = Result<T, FetchError>>,
    {
        if self.is_cancelled() {
            return Err(FetchError::Aborted);
        }
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(FetchError::Aborted),
            result = fut => result,
        }
    }
}
