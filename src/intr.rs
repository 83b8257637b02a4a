use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScError};

// module name for logging engine
const NAME: &str = "<i><bright-black> intr: </>";

/// A cloneable, idempotent cancellation handle threaded through every
/// blocking operation the controller performs (connect, accept, recv,
/// sleep, subprocess wait).
///
/// `arm`/`disarm` from the original C design have no separate bookkeeping
/// step here: `guard()` races the caller's future against cancellation in
/// one `tokio::select!`, and dropping the losing branch is exactly the
/// "shut down the armed socket" effect for any `tokio::net` type.
#[derive(Clone, Debug, Default)]
pub struct Intr {
    token: CancellationToken,
}

impl Intr {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Idempotent: a second (or later) call is a no-op, matching the
    /// original's "safe to call interrupt() twice" contract.
    pub fn interrupt(&self) {
        if !self.token.is_cancelled() {
            log::debug!("{} interrupt requested", NAME);
        }
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Races `fut` against cancellation. Returns `Err(ScError::Cancelled)`
    /// immediately if already interrupted, without polling `fut` at all
    /// (cancellation is sticky).
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        if self.token.is_cancelled() {
            return Err(ScError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ScError::Cancelled),
            value = fut => Ok(value),
        }
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.token.clone()
    }
}
