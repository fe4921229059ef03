use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cancel::Latch;

/// Whether the engine has signalled that its surface exists.
///
/// Monotonic: false until the first `Ready` notification, then true forever.
#[derive(Clone, Default)]
pub struct Readiness {
    inner: Arc<Latch>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` on the first call only.
    pub fn mark_ready(&self) -> bool {
        let flipped = self.inner.set();
        if flipped {
            info!("engine ready");
        }
        flipped
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_set()
    }

    /// Block until ready or `timeout` passes. Returns readiness.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.inner.wait_timeout(timeout)
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("ready", &self.is_ready())
            .finish()
    }
}
