use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why an in-flight operation was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Workflow paused; the operation will be resumed later.
    Paused,
    /// Task received feedback; the attempt is discarded and re-queued.
    Revised,
    /// Workflow stopped; the operation is abandoned for good.
    Stopped,
}

impl CancelReason {
    fn severity(self) -> u8 {
        match self {
            Self::Paused => 0,
            Self::Revised => 1,
            Self::Stopped => 2,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused => write!(f, "paused"),
            Self::Revised => write!(f, "revised"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Cancellation token that remembers why it fired.
///
/// A later, more severe reason replaces an earlier one (a stop issued
/// while paused reads as stopped), never the other way round.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal with the given reason.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            match *slot {
                Some(existing) if existing.severity() >= reason.severity() => {}
                _ => *slot = Some(reason),
            }
        }
        debug!(%reason, "Cancel signal raised");
        self.token.cancel();
    }

    /// The reason, if the signal has fired.
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.token.is_cancelled() {
            return None;
        }
        *self.reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the signal fires and return its reason.
    pub async fn cancelled(&self) -> CancelReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(CancelReason::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_signal_has_no_reason() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert_eq!(signal.reason(), None);
    }

    #[test]
    fn stop_overrides_pause() {
        let signal = CancelSignal::new();
        signal.cancel(CancelReason::Paused);
        assert_eq!(signal.reason(), Some(CancelReason::Paused));
        signal.cancel(CancelReason::Stopped);
        assert_eq!(signal.reason(), Some(CancelReason::Stopped));
    }

    #[test]
    fn pause_does_not_downgrade_stop() {
        let signal = CancelSignal::new();
        signal.cancel(CancelReason::Stopped);
        signal.cancel(CancelReason::Paused);
        assert_eq!(signal.reason(), Some(CancelReason::Stopped));
    }

    #[tokio::test]
    async fn cancelled_resolves_with_reason() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        signal.cancel(CancelReason::Paused);
        assert_eq!(handle.await.unwrap(), CancelReason::Paused);
    }
}
