//! Per-operation deadlines and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{WritableError, WritableResult};

/// A shareable cancellation signal.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounds for one mutating call: an optional deadline and a cancel flag.
///
/// Checked between the steps of an operation. An operation that stops early
/// releases every reference it took and leaves the layer unchanged.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancelFlag,
}

impl OpContext {
    /// No deadline, never cancelled.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancelFlag::default(),
        }
    }

    /// Observe `flag` in addition to any deadline.
    pub fn cancelled_by(mut self, flag: CancelFlag) -> Self {
        self.cancel = flag;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The flag observed by this context.
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Fail if the operation should stop now.
    pub fn check(&self) -> WritableResult<()> {
        if self.cancel.is_cancelled() {
            return Err(WritableError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(WritableError::Timeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_never_stops() {
        assert!(OpContext::none().check().is_ok());
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let ctx = OpContext::none().cancelled_by(flag.clone());
        assert!(ctx.check().is_ok());
        flag.cancel();
        assert!(matches!(ctx.check(), Err(WritableError::Cancelled)));
        assert!(ctx.cancel_flag().is_cancelled());
    }

    #[test]
    fn past_deadline_times_out() {
        let ctx = OpContext::with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(WritableError::Timeout)));

        let generous = OpContext::with_timeout(Duration::from_secs(3600));
        assert!(generous.check().is_ok());
        assert!(generous.deadline().is_some());
    }
}
