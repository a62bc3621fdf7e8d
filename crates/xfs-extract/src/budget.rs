//! Resource bounds shared by every extractor invocation of a run.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::{Error, Result};

/// Which limit stopped extraction early.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Depth,
    ArtifactCount,
    TotalBytes,
    /// An artifact reproduced the content of one of its own ancestors.
    Cycle,
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Depth => "recursion depth",
            Self::ArtifactCount => "artifact count",
            Self::TotalBytes => "total extracted bytes",
            Self::Cycle => "self-reproducing artifact",
        };
        f.write_str(name)
    }
}

/// Cooperative cancellation flag, cheap to clone across threads.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
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

/// Run-wide limits on extracted output.
#[derive(Debug)]
pub struct ExtractionBudget {
    max_total_bytes: u64,
    used: AtomicU64,
    exhausted: AtomicBool,
    cancel: CancelToken,
    run_deadline: Option<Instant>,
}

impl ExtractionBudget {
    pub fn new(max_total_bytes: u64, cancel: CancelToken) -> Self {
        Self {
            max_total_bytes,
            used: AtomicU64::new(0),
            exhausted: AtomicBool::new(false),
            cancel,
            run_deadline: None,
        }
    }

    pub fn with_run_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.run_deadline = deadline;
        self
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// True once the token fired or the run deadline passed.
    pub fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.run_deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn charge(&self, bytes: u64) -> Result<()> {
        let total = self.used.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if total > self.max_total_bytes {
            self.exhausted.store(true, Ordering::SeqCst);
            return Err(Error::BoundExceeded(Bound::TotalBytes));
        }
        Ok(())
    }

    /// Budget view for one (extractor, artifact) pass with its own deadline.
    pub fn pass(&self, timeout: Duration) -> PassBudget<'_> {
        PassBudget {
            budget: self,
            deadline: Instant::now() + timeout,
        }
    }
}

pub struct PassBudget<'a> {
    budget: &'a ExtractionBudget,
    deadline: Instant,
}

impl PassBudget<'_> {
    pub fn check(&self) -> Result<()> {
        if self.budget.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.budget.is_exhausted() {
            return Err(Error::BoundExceeded(Bound::TotalBytes));
        }
        if Instant::now() >= self.deadline {
            return Err(Error::TimedOut);
        }
        Ok(())
    }

    pub fn charge(&self, bytes: u64) -> Result<()> {
        self.check()?;
        self.budget.charge(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_past_limit_exhausts() {
        let budget = ExtractionBudget::new(10, CancelToken::new());
        let pass = budget.pass(Duration::from_secs(60));
        pass.charge(6).unwrap();
        assert!(matches!(pass.charge(6), Err(Error::BoundExceeded(Bound::TotalBytes))));
        assert!(budget.is_exhausted());
        assert!(matches!(pass.check(), Err(Error::BoundExceeded(Bound::TotalBytes))));
    }

    #[test]
    fn cancel_token_is_observed() {
        let token = CancelToken::new();
        let budget = ExtractionBudget::new(u64::MAX, token.clone());
        let pass = budget.pass(Duration::from_secs(60));
        token.cancel();
        assert!(matches!(pass.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn pass_deadline_times_out() {
        let budget = ExtractionBudget::new(u64::MAX, CancelToken::new());
        let pass = budget.pass(Duration::ZERO);
        assert!(matches!(pass.check(), Err(Error::TimedOut)));
        assert!(!budget.is_cancelled());
    }

    #[test]
    fn run_deadline_cancels() {
        let budget = ExtractionBudget::new(u64::MAX, CancelToken::new())
            .with_run_deadline(Some(Instant::now()));
        assert!(budget.is_cancelled());
    }
}
