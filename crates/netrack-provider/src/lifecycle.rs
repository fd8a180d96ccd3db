//! Provider lifecycle
//!
//! Every provider moves through the same states:
//!
//! ```text
//! Stopped ──start──▶ Starting ──ready──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                        │
//!                        └──not ready──▶ Stopped
//! ```
//!
//! `start` reports readiness to its completion callback *before* the
//! provider becomes `Running`, so no flow is decided by a provider whose
//! caller hasn't seen it start.

use crate::error::ProviderError;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Provider state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProviderState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ProviderState {
    /// Check if the provider decides flows
    pub fn is_running(&self) -> bool {
        matches!(self, ProviderState::Running)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ProviderState::Starting,
            2 => ProviderState::Running,
            3 => ProviderState::Stopping,
            _ => ProviderState::Stopped,
        }
    }
}

/// Shared lifecycle state of one provider.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    name: &'static str,
    state: Arc<AtomicU8>,
}

impl Lifecycle {
    /// New lifecycle in `Stopped`. `name` is used in logs and errors.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(AtomicU8::new(ProviderState::Stopped as u8)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state
    pub fn state(&self) -> ProviderState {
        ProviderState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Start the provider.
    ///
    /// Runs `ready`, hands its result to `completion`, then settles in
    /// `Running` (ready) or `Stopped` (not ready), unless a `stop` already
    /// moved it out of `Starting`. Starting a provider that isn't stopped
    /// reports [`ProviderError::AlreadyRunning`] and changes nothing.
    pub fn start<R, C>(&self, ready: R, completion: C)
    where
        R: FnOnce() -> Result<(), ProviderError>,
        C: FnOnce(Result<(), ProviderError>),
    {
        if !self.transition(ProviderState::Stopped, ProviderState::Starting) {
            completion(Err(ProviderError::AlreadyRunning(self.name)));
            return;
        }

        info!("{} provider starting", self.name);
        let result = ready();
        let ok = result.is_ok();
        if let Err(e) = &result {
            warn!("{} provider failed to start: {}", self.name, e);
        }

        completion(result);

        // A stop that ran meanwhile wins
        let next = if ok { ProviderState::Running } else { ProviderState::Stopped };
        if self.transition(ProviderState::Starting, next) {
            debug!("{} provider {:?}", self.name, next);
        } else {
            debug!("{} provider stopped while starting", self.name);
        }
    }

    /// Stop the provider.
    ///
    /// Always ends in `Stopped`: `cleanup` runs best-effort, then
    /// `completion` is called. Stopping a stopped provider just calls
    /// `completion`.
    pub fn stop<F, C>(&self, cleanup: F, completion: C)
    where
        F: FnOnce(),
        C: FnOnce(),
    {
        let previous = ProviderState::from_u8(
            self.state.swap(ProviderState::Stopping as u8, Ordering::AcqRel),
        );

        if previous != ProviderState::Stopped {
            info!("{} provider stopping", self.name);
            cleanup();
        }

        self.state.store(ProviderState::Stopped as u8, Ordering::Release);
        completion();
    }

    fn transition(&self, from: ProviderState, to: ProviderState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_start_reports_before_running() {
        let lifecycle = Lifecycle::new("test");
        let seen = Cell::new(None);

        lifecycle.start(
            || Ok(()),
            |result| {
                assert!(result.is_ok());
                seen.set(Some(lifecycle.state()));
            },
        );

        assert_eq!(seen.get(), Some(ProviderState::Starting));
        assert_eq!(lifecycle.state(), ProviderState::Running);
    }

    #[test]
    fn test_failed_start_returns_to_stopped() {
        let lifecycle = Lifecycle::new("test");
        let failed = Cell::new(false);

        lifecycle.start(
            || Err(ProviderError::NotBound),
            |result| failed.set(result.is_err()),
        );

        assert!(failed.get());
        assert_eq!(lifecycle.state(), ProviderState::Stopped);
    }

    #[test]
    fn test_double_start_is_rejected() {
        let lifecycle = Lifecycle::new("test");
        lifecycle.start(|| Ok(()), |_| {});

        let rejected = Cell::new(false);
        lifecycle.start(
            || panic!("ready must not run twice"),
            |result| rejected.set(matches!(result, Err(ProviderError::AlreadyRunning("test")))),
        );

        assert!(rejected.get());
        assert!(lifecycle.is_running());
    }

    #[test]
    fn test_stop_always_completes() {
        let lifecycle = Lifecycle::new("test");
        let cleaned = Cell::new(0);
        let completed = Cell::new(0);

        // Stopping a stopped provider skips cleanup
        lifecycle.stop(|| cleaned.set(cleaned.get() + 1), || completed.set(completed.get() + 1));
        assert_eq!((cleaned.get(), completed.get()), (0, 1));

        lifecycle.start(|| Ok(()), |_| {});
        lifecycle.stop(|| cleaned.set(cleaned.get() + 1), || completed.set(completed.get() + 1));
        assert_eq!((cleaned.get(), completed.get()), (1, 2));
        assert_eq!(lifecycle.state(), ProviderState::Stopped);

        // Restart after stop
        lifecycle.start(|| Ok(()), |_| {});
        assert!(lifecycle.is_running());
    }

    #[test]
    fn test_stop_during_start_completion_wins() {
        let lifecycle = Lifecycle::new("test");
        let stopped = Cell::new(None);

        lifecycle.start(
            || Ok(()),
            |result| {
                assert!(result.is_ok());
                lifecycle.stop(|| {}, || stopped.set(Some(lifecycle.state())));
            },
        );

        assert_eq!(stopped.get(), Some(ProviderState::Stopped));
        assert_eq!(lifecycle.state(), ProviderState::Stopped);

        // Still startable afterwards
        lifecycle.start(|| Ok(()), |_| {});
        assert!(lifecycle.is_running());
    }

    #[test]
    fn test_stop_from_other_thread_during_ready() {
        let lifecycle = Lifecycle::new("test");
        let other = lifecycle.clone();

        lifecycle.start(
            || {
                std::thread::spawn(move || other.stop(|| {}, || {}))
                    .join()
                    .unwrap();
                Ok(())
            },
            |result| assert!(result.is_ok()),
        );

        assert_eq!(lifecycle.state(), ProviderState::Stopped);
    }
}
