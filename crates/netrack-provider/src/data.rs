//! Data-Path Provider
//!
//! Fast coarse gate invoked first for every flow. It never persists: a flow
//! whose URL matches the filter is escalated with `NeedRules` and the control
//! path does the logging.

use crate::error::ProviderError;
use crate::lifecycle::{Lifecycle, ProviderState};
use netrack_filter::{FilterFlow, FlowClassifier};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Verdict for a new flow on the data path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataVerdict {
    /// Let the flow through
    Allow,
    /// Hand the flow to the control path
    NeedRules,
}

/// Data-path decision point
pub struct DataPathProvider {
    lifecycle: Lifecycle,
    classifier: FlowClassifier,
    decided: AtomicU64,
    escalated: AtomicU64,
}

impl DataPathProvider {
    pub fn new(classifier: FlowClassifier) -> Self {
        Self {
            lifecycle: Lifecycle::new("data"),
            classifier,
            decided: AtomicU64::new(0),
            escalated: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ProviderState {
        self.lifecycle.state()
    }

    pub fn start<C>(&self, completion: C)
    where
        C: FnOnce(Result<(), ProviderError>),
    {
        self.lifecycle.start(|| Ok(()), completion);
    }

    pub fn stop<C: FnOnce()>(&self, completion: C) {
        self.lifecycle.stop(|| {}, completion);
    }

    /// Decide a new flow.
    #[inline]
    pub fn decide(&self, flow: &FilterFlow) -> DataVerdict {
        if !self.lifecycle.is_running() {
            return DataVerdict::Allow;
        }
        self.decided.fetch_add(1, Ordering::Relaxed);

        match &flow.url {
            Some(url) if self.classifier.matches(url.as_str()) => {
                trace!("Escalating {}", url);
                self.escalated.fetch_add(1, Ordering::Relaxed);
                DataVerdict::NeedRules
            }
            _ => DataVerdict::Allow,
        }
    }

    /// (decided, escalated)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.decided.load(Ordering::Relaxed),
            self.escalated.load(Ordering::Relaxed),
        )
    }
}
