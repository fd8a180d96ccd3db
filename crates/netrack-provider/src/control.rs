//! Control-Path Provider
//!
//! Rule-aware decision point for flows the data path escalated. The only
//! place a filter flow is persisted.
//!
//! Flow:
//! 1. No source application and nothing to classify → `AllowNoUpdate`
//! 2. Classifier says loggable → notify the user, append to the store
//! 3. Append committed → `AllowUpdateRules`, otherwise `AllowNoUpdate`
//!
//! Verdicts are always permissive; a failed append only downgrades the
//! verdict and raises an error notification.

use crate::error::ProviderError;
use crate::lifecycle::{Lifecycle, ProviderState};
use crate::notify::{UserNotification, UserNotifier};
use chrono::Utc;
use netrack_filter::{FilterFlow, FlowClassifier, Verdict};
use netrack_store::RequestStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Verdict returned to the platform for a flow needing rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlVerdict {
    /// Allow; the rule set changed
    AllowUpdateRules,
    /// Allow; nothing changed
    AllowNoUpdate,
}

/// Control-path statistics
#[derive(Debug, Default)]
struct ControlStats {
    decided: AtomicU64,
    logged: AtomicU64,
    failed: AtomicU64,
}

/// Control-path decision point
pub struct ControlPathProvider {
    lifecycle: Lifecycle,
    classifier: FlowClassifier,
    store: RequestStore,
    notifier: Arc<dyn UserNotifier>,
    stats: ControlStats,
}

impl ControlPathProvider {
    pub fn new(
        classifier: FlowClassifier,
        store: RequestStore,
        notifier: Arc<dyn UserNotifier>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("control"),
            classifier,
            store,
            notifier,
            stats: ControlStats::default(),
        }
    }

    pub fn state(&self) -> ProviderState {
        self.lifecycle.state()
    }

    /// Start deciding flows once the store is reachable.
    pub fn start<C>(&self, completion: C)
    where
        C: FnOnce(Result<(), ProviderError>),
    {
        let store = &self.store;
        self.lifecycle.start(
            || {
                store.count()?;
                Ok(())
            },
            completion,
        );
    }

    pub fn stop<C: FnOnce()>(&self, completion: C) {
        self.lifecycle.stop(|| {}, completion);
    }

    /// Decide a flow. Blocks until a matching record is committed.
    pub fn decide(&self, flow: &FilterFlow) -> ControlVerdict {
        if !self.lifecycle.is_running() {
            trace!("Control provider not running, allowing flow");
            return ControlVerdict::AllowNoUpdate;
        }
        self.stats.decided.fetch_add(1, Ordering::Relaxed);

        let descriptor = flow.descriptor();
        if descriptor.source_app.is_none() && descriptor.is_unaddressed() {
            return ControlVerdict::AllowNoUpdate;
        }

        let (text, link) = match self.classifier.classify(&descriptor) {
            Verdict::Loggable { text, link } => (text, link),
            Verdict::NotLoggable => return ControlVerdict::AllowNoUpdate,
        };

        if let Some(app) = &descriptor.source_app {
            self.notifier.notify(UserNotification::Request {
                app: app.clone(),
                host: descriptor.host.clone().unwrap_or_else(|| link.clone()),
            });
        }

        match self.store.append(text, Utc::now(), link) {
            Ok(id) => {
                debug!("Logged control-path flow as {}", id);
                self.stats.logged.fetch_add(1, Ordering::Relaxed);
                ControlVerdict::AllowUpdateRules
            }
            Err(e) => {
                error!("Failed to log control-path flow: {}", e);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.notifier.notify(UserNotification::Error {
                    message: e.to_string(),
                });
                ControlVerdict::AllowNoUpdate
            }
        }
    }

    /// (decided, logged, failed)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.decided.load(Ordering::Relaxed),
            self.stats.logged.load(Ordering::Relaxed),
            self.stats.failed.load(Ordering::Relaxed),
        )
    }
}
