//! Filter pipeline
//!
//! Host adapter that composes the two decision points the way the platform
//! drives them: data path first, control path only for escalated flows.

use crate::control::{ControlPathProvider, ControlVerdict};
use crate::data::{DataPathProvider, DataVerdict};
use crate::error::ProviderError;
use crate::notify::UserNotifier;
use netrack_filter::{FilterFlow, FlowClassifier};
use netrack_store::RequestStore;
use serde::Serialize;
use std::sync::Arc;

/// Combined outcome for one flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineDecision {
    pub data: DataVerdict,
    /// Present only when the data path asked for rules
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlVerdict>,
}

impl PipelineDecision {
    /// True when the flow was recorded
    pub fn logged(&self) -> bool {
        self.control == Some(ControlVerdict::AllowUpdateRules)
    }
}

/// Data path and control path wired together
pub struct FilterPipeline {
    data: DataPathProvider,
    control: ControlPathProvider,
}

impl FilterPipeline {
    pub fn new(classifier: FlowClassifier, store: RequestStore, notifier: Arc<dyn UserNotifier>) -> Self {
        Self {
            data: DataPathProvider::new(classifier.clone()),
            control: ControlPathProvider::new(classifier, store, notifier),
        }
    }

    /// Start the control path, then the data path.
    pub fn start(&self) -> Result<(), ProviderError> {
        let mut outcome = Ok(());
        self.control.start(|result| outcome = result);
        outcome?;

        let mut outcome = Ok(());
        self.data.start(|result| outcome = result);
        outcome
    }

    /// Stop the data path, then the control path.
    pub fn stop(&self) {
        self.data.stop(|| {});
        self.control.stop(|| {});
    }

    /// Run a flow through both decision points.
    pub fn handle(&self, flow: &FilterFlow) -> PipelineDecision {
        let data = self.data.decide(flow);
        let control = match data {
            DataVerdict::NeedRules => Some(self.control.decide(flow)),
            DataVerdict::Allow => None,
        };
        PipelineDecision { data, control }
    }

    pub fn data(&self) -> &DataPathProvider {
        &self.data
    }

    pub fn control(&self) -> &ControlPathProvider {
        &self.control
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;
    use netrack_store::StoreConfig;
    use url::Url;

    fn pipeline() -> (tempfile::TempDir, RequestStore, FilterPipeline) {
        let dir = tempfile::tempdir().unwrap();
        let store = RequestStore::open(StoreConfig::new(dir.path())).unwrap();
        let pipeline = FilterPipeline::new(FlowClassifier::default(), store.clone(), Arc::new(NullNotifier));
        pipeline.start().unwrap();
        (dir, store, pipeline)
    }

    #[test]
    fn test_escalated_flow_is_logged_once() {
        let (_dir, store, pipeline) = pipeline();
        let flow = FilterFlow::browser("app", Url::parse("https://www.google.com/search?q=rust").unwrap());

        let decision = pipeline.handle(&flow);
        assert_eq!(decision.data, DataVerdict::NeedRules);
        assert!(decision.logged());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_allowed_flow_skips_control_path() {
        let (_dir, store, pipeline) = pipeline();
        let flow = FilterFlow::browser("app", Url::parse("https://example.org/").unwrap());

        let decision = pipeline.handle(&flow);
        assert_eq!(decision, PipelineDecision { data: DataVerdict::Allow, control: None });
        assert_eq!(pipeline.control().stats().0, 0);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_stop_makes_pipeline_permissive() {
        let (_dir, store, pipeline) = pipeline();
        pipeline.stop();

        let flow = FilterFlow::browser("app", Url::parse("https://google.com/").unwrap());
        assert!(!pipeline.handle(&flow).logged());
        assert_eq!(store.count().unwrap(), 0);
    }
}
