//! Flow model
//!
//! [`FilterFlow`] is what a platform adapter hands in for every new flow.
//! [`FlowDescriptor`] is the classifier's view of it, built once per call.

use serde::{Deserialize, Serialize};
use url::Url;

/// Traffic direction of a socket flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Outbound,
    Inbound,
    Any,
}

/// Platform-specific part of a flow
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowKind {
    /// Web view / browser request
    Browser {
        #[serde(default)]
        request_url: Option<Url>,
    },
    /// Raw socket
    Socket {
        #[serde(default)]
        remote_endpoint: Option<String>,
        #[serde(default)]
        direction: Direction,
    },
    /// Anything else
    #[default]
    Other,
}

/// A new flow as seen by the interception facility.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterFlow {
    /// Identifier of the application that opened the flow
    #[serde(default)]
    pub source_app: Option<String>,
    /// Destination URL, when the platform knows it
    #[serde(default)]
    pub url: Option<Url>,
    #[serde(default)]
    pub kind: FlowKind,
}

impl FilterFlow {
    /// Browser flow with a known URL.
    pub fn browser(source_app: impl Into<String>, url: Url) -> Self {
        Self {
            source_app: Some(source_app.into()),
            url: Some(url.clone()),
            kind: FlowKind::Browser {
                request_url: Some(url),
            },
        }
    }

    /// Socket flow to `remote_endpoint`, URL unknown.
    pub fn socket(source_app: impl Into<String>, remote_endpoint: impl Into<String>) -> Self {
        Self {
            source_app: Some(source_app.into()),
            url: None,
            kind: FlowKind::Socket {
                remote_endpoint: Some(remote_endpoint.into()),
                direction: Direction::Outbound,
            },
        }
    }

    /// Resolve the host (or a stand-in identifier) of this flow.
    ///
    /// URL host first; then the browser request URL; then `socket: <endpoint>`
    /// for socket flows (`unknown` without an endpoint). Other flows without
    /// a URL host have none.
    pub fn resolve_host(&self) -> Option<String> {
        if let Some(host) = self.url.as_ref().and_then(Url::host_str) {
            return Some(host.to_string());
        }

        match &self.kind {
            FlowKind::Browser { request_url } => request_url.as_ref().map(|u| u.as_str().to_string()),
            FlowKind::Socket { remote_endpoint, .. } => Some(format!(
                "socket: {}",
                remote_endpoint.as_deref().unwrap_or("unknown")
            )),
            FlowKind::Other => None,
        }
    }

    /// Build the classifier's view of this flow.
    ///
    /// A browser flow without a flow URL is described by its request URL.
    pub fn descriptor(&self) -> FlowDescriptor {
        let url = self.url.clone().or_else(|| match &self.kind {
            FlowKind::Browser { request_url } => request_url.clone(),
            _ => None,
        });

        FlowDescriptor {
            source_app: self.source_app.clone(),
            host: self.resolve_host(),
            url,
        }
    }
}

/// Classification input, valid for one call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowDescriptor {
    pub source_app: Option<String>,
    /// Resolved host or stand-in identifier
    pub host: Option<String>,
    pub url: Option<Url>,
}

impl FlowDescriptor {
    /// True when there is neither a host nor a URL to classify.
    pub fn is_unaddressed(&self) -> bool {
        self.host.is_none() && self.url.is_none()
    }
}

impl From<&FilterFlow> for FlowDescriptor {
    fn from(flow: &FilterFlow) -> Self {
        flow.descriptor()
    }
}
