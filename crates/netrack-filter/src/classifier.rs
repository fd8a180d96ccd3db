//! Flow Classifier
//!
//! Single-rule policy: a flow is loggable when its resolved host or URL
//! contains the configured hostname filter. Matching is ASCII
//! case-insensitive and does not allocate; only a `Loggable` verdict builds
//! strings.

use crate::flow::FlowDescriptor;
use crate::sniffer::RequestHead;
use netrack_store::{NO_LINK, NO_QUERY};
use tracing::trace;

/// Filter used when none is configured.
pub const DEFAULT_FILTER: &str = "google.com";

/// Outcome of classifying a flow or payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Should be persisted with this text and link
    Loggable { text: String, link: String },
    NotLoggable,
}

impl Verdict {
    pub fn is_loggable(&self) -> bool {
        matches!(self, Self::Loggable { .. })
    }
}

/// Substring classifier for one hostname filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowClassifier {
    filter: String,
}

impl Default for FlowClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_FILTER)
    }
}

impl FlowClassifier {
    /// Create a classifier. Surrounding whitespace is ignored.
    pub fn new(filter: impl Into<String>) -> Self {
        let filter = filter.into();
        Self {
            filter: filter.trim().to_string(),
        }
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Check a string against the filter.
    #[inline]
    pub fn matches(&self, haystack: &str) -> bool {
        contains_filter(haystack, &self.filter)
    }

    /// Classify a flow.
    ///
    /// `text` is the URL query (or [`NO_QUERY`]); `link` is the URL host,
    /// else the full URL, else the resolved host, else [`NO_LINK`].
    pub fn classify(&self, flow: &FlowDescriptor) -> Verdict {
        let host_match = flow.host.as_deref().is_some_and(|h| self.matches(h));
        let url_match = flow.url.as_ref().is_some_and(|u| self.matches(u.as_str()));
        if !host_match && !url_match {
            return Verdict::NotLoggable;
        }

        let text = flow
            .url
            .as_ref()
            .and_then(|u| u.query())
            .filter(|q| !q.is_empty())
            .unwrap_or(NO_QUERY);

        let link = match &flow.url {
            Some(url) => url.host_str().unwrap_or(url.as_str()),
            None => flow.host.as_deref().unwrap_or(NO_LINK),
        };

        trace!("Loggable flow: {}", link);
        Verdict::Loggable {
            text: text.to_string(),
            link: link.to_string(),
        }
    }

    /// Classify a decoded chunk of proxied bytes.
    ///
    /// `text` is the chunk itself; `link` is the HTTP `Host` header, else an
    /// absolute request target, else the filter.
    pub fn classify_payload(&self, payload: &str) -> Verdict {
        let payload = payload.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
        if !self.matches(payload) {
            return Verdict::NotLoggable;
        }

        let head = RequestHead::parse(payload);
        let link = head
            .and_then(|h| h.host.or_else(|| h.absolute_target()))
            .unwrap_or(self.filter.as_str());

        Verdict::Loggable {
            text: payload.to_string(),
            link: link.to_string(),
        }
    }
}

/// ASCII case-insensitive substring test. An empty needle never matches.
#[inline]
pub fn contains_filter(haystack: &str, needle: &str) -> bool {
    let (h, n) = (haystack.as_bytes(), needle.as_bytes());
    if n.is_empty() || n.len() > h.len() {
        return false;
    }
    h.windows(n.len()).any(|w| w.eq_ignore_ascii_case(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FilterFlow, FlowKind};
    use url::Url;

    fn classify(flow: &FilterFlow) -> Verdict {
        FlowClassifier::default().classify(&flow.descriptor())
    }

    #[test]
    fn test_contains_filter() {
        assert!(contains_filter("www.google.com", "google.com"));
        assert!(contains_filter("WWW.GOOGLE.COM", "google.com"));
        assert!(!contains_filter("example.org", "google.com"));
        assert!(!contains_filter("google", "google.com"));
        assert!(!contains_filter("anything", ""));
    }

    #[test]
    fn test_url_with_query_is_loggable() {
        let flow = FilterFlow::browser("com.apple.Safari", Url::parse("https://www.google.com/search?q=rust").unwrap());

        assert_eq!(
            classify(&flow),
            Verdict::Loggable {
                text: "q=rust".to_string(),
                link: "www.google.com".to_string(),
            }
        );
    }

    #[test]
    fn test_url_without_query_uses_placeholder() {
        let flow = FilterFlow::browser("app", Url::parse("https://google.com/").unwrap());

        match classify(&flow) {
            Verdict::Loggable { text, link } => {
                assert_eq!(text, NO_QUERY);
                assert_eq!(link, "google.com");
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_match_in_path_only() {
        // Host doesn't match but the URL string does
        let flow = FilterFlow::browser("app", Url::parse("https://example.org/redirect/google.com").unwrap());

        match classify(&flow) {
            Verdict::Loggable { link, .. } => assert_eq!(link, "example.org"),
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_non_matching_flow() {
        let flow = FilterFlow::browser("app", Url::parse("https://example.org/?q=google").unwrap());
        assert_eq!(classify(&flow), Verdict::NotLoggable);
    }

    #[test]
    fn test_socket_endpoint_match() {
        let flow = FilterFlow::socket("app", "google.com:443");

        assert_eq!(
            classify(&flow),
            Verdict::Loggable {
                text: NO_QUERY.to_string(),
                link: "socket: google.com:443".to_string(),
            }
        );
    }

    #[test]
    fn test_unaddressed_flow_is_not_loggable() {
        let flow = FilterFlow {
            source_app: Some("app".to_string()),
            url: None,
            kind: FlowKind::Other,
        };
        assert_eq!(classify(&flow), Verdict::NotLoggable);
    }

    #[test]
    fn test_empty_filter_never_matches() {
        let classifier = FlowClassifier::new("   ");
        let flow = FilterFlow::browser("app", Url::parse("https://google.com/").unwrap());

        assert_eq!(classifier.classify(&flow.descriptor()), Verdict::NotLoggable);
        assert_eq!(classifier.classify_payload("GET / HTTP/1.1"), Verdict::NotLoggable);
    }

    #[test]
    fn test_payload_with_host_header() {
        let payload = "GET /search?q=rust HTTP/1.1\r\nHost: www.google.com\r\n\r\n";

        match FlowClassifier::default().classify_payload(payload) {
            Verdict::Loggable { text, link } => {
                assert_eq!(link, "www.google.com");
                assert!(text.starts_with("GET /search?q=rust"));
                assert!(!text.ends_with('\n'));
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_payload_without_http_head_links_to_filter() {
        match FlowClassifier::default().classify_payload("hello google.com\0\0") {
            Verdict::Loggable { text, link } => {
                assert_eq!(text, "hello google.com");
                assert_eq!(link, "google.com");
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_payload_without_filter() {
        let payload = "GET / HTTP/1.1\r\nHost: example.org\r\n\r\n";
        assert_eq!(FlowClassifier::default().classify_payload(payload), Verdict::NotLoggable);
    }
}
