//! netrack Flow Filter
//!
//! Pure flow classification: decides whether an intercepted flow (or a chunk
//! of proxied bytes) is a request worth logging.
//!
//! Flow:
//! 1. Platform adapter hands in a [`FilterFlow`]
//! 2. Host is resolved (URL host, browser request URL, `socket: <endpoint>`)
//! 3. [`FlowClassifier`] substring-matches host and URL against the filter
//! 4. `Loggable` verdicts carry the text and link to persist
//!
//! Nothing here performs I/O.

mod classifier;
mod flow;
mod sniffer;

pub use classifier::{contains_filter, FlowClassifier, Verdict, DEFAULT_FILTER};
pub use flow::{Direction, FilterFlow, FlowDescriptor, FlowKind};
pub use sniffer::RequestHead;
