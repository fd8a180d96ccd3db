//! netrack Providers
//!
//! Decision points of the interceptor and the proxied-flow reader.
//!
//! # Architecture
//!
//! ```text
//!              new flow
//!                 │
//!                 ▼
//!    ┌─────────────────────────┐  Allow
//!    │    DataPathProvider     │──────────▶ platform
//!    └────────────┬────────────┘
//!                 │ NeedRules
//!                 ▼
//!    ┌─────────────────────────┐  AllowUpdateRules / AllowNoUpdate
//!    │   ControlPathProvider   │──────────▶ platform
//!    └────────────┬────────────┘
//!                 │ append          ┌───────────────┐
//!                 ├────────────────▶│ RequestStore  │
//!                 │                 └───────────────┘
//!                 ▼                         ▲
//!           UserNotifier                    │ append
//!                                  ┌────────┴────────┐
//!   TcpProxyListener ──flow──────▶ │  ProxyProvider  │ one task per flow
//!                                  └─────────────────┘
//! ```

mod control;
mod data;
mod error;
mod lifecycle;
mod listener;
mod notify;
mod pipeline;
mod proxy;

pub use control::{ControlPathProvider, ControlVerdict};
pub use data::{DataPathProvider, DataVerdict};
pub use error::ProviderError;
pub use lifecycle::{Lifecycle, ProviderState};
pub use listener::{ListenerConfig, TcpFlow, TcpProxyListener};
pub use notify::{ChannelNotifier, LogNotifier, NullNotifier, UserNotification, UserNotifier};
pub use pipeline::{FilterPipeline, PipelineDecision};
pub use proxy::{
    FlowState, FlowSummary, ProxyFlow, ProxyFlowReader, ProxyProvider, ProxyProviderConfig,
    ReadEvent, RunSignal, Transport,
};
