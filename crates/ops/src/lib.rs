//! apps ops: the operations behind the CLI verbs.
//!
//! - [`wait`]: watch-driven readiness waits, polled deletion waits and a first-wins race.
//! - [`proxy`]: the request-rewriting transport that reaches the local source proxy.
//! - [`lsp`]: local source proxy health classification.
//! - [`source`]: packaging a local directory and pushing it through the proxy.
//! - [`tail`]: workload log following.

#![forbid(unsafe_code)]

pub mod lsp;
pub mod proxy;
pub mod source;
pub mod tail;
pub mod wait;

pub use lsp::get_status;
pub use proxy::{local_registry_transport, ProxyError, Transport, Wrapper};
pub use source::{publish_local_source, SourceError};
pub use wait::{race, until_condition, until_delete, worker, WaitError, Worker};
