//! daprox — a Debug Adapter Protocol proxy.
//!
//! Sits between an editor's debugging UI and a DAP backend (e.g. Delve's
//! `dlv dap`): frames and parses protocol messages, spawns and supervises
//! the backend process (or connects to an externally launched one),
//! tracks in-flight request/response correlation, and rewrites a small
//! allow-list of messages to keep editor UIs honest.

pub mod args;
pub mod codec;
pub mod error;
pub mod launch;
pub mod message;
pub mod net;
pub mod pending;
pub mod relay;
pub mod rendezvous;
pub mod supervisor;
pub mod trace;

pub use error::ProxyError;
pub use launch::DebugConfiguration;
pub use message::Message;
pub use relay::{BackendLauncher, DapProxy, SpawnLauncher};
pub use supervisor::Timeouts;
