//! Tailscale HTTPS sidecars.
//!
//! A sidecar is a `tailscale/tailscale` container joined to the sandbox's
//! application container network namespace. It logs into the tailnet with a
//! pre-authorized key, then `tailscale serve` terminates HTTPS on the node
//! and proxies to the app's service port on loopback.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        TailscaleManager                          │
//! │                                                                  │
//! │   create()                                                       │
//! │      │                                                           │
//! │      ▼                                                           │
//! │   ┌────────────┐   ┌──────────────┐   ┌───────────────────────┐  │
//! │   │ Pull Image │──▶│ State Volume │──▶│ Create & Start        │  │
//! │   └────────────┘   └──────────────┘   │ (container:<app id>)  │  │
//! │                                       └──────────┬────────────┘  │
//! │                                                  ▼               │
//! │   ┌──────────────────────┐   ┌──────────────────────────────┐    │
//! │   │ tailscale serve      │◀──│ Poll `tailscale status`      │    │
//! │   │ --https=443 → :port  │   │ until BackendState=Running   │    │
//! │   └──────────────────────┘   └──────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sidecars are best-effort: the orchestrator logs a failed create and
//! carries on without tailnet exposure.

pub mod config;
pub mod error;
pub mod manager;

pub use config::{SidecarEndpoint, TailscaleConfig};
pub use error::{Result, SidecarError};
pub use manager::{Sidecar, SidecarRequest, TailscaleManager};
