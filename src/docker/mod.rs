//! Minimal Docker Engine API client.
//!
//! ```text
//! ┌───────────────┐   HTTP/1.1 over UDS   ┌──────────┐
//! │ DockerClient  │ ────────────────────▶ │ dockerd  │
//! │ (DockerApi)   │ ◀──── JSON / tar ──── │          │
//! └──────┬────────┘                       └────┬─────┘
//!        │ start_exec_stream                   │
//!        ▼                                     │
//! ┌───────────────┐   Upgrade: tcp (raw)       │
//! │ upgrade::open │ ◀════ PTY bytes / frames ══╛
//! └───────────────┘
//! ```
//!
//! - [`client`]: one connection per request, bounded by timeouts
//! - [`upgrade`]: the hijacked exec connection and its response-head parser
//! - [`frame`]: non-TTY stdout/stderr frame demultiplexing
//! - [`exec`]: run-to-completion and streaming exec helpers
//! - [`detect`]: daemon availability checks

pub mod api;
pub mod client;
pub mod detect;
pub mod error;
pub mod exec;
pub mod frame;
pub mod types;
pub mod upgrade;

pub use api::DockerApi;
pub use client::{DockerClient, MANAGED_LABEL};
pub use detect::{DockerDetection, DockerStatus, Platform, check_docker};
pub use error::{DockerError, Result, ignore_not_found};
pub use exec::{exec_run, exec_stream};
pub use types::{ContainerInspect, ContainerSpec, ExecInspect, ExecOutput, ExecSpec, VersionInfo};
pub use upgrade::{ExecConnection, ExecReader, ExecWriter};
