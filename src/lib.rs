//! devsandbox: per-user Docker development sandboxes.
//!
//! A sandbox is an app container and a PostgreSQL container on a private
//! network, optionally fronted by a Tailscale sidecar. The crate provisions
//! and tears them down ([`orchestrator`]) and streams interactive exec
//! sessions into them ([`session`]), talking to the Docker Engine directly
//! over its Unix socket ([`docker`]).

pub mod archive;
pub mod cli;
pub mod config;
pub mod docker;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod sidecar;
pub mod template;
pub mod testing;
