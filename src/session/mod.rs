//! Long-lived exec sessions bound to a UI client.
//!
//! Each session is an actor owning one upgraded exec socket (see
//! [`actor`]). Variants plug in through [`SessionKind`]:
//!
//! - [`Terminal`]: tmux-backed shell, re-attachable by label
//! - [`DevServer`]: output-only, one per sandbox
//! - [`CodeServer`]: browser IDE with a ready flag and extension installs

pub mod actor;
pub mod code_server;
pub mod dev_server;
pub mod registry;
pub mod setup;
pub mod teardown;
pub mod terminal;
pub mod utf8;

pub use actor::{
    CloseReason, SessionError, SessionEvent, SessionHandle, SessionKind, SessionOptions,
    SessionSink, SessionState, start_session,
};
pub use code_server::{CODE_SERVER_LABEL, CodeServer};
pub use dev_server::{DEV_SERVER_LABEL, DevServer};
pub use registry::SessionRegistry;
pub use setup::{SetupOutcome, SetupPlan, run_setup};
pub use teardown::terminate_process_tree;
pub use terminal::Terminal;
pub use utf8::Utf8Accumulator;
