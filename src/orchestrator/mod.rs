//! Sandbox lifecycle orchestration.
//!
//! ```text
//! SandboxOrchestrator ──(one worker per sandbox)──▶ Provisioner
//!        │                                             │
//!        ▼                                             ├─▶ steps (Docker, tar, scripts)
//!  SessionRegistry                                     ├─▶ TailscaleManager
//!                                                      ├─▶ SandboxStore
//!                                                      └─▶ ProgressSink
//! ```
//!
//! The state machine in [`state`] is the only way a sandbox's state changes;
//! the [`Provisioner`] drives it and persists each step's identifiers as
//! they are created so a failed or interrupted provision can still be torn
//! down.

pub mod error;
pub mod manager;
pub mod ports;
pub mod progress;
pub mod provision;
pub mod source;
pub mod state;
pub mod steps;
pub mod store;

pub use error::{OrchestratorError, Result};
pub use manager::SandboxOrchestrator;
pub use progress::{
    BroadcastProgress, LogProgress, ProgressSink, ProvisioningStep, StepOutcome, topic,
};
pub use provision::Provisioner;
pub use source::{
    DirectoryTemplateSource, FileSource, NoFiles, SandboxTemplate, StaticTemplateSource,
    TemplateSource,
};
pub use state::{Sandbox, SandboxEvent, SandboxState, StateTransition, TransitionError};
pub use steps::ResourceNames;
pub use store::{InMemorySandboxStore, JsonFileSandboxStore, SandboxStore};
