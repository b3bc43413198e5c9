//! Sandbox lifecycle state machine.
//!
//! ```text
//!  creating ──▶ provisioning ──▶ running ◀──▶ stopped
//!     │              │              │            │
//!     └──────────────┴───── error ◀─┴────────────┘
//!                             │
//!        running / stopped / error ──▶ destroying ──▶ destroyed
//! ```
//!
//! State only changes through [`Sandbox::apply`], which looks the
//! (state, event) pair up in [`SandboxEvent::target`] and refuses anything
//! not listed there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::orchestrator::steps;

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Record exists, nothing created yet.
    Creating,
    /// Provisioning sequence in progress.
    Provisioning,
    /// Containers up and usable.
    Running,
    /// Containers stopped, resources retained.
    Stopped,
    /// Last operation failed; see `last_error`.
    Error,
    /// Teardown in progress.
    Destroying,
    /// All resources removed.
    Destroyed,
}

impl SandboxState {
    pub const ALL: [SandboxState; 7] = [
        Self::Creating,
        Self::Provisioning,
        Self::Running,
        Self::Stopped,
        Self::Error,
        Self::Destroying,
        Self::Destroyed,
    ];

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Whether sessions may be opened against the sandbox.
    pub fn is_operable(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// Named lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "message")]
pub enum SandboxEvent {
    BeginProvisioning,
    ProvisioningSucceeded,
    Start,
    Stop,
    /// Carries the failure message shown to the user.
    Fail(String),
    BeginDestroy,
    Destroyed,
}

impl SandboxEvent {
    /// Event name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeginProvisioning => "begin_provisioning",
            Self::ProvisioningSucceeded => "provisioning_succeeded",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Fail(_) => "fail",
            Self::BeginDestroy => "begin_destroy",
            Self::Destroyed => "destroyed",
        }
    }

    /// The transition table. `None` means the event is illegal in `from`.
    pub fn target(&self, from: SandboxState) -> Option<SandboxState> {
        use SandboxState::*;

        match (from, self) {
            (Creating, Self::BeginProvisioning) => Some(Provisioning),
            (Provisioning, Self::ProvisioningSucceeded) => Some(Running),
            (Stopped, Self::Start) => Some(Running),
            (Running, Self::Stop) => Some(Stopped),
            (Creating | Provisioning | Running | Stopped, Self::Fail(_)) => Some(Error),
            (Running | Stopped | Error, Self::BeginDestroy) => Some(Destroying),
            (Destroying, Self::Destroyed) => Some(Destroyed),
            _ => None,
        }
    }
}

/// An event that is not legal in the sandbox's current state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cannot apply {event} to sandbox {sandbox_id} in state {from}")]
pub struct TransitionError {
    pub sandbox_id: Uuid,
    pub from: SandboxState,
    pub event: &'static str,
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SandboxState,
    pub to: SandboxState,
    pub event: String,
    pub timestamp: DateTime<Utc>,
}

/// The unit of orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Unix user the sandbox runs as.
    pub owner: String,
    pub git_name: Option<String>,
    pub git_email: Option<String>,
    state: SandboxState,
    pub app_container_id: Option<String>,
    pub db_container_id: Option<String>,
    pub network_id: Option<String>,
    /// Host port bound to the app's service port.
    pub app_port: Option<u16>,
    /// Host port bound to the editor.
    pub editor_port: Option<u16>,
    pub sidecar_container_id: Option<String>,
    pub tailscale_hostname: Option<String>,
    pub tailscale_url: Option<String>,
    pub last_error: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub transitions: Vec<StateTransition>,
}

impl Sandbox {
    /// Create a sandbox record in `creating`.
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner: owner.into(),
            git_name: None,
            git_email: None,
            state: SandboxState::Creating,
            app_container_id: None,
            db_container_id: None,
            network_id: None,
            app_port: None,
            editor_port: None,
            sidecar_container_id: None,
            tailscale_hostname: None,
            tailscale_url: None,
            last_error: None,
            last_activity_at: now,
            created_at: now,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// First eight hex digits of the id, used in resource names.
    pub fn short_id(&self) -> String {
        steps::short_id(self.id)
    }

    /// Apply a lifecycle event.
    ///
    /// On rejection nothing about the sandbox changes.
    pub fn apply(&mut self, event: SandboxEvent) -> Result<SandboxState, TransitionError> {
        let Some(to) = event.target(self.state) else {
            return Err(TransitionError {
                sandbox_id: self.id,
                from: self.state,
                event: event.name(),
            });
        };

        self.transitions.push(StateTransition {
            from: self.state,
            to,
            event: event.name().to_string(),
            timestamp: Utc::now(),
        });

        // Cap transition history to prevent unbounded growth
        const MAX_TRANSITIONS: usize = 200;
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        match event {
            SandboxEvent::Fail(message) => self.last_error = Some(message),
            SandboxEvent::ProvisioningSucceeded | SandboxEvent::Start => self.last_error = None,
            _ => {}
        }

        self.state = to;
        self.touch();
        Ok(to)
    }

    /// Record activity now.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}
