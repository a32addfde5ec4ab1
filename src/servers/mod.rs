//! Server roles
//!
//! The three roles that run side by side in one process:
//! - master: coordination; edges register with it
//! - user_edge: terminates client connections
//! - voice_edge: TCP signaling plus UDP media relay
//!
//! Every role implements [`ServerRole`] and moves through
//! `Constructed -> Started -> Stopped` exactly once.

pub mod master;
pub mod uplink;
pub mod user_edge;
pub mod voice_edge;

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

use crate::stats::StatsSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Master,
    UserEdge,
    VoiceEdge,
}

impl RoleKind {
    /// Wire id used in edge registration.
    pub fn wire_id(self) -> u8 {
        match self {
            RoleKind::Master => 0,
            RoleKind::UserEdge => 1,
            RoleKind::VoiceEdge => 2,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(RoleKind::Master),
            1 => Some(RoleKind::UserEdge),
            2 => Some(RoleKind::VoiceEdge),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::Master => "master",
            RoleKind::UserEdge => "user_edge",
            RoleKind::VoiceEdge => "voice_edge",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleState {
    Constructed,
    Started,
    Stopped,
}

impl fmt::Display for RoleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoleState::Constructed => "constructed",
            RoleState::Started => "started",
            RoleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error("[{role}] cannot {action} while {state}")]
    InvalidTransition {
        role: RoleKind,
        state: RoleState,
        action: &'static str,
    },

    #[error("[{role}] cannot bind {addr}: {source}")]
    Bind {
        role: RoleKind,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("[{role}] invalid configuration: {reason}")]
    Config { role: RoleKind, reason: String },

    #[error("[{role}] {source}")]
    Other {
        role: RoleKind,
        #[source]
        source: anyhow::Error,
    },
}

/// Integration contract shared by every role.
///
/// `start` binds and returns once the role accepts traffic. `stop` releases
/// every socket the role owns and returns once quiesced. Both block the
/// calling thread; neither may be called from inside an async context.
/// Starting twice, stopping before start, or restarting after stop is
/// rejected with [`RoleError::InvalidTransition`].
pub trait ServerRole {
    fn kind(&self) -> RoleKind;

    fn start(&mut self, stats: &StatsSet) -> Result<(), RoleError>;

    fn stop(&mut self) -> Result<(), RoleError>;
}

/// Tracks the one-way `Constructed -> Started -> Stopped` machine.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    role: RoleKind,
    state: RoleState,
}

impl Lifecycle {
    pub fn new(role: RoleKind) -> Self {
        Self {
            role,
            state: RoleState::Constructed,
        }
    }

    pub fn state(&self) -> RoleState {
        self.state
    }

    pub fn check_can_start(&self) -> Result<(), RoleError> {
        self.require(RoleState::Constructed, "start")
    }

    pub fn check_can_stop(&self) -> Result<(), RoleError> {
        self.require(RoleState::Started, "stop")
    }

    pub fn mark_started(&mut self) {
        self.state = RoleState::Started;
    }

    pub fn mark_stopped(&mut self) {
        self.state = RoleState::Stopped;
    }

    fn require(&self, want: RoleState, action: &'static str) -> Result<(), RoleError> {
        if self.state == want {
            Ok(())
        } else {
            Err(RoleError::InvalidTransition {
                role: self.role,
                state: self.state,
                action,
            })
        }
    }
}
