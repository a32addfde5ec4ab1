//! Composition root
//!
//! The one place that wires configuration, the shared I/O pools, the stats
//! registry and the three roles into a running process:
//!
//! 1. load every role config (nothing is created if any section fails)
//! 2. build [`SharedIo`] once
//! 3. construct the roles, each with only the factories it needs
//! 4. collect the stats handles
//! 5. start in [`START_ORDER`], stop in reverse
//!
//! A role that fails to start rolls back the roles already started, in
//! reverse order, before the error is returned.

use std::path::Path;
use std::sync::Arc;

use crate::config::{ConfigAggregator, ConfigError, IoConfig, MasterConfig, RoleConfigs};
use crate::config::{UserEdgeConfig, VoiceEdgeConfig};
use crate::network::shared::{AcceptFactory, ConnectFactory, DatagramFactory, SharedIo};
use crate::servers::master::MasterRole;
use crate::servers::user_edge::UserEdgeRole;
use crate::servers::voice_edge::VoiceEdgeRole;
use crate::servers::{RoleError, RoleKind, ServerRole};
use crate::stats::{StatsRegistry, StatsSet};

/// Master first so edges can register; user edge last, it depends on both.
pub const START_ORDER: [RoleKind; 3] = [RoleKind::Master, RoleKind::VoiceEdge, RoleKind::UserEdge];

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot create I/O pools: {0}")]
    IoPools(#[source] std::io::Error),

    #[error("cannot construct {role}: {source}")]
    Construct {
        role: RoleKind,
        #[source]
        source: RoleError,
    },

    #[error("cannot start {role}: {source}")]
    Startup {
        role: RoleKind,
        #[source]
        source: RoleError,
    },

    #[error("roles already started")]
    AlreadyStarted,
}

impl LifecycleError {
    /// The role the error belongs to, if any.
    pub fn role(&self) -> Option<RoleKind> {
        match self {
            LifecycleError::Construct { role, .. } | LifecycleError::Startup { role, .. } => {
                Some(*role)
            }
            _ => None,
        }
    }
}

/// Stop failures collected while running the whole stop sequence.
#[derive(Debug, thiserror::Error)]
#[error("{} role(s) failed to stop: {}", .failures.len(), summarize(.failures))]
pub struct ShutdownError {
    pub failures: Vec<RoleError>,
}

fn summarize(failures: &[RoleError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// How the composition root obtains its roles.
///
/// Each constructor receives exactly the capabilities that role uses.
pub trait RoleBuilder {
    type Master: ServerRole;
    type UserEdge: ServerRole;
    type VoiceEdge: ServerRole;

    fn master(
        &self,
        config: MasterConfig,
        accept: Arc<dyn AcceptFactory>,
    ) -> Result<Self::Master, RoleError>;

    fn user_edge(
        &self,
        config: UserEdgeConfig,
        accept: Arc<dyn AcceptFactory>,
        connect: Arc<dyn ConnectFactory>,
    ) -> Result<Self::UserEdge, RoleError>;

    fn voice_edge(
        &self,
        config: VoiceEdgeConfig,
        accept: Arc<dyn AcceptFactory>,
        connect: Arc<dyn ConnectFactory>,
        datagram: Arc<dyn DatagramFactory>,
    ) -> Result<Self::VoiceEdge, RoleError>;
}

/// The real network roles.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkRoles;

impl RoleBuilder for NetworkRoles {
    type Master = MasterRole;
    type UserEdge = UserEdgeRole;
    type VoiceEdge = VoiceEdgeRole;

    fn master(
        &self,
        config: MasterConfig,
        accept: Arc<dyn AcceptFactory>,
    ) -> Result<MasterRole, RoleError> {
        MasterRole::new(config, accept)
    }

    fn user_edge(
        &self,
        config: UserEdgeConfig,
        accept: Arc<dyn AcceptFactory>,
        connect: Arc<dyn ConnectFactory>,
    ) -> Result<UserEdgeRole, RoleError> {
        UserEdgeRole::new(config, accept, connect)
    }

    fn voice_edge(
        &self,
        config: VoiceEdgeConfig,
        accept: Arc<dyn AcceptFactory>,
        connect: Arc<dyn ConnectFactory>,
        datagram: Arc<dyn DatagramFactory>,
    ) -> Result<VoiceEdgeRole, RoleError> {
        VoiceEdgeRole::new(config, accept, connect, datagram)
    }
}

pub struct Composition<B: RoleBuilder = NetworkRoles> {
    io: Arc<SharedIo>,
    registry: StatsRegistry,
    master: B::Master,
    user_edge: B::UserEdge,
    voice_edge: B::VoiceEdge,
    /// Roles whose `start` succeeded, in start order.
    started: Vec<RoleKind>,
    launched: bool,
}

impl Composition<NetworkRoles> {
    /// Load `path`, build everything and start the roles.
    pub fn launch<P: AsRef<Path>>(path: P) -> Result<Self, LifecycleError> {
        Self::launch_with(path, &NetworkRoles)
    }
}

impl<B: RoleBuilder> Composition<B> {
    /// [`Composition::launch`] with a custom role builder.
    pub fn launch_with<P: AsRef<Path>>(path: P, builder: &B) -> Result<Self, LifecycleError> {
        Self::prepare(path, builder)?.started()
    }

    /// Load `path` and build everything without starting any role.
    pub fn prepare<P: AsRef<Path>>(path: P, builder: &B) -> Result<Self, LifecycleError> {
        let path = path.as_ref();
        let configs = ConfigAggregator::load(path)?;
        let io_config = IoConfig::from_file(path)?;
        tracing::info!("[lifecycle] [config_loaded] path={}", path.display());
        Self::build(configs, &io_config, builder)
    }

    /// Start every role. On failure the pools are released before returning.
    pub fn started(mut self) -> Result<Self, LifecycleError> {
        if let Err(e) = self.start() {
            // Nothing is running after a rollback.
            if let Err(release) = self.stop() {
                tracing::error!("[lifecycle] [release_failed] err={}", release);
            }
            return Err(e);
        }
        Ok(self)
    }

    /// Create the pools, construct all three roles and the stats registry.
    /// No role is started.
    pub fn build(
        configs: RoleConfigs,
        io_config: &IoConfig,
        builder: &B,
    ) -> Result<Self, LifecycleError> {
        let io = Arc::new(SharedIo::new(io_config).map_err(LifecycleError::IoPools)?);
        let accept: Arc<dyn AcceptFactory> = io.clone();
        let connect: Arc<dyn ConnectFactory> = io.clone();
        let datagram: Arc<dyn DatagramFactory> = io.clone();

        let master = builder
            .master(configs.master, Arc::clone(&accept))
            .map_err(|source| LifecycleError::Construct {
                role: RoleKind::Master,
                source,
            })?;
        let user_edge = builder
            .user_edge(configs.user_edge, Arc::clone(&accept), Arc::clone(&connect))
            .map_err(|source| LifecycleError::Construct {
                role: RoleKind::UserEdge,
                source,
            })?;
        let voice_edge = builder
            .voice_edge(configs.voice_edge, accept, connect, datagram)
            .map_err(|source| LifecycleError::Construct {
                role: RoleKind::VoiceEdge,
                source,
            })?;

        Ok(Self {
            io,
            registry: StatsRegistry::new(),
            master,
            user_edge,
            voice_edge,
            started: Vec::with_capacity(START_ORDER.len()),
            launched: false,
        })
    }

    fn role_mut(&mut self, kind: RoleKind) -> &mut dyn ServerRole {
        match kind {
            RoleKind::Master => &mut self.master,
            RoleKind::UserEdge => &mut self.user_edge,
            RoleKind::VoiceEdge => &mut self.voice_edge,
        }
    }

    /// Start every role in [`START_ORDER`], handing each the full stats set.
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        if self.launched {
            return Err(LifecycleError::AlreadyStarted);
        }
        self.launched = true;

        let stats = self.registry.collect();
        for kind in START_ORDER {
            if let Err(source) = self.role_mut(kind).start(&stats) {
                tracing::error!("[lifecycle] [start_failed] role={} err={}", kind, source);
                let failures = self.stop_started();
                if !failures.is_empty() {
                    tracing::warn!("[lifecycle] [rollback_incomplete] failures={}", failures.len());
                }
                return Err(LifecycleError::Startup { role: kind, source });
            }
            tracing::info!("[lifecycle] [started] role={}", kind);
            self.started.push(kind);
        }
        tracing::info!("[lifecycle] [running] roles={}", self.started.len());
        Ok(())
    }

    /// Stop started roles, most recently started first. Never stops early.
    fn stop_started(&mut self) -> Vec<RoleError> {
        let mut failures = Vec::new();
        while let Some(kind) = self.started.pop() {
            match self.role_mut(kind).stop() {
                Ok(()) => tracing::info!("[lifecycle] [stopped] role={}", kind),
                Err(e) => {
                    tracing::error!("[lifecycle] [stop_failed] role={} err={}", kind, e);
                    failures.push(e);
                }
            }
        }
        failures
    }

    /// Run the ordered stop, then shut the pools down.
    ///
    /// Every started role gets its `stop` call even when an earlier one fails.
    pub fn stop(mut self) -> Result<(), ShutdownError> {
        let failures = self.stop_started();

        let Self {
            io,
            master,
            user_edge,
            voice_edge,
            ..
        } = self;
        // The roles hold factory handles into the pools.
        drop((master, user_edge, voice_edge));
        match Arc::try_unwrap(io) {
            Ok(io) => io.shutdown(),
            Err(_) => tracing::warn!("[lifecycle] [io_still_referenced] pools dropped with last handle"),
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError { failures })
        }
    }

    /// The master role, for supervision.
    pub fn master(&self) -> &B::Master {
        &self.master
    }

    pub fn io(&self) -> &Arc<SharedIo> {
        &self.io
    }

    pub fn stats(&self) -> StatsSet {
        self.registry.collect()
    }

    /// Roles currently started, in start order.
    pub fn running(&self) -> &[RoleKind] {
        &self.started
    }
}
