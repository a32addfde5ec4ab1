//! Master role: the coordination server edges register with.
//!
//! Edges open one long-lived link, send `REGISTER` once and then heartbeat.
//! The directory entry lives as long as the link. `STATUS` returns a YAML
//! health report covering the directory and every role's stats.

pub mod packet;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpStream;

use crate::config::MasterConfig;
use crate::network::acl::AccessList;
use crate::network::shared::{AcceptFactory, Channel, StreamHandler};
use crate::network::{read_frame, write_frame};
use crate::servers::{Lifecycle, RoleError, RoleKind, RoleState, ServerRole};
use crate::stats::{StatsSet, StatsSnapshot};

use packet::{
    parse_register, RegisterResult, CMD_HEARTBEAT, CMD_HEARTBEAT_ACK, CMD_REGISTER,
    CMD_REGISTER_ACK, CMD_STATUS, CMD_STATUS_REPLY,
};

/// One registered edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeRecord {
    pub id: u64,
    pub kind: RoleKind,
    pub advertise: String,
    pub peer: SocketAddr,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Registered edges, keyed by link id.
#[derive(Debug)]
pub struct EdgeDirectory {
    edges: Mutex<HashMap<u64, EdgeRecord>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl EdgeDirectory {
    pub fn new(capacity: usize) -> Self {
        Self {
            edges: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, EdgeRecord>> {
        self.edges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an edge. Returns `None` when the directory is full.
    pub fn register(&self, kind: RoleKind, advertise: &str, peer: SocketAddr) -> Option<u64> {
        let mut edges = self.lock();
        if edges.len() >= self.capacity {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        edges.insert(
            id,
            EdgeRecord {
                id,
                kind,
                advertise: advertise.to_string(),
                peer,
                registered_at: now,
                last_heartbeat: now,
            },
        );
        Some(id)
    }

    pub fn heartbeat(&self, id: u64) -> bool {
        match self.lock().get_mut(&id) {
            Some(edge) => {
                edge.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: u64) -> Option<EdgeRecord> {
        self.lock().remove(&id)
    }

    /// All edges, oldest registration first.
    pub fn list(&self) -> Vec<EdgeRecord> {
        let mut edges: Vec<EdgeRecord> = self.lock().values().cloned().collect();
        edges.sort_by_key(|e| e.id);
        edges
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// What supervision sees: role state, the edge directory and all role stats.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: RoleState,
    pub listen_addr: Option<SocketAddr>,
    pub edges: Vec<EdgeRecord>,
    pub stats: Vec<StatsSnapshot>,
}

struct LinkContext {
    config: Arc<MasterConfig>,
    acl: AccessList,
    directory: Arc<EdgeDirectory>,
    stats: StatsSet,
    listen_addr: OnceLock<SocketAddr>,
}

impl LinkContext {
    fn report(&self) -> HealthReport {
        HealthReport {
            state: RoleState::Started,
            listen_addr: self.listen_addr.get().copied(),
            edges: self.directory.list(),
            stats: self.stats.snapshot(),
        }
    }
}

pub struct MasterRole {
    config: Arc<MasterConfig>,
    acl: AccessList,
    accept: Arc<dyn AcceptFactory>,
    lifecycle: Lifecycle,
    directory: Arc<EdgeDirectory>,
    stats: Option<StatsSet>,
    channel: Option<Channel>,
    listen_addr: Option<SocketAddr>,
}

impl MasterRole {
    pub fn new(config: MasterConfig, accept: Arc<dyn AcceptFactory>) -> Result<Self, RoleError> {
        let acl = config.access_list().map_err(|e| RoleError::Config {
            role: RoleKind::Master,
            reason: e.to_string(),
        })?;
        let directory = Arc::new(EdgeDirectory::new(config.max_edges));
        Ok(Self {
            config: Arc::new(config),
            acl,
            accept,
            lifecycle: Lifecycle::new(RoleKind::Master),
            directory,
            stats: None,
            channel: None,
            listen_addr: None,
        })
    }

    pub fn state(&self) -> RoleState {
        self.lifecycle.state()
    }

    /// Bound address while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn edges(&self) -> Vec<EdgeRecord> {
        self.directory.list()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            state: self.state(),
            listen_addr: self.listen_addr,
            edges: self.directory.list(),
            stats: self.stats.as_ref().map(StatsSet::snapshot).unwrap_or_default(),
        }
    }
}

impl ServerRole for MasterRole {
    fn kind(&self) -> RoleKind {
        RoleKind::Master
    }

    fn start(&mut self, stats: &StatsSet) -> Result<(), RoleError> {
        self.lifecycle.check_can_start()?;

        let ctx = Arc::new(LinkContext {
            config: Arc::clone(&self.config),
            acl: self.acl.clone(),
            directory: Arc::clone(&self.directory),
            stats: stats.clone(),
            listen_addr: OnceLock::new(),
        });
        let handler: StreamHandler = {
            let ctx = Arc::clone(&ctx);
            Arc::new(move |stream, peer| {
                let ctx = Arc::clone(&ctx);
                Box::pin(async move { handle_edge_link(ctx, stream, peer).await })
            })
        };

        let addr = self.config.listen_addr;
        let channel = self
            .accept
            .listen(addr, handler)
            .map_err(|source| RoleError::Bind {
                role: RoleKind::Master,
                addr,
                source,
            })?;
        let bound = channel.local_addr().unwrap_or(addr);
        let _ = ctx.listen_addr.set(bound);

        stats.master.mark_started();
        self.listen_addr = Some(bound);
        self.stats = Some(stats.clone());
        self.channel = Some(channel);
        self.lifecycle.mark_started();
        tracing::info!(
            "[master] [ready] addr={} max_edges={} acl_entries={}",
            bound,
            self.config.max_edges,
            self.acl.len()
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RoleError> {
        self.lifecycle.check_can_stop()?;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        let dropped = self.directory.len();
        self.directory.clear();
        if let Some(stats) = &self.stats {
            stats.master.mark_stopped();
        }
        self.listen_addr = None;
        self.lifecycle.mark_stopped();
        tracing::info!("[master] [stopped] edges_dropped={}", dropped);
        Ok(())
    }
}

async fn handle_edge_link(ctx: Arc<LinkContext>, mut stream: TcpStream, peer: SocketAddr) {
    let stats = &ctx.stats.master;
    if !ctx.acl.permits(peer.ip()) {
        stats.connection_rejected();
        tracing::warn!("[master] [acl_denied] peer={}", peer);
        return;
    }
    let _guard = stats.connection_opened();

    let mut edge_id = None;
    if let Err(e) = serve_link(&ctx, &mut stream, peer, &mut edge_id).await {
        tracing::debug!("[master] [link_closed] peer={} reason={:#}", peer, e);
    }

    if let Some(edge) = edge_id.and_then(|id| ctx.directory.remove(id)) {
        tracing::info!(
            "[master] [edge_gone] id={} kind={} advertise={}",
            edge.id,
            edge.kind,
            edge.advertise
        );
    }
}

async fn serve_link(
    ctx: &LinkContext,
    stream: &mut TcpStream,
    peer: SocketAddr,
    edge_id: &mut Option<u64>,
) -> Result<()> {
    let stats = &ctx.stats.master;
    let timeout = ctx.config.heartbeat_timeout();
    loop {
        let frame = tokio::time::timeout(timeout, read_frame(stream))
            .await
            .map_err(|_| anyhow!("no traffic for {:?}", timeout))??;
        stats.frame_in();

        match frame.cmd {
            CMD_REGISTER => {
                let result = register(ctx, &frame.payload, peer, edge_id);
                write_frame(stream, CMD_REGISTER_ACK, &[result as u8]).await?;
                stats.frame_out();
                if result != RegisterResult::Ok {
                    bail!("registration refused: {:?}", result);
                }
            }
            CMD_HEARTBEAT => {
                let Some(id) = *edge_id else {
                    bail!("heartbeat before registration");
                };
                ctx.directory.heartbeat(id);
                write_frame(stream, CMD_HEARTBEAT_ACK, &[]).await?;
                stats.frame_out();
            }
            CMD_STATUS => {
                let body = serde_yaml::to_string(&ctx.report())?;
                write_frame(stream, CMD_STATUS_REPLY, body.as_bytes()).await?;
                stats.frame_out();
            }
            other => tracing::warn!("[master] [unknown_cmd] peer={} cmd={:02X}", peer, other),
        }
    }
}

fn register(
    ctx: &LinkContext,
    payload: &[u8],
    peer: SocketAddr,
    edge_id: &mut Option<u64>,
) -> RegisterResult {
    if edge_id.is_some() {
        return RegisterResult::Malformed;
    }
    let reg = match parse_register(payload) {
        Ok(reg) => reg,
        Err(result) => return result,
    };
    if reg.token != ctx.config.auth_token {
        tracing::warn!("[master] [auth_failed] peer={} kind={}", peer, reg.kind);
        return RegisterResult::BadToken;
    }
    match ctx.directory.register(reg.kind, &reg.advertise, peer) {
        Some(id) => {
            *edge_id = Some(id);
            tracing::info!(
                "[master] [edge_registered] id={} kind={} advertise={} peer={}",
                id,
                reg.kind,
                reg.advertise,
                peer
            );
            RegisterResult::Ok
        }
        None => {
            tracing::warn!("[master] [directory_full] peer={} kind={}", peer, reg.kind);
            RegisterResult::DirectoryFull
        }
    }
}
