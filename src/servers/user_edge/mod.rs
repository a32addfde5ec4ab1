//! User-facing edge: terminates client connections and registers with the
//! master over an uplink.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

use crate::config::UserEdgeConfig;
use crate::network::shared::{AcceptFactory, Channel, ConnectFactory, StreamHandler};
use crate::network::{read_frame, write_frame};
use crate::servers::uplink::Uplink;
use crate::servers::{Lifecycle, RoleError, RoleKind, RoleState, ServerRole};
use crate::stats::{RoleStats, StatsSet};

pub const CMD_HELLO: u8 = 0x10;
pub const CMD_PING: u8 = 0x11;
pub const CMD_BYE: u8 = 0x12;

pub const CMD_WELCOME: u8 = 0x90;
pub const CMD_PONG: u8 = 0x91;
pub const CMD_REJECT: u8 = 0x9F;

/// Longest client name kept from `HELLO`.
const NAME_MAX: usize = 32;

struct ClientContext {
    config: Arc<UserEdgeConfig>,
    slots: Arc<Semaphore>,
    next_session: AtomicU32,
    online: Arc<Mutex<HashMap<u32, String>>>,
    stats: Arc<RoleStats>,
}

pub struct UserEdgeRole {
    config: Arc<UserEdgeConfig>,
    accept: Arc<dyn AcceptFactory>,
    connect: Arc<dyn ConnectFactory>,
    lifecycle: Lifecycle,
    registered: Arc<AtomicBool>,
    online: Arc<Mutex<HashMap<u32, String>>>,
    stats: Option<StatsSet>,
    listener: Option<Channel>,
    uplink: Option<Channel>,
    listen_addr: Option<SocketAddr>,
}

impl UserEdgeRole {
    pub fn new(
        config: UserEdgeConfig,
        accept: Arc<dyn AcceptFactory>,
        connect: Arc<dyn ConnectFactory>,
    ) -> Result<Self, RoleError> {
        Ok(Self {
            config: Arc::new(config),
            accept,
            connect,
            lifecycle: Lifecycle::new(RoleKind::UserEdge),
            registered: Arc::new(AtomicBool::new(false)),
            online: Arc::new(Mutex::new(HashMap::new())),
            stats: None,
            listener: None,
            uplink: None,
            listen_addr: None,
        })
    }

    pub fn state(&self) -> RoleState {
        self.lifecycle.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// True while the master has acknowledged this edge.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Names of clients that completed `HELLO`, by session id.
    pub fn online(&self) -> Vec<(u32, String)> {
        let online = self.online.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<(u32, String)> = online.iter().map(|(k, v)| (*k, v.clone())).collect();
        list.sort_by_key(|(id, _)| *id);
        list
    }
}

impl ServerRole for UserEdgeRole {
    fn kind(&self) -> RoleKind {
        RoleKind::UserEdge
    }

    fn start(&mut self, stats: &StatsSet) -> Result<(), RoleError> {
        self.lifecycle.check_can_start()?;
        let role_stats = Arc::clone(&stats.user_edge);

        let ctx = Arc::new(ClientContext {
            config: Arc::clone(&self.config),
            slots: Arc::new(Semaphore::new(self.config.max_clients)),
            next_session: AtomicU32::new(1),
            online: Arc::clone(&self.online),
            stats: Arc::clone(&role_stats),
        });
        let handler: StreamHandler = Arc::new(move |stream, peer| {
            let ctx = Arc::clone(&ctx);
            Box::pin(async move { handle_client(ctx, stream, peer).await })
        });

        let addr = self.config.listen_addr;
        let listener = self
            .accept
            .listen(addr, handler)
            .map_err(|source| RoleError::Bind {
                role: RoleKind::UserEdge,
                addr,
                source,
            })?;
        let bound = listener.local_addr().unwrap_or(addr);

        let uplink = Uplink::new(
            RoleKind::UserEdge,
            &self.config.master_token,
            &self.config.advertise(),
            self.config.heartbeat_interval(),
            Arc::clone(&self.registered),
            Arc::clone(&role_stats),
        );
        let uplink = self.connect.dial(
            self.config.master_addr,
            self.config.reconnect_interval(),
            uplink.into_handler(),
        );

        role_stats.mark_started();
        self.listen_addr = Some(bound);
        self.listener = Some(listener);
        self.uplink = Some(uplink);
        self.stats = Some(stats.clone());
        self.lifecycle.mark_started();
        tracing::info!(
            "[user_edge] [ready] addr={} master={} max_clients={}",
            bound,
            self.config.master_addr,
            self.config.max_clients
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RoleError> {
        self.lifecycle.check_can_stop()?;
        if let Some(uplink) = self.uplink.take() {
            uplink.close();
        }
        self.registered.store(false, Ordering::Release);
        if let Some(listener) = self.listener.take() {
            listener.close();
        }
        self.online
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(stats) = &self.stats {
            stats.user_edge.mark_stopped();
        }
        self.listen_addr = None;
        self.lifecycle.mark_stopped();
        tracing::info!("[user_edge] [stopped]");
        Ok(())
    }
}

async fn handle_client(ctx: Arc<ClientContext>, mut stream: TcpStream, peer: SocketAddr) {
    let Ok(permit) = Arc::clone(&ctx.slots).try_acquire_owned() else {
        ctx.stats.connection_rejected();
        tracing::warn!("[user_edge] [full] peer={} max={}", peer, ctx.config.max_clients);
        if write_frame(&mut stream, CMD_REJECT, &[]).await.is_ok() {
            ctx.stats.frame_out();
        }
        return;
    };
    let _guard = ctx.stats.connection_opened();

    let mut session = None;
    match serve_client(&ctx, &mut stream, &mut session).await {
        Ok(()) => tracing::debug!("[user_edge] [bye] peer={}", peer),
        Err(e) => tracing::debug!("[user_edge] [client_closed] peer={} reason={:#}", peer, e),
    }
    if let Some(id) = session {
        ctx.online
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
    drop(permit);
}

/// Returns `Ok` on `BYE`; every other exit is an error.
async fn serve_client(
    ctx: &ClientContext,
    stream: &mut TcpStream,
    session: &mut Option<u32>,
) -> Result<()> {
    let idle = ctx.config.idle_timeout();
    loop {
        let frame = tokio::time::timeout(idle, read_frame(stream))
            .await
            .map_err(|_| anyhow::anyhow!("idle for {:?}", idle))??;
        ctx.stats.frame_in();

        match frame.cmd {
            CMD_HELLO => {
                let id = match *session {
                    Some(id) => id,
                    None => {
                        let id = ctx.next_session.fetch_add(1, Ordering::Relaxed);
                        let name_len = frame.payload.len().min(NAME_MAX);
                        let name = String::from_utf8_lossy(&frame.payload[..name_len]).into_owned();
                        tracing::info!("[user_edge] [hello] session={} name={}", id, name);
                        ctx.online
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(id, name);
                        *session = Some(id);
                        id
                    }
                };
                write_frame(stream, CMD_WELCOME, &id.to_be_bytes()).await?;
                ctx.stats.frame_out();
            }
            CMD_PING => {
                write_frame(stream, CMD_PONG, &frame.payload).await?;
                ctx.stats.frame_out();
            }
            CMD_BYE => return Ok(()),
            other => tracing::warn!("[user_edge] [unknown_cmd] cmd={:02X}", other),
        }
    }
}
