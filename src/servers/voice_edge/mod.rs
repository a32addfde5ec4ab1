//! Voice edge: TCP signaling for channel membership, UDP media relay, and an
//! uplink to the master.

pub mod relay;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use tokio::net::TcpStream;

use crate::config::VoiceEdgeConfig;
use crate::network::shared::{
    AcceptFactory, Channel, ConnectFactory, DatagramFactory, DatagramHandler, StreamHandler,
};
use crate::network::{read_frame, write_frame};
use crate::servers::uplink::Uplink;
use crate::servers::{Lifecycle, RoleError, RoleKind, RoleState, ServerRole};
use crate::stats::{RoleStats, StatsSet};

use relay::RelayTable;

pub const CMD_JOIN: u8 = 0x20;
pub const CMD_LEAVE: u8 = 0x21;

pub const CMD_JOINED: u8 = 0xA0;
pub const CMD_LEFT: u8 = 0xA1;
pub const CMD_CHANNEL_FULL: u8 = 0xAF;

struct SignalContext {
    config: Arc<VoiceEdgeConfig>,
    relay: Arc<RelayTable>,
    media_port: u16,
    stats: Arc<RoleStats>,
}

pub struct VoiceEdgeRole {
    config: Arc<VoiceEdgeConfig>,
    accept: Arc<dyn AcceptFactory>,
    connect: Arc<dyn ConnectFactory>,
    datagram: Arc<dyn DatagramFactory>,
    lifecycle: Lifecycle,
    relay: Arc<RelayTable>,
    registered: Arc<AtomicBool>,
    stats: Option<StatsSet>,
    media: Option<Channel>,
    signal: Option<Channel>,
    uplink: Option<Channel>,
    media_addr: Option<SocketAddr>,
    signal_addr: Option<SocketAddr>,
}

impl VoiceEdgeRole {
    pub fn new(
        config: VoiceEdgeConfig,
        accept: Arc<dyn AcceptFactory>,
        connect: Arc<dyn ConnectFactory>,
        datagram: Arc<dyn DatagramFactory>,
    ) -> Result<Self, RoleError> {
        let relay = Arc::new(RelayTable::new(config.max_channels, config.peer_timeout()));
        Ok(Self {
            config: Arc::new(config),
            accept,
            connect,
            datagram,
            lifecycle: Lifecycle::new(RoleKind::VoiceEdge),
            relay,
            registered: Arc::new(AtomicBool::new(false)),
            stats: None,
            media: None,
            signal: None,
            uplink: None,
            media_addr: None,
            signal_addr: None,
        })
    }

    pub fn state(&self) -> RoleState {
        self.lifecycle.state()
    }

    pub fn signal_addr(&self) -> Option<SocketAddr> {
        self.signal_addr
    }

    pub fn media_addr(&self) -> Option<SocketAddr> {
        self.media_addr
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn channel_count(&self) -> usize {
        self.relay.channel_count()
    }
}

impl ServerRole for VoiceEdgeRole {
    fn kind(&self) -> RoleKind {
        RoleKind::VoiceEdge
    }

    fn start(&mut self, stats: &StatsSet) -> Result<(), RoleError> {
        self.lifecycle.check_can_start()?;
        let role_stats = Arc::clone(&stats.voice_edge);

        let media_handler: DatagramHandler = {
            let relay = Arc::clone(&self.relay);
            let stats = Arc::clone(&role_stats);
            Box::new(move |socket| Box::pin(relay::run_media(socket, relay, stats)))
        };
        let media_addr = self.config.media_addr;
        let media = self
            .datagram
            .bind_datagram(media_addr, media_handler)
            .map_err(|source| RoleError::Bind {
                role: RoleKind::VoiceEdge,
                addr: media_addr,
                source,
            })?;
        let media_bound = media.local_addr().unwrap_or(media_addr);

        let ctx = Arc::new(SignalContext {
            config: Arc::clone(&self.config),
            relay: Arc::clone(&self.relay),
            media_port: media_bound.port(),
            stats: Arc::clone(&role_stats),
        });
        let signal_handler: StreamHandler = Arc::new(move |stream, peer| {
            let ctx = Arc::clone(&ctx);
            Box::pin(async move { handle_signaling(ctx, stream, peer).await })
        });
        let signal_addr = self.config.signal_addr;
        let signal = match self.accept.listen(signal_addr, signal_handler) {
            Ok(channel) => channel,
            Err(source) => {
                media.close();
                return Err(RoleError::Bind {
                    role: RoleKind::VoiceEdge,
                    addr: signal_addr,
                    source,
                });
            }
        };
        let signal_bound = signal.local_addr().unwrap_or(signal_addr);

        let uplink = Uplink::new(
            RoleKind::VoiceEdge,
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
        self.media_addr = Some(media_bound);
        self.signal_addr = Some(signal_bound);
        self.media = Some(media);
        self.signal = Some(signal);
        self.uplink = Some(uplink);
        self.stats = Some(stats.clone());
        self.lifecycle.mark_started();
        tracing::info!(
            "[voice_edge] [ready] signal={} media={} master={} max_channels={}",
            signal_bound,
            media_bound,
            self.config.master_addr,
            self.config.max_channels
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RoleError> {
        self.lifecycle.check_can_stop()?;
        if let Some(uplink) = self.uplink.take() {
            uplink.close();
        }
        self.registered.store(false, Ordering::Release);
        if let Some(signal) = self.signal.take() {
            signal.close();
        }
        if let Some(media) = self.media.take() {
            media.close();
        }
        if let Some(stats) = &self.stats {
            stats.voice_edge.mark_stopped();
        }
        self.media_addr = None;
        self.signal_addr = None;
        self.lifecycle.mark_stopped();
        tracing::info!("[voice_edge] [stopped]");
        Ok(())
    }
}

async fn handle_signaling(ctx: Arc<SignalContext>, mut stream: TcpStream, peer: SocketAddr) {
    let _guard = ctx.stats.connection_opened();
    if let Err(e) = serve_signaling(&ctx, &mut stream).await {
        tracing::debug!("[voice_edge] [signal_closed] peer={} reason={:#}", peer, e);
    }
}

fn channel_id(payload: &[u8]) -> Result<u32> {
    match payload {
        [a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => bail!("channel id needs 4 bytes, got {}", payload.len()),
    }
}

async fn serve_signaling(ctx: &SignalContext, stream: &mut TcpStream) -> Result<()> {
    let idle = ctx.config.idle_timeout();
    loop {
        let frame = tokio::time::timeout(idle, read_frame(stream))
            .await
            .map_err(|_| anyhow::anyhow!("idle for {:?}", idle))??;
        ctx.stats.frame_in();

        match frame.cmd {
            CMD_JOIN => {
                let channel = channel_id(&frame.payload)?;
                if ctx.relay.reserve(channel, Instant::now()) {
                    tracing::debug!("[voice_edge] [join] channel={}", channel);
                    write_frame(stream, CMD_JOINED, &ctx.media_port.to_be_bytes()).await?;
                } else {
                    tracing::warn!("[voice_edge] [channel_full] channel={}", channel);
                    write_frame(stream, CMD_CHANNEL_FULL, &channel.to_be_bytes()).await?;
                }
                ctx.stats.frame_out();
            }
            CMD_LEAVE => {
                let channel = channel_id(&frame.payload)?;
                write_frame(stream, CMD_LEFT, &channel.to_be_bytes()).await?;
                ctx.stats.frame_out();
            }
            other => tracing::warn!("[voice_edge] [unknown_cmd] cmd={:02X}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id() {
        assert_eq!(channel_id(&[0, 0, 1, 2]).unwrap(), 258);
        assert_eq!(channel_id(&[0, 0, 0, 5, 0xFF]).unwrap(), 5);
        assert!(channel_id(&[1, 2]).is_err());
    }
}
