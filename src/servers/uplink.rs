//! Edge -> master registration link.
//!
//! Runs as the handler of a `dial` channel: register once per connection,
//! then heartbeat until the link breaks. The dial loop reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use tokio::net::TcpStream;

use crate::network::shared::LinkHandler;
use crate::network::{read_frame, write_frame};
use crate::servers::master::packet::{
    build_register, parse_register_ack, RegisterResult, CMD_HEARTBEAT, CMD_HEARTBEAT_ACK,
    CMD_REGISTER, CMD_REGISTER_ACK,
};
use crate::servers::RoleKind;
use crate::stats::RoleStats;

const REGISTER_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Uplink {
    kind: RoleKind,
    token: String,
    advertise: String,
    heartbeat: Duration,
    registered: Arc<AtomicBool>,
    stats: Arc<RoleStats>,
}

impl Uplink {
    pub fn new(
        kind: RoleKind,
        token: &str,
        advertise: &str,
        heartbeat: Duration,
        registered: Arc<AtomicBool>,
        stats: Arc<RoleStats>,
    ) -> Self {
        Self {
            kind,
            token: token.to_string(),
            advertise: advertise.to_string(),
            heartbeat,
            registered,
            stats,
        }
    }

    pub fn into_handler(self) -> LinkHandler {
        let link = Arc::new(self);
        Arc::new(move |stream| {
            let link = Arc::clone(&link);
            Box::pin(async move {
                if let Err(e) = link.run(stream).await {
                    tracing::warn!("[{}] [uplink_lost] reason={:#}", link.kind, e);
                }
                link.registered.store(false, Ordering::Release);
            })
        })
    }

    async fn run(&self, mut stream: TcpStream) -> Result<()> {
        let payload = build_register(self.kind, &self.token, &self.advertise);
        write_frame(&mut stream, CMD_REGISTER, &payload).await?;
        self.stats.frame_out();

        let ack = tokio::time::timeout(REGISTER_ACK_TIMEOUT, read_frame(&mut stream))
            .await
            .context("master did not answer REGISTER")??;
        self.stats.frame_in();
        ensure!(
            ack.cmd == CMD_REGISTER_ACK,
            "expected REGISTER_ACK, got {:02X}",
            ack.cmd
        );
        match parse_register_ack(&ack.payload)? {
            RegisterResult::Ok => {}
            refused => bail!("master refused registration: {:?}", refused),
        }

        self.registered.store(true, Ordering::Release);
        tracing::info!(
            "[{}] [registered] advertise={} peer={:?}",
            self.kind,
            self.advertise,
            stream.peer_addr().ok()
        );

        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            write_frame(&mut stream, CMD_HEARTBEAT, &[]).await?;
            self.stats.frame_out();
            let ack = tokio::time::timeout(self.heartbeat, read_frame(&mut stream))
                .await
                .context("heartbeat not acknowledged")??;
            self.stats.frame_in();
            ensure!(
                ack.cmd == CMD_HEARTBEAT_ACK,
                "expected HEARTBEAT_ACK, got {:02X}",
                ack.cmd
            );
        }
    }
}
