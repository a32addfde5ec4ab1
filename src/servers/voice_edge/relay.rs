//! UDP media relay.
//!
//! A datagram is `[channel u32 BE][payload]`. The sender is recorded as a
//! peer of that channel and the datagram goes out verbatim to every other
//! peer heard from within the peer timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::stats::RoleStats;

/// Channel id prefix carried by every media datagram.
pub const CHANNEL_HEADER_LEN: usize = 4;

const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug)]
struct ChannelPeers {
    opened: Instant,
    peers: HashMap<SocketAddr, Instant>,
}

impl ChannelPeers {
    fn new(now: Instant) -> Self {
        Self {
            opened: now,
            peers: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct RelayTable {
    channels: Mutex<HashMap<u32, ChannelPeers>>,
    max_channels: usize,
    peer_timeout: Duration,
}

impl RelayTable {
    pub fn new(max_channels: usize, peer_timeout: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            max_channels,
            peer_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, ChannelPeers>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peer_timeout(&self) -> Duration {
        self.peer_timeout
    }

    /// Open `channel` if there is room. False when the table is full.
    pub fn reserve(&self, channel: u32, now: Instant) -> bool {
        let mut channels = self.lock();
        if channels.contains_key(&channel) {
            return true;
        }
        if channels.len() >= self.max_channels {
            return false;
        }
        channels.insert(channel, ChannelPeers::new(now));
        true
    }

    /// Record `from` on `channel` and return where to relay.
    /// `None` means the channel is new and the table is full.
    pub fn route(&self, channel: u32, from: SocketAddr, now: Instant) -> Option<Vec<SocketAddr>> {
        let mut channels = self.lock();
        if !channels.contains_key(&channel) && channels.len() >= self.max_channels {
            return None;
        }
        let entry = channels
            .entry(channel)
            .or_insert_with(|| ChannelPeers::new(now));
        entry.peers.insert(from, now);
        let timeout = self.peer_timeout;
        Some(
            entry
                .peers
                .iter()
                .filter(|(addr, seen)| **addr != from && now.duration_since(**seen) <= timeout)
                .map(|(addr, _)| *addr)
                .collect(),
        )
    }

    /// Drop stale peers and channels left empty past the timeout.
    /// Returns how many peers were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let timeout = self.peer_timeout;
        let mut removed = 0;
        self.lock().retain(|_, ch| {
            let before = ch.peers.len();
            ch.peers.retain(|_, seen| now.duration_since(*seen) <= timeout);
            removed += before - ch.peers.len();
            !ch.peers.is_empty() || now.duration_since(ch.opened) <= timeout
        });
        removed
    }

    pub fn channel_count(&self) -> usize {
        self.lock().len()
    }

    pub fn peer_count(&self, channel: u32) -> usize {
        self.lock().get(&channel).map_or(0, |ch| ch.peers.len())
    }
}

/// Receive loop for the media socket. Runs until its channel closes.
pub async fn run_media(socket: Arc<UdpSocket>, table: Arc<RelayTable>, stats: Arc<RoleStats>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut sweep = tokio::time::interval(table.peer_timeout());
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let removed = table.sweep(Instant::now());
                if removed > 0 {
                    tracing::debug!("[voice_edge] [peers_expired] count={}", removed);
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!("[voice_edge] [recv_failed] err={}", e);
                        continue;
                    }
                };
                stats.datagram_in();
                if n < CHANNEL_HEADER_LEN {
                    continue;
                }
                let channel = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                let Some(targets) = table.route(channel, from, Instant::now()) else {
                    tracing::debug!("[voice_edge] [channel_limit] channel={} from={}", channel, from);
                    continue;
                };
                let mut sent = 0;
                for to in targets {
                    if socket.send_to(&buf[..n], to).await.is_ok() {
                        sent += 1;
                    }
                }
                stats.datagrams_relayed(sent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_route_excludes_sender() {
        let table = RelayTable::new(4, Duration::from_secs(30));
        let now = Instant::now();
        assert!(table.route(7, addr(1), now).unwrap().is_empty());
        assert_eq!(table.route(7, addr(2), now).unwrap(), vec![addr(1)]);

        let mut targets = table.route(7, addr(3), now).unwrap();
        targets.sort();
        assert_eq!(targets, vec![addr(1), addr(2)]);
        assert_eq!(table.peer_count(7), 3);
    }

    #[test]
    fn test_channels_are_isolated() {
        let table = RelayTable::new(4, Duration::from_secs(30));
        let now = Instant::now();
        table.route(1, addr(1), now);
        assert!(table.route(2, addr(2), now).unwrap().is_empty());
    }

    #[test]
    fn test_channel_limit() {
        let table = RelayTable::new(1, Duration::from_secs(30));
        let now = Instant::now();
        assert!(table.route(1, addr(1), now).is_some());
        assert!(table.route(2, addr(2), now).is_none());
        assert!(!table.reserve(2, now));
        // Existing channels keep working at the limit.
        assert!(table.reserve(1, now));
        assert_eq!(table.route(1, addr(2), now).unwrap(), vec![addr(1)]);
    }

    #[test]
    fn test_stale_peers_not_relayed_and_swept() {
        let timeout = Duration::from_secs(5);
        let table = RelayTable::new(4, timeout);
        let start = Instant::now();
        table.route(9, addr(1), start);

        let later = start + timeout + Duration::from_secs(1);
        assert!(table.route(9, addr(2), later).unwrap().is_empty());
        assert_eq!(table.sweep(later), 1);
        assert_eq!(table.peer_count(9), 1);

        let much_later = later + timeout + Duration::from_secs(1);
        assert_eq!(table.sweep(much_later), 1);
        assert_eq!(table.channel_count(), 0);
    }

    #[test]
    fn test_reserved_channel_survives_until_timeout() {
        let timeout = Duration::from_secs(5);
        let table = RelayTable::new(2, timeout);
        let start = Instant::now();
        assert!(table.reserve(3, start));
        table.sweep(start + Duration::from_secs(1));
        assert_eq!(table.channel_count(), 1);
        table.sweep(start + timeout + Duration::from_secs(1));
        assert_eq!(table.channel_count(), 0);
    }
}
