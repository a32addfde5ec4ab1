//! Per-role runtime counters
//!
//! The composition root owns one [`StatsRegistry`]; it creates the three
//! [`RoleStats`] handles and hands the same [`StatsSet`] to every role's
//! `start`, so any role can report on the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::servers::RoleKind;

#[derive(Debug)]
pub struct RoleStats {
    kind: RoleKind,
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    connections_rejected: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    datagrams_in: AtomicU64,
    datagrams_relayed: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    stopped_at: Mutex<Option<DateTime<Utc>>>,
}

impl RoleStats {
    pub fn new(kind: RoleKind) -> Self {
        Self {
            kind,
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            datagrams_in: AtomicU64::new(0),
            datagrams_relayed: AtomicU64::new(0),
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> RoleKind {
        self.kind
    }

    /// Count a new connection. The returned guard keeps it "active" until dropped.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_out(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_in(&self) {
        self.datagrams_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagrams_relayed(&self, n: u64) {
        self.datagrams_relayed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn mark_started(&self) {
        set_time(&self.started_at);
    }

    pub fn mark_stopped(&self) {
        set_time(&self.stopped_at);
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            role: self.kind,
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            datagrams_in: self.datagrams_in.load(Ordering::Relaxed),
            datagrams_relayed: self.datagrams_relayed.load(Ordering::Relaxed),
            started_at: read_time(&self.started_at),
            stopped_at: read_time(&self.stopped_at),
        }
    }
}

// A poisoned timestamp lock only means a panic mid-store of a Copy value.
fn set_time(slot: &Mutex<Option<DateTime<Utc>>>) {
    let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
    *guard = Some(Utc::now());
}

fn read_time(slot: &Mutex<Option<DateTime<Utc>>>) -> Option<DateTime<Utc>> {
    *slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Decrements `connections_active` on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: Arc<RoleStats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub role: RoleKind,
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub datagrams_in: u64,
    pub datagrams_relayed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// The full, ordered set of stats handles: master, user edge, voice edge.
#[derive(Debug, Clone)]
pub struct StatsSet {
    pub master: Arc<RoleStats>,
    pub user_edge: Arc<RoleStats>,
    pub voice_edge: Arc<RoleStats>,
}

impl StatsSet {
    pub fn get(&self, kind: RoleKind) -> &Arc<RoleStats> {
        match kind {
            RoleKind::Master => &self.master,
            RoleKind::UserEdge => &self.user_edge,
            RoleKind::VoiceEdge => &self.voice_edge,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RoleStats>> {
        [&self.master, &self.user_edge, &self.voice_edge].into_iter()
    }

    pub fn snapshot(&self) -> Vec<StatsSnapshot> {
        self.iter().map(|s| s.snapshot()).collect()
    }

    /// True when both sets hold the very same handles.
    pub fn same_handles(&self, other: &StatsSet) -> bool {
        Arc::ptr_eq(&self.master, &other.master)
            && Arc::ptr_eq(&self.user_edge, &other.user_edge)
            && Arc::ptr_eq(&self.voice_edge, &other.voice_edge)
    }
}

/// Owns one stats handle per role for the lifetime of the process.
#[derive(Debug)]
pub struct StatsRegistry {
    set: StatsSet,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            set: StatsSet {
                master: Arc::new(RoleStats::new(RoleKind::Master)),
                user_edge: Arc::new(RoleStats::new(RoleKind::UserEdge)),
                voice_edge: Arc::new(RoleStats::new(RoleKind::VoiceEdge)),
            },
        }
    }

    /// Hand out the handles. Every call returns the same three.
    pub fn collect(&self) -> StatsSet {
        self.set.clone()
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
