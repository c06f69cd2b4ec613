// Live gateway statistics: relay throughput plus client and session counts.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

struct StatsSample {
    at: Instant,
    relayed_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub relay_bps: u64,
    pub relayed_bytes_total: u64,
    pub active_clients: u32,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub requests_rejected: u64,
}

pub struct StatsCollector {
    relayed_bytes_total: AtomicU64,
    active_clients: AtomicU32,
    sessions_created: AtomicU64,
    sessions_destroyed: AtomicU64,
    requests_rejected: AtomicU64,
    last_sample: Mutex<StatsSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            relayed_bytes_total: AtomicU64::new(0),
            active_clients: AtomicU32::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_destroyed: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                relayed_bytes: 0,
            }),
        }
    }

    pub fn record_relayed(&self, bytes: u64) {
        self.relayed_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn client_joined(&self) {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_left(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_destroyed(&self) {
        self.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let relayed = self.relayed_bytes_total.load(Ordering::Relaxed);

        let relay_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let bps = if elapsed > 0.1 {
                ((relayed - sample.relayed_bytes) as f64 / elapsed) as u64
            } else {
                0
            };
            sample.at = now;
            sample.relayed_bytes = relayed;
            bps
        };

        StatsSnapshot {
            relay_bps,
            relayed_bytes_total: relayed,
            active_clients: self.active_clients.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_destroyed: self.sessions_destroyed.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
