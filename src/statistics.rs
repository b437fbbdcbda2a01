use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information passed in the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedPdus(u64),
    SendPdus(u64),
    ErrorPdus(u64),
}

pub trait Number {
    fn add(&self, value: u64);
    fn get(&self) -> u64;
}

#[derive(Default)]
pub struct Count(AtomicU64);

impl Number for Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-peer PDU counters.
#[derive(Default)]
pub struct Counts<T> {
    pub received_pdus: T,
    pub send_pdus: T,
    pub error_pdus: T,
}

impl<T: Number> Counts<T> {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedPdus(v) => self.received_pdus.add(*v),
            Stats::SendPdus(v) => self.send_pdus.add(*v),
            Stats::ErrorPdus(v) => self.error_pdus.add(*v),
        }
    }
}

/// Control-channel statistics, one row per connected peer.
#[derive(Clone, Default)]
pub struct Statistics(Arc<RwLock<AHashMap<SocketAddr, Counts<Count>>>>);

impl Statistics {
    /// Add a peer to the watch list.
    pub fn register(&self, addr: SocketAddr) {
        self.0.write().insert(addr, Counts::default());
    }

    /// Remove a peer from the watch list.
    pub fn unregister(&self, addr: &SocketAddr) {
        self.0.write().remove(addr);
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Counts<u64>> {
        self.0.read().get(addr).map(|counts| Counts {
            received_pdus: counts.received_pdus.get(),
            send_pdus: counts.send_pdus.get(),
            error_pdus: counts.error_pdus.get(),
        })
    }

    /// Reporter handles are cheap clones handed to the peer tasks.
    pub fn get_reporter(&self) -> StatisticsReporter {
        StatisticsReporter(self.0.clone())
    }
}

#[derive(Clone)]
pub struct StatisticsReporter(Arc<RwLock<AHashMap<SocketAddr, Counts<Count>>>>);

impl StatisticsReporter {
    pub fn send(&self, addr: &SocketAddr, reports: &[Stats]) {
        if let Some(counts) = self.0.read().get(addr) {
            for item in reports {
                counts.add(item);
            }
        }
    }
}
