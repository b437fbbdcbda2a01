use std::{net::SocketAddr, sync::Arc};

use codec::message::{BankSlot, ClientSlot, ComponentIdentity};
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;

/// Events dispatched into a peer task from outside its own select loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// Drain pending mapping work (bank peers).
    Push,
    /// Push the current bank coordinates to the peer (client peers).
    ConfigBankd,
}

/// Where a client's SIM currently lives, as last told to it.
///
/// An all-zero value means "no bank": it is what a client is told when
/// its mapping or its bank goes away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BankCoordinates {
    pub slot: BankSlot,
    pub ip: u32,
    pub port: u16,
}

/// Classification of a peer, decided by the handshake.
#[derive(Debug, Clone, Copy)]
pub enum PeerClass {
    Unknown,
    Client {
        slot: ClientSlot,
        bankd: BankCoordinates,
    },
    Bank {
        bank_id: u16,
        num_slots: u16,
    },
}

pub struct PeerInfo {
    pub identity: Option<ComponentIdentity>,
    pub class: PeerClass,
}

/// Shared view of one accepted peer.
///
/// The owning task drives the socket; everybody else only sees this
/// handle and talks to the task through its event channel.
pub struct PeerHandle {
    pub id: u64,
    pub addr: SocketAddr,
    events: UnboundedSender<PeerEvent>,
    pub info: RwLock<PeerInfo>,
}

impl PeerHandle {
    pub fn new(id: u64, addr: SocketAddr, events: UnboundedSender<PeerEvent>) -> Self {
        Self {
            id,
            addr,
            events,
            info: RwLock::new(PeerInfo {
                identity: None,
                class: PeerClass::Unknown,
            }),
        }
    }

    /// Sends an event to the owning task. Events to an already-dying
    /// peer are silently dropped, its cleanup is running anyway.
    pub fn dispatch(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_identity(&self, identity: ComponentIdentity) {
        self.info.write().identity = Some(identity);
    }

    pub fn client_slot(&self) -> Option<ClientSlot> {
        match self.info.read().class {
            PeerClass::Client { slot, .. } => Some(slot),
            _ => None,
        }
    }

    pub fn bank_id(&self) -> Option<u16> {
        match self.info.read().class {
            PeerClass::Bank { bank_id, .. } => Some(bank_id),
            _ => None,
        }
    }

    pub fn bankd_coordinates(&self) -> Option<BankCoordinates> {
        match self.info.read().class {
            PeerClass::Client { bankd, .. } => Some(bankd),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Shelves {
    connections: Vec<Arc<PeerHandle>>,
    clients: Vec<Arc<PeerHandle>>,
    banks: Vec<Arc<PeerHandle>>,
}

/// The three peer lists under one lock: `connections` holds peers that
/// have not completed the handshake yet; a successful handshake migrates
/// a peer to `clients` or `banks`. Uniqueness of client slots and bank
/// ids is enforced at migration time, in the same critical section.
#[derive(Default)]
pub struct Registry(RwLock<Shelves>);

impl Registry {
    /// Files a freshly accepted peer under `connections`.
    pub fn insert(&self, peer: Arc<PeerHandle>) {
        self.0.write().connections.push(peer);
    }

    /// Migrates a peer to `clients`, unless another live client already
    /// claims the slot.
    pub fn promote_client(&self, peer: &Arc<PeerHandle>, slot: ClientSlot) -> bool {
        let mut shelves = self.0.write();
        if shelves
            .clients
            .iter()
            .any(|other| other.id != peer.id && other.client_slot() == Some(slot))
        {
            return false;
        }

        peer.info.write().class = PeerClass::Client {
            slot,
            bankd: BankCoordinates::default(),
        };

        shelves.connections.retain(|other| other.id != peer.id);
        shelves.clients.push(peer.clone());
        true
    }

    /// Migrates a peer to `banks`, unless the bank id is already taken.
    pub fn promote_bank(&self, peer: &Arc<PeerHandle>, bank_id: u16, num_slots: u16) -> bool {
        let mut shelves = self.0.write();
        if shelves
            .banks
            .iter()
            .any(|other| other.id != peer.id && other.bank_id() == Some(bank_id))
        {
            return false;
        }

        peer.info.write().class = PeerClass::Bank { bank_id, num_slots };

        shelves.connections.retain(|other| other.id != peer.id);
        shelves.banks.push(peer.clone());
        true
    }

    /// Unlinks a peer from whichever list it is on.
    pub fn remove(&self, id: u64) {
        let mut shelves = self.0.write();
        shelves.connections.retain(|peer| peer.id != id);
        shelves.clients.retain(|peer| peer.id != id);
        shelves.banks.retain(|peer| peer.id != id);
    }

    pub fn client_by_slot(&self, slot: ClientSlot) -> Option<Arc<PeerHandle>> {
        self.0
            .read()
            .clients
            .iter()
            .find(|peer| peer.client_slot() == Some(slot))
            .cloned()
    }

    pub fn bank_by_id(&self, bank_id: u16) -> Option<Arc<PeerHandle>> {
        self.0
            .read()
            .banks
            .iter()
            .find(|peer| peer.bank_id() == Some(bank_id))
            .cloned()
    }

    pub fn clients(&self) -> Vec<Arc<PeerHandle>> {
        self.0.read().clients.clone()
    }

    pub fn banks(&self) -> Vec<Arc<PeerHandle>> {
        self.0.read().banks.clone()
    }

    /// (pre-handshake, clients, banks) counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        let shelves = self.0.read();
        (
            shelves.connections.len(),
            shelves.clients.len(),
            shelves.banks.len(),
        )
    }
}
