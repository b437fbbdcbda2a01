use std::collections::VecDeque;

use ahash::AHashMap;
use codec::message::{BankSlot, ClientSlot};
use parking_lot::RwLock;

/// Lifecycle state of a mapping.
///
/// `New` mappings wait for their bank peer; once the create request went
/// out they are `Unacknowledged` until the bank confirms. Removal runs
/// through `DeleteRequested` (admin asked) and `Deleting` (remove request
/// sent); the bank's confirmation destroys the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum MapState {
    New,
    Unacknowledged,
    Active,
    DeleteRequested,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMapping {
    pub bank: BankSlot,
    pub client: ClientSlot,
    pub state: MapState,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SlotmapError {
    /// Either side of the requested pair already appears in a live
    /// mapping.
    Busy,
}

impl std::error::Error for SlotmapError {}

impl std::fmt::Display for SlotmapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Result of an admin removal request.
#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Nothing was in flight, the mapping is gone.
    Deleted(SlotMapping),
    /// The owning bank will be asked to remove the mapping.
    DeleteRequested,
    /// A removal is already in progress.
    AlreadyDeleting,
    /// A create request is in flight; retry once the bank answered.
    Busy,
    NotFound,
}

/// Mappings to realise after a wakeup, in request order.
#[derive(Debug, Default)]
pub struct PendingWork {
    pub create: Vec<SlotMapping>,
    pub remove: Vec<SlotMapping>,
}

/// Mappings affected by a bank peer going away.
#[derive(Debug, Default)]
pub struct BankTeardown {
    /// Returned to `New`, waiting for the bank to come back.
    pub reverted: Vec<SlotMapping>,
    /// Were being deleted; the bank can no longer acknowledge, gone now.
    pub destroyed: Vec<SlotMapping>,
}

struct Entry {
    client: ClientSlot,
    state: MapState,
}

/// Per-connected-bank FIFO queues. A mapping sits on exactly one of
/// these while its bank peer is connected; response correlation is
/// positional, so the queue order is the request order.
#[derive(Default)]
struct BankQueues {
    new: VecDeque<BankSlot>,
    unack: VecDeque<BankSlot>,
    active: VecDeque<BankSlot>,
    delreq: VecDeque<BankSlot>,
    deleting: VecDeque<BankSlot>,
}

#[derive(Default)]
struct Inner {
    maps: AHashMap<BankSlot, Entry>,
    by_client: AHashMap<ClientSlot, BankSlot>,
    // present exactly while a bank peer with that id is connected.
    queues: AHashMap<u16, BankQueues>,
}

impl Inner {
    fn mapping(&self, bank: BankSlot) -> Option<SlotMapping> {
        self.maps.get(&bank).map(|entry| SlotMapping {
            bank,
            client: entry.client,
            state: entry.state,
        })
    }
}

/// The bidirectional {client slot <-> bank slot} relation.
///
/// Every mutation is one critical section under the write lock; the
/// server FSMs and the admin producers may call in concurrently without
/// further synchronisation.
#[derive(Default)]
pub struct SlotMaps(RwLock<Inner>);

impl SlotMaps {
    /// Adds a mapping in state `New`.
    ///
    /// If the owning bank is currently connected the mapping is queued
    /// for realisation, otherwise it floats until a bank with a matching
    /// id appears.
    pub fn add(&self, bank: BankSlot, client: ClientSlot) -> Result<(), SlotmapError> {
        let mut inner = self.0.write();
        if inner.maps.contains_key(&bank) || inner.by_client.contains_key(&client) {
            return Err(SlotmapError::Busy);
        }

        inner.maps.insert(
            bank,
            Entry {
                client,
                state: MapState::New,
            },
        );
        inner.by_client.insert(client, bank);

        if let Some(queues) = inner.queues.get_mut(&bank.bank_id) {
            queues.new.push_back(bank);
        }

        Ok(())
    }

    /// Admin removal of a mapping.
    pub fn remove(&self, bank: BankSlot) -> RemoveOutcome {
        let mut inner = self.0.write();
        let state = match inner.maps.get(&bank) {
            Some(entry) => entry.state,
            None => return RemoveOutcome::NotFound,
        };

        match state {
            MapState::Active if inner.queues.contains_key(&bank.bank_id) => {
                if let Some(entry) = inner.maps.get_mut(&bank) {
                    entry.state = MapState::DeleteRequested;
                }

                if let Some(queues) = inner.queues.get_mut(&bank.bank_id) {
                    queues.active.retain(|b| *b != bank);
                    queues.delreq.push_back(bank);
                }

                RemoveOutcome::DeleteRequested
            }
            MapState::New | MapState::Active => {
                if let Some(queues) = inner.queues.get_mut(&bank.bank_id) {
                    queues.new.retain(|b| *b != bank);
                }

                match inner.maps.remove(&bank) {
                    Some(entry) => {
                        inner.by_client.remove(&entry.client);
                        RemoveOutcome::Deleted(SlotMapping {
                            bank,
                            client: entry.client,
                            state,
                        })
                    }
                    None => RemoveOutcome::NotFound,
                }
            }
            MapState::Unacknowledged => RemoveOutcome::Busy,
            MapState::DeleteRequested | MapState::Deleting => RemoveOutcome::AlreadyDeleting,
        }
    }

    /// A bank peer came up: adopt every mapping with its id, back in
    /// state `New`, queued for realisation.
    pub fn bank_connected(&self, bank_id: u16) {
        let mut inner = self.0.write();
        let mut queues = BankQueues::default();

        for (bank, entry) in inner.maps.iter_mut() {
            if bank.bank_id == bank_id {
                entry.state = MapState::New;
                queues.new.push_back(*bank);
            }
        }

        inner.queues.insert(bank_id, queues);
    }

    /// A bank peer went away: mappings it was serving revert to `New`
    /// and leave the per-bank queues; mappings it was deleting are
    /// destroyed, the acknowledgement can never arrive.
    pub fn bank_disconnected(&self, bank_id: u16) -> BankTeardown {
        let mut inner = self.0.write();
        let mut teardown = BankTeardown::default();

        let Some(queues) = inner.queues.remove(&bank_id) else {
            return teardown;
        };

        for bank in queues
            .new
            .into_iter()
            .chain(queues.unack)
            .chain(queues.active)
        {
            if let Some(entry) = inner.maps.get_mut(&bank) {
                entry.state = MapState::New;
                teardown.reverted.push(SlotMapping {
                    bank,
                    client: entry.client,
                    state: MapState::New,
                });
            }
        }

        for bank in queues.delreq.into_iter().chain(queues.deleting) {
            if let Some(entry) = inner.maps.remove(&bank) {
                inner.by_client.remove(&entry.client);
                teardown.destroyed.push(SlotMapping {
                    bank,
                    client: entry.client,
                    state: MapState::Deleting,
                });
            }
        }

        teardown
    }

    /// Drains the pending queues of one bank: `New` mappings move to
    /// `Unacknowledged`, `DeleteRequested` mappings to `Deleting`. The
    /// returned lists are what has to go on the wire, in order.
    pub fn push_pending(&self, bank_id: u16) -> PendingWork {
        let mut inner = self.0.write();
        let mut work = PendingWork::default();

        let Some(mut queues) = inner.queues.remove(&bank_id) else {
            return work;
        };

        while let Some(bank) = queues.new.pop_front() {
            if let Some(entry) = inner.maps.get_mut(&bank) {
                entry.state = MapState::Unacknowledged;
                queues.unack.push_back(bank);
                work.create.push(SlotMapping {
                    bank,
                    client: entry.client,
                    state: entry.state,
                });
            }
        }

        while let Some(bank) = queues.delreq.pop_front() {
            if let Some(entry) = inner.maps.get_mut(&bank) {
                entry.state = MapState::Deleting;
                queues.deleting.push_back(bank);
                work.remove.push(SlotMapping {
                    bank,
                    client: entry.client,
                    state: entry.state,
                });
            }
        }

        inner.queues.insert(bank_id, queues);
        work
    }

    /// Bank acknowledged a create request. Correlation is positional:
    /// the head of the unacknowledged queue becomes `Active`.
    pub fn ack_create(&self, bank_id: u16) -> Option<SlotMapping> {
        let mut inner = self.0.write();
        let queues = inner.queues.get_mut(&bank_id)?;
        let bank = queues.unack.pop_front()?;
        queues.active.push_back(bank);

        let entry = inner.maps.get_mut(&bank)?;
        entry.state = MapState::Active;
        Some(SlotMapping {
            bank,
            client: entry.client,
            state: MapState::Active,
        })
    }

    /// Bank acknowledged a remove request. The head of the deleting
    /// queue is destroyed and handed back for the final client update.
    pub fn ack_remove(&self, bank_id: u16) -> Option<SlotMapping> {
        let mut inner = self.0.write();
        let queues = inner.queues.get_mut(&bank_id)?;
        let bank = queues.deleting.pop_front()?;

        let entry = inner.maps.remove(&bank)?;
        inner.by_client.remove(&entry.client);
        Some(SlotMapping {
            bank,
            client: entry.client,
            state: MapState::Deleting,
        })
    }

    /// True when the bank has queued work a `PUSH` would realise.
    pub fn has_pending(&self, bank_id: u16) -> bool {
        self.0
            .read()
            .queues
            .get(&bank_id)
            .map(|queues| !queues.new.is_empty() || !queues.delreq.is_empty())
            .unwrap_or(false)
    }

    pub fn by_bank(&self, bank: BankSlot) -> Option<SlotMapping> {
        self.0.read().mapping(bank)
    }

    pub fn by_client(&self, client: ClientSlot) -> Option<SlotMapping> {
        let inner = self.0.read();
        let bank = inner.by_client.get(&client)?;
        inner.mapping(*bank)
    }

    pub fn snapshot(&self) -> Vec<SlotMapping> {
        let inner = self.0.read();
        inner
            .maps
            .iter()
            .map(|(bank, entry)| SlotMapping {
                bank: *bank,
                client: entry.client,
                state: entry.state,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.read().maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().maps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANK: BankSlot = BankSlot {
        bank_id: 3,
        slot_nr: 5,
    };
    const CLIENT: ClientSlot = ClientSlot {
        client_id: 7,
        slot_nr: 0,
    };

    #[test]
    fn add_and_delete_leave_no_trace() {
        let maps = SlotMaps::default();
        assert!(maps.is_empty());

        maps.add(BANK, CLIENT).unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps.by_bank(BANK).unwrap().state, MapState::New);
        assert_eq!(maps.by_client(CLIENT).unwrap().bank, BANK);

        match maps.remove(BANK) {
            RemoveOutcome::Deleted(mapping) => assert_eq!(mapping.client, CLIENT),
            other => panic!("unexpected outcome {:?}", other),
        }

        assert!(maps.is_empty());
        assert!(maps.by_client(CLIENT).is_none());
    }

    #[test]
    fn both_sides_are_unique() {
        let maps = SlotMaps::default();
        maps.add(BANK, CLIENT).unwrap();

        // same bank slot, different client.
        assert_eq!(
            maps.add(
                BANK,
                ClientSlot {
                    client_id: 8,
                    slot_nr: 0
                }
            ),
            Err(SlotmapError::Busy)
        );

        // same client slot, different bank.
        assert_eq!(
            maps.add(
                BankSlot {
                    bank_id: 4,
                    slot_nr: 1
                },
                CLIENT
            ),
            Err(SlotmapError::Busy)
        );

        assert_eq!(maps.len(), 1);
    }

    #[test]
    fn floating_mapping_is_adopted_on_bank_connect() {
        let maps = SlotMaps::default();
        maps.add(BANK, CLIENT).unwrap();

        // no bank connected: nothing pending, nothing to push.
        assert!(!maps.has_pending(BANK.bank_id));
        assert!(maps.push_pending(BANK.bank_id).create.is_empty());

        maps.bank_connected(BANK.bank_id);
        assert!(maps.has_pending(BANK.bank_id));

        let work = maps.push_pending(BANK.bank_id);
        assert_eq!(work.create.len(), 1);
        assert_eq!(work.create[0].bank, BANK);
        assert_eq!(
            maps.by_bank(BANK).unwrap().state,
            MapState::Unacknowledged
        );

        // pushing again is a no-op.
        assert!(maps.push_pending(BANK.bank_id).create.is_empty());
    }

    #[test]
    fn ack_create_follows_request_order() {
        let maps = SlotMaps::default();
        maps.bank_connected(3);

        for slot_nr in 0..3u16 {
            maps.add(
                BankSlot {
                    bank_id: 3,
                    slot_nr,
                },
                ClientSlot {
                    client_id: slot_nr,
                    slot_nr: 0,
                },
            )
            .unwrap();
        }

        let work = maps.push_pending(3);
        let order = work.create.iter().map(|m| m.bank).collect::<Vec<_>>();

        for bank in order {
            let mapping = maps.ack_create(3).unwrap();
            assert_eq!(mapping.bank, bank);
            assert_eq!(mapping.state, MapState::Active);
        }

        assert!(maps.ack_create(3).is_none());
    }

    #[test]
    fn removal_roundtrip() {
        let maps = SlotMaps::default();
        maps.bank_connected(BANK.bank_id);
        maps.add(BANK, CLIENT).unwrap();
        maps.push_pending(BANK.bank_id);
        maps.ack_create(BANK.bank_id).unwrap();

        assert_eq!(maps.remove(BANK), RemoveOutcome::DeleteRequested);
        assert_eq!(
            maps.by_bank(BANK).unwrap().state,
            MapState::DeleteRequested
        );
        assert!(maps.has_pending(BANK.bank_id));

        let work = maps.push_pending(BANK.bank_id);
        assert_eq!(work.remove.len(), 1);
        assert_eq!(maps.by_bank(BANK).unwrap().state, MapState::Deleting);
        assert_eq!(maps.remove(BANK), RemoveOutcome::AlreadyDeleting);

        let destroyed = maps.ack_remove(BANK.bank_id).unwrap();
        assert_eq!(destroyed.client, CLIENT);
        assert!(maps.is_empty());
    }

    #[test]
    fn unacknowledged_mapping_cannot_be_removed() {
        let maps = SlotMaps::default();
        maps.bank_connected(BANK.bank_id);
        maps.add(BANK, CLIENT).unwrap();
        maps.push_pending(BANK.bank_id);

        assert_eq!(maps.remove(BANK), RemoveOutcome::Busy);
        assert_eq!(maps.remove(BankSlot { bank_id: 9, slot_nr: 9 }), RemoveOutcome::NotFound);
    }

    #[test]
    fn bank_disconnect_reverts_and_destroys() {
        let maps = SlotMaps::default();
        maps.bank_connected(3);

        let doomed = BankSlot {
            bank_id: 3,
            slot_nr: 6,
        };
        maps.add(BANK, CLIENT).unwrap();
        maps.add(
            doomed,
            ClientSlot {
                client_id: 8,
                slot_nr: 0,
            },
        )
        .unwrap();

        maps.push_pending(3);
        maps.ack_create(3).unwrap();
        maps.ack_create(3).unwrap();
        assert_eq!(maps.remove(doomed), RemoveOutcome::DeleteRequested);
        maps.push_pending(3);

        let teardown = maps.bank_disconnected(3);
        assert_eq!(teardown.reverted.len(), 1);
        assert_eq!(teardown.reverted[0].bank, BANK);
        assert_eq!(teardown.reverted[0].state, MapState::New);
        assert_eq!(teardown.destroyed.len(), 1);
        assert_eq!(teardown.destroyed[0].bank, doomed);

        // the surviving mapping floats in NEW, off any queue.
        assert_eq!(maps.len(), 1);
        assert!(!maps.has_pending(3));
        assert_eq!(maps.by_bank(BANK).unwrap().state, MapState::New);

        // a returning bank adopts it again.
        maps.bank_connected(3);
        let work = maps.push_pending(3);
        assert_eq!(work.create.len(), 1);
        assert_eq!(work.create[0].bank, BANK);
    }

    #[test]
    fn disconnect_while_unacknowledged_reverts_to_new() {
        let maps = SlotMaps::default();
        maps.bank_connected(BANK.bank_id);
        maps.add(BANK, CLIENT).unwrap();
        maps.push_pending(BANK.bank_id);
        assert_eq!(
            maps.by_bank(BANK).unwrap().state,
            MapState::Unacknowledged
        );

        let teardown = maps.bank_disconnected(BANK.bank_id);
        assert_eq!(teardown.reverted.len(), 1);
        assert_eq!(maps.by_bank(BANK).unwrap().state, MapState::New);

        // the late acknowledgement of a dead bank has no effect.
        assert!(maps.ack_create(BANK.bank_id).is_none());
    }
}
