//! ## Slot-map engine
//!
//! The server owns a set of 1:1 associations between client slots and
//! bank slots. This crate holds that set and nothing else: the wire
//! protocol that realises a mapping lives with the server FSMs, the
//! admin surface that creates mappings lives behind the REST API. Both
//! sides meet here, under one lock.

pub mod slotmap;

pub use slotmap::{
    BankTeardown, MapState, PendingWork, RemoveOutcome, SlotMapping, SlotMaps, SlotmapError,
};
