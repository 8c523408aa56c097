//! # Cluster routing
//!
//! Hash slots, `CLUSTER SLOTS` snapshots, redirect parsing and the
//! server selection strategy.
//!
//! Keys map to one of 16384 slots through CRC16; a `{hash tag}` restricts
//! hashing to the tagged part so related keys share a slot.
//!
//! ```
//! use muxplex::cluster::{hash_slot, key_slot};
//!
//! assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
//! assert_eq!(hash_slot(b"foo"), 12182);
//! ```

pub mod errors;
pub mod selection;
mod slot;
pub mod topology;

pub use selection::ServerSelectionStrategy;
pub use slot::{combine_slot, hash_slot, key_slot, slot_of_keys, SlotHint, SLOT_COUNT};
pub use topology::{ClusterTopology, NodeInfo, SlotRange};
