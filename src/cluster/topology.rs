//! `CLUSTER SLOTS` snapshots.
//!
//! A snapshot lists slot ranges with the master and replicas serving each;
//! the selection strategy turns it into the slot map and the master/slave
//! graph of known servers.

use crate::cluster::SLOT_COUNT;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// A node as reported by `CLUSTER SLOTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node ID, when the server reports one (Redis 4+).
    pub id: Option<String>,
    /// `host:port`.
    pub address: String,
}

/// A range of hash slots and the nodes serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    /// First slot (inclusive).
    pub start: u16,
    /// Last slot (inclusive).
    pub end: u16,
    /// Master serving the range.
    pub master: NodeInfo,
    /// Replicas of the master.
    pub replicas: Vec<NodeInfo>,
}

impl SlotRange {
    /// Returns true if the given slot is within this range.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Returns the number of slots in this range.
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Always false; parsed ranges cover at least one slot.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A parsed `CLUSTER SLOTS` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    /// Slot ranges in reply order.
    pub slot_ranges: Vec<SlotRange>,
}

impl ClusterTopology {
    /// Finds the master responsible for `slot`.
    pub fn master_for_slot(&self, slot: u16) -> Option<&NodeInfo> {
        self.slot_ranges
            .iter()
            .find(|range| range.contains(slot))
            .map(|range| &range.master)
    }

    /// Parses a `CLUSTER SLOTS` reply.
    ///
    /// Entries that are not arrays, or whose bounds are not integers, are
    /// skipped; an out-of-range or inverted slot range is an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the reply is not an array or a node
    /// entry is malformed.
    pub fn from_cluster_slots(frame: Frame) -> Result<Self> {
        let Frame::Array(entries) = frame else {
            return Err(Error::protocol("CLUSTER SLOTS response must be an array"));
        };

        let mut topology = Self::default();
        for entry in entries {
            let Frame::Array(parts) = entry else {
                continue;
            };
            if parts.len() < 3 {
                continue;
            }
            let (Some(start), Some(end)) = (parts[0].to_int(), parts[1].to_int()) else {
                continue;
            };
            let (start, end) = slot_bounds(start, end)?;

            let master = parse_node(&parts[2])?;
            let replicas = parts[3..]
                .iter()
                .filter_map(|node| parse_node(node).ok())
                .collect();
            topology.slot_ranges.push(SlotRange {
                start,
                end,
                master,
                replicas,
            });
        }
        Ok(topology)
    }
}

fn slot_bounds(start: i64, end: i64) -> Result<(u16, u16)> {
    let limit = i64::from(SLOT_COUNT);
    if !(0..limit).contains(&start) || !(0..limit).contains(&end) || end < start {
        return Err(Error::protocol(format!("invalid slot range {}-{}", start, end)));
    }
    Ok((start as u16, end as u16))
}

fn parse_node(frame: &Frame) -> Result<NodeInfo> {
    let Frame::Array(fields) = frame else {
        return Err(Error::protocol("node info must be an array"));
    };
    if fields.len() < 2 {
        return Err(Error::protocol("node info must have host and port"));
    }
    let host = match fields[0].as_bytes() {
        Some(host) if !host.is_empty() => String::from_utf8_lossy(host).into_owned(),
        _ => return Err(Error::protocol("node host must be a non-empty string")),
    };
    let port = fields[1]
        .to_int()
        .ok_or_else(|| Error::protocol("node port must be an integer"))?;
    let id = fields
        .get(2)
        .and_then(Frame::as_bytes)
        .map(|id| String::from_utf8_lossy(id).into_owned());

    Ok(NodeInfo {
        id,
        address: format!("{}:{}", host, port),
    })
}
