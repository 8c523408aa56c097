//! Choosing a server for a message.
//!
//! The slot map holds one registry index per hash slot. Reads are plain
//! atomic loads; writers take a narrow mutex so a full topology refresh is
//! not interleaved with a `MOVED` update.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, info};

use crate::cluster::slot::{SlotHint, SLOT_COUNT};
use crate::cluster::topology::ClusterTopology;
use crate::core::events::MultiplexerEvent;
use crate::core::message::{CommandFlags, Message, RolePreference};
use crate::core::server::{ServerEndPoint, ServerRegistry, ServerType};
use crate::core::Shared;

const NO_OWNER: usize = usize::MAX;

/// Steps walked up a slave chain looking for its master.
const MAX_MASTER_HOPS: usize = 5;

/// Routes messages to servers and follows cluster redirects.
#[derive(Debug)]
pub struct ServerSelectionStrategy {
    server_type: ServerType,
    slots: OnceLock<Box<[AtomicUsize]>>,
    slot_writes: Mutex<()>,
    any_start: AtomicUsize,
    non_preferred: AtomicU64,
}

impl ServerSelectionStrategy {
    /// Creates a strategy for the given deployment shape.
    pub fn new(server_type: ServerType) -> Self {
        Self {
            server_type,
            slots: OnceLock::new(),
            slot_writes: Mutex::new(()),
            any_start: AtomicUsize::new(0),
            non_preferred: AtomicU64::new(0),
        }
    }

    /// The deployment shape.
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// Times a command was served by a server of the non-preferred role.
    pub fn non_preferred_count(&self) -> u64 {
        self.non_preferred.load(Ordering::Relaxed)
    }

    fn slot_map(&self) -> &[AtomicUsize] {
        self.slots.get_or_init(|| {
            (0..SLOT_COUNT)
                .map(|_| AtomicUsize::new(NO_OWNER))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        })
    }

    /// Registry index of the server owning `slot`, if known.
    pub(crate) fn owner_index(&self, slot: u16) -> Option<usize> {
        let map = self.slots.get()?;
        match map.get(usize::from(slot))?.load(Ordering::Acquire) {
            NO_OWNER => None,
            index => Some(index),
        }
    }

    /// Points `from..=to` at the server with registry index `owner`.
    pub(crate) fn update_cluster_range(&self, from: u16, to: u16, owner: usize) {
        let map = self.slot_map();
        let _guard = self.slot_writes.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in from..=to.min(SLOT_COUNT - 1) {
            map[usize::from(slot)].store(owner, Ordering::Release);
        }
    }

    fn repoint(&self, slot: u16, owner: usize) -> Option<usize> {
        let map = self.slot_map();
        let _guard = self.slot_writes.lock().unwrap_or_else(PoisonError::into_inner);
        match map[usize::from(slot)].swap(owner, Ordering::AcqRel) {
            NO_OWNER => None,
            previous => Some(previous),
        }
    }

    /// Applies a full `CLUSTER SLOTS` snapshot: creates unknown servers,
    /// records the master/slave graph and repoints every covered slot.
    pub(crate) fn apply_topology(&self, shared: &Arc<Shared>, topology: &ClusterTopology) {
        let weak = Arc::downgrade(shared);
        for range in &topology.slot_ranges {
            let (master, created) = shared.servers.get_or_create(&weak, &range.master.address);
            if created {
                master.activate();
            }
            master.set_role(false, None);

            let mut slaves = Vec::with_capacity(range.replicas.len());
            for replica in &range.replicas {
                let (slave, created) = shared.servers.get_or_create(&weak, &replica.address);
                if created {
                    slave.activate();
                }
                slave.set_role(true, Some(master.index()));
                slaves.push(slave.index());
            }
            master.set_slaves(slaves);
            self.update_cluster_range(range.start, range.end, master.index());
        }
        info!(ranges = topology.slot_ranges.len(), servers = shared.servers.len(), "applied cluster topology");
    }

    /// Picks a server for `msg`.
    pub(crate) fn select_message(
        &self,
        servers: &ServerRegistry,
        msg: &Message,
    ) -> Option<Arc<ServerEndPoint>> {
        self.select(servers, msg.slot(), msg.flags())
    }

    /// Picks a server for a command touching `slot`.
    ///
    /// Outside cluster mode, or when the slot has no known owner, any
    /// selectable server of a suitable role is used.
    pub(crate) fn select(
        &self,
        servers: &ServerRegistry,
        slot: SlotHint,
        flags: CommandFlags,
    ) -> Option<Arc<ServerEndPoint>> {
        if self.server_type != ServerType::Cluster {
            return self.any(servers, flags);
        }
        let owner = slot
            .slot()
            .and_then(|slot| self.owner_index(slot))
            .and_then(|index| servers.by_index(index));
        let Some(owner) = owner else {
            return self.any(servers, flags);
        };

        match flags.role() {
            RolePreference::DemandSlave => {
                return self
                    .find_slave(servers, &owner)
                    .or_else(|| self.any(servers, flags))
            }
            RolePreference::PreferSlave => {
                if let Some(slave) = self.find_slave(servers, &owner) {
                    return Some(slave);
                }
            }
            RolePreference::DemandMaster => {
                return self
                    .find_master(servers, &owner)
                    .or_else(|| self.any(servers, flags))
            }
            RolePreference::PreferMaster => {
                if let Some(master) = self.find_master(servers, &owner) {
                    return Some(master);
                }
            }
        }

        if owner.is_selectable() {
            self.non_preferred.fetch_add(1, Ordering::Relaxed);
            return Some(owner);
        }
        self.any(servers, flags)
    }

    /// Any selectable server, starting from a rotating offset.
    fn any(&self, servers: &ServerRegistry, flags: CommandFlags) -> Option<Arc<ServerEndPoint>> {
        let all = servers.snapshot();
        if all.is_empty() {
            return None;
        }
        let start = self.any_start.fetch_add(1, Ordering::Relaxed) % all.len();
        let rotated = || all[start..].iter().chain(all[..start].iter());
        let of_role = |slave: bool| {
            rotated()
                .find(|s| s.is_slave() == slave && s.is_selectable())
                .cloned()
        };

        match flags.role() {
            RolePreference::DemandMaster => of_role(false),
            RolePreference::DemandSlave => of_role(true),
            RolePreference::PreferMaster => of_role(false).or_else(|| {
                let fallback = of_role(true);
                if fallback.is_some() {
                    self.non_preferred.fetch_add(1, Ordering::Relaxed);
                }
                fallback
            }),
            RolePreference::PreferSlave => of_role(true).or_else(|| {
                let fallback = of_role(false);
                if fallback.is_some() {
                    self.non_preferred.fetch_add(1, Ordering::Relaxed);
                }
                fallback
            }),
        }
    }

    fn find_master(
        &self,
        servers: &ServerRegistry,
        server: &Arc<ServerEndPoint>,
    ) -> Option<Arc<ServerEndPoint>> {
        let mut current = server.clone();
        for _ in 0..MAX_MASTER_HOPS {
            if !current.is_slave() && current.is_selectable() {
                return Some(current);
            }
            current = servers.by_index(current.master_index()?)?;
        }
        None
    }

    fn find_slave(
        &self,
        servers: &ServerRegistry,
        server: &Arc<ServerEndPoint>,
    ) -> Option<Arc<ServerEndPoint>> {
        if server.is_slave() && server.is_selectable() {
            return Some(server.clone());
        }
        server
            .slave_indexes()
            .into_iter()
            .filter_map(|index| servers.by_index(index))
            .find(|slave| slave.is_slave() && slave.is_selectable())
    }

    /// Handles a `MOVED`/`ASK` reply for `msg`.
    ///
    /// A `MOVED` always repoints `slot` to `endpoint`. Unless the message
    /// forbids redirects it is then resent once through the new owner; an
    /// `ASK` resend is primed with `ASKING`.
    ///
    /// # Returns
    ///
    /// `true` if the message was handed to another bridge; the caller must
    /// not complete it in that case.
    pub(crate) fn try_resend(
        &self,
        shared: &Arc<Shared>,
        slot: u16,
        msg: &Arc<Message>,
        endpoint: &str,
        is_moved: bool,
    ) -> bool {
        if self.server_type != ServerType::Cluster || slot >= SLOT_COUNT {
            return false;
        }
        let (server, created) = shared.servers.get_or_create(&Arc::downgrade(shared), endpoint);
        if created {
            server.activate();
        }

        if is_moved {
            let previous = self.repoint(slot, server.index());
            if previous != Some(server.index()) {
                let old = previous
                    .and_then(|index| shared.servers.by_index(index))
                    .map(|s| s.endpoint().to_string());
                info!(slot, ?old, new = %endpoint, "hash slot moved");
                shared.events.raise(
                    &shared.completions,
                    MultiplexerEvent::HashSlotMoved {
                        slot,
                        old,
                        new: endpoint.to_string(),
                    },
                );
            }
        }

        if msg.is_no_redirect() {
            return false;
        }
        let target = match msg.flags().role() {
            RolePreference::DemandMaster => self.find_master(&shared.servers, &server),
            RolePreference::DemandSlave => self.find_slave(&shared.servers, &server),
            RolePreference::PreferMaster => self
                .find_master(&shared.servers, &server)
                .or_else(|| self.find_slave(&shared.servers, &server)),
            RolePreference::PreferSlave => self
                .find_slave(&shared.servers, &server)
                .or_else(|| self.find_master(&shared.servers, &server)),
        };
        let Some(target) = target else {
            debug!(slot, %endpoint, "redirect target not selectable");
            return false;
        };

        msg.add_flags(CommandFlags::NO_REDIRECT);
        msg.set_asking(!is_moved);
        debug!(slot, endpoint = %target.endpoint(), is_moved, command = %msg.command_name(), "resending");
        target.try_enqueue(msg.clone())
    }
}
