//! The identity ledger.
//!
//! Ports live in a fixed slot table with a free set kept alongside, so
//! reservation takes the lowest free port without scanning. Names come from
//! a monotonically increasing counter; released indices are recycled
//! lowest-first before the counter advances.
//!
//! The ledger itself is a plain value. Atomicity across concurrent callers
//! is the job of the store that persists it: every mutation happens inside
//! one of the store's transactions.

use std::collections::BTreeSet;

use berth_types::Identity;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};

/// State of a single port slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Free,
    Reserved,
    Assigned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Slot {
    state: SlotState,
    holder: Option<String>,
}

impl Slot {
    fn free() -> Self {
        Self {
            state: SlotState::Free,
            holder: None,
        }
    }
}

/// Counts by slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub capacity: usize,
    pub free: usize,
    pub reserved: usize,
    pub assigned: usize,
}

/// Bounded pool of (name, port) identities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPool {
    config: PoolConfig,
    slots: Vec<Slot>,
    free_ports: BTreeSet<u16>,
    recycled_names: BTreeSet<u32>,
    next_name: u32,
}

impl IdentityPool {
    /// Create an empty pool over the configured range.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let slots = vec![Slot::free(); config.capacity()];
        let free_ports = (config.min_port..=config.max_port).collect();
        Ok(Self {
            config,
            slots,
            free_ports,
            recycled_names: BTreeSet::new(),
            next_name: 1,
        })
    }

    /// Rebuild a pool from persisted reservations and assignments.
    ///
    /// Identities outside the configured port range are rejected, as are two
    /// claims on the same port or name.
    pub fn restore<R, A>(config: PoolConfig, reserved: R, assigned: A) -> Result<Self>
    where
        R: IntoIterator<Item = Identity>,
        A: IntoIterator<Item = Identity>,
    {
        let mut pool = Self::new(config)?;
        let mut names = BTreeSet::new();
        let mut used_indices = BTreeSet::new();

        let claims = reserved
            .into_iter()
            .map(|identity| (identity, SlotState::Reserved))
            .chain(
                assigned
                    .into_iter()
                    .map(|identity| (identity, SlotState::Assigned)),
            );

        for (identity, state) in claims {
            let offset = pool.offset(identity.port)?;
            if pool.slots[offset].state != SlotState::Free || !names.insert(identity.name.clone())
            {
                return Err(PoolError::Conflict(identity));
            }
            if let Some(index) = pool.config.parse_name(&identity.name) {
                used_indices.insert(index);
                pool.next_name = pool.next_name.max(index + 1);
            }
            pool.free_ports.remove(&identity.port);
            pool.slots[offset] = Slot {
                state,
                holder: Some(identity.name),
            };
        }

        pool.recycled_names = (1..pool.next_name)
            .filter(|index| !used_indices.contains(index))
            .collect();

        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take the lowest free port and the next name. Free → Reserved.
    pub fn reserve(&mut self) -> Result<Identity> {
        let exhausted = PoolError::Exhausted {
            capacity: self.config.capacity(),
        };
        let port = *self.free_ports.iter().next().ok_or(exhausted.clone())?;

        let index = match self.recycled_names.iter().next().copied() {
            Some(index) => {
                self.recycled_names.remove(&index);
                index
            }
            None if self.next_name <= self.config.max_name_index() => {
                let index = self.next_name;
                self.next_name += 1;
                index
            }
            None => return Err(exhausted),
        };

        let name = self.config.render_name(index);
        let offset = self.offset(port)?;
        self.free_ports.remove(&port);
        self.slots[offset] = Slot {
            state: SlotState::Reserved,
            holder: Some(name.clone()),
        };

        debug!(name = %name, port, "identity reserved");
        Ok(Identity::new(name, port))
    }

    /// Reserved → Assigned. Assigning an already-assigned identity is a no-op.
    pub fn mark_assigned(&mut self, identity: &Identity) -> Result<()> {
        let offset = self.offset(identity.port)?;
        let slot = &mut self.slots[offset];
        match slot.state {
            SlotState::Free => Err(PoolError::NotReserved(identity.clone())),
            _ if slot.holder.as_deref() != Some(identity.name.as_str()) => {
                Err(PoolError::IdentityMismatch {
                    port: identity.port,
                    held: slot.holder.clone().unwrap_or_default(),
                    given: identity.name.clone(),
                })
            }
            SlotState::Reserved => {
                slot.state = SlotState::Assigned;
                debug!(identity = %identity, "identity assigned");
                Ok(())
            }
            SlotState::Assigned => Ok(()),
        }
    }

    /// Return an identity to Free.
    ///
    /// Releasing an already-free port is a no-op and returns `false`.
    pub fn release(&mut self, identity: &Identity) -> Result<bool> {
        let offset = self.offset(identity.port)?;
        let slot = &mut self.slots[offset];
        if slot.state == SlotState::Free {
            return Ok(false);
        }
        if slot.holder.as_deref() != Some(identity.name.as_str()) {
            return Err(PoolError::IdentityMismatch {
                port: identity.port,
                held: slot.holder.clone().unwrap_or_default(),
                given: identity.name.clone(),
            });
        }

        *slot = Slot::free();
        self.free_ports.insert(identity.port);
        if let Some(index) = self.config.parse_name(&identity.name) {
            if index < self.next_name {
                self.recycled_names.insert(index);
            }
        }

        debug!(identity = %identity, "identity released");
        Ok(true)
    }

    pub fn state_of(&self, port: u16) -> Option<SlotState> {
        self.offset(port).ok().map(|offset| self.slots[offset].state)
    }

    /// Name currently holding the port, if any.
    pub fn holder_of(&self, port: u16) -> Option<&str> {
        self.offset(port)
            .ok()
            .and_then(|offset| self.slots[offset].holder.as_deref())
    }

    pub fn usage(&self) -> PoolUsage {
        let mut usage = PoolUsage {
            capacity: self.slots.len(),
            free: 0,
            reserved: 0,
            assigned: 0,
        };
        for slot in &self.slots {
            match slot.state {
                SlotState::Free => usage.free += 1,
                SlotState::Reserved => usage.reserved += 1,
                SlotState::Assigned => usage.assigned += 1,
            }
        }
        usage
    }

    fn offset(&self, port: u16) -> Result<usize> {
        if !self.config.contains_port(port) {
            return Err(PoolError::PortOutOfRange(port));
        }
        Ok(usize::from(port - self.config.min_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn small_pool(ports: u16) -> IdentityPool {
        IdentityPool::new(PoolConfig {
            min_port: 25566,
            max_port: 25566 + ports - 1,
            ..PoolConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_reserve_hands_out_lowest_port_and_first_name() {
        let mut pool = small_pool(4);
        let identity = pool.reserve().unwrap();
        assert_eq!(identity, Identity::new("srv_000001", 25566));
        assert_eq!(pool.state_of(25566), Some(SlotState::Reserved));

        let next = pool.reserve().unwrap();
        assert_eq!(next, Identity::new("srv_000002", 25567));
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = small_pool(2);
        pool.reserve().unwrap();
        pool.reserve().unwrap();
        assert_eq!(pool.reserve(), Err(PoolError::Exhausted { capacity: 2 }));
    }

    #[test]
    fn test_name_space_exhaustion() {
        let mut pool = IdentityPool::new(PoolConfig {
            name_width: 1,
            min_port: 1000,
            max_port: 1100,
            ..PoolConfig::default()
        })
        .unwrap();
        for _ in 0..9 {
            pool.reserve().unwrap();
        }
        assert!(matches!(pool.reserve(), Err(PoolError::Exhausted { .. })));
    }

    #[test]
    fn test_release_recycles_port_and_name() {
        let mut pool = small_pool(4);
        let first = pool.reserve().unwrap();
        let _second = pool.reserve().unwrap();

        assert!(pool.release(&first).unwrap());
        assert_eq!(pool.state_of(first.port), Some(SlotState::Free));

        let again = pool.reserve().unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = small_pool(2);
        let identity = pool.reserve().unwrap();
        assert!(pool.release(&identity).unwrap());
        assert!(!pool.release(&identity).unwrap());
        assert_eq!(pool.usage().free, 2);
    }

    #[test]
    fn test_release_rejects_wrong_holder() {
        let mut pool = small_pool(2);
        let identity = pool.reserve().unwrap();
        let err = pool
            .release(&Identity::new("srv_000099", identity.port))
            .unwrap_err();
        assert!(matches!(err, PoolError::IdentityMismatch { .. }));
        assert_eq!(pool.state_of(identity.port), Some(SlotState::Reserved));
    }

    #[test]
    fn test_mark_assigned_transitions() {
        let mut pool = small_pool(2);
        let identity = pool.reserve().unwrap();
        pool.mark_assigned(&identity).unwrap();
        assert_eq!(pool.state_of(identity.port), Some(SlotState::Assigned));
        pool.mark_assigned(&identity).unwrap();

        let unreserved = Identity::new("srv_000005", 25567);
        assert_eq!(
            pool.mark_assigned(&unreserved),
            Err(PoolError::NotReserved(unreserved.clone()))
        );
        assert_eq!(
            pool.mark_assigned(&Identity::new("srv_000001", 1)),
            Err(PoolError::PortOutOfRange(1))
        );
    }

    #[test]
    fn test_restore_rebuilds_counters() {
        let config = PoolConfig {
            min_port: 25566,
            max_port: 25570,
            ..PoolConfig::default()
        };
        let mut pool = IdentityPool::restore(
            config,
            vec![Identity::new("srv_000003", 25568)],
            vec![Identity::new("srv_000001", 25566)],
        )
        .unwrap();

        assert_eq!(pool.state_of(25566), Some(SlotState::Assigned));
        assert_eq!(pool.state_of(25568), Some(SlotState::Reserved));
        // Index 2 was never held, so it comes back before the counter moves on.
        assert_eq!(pool.reserve().unwrap(), Identity::new("srv_000002", 25567));
        assert_eq!(pool.reserve().unwrap(), Identity::new("srv_000004", 25569));
    }

    #[test]
    fn test_restore_rejects_conflicts() {
        let config = PoolConfig::default();
        let result = IdentityPool::restore(
            config.clone(),
            vec![Identity::new("srv_000001", 25565)],
            vec![Identity::new("srv_000002", 25565)],
        );
        assert!(matches!(result, Err(PoolError::Conflict(_))));

        let result = IdentityPool::restore(
            config,
            vec![Identity::new("srv_000001", 25565)],
            vec![Identity::new("srv_000001", 25566)],
        );
        assert!(matches!(result, Err(PoolError::Conflict(_))));
    }

    #[test]
    fn test_ledger_serializes() {
        let mut pool = small_pool(3);
        pool.reserve().unwrap();
        let json = serde_json::to_string(&pool).unwrap();
        let back: IdentityPool = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pool);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve,
        Release(usize),
        Assign(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Reserve),
            2 => (0usize..16).prop_map(Op::Release),
            1 => (0usize..16).prop_map(Op::Assign),
        ]
    }

    proptest! {
        /// Whatever the interleaving of operations, held identities stay
        /// pairwise distinct and the usage counters add up.
        #[test]
        fn held_identities_never_collide(ops in prop::collection::vec(arb_op(), 1..200)) {
            let mut pool = small_pool(8);
            let mut held: Vec<Identity> = Vec::new();

            for op in ops {
                match op {
                    Op::Reserve => match pool.reserve() {
                        Ok(identity) => held.push(identity),
                        Err(PoolError::Exhausted { .. }) => prop_assert_eq!(held.len(), 8),
                        Err(other) => prop_assert!(false, "unexpected error: {}", other),
                    },
                    Op::Release(i) if !held.is_empty() => {
                        let identity = held.remove(i % held.len());
                        prop_assert!(pool.release(&identity).unwrap());
                    }
                    Op::Assign(i) if !held.is_empty() => {
                        let identity = &held[i % held.len()];
                        pool.mark_assigned(identity).unwrap();
                    }
                    _ => {}
                }

                let names: HashSet<_> = held.iter().map(|i| i.name.clone()).collect();
                let ports: HashSet<_> = held.iter().map(|i| i.port).collect();
                prop_assert_eq!(names.len(), held.len());
                prop_assert_eq!(ports.len(), held.len());

                let usage = pool.usage();
                prop_assert_eq!(usage.reserved + usage.assigned, held.len());
                prop_assert_eq!(usage.free + held.len(), usage.capacity);
            }
        }
    }
}
