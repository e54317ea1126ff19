//! Peer membership table.
//!
//! The registry maps a peer name to the [`Address`] it listens on, plus the
//! number of liveness probes that have failed in a row.  It is the single
//! owner of that table: API handlers and the eviction sweep go through the
//! methods below, each of which holds the internal lock only for the map
//! operation itself.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};
use tokio::sync::RwLock;

use crate::error::{RegistryError, Result};
use crate::types::{validate_name, Address};

pub mod persistence;

/// Probe failures in a row after which a peer is dropped.
pub const DEFAULT_EVICTION_THRESHOLD: u32 = 3;

/// A registry entry as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub name: String,
    pub address: Address,
    pub consecutive_failures: u32,
    /// Changes every time the entry is (re)written by register or upsert.
    pub generation: u64,
}

/// Effect of applying one probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probe succeeded; the counter is back to zero.
    Healthy,
    /// Probe failed; the counter now holds this value.
    Failing(u32),
    /// Probe failed and the counter reached the threshold; the entry is gone.
    Evicted(u32),
    /// The entry was removed or rewritten after the probe was scheduled.
    Stale,
}

#[derive(Debug)]
struct Entry {
    address: Address,
    consecutive_failures: u32,
    generation: u64,
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

impl Table {
    fn insert(&mut self, name: &str, address: Address, consecutive_failures: u32) {
        self.next_generation += 1;
        self.entries.insert(
            name.to_string(),
            Entry {
                address,
                consecutive_failures,
                generation: self.next_generation,
            },
        );
    }
}

/// Concurrent name → address table with failure accounting.
#[derive(Debug)]
pub struct AddressRegistry {
    table: RwLock<Table>,
    eviction_threshold: u32,
}

impl Default for AddressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_EVICTION_THRESHOLD)
    }

    /// Creates a registry that evicts after `eviction_threshold` failures
    /// in a row.  A threshold of zero is treated as one.
    pub fn with_threshold(eviction_threshold: u32) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            eviction_threshold: eviction_threshold.max(1),
        }
    }

    pub fn eviction_threshold(&self) -> u32 {
        self.eviction_threshold
    }

    /// Adds a new peer.  Fails if the name is taken.
    pub async fn register(&self, name: &str, address: Address) -> Result<()> {
        validate_name(name)?;
        let mut table = self.table.write().await;
        if table.entries.contains_key(name) {
            return Err(RegistryError::NameConflict(name.to_string()));
        }
        table.insert(name, address, 0);
        info!("Registered {} -> {}", name, address);
        Ok(())
    }

    /// Creates or replaces a peer's address and clears its failure count.
    pub async fn upsert(&self, name: &str, address: Address) -> Result<()> {
        validate_name(name)?;
        let mut table = self.table.write().await;
        table.insert(name, address, 0);
        info!("Upserted {} -> {}", name, address);
        Ok(())
    }

    /// Removes a peer.  Returns whether it was present; absence is not an error.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.table.write().await.entries.remove(name).is_some();
        if removed {
            info!("Unregistered {}", name);
        } else {
            debug!("Unregister of unknown user {}", name);
        }
        removed
    }

    pub async fn lookup(&self, name: &str) -> Result<Address> {
        self.table
            .read()
            .await
            .entries
            .get(name)
            .map(|e| e.address)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Point-in-time copy of every name and address.
    pub async fn list(&self) -> BTreeMap<String, Address> {
        self.table
            .read()
            .await
            .entries
            .iter()
            .map(|(name, e)| (name.clone(), e.address))
            .collect()
    }

    /// Point-in-time copy of every entry including failure state.
    pub async fn memberships(&self) -> Vec<Membership> {
        let table = self.table.read().await;
        let mut members: Vec<Membership> = table
            .entries
            .iter()
            .map(|(name, e)| Membership {
                name: name.clone(),
                address: e.address,
                consecutive_failures: e.consecutive_failures,
                generation: e.generation,
            })
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Applies the result of one liveness probe.
    ///
    /// `generation` must come from the [`Membership`] the probe was run
    /// against; if the entry has since been removed or rewritten the result
    /// is dropped.
    pub async fn record_probe(&self, name: &str, generation: u64, alive: bool) -> ProbeOutcome {
        let mut table = self.table.write().await;
        let Some(entry) = table.entries.get_mut(name) else {
            return ProbeOutcome::Stale;
        };
        if entry.generation != generation {
            return ProbeOutcome::Stale;
        }

        if alive {
            entry.consecutive_failures = 0;
            return ProbeOutcome::Healthy;
        }

        entry.consecutive_failures += 1;
        let failures = entry.consecutive_failures;
        if failures >= self.eviction_threshold {
            table.entries.remove(name);
            info!("Evicted {} after {} failed probes", name, failures);
            ProbeOutcome::Evicted(failures)
        } else {
            debug!("Probe of {} failed ({} in a row)", name, failures);
            ProbeOutcome::Failing(failures)
        }
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.entries.is_empty()
    }

    pub async fn clear(&self) {
        self.table.write().await.entries.clear();
    }

    /// Inserts an entry with a known failure count, used when restoring a
    /// snapshot.
    async fn restore(&self, name: &str, address: Address, consecutive_failures: u32) {
        self.table
            .write()
            .await
            .insert(name, address, consecutive_failures);
    }
}
