//! JSON snapshot of the membership table.
//!
//! The registry is an in-memory table; when the daemon is configured with a
//! `state_file` it is loaded from that file on start and written back after
//! every sweep and on shutdown.  Writes go to a temporary file that is then
//! renamed over the old snapshot.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::AddressRegistry;
use crate::types::{validate_name, Address};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    members: BTreeMap<String, SnapshotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    address: Address,
    #[serde(default)]
    consecutive_failures: u32,
}

impl AddressRegistry {
    /// Builds a registry from the snapshot at `path`.  A missing file gives
    /// an empty registry.
    pub async fn load(path: &Path, eviction_threshold: u32) -> anyhow::Result<Self> {
        let registry = Self::with_threshold(eviction_threshold);
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No registry snapshot at {}, starting empty", path.display());
                return Ok(registry);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| anyhow::anyhow!("Corrupt snapshot {}: {}", path.display(), e))?;
        for (name, entry) in snapshot.members {
            validate_name(&name)?;
            registry
                .restore(&name, entry.address, entry.consecutive_failures)
                .await;
        }
        info!(
            "Loaded {} users from {}",
            registry.len().await,
            path.display()
        );
        Ok(registry)
    }

    /// Writes the current table to `path`.
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let snapshot = Snapshot {
            members: self
                .memberships()
                .await
                .into_iter()
                .map(|m| {
                    (
                        m.name,
                        SnapshotEntry {
                            address: m.address,
                            consecutive_failures: m.consecutive_failures,
                        },
                    )
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(
            "Saved {} users to {}",
            snapshot.members.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn snapshot_round_trip_keeps_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let registry = AddressRegistry::new();
        let alice = Address::new(Protocol::Websocket, Ipv4Addr::new(10, 0, 0, 5), 9000);
        let bob = Address::new(Protocol::Udp, Ipv4Addr::new(10, 0, 0, 6), 3000);
        registry.register("alice", alice).await.unwrap();
        registry.register("bob", bob).await.unwrap();
        let bob_generation = registry.memberships().await[1].generation;
        registry.record_probe("bob", bob_generation, false).await;

        registry.save(&path).await.unwrap();
        let restored = AddressRegistry::load(&path, 3).await.unwrap();

        assert_eq!(restored.list().await, registry.list().await);
        let members = restored.memberships().await;
        assert_eq!(members[0].consecutive_failures, 0);
        assert_eq!(members[1].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AddressRegistry::load(&dir.path().join("absent.json"), 3)
            .await
            .unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(AddressRegistry::load(&path, 3).await.is_err());
    }
}
