//! Persisted address map.
//!
//! Correlates (network instance, workload) with the app number its
//! address was derived from, so a once-assigned address never changes
//! across reboot or deactivate/activate cycles. The map is restart
//! bookkeeping only; allocation decisions always go through the number
//! registry.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::RegistryError;
use crate::types::{NetworkInstanceId, WorkloadId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AddrMapEntry {
    network_id: NetworkInstanceId,
    workload_id: WorkloadId,
    number: u8,
}

/// (network instance, workload) -> app number correlation with an
/// optional JSON checkpoint file.
#[derive(Debug, Default)]
pub struct AddrMap {
    entries: HashMap<(NetworkInstanceId, WorkloadId), u8>,
    path: Option<PathBuf>,
}

impl AddrMap {
    /// Purely in-memory map; nothing survives the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a checkpoint-backed map, loading entries persisted by a
    /// previous run. A missing file starts an empty map.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let mut entries = HashMap::new();
        match fs::read_to_string(&path) {
            Ok(content) => {
                let list: Vec<AddrMapEntry> =
                    serde_json::from_str(&content).map_err(|source| RegistryError::Decode {
                        path: path.clone(),
                        source,
                    })?;
                for entry in list {
                    entries.insert((entry.network_id, entry.workload_id), entry.number);
                }
                info!(
                    "loaded {} address map entries from {}",
                    entries.len(),
                    path.display()
                );
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no address map at {}, starting empty", path.display());
            }
            Err(source) => return Err(RegistryError::Read { path, source }),
        }
        Ok(AddrMap {
            entries,
            path: Some(path),
        })
    }

    pub fn get(&self, network_id: NetworkInstanceId, workload_id: WorkloadId) -> Option<u8> {
        self.entries.get(&(network_id, workload_id)).copied()
    }

    pub fn add(
        &mut self,
        network_id: NetworkInstanceId,
        workload_id: WorkloadId,
        number: u8,
    ) -> Result<(), RegistryError> {
        self.entries.insert((network_id, workload_id), number);
        self.checkpoint()
    }

    pub fn remove(
        &mut self,
        network_id: NetworkInstanceId,
        workload_id: WorkloadId,
    ) -> Result<(), RegistryError> {
        if self.entries.remove(&(network_id, workload_id)).is_some() {
            self.checkpoint()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn checkpoint(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut list: Vec<AddrMapEntry> = self
            .entries
            .iter()
            .map(|(&(network_id, workload_id), &number)| AddrMapEntry {
                network_id,
                workload_id,
                number,
            })
            .collect();
        list.sort_by_key(|e| (e.network_id, e.workload_id));
        let encoded = serde_json::to_string_pretty(&list).map_err(RegistryError::Encode)?;
        fs::write(path, encoded).map_err(|source| RegistryError::Write {
            path: path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let mut map = AddrMap::in_memory();
        let network = NetworkInstanceId::new_v4();
        let workload = WorkloadId::new_v4();

        assert!(map.get(network, workload).is_none());
        map.add(network, workload, 4).unwrap();
        assert_eq!(map.get(network, workload), Some(4));
        map.remove(network, workload).unwrap();
        assert!(map.get(network, workload).is_none());
        // Removing again is a no-op
        map.remove(network, workload).unwrap();
    }

    #[test]
    fn test_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addrmap.json");
        let network = NetworkInstanceId::new_v4();
        let workload = WorkloadId::new_v4();

        {
            let mut map = AddrMap::open(&path).unwrap();
            map.add(network, workload, 11).unwrap();
        }

        let reloaded = AddrMap::open(&path).unwrap();
        assert_eq!(reloaded.get(network, workload), Some(11));
        assert_eq!(reloaded.len(), 1);
    }
}
