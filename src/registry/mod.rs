//! Persisted app number registry.
//!
//! Durable mapping from (network instance, workload, number type) to an
//! allocated number plus an in-use flag and timestamps. The lifecycle
//! manager reconciles its bitmaps against this store at startup, so
//! every mutation must be durable before it returns. The provided
//! implementation keeps records in memory and rewrites a JSON
//! checkpoint file after each change; it can also run without a file
//! for testing.

pub mod addrmap;

pub use addrmap::AddrMap;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::types::{NetworkInstanceId, NumberType, WorkloadId};

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read checkpoint {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write checkpoint {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("malformed checkpoint {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),
}

/// One persisted allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberRecord {
    pub network_id: NetworkInstanceId,
    pub workload_id: WorkloadId,
    pub number_type: NumberType,
    pub number: u8,
    /// Set while the owning workload's network configuration is active.
    /// Cleared on teardown; the record itself is retained for
    /// reactivation until freed or garbage collected.
    pub in_use: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Contract the lifecycle manager allocates against. All operations are
/// synchronous and durable on return.
pub trait NumberRegistry {
    /// All records of the given type, in no particular order.
    fn enumerate(&self, number_type: NumberType) -> Vec<NumberRecord>;

    fn get(
        &self,
        network_id: NetworkInstanceId,
        workload_id: WorkloadId,
        number_type: NumberType,
    ) -> Option<NumberRecord>;

    fn upsert(&mut self, record: NumberRecord) -> Result<(), RegistryError>;

    fn delete(
        &mut self,
        network_id: NetworkInstanceId,
        workload_id: WorkloadId,
        number_type: NumberType,
    ) -> Result<(), RegistryError>;

    /// Reclaim candidate under exhaustion: the record with the oldest
    /// creation time among those not in use whose number fits inside
    /// `capacity`.
    fn oldest_unused(
        &self,
        network_id: NetworkInstanceId,
        capacity: u16,
        number_type: NumberType,
    ) -> Option<(WorkloadId, u8)>;
}

type RecordKey = (NetworkInstanceId, WorkloadId, NumberType);

/// In-memory registry with an optional JSON checkpoint file.
#[derive(Debug, Default)]
pub struct JsonNumberRegistry {
    records: HashMap<RecordKey, NumberRecord>,
    path: Option<PathBuf>,
}

impl JsonNumberRegistry {
    /// Purely in-memory store; nothing survives the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a checkpoint-backed registry, loading any records persisted
    /// by a previous run. A missing file starts an empty registry.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let mut records = HashMap::new();
        match fs::read_to_string(&path) {
            Ok(content) => {
                let list: Vec<NumberRecord> =
                    serde_json::from_str(&content).map_err(|source| RegistryError::Decode {
                        path: path.clone(),
                        source,
                    })?;
                for record in list {
                    records.insert(
                        (record.network_id, record.workload_id, record.number_type),
                        record,
                    );
                }
                info!(
                    "loaded {} number records from {}",
                    records.len(),
                    path.display()
                );
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no checkpoint at {}, starting empty", path.display());
            }
            Err(source) => return Err(RegistryError::Read { path, source }),
        }
        Ok(JsonNumberRegistry {
            records,
            path: Some(path),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn checkpoint(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut list: Vec<&NumberRecord> = self.records.values().collect();
        // Stable ordering keeps the checkpoint diffable
        list.sort_by_key(|r| (r.network_id, r.workload_id));
        let encoded = serde_json::to_string_pretty(&list).map_err(RegistryError::Encode)?;
        fs::write(path, encoded).map_err(|source| RegistryError::Write {
            path: path.clone(),
            source,
        })
    }
}

impl NumberRegistry for JsonNumberRegistry {
    fn enumerate(&self, number_type: NumberType) -> Vec<NumberRecord> {
        self.records
            .values()
            .filter(|r| r.number_type == number_type)
            .cloned()
            .collect()
    }

    fn get(
        &self,
        network_id: NetworkInstanceId,
        workload_id: WorkloadId,
        number_type: NumberType,
    ) -> Option<NumberRecord> {
        self.records
            .get(&(network_id, workload_id, number_type))
            .cloned()
    }

    fn upsert(&mut self, record: NumberRecord) -> Result<(), RegistryError> {
        self.records.insert(
            (record.network_id, record.workload_id, record.number_type),
            record,
        );
        self.checkpoint()
    }

    fn delete(
        &mut self,
        network_id: NetworkInstanceId,
        workload_id: WorkloadId,
        number_type: NumberType,
    ) -> Result<(), RegistryError> {
        if self
            .records
            .remove(&(network_id, workload_id, number_type))
            .is_some()
        {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn oldest_unused(
        &self,
        network_id: NetworkInstanceId,
        capacity: u16,
        number_type: NumberType,
    ) -> Option<(WorkloadId, u8)> {
        self.records
            .values()
            .filter(|r| {
                r.network_id == network_id
                    && r.number_type == number_type
                    && !r.in_use
                    && u16::from(r.number) < capacity
            })
            .min_by_key(|r| r.created_at)
            .map(|r| (r.workload_id, r.number))
    }
}
