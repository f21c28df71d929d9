//! App number lifecycle management.
//!
//! Allocates a small integer for each (network instance, workload)
//! pair. The number cannot exceed 255 since it doubles as the IPv4
//! host offset inside the instance's DHCP range. Allocations persist
//! across reboots through the number registry; when no free numbers
//! remain the oldest unused one is reclaimed. The workload flagged as
//! manager is handed number zero when available.
//!
//! The registry is checkpointed independently of live runtime status,
//! so after a crash it may hold numbers with stale in-use state.
//! [`NumberAllocator::init`] therefore runs two passes: rebuild the
//! bitmaps from persisted records with in-use cleared, then re-assert
//! in-use only from attachments that are live right now. Collapsing
//! the passes would mark records in use incorrectly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::bitmap::Bitmap;
use crate::error::AllocError;
use crate::registry::{NumberRecord, NumberRegistry};
use crate::status::WorkloadNetworkStatus;
use crate::types::{NetworkInstanceId, NumberType, WorkloadId};

/// Per-node app number allocator. Owns one bitmap per network
/// instance, created lazily and dropped on instance teardown, always
/// kept in agreement with the registry.
#[derive(Debug)]
pub struct NumberAllocator<R: NumberRegistry> {
    registry: R,
    bitmaps: HashMap<NetworkInstanceId, Bitmap>,
    start_time: DateTime<Utc>,
    number_type: NumberType,
}

impl<R: NumberRegistry> NumberAllocator<R> {
    /// `start_time` is the owning process's start; garbage collection
    /// only touches records created before it.
    pub fn new(registry: R, start_time: DateTime<Utc>) -> Self {
        NumberAllocator {
            registry,
            bitmaps: HashMap::new(),
            start_time,
            number_type: NumberType::AppNumOnUnet,
        }
    }

    /// Startup reconciliation. Must run once before any allocation is
    /// served.
    ///
    /// Pass 1 rebuilds the bitmaps from persisted records and clears
    /// every in-use flag; whether a record backs a live configuration
    /// is unknown at this point. Pass 2 walks the currently active
    /// workload attachments and re-marks their records in use. A
    /// record whose bit is missing in pass 2 means the registry and
    /// bitmap no longer agree, which is corruption.
    pub fn init(&mut self, active: &[WorkloadNetworkStatus]) -> Result<(), AllocError> {
        for mut record in self.registry.enumerate(self.number_type) {
            let duplicate = {
                let bitmap = self.base_create(record.network_id);
                if bitmap.is_set(record.number) {
                    true
                } else {
                    bitmap.set(record.number);
                    false
                }
            };
            if duplicate {
                error!(
                    "duplicate number record {}/{} num {}, skipping",
                    record.network_id, record.workload_id, record.number
                );
                continue;
            }
            debug!(
                "reserving app number {} for {}/{}",
                record.number, record.network_id, record.workload_id
            );
            record.in_use = false;
            self.registry.upsert(record)?;
        }

        for workload in active {
            for network_id in &workload.underlay_networks {
                let Some(mut record) =
                    self.registry
                        .get(*network_id, workload.workload_id, self.number_type)
                else {
                    continue;
                };
                let bit_set = self
                    .bitmaps
                    .get(network_id)
                    .map(|bitmap| bitmap.is_set(record.number))
                    .unwrap_or(false);
                if !bit_set {
                    return Err(AllocError::Corruption(format!(
                        "record for {}/{} holds number {} but its bit is clear",
                        network_id, workload.workload_id, record.number
                    )));
                }
                debug!(
                    "marking app number {} in use for {}/{}",
                    record.number, network_id, workload.workload_id
                );
                record.in_use = true;
                record.last_used = Utc::now();
                self.registry.upsert(record)?;
            }
        }
        Ok(())
    }

    /// Allocate (or re-confirm) the app number for a pair. Idempotent:
    /// an existing record is refreshed and its number returned. Pass
    /// `reserve_zero` for the designated manager workload so it
    /// predictably receives number 0.
    pub fn allocate(
        &mut self,
        network_id: NetworkInstanceId,
        workload_id: WorkloadId,
        capacity: u16,
        reserve_zero: bool,
    ) -> Result<u8, AllocError> {
        if capacity == 0 || capacity > 256 {
            return Err(AllocError::InvalidCapacity(capacity));
        }
        self.base_create(network_id);

        if let Some(mut record) = self.registry.get(network_id, workload_id, self.number_type) {
            let number = record.number;
            if u16::from(number) >= capacity {
                // The instance shrank below the stored number, e.g. a
                // smaller subnet was reconfigured. Drop the stale
                // allocation; the caller retries as fresh.
                if let Some(bitmap) = self.bitmaps.get_mut(&network_id) {
                    bitmap.clear(number);
                }
                self.registry.delete(network_id, workload_id, self.number_type)?;
                warn!(
                    "app number {} for {}/{} is outside capacity {}",
                    number, network_id, workload_id, capacity
                );
                return Err(AllocError::NumberOutOfRange { number, capacity });
            }
            let bit_set = self
                .bitmaps
                .get(&network_id)
                .map(|bitmap| bitmap.is_set(number))
                .unwrap_or(false);
            if !bit_set {
                return Err(AllocError::Corruption(format!(
                    "record for {}/{} holds number {} but its bit is clear",
                    network_id, workload_id, number
                )));
            }
            debug!(
                "found allocated app number {} for {}/{}",
                number, network_id, workload_id
            );
            record.in_use = true;
            record.last_used = Utc::now();
            self.registry.upsert(record)?;
            return Ok(number);
        }

        let number = self.pick_number(network_id, capacity, reserve_zero)?;
        let bitmap = self
            .bitmaps
            .get_mut(&network_id)
            .ok_or_else(|| AllocError::Corruption(format!("no bitmap for {}", network_id)))?;
        if bitmap.is_set(number) {
            return Err(AllocError::Corruption(format!(
                "bit {} already set on {}",
                number, network_id
            )));
        }
        bitmap.set(number);
        let now = Utc::now();
        self.registry.upsert(NumberRecord {
            network_id,
            workload_id,
            number_type: self.number_type,
            number,
            in_use: true,
            created_at: now,
            last_used: now,
        })?;
        info!(
            "allocated app number {} for {}/{}",
            number, network_id, workload_id
        );
        Ok(number)
    }

    /// Lowest free slot, with the zero reservation and forced-reuse
    /// policies layered on top.
    fn pick_number(
        &mut self,
        network_id: NetworkInstanceId,
        capacity: u16,
        reserve_zero: bool,
    ) -> Result<u8, AllocError> {
        let free = {
            let bitmap = self
                .bitmaps
                .get(&network_id)
                .ok_or_else(|| AllocError::Corruption(format!("no bitmap for {}", network_id)))?;
            if reserve_zero && !bitmap.is_set(0) {
                Some(0)
            } else {
                (0..capacity)
                    .map(|n| n as u8)
                    .find(|&n| !bitmap.is_set(n))
            }
        };
        if let Some(number) = free {
            return Ok(number);
        }

        // Space exhausted: reclaim the oldest allocation nobody is
        // using. Nothing reclaimable means the allocator cannot make
        // progress at all.
        info!("no free app number on {}, reusing oldest unused", network_id);
        let Some((old_workload, old_number)) =
            self.registry
                .oldest_unused(network_id, capacity, self.number_type)
        else {
            return Err(AllocError::Corruption(format!(
                "network instance {}: no free app number and nothing reclaimable",
                network_id
            )));
        };
        info!(
            "reclaiming app number {} from workload {}",
            old_number, old_workload
        );
        self.registry.delete(network_id, old_workload, self.number_type)?;
        if let Some(bitmap) = self.bitmaps.get_mut(&network_id) {
            bitmap.clear(old_number);
        }
        Ok(old_number)
    }

    /// Release the pair's number and delete its record. Callers only
    /// free what they hold; a missing record or clear bit is
    /// corruption.
    pub fn free(
        &mut self,
        network_id: NetworkInstanceId,
        workload_id: WorkloadId,
    ) -> Result<(), AllocError> {
        let Some(record) = self.registry.get(network_id, workload_id, self.number_type) else {
            return Err(AllocError::Corruption(format!(
                "free: no number record for {}/{}",
                network_id, workload_id
            )));
        };
        let Some(bitmap) = self.bitmaps.get_mut(&network_id) else {
            // Instance bitmap already torn down; drop the record alone
            self.registry.delete(network_id, workload_id, self.number_type)?;
            return Ok(());
        };
        if !bitmap.is_set(record.number) {
            return Err(AllocError::Corruption(format!(
                "free: bit {} clear for {}/{}",
                record.number, network_id, workload_id
            )));
        }
        bitmap.clear(record.number);
        self.registry.delete(network_id, workload_id, self.number_type)?;
        debug!(
            "freed app number {} for {}/{}",
            record.number, network_id, workload_id
        );
        Ok(())
    }

    /// Current number for a pair, if one is allocated.
    pub fn get(
        &self,
        network_id: NetworkInstanceId,
        workload_id: WorkloadId,
    ) -> Result<u8, AllocError> {
        self.registry
            .get(network_id, workload_id, self.number_type)
            .map(|record| record.number)
            .ok_or(AllocError::RecordNotFound {
                network_id,
                workload_id,
            })
    }

    /// Garbage collection: free every record that is not in use and
    /// predates this process. Records created during the current run
    /// are left alone since their in-use mark may still be on the way
    /// from an in-progress activation. Idempotent.
    pub fn gc(&mut self) -> Result<usize, AllocError> {
        let mut freed = 0;
        for record in self.registry.enumerate(self.number_type) {
            if record.in_use {
                continue;
            }
            if record.created_at >= self.start_time {
                continue;
            }
            debug!(
                "gc: freeing app number {} for {}/{}",
                record.number, record.network_id, record.workload_id
            );
            self.free(record.network_id, record.workload_id)?;
            freed += 1;
        }
        if freed > 0 {
            info!("app number gc freed {} records", freed);
        }
        Ok(freed)
    }

    /// Fetch or lazily create the bitmap for a network instance.
    pub fn base_create(&mut self, network_id: NetworkInstanceId) -> &mut Bitmap {
        self.bitmaps.entry(network_id).or_insert_with(|| {
            debug!("creating app number bitmap for {}", network_id);
            Bitmap::new()
        })
    }

    pub fn base_get(&self, network_id: NetworkInstanceId) -> Option<&Bitmap> {
        self.bitmaps.get(&network_id)
    }

    /// Drop the bitmap for a torn-down network instance.
    pub fn base_delete(&mut self, network_id: NetworkInstanceId) {
        if self.bitmaps.remove(&network_id).is_some() {
            debug!("deleted app number bitmap for {}", network_id);
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JsonNumberRegistry;
    use chrono::Duration;

    fn allocator() -> NumberAllocator<JsonNumberRegistry> {
        NumberAllocator::new(JsonNumberRegistry::in_memory(), Utc::now())
    }

    #[test]
    fn test_allocation_is_idempotent() {
        let mut alloc = allocator();
        let network = NetworkInstanceId::new_v4();
        let workload = WorkloadId::new_v4();

        let first = alloc.allocate(network, workload, 253, false).unwrap();
        let second = alloc.allocate(network, workload, 253, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(alloc.base_get(network).unwrap().count(), 1);
    }

    #[test]
    fn test_numbers_are_unique_and_in_range() {
        let mut alloc = allocator();
        let network = NetworkInstanceId::new_v4();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..16 {
            let number = alloc
                .allocate(network, WorkloadId::new_v4(), 16, false)
                .unwrap();
            assert!(u16::from(number) < 16);
            assert!(seen.insert(number), "number {} allocated twice", number);
        }
    }

    #[test]
    fn test_zero_reserved_for_manager() {
        let mut alloc = allocator();
        let network = NetworkInstanceId::new_v4();

        let manager = alloc
            .allocate(network, WorkloadId::new_v4(), 253, true)
            .unwrap();
        assert_eq!(manager, 0);

        let ordinary = alloc
            .allocate(network, WorkloadId::new_v4(), 253, false)
            .unwrap();
        assert_eq!(ordinary, 1);

        // Zero taken: a second manager request falls back to scanning
        let second_manager = alloc
            .allocate(network, WorkloadId::new_v4(), 253, true)
            .unwrap();
        assert_eq!(second_manager, 2);
    }

    #[test]
    fn test_capacity_shrink_forces_reallocation() {
        let mut alloc = allocator();
        let network = NetworkInstanceId::new_v4();
        let workload = WorkloadId::new_v4();

        for _ in 0..5 {
            alloc
                .allocate(network, WorkloadId::new_v4(), 16, false)
                .unwrap();
        }
        let number = alloc.allocate(network, workload, 16, false).unwrap();
        assert_eq!(number, 5);

        // Instance reconfigured with a smaller range
        let err = alloc.allocate(network, workload, 4, false).unwrap_err();
        assert!(matches!(
            err,
            AllocError::NumberOutOfRange {
                number: 5,
                capacity: 4
            }
        ));
        assert!(!err.is_fatal());
        // Record dropped and bit cleared so a retry starts fresh
        assert!(alloc.get(network, workload).is_err());
        assert!(!alloc.base_get(network).unwrap().is_set(5));
    }

    #[test]
    fn test_forced_reuse_takes_oldest_unused() {
        let mut alloc = allocator();
        let network = NetworkInstanceId::new_v4();
        let workloads: Vec<WorkloadId> = (0..4).map(|_| WorkloadId::new_v4()).collect();

        for workload in &workloads {
            alloc.allocate(network, *workload, 4, false).unwrap();
        }

        // All slots busy and in use: nothing reclaimable is fatal
        let err = alloc
            .allocate(network, WorkloadId::new_v4(), 4, false)
            .unwrap_err();
        assert!(err.is_fatal());

        // Mark slot 2's owner unused; exactly that number is reclaimed
        let mut record = alloc
            .registry
            .get(network, workloads[2], NumberType::AppNumOnUnet)
            .unwrap();
        record.in_use = false;
        alloc.registry.upsert(record).unwrap();

        let number = alloc
            .allocate(network, WorkloadId::new_v4(), 4, false)
            .unwrap();
        assert_eq!(number, 2);
        // The evicted pair lost its record
        assert!(alloc.get(network, workloads[2]).is_err());
    }

    #[test]
    fn test_free_requires_existing_allocation() {
        let mut alloc = allocator();
        let network = NetworkInstanceId::new_v4();

        let err = alloc.free(network, WorkloadId::new_v4()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_free_after_base_delete_drops_record() {
        let mut alloc = allocator();
        let network = NetworkInstanceId::new_v4();
        let workload = WorkloadId::new_v4();

        alloc.allocate(network, workload, 16, false).unwrap();
        alloc.base_delete(network);
        alloc.free(network, workload).unwrap();
        assert!(alloc.get(network, workload).is_err());
    }

    #[test]
    fn test_invalid_capacity() {
        let mut alloc = allocator();
        let network = NetworkInstanceId::new_v4();
        assert!(matches!(
            alloc.allocate(network, WorkloadId::new_v4(), 0, false),
            Err(AllocError::InvalidCapacity(0))
        ));
        assert!(matches!(
            alloc.allocate(network, WorkloadId::new_v4(), 300, false),
            Err(AllocError::InvalidCapacity(300))
        ));
    }

    #[test]
    fn test_gc_spares_records_from_current_run() {
        let now = Utc::now();
        let mut alloc = NumberAllocator::new(JsonNumberRegistry::in_memory(), now);
        let network = NetworkInstanceId::new_v4();
        let fresh = WorkloadId::new_v4();
        let stale = WorkloadId::new_v4();

        // Fresh allocation in this run, then deactivated
        alloc.allocate(network, fresh, 16, false).unwrap();
        let mut record = alloc
            .registry
            .get(network, fresh, NumberType::AppNumOnUnet)
            .unwrap();
        record.in_use = false;
        alloc.registry.upsert(record).unwrap();

        // Stale record from before this process started
        let number = alloc.allocate(network, stale, 16, false).unwrap();
        let mut record = alloc
            .registry
            .get(network, stale, NumberType::AppNumOnUnet)
            .unwrap();
        record.in_use = false;
        record.created_at = now - Duration::minutes(10);
        alloc.registry.upsert(record).unwrap();

        assert_eq!(alloc.gc().unwrap(), 1);
        assert!(alloc.get(network, fresh).is_ok());
        assert!(alloc.get(network, stale).is_err());
        assert!(!alloc.base_get(network).unwrap().is_set(number));

        // Idempotent: nothing left to collect
        assert_eq!(alloc.gc().unwrap(), 0);
    }

    #[test]
    fn test_init_rebuilds_bitmaps_and_in_use() {
        let network = NetworkInstanceId::new_v4();
        let live = WorkloadId::new_v4();
        let gone = WorkloadId::new_v4();

        let mut registry = JsonNumberRegistry::in_memory();
        let now = Utc::now();
        for (workload, number) in [(live, 3u8), (gone, 7u8)] {
            registry
                .upsert(NumberRecord {
                    network_id: network,
                    workload_id: workload,
                    number_type: NumberType::AppNumOnUnet,
                    number,
                    in_use: true,
                    created_at: now - Duration::hours(1),
                    last_used: now - Duration::hours(1),
                })
                .unwrap();
        }

        let mut alloc = NumberAllocator::new(registry, now);
        let active = [WorkloadNetworkStatus {
            workload_id: live,
            underlay_networks: vec![network],
        }];
        alloc.init(&active).unwrap();

        let bitmap = alloc.base_get(network).unwrap();
        assert!(bitmap.is_set(3));
        assert!(bitmap.is_set(7));

        // Only the live workload's record came back in use
        assert!(alloc
            .registry
            .get(network, live, NumberType::AppNumOnUnet)
            .unwrap()
            .in_use);
        assert!(!alloc
            .registry
            .get(network, gone, NumberType::AppNumOnUnet)
            .unwrap()
            .in_use);

        // Re-allocation after restart returns the persisted number
        assert_eq!(alloc.allocate(network, live, 253, false).unwrap(), 3);
    }

    #[test]
    fn test_init_skips_duplicate_records() {
        let network = NetworkInstanceId::new_v4();
        let first = WorkloadId::new_v4();
        let second = WorkloadId::new_v4();

        let mut registry = JsonNumberRegistry::in_memory();
        let now = Utc::now();
        for workload in [first, second] {
            registry
                .upsert(NumberRecord {
                    network_id: network,
                    workload_id: workload,
                    number_type: NumberType::AppNumOnUnet,
                    number: 5,
                    in_use: false,
                    created_at: now,
                    last_used: now,
                })
                .unwrap();
        }

        let mut alloc = NumberAllocator::new(registry, now);
        // Duplicate is logged and skipped, not fatal
        alloc.init(&[]).unwrap();
        assert_eq!(alloc.base_get(network).unwrap().count(), 1);
    }
}
