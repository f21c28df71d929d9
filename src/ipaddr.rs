//! Network-instance IP address management.
//!
//! A workload's address maps directly to its app number:
//! `addr = dhcp_range.start + app_num`. The MAC->IP and IP->MAC maps
//! on the instance status are mutated together so they stay exact
//! inverses, and the persisted address map keeps the number
//! correlation across reboot and deactivate/activate cycles. Every
//! map mutation ends with a status republish.

use std::net::Ipv4Addr;

use ipnet::IpAdd;
use log::{debug, info, warn};

use crate::error::AllocError;
use crate::registry::AddrMap;
use crate::status::{NetworkInstanceStatus, NetworkInstanceType, StatusPublisher};
use crate::types::{MacAddr, WorkloadId};

/// Derives and records workload addresses for network instances.
#[derive(Debug)]
pub struct IpAddrManager<P: StatusPublisher> {
    addr_map: AddrMap,
    publisher: P,
}

impl<P: StatusPublisher> IpAddrManager<P> {
    pub fn new(addr_map: AddrMap, publisher: P) -> Self {
        IpAddrManager {
            addr_map,
            publisher,
        }
    }

    /// Resolve the address for `mac`, deriving and recording it from
    /// `app_num` on first sight. `None` for a workload with no
    /// underlay addressing, and on switch instances which manage no
    /// addresses.
    pub fn lookup_or_allocate_ipv4(
        &mut self,
        status: &mut NetworkInstanceStatus,
        workload_id: WorkloadId,
        app_num: Option<u8>,
        mac: MacAddr,
    ) -> Result<Option<Ipv4Addr>, AllocError> {
        let Some(app_num) = app_num else {
            debug!("{}: no underlay addressing for {}", status.name, mac);
            return Ok(None);
        };
        if let Some(addr) = status.ip_assignments.get(&mac) {
            debug!("{}: found address {} for {}", status.name, addr, mac);
            return Ok(Some(*addr));
        }

        let Some(start) = status.dhcp_range.start else {
            if status.kind == NetworkInstanceType::Switch {
                debug!("{}: switch instance, no managed address", status.name);
                return Ok(None);
            }
            return Err(AllocError::MissingDhcpStart(status.id));
        };

        let addr = start.saturating_add(u32::from(app_num));
        match status.subnet {
            Some(subnet) if subnet.contains(&addr) => {}
            Some(subnet) => {
                return Err(AllocError::AddressOutOfSubnet { addr, subnet });
            }
            // A managed instance with a DHCP start but no subnet is as
            // misconfigured as one with no start at all
            None => return Err(AllocError::MissingDhcpStart(status.id)),
        }

        self.ip_addr_set(status, workload_id, app_num, addr, mac)?;
        info!("{}: assigned {} to {}", status.name, addr, mac);
        Ok(Some(addr))
    }

    /// Record every side of an assignment together: both status map
    /// directions, the instance-local bitmap and the persisted address
    /// map, then republish.
    fn ip_addr_set(
        &mut self,
        status: &mut NetworkInstanceStatus,
        workload_id: WorkloadId,
        app_num: u8,
        addr: Ipv4Addr,
        mac: MacAddr,
    ) -> Result<(), AllocError> {
        status.ip_assignments.insert(mac, addr);
        status.mac_assignments.insert(addr, mac);
        self.publisher.publish(status);
        if status.app_num_map.is_set(app_num) {
            warn!(
                "{}: app number {} already marked on instance bitmap",
                status.name, app_num
            );
        } else {
            status.app_num_map.set(app_num);
        }
        self.addr_map.add(status.id, workload_id, app_num)?;
        Ok(())
    }

    /// Tear down an assignment: drop the persisted correlation, clear
    /// the instance-local bit and remove both map directions. Releasing
    /// a MAC that was never assigned is an error.
    pub fn release_ipv4(
        &mut self,
        status: &mut NetworkInstanceStatus,
        workload_id: WorkloadId,
        app_num: u8,
        mac: MacAddr,
    ) -> Result<(), AllocError> {
        status.app_num_map.clear(app_num);
        self.addr_map.remove(status.id, workload_id)?;
        let Some(addr) = status.ip_assignments.remove(&mac) else {
            return Err(AllocError::AddressNotAssigned {
                network_id: status.id,
                mac,
            });
        };
        status.mac_assignments.remove(&addr);
        self.publisher.publish(status);
        info!("{}: released {} from {}", status.name, addr, mac);
        Ok(())
    }

    pub fn addr_map(&self) -> &AddrMap {
        &self.addr_map
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }
}

/// True when the address `app_num` would produce on this instance is
/// already bound to a different MAC. Callers check this before
/// committing an allocation to catch stale conflicting assignments.
pub fn is_duplicate_ip(status: &NetworkInstanceStatus, app_num: u8, mac: MacAddr) -> bool {
    let Some(start) = status.dhcp_range.start else {
        return false;
    };
    let addr = start.saturating_add(u32::from(app_num));
    matches!(status.mac_assignments.get(&addr), Some(owner) if *owner != mac)
}
