//! Network-instance runtime status.
//!
//! The status object is owned by the surrounding daemon; the allocator
//! reads addressing policy (subnet, gateway, DHCP range) from it and
//! maintains the MAC/IP assignment maps. Every mutation of those maps
//! is followed by a publish through [`StatusPublisher`] so subscribers
//! observe a consistent snapshot.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::types::{MacAddr, NetworkInstanceId, WorkloadId};

/// Kind of network instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkInstanceType {
    /// NAT-ed local network with host-managed addressing.
    Local,
    /// Layer-2 passthrough; no addresses are managed on the host.
    Switch,
}

/// Contiguous sub-range of the subnet from which dynamic addresses are
/// drawn. `size` is the effective slot count after range sizing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: Option<Ipv4Addr>,
    pub end: Option<Ipv4Addr>,
    pub size: u16,
}

/// Runtime status of one network instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInstanceStatus {
    pub id: NetworkInstanceId,
    pub name: String,
    pub kind: NetworkInstanceType,
    pub subnet: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub dhcp_range: DhcpRange,
    /// MAC -> assigned IP. Exact inverse of `mac_assignments`.
    pub ip_assignments: HashMap<MacAddr, Ipv4Addr>,
    /// IP -> owning MAC. Exact inverse of `ip_assignments`.
    pub mac_assignments: HashMap<Ipv4Addr, MacAddr>,
    /// Instance-local view of app numbers with a recorded address.
    /// Rebuilt at runtime, never persisted.
    #[serde(skip)]
    pub app_num_map: Bitmap,
}

impl NetworkInstanceStatus {
    pub fn new(
        id: NetworkInstanceId,
        name: impl Into<String>,
        kind: NetworkInstanceType,
        subnet: Option<Ipv4Net>,
        gateway: Option<Ipv4Addr>,
        dhcp_range: DhcpRange,
    ) -> Self {
        NetworkInstanceStatus {
            id,
            name: name.into(),
            kind,
            subnet,
            gateway,
            dhcp_range,
            ip_assignments: HashMap::new(),
            mac_assignments: HashMap::new(),
            app_num_map: Bitmap::new(),
        }
    }
}

/// Snapshot of a workload's network attachments, fed to startup
/// reconciliation to re-assert which persisted numbers are in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadNetworkStatus {
    pub workload_id: WorkloadId,
    /// Network instances this workload has an underlay attachment on.
    pub underlay_networks: Vec<NetworkInstanceId>,
}

/// Downstream consumers observe assignment changes through this
/// boundary; the daemon wires it to its pubsub channel.
pub trait StatusPublisher {
    fn publish(&mut self, status: &NetworkInstanceStatus);
}

/// Publisher that emits a log line per snapshot. Stands in for the
/// daemon's pubsub channel in tests and tools.
#[derive(Debug, Default)]
pub struct LogPublisher;

impl StatusPublisher for LogPublisher {
    fn publish(&mut self, status: &NetworkInstanceStatus) {
        log::debug!(
            "publish network instance {} ({}): {} assignments",
            status.name,
            status.id,
            status.ip_assignments.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_with_string_keys() {
        let mut status = NetworkInstanceStatus::new(
            NetworkInstanceId::new_v4(),
            "blue",
            NetworkInstanceType::Local,
            Some("10.1.0.0/24".parse().unwrap()),
            Some("10.1.0.1".parse().unwrap()),
            DhcpRange {
                start: Some("10.1.0.2".parse().unwrap()),
                end: Some("10.1.0.254".parse().unwrap()),
                size: 253,
            },
        );
        let mac: MacAddr = "02:16:3e:00:01:01".parse().unwrap();
        let ip: Ipv4Addr = "10.1.0.5".parse().unwrap();
        status.ip_assignments.insert(mac, ip);
        status.mac_assignments.insert(ip, mac);

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"02:16:3e:00:01:01\""));
        assert!(json.contains("\"10.1.0.5\""));

        let back: NetworkInstanceStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ip_assignments.get(&mac), Some(&ip));
        assert_eq!(back.dhcp_range.size, 253);
    }
}
