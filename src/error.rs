//! Allocator error types.
//!
//! Errors fall into two visible tiers: recoverable allocation failures
//! the caller retries or surfaces upward, and fatal conditions
//! (`Corruption`, `MissingDhcpStart`) where the bitmap and registry
//! disagree or a managed instance lost its addressing policy. Fatal
//! errors must reach the owning supervisor; returning a wrong number
//! instead risks two workloads colliding on one IP address.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::registry::RegistryError;
use crate::types::{MacAddr, NetworkInstanceId, WorkloadId};

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// The instance shrank below an existing allocation; retry as fresh.
    #[error("app number {number} is outside capacity {capacity}")]
    NumberOutOfRange { number: u8, capacity: u16 },

    #[error("invalid capacity {0}, must be between 1 and 256")]
    InvalidCapacity(u16),

    #[error("address {addr} is outside subnet {subnet}")]
    AddressOutOfSubnet { addr: Ipv4Addr, subnet: Ipv4Net },

    #[error("no address assigned to {mac} on network instance {network_id}")]
    AddressNotAssigned {
        network_id: NetworkInstanceId,
        mac: MacAddr,
    },

    #[error("no number record for workload {workload_id} on network instance {network_id}")]
    RecordNotFound {
        network_id: NetworkInstanceId,
        workload_id: WorkloadId,
    },

    /// A managed instance without a DHCP range start is misconfigured.
    #[error("network instance {0} has no DHCP range start")]
    MissingDhcpStart(NetworkInstanceId),

    /// Bitmap and registry disagree. Allocation cannot proceed for the
    /// affected instance.
    #[error("allocator state corrupted: {0}")]
    Corruption(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl AllocError {
    /// Whether the owning supervisor must stop serving the affected
    /// network instance rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AllocError::Corruption(_) | AllocError::MissingDhcpStart(_)
        )
    }
}
